//! Error types for `winspect_core`.
//!
//! All failures are funnelled through [`WinspectError`], which uses
//! `thiserror` for `Display` and `Error` derives.
//!
//! Match *failures* (a template below threshold, too few keypoint pairs, a
//! homography without a consensus mask, a rectangle that fails the sanity
//! check) are not errors -- matchers return `Ok(None)` for those.  Only
//! invalid input and environment/backend problems surface here.

use thiserror::Error;

/// Top-level error type for the `winspect_core` library.
#[derive(Debug, Error)]
pub enum WinspectError {
    /// A find/wait loop exhausted its timeout without a hit.
    #[error("TargetNotFound: {0}")]
    TargetNotFound(String),

    /// A matcher name in the configured strategy list is unknown.
    #[error("InvalidMatchingMethod: {0}")]
    InvalidMatchingMethod(String),

    /// A reference image path does not exist.
    #[error("FileNotExist: {0}")]
    FileNotExist(String),

    /// Candidate smaller than the query, or a recorded resolution smaller
    /// than the reference image.
    #[error("TemplateInput: {0}")]
    TemplateInput(String),

    /// A keypoint backend is not provided by this build.  The match
    /// orchestrator skips such matchers silently.
    #[error("BackendMissing: {0}")]
    BackendMissing(String),

    /// A native call (UIA / JAB / Win32) returned a failure code.
    /// Distinct from "no match".
    #[error("BackendCall: {0}")]
    BackendCall(String),

    /// Unrecognised criteria key, criteria shape mismatch, illegal
    /// operator/property pairing, out-of-range quality -- programmer errors.
    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    /// Image decode/encode failure.
    #[error("Image: {0}")]
    Image(#[from] image::ImageError),

    /// Filesystem failure (screen logging, support-file install).
    #[error("Io: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(windows)]
impl From<windows::core::Error> for WinspectError {
    fn from(err: windows::core::Error) -> Self {
        WinspectError::BackendCall(format!("windows error: {err}"))
    }
}

/// Library-wide result alias.
pub type Result<T> = std::result::Result<T, WinspectError>;

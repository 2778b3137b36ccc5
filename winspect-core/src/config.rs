//! Process-wide settings.
//!
//! One mutable [`Settings`] value lives behind a `parking_lot::RwLock`;
//! read it with [`Settings::snapshot`] and change it with
//! [`Settings::update`].  Everything here has a sensible default -- no
//! configuration file is required.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::RwLock;

use crate::errors::{Result, WinspectError};

/// Image-resize strategy applied to reference images whose recorded capture
/// resolution differs from the current source resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMethod {
    /// COCOS "min" policy against a design resolution (default (960, 640)).
    CocosMin,
    /// Use the reference image as-is.
    None,
}

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Ordered matcher names tried by the match orchestrator.
    pub cv_strategy: Vec<String>,
    /// Default match threshold, in `(0, 1]`.
    pub threshold: f32,
    /// Delay after each UI operation.
    pub op_delay: Duration,
    /// Total timeout for `loop_find`.
    pub find_timeout: Duration,
    /// JPEG quality for logged screenshots, in `[1, 99]`.
    pub snapshot_quality: u8,
    /// Bounding square for logged screenshots; `None` keeps full size.
    pub image_max_size: Option<u32>,
    /// Whether `loop_find` writes screenshots at all.
    pub save_image: bool,
    /// Directory for logged screenshots; `None` disables logging.
    pub log_dir: Option<PathBuf>,
    /// Reference-image resize policy.
    pub resize_method: ResizeMethod,
    /// Root used to resolve relative reference-image paths.
    pub project_root: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cv_strategy: vec!["mstpl".into(), "tpl".into(), "sift".into(), "brisk".into()],
            threshold: 0.7,
            op_delay: Duration::from_millis(100),
            find_timeout: Duration::from_secs(20),
            snapshot_quality: 10,
            image_max_size: None,
            save_image: true,
            log_dir: None,
            resize_method: ResizeMethod::CocosMin,
            project_root: std::env::var_os("PROJECT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_default(),
        }
    }
}

fn global() -> &'static RwLock<Settings> {
    static SETTINGS: OnceLock<RwLock<Settings>> = OnceLock::new();
    SETTINGS.get_or_init(|| RwLock::new(Settings::default()))
}

impl Settings {
    /// An owned copy of the current settings.
    pub fn snapshot() -> Settings {
        global().read().clone()
    }

    /// Mutate the process-wide settings under the write lock.
    ///
    /// Returns `InvalidArgument` when the mutation leaves `threshold`
    /// outside `(0, 1]` or `snapshot_quality` outside `[1, 99]`.
    pub fn update(f: impl FnOnce(&mut Settings)) -> Result<()> {
        let mut guard = global().write();
        let mut next = guard.clone();
        f(&mut next);
        if !(next.threshold > 0.0 && next.threshold <= 1.0) {
            return Err(WinspectError::InvalidArgument(format!(
                "threshold {} not in (0, 1]",
                next.threshold
            )));
        }
        if !(1..=99).contains(&next.snapshot_quality) {
            return Err(WinspectError::InvalidArgument(format!(
                "snapshot_quality {} not in [1, 99]",
                next.snapshot_quality
            )));
        }
        *guard = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.cv_strategy, ["mstpl", "tpl", "sift", "brisk"]);
        assert!((s.threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(s.find_timeout, Duration::from_secs(20));
        assert_eq!(s.snapshot_quality, 10);
        assert!(s.save_image);
        assert!(s.log_dir.is_none());
        assert_eq!(s.resize_method, ResizeMethod::CocosMin);
    }

    #[test]
    fn test_update_rejects_bad_threshold() {
        assert!(Settings::update(|s| s.threshold = 0.0).is_err());
        assert!(Settings::update(|s| s.threshold = 1.5).is_err());
        // a failed update must not poison the stored value
        assert!(Settings::snapshot().threshold > 0.0);
    }

    #[test]
    fn test_update_rejects_bad_quality() {
        assert!(Settings::update(|s| s.snapshot_quality = 0).is_err());
        assert!(Settings::update(|s| s.snapshot_quality = 100).is_err());
    }
}

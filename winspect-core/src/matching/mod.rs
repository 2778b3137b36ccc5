//! The image-matching engine.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`ncc`] | `TM_CCOEFF_NORMED` map kernel |
//! | [`template`] | single- and multi-scale sliding-window template search |
//! | [`features`] | native keypoint detectors and descriptors |
//! | [`homography`] | RANSAC planar homography estimation |
//! | [`keypoint`] | the shared detector/descriptor/matcher pipeline |
//!
//! Matchers return `Ok(None)` when the source simply does not contain the
//! query; `Err` is reserved for invalid inputs and unavailable backends.

pub mod features;
pub mod homography;
pub mod keypoint;
pub mod ncc;
pub mod template;

use std::time::Duration;

use serde::Serialize;

use crate::errors::{Result, WinspectError};
use crate::geometry::Rect;
use crate::imaging::Raster;

/// A successful match: where, how confident, and how long it took.
#[derive(Debug, Clone, Serialize)]
pub struct Matched {
    /// Bounding rectangle of the hit inside the source image.
    pub rectangle: Rect,
    /// Confidence in `[0, 1]`; at least the matcher's threshold.
    pub confidence: f32,
    /// Wall-clock cost of the search.
    pub cost: Duration,
}

/// Matcher names accepted in the configured strategy list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMethod {
    Template,
    MultiScaleTemplate,
    Kaze,
    Akaze,
    Brisk,
    Orb,
    Sift,
    Surf,
    Brief,
}

impl MatchMethod {
    /// Parse a strategy-list entry.  Unknown names are a configuration
    /// error, not a match failure.
    pub fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "tpl" => Self::Template,
            "mstpl" => Self::MultiScaleTemplate,
            "kaze" => Self::Kaze,
            "akaze" => Self::Akaze,
            "brisk" => Self::Brisk,
            "orb" => Self::Orb,
            "sift" => Self::Sift,
            "surf" => Self::Surf,
            "brief" => Self::Brief,
            other => {
                return Err(WinspectError::InvalidMatchingMethod(format!(
                    "undefined method '{other}', try \
                     'tpl'/'mstpl'/'kaze'/'brisk'/'akaze'/'orb'/'surf'/'sift'/'brief'"
                )))
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Template => "tpl",
            Self::MultiScaleTemplate => "mstpl",
            Self::Kaze => "kaze",
            Self::Akaze => "akaze",
            Self::Brisk => "brisk",
            Self::Orb => "orb",
            Self::Sift => "sift",
            Self::Surf => "surf",
            Self::Brief => "brief",
        }
    }
}

// ---------------------------------------------------------------------------
// Confidence functions
// ---------------------------------------------------------------------------

/// Seed the anti-saturation pixels: the padded candidate gets one black and
/// one white pixel in its top-left corner so a near-constant region cannot
/// reach a spurious 1.0 correlation.
fn seed_extremes(img: &mut Raster) {
    if img.width() >= 2 && img.height() >= 1 {
        img.put_pixel(0, 0, [0, 0, 0]);
        img.put_pixel(1, 0, [255, 255, 255]);
    }
}

/// Grayscale confidence between two equally-sized BGR images.
///
/// The candidate is padded by 10 replicated pixels and seeded with the 0/255
/// extremes, both are converted to grayscale, and the maximum of the NCC map
/// is returned.  Range `[-1, 1]`.
pub fn ncc_gray(query: &Raster, candidate: &Raster) -> f32 {
    let mut padded = candidate.pad_replicate(10);
    seed_extremes(&mut padded);
    match ncc::match_template(&padded.to_gray(), &query.to_gray()) {
        Some(map) => ncc::min_max_loc(&map).1,
        None => 0.0,
    }
}

/// HSV per-channel confidence between two equally-sized BGR images.
///
/// Both sides are clamped to `[10, 245]` (dampening hue wrap-around at the
/// extremes) and converted to HSV; the candidate is padded and seeded as in
/// [`ncc_gray`]; the minimum of the three per-channel NCC maxima is
/// returned.  Range `[-1, 1]`.
pub fn ncc_color(query: &Raster, candidate: &Raster) -> f32 {
    let query_hsv = query.clamp_channels(10, 245).to_hsv();
    let mut cand_hsv = candidate.clamp_channels(10, 245).to_hsv().pad_replicate(10);
    seed_extremes(&mut cand_hsv);

    let q_channels = query_hsv.split_channels();
    let c_channels = cand_hsv.split_channels();
    let mut worst = f32::INFINITY;
    for (q, c) in q_channels.iter().zip(c_channels.iter()) {
        let score = match ncc::match_template(c, q) {
            Some(map) => ncc::min_max_loc(&map).1,
            None => 0.0,
        };
        worst = worst.min(score);
    }
    if worst.is_finite() {
        worst
    } else {
        0.0
    }
}

/// Pick the configured confidence function.
pub(crate) fn confidence_of(query: &Raster, candidate: &Raster, use_color: bool) -> f32 {
    if use_color {
        ncc_color(query, candidate)
    } else {
        ncc_gray(query, candidate)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn textured(w: u32, h: u32) -> Raster {
        let mut r = Raster::filled(w, h, [0, 0, 0]);
        for y in 0..h {
            for x in 0..w {
                let v = ((x * 11 + y * 29) % 220) as u8;
                r.put_pixel(x, y, [v, 255 - v, (v / 2) + 40]);
            }
        }
        r
    }

    #[test]
    fn test_method_parse() {
        assert_eq!(MatchMethod::parse("mstpl").unwrap(), MatchMethod::MultiScaleTemplate);
        assert_eq!(MatchMethod::parse("sift").unwrap(), MatchMethod::Sift);
        assert!(matches!(
            MatchMethod::parse("nope"),
            Err(WinspectError::InvalidMatchingMethod(_))
        ));
        for name in ["tpl", "mstpl", "kaze", "brisk", "akaze", "orb", "sift", "surf", "brief"] {
            assert_eq!(MatchMethod::parse(name).unwrap().name(), name);
        }
    }

    #[test]
    fn test_self_similarity_is_high() {
        let img = textured(24, 18);
        assert!(ncc_gray(&img, &img) >= 0.99);
        assert!(ncc_color(&img, &img) >= 0.99);
    }

    #[test]
    fn test_bounds() {
        let a = textured(16, 16);
        let mut b = textured(16, 16);
        for y in 0..16 {
            for x in 0..16 {
                let p = b.pixel(x, y);
                b.put_pixel(x, y, [p[2], p[0], p[1]]);
            }
        }
        for score in [ncc_gray(&a, &b), ncc_color(&a, &b)] {
            assert!((-1.0001..=1.0001).contains(&score), "score {score}");
        }
    }

    #[test]
    fn test_identical_flat_images_score_one() {
        let flat = Raster::filled(12, 12, [200, 200, 200]);
        assert!(ncc_gray(&flat, &flat) > 0.99);
        assert!(ncc_color(&flat, &flat) > 0.99);
    }

    #[test]
    fn test_different_flat_images_score_low() {
        let bright = Raster::filled(12, 12, [220, 220, 220]);
        let dark = Raster::filled(12, 12, [40, 40, 40]);
        let score = ncc_gray(&bright, &dark);
        assert!(score < 0.5, "distinct flats must not score high, got {score}");
    }
}

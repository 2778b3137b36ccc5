//! The shared keypoint-matching pipeline.
//!
//! detect -> knn(k=2) -> ratio test -> source-coordinate dedup -> region
//! recovery (two/three-point fallback or RANSAC homography) -> sanity
//! check -> rescaled confidence.
//!
//! Backends differ only in the detector/descriptor pair and the matching
//! norm; everything downstream is common.  Backends this build does not
//! provide fail construction with `BackendMissing`, which the orchestrator
//! skips silently.

use std::time::Instant;

use crate::errors::{Result, WinspectError};
use crate::geometry::Rect;
use crate::imaging::Raster;
use crate::matching::features::{self, Descriptors, KeyPoint};
use crate::matching::homography::{find_homography_ransac, fit_homography};
use crate::matching::{confidence_of, Matched};

/// Ratio-test filter: keep a pair only when the best distance is below
/// `RATIO` times the second best.
const RATIO: f32 = 0.59;
/// RANSAC reprojection threshold, pixels.
const RANSAC_THRESHOLD: f64 = 5.0;
/// Cap on detected features per image.
const MAX_FEATURES: usize = 500;

/// Detector/descriptor selection for [`KeypointMatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypointBackend {
    Kaze,
    Akaze,
    Brisk,
    Orb,
    Sift,
    Surf,
    Brief,
}

impl KeypointBackend {
    fn provided(&self) -> bool {
        matches!(self, Self::Brisk | Self::Orb | Self::Sift | Self::Brief)
    }

    fn name(&self) -> &'static str {
        match self {
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

/// A keypoint matcher bound to one backend.
pub struct KeypointMatcher {
    backend: KeypointBackend,
    query: Raster,
    source: Raster,
    threshold: f32,
    use_color: bool,
}

/// Recovered target region: `[x_min, x_max, y_min, y_max]` in source space.
type Region = [i32; 4];

impl KeypointMatcher {
    /// Construct, failing with `BackendMissing` for backends this build
    /// does not provide (KAZE, AKAZE, SURF).
    pub fn new(
        backend: KeypointBackend,
        query: Raster,
        source: Raster,
        threshold: f32,
        use_color: bool,
    ) -> Result<Self> {
        if !backend.provided() {
            return Err(WinspectError::BackendMissing(format!(
                "keypoint backend '{}' is not provided by this build",
                backend.name()
            )));
        }
        Ok(Self { backend, query, source, threshold, use_color })
    }

    fn detect(&self, img: &Raster) -> (Vec<KeyPoint>, Descriptors) {
        let gray = img.to_gray();
        match self.backend {
            KeypointBackend::Orb => features::orb(&gray, MAX_FEATURES),
            KeypointBackend::Brisk => features::brisk(&gray, MAX_FEATURES),
            KeypointBackend::Brief => features::brief(&gray, MAX_FEATURES),
            KeypointBackend::Sift => features::sift(&gray, MAX_FEATURES),
            // rejected in new()
            _ => unreachable!("unprovided backend"),
        }
    }

    /// Best hit above the threshold, or `None`.
    pub fn find_best(&self) -> Result<Option<Matched>> {
        let started = Instant::now();
        let (kp_query, desc_query) = self.detect(&self.query);
        let (kp_source, desc_source) = self.detect(&self.source);

        let good = good_pairs(&desc_query, &desc_source, &kp_source);
        let region = match good.len() {
            0 | 1 => return Ok(None),
            2 => {
                let q1 = int_point(&kp_query[good[0].0]);
                let q2 = int_point(&kp_query[good[1].0]);
                let s1 = int_point(&kp_source[good[0].1]);
                let s2 = int_point(&kp_source[good[1].1]);
                self.two_point_region(q1, q2, s1, s2)
            }
            3 => {
                // the midpoints of the last two pairs act as one effective pair
                let q1 = int_point(&kp_query[good[0].0]);
                let q2 = midpoint(
                    int_point(&kp_query[good[1].0]),
                    int_point(&kp_query[good[2].0]),
                );
                let s1 = int_point(&kp_source[good[0].1]);
                let s2 = midpoint(
                    int_point(&kp_source[good[1].1]),
                    int_point(&kp_source[good[2].1]),
                );
                self.two_point_region(q1, q2, s1, s2)
            }
            _ => self.homography_region(&kp_query, &kp_source, &good),
        };
        let Some(region) = region else {
            return Ok(None);
        };

        if !self.region_is_sane(&region) {
            return Ok(None);
        }

        let [x_min, x_max, y_min, y_max] = region;
        let crop = self.source.crop(Rect::new(x_min, y_min, x_max, y_max));
        if crop.width() == 0 || crop.height() == 0 {
            return Ok(None);
        }
        let resized = crop.resize(self.query.width(), self.query.height());
        let raw = confidence_of(&self.query, &resized, self.use_color);
        let confidence = (1.0 + raw) / 2.0;
        if confidence < self.threshold {
            return Ok(None);
        }
        Ok(Some(Matched {
            rectangle: Rect::new(x_min, y_min, x_max, y_max),
            confidence,
            cost: started.elapsed(),
        }))
    }

    /// Two matched pairs: derive per-axis scale and expand from the mapped
    /// query centre.  Degenerate geometry (shared x or y on either side)
    /// yields no region.
    fn two_point_region(
        &self,
        q1: (i32, i32),
        q2: (i32, i32),
        s1: (i32, i32),
        s2: (i32, i32),
    ) -> Option<Region> {
        if q1.0 == q2.0 || q1.1 == q2.1 || s1.0 == s2.0 || s1.1 == s2.1 {
            return None;
        }
        let (qw, qh) = (self.query.width() as i32, self.query.height() as i32);
        let (sw, sh) = (self.source.width() as i32, self.source.height() as i32);
        let x_scale = ((s2.0 - s1.0) as f64 / (q2.0 - q1.0) as f64).abs();
        let y_scale = ((s2.1 - s1.1) as f64 / (q2.1 - q1.1) as f64).abs();

        // correct the source midpoint so it becomes the mapped query centre
        let q_mid = ((q1.0 + q2.0) / 2, (q1.1 + q2.1) / 2);
        let mut cx = (s1.0 + s2.0) / 2 - ((q_mid.0 - qw / 2) as f64 * x_scale) as i32;
        let mut cy = (s1.1 + s2.1) / 2 - ((q_mid.1 - qh / 2) as f64 * y_scale) as i32;
        cx = cx.clamp(0, sw - 1);
        cy = cy.clamp(0, sh - 1);

        let half_w = qw as f64 * x_scale / 2.0;
        let half_h = qh as f64 * y_scale / 2.0;
        Some([
            (cx as f64 - half_w).max(0.0) as i32,
            (cx as f64 + half_w).min((sw - 1) as f64) as i32,
            (cy as f64 - half_h).max(0.0) as i32,
            (cy as f64 + half_h).min((sh - 1) as f64) as i32,
        ])
    }

    /// Four or more pairs: RANSAC homography, refit on the inliers, map the
    /// query corners and take the clipped bounding box of the quad.
    fn homography_region(
        &self,
        kp_query: &[KeyPoint],
        kp_source: &[KeyPoint],
        good: &[(usize, usize)],
    ) -> Option<Region> {
        let src_pts: Vec<(f64, f64)> = good
            .iter()
            .map(|&(qi, _)| (kp_query[qi].x as f64, kp_query[qi].y as f64))
            .collect();
        let dst_pts: Vec<(f64, f64)> = good
            .iter()
            .map(|&(_, si)| (kp_source[si].x as f64, kp_source[si].y as f64))
            .collect();

        let (coarse, mask) = find_homography_ransac(&src_pts, &dst_pts, RANSAC_THRESHOLD)?;
        let inl_src: Vec<_> = src_pts
            .iter()
            .zip(&mask)
            .filter_map(|(&p, &keep)| keep.then_some(p))
            .collect();
        let inl_dst: Vec<_> = dst_pts
            .iter()
            .zip(&mask)
            .filter_map(|(&p, &keep)| keep.then_some(p))
            .collect();
        let h = fit_homography(&inl_src, &inl_dst).unwrap_or(coarse);

        let (qw, qh) = (self.query.width() as f64, self.query.height() as f64);
        let (sw, sh) = (self.source.width() as i32, self.source.height() as i32);
        let lt = h.apply(0.0, 0.0);
        let br = h.apply(qw - 1.0, qh - 1.0);
        // corners may leave the source; the mapped diagonal's midpoint
        // stays representative, and the box is clipped to the bounds
        let x_min = (lt.0.min(br.0) as i32).clamp(0, sw - 1);
        let x_max = (lt.0.max(br.0) as i32).clamp(0, sw - 1);
        let y_min = (lt.1.min(br.1) as i32).clamp(0, sh - 1);
        let y_max = (lt.1.max(br.1) as i32).clamp(0, sh - 1);
        Some([x_min, x_max, y_min, y_max])
    }

    /// Reject regions smaller than 5 px on a side or scaled outside
    /// 0.2x..5x of the query on either dimension.
    fn region_is_sane(&self, region: &Region) -> bool {
        let [x_min, x_max, y_min, y_max] = *region;
        let (tw, th) = (x_max - x_min, y_max - y_min);
        if tw < 5 || th < 5 {
            return false;
        }
        let (qw, qh) = (self.query.width() as i32, self.query.height() as i32);
        let w_ok = tw >= qw / 5 && tw <= qw * 5;
        let h_ok = th >= qh / 5 && th <= qh * 5;
        w_ok && h_ok
    }
}

fn int_point(kp: &KeyPoint) -> (i32, i32) {
    (kp.x as i32, kp.y as i32)
}

fn midpoint(a: (i32, i32), b: (i32, i32)) -> (i32, i32) {
    ((a.0 + b.0) / 2, (a.1 + b.1) / 2)
}

// ---------------------------------------------------------------------------
// knn matching
// ---------------------------------------------------------------------------

fn distance(a: &Descriptors, i: usize, b: &Descriptors, j: usize) -> Option<f32> {
    match (a, b) {
        (
            Descriptors::Binary { bytes, data: da },
            Descriptors::Binary { data: db, .. },
        ) => {
            let ra = &da[i * bytes..(i + 1) * bytes];
            let rb = &db[j * bytes..(j + 1) * bytes];
            Some(
                ra.iter()
                    .zip(rb)
                    .map(|(x, y)| (x ^ y).count_ones())
                    .sum::<u32>() as f32,
            )
        }
        (Descriptors::Float { dim, data: da }, Descriptors::Float { data: db, .. }) => {
            let ra = &da[i * dim..(i + 1) * dim];
            let rb = &db[j * dim..(j + 1) * dim];
            Some(
                ra.iter()
                    .zip(rb)
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt(),
            )
        }
        _ => None,
    }
}

/// Brute-force knn(k=2) + ratio test + source-coordinate dedup.
///
/// Query->source may be many-to-one, but each integer source coordinate is
/// kept at most once.  Returns `(query_idx, source_idx)` pairs in query
/// order.
fn good_pairs(
    desc_query: &Descriptors,
    desc_source: &Descriptors,
    kp_source: &[KeyPoint],
) -> Vec<(usize, usize)> {
    let nq = desc_query.len();
    let ns = desc_source.len();
    if nq == 0 || ns < 2 {
        return Vec::new();
    }

    let mut good = Vec::new();
    let mut seen: Vec<(i32, i32)> = Vec::new();
    for qi in 0..nq {
        let mut best = (usize::MAX, f32::INFINITY);
        let mut second = f32::INFINITY;
        for si in 0..ns {
            let Some(d) = distance(desc_query, qi, desc_source, si) else {
                return Vec::new();
            };
            if d < best.1 {
                second = best.1;
                best = (si, d);
            } else if d < second {
                second = d;
            }
        }
        if best.0 == usize::MAX || best.1 >= RATIO * second {
            continue;
        }
        let coord = int_point(&kp_source[best.0]);
        if seen.contains(&coord) {
            continue;
        }
        seen.push(coord);
        good.push((qi, best.0));
    }
    good
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs_raster(w: u32, h: u32, seed: u64) -> Raster {
        let mut img = Raster::filled(w, h, [18, 18, 18]);
        let mut state = seed;
        for _ in 0..((w * h) / 180).max(10) {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let cx = (state % w as u64) as i32;
            let cy = ((state >> 20) % h as u64) as i32;
            let side = 3 + ((state >> 44) % 6) as i32;
            let shade = 120 + ((state >> 52) % 120) as u8;
            img.fill_rect(
                Rect::from_origin_size(cx, cy, side, side),
                [shade, 255 - shade, shade / 2 + 60],
            );
        }
        img
    }

    #[test]
    fn test_unprovided_backends_are_missing() {
        let img = Raster::filled(10, 10, [0, 0, 0]);
        for backend in [KeypointBackend::Kaze, KeypointBackend::Akaze, KeypointBackend::Surf] {
            let res = KeypointMatcher::new(backend, img.clone(), img.clone(), 0.7, false);
            assert!(matches!(res, Err(WinspectError::BackendMissing(_))));
        }
    }

    #[test]
    fn test_blank_images_yield_no_match() {
        let img = Raster::filled(64, 64, [128, 128, 128]);
        let m = KeypointMatcher::new(KeypointBackend::Orb, img.clone(), img, 0.7, false).unwrap();
        assert!(m.find_best().unwrap().is_none());
    }

    #[test]
    fn test_orb_locates_embedded_crop() {
        let source = blobs_raster(220, 170, 0xA5A5_1234);
        let query = source.crop(Rect::new(60, 40, 150, 120));
        let m = KeypointMatcher::new(KeypointBackend::Orb, query, source, 0.6, false).unwrap();
        let hit = m.find_best().unwrap().expect("embedded crop must be found");
        let c = hit.rectangle.center();
        assert!((c.x - 105).abs() <= 8, "centre x {}", c.x);
        assert!((c.y - 80).abs() <= 8, "centre y {}", c.y);
        assert!(hit.confidence >= 0.6);
    }

    #[test]
    fn test_sift_locates_embedded_crop() {
        let source = blobs_raster(200, 150, 0x0BAD_CAFE);
        let query = source.crop(Rect::new(40, 30, 140, 110));
        let m = KeypointMatcher::new(KeypointBackend::Sift, query, source, 0.6, false).unwrap();
        let hit = m.find_best().unwrap().expect("embedded crop must be found");
        let c = hit.rectangle.center();
        assert!((c.x - 90).abs() <= 10, "centre x {}", c.x);
        assert!((c.y - 70).abs() <= 10, "centre y {}", c.y);
    }

    #[test]
    fn test_two_point_region_geometry() {
        let query = Raster::filled(40, 20, [0, 0, 0]);
        let source = Raster::filled(400, 300, [0, 0, 0]);
        let m = KeypointMatcher::new(KeypointBackend::Orb, query, source, 0.7, false).unwrap();
        // a pure translation by (100, 50): scale 1 on both axes
        let region = m
            .two_point_region((10, 5), (30, 15), (110, 55), (130, 65))
            .expect("non-degenerate pairs");
        let [x_min, x_max, y_min, y_max] = region;
        // mapped centre = (120, 60), half extents (20, 10)
        assert_eq!([x_min, x_max, y_min, y_max], [100, 140, 50, 70]);
    }

    #[test]
    fn test_two_point_degenerate_axes() {
        let query = Raster::filled(40, 20, [0, 0, 0]);
        let source = Raster::filled(400, 300, [0, 0, 0]);
        let m = KeypointMatcher::new(KeypointBackend::Orb, query, source, 0.7, false).unwrap();
        assert!(m.two_point_region((10, 5), (10, 15), (0, 0), (10, 10)).is_none());
        assert!(m.two_point_region((10, 5), (30, 5), (0, 0), (10, 10)).is_none());
        assert!(m.two_point_region((10, 5), (30, 15), (7, 0), (7, 10)).is_none());
    }

    #[test]
    fn test_sanity_check_rejects_tiny_and_rescaled() {
        let query = Raster::filled(40, 40, [0, 0, 0]);
        let source = Raster::filled(400, 300, [0, 0, 0]);
        let m = KeypointMatcher::new(KeypointBackend::Orb, query, source, 0.7, false).unwrap();
        assert!(!m.region_is_sane(&[0, 4, 0, 40]));
        assert!(!m.region_is_sane(&[0, 40, 0, 4]));
        assert!(!m.region_is_sane(&[0, 7, 0, 7])); // below 0.2x
        assert!(!m.region_is_sane(&[0, 250, 0, 40])); // above 5x
        assert!(m.region_is_sane(&[0, 40, 0, 40]));
        assert!(m.region_is_sane(&[10, 30, 10, 30])); // 0.5x is fine
    }

    #[test]
    fn test_ratio_test_discards_ambiguous_pairs() {
        // two identical source descriptors: best ~= second best, ratio fails
        let q = Descriptors::Binary { bytes: 2, data: vec![0b1111_0000, 0b0000_1111] };
        let s = Descriptors::Binary {
            bytes: 2,
            data: vec![0b1111_0000, 0b0000_1111, 0b1111_0000, 0b0000_1111],
        };
        let kps = vec![
            KeyPoint { x: 1.0, y: 1.0, scale: 1.0, angle: 0.0, response: 1.0 },
            KeyPoint { x: 9.0, y: 9.0, scale: 1.0, angle: 0.0, response: 1.0 },
        ];
        assert!(good_pairs(&q, &s, &kps).is_empty());
    }

    #[test]
    fn test_dedup_is_one_to_one_on_source() {
        // two query descriptors both match source descriptor 0 cleanly
        let q = Descriptors::Binary { bytes: 1, data: vec![0b0000_0001, 0b0000_0001] };
        let s = Descriptors::Binary { bytes: 1, data: vec![0b0000_0001, 0b1111_1110] };
        let kps = vec![
            KeyPoint { x: 3.0, y: 4.0, scale: 1.0, angle: 0.0, response: 1.0 },
            KeyPoint { x: 30.0, y: 40.0, scale: 1.0, angle: 0.0, response: 1.0 },
        ];
        let good = good_pairs(&q, &s, &kps);
        assert_eq!(good, vec![(0, 0)]);
    }
}

//! Sliding-window template search, single- and multi-scale.
//!
//! The multi-scale variant sweeps the relative longer-side ratio between
//! template and source instead of trusting a recorded resolution ratio, and
//! can constrain the sweep to a predicted area when record-time metadata is
//! available.

use std::time::{Duration, Instant};

use crate::errors::{Result, WinspectError};
use crate::geometry::Rect;
use crate::imaging::{GrayBuf, Raster};
use crate::matching::{confidence_of, ncc, Matched};

/// Sweep floor: template sides at or below this are skipped.
const TEMPL_MIN: u32 = 10;
/// Default predicted-area radius floor, pixels.
const DEVIATION: i32 = 150;

fn seed_extremes_gray(img: &mut GrayBuf) {
    if img.width() >= 2 && img.height() >= 1 {
        img.set(0, 0, 0.0);
        img.set(1, 0, 255.0);
    }
}

// ---------------------------------------------------------------------------
// Single-scale template matcher
// ---------------------------------------------------------------------------

/// Plain sliding-window template search.
pub struct TemplateMatcher {
    query: Raster,
    source: Raster,
    threshold: f32,
    use_color: bool,
}

impl TemplateMatcher {
    pub fn new(query: Raster, source: Raster, threshold: f32, use_color: bool) -> Self {
        Self { query, source, threshold, use_color }
    }

    fn fits(&self) -> bool {
        self.query.width() <= self.source.width() && self.query.height() <= self.source.height()
    }

    fn confidence_at(&self, loc: (u32, u32), max_val: f32) -> f32 {
        if self.use_color {
            let (w, h) = (self.query.width() as i32, self.query.height() as i32);
            let crop = self
                .source
                .crop(Rect::from_origin_size(loc.0 as i32, loc.1 as i32, w, h));
            crate::matching::ncc_color(&self.query, &crop)
        } else {
            max_val
        }
    }

    /// Best hit above the threshold, or `None`.
    ///
    /// A query larger than the source yields `None` without error.
    pub fn find_best(&self) -> Result<Option<Matched>> {
        if !self.fits() {
            return Ok(None);
        }
        let started = Instant::now();
        let map = match ncc::match_template(&self.source.to_gray(), &self.query.to_gray()) {
            Some(map) => map,
            None => return Ok(None),
        };
        let (_, max_val, _, max_loc) = ncc::min_max_loc(&map);
        let confidence = self.confidence_at(max_loc, max_val);
        if confidence < self.threshold {
            return Ok(None);
        }
        let (w, h) = (self.query.width() as i32, self.query.height() as i32);
        Ok(Some(Matched {
            rectangle: Rect::from_origin_size(max_loc.0 as i32, max_loc.1 as i32, w, h),
            confidence,
            cost: started.elapsed(),
        }))
    }

    /// Every hit above the threshold, best first, at most `max_results`.
    ///
    /// After each acceptance a query-sized square centred on the reported
    /// location is zeroed in the score map so it cannot win again.
    pub fn find_all(&self, max_results: usize) -> Result<Vec<Matched>> {
        if !self.fits() || max_results == 0 {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let mut map = match ncc::match_template(&self.source.to_gray(), &self.query.to_gray()) {
            Some(map) => map,
            None => return Ok(Vec::new()),
        };
        let (qw, qh) = (self.query.width(), self.query.height());
        let mut hits = Vec::new();
        loop {
            let (_, max_val, _, max_loc) = ncc::min_max_loc(&map);
            let confidence = self.confidence_at(max_loc, max_val);
            if confidence < self.threshold || hits.len() >= max_results {
                break;
            }
            hits.push(Matched {
                rectangle: Rect::from_origin_size(
                    max_loc.0 as i32,
                    max_loc.1 as i32,
                    qw as i32,
                    qh as i32,
                ),
                confidence,
                cost: started.elapsed(),
            });
            ncc::suppress_centered(&mut map, max_loc, qw, qh);
        }
        Ok(hits)
    }
}

// ---------------------------------------------------------------------------
// Multi-scale template matcher
// ---------------------------------------------------------------------------

/// Multi-scale sliding-window search.
///
/// `record_pos` is the normalised click-target offset at record time (both
/// components divided by the recorded source *width*) and `resolution` the
/// recorded capture resolution; together they enable the predicted-area
/// search path.
pub struct MultiScaleTemplateMatcher {
    query: Raster,
    source: Raster,
    threshold: f32,
    use_color: bool,
    record_pos: Option<(f32, f32)>,
    resolution: Option<(u32, u32)>,
    scale_max: u32,
    scale_step: f32,
}

struct SweepBest {
    score: f32,
    loc: (u32, u32),
    width: u32,
    height: u32,
    source_ratio: f32,
}

impl MultiScaleTemplateMatcher {
    pub fn new(query: Raster, source: Raster, threshold: f32, use_color: bool) -> Self {
        Self {
            query,
            source,
            threshold,
            use_color,
            record_pos: None,
            resolution: None,
            scale_max: 800,
            scale_step: 0.005,
        }
    }

    pub fn with_record(mut self, record_pos: Option<(f32, f32)>, resolution: Option<(u32, u32)>) -> Self {
        self.record_pos = record_pos;
        self.resolution = resolution;
        self
    }

    pub fn with_scale(mut self, scale_max: u32, scale_step: f32) -> Self {
        self.scale_max = scale_max.max(1);
        self.scale_step = scale_step.max(1e-4);
        self
    }

    /// Best hit above the threshold, or `None`.
    pub fn find_best(&self) -> Result<Option<Matched>> {
        if self.query.width() > self.source.width() || self.query.height() > self.source.height() {
            return Ok(None);
        }
        let started = Instant::now();
        let found = match (self.record_pos, self.resolution) {
            (Some(pos), Some(resolution)) => self.search_predicted(pos, resolution)?,
            _ => self.search(&self.source, 0.01, 0.99, Duration::from_secs(3)),
        };
        Ok(found.map(|(rect, confidence)| Matched {
            rectangle: rect,
            confidence,
            cost: started.elapsed(),
        }))
    }

    /// Constrained search around the predicted record position.
    fn search_predicted(
        &self,
        record_pos: (f32, f32),
        resolution: (u32, u32),
    ) -> Result<Option<(Rect, f32)>> {
        let (qw, qh) = (self.query.width(), self.query.height());
        let (w0, h0) = resolution;
        if w0 < qw || h0 < qh {
            return Err(WinspectError::TemplateInput(format!(
                "recorded resolution {w0}x{h0} is smaller than the reference {qw}x{qh}"
            )));
        }
        let (sw, sh) = (self.source.width() as f32, self.source.height() as f32);
        // both offsets were normalised by the recorded source width
        let cx = record_pos.0 * sw + sw * 0.5;
        let cy = record_pos.1 * sw + sh * 0.5;
        let rx = ((qw as f32 * sw / (2.0 * w0 as f32)) as i32).max(DEVIATION);
        let ry = ((qh as f32 * sh / (2.0 * h0 as f32)) as i32).max(DEVIATION);
        let area = Rect::new(
            (cx as i32 - rx).clamp(0, self.source.width() as i32),
            (cy as i32 - ry).clamp(0, self.source.height() as i32),
            (cx as i32 + rx).clamp(0, self.source.width() as i32),
            (cy as i32 + ry).clamp(0, self.source.height() as i32),
        );
        let cropped = self.source.crop(area);
        if qw > cropped.width() || qh > cropped.height() {
            return Ok(None);
        }
        // tightened ratio range from the resolution quotients
        let (ch, cw) = (cropped.height() as f32, cropped.width() as f32);
        let r_lo = (ch / h0 as f32).min(cw / w0 as f32);
        let r_hi = (ch / h0 as f32).max(cw / w0 as f32);
        let side = (qh as f32 / ch).max(qw as f32 / cw);
        let ratio_min = (side * r_lo).max(self.scale_step);
        let ratio_max = (side * r_hi).min(0.99);
        let found = self.search(&cropped, ratio_min, ratio_max, Duration::from_secs(1));
        Ok(found.map(|(rect, confidence)| (rect.translate(area.left, area.top), confidence)))
    }

    /// The ratio sweep over a (possibly cropped) source.
    fn search(
        &self,
        source: &Raster,
        ratio_min: f32,
        ratio_max: f32,
        time_out: Duration,
    ) -> Option<(Rect, f32)> {
        let templ = self.query.to_gray();
        let (tw, th) = (templ.width() as f32, templ.height() as f32);

        // cap the working source at scale_max on its longer side
        let longest = source.width().max(source.height()) as f32;
        let sr = (self.scale_max as f32 / longest).min(1.0);
        let mut src = source
            .to_gray()
            .resize(
                (source.width() as f32 * sr) as u32,
                (source.height() as f32 * sr) as u32,
            );
        seed_extremes_gray(&mut src);
        let (sw, sh) = (src.width() as f32, src.height() as f32);

        let deadline = Instant::now() + time_out;
        let mut best: Option<SweepBest> = None;
        let mut r = ratio_min;
        while r <= ratio_max {
            // scale the template so its longer side becomes r x matching source side
            let tr = if th / sh >= tw / sw {
                sh * r / th
            } else {
                sw * r / tw
            };
            let scaled_w = ((tw * tr) as u32).max(1);
            let scaled_h = ((th * tr) as u32).max(1);
            if scaled_w.min(scaled_h) > TEMPL_MIN {
                let mut scaled = templ.resize(scaled_w, scaled_h);
                seed_extremes_gray(&mut scaled);
                if let Some(map) = ncc::match_template(&src, &scaled) {
                    let (_, max_val, _, max_loc) = ncc::min_max_loc(&map);
                    if best.as_ref().map_or(true, |b| max_val > b.score) {
                        best = Some(SweepBest {
                            score: max_val,
                            loc: max_loc,
                            width: scaled_w,
                            height: scaled_h,
                            source_ratio: sr,
                        });
                    }
                    // soft timeout: early-accept an over-threshold best
                    if Instant::now() > deadline && max_val >= self.threshold {
                        if let Some(hit) = self.recover(source, best.as_ref().unwrap()) {
                            return Some(hit);
                        }
                    }
                }
            }
            r += self.scale_step;
        }
        self.recover(source, &best?)
    }

    /// Map a sweep-space hit back to original coordinates and re-score it.
    fn recover(&self, source: &Raster, best: &SweepBest) -> Option<(Rect, f32)> {
        let sr = best.source_ratio;
        let x = (best.loc.0 as f32 / sr) as i32;
        let y = (best.loc.1 as f32 / sr) as i32;
        let w = (best.width as f32 / sr) as i32;
        let h = (best.height as f32 / sr) as i32;
        if w <= 0 || h <= 0 {
            return None;
        }
        let crop = source.crop(Rect::from_origin_size(x, y, w, h));
        if crop.width() == 0 || crop.height() == 0 {
            return None;
        }
        let resized = crop.resize(self.query.width(), self.query.height());
        let confidence = confidence_of(&self.query, &resized, self.use_color);
        if confidence < self.threshold {
            return None;
        }
        Some((Rect::from_origin_size(x, y, w, h), confidence))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// A noisy background with enough structure for NCC to discriminate.
    fn busy_background(w: u32, h: u32) -> Raster {
        let mut img = Raster::filled(w, h, [0, 0, 0]);
        for y in 0..h {
            for x in 0..w {
                let v = ((x.wrapping_mul(31) ^ y.wrapping_mul(17)) % 200) as u8;
                img.put_pixel(x, y, [v, v / 2 + 20, 255 - v]);
            }
        }
        img
    }

    /// A red square with a faint internal gradient, so the region carries
    /// enough variance for correlation at every scale.
    fn with_red_square(mut img: Raster, x: i32, y: i32, side: i32) -> Raster {
        for dy in 0..side {
            for dx in 0..side {
                let shade = 195 + ((dx * 60 / side.max(1)) as u8 % 60);
                img.put_pixel((x + dx) as u32, (y + dy) as u32, [
                    (dy * 40 / side.max(1)) as u8,
                    0,
                    shade,
                ]);
            }
        }
        img
    }

    #[test]
    fn test_pure_template_hit() {
        // spec scenario S1: 40x40 red square at (100, 80) in a 400x300 source
        let source = with_red_square(busy_background(400, 300), 100, 80, 40);
        let query = source.crop(Rect::new(100, 80, 140, 120));
        let hit = TemplateMatcher::new(query, source, 0.8, true)
            .find_best()
            .unwrap()
            .expect("square must be found");
        assert_eq!(hit.rectangle, Rect::new(100, 80, 140, 120));
        assert!(hit.confidence >= 0.95, "confidence {}", hit.confidence);
    }

    #[test]
    fn test_query_larger_than_source_is_no_match() {
        let source = busy_background(20, 20);
        let query = busy_background(30, 10);
        let res = TemplateMatcher::new(query, source, 0.5, false).find_best().unwrap();
        assert!(res.is_none());
    }

    #[test]
    fn test_below_threshold_is_no_match() {
        let source = busy_background(100, 100);
        // a pattern unrelated to the background
        let mut query = Raster::filled(20, 20, [255, 255, 255]);
        query.fill_rect(Rect::new(0, 0, 10, 20), [0, 0, 0]);
        let res = TemplateMatcher::new(query, source, 0.95, false).find_best().unwrap();
        assert!(res.is_none());
    }

    #[test]
    fn test_find_all_returns_each_copy_once() {
        let mut source = busy_background(300, 200);
        for &(x, y) in &[(30, 30), (150, 60), (220, 130)] {
            source.fill_rect(Rect::from_origin_size(x, y, 24, 24), [255, 255, 255]);
        }
        let query = source.crop(Rect::new(30, 30, 54, 54));
        let hits = TemplateMatcher::new(query, source, 0.8, false)
            .find_all(10)
            .unwrap();
        assert_eq!(hits.len(), 3, "expected 3 hits, got {:?}", hits.len());
        let mut corners: Vec<(i32, i32)> = hits
            .iter()
            .map(|m| (m.rectangle.left, m.rectangle.top))
            .collect();
        corners.sort_unstable();
        assert_eq!(corners, vec![(30, 30), (150, 60), (220, 130)]);
        // best-first ordering
        assert!(hits[0].confidence >= hits[1].confidence);
    }

    #[test]
    fn test_find_all_respects_max_results() {
        let mut source = busy_background(300, 100);
        for i in 0..4 {
            source.fill_rect(Rect::from_origin_size(20 + i * 70, 30, 24, 24), [255, 255, 255]);
        }
        let query = source.crop(Rect::new(20, 30, 44, 54));
        let hits = TemplateMatcher::new(query, source, 0.8, false)
            .find_all(2)
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_multiscale_recovers_resized_target() {
        // spec scenario S2: the source shrinks to half size, the query does not
        let source = with_red_square(busy_background(400, 300), 100, 80, 40);
        let query = source.crop(Rect::new(100, 80, 140, 120));
        let small = source.resize(200, 150);
        let hit = MultiScaleTemplateMatcher::new(query, small, 0.7, false)
            .find_best()
            .unwrap()
            .expect("resized square must be found");
        let r = hit.rectangle;
        assert!((r.left - 50).abs() <= 2, "left {}", r.left);
        assert!((r.top - 40).abs() <= 2, "top {}", r.top);
        assert!((r.right - 70).abs() <= 2, "right {}", r.right);
        assert!((r.bottom - 60).abs() <= 2, "bottom {}", r.bottom);
    }

    #[test]
    fn test_multiscale_recovers_enlarged_target() {
        // the source grows by 1.5x instead; the sweep caps the working
        // size at 240 so the search stays cheap
        let source = with_red_square(busy_background(400, 300), 100, 80, 40);
        let query = source.crop(Rect::new(100, 80, 140, 120));
        let big = source.resize(600, 450);
        let hit = MultiScaleTemplateMatcher::new(query, big, 0.7, false)
            .with_scale(240, 0.005)
            .find_best()
            .unwrap()
            .expect("enlarged square must be found");
        let r = hit.rectangle;
        assert!((r.left - 150).abs() <= 3, "left {}", r.left);
        assert!((r.top - 120).abs() <= 3, "top {}", r.top);
        assert!((r.right - 210).abs() <= 3, "right {}", r.right);
        assert!((r.bottom - 180).abs() <= 3, "bottom {}", r.bottom);
    }

    #[test]
    fn test_multiscale_rejects_small_recorded_resolution() {
        let source = busy_background(100, 100);
        let query = busy_background(50, 50);
        let res = MultiScaleTemplateMatcher::new(query, source, 0.7, false)
            .with_record(Some((0.0, 0.0)), Some((40, 40)))
            .find_best();
        assert!(matches!(res, Err(WinspectError::TemplateInput(_))));
    }

    #[test]
    fn test_multiscale_predicted_area_still_finds_target() {
        let source = with_red_square(busy_background(400, 300), 180, 130, 40);
        let query = source.crop(Rect::new(180, 130, 220, 170));
        // recorded at the same resolution, centred on the square's centre
        let record_pos = (
            (200.0 - 200.0) / 400.0, // (cx - W/2) / W
            (150.0 - 150.0) / 400.0, // (cy - H/2) / W
        );
        let hit = MultiScaleTemplateMatcher::new(query, source, 0.7, false)
            .with_record(Some(record_pos), Some((400, 300)))
            .find_best()
            .unwrap()
            .expect("target inside the predicted area must be found");
        let c = hit.rectangle.center();
        assert!((c.x - 200).abs() <= 4 && (c.y - 150).abs() <= 4, "centre {c:?}");
    }
}

//! The match orchestrator: a reference image plus matching metadata.
//!
//! A [`Template`] tries the configured matchers in order against a captured
//! screen and reports the first hit, post-mapped through the configured
//! [`TargetPos`] into a single click point.  [`loop_find`] polls a screen
//! source until a template shows up or the timeout runs out.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::{ResizeMethod, Settings};
use crate::errors::{Result, WinspectError};
use crate::geometry::{Point, Rect};
use crate::imaging::{self, Raster};
use crate::matching::keypoint::{KeypointBackend, KeypointMatcher};
use crate::matching::template::{MultiScaleTemplateMatcher, TemplateMatcher};
use crate::matching::{MatchMethod, Matched};

/// Which point of a matched rectangle to report, laid out like a keypad:
///
/// ```text
/// 1 2 3
/// 4 5 6
/// 7 8 9
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetPos {
    LeftUp,
    Up,
    RightUp,
    Left,
    #[default]
    Mid,
    Right,
    LeftDown,
    Down,
    RightDown,
}

impl TargetPos {
    /// Decode the keypad digit; `0` is an alias for the centre.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 | 5 => Self::Mid,
            1 => Self::LeftUp,
            2 => Self::Up,
            3 => Self::RightUp,
            4 => Self::Left,
            6 => Self::Right,
            7 => Self::LeftDown,
            8 => Self::Down,
            9 => Self::RightDown,
            _ => return None,
        })
    }

    /// The chosen point of `rect`.  Edges use the true midpoints.
    pub fn point_in(&self, rect: Rect) -> Point {
        let c = rect.center();
        match self {
            Self::Mid => c,
            Self::LeftUp => Point::new(rect.left, rect.top),
            Self::Up => Point::new(c.x, rect.top),
            Self::RightUp => Point::new(rect.right, rect.top),
            Self::Left => Point::new(rect.left, c.y),
            Self::Right => Point::new(rect.right, c.y),
            Self::LeftDown => Point::new(rect.left, rect.bottom),
            Self::Down => Point::new(c.x, rect.bottom),
            Self::RightDown => Point::new(rect.right, rect.bottom),
        }
    }
}

/// COCOS "min" scaling: how much to resize a `(w, h)` reference recorded at
/// `record` resolution so it fits a screen at `screen` resolution, measured
/// against a common design resolution.
pub fn cocos_min_strategy(
    w: u32,
    h: u32,
    record: (u32, u32),
    screen: (u32, u32),
    design: (u32, u32),
) -> (u32, u32) {
    let scale_record = (record.0 as f64 / design.0 as f64).min(record.1 as f64 / design.1 as f64);
    let scale_screen = (screen.0 as f64 / design.0 as f64).min(screen.1 as f64 / design.1 as f64);
    if scale_record <= 0.0 {
        return (w.max(1), h.max(1));
    }
    let scale = scale_screen / scale_record;
    (
        ((w as f64 * scale) as u32).max(1),
        ((h as f64 * scale) as u32).max(1),
    )
}

/// Default design resolution for [`cocos_min_strategy`].
pub const DESIGN_RESOLUTION: (u32, u32) = (960, 640);

/// Anything that can produce a fresh screen raster (a window driver, a
/// desktop grabber, a test double).
pub trait ScreenSource {
    fn capture(&self) -> Result<Raster>;
}

/// A reference image with matching metadata.
#[derive(Debug, Clone)]
pub struct Template {
    path: PathBuf,
    threshold: Option<f32>,
    target_pos: TargetPos,
    record_pos: Option<(f32, f32)>,
    resolution: Option<(u32, u32)>,
    use_color: bool,
    scale_max: u32,
    scale_step: f32,
    strategy: Option<Vec<String>>,
}

impl Template {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            threshold: None,
            target_pos: TargetPos::Mid,
            record_pos: None,
            resolution: None,
            use_color: false,
            scale_max: 800,
            scale_step: 0.005,
            strategy: None,
        }
    }

    /// Per-template threshold, overriding the process default.
    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn target_pos(mut self, pos: TargetPos) -> Self {
        self.target_pos = pos;
        self
    }

    /// Record-time click offset (normalised by the recorded source width).
    pub fn record_pos(mut self, pos: (f32, f32)) -> Self {
        self.record_pos = Some(pos);
        self
    }

    /// Screen resolution at record time.
    pub fn resolution(mut self, resolution: (u32, u32)) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Verify hits with the HSV colour confidence instead of grayscale.
    pub fn use_color(mut self, yes: bool) -> Self {
        self.use_color = yes;
        self
    }

    pub fn scale(mut self, scale_max: u32, scale_step: f32) -> Self {
        self.scale_max = scale_max;
        self.scale_step = scale_step;
        self
    }

    /// Per-template matcher list, overriding the process-wide strategy.
    pub fn strategy(mut self, names: &[&str]) -> Self {
        self.strategy = Some(names.iter().map(|s| s.to_string()).collect());
        self
    }

    fn resolved_path(&self, settings: &Settings) -> PathBuf {
        if self.path.is_relative() && !settings.project_root.as_os_str().is_empty() {
            settings.project_root.join(&self.path)
        } else {
            self.path.clone()
        }
    }

    /// Resize the decoded reference for the current screen per the
    /// configured strategy.  A missing or matching recorded resolution
    /// leaves the image untouched.
    fn resize_reference(&self, image: &Raster, screen: &Raster, settings: &Settings) -> Raster {
        let Some(record) = self.resolution else {
            return image.clone();
        };
        let screen_res = screen.resolution();
        if record == screen_res || settings.resize_method == ResizeMethod::None {
            return image.clone();
        }
        let (w, h) = cocos_min_strategy(
            image.width(),
            image.height(),
            record,
            screen_res,
            DESIGN_RESOLUTION,
        );
        image.resize(w, h)
    }

    /// The first matcher hit, as a full match result.
    ///
    /// Matchers that report a missing backend or an input-size problem are
    /// skipped; other errors bubble.
    pub fn match_rect_in(&self, screen: &Raster) -> Result<Option<Matched>> {
        let settings = Settings::snapshot();
        let threshold = self.threshold.unwrap_or(settings.threshold);
        let original = imaging::imread(&self.resolved_path(&settings))?;
        let resized = self.resize_reference(&original, screen, &settings);

        let names = self.strategy.as_deref().unwrap_or(&settings.cv_strategy);
        for name in names {
            let method = MatchMethod::parse(name)?;
            let attempt = self.run_matcher(method, &original, &resized, screen, threshold);
            match attempt {
                Ok(Some(hit)) => {
                    log::debug!("matcher '{name}' hit {:?} @ {:.3}", hit.rectangle, hit.confidence);
                    return Ok(Some(hit));
                }
                Ok(None) => continue,
                Err(WinspectError::BackendMissing(reason)) => {
                    log::debug!("matcher '{name}' unavailable: {reason}");
                    continue;
                }
                Err(WinspectError::TemplateInput(reason)) => {
                    log::debug!("matcher '{name}' rejected input: {reason}");
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
        Ok(None)
    }

    fn run_matcher(
        &self,
        method: MatchMethod,
        original: &Raster,
        resized: &Raster,
        screen: &Raster,
        threshold: f32,
    ) -> Result<Option<Matched>> {
        match method {
            MatchMethod::Template => {
                TemplateMatcher::new(resized.clone(), screen.clone(), threshold, self.use_color)
                    .find_best()
            }
            // the multi-scale matcher sweeps scale itself, so it receives
            // the original reference plus the record-time metadata
            MatchMethod::MultiScaleTemplate => {
                MultiScaleTemplateMatcher::new(
                    original.clone(),
                    screen.clone(),
                    threshold,
                    self.use_color,
                )
                .with_record(self.record_pos, self.resolution)
                .with_scale(self.scale_max, self.scale_step)
                .find_best()
            }
            MatchMethod::Kaze => self.run_keypoint(KeypointBackend::Kaze, resized, screen, threshold),
            MatchMethod::Akaze => self.run_keypoint(KeypointBackend::Akaze, resized, screen, threshold),
            MatchMethod::Brisk => self.run_keypoint(KeypointBackend::Brisk, resized, screen, threshold),
            MatchMethod::Orb => self.run_keypoint(KeypointBackend::Orb, resized, screen, threshold),
            MatchMethod::Sift => self.run_keypoint(KeypointBackend::Sift, resized, screen, threshold),
            MatchMethod::Surf => self.run_keypoint(KeypointBackend::Surf, resized, screen, threshold),
            MatchMethod::Brief => self.run_keypoint(KeypointBackend::Brief, resized, screen, threshold),
        }
    }

    fn run_keypoint(
        &self,
        backend: KeypointBackend,
        resized: &Raster,
        screen: &Raster,
        threshold: f32,
    ) -> Result<Option<Matched>> {
        KeypointMatcher::new(backend, resized.clone(), screen.clone(), threshold, self.use_color)?
            .find_best()
    }

    /// The first hit mapped to the configured click point.
    pub fn match_in(&self, screen: &Raster) -> Result<Option<Point>> {
        Ok(self
            .match_rect_in(screen)?
            .map(|hit| self.target_pos.point_in(hit.rectangle)))
    }

    /// Every hit of the plain template matcher, best first.
    pub fn find_all_in(&self, screen: &Raster, max_results: usize) -> Result<Vec<Matched>> {
        let settings = Settings::snapshot();
        let threshold = self.threshold.unwrap_or(settings.threshold);
        let original = imaging::imread(&self.resolved_path(&settings))?;
        let resized = self.resize_reference(&original, screen, &settings);
        TemplateMatcher::new(resized, screen.clone(), threshold, self.use_color)
            .find_all(max_results)
    }
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

/// Poll `source` until `template` shows up.
///
/// Capture failures are logged and retried; only the timeout surfaces an
/// error (`TargetNotFound`).  On a hit (and on timeout) the last screen is
/// written to the configured log directory.
pub fn loop_find<S: ScreenSource>(
    source: &S,
    template: &Template,
    timeout: Duration,
    interval: Duration,
) -> Result<Point> {
    let start = Instant::now();
    let mut last_screen: Option<Raster> = None;
    loop {
        match source.capture() {
            Ok(screen) => {
                let found = template.match_in(&screen)?;
                last_screen = Some(screen);
                if let Some(point) = found {
                    try_log_screen(last_screen.as_ref());
                    return Ok(point);
                }
            }
            Err(e) => log::warn!("screen capture failed, retrying: {e}"),
        }
        if start.elapsed() > timeout {
            try_log_screen(last_screen.as_ref());
            return Err(WinspectError::TargetNotFound(format!(
                "template {} not found within {:?}",
                template.path.display(),
                timeout
            )));
        }
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }
}

/// [`loop_find`] with the process-wide timeout and the conventional half
/// second between polls.
pub fn loop_find_default<S: ScreenSource>(source: &S, template: &Template) -> Result<Point> {
    let timeout = Settings::snapshot().find_timeout;
    loop_find(source, template, timeout, Duration::from_millis(500))
}

/// Write a screen raster to `LOG_DIR/<millis>.jpg`, honouring the snapshot
/// quality and size limits.  Disabled logging is not an error.
pub fn try_log_screen(screen: Option<&Raster>) {
    let settings = Settings::snapshot();
    let (Some(dir), Some(screen)) = (settings.log_dir.as_ref(), screen) else {
        return;
    };
    if !settings.save_image {
        return;
    }
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let path: &Path = &dir.join(format!("{millis}.jpg"));
    if let Err(e) = imaging::imwrite(path, screen, settings.snapshot_quality, settings.image_max_size)
    {
        log::warn!("failed to log screen to {}: {e}", path.display());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fs;

    #[test]
    fn test_target_pos_keypad_codes() {
        assert_eq!(TargetPos::from_code(0), Some(TargetPos::Mid));
        assert_eq!(TargetPos::from_code(5), Some(TargetPos::Mid));
        assert_eq!(TargetPos::from_code(1), Some(TargetPos::LeftUp));
        assert_eq!(TargetPos::from_code(9), Some(TargetPos::RightDown));
        assert_eq!(TargetPos::from_code(10), None);
    }

    #[test]
    fn test_target_pos_points_use_true_midpoints() {
        let r = Rect::new(10, 20, 110, 60);
        assert_eq!(TargetPos::Mid.point_in(r), Point::new(60, 40));
        assert_eq!(TargetPos::LeftUp.point_in(r), Point::new(10, 20));
        assert_eq!(TargetPos::Up.point_in(r), Point::new(60, 20));
        assert_eq!(TargetPos::RightUp.point_in(r), Point::new(110, 20));
        assert_eq!(TargetPos::Left.point_in(r), Point::new(10, 40));
        assert_eq!(TargetPos::Right.point_in(r), Point::new(110, 40));
        assert_eq!(TargetPos::LeftDown.point_in(r), Point::new(10, 60));
        assert_eq!(TargetPos::Down.point_in(r), Point::new(60, 60));
        assert_eq!(TargetPos::RightDown.point_in(r), Point::new(110, 60));
    }

    #[test]
    fn test_cocos_min_strategy_values() {
        // 1920x1080 recording on a 960x640 screen: record scale is
        // min(2, 1.6875) = 1.6875, screen scale 1.0
        let (w, h) = cocos_min_strategy(100, 50, (1920, 1080), (960, 640), DESIGN_RESOLUTION);
        assert_eq!((w, h), (59, 29));
        // equal resolutions keep the size
        let (w, h) = cocos_min_strategy(100, 50, (960, 640), (960, 640), DESIGN_RESOLUTION);
        assert_eq!((w, h), (100, 50));
        // both sides are clamped to at least one pixel
        let (w, h) = cocos_min_strategy(2, 1, (4000, 4000), (960, 640), DESIGN_RESOLUTION);
        assert!(w >= 1 && h >= 1);
    }

    // -- orchestrator ------------------------------------------------------

    // quadratic pattern: windows are unique under translation
    fn busy_screen() -> Raster {
        let mut img = Raster::filled(160, 120, [0, 0, 0]);
        for y in 0u32..120 {
            for x in 0u32..160 {
                let v = ((x * x * 3 + y * y * 7 + x * y) % 241) as u8;
                img.put_pixel(x, y, [v, 255 - v, v / 3 + 30]);
            }
        }
        img
    }

    fn write_reference(name: &str, img: &Raster) -> PathBuf {
        let dir = std::env::temp_dir().join("winspect-template-tests");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        imaging::write_png(&path, img).unwrap();
        path
    }

    #[test]
    fn test_template_matches_via_tpl_strategy() {
        let screen = busy_screen();
        let reference = screen.crop(Rect::new(40, 30, 90, 70));
        let path = write_reference("tpl-hit.png", &reference);
        let template = Template::new(path).threshold(0.8).strategy(&["tpl"]);
        let hit = template.match_rect_in(&screen).unwrap().expect("crop must match");
        assert_eq!(hit.rectangle, Rect::new(40, 30, 90, 70));
        // centre click point
        let point = template.match_in(&screen).unwrap().unwrap();
        assert_eq!(point, Point::new(65, 50));
    }

    #[test]
    fn test_template_skips_missing_backends() {
        let screen = busy_screen();
        let reference = screen.crop(Rect::new(10, 10, 60, 50));
        let path = write_reference("skip-missing.png", &reference);
        // kaze and surf are unavailable; tpl at the end still hits
        let template = Template::new(path)
            .threshold(0.8)
            .strategy(&["kaze", "surf", "tpl"]);
        assert!(template.match_rect_in(&screen).unwrap().is_some());
    }

    #[test]
    fn test_template_unknown_strategy_name() {
        let screen = busy_screen();
        let reference = screen.crop(Rect::new(10, 10, 60, 50));
        let path = write_reference("unknown-method.png", &reference);
        let template = Template::new(path).strategy(&["definitely-not-a-matcher"]);
        assert!(matches!(
            template.match_rect_in(&screen),
            Err(WinspectError::InvalidMatchingMethod(_))
        ));
    }

    #[test]
    fn test_template_missing_file() {
        let template = Template::new("no/such/reference-image.png").strategy(&["tpl"]);
        assert!(matches!(
            template.match_rect_in(&busy_screen()),
            Err(WinspectError::FileNotExist(_))
        ));
    }

    #[test]
    fn test_resize_reference_applies_cocos_min() {
        let screen = busy_screen(); // 160x120
        let reference = Raster::filled(64, 48, [9, 9, 9]);
        let path = write_reference("resize-ref.png", &reference);
        let template = Template::new(path).resolution((320, 240));
        let settings = Settings::snapshot();
        let original = Raster::filled(64, 48, [9, 9, 9]);
        let resized = template.resize_reference(&original, &screen, &settings);
        // record scale min(1/3, 3/8) = 1/3, screen scale min(1/6, 3/16) = 1/6
        assert_eq!(resized.resolution(), (32, 24));
    }

    // -- loop_find ---------------------------------------------------------

    struct NeverScreen {
        polls: Cell<u32>,
    }

    impl ScreenSource for NeverScreen {
        fn capture(&self) -> Result<Raster> {
            self.polls.set(self.polls.get() + 1);
            Ok(Raster::filled(64, 64, [5, 5, 5]))
        }
    }

    #[test]
    fn test_loop_find_times_out_after_enough_polls() {
        // spec scenario S6: timeout 1.5s, interval 0.3s, never found
        let reference = busy_screen().crop(Rect::new(0, 0, 40, 40));
        let path = write_reference("never-there.png", &reference);
        let template = Template::new(path).threshold(0.9).strategy(&["tpl"]);
        let source = NeverScreen { polls: Cell::new(0) };
        let start = Instant::now();
        let res = loop_find(
            &source,
            &template,
            Duration::from_millis(1500),
            Duration::from_millis(300),
        );
        let elapsed = start.elapsed();
        assert!(matches!(res, Err(WinspectError::TargetNotFound(_))));
        assert!(elapsed >= Duration::from_millis(1500));
        assert!(elapsed <= Duration::from_millis(2400), "elapsed {elapsed:?}");
        assert!(source.polls.get() >= 5, "polled {} times", source.polls.get());
    }

    struct EventualScreen {
        hit_after: u32,
        polls: Cell<u32>,
        screen: Raster,
    }

    impl ScreenSource for EventualScreen {
        fn capture(&self) -> Result<Raster> {
            self.polls.set(self.polls.get() + 1);
            if self.polls.get() >= self.hit_after {
                Ok(self.screen.clone())
            } else {
                Ok(Raster::filled(160, 120, [5, 5, 5]))
            }
        }
    }

    #[test]
    fn test_loop_find_returns_once_visible() {
        let screen = busy_screen();
        let reference = screen.crop(Rect::new(40, 30, 90, 70));
        let path = write_reference("eventually.png", &reference);
        let template = Template::new(path).threshold(0.8).strategy(&["tpl"]);
        let source = EventualScreen { hit_after: 3, polls: Cell::new(0), screen };
        let point = loop_find(
            &source,
            &template,
            Duration::from_secs(10),
            Duration::from_millis(10),
        )
        .unwrap();
        assert_eq!(point, Point::new(65, 50));
        assert_eq!(source.polls.get(), 3);
    }
}

//! Owned raster images and the codec layer.
//!
//! [`Raster`] is a BGR byte matrix (3 bytes per pixel, row-major) -- the
//! working format of the matching engine.  [`GrayBuf`] is the single-channel
//! `f32` form the NCC kernel operates on.  File decode/encode goes through
//! the `image` crate; colourspace conversions follow the OpenCV 8-bit
//! conventions so that confidence scores line up with the recorded
//! reference material (H in `[0, 180)`, S/V in `[0, 255]`).
//!
//! All operations return owned copies; nothing mutates its input in place.

use std::fs;
use std::io::BufWriter;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::{imageops, DynamicImage, RgbImage};

use crate::errors::{Result, WinspectError};
use crate::geometry::Rect;

// ---------------------------------------------------------------------------
// Raster (BGR)
// ---------------------------------------------------------------------------

/// Owned BGR image, 3 bytes per pixel, rows top-to-bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Raster {
    /// Allocate a raster filled with one BGR colour.
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..width * height {
            data.extend_from_slice(&bgr);
        }
        Self { width, height, data }
    }

    /// Wrap an existing BGR buffer; `data.len()` must be `width * height * 3`.
    pub fn from_bgr(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        if data.len() != (width as usize) * (height as usize) * 3 {
            return Err(WinspectError::InvalidArgument(format!(
                "BGR buffer length {} does not match {}x{}",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self { width, height, data })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        ((y * self.width + x) * 3) as usize
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let o = self.offset(x, y);
        [self.data[o], self.data[o + 1], self.data[o + 2]]
    }

    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, bgr: [u8; 3]) {
        let o = self.offset(x, y);
        self.data[o..o + 3].copy_from_slice(&bgr);
    }

    /// Fill an axis-aligned region (clipped to the image) with one colour.
    pub fn fill_rect(&mut self, rect: Rect, bgr: [u8; 3]) {
        let x0 = rect.left.max(0) as u32;
        let y0 = rect.top.max(0) as u32;
        let x1 = (rect.right.max(0) as u32).min(self.width);
        let y1 = (rect.bottom.max(0) as u32).min(self.height);
        for y in y0..y1 {
            for x in x0..x1 {
                self.put_pixel(x, y, bgr);
            }
        }
    }

    /// Crop to `rect` clipped against the image bounds.
    ///
    /// An empty intersection yields a 0x0 raster.
    pub fn crop(&self, rect: Rect) -> Raster {
        let bounds = Rect::new(0, 0, self.width as i32, self.height as i32);
        let Some(r) = bounds.intersect(&rect) else {
            return Raster { width: 0, height: 0, data: Vec::new() };
        };
        let (w, h) = (r.width() as u32, r.height() as u32);
        let mut data = Vec::with_capacity((w * h * 3) as usize);
        for y in r.top..r.bottom {
            let start = self.offset(r.left as u32, y as u32);
            let end = start + (w * 3) as usize;
            data.extend_from_slice(&self.data[start..end]);
        }
        Raster { width: w, height: h, data }
    }

    /// Bilinear resize.  Zero target dimensions are clamped to 1.
    pub fn resize(&self, width: u32, height: u32) -> Raster {
        let (tw, th) = (width.max(1), height.max(1));
        if tw == self.width && th == self.height {
            return self.clone();
        }
        let mut data = vec![0u8; (tw * th * 3) as usize];
        let sx = self.width as f32 / tw as f32;
        let sy = self.height as f32 / th as f32;
        for y in 0..th {
            let fy = ((y as f32 + 0.5) * sy - 0.5).max(0.0);
            let y0 = (fy as u32).min(self.height - 1);
            let y1 = (y0 + 1).min(self.height - 1);
            let dy = fy - y0 as f32;
            for x in 0..tw {
                let fx = ((x as f32 + 0.5) * sx - 0.5).max(0.0);
                let x0 = (fx as u32).min(self.width - 1);
                let x1 = (x0 + 1).min(self.width - 1);
                let dx = fx - x0 as f32;
                let o = ((y * tw + x) * 3) as usize;
                for c in 0..3 {
                    let p00 = self.data[self.offset(x0, y0) + c] as f32;
                    let p01 = self.data[self.offset(x1, y0) + c] as f32;
                    let p10 = self.data[self.offset(x0, y1) + c] as f32;
                    let p11 = self.data[self.offset(x1, y1) + c] as f32;
                    let top = p00 + (p01 - p00) * dx;
                    let bot = p10 + (p11 - p10) * dx;
                    data[o + c] = (top + (bot - top) * dy).round().clamp(0.0, 255.0) as u8;
                }
            }
        }
        Raster { width: tw, height: th, data }
    }

    /// Replicate-border padding by `n` pixels on every side.
    pub fn pad_replicate(&self, n: u32) -> Raster {
        let (w, h) = (self.width + 2 * n, self.height + 2 * n);
        let mut out = Raster::filled(w, h, [0, 0, 0]);
        for y in 0..h {
            let sy = y.saturating_sub(n).min(self.height.saturating_sub(1));
            for x in 0..w {
                let sx = x.saturating_sub(n).min(self.width.saturating_sub(1));
                out.put_pixel(x, y, self.pixel(sx, sy));
            }
        }
        out
    }

    /// Clamp every channel into `[lo, hi]`.
    pub fn clamp_channels(&self, lo: u8, hi: u8) -> Raster {
        let data = self.data.iter().map(|&v| v.clamp(lo, hi)).collect();
        Raster { width: self.width, height: self.height, data }
    }

    /// Single-channel grayscale, OpenCV BGR weights.
    pub fn to_gray(&self) -> GrayBuf {
        let mut data = Vec::with_capacity((self.width * self.height) as usize);
        for px in self.data.chunks_exact(3) {
            let (b, g, r) = (px[0] as f32, px[1] as f32, px[2] as f32);
            data.push(0.114 * b + 0.587 * g + 0.299 * r);
        }
        GrayBuf { width: self.width, height: self.height, data }
    }

    /// BGR -> HSV under the OpenCV 8-bit convention (H halved into
    /// `[0, 180)`), stored channel-wise in the same 3-byte layout.
    pub fn to_hsv(&self) -> Raster {
        let mut data = Vec::with_capacity(self.data.len());
        for px in self.data.chunks_exact(3) {
            let (b, g, r) = (px[0] as f32, px[1] as f32, px[2] as f32);
            let v = b.max(g).max(r);
            let min = b.min(g).min(r);
            let delta = v - min;
            let s = if v > 0.0 { delta * 255.0 / v } else { 0.0 };
            let h = if delta == 0.0 {
                0.0
            } else if (v - r).abs() < f32::EPSILON {
                60.0 * (g - b) / delta
            } else if (v - g).abs() < f32::EPSILON {
                120.0 + 60.0 * (b - r) / delta
            } else {
                240.0 + 60.0 * (r - g) / delta
            };
            let h = if h < 0.0 { h + 360.0 } else { h } / 2.0;
            data.push(h.round().clamp(0.0, 180.0) as u8);
            data.push(s.round().clamp(0.0, 255.0) as u8);
            data.push(v.round().clamp(0.0, 255.0) as u8);
        }
        Raster { width: self.width, height: self.height, data }
    }

    /// Split into three single-channel buffers (channel order preserved).
    pub fn split_channels(&self) -> [GrayBuf; 3] {
        let len = (self.width * self.height) as usize;
        let mut chans = [
            Vec::with_capacity(len),
            Vec::with_capacity(len),
            Vec::with_capacity(len),
        ];
        for px in self.data.chunks_exact(3) {
            chans[0].push(px[0] as f32);
            chans[1].push(px[1] as f32);
            chans[2].push(px[2] as f32);
        }
        chans.map(|data| GrayBuf { width: self.width, height: self.height, data })
    }

    /// Convert to the `image` crate's RGB buffer (for encoding).
    pub fn to_rgb_image(&self) -> RgbImage {
        let rgb: Vec<u8> = self
            .data
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect();
        RgbImage::from_raw(self.width, self.height, rgb)
            .expect("buffer length computed from dimensions")
    }

    /// Build from the `image` crate's RGB buffer (after decoding).
    pub fn from_rgb_image(img: &RgbImage) -> Raster {
        let data: Vec<u8> = img
            .as_raw()
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect();
        Raster { width: img.width(), height: img.height(), data }
    }
}

// ---------------------------------------------------------------------------
// GrayBuf (single-channel f32)
// ---------------------------------------------------------------------------

/// Owned single-channel `f32` image used by the NCC kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct GrayBuf {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl GrayBuf {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        Self { width, height, data }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn at(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, v: f32) {
        self.data[(y * self.width + x) as usize] = v;
    }

    /// Bilinear resize; target dimensions are clamped to at least 1.
    pub fn resize(&self, width: u32, height: u32) -> GrayBuf {
        let (tw, th) = (width.max(1), height.max(1));
        if tw == self.width && th == self.height {
            return self.clone();
        }
        let mut data = vec![0f32; (tw * th) as usize];
        let sx = self.width as f32 / tw as f32;
        let sy = self.height as f32 / th as f32;
        for y in 0..th {
            let fy = ((y as f32 + 0.5) * sy - 0.5).max(0.0);
            let y0 = (fy as u32).min(self.height - 1);
            let y1 = (y0 + 1).min(self.height - 1);
            let dy = fy - y0 as f32;
            for x in 0..tw {
                let fx = ((x as f32 + 0.5) * sx - 0.5).max(0.0);
                let x0 = (fx as u32).min(self.width - 1);
                let x1 = (x0 + 1).min(self.width - 1);
                let dx = fx - x0 as f32;
                let top = self.at(x0, y0) + (self.at(x1, y0) - self.at(x0, y0)) * dx;
                let bot = self.at(x0, y1) + (self.at(x1, y1) - self.at(x0, y1)) * dx;
                data[(y * tw + x) as usize] = top + (bot - top) * dy;
            }
        }
        GrayBuf { width: tw, height: th, data }
    }
}

// ---------------------------------------------------------------------------
// Codec layer
// ---------------------------------------------------------------------------

/// Decode an image file into a BGR raster.
///
/// The path may contain non-ASCII characters.  A missing file is reported
/// as `FileNotExist` (distinct from a decode failure).
pub fn imread(path: &Path) -> Result<Raster> {
    if !path.is_file() {
        return Err(WinspectError::FileNotExist(path.display().to_string()));
    }
    let img = image::open(path)?;
    Ok(Raster::from_rgb_image(&img.to_rgb8()))
}

/// Encode a raster as JPEG at `quality` in `[1, 99]`, optionally
/// thumbnailed so neither side exceeds `max_size`.  Parent directories are
/// created on demand.
pub fn imwrite(path: &Path, raster: &Raster, quality: u8, max_size: Option<u32>) -> Result<()> {
    if !(1..=99).contains(&quality) {
        return Err(WinspectError::InvalidArgument(format!(
            "snapshot quality {quality} not in [1, 99]"
        )));
    }
    let mut rgb = raster.to_rgb_image();
    if let Some(max) = max_size {
        if max > 0 && (rgb.width() > max || rgb.height() > max) {
            rgb = DynamicImage::ImageRgb8(rgb)
                .resize(max, max, imageops::FilterType::Lanczos3)
                .to_rgb8();
        }
    }
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    let file = fs::File::create(path)?;
    let mut encoder = JpegEncoder::new_with_quality(BufWriter::new(file), quality);
    encoder.encode_image(&rgb)?;
    Ok(())
}

/// Encode a raster as PNG (used by the CLI tools; lossless).
pub fn write_png(path: &Path, raster: &Raster) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    raster
        .to_rgb_image()
        .save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_roundtrip() {
        let mut r = Raster::filled(4, 3, [1, 2, 3]);
        assert_eq!(r.pixel(0, 0), [1, 2, 3]);
        r.put_pixel(2, 1, [9, 8, 7]);
        assert_eq!(r.pixel(2, 1), [9, 8, 7]);
        assert_eq!(r.pixel(3, 2), [1, 2, 3]);
    }

    #[test]
    fn test_crop_clips_to_bounds() {
        let mut r = Raster::filled(10, 10, [0, 0, 0]);
        r.fill_rect(Rect::new(4, 4, 8, 8), [255, 255, 255]);
        let c = r.crop(Rect::new(4, 4, 20, 20));
        assert_eq!(c.resolution(), (6, 6));
        assert_eq!(c.pixel(0, 0), [255, 255, 255]);
        assert_eq!(c.pixel(5, 5), [0, 0, 0]);
        let empty = r.crop(Rect::new(10, 10, 12, 12));
        assert_eq!(empty.resolution(), (0, 0));
    }

    #[test]
    fn test_pad_replicate_extends_borders() {
        let mut r = Raster::filled(2, 2, [10, 10, 10]);
        r.put_pixel(0, 0, [50, 50, 50]);
        let p = r.pad_replicate(2);
        assert_eq!(p.resolution(), (6, 6));
        // the top-left quadrant replicates the (0,0) pixel
        assert_eq!(p.pixel(0, 0), [50, 50, 50]);
        assert_eq!(p.pixel(1, 1), [50, 50, 50]);
        assert_eq!(p.pixel(2, 2), [50, 50, 50]);
        assert_eq!(p.pixel(5, 5), [10, 10, 10]);
    }

    #[test]
    fn test_gray_weights() {
        let white = Raster::filled(1, 1, [255, 255, 255]);
        assert!((white.to_gray().at(0, 0) - 255.0).abs() < 0.5);
        let blue = Raster::filled(1, 1, [255, 0, 0]);
        assert!((blue.to_gray().at(0, 0) - 0.114 * 255.0).abs() < 0.5);
    }

    #[test]
    fn test_hsv_primaries() {
        // pure red: H=0, S=255, V=255
        let red = Raster::filled(1, 1, [0, 0, 255]).to_hsv();
        assert_eq!(red.pixel(0, 0), [0, 255, 255]);
        // pure green: H=60 (halved from 120)
        let green = Raster::filled(1, 1, [0, 255, 0]).to_hsv();
        assert_eq!(green.pixel(0, 0), [60, 255, 255]);
        // pure blue: H=120 (halved from 240)
        let blue = Raster::filled(1, 1, [255, 0, 0]).to_hsv();
        assert_eq!(blue.pixel(0, 0), [120, 255, 255]);
        // gray: S=0
        let gray = Raster::filled(1, 1, [128, 128, 128]).to_hsv();
        assert_eq!(gray.pixel(0, 0)[1], 0);
    }

    #[test]
    fn test_clamp_channels() {
        let r = Raster::filled(1, 2, [0, 128, 255]).clamp_channels(10, 245);
        assert_eq!(r.pixel(0, 0), [10, 128, 245]);
    }

    #[test]
    fn test_resize_preserves_flat_regions() {
        let r = Raster::filled(8, 8, [40, 90, 200]);
        let small = r.resize(4, 4);
        assert_eq!(small.resolution(), (4, 4));
        assert_eq!(small.pixel(2, 2), [40, 90, 200]);
        let big = r.resize(16, 16);
        assert_eq!(big.pixel(8, 8), [40, 90, 200]);
        // degenerate target clamps to one pixel
        assert_eq!(r.resize(0, 0).resolution(), (1, 1));
    }

    #[test]
    fn test_rgb_image_roundtrip() {
        let mut r = Raster::filled(3, 2, [1, 2, 3]);
        r.put_pixel(1, 1, [200, 100, 50]);
        let back = Raster::from_rgb_image(&r.to_rgb_image());
        assert_eq!(back, r);
    }

    #[test]
    fn test_imwrite_rejects_bad_quality() {
        let r = Raster::filled(2, 2, [0, 0, 0]);
        let path = std::env::temp_dir().join("winspect-bad-quality.jpg");
        assert!(matches!(
            imwrite(&path, &r, 0, None),
            Err(WinspectError::InvalidArgument(_))
        ));
        assert!(matches!(
            imwrite(&path, &r, 100, None),
            Err(WinspectError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_imread_missing_file() {
        let missing = Path::new("definitely-не-существует-ファイル.png");
        assert!(matches!(
            imread(missing),
            Err(WinspectError::FileNotExist(_))
        ));
    }

    #[test]
    fn test_imwrite_imread_roundtrip() {
        let dir = std::env::temp_dir().join("winspect-imaging-тест");
        let path = dir.join("shot.jpg");
        let r = Raster::filled(32, 24, [30, 60, 90]);
        imwrite(&path, &r, 90, None).unwrap();
        let back = imread(&path).unwrap();
        assert_eq!(back.resolution(), (32, 24));
        // JPEG is lossy; a flat image stays close
        let px = back.pixel(16, 12);
        assert!((px[0] as i32 - 30).abs() < 8);
        assert!((px[1] as i32 - 60).abs() < 8);
        assert!((px[2] as i32 - 90).abs() < 8);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_imwrite_thumbnails() {
        let dir = std::env::temp_dir().join("winspect-imaging-thumb");
        let path = dir.join("thumb.jpg");
        let r = Raster::filled(400, 100, [10, 10, 10]);
        imwrite(&path, &r, 50, Some(200)).unwrap();
        let back = imread(&path).unwrap();
        assert!(back.width() <= 200 && back.height() <= 200);
        let _ = fs::remove_dir_all(dir);
    }
}

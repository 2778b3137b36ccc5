//! Native keypoint detectors and descriptors.
//!
//! The detector zoo is built from two pieces of shared infrastructure: a
//! multi-scale FAST-9 corner detector with intensity-centroid orientation
//! (feeding the binary descriptors), and a difference-of-Gaussians detector
//! with a gradient-histogram descriptor (the SIFT-style float path).
//! Descriptor sampling patterns are generated once from a fixed seed, so
//! extraction is deterministic.

use std::sync::OnceLock;

use crate::imaging::GrayBuf;

/// A detected keypoint in source-image coordinates.
#[derive(Debug, Clone, Copy)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    /// Patch scale relative to the base image (1.0 at the finest level).
    pub scale: f32,
    /// Orientation in radians; 0 when the descriptor is not steered.
    pub angle: f32,
    pub response: f32,
}

/// Descriptor matrix, one row per keypoint.
#[derive(Debug, Clone)]
pub enum Descriptors {
    /// `dim` floats per keypoint.
    Float { dim: usize, data: Vec<f32> },
    /// `bytes` packed bytes per keypoint (Hamming space).
    Binary { bytes: usize, data: Vec<u8> },
}

impl Descriptors {
    pub fn len(&self) -> usize {
        match self {
            Descriptors::Float { dim, data } => {
                if *dim == 0 {
                    0
                } else {
                    data.len() / dim
                }
            }
            Descriptors::Binary { bytes, data } => {
                if *bytes == 0 {
                    0
                } else {
                    data.len() / bytes
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Blur helpers
// ---------------------------------------------------------------------------

/// Separable Gaussian blur.
pub fn gaussian_blur(img: &GrayBuf, sigma: f32) -> GrayBuf {
    if sigma <= 0.0 {
        return img.clone();
    }
    let radius = (sigma * 3.0).ceil() as i32;
    let mut kernel = Vec::with_capacity((2 * radius + 1) as usize);
    let mut sum = 0f32;
    for i in -radius..=radius {
        let v = (-((i * i) as f32) / (2.0 * sigma * sigma)).exp();
        kernel.push(v);
        sum += v;
    }
    for v in &mut kernel {
        *v /= sum;
    }

    let (w, h) = (img.width() as i32, img.height() as i32);
    let clamp_x = |x: i32| x.clamp(0, w - 1) as u32;
    let clamp_y = |y: i32| y.clamp(0, h - 1) as u32;

    let mut horiz = GrayBuf::new(w as u32, h as u32, vec![0.0; (w * h) as usize]);
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0f32;
            for (i, k) in kernel.iter().enumerate() {
                acc += k * img.at(clamp_x(x + i as i32 - radius), y as u32);
            }
            horiz.set(x as u32, y as u32, acc);
        }
    }
    let mut out = GrayBuf::new(w as u32, h as u32, vec![0.0; (w * h) as usize]);
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0f32;
            for (i, k) in kernel.iter().enumerate() {
                acc += k * horiz.at(x as u32, clamp_y(y + i as i32 - radius));
            }
            out.set(x as u32, y as u32, acc);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// FAST-9 corners with orientation
// ---------------------------------------------------------------------------

/// Bresenham circle of radius 3 used by FAST.
const FAST_CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

fn fast_score(img: &GrayBuf, x: u32, y: u32, threshold: f32) -> f32 {
    let center = img.at(x, y);
    let ring: Vec<f32> = FAST_CIRCLE
        .iter()
        .map(|&(dx, dy)| img.at((x as i32 + dx) as u32, (y as i32 + dy) as u32))
        .collect();
    // a contiguous arc of 9 all-brighter or all-darker pixels
    for dir in 0..2 {
        let mut run = 0;
        let mut best = 0;
        for i in 0..32 {
            let v = ring[i % 16];
            let hot = if dir == 0 {
                v > center + threshold
            } else {
                v < center - threshold
            };
            if hot {
                run += 1;
                best = best.max(run);
            } else {
                run = 0;
            }
        }
        if best >= 9 {
            return ring.iter().map(|&v| (v - center).abs()).sum();
        }
    }
    0.0
}

/// Intensity-centroid orientation over a circular patch.
fn orientation(img: &GrayBuf, x: u32, y: u32, radius: i32) -> f32 {
    let (w, h) = (img.width() as i32, img.height() as i32);
    let (mut m10, mut m01) = (0f32, 0f32);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let px = (x as i32 + dx).clamp(0, w - 1) as u32;
            let py = (y as i32 + dy).clamp(0, h - 1) as u32;
            let v = img.at(px, py);
            m10 += dx as f32 * v;
            m01 += dy as f32 * v;
        }
    }
    m01.atan2(m10)
}

/// Multi-scale FAST detection.  Coordinates are mapped back into base-image
/// space; `oriented` adds the intensity-centroid angle per keypoint.
pub fn detect_fast_pyramid(img: &GrayBuf, max_features: usize, oriented: bool) -> Vec<KeyPoint> {
    const LEVELS: usize = 5;
    const LEVEL_SCALE: f32 = 1.25;
    const THRESHOLD: f32 = 20.0;

    let mut found = Vec::new();
    let mut level_img = img.clone();
    let mut scale = 1.0f32;
    for _level in 0..LEVELS {
        let (w, h) = (level_img.width(), level_img.height());
        if w < 16 || h < 16 {
            break;
        }
        // score map for non-max suppression
        let mut scores = vec![0f32; (w * h) as usize];
        for y in 3..h - 3 {
            for x in 3..w - 3 {
                scores[(y * w + x) as usize] = fast_score(&level_img, x, y, THRESHOLD);
            }
        }
        for y in 4..h - 4 {
            for x in 4..w - 4 {
                let s = scores[(y * w + x) as usize];
                if s <= 0.0 {
                    continue;
                }
                let mut is_max = true;
                'nms: for dy in -1i32..=1 {
                    for dx in -1i32..=1 {
                        if (dx, dy) == (0, 0) {
                            continue;
                        }
                        let n = scores[((y as i32 + dy) as u32 * w + (x as i32 + dx) as u32) as usize];
                        if n > s {
                            is_max = false;
                            break 'nms;
                        }
                    }
                }
                if is_max {
                    let angle = if oriented {
                        orientation(&level_img, x, y, 7)
                    } else {
                        0.0
                    };
                    found.push(KeyPoint {
                        x: x as f32 * scale,
                        y: y as f32 * scale,
                        scale,
                        angle,
                        response: s,
                    });
                }
            }
        }
        scale *= LEVEL_SCALE;
        level_img = level_img.resize(
            (img.width() as f32 / scale) as u32,
            (img.height() as f32 / scale) as u32,
        );
    }
    found.sort_by(|a, b| b.response.total_cmp(&a.response));
    found.truncate(max_features);
    found
}

// ---------------------------------------------------------------------------
// Binary descriptors
// ---------------------------------------------------------------------------

const BRIEF_BITS: usize = 256;
const BRIEF_PATCH: f32 = 13.0;

fn brief_pattern() -> &'static Vec<((f32, f32), (f32, f32))> {
    static PATTERN: OnceLock<Vec<((f32, f32), (f32, f32))>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // fixed-seed xorshift; sum of two uniforms approximates a gaussian
        let mut state = 0x853C_49E6_748F_EA9Bu64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let a = (state >> 11) as f64 / (1u64 << 53) as f64;
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let b = (state >> 11) as f64 / (1u64 << 53) as f64;
            (((a + b) - 1.0) * BRIEF_PATCH as f64) as f32
        };
        (0..BRIEF_BITS)
            .map(|_| ((next(), next()), (next(), next())))
            .collect()
    })
}

/// BRISK-style pairing over concentric rings.
fn brisk_pattern() -> &'static Vec<((f32, f32), (f32, f32))> {
    static PATTERN: OnceLock<Vec<((f32, f32), (f32, f32))>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut points: Vec<(f32, f32)> = vec![(0.0, 0.0)];
        for (radius, count) in [(3.0f32, 8usize), (6.5, 10), (10.0, 14), (13.5, 18)] {
            for i in 0..count {
                let a = i as f32 / count as f32 * std::f32::consts::TAU;
                points.push((radius * a.cos(), radius * a.sin()));
            }
        }
        // short-distance pairs, deterministic order, capped at 256
        let mut pairs = Vec::new();
        'outer: for i in 0..points.len() {
            for j in (i + 1)..points.len() {
                let (dx, dy) = (points[i].0 - points[j].0, points[i].1 - points[j].1);
                if (dx * dx + dy * dy).sqrt() < 9.0 {
                    pairs.push((points[i], points[j]));
                    if pairs.len() == BRIEF_BITS {
                        break 'outer;
                    }
                }
            }
        }
        pairs
    })
}

#[inline]
fn sample(img: &GrayBuf, x: f32, y: f32) -> f32 {
    let px = (x.round() as i32).clamp(0, img.width() as i32 - 1) as u32;
    let py = (y.round() as i32).clamp(0, img.height() as i32 - 1) as u32;
    img.at(px, py)
}

/// Extract a packed binary descriptor set over the given pattern.
///
/// The pattern is scaled by each keypoint's pyramid scale and, when
/// `steered`, rotated by its orientation.
fn binary_descriptors(
    blurred: &GrayBuf,
    keypoints: &[KeyPoint],
    pattern: &[((f32, f32), (f32, f32))],
    steered: bool,
) -> Descriptors {
    let bytes = pattern.len().div_ceil(8);
    let mut data = Vec::with_capacity(keypoints.len() * bytes);
    for kp in keypoints {
        let (sin, cos) = if steered { kp.angle.sin_cos() } else { (0.0, 1.0) };
        let rotate = |(px, py): (f32, f32)| {
            let (sx, sy) = (px * kp.scale, py * kp.scale);
            (
                kp.x + sx * cos - sy * sin,
                kp.y + sx * sin + sy * cos,
            )
        };
        let mut buf = vec![0u8; bytes];
        for (bit, &(a, b)) in pattern.iter().enumerate() {
            let (ax, ay) = rotate(a);
            let (bx, by) = rotate(b);
            if sample(blurred, ax, ay) < sample(blurred, bx, by) {
                buf[bit / 8] |= 1 << (bit % 8);
            }
        }
        data.extend_from_slice(&buf);
    }
    Descriptors::Binary { bytes, data }
}

/// ORB: oriented FAST + steered BRIEF.
pub fn orb(img: &GrayBuf, max_features: usize) -> (Vec<KeyPoint>, Descriptors) {
    let keypoints = detect_fast_pyramid(img, max_features, true);
    let blurred = gaussian_blur(img, 1.2);
    let desc = binary_descriptors(&blurred, &keypoints, brief_pattern(), true);
    (keypoints, desc)
}

/// BRISK rendition: oriented FAST + radial sampling pairs.
pub fn brisk(img: &GrayBuf, max_features: usize) -> (Vec<KeyPoint>, Descriptors) {
    let keypoints = detect_fast_pyramid(img, max_features, true);
    let blurred = gaussian_blur(img, 1.6);
    let desc = binary_descriptors(&blurred, &keypoints, brisk_pattern(), true);
    (keypoints, desc)
}

/// BRIEF: unoriented corners + plain BRIEF (bitwise L1 == Hamming).
pub fn brief(img: &GrayBuf, max_features: usize) -> (Vec<KeyPoint>, Descriptors) {
    let keypoints = detect_fast_pyramid(img, max_features, false);
    let blurred = gaussian_blur(img, 1.2);
    let desc = binary_descriptors(&blurred, &keypoints, brief_pattern(), false);
    (keypoints, desc)
}

// ---------------------------------------------------------------------------
// SIFT-style DoG detector + gradient descriptor
// ---------------------------------------------------------------------------

const SIFT_EDGE_THRESHOLD: f32 = 10.0;
const SIFT_CONTRAST: f32 = 6.0;
const SIFT_DIM: usize = 128;

/// Difference-of-Gaussians detector with edge rejection (ratio 10) and a
/// 4x4x8 gradient-histogram descriptor, L2-normalised and clipped at 0.2.
pub fn sift(img: &GrayBuf, max_features: usize) -> (Vec<KeyPoint>, Descriptors) {
    let mut keypoints = Vec::new();

    let mut base = gaussian_blur(img, 1.0);
    let mut octave_scale = 1.0f32;
    while base.width() >= 24 && base.height() >= 24 {
        let sigmas = [1.6f32, 2.26, 3.2, 4.52];
        let levels: Vec<GrayBuf> = sigmas.iter().map(|&s| gaussian_blur(&base, s)).collect();
        let dogs: Vec<GrayBuf> = levels
            .windows(2)
            .map(|pair| {
                let data = pair[1]
                    .data()
                    .iter()
                    .zip(pair[0].data().iter())
                    .map(|(&a, &b)| a - b)
                    .collect();
                GrayBuf::new(pair[0].width(), pair[0].height(), data)
            })
            .collect();

        let (w, h) = (base.width(), base.height());
        for s in 1..dogs.len() - 1 {
            for y in 8..h - 8 {
                for x in 8..w - 8 {
                    let v = dogs[s].at(x, y);
                    if v.abs() < SIFT_CONTRAST {
                        continue;
                    }
                    let mut extremum = true;
                    'scan: for ds in -1i32..=1 {
                        for dy in -1i32..=1 {
                            for dx in -1i32..=1 {
                                if (ds, dy, dx) == (0, 0, 0) {
                                    continue;
                                }
                                let n = dogs[(s as i32 + ds) as usize]
                                    .at((x as i32 + dx) as u32, (y as i32 + dy) as u32);
                                if (v > 0.0 && n >= v) || (v < 0.0 && n <= v) {
                                    extremum = false;
                                    break 'scan;
                                }
                            }
                        }
                    }
                    if !extremum {
                        continue;
                    }
                    // 2x2 Hessian edge-response rejection
                    let d = &dogs[s];
                    let dxx = d.at(x + 1, y) + d.at(x - 1, y) - 2.0 * v;
                    let dyy = d.at(x, y + 1) + d.at(x, y - 1) - 2.0 * v;
                    let dxy = (d.at(x + 1, y + 1) - d.at(x - 1, y + 1)
                        - d.at(x + 1, y - 1)
                        + d.at(x - 1, y - 1))
                        / 4.0;
                    let trace = dxx + dyy;
                    let det = dxx * dyy - dxy * dxy;
                    let r = SIFT_EDGE_THRESHOLD;
                    if det <= 0.0 || trace * trace / det >= (r + 1.0) * (r + 1.0) / r {
                        continue;
                    }
                    let level = &levels[s];
                    let angle = dominant_gradient(level, x, y);
                    keypoints.push(KeyPoint {
                        x: x as f32 * octave_scale,
                        y: y as f32 * octave_scale,
                        scale: octave_scale * sigmas[s] / 1.6,
                        angle,
                        response: v.abs(),
                    });
                }
            }
        }
        octave_scale *= 2.0;
        base = base.resize(base.width() / 2, base.height() / 2);
    }

    keypoints.sort_by(|a, b| b.response.total_cmp(&a.response));
    keypoints.truncate(max_features);

    let blurred = gaussian_blur(img, 1.6);
    let mut data = Vec::with_capacity(keypoints.len() * SIFT_DIM);
    for kp in &keypoints {
        data.extend_from_slice(&sift_descriptor(&blurred, kp));
    }
    (keypoints, Descriptors::Float { dim: SIFT_DIM, data })
}

/// Peak of a 36-bin gradient-orientation histogram around the point.
fn dominant_gradient(img: &GrayBuf, x: u32, y: u32) -> f32 {
    let (w, h) = (img.width() as i32, img.height() as i32);
    let mut hist = [0f32; 36];
    for dy in -8i32..=8 {
        for dx in -8i32..=8 {
            let px = (x as i32 + dx).clamp(1, w - 2);
            let py = (y as i32 + dy).clamp(1, h - 2);
            let gx = img.at((px + 1) as u32, py as u32) - img.at((px - 1) as u32, py as u32);
            let gy = img.at(px as u32, (py + 1) as u32) - img.at(px as u32, (py - 1) as u32);
            let mag = (gx * gx + gy * gy).sqrt();
            let angle = gy.atan2(gx).rem_euclid(std::f32::consts::TAU);
            let bin = ((angle / std::f32::consts::TAU * 36.0) as usize).min(35);
            let weight = (-((dx * dx + dy * dy) as f32) / 64.0).exp();
            hist[bin] += mag * weight;
        }
    }
    let peak = hist
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    (peak as f32 + 0.5) / 36.0 * std::f32::consts::TAU
}

/// 4x4 cells x 8 orientations over a rotated 16x16 sample grid.
fn sift_descriptor(img: &GrayBuf, kp: &KeyPoint) -> [f32; SIFT_DIM] {
    let (w, h) = (img.width() as i32, img.height() as i32);
    let (sin, cos) = kp.angle.sin_cos();
    let mut desc = [0f32; SIFT_DIM];
    for cy in 0..4 {
        for cx in 0..4 {
            for sy in 0..4 {
                for sx in 0..4 {
                    // sample offset in patch space, rotated into image space
                    let ox = (cx * 4 + sx) as f32 - 7.5;
                    let oy = (cy * 4 + sy) as f32 - 7.5;
                    let (rx, ry) = (
                        (ox * cos - oy * sin) * kp.scale,
                        (ox * sin + oy * cos) * kp.scale,
                    );
                    let px = ((kp.x + rx) as i32).clamp(1, w - 2);
                    let py = ((kp.y + ry) as i32).clamp(1, h - 2);
                    let gx = img.at((px + 1) as u32, py as u32) - img.at((px - 1) as u32, py as u32);
                    let gy = img.at(px as u32, (py + 1) as u32) - img.at(px as u32, (py - 1) as u32);
                    let mag = (gx * gx + gy * gy).sqrt();
                    // gradient orientation relative to the keypoint angle
                    let angle = (gy.atan2(gx) - kp.angle).rem_euclid(std::f32::consts::TAU);
                    let bin = ((angle / std::f32::consts::TAU * 8.0) as usize).min(7);
                    desc[(cy * 4 + cx) * 8 + bin] += mag;
                }
            }
        }
    }
    // normalise, clip, renormalise (illumination robustness)
    let norm = desc.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-6);
    for v in &mut desc {
        *v = (*v / norm).min(0.2);
    }
    let norm = desc.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-6);
    for v in &mut desc {
        *v /= norm;
    }
    desc
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Scatter of bright blobs on a dark background -- corner-rich.
    fn blobs(w: u32, h: u32) -> GrayBuf {
        let mut img = GrayBuf::new(w, h, vec![20.0; (w * h) as usize]);
        let mut state = 0xDEAD_BEEFu64;
        for _ in 0..((w * h) / 220).max(8) {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let cx = (state % w as u64) as i32;
            let cy = ((state >> 24) % h as u64) as i32;
            let side = 3 + (state >> 48) as i32 % 5;
            for dy in 0..side {
                for dx in 0..side {
                    let x = (cx + dx).clamp(0, w as i32 - 1) as u32;
                    let y = (cy + dy).clamp(0, h as i32 - 1) as u32;
                    img.set(x, y, 230.0);
                }
            }
        }
        img
    }

    #[test]
    fn test_fast_finds_corners_of_square() {
        let mut img = GrayBuf::new(48, 48, vec![10.0; 48 * 48]);
        for y in 16..32u32 {
            for x in 16..32u32 {
                img.set(x, y, 240.0);
            }
        }
        let kps = detect_fast_pyramid(&img, 100, true);
        assert!(!kps.is_empty(), "a high-contrast square must yield corners");
        // every corner sits near the square's boundary
        for kp in &kps {
            assert!(kp.x >= 12.0 && kp.x <= 36.0, "x {}", kp.x);
            assert!(kp.y >= 12.0 && kp.y <= 36.0, "y {}", kp.y);
        }
    }

    #[test]
    fn test_flat_image_has_no_features() {
        let img = GrayBuf::new(64, 64, vec![128.0; 64 * 64]);
        for (kps, desc) in [orb(&img, 100), brisk(&img, 100), brief(&img, 100), sift(&img, 100)] {
            assert!(kps.is_empty());
            assert!(desc.is_empty());
        }
    }

    #[test]
    fn test_descriptor_row_counts_match_keypoints() {
        let img = blobs(96, 96);
        for (kps, desc) in [orb(&img, 60), brisk(&img, 60), brief(&img, 60), sift(&img, 60)] {
            assert_eq!(desc.len(), kps.len());
        }
    }

    #[test]
    fn test_brief_descriptor_stable_under_translation() {
        let base = blobs(120, 120);
        // embed the same content shifted by (9, 5)
        let mut shifted = GrayBuf::new(120, 120, vec![20.0; 120 * 120]);
        for y in 0..115u32 {
            for x in 0..111u32 {
                shifted.set(x + 9, y + 5, base.at(x, y));
            }
        }
        let (kps_a, desc_a) = brief(&base, 40);
        let (kps_b, desc_b) = brief(&shifted, 80);
        let (Descriptors::Binary { bytes, data: da }, Descriptors::Binary { data: db, .. }) =
            (&desc_a, &desc_b)
        else {
            panic!("brief is binary");
        };
        // for some keypoint pair related by the shift, descriptors agree closely
        let mut best = usize::MAX;
        for (i, ka) in kps_a.iter().enumerate() {
            for (j, kb) in kps_b.iter().enumerate() {
                if (kb.x - ka.x - 9.0).abs() < 1.5 && (kb.y - ka.y - 5.0).abs() < 1.5 {
                    let dist: u32 = da[i * bytes..(i + 1) * bytes]
                        .iter()
                        .zip(&db[j * bytes..(j + 1) * bytes])
                        .map(|(a, b)| (a ^ b).count_ones())
                        .sum();
                    best = best.min(dist as usize);
                }
            }
        }
        assert!(best < 40, "translated descriptor should stay close, best {best}");
    }

    #[test]
    fn test_sift_descriptors_are_unit_norm() {
        let img = blobs(100, 100);
        let (_, desc) = sift(&img, 30);
        let Descriptors::Float { dim, data } = &desc else {
            panic!("sift is float");
        };
        for row in data.chunks_exact(*dim) {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-3, "norm {norm}");
        }
    }
}

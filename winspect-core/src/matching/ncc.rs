//! Zero-mean normalised cross-correlation (the `TM_CCOEFF_NORMED` map).
//!
//! `R(x, y) = sum((T - mean T) * (I_win - mean I_win)) / sqrt(var T * var I_win)`
//!
//! Window sums over the source come from integral images; the
//! cross-correlation term is computed directly and parallelised across
//! output rows with rayon.
//!
//! Degenerate variance is handled explicitly: when both the template and a
//! window are (near-)constant the score is the mean agreement
//! `1 - |mean T - mean I| / 255`, so a flat patch still localises inside a
//! flat region of the same brightness; when exactly one side is constant
//! the score is 0.  This keeps the round-trip guarantee (a crop of an image
//! is found at its own position) without letting near-constant regions
//! saturate at 1.0.

use rayon::prelude::*;

use crate::imaging::GrayBuf;

/// Integral image with one extra zero row/column, f64 accumulators.
struct Integral {
    width: usize,
    sums: Vec<f64>,
    squares: Vec<f64>,
}

impl Integral {
    fn build(img: &GrayBuf) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let stride = w + 1;
        let mut sums = vec![0f64; stride * (h + 1)];
        let mut squares = vec![0f64; stride * (h + 1)];
        for y in 0..h {
            let mut row_sum = 0f64;
            let mut row_sq = 0f64;
            for x in 0..w {
                let v = img.data()[y * w + x] as f64;
                row_sum += v;
                row_sq += v * v;
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row_sum;
                squares[(y + 1) * stride + x + 1] = squares[y * stride + x + 1] + row_sq;
            }
        }
        Self { width: stride, sums, squares }
    }

    /// Sum and sum-of-squares over the window with top-left `(x, y)`.
    #[inline]
    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (f64, f64) {
        let s = self.width;
        let a = y * s + x;
        let b = y * s + x + w;
        let c = (y + h) * s + x;
        let d = (y + h) * s + x + w;
        (
            self.sums[d] - self.sums[b] - self.sums[c] + self.sums[a],
            self.squares[d] - self.squares[b] - self.squares[c] + self.squares[a],
        )
    }
}

/// Compute the NCC map of `templ` slid over `source`.
///
/// Returns `None` when the template does not fit inside the source (the
/// caller treats this as "no match", not an error).  The map has dimensions
/// `(source.w - templ.w + 1, source.h - templ.h + 1)`.
pub fn match_template(source: &GrayBuf, templ: &GrayBuf) -> Option<GrayBuf> {
    let (sw, sh) = (source.width() as usize, source.height() as usize);
    let (tw, th) = (templ.width() as usize, templ.height() as usize);
    if tw == 0 || th == 0 || tw > sw || th > sh {
        return None;
    }

    let n = (tw * th) as f64;
    let t_sum: f64 = templ.data().iter().map(|&v| v as f64).sum();
    let t_mean = t_sum / n;
    let t_var: f64 = templ
        .data()
        .iter()
        .map(|&v| {
            let d = v as f64 - t_mean;
            d * d
        })
        .sum();
    // per-pixel variance below one gray level counts as constant
    let t_flat = t_var / n < 1.0;

    let integral = Integral::build(source);
    let (ow, oh) = (sw - tw + 1, sh - th + 1);
    let src = source.data();
    let tpl = templ.data();

    let mut out = vec![0f32; ow * oh];
    out.par_chunks_mut(ow).enumerate().for_each(|(y, row)| {
        for (x, cell) in row.iter_mut().enumerate() {
            // direct cross-correlation for this window
            let mut cross = 0f64;
            for v in 0..th {
                let src_row = &src[(y + v) * sw + x..(y + v) * sw + x + tw];
                let tpl_row = &tpl[v * tw..v * tw + tw];
                for u in 0..tw {
                    cross += src_row[u] as f64 * tpl_row[u] as f64;
                }
            }
            let (w_sum, w_sq) = integral.window(x, y, tw, th);
            let numerator = cross - t_mean * w_sum;
            let w_var = w_sq - w_sum * w_sum / n;
            let w_flat = w_var / n < 1.0;
            *cell = match (t_flat, w_flat) {
                (true, true) => {
                    let diff = (t_mean - w_sum / n).abs() / 255.0;
                    (1.0 - diff).max(-1.0) as f32
                }
                (false, false) => {
                    let denom = (t_var * w_var).sqrt();
                    if denom > 1e-8 {
                        (numerator / denom) as f32
                    } else {
                        0.0
                    }
                }
                _ => 0.0,
            };
        }
    });

    Some(GrayBuf::new(ow as u32, oh as u32, out))
}

/// Locate the extrema of a map: `(min, max, min_loc, max_loc)`.
pub fn min_max_loc(map: &GrayBuf) -> (f32, f32, (u32, u32), (u32, u32)) {
    let w = map.width();
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut min_loc = (0, 0);
    let mut max_loc = (0, 0);
    for (i, &v) in map.data().iter().enumerate() {
        let loc = (i as u32 % w, i as u32 / w);
        if v < min {
            min = v;
            min_loc = loc;
        }
        if v > max {
            max = v;
            max_loc = loc;
        }
    }
    (min, max, min_loc, max_loc)
}

/// Zero a `w x h` square centred on `center` so the location cannot win
/// another round of `min_max_loc`.  The centred shape (rather than the full
/// match rectangle) is the intended non-max-suppression contract.
pub fn suppress_centered(map: &mut GrayBuf, center: (u32, u32), w: u32, h: u32) {
    let (cx, cy) = (center.0 as i64, center.1 as i64);
    let x0 = (cx - w as i64 / 2).max(0) as u32;
    let y0 = (cy - h as i64 / 2).max(0) as u32;
    let x1 = ((cx + w as i64 / 2 + 1).max(0) as u32).min(map.width());
    let y1 = ((cy + h as i64 / 2 + 1).max(0) as u32).min(map.height());
    for y in y0..y1 {
        for x in x0..x1 {
            map.set(x, y, 0.0);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // quadratic in (x, y): no two windows repeat under translation
    fn gradient(w: u32, h: u32) -> GrayBuf {
        let data = (0..w * h)
            .map(|i| {
                let (x, y) = (i % w, i / w);
                ((x * x * 5 + y * y * 3 + x * 7 + y * 13) % 251) as f32
            })
            .collect();
        GrayBuf::new(w, h, data)
    }

    #[test]
    fn test_exact_patch_scores_one() {
        let src = gradient(40, 30);
        let mut tpl = vec![0f32; 10 * 8];
        for y in 0..8u32 {
            for x in 0..10u32 {
                tpl[(y * 10 + x) as usize] = src.at(x + 12, y + 9);
            }
        }
        let map = match_template(&src, &GrayBuf::new(10, 8, tpl)).unwrap();
        let (_, max, _, max_loc) = min_max_loc(&map);
        assert!(max > 0.999, "self-match must score ~1, got {max}");
        assert_eq!(max_loc, (12, 9));
    }

    #[test]
    fn test_map_dimensions() {
        let src = gradient(20, 15);
        let tpl = gradient(5, 4);
        let map = match_template(&src, &tpl).unwrap();
        assert_eq!((map.width(), map.height()), (16, 12));
    }

    #[test]
    fn test_template_larger_than_source() {
        let src = gradient(5, 5);
        let tpl = gradient(6, 4);
        assert!(match_template(&src, &tpl).is_none());
    }

    #[test]
    fn test_flat_window_textured_template_scores_zero() {
        let src = GrayBuf::new(10, 10, vec![100.0; 100]);
        let tpl = gradient(3, 3);
        let map = match_template(&src, &tpl).unwrap();
        let (_, max, _, _) = min_max_loc(&map);
        assert_eq!(max, 0.0);
    }

    #[test]
    fn test_flat_on_flat_uses_mean_agreement() {
        let src = GrayBuf::new(8, 8, vec![100.0; 64]);
        let same = GrayBuf::new(3, 3, vec![100.0; 9]);
        let map = match_template(&src, &same).unwrap();
        assert!(min_max_loc(&map).1 > 0.999);
        let darker = GrayBuf::new(3, 3, vec![49.0; 9]);
        let map = match_template(&src, &darker).unwrap();
        let expected = 1.0 - 51.0 / 255.0;
        assert!((min_max_loc(&map).1 - expected).abs() < 1e-3);
    }

    #[test]
    fn test_flat_patch_localises_in_textured_source() {
        // a flat patch inside a textured image is found at its own position
        let mut src = gradient(30, 30);
        for y in 10..18u32 {
            for x in 6..14u32 {
                src.set(x, y, 200.0);
            }
        }
        let tpl = GrayBuf::new(8, 8, vec![200.0; 64]);
        let map = match_template(&src, &tpl).unwrap();
        let (_, max, _, max_loc) = min_max_loc(&map);
        assert!(max > 0.999);
        assert_eq!(max_loc, (6, 10));
    }

    #[test]
    fn test_scores_bounded() {
        let src = gradient(30, 30);
        let tpl = {
            // unrelated pattern
            let data = (0..25).map(|i| ((i * 97) % 255) as f32).collect();
            GrayBuf::new(5, 5, data)
        };
        let map = match_template(&src, &tpl).unwrap();
        for &v in map.data() {
            assert!((-1.0001..=1.0001).contains(&v), "out of range: {v}");
        }
    }

    #[test]
    fn test_suppress_centered() {
        let mut map = GrayBuf::new(10, 10, vec![0.5; 100]);
        suppress_centered(&mut map, (5, 5), 4, 4);
        assert_eq!(map.at(5, 5), 0.0);
        assert_eq!(map.at(3, 3), 0.0);
        assert_eq!(map.at(7, 7), 0.0);
        assert_eq!(map.at(0, 0), 0.5);
        assert_eq!(map.at(9, 9), 0.5);
        // suppression near a corner must clip, not panic
        suppress_centered(&mut map, (0, 0), 6, 6);
        assert_eq!(map.at(1, 1), 0.0);
    }
}

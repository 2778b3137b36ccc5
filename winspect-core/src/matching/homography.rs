//! Planar homography estimation from paired keypoints.
//!
//! Normalised DLT (Hartley) fitted through the smallest eigenvector of
//! `A^T A` (Jacobi rotations on the symmetric 9x9 system), wrapped in a
//! RANSAC loop with a fixed reprojection threshold.  The random sampling is
//! driven by a deterministic xorshift generator, so estimation is
//! reproducible run to run.

/// A 3x3 projective transform, row-major.
#[derive(Debug, Clone, Copy)]
pub struct Homography {
    pub m: [[f64; 3]; 3],
}

impl Homography {
    /// Map a point through the transform.  Points at infinity (w ~ 0)
    /// map to themselves scaled to a large finite value.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let u = self.m[0][0] * x + self.m[0][1] * y + self.m[0][2];
        let v = self.m[1][0] * x + self.m[1][1] * y + self.m[1][2];
        let w = self.m[2][0] * x + self.m[2][1] * y + self.m[2][2];
        if w.abs() < 1e-12 {
            (u * 1e12, v * 1e12)
        } else {
            (u / w, v / w)
        }
    }
}

// ---------------------------------------------------------------------------
// Jacobi eigen decomposition (symmetric 9x9)
// ---------------------------------------------------------------------------

/// Eigenvector of the smallest eigenvalue of a symmetric matrix.
fn smallest_eigenvector(mut a: [[f64; 9]; 9]) -> [f64; 9] {
    let mut v = [[0f64; 9]; 9];
    for (i, row) in v.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    for _sweep in 0..64 {
        // largest off-diagonal entry
        let (mut p, mut q, mut max) = (0, 1, 0.0f64);
        for i in 0..9 {
            for j in (i + 1)..9 {
                if a[i][j].abs() > max {
                    max = a[i][j].abs();
                    p = i;
                    q = j;
                }
            }
        }
        if max < 1e-14 {
            break;
        }
        let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
        let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
        let c = 1.0 / (t * t + 1.0).sqrt();
        let s = t * c;
        for k in 0..9 {
            let (akp, akq) = (a[k][p], a[k][q]);
            a[k][p] = c * akp - s * akq;
            a[k][q] = s * akp + c * akq;
        }
        for k in 0..9 {
            let (apk, aqk) = (a[p][k], a[q][k]);
            a[p][k] = c * apk - s * aqk;
            a[q][k] = s * apk + c * aqk;
        }
        for k in 0..9 {
            let (vkp, vkq) = (v[k][p], v[k][q]);
            v[k][p] = c * vkp - s * vkq;
            v[k][q] = s * vkp + c * vkq;
        }
    }
    let mut min_i = 0;
    for i in 1..9 {
        if a[i][i] < a[min_i][min_i] {
            min_i = i;
        }
    }
    let mut out = [0f64; 9];
    for k in 0..9 {
        out[k] = v[k][min_i];
    }
    out
}

// ---------------------------------------------------------------------------
// DLT
// ---------------------------------------------------------------------------

/// Similarity normalisation: centroid to origin, mean distance sqrt(2).
fn normalise(points: &[(f64, f64)]) -> ([[f64; 3]; 3], Vec<(f64, f64)>) {
    let n = points.len() as f64;
    let (cx, cy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), &(x, y)| (sx + x / n, sy + y / n));
    let mean_dist = points
        .iter()
        .map(|&(x, y)| ((x - cx).powi(2) + (y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = [[s, 0.0, -s * cx], [0.0, s, -s * cy], [0.0, 0.0, 1.0]];
    let mapped = points.iter().map(|&(x, y)| (s * (x - cx), s * (y - cy))).collect();
    (t, mapped)
}

fn mat_mul(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0f64; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

fn invert_similarity(t: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    // T = [s 0 tx; 0 s ty; 0 0 1] inverts in closed form
    let s = t[0][0];
    [
        [1.0 / s, 0.0, -t[0][2] / s],
        [0.0, 1.0 / s, -t[1][2] / s],
        [0.0, 0.0, 1.0],
    ]
}

/// Least-squares DLT over all correspondences (needs at least 4).
pub fn fit_homography(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Homography> {
    if src.len() < 4 || src.len() != dst.len() {
        return None;
    }
    let (t_src, ns) = normalise(src);
    let (t_dst, nd) = normalise(dst);

    // accumulate A^T A directly; rows come in pairs per correspondence
    let mut ata = [[0f64; 9]; 9];
    let mut add_row = |row: [f64; 9]| {
        for i in 0..9 {
            for j in 0..9 {
                ata[i][j] += row[i] * row[j];
            }
        }
    };
    for (&(x, y), &(u, v)) in ns.iter().zip(nd.iter()) {
        add_row([-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u]);
        add_row([0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v]);
    }

    let h = smallest_eigenvector(ata);
    let hn = [
        [h[0], h[1], h[2]],
        [h[3], h[4], h[5]],
        [h[6], h[7], h[8]],
    ];
    let m = mat_mul(&mat_mul(&invert_similarity(&t_dst), &hn), &t_src);
    if !m.iter().flatten().all(|v| v.is_finite()) || m[2][2].abs() < 1e-12 {
        return None;
    }
    // scale so m[2][2] == 1
    let scale = m[2][2];
    let mut out = m;
    for row in &mut out {
        for cell in row.iter_mut() {
            *cell /= scale;
        }
    }
    Some(Homography { m: out })
}

// ---------------------------------------------------------------------------
// RANSAC
// ---------------------------------------------------------------------------

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}

/// RANSAC homography: returns the transform fitted on the best minimal
/// sample and the inlier mask (reprojection error below `threshold`).
///
/// `None` when fewer than 4 pairs are given or no consensus of at least 4
/// inliers exists -- the caller treats that as a match failure.
pub fn find_homography_ransac(
    src: &[(f64, f64)],
    dst: &[(f64, f64)],
    threshold: f64,
) -> Option<(Homography, Vec<bool>)> {
    let n = src.len();
    if n < 4 || n != dst.len() {
        return None;
    }

    let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
    let max_iters = 2000usize;
    let mut best_mask: Option<Vec<bool>> = None;
    let mut best_h: Option<Homography> = None;
    let mut best_count = 0usize;
    let mut iters = max_iters;

    let mut it = 0usize;
    while it < iters {
        it += 1;
        // four distinct indices
        let mut idx = [0usize; 4];
        let mut taken = 0;
        while taken < 4 {
            let cand = rng.below(n);
            if !idx[..taken].contains(&cand) {
                idx[taken] = cand;
                taken += 1;
            }
        }
        let s: Vec<_> = idx.iter().map(|&i| src[i]).collect();
        let d: Vec<_> = idx.iter().map(|&i| dst[i]).collect();
        let Some(h) = fit_homography(&s, &d) else { continue };

        let mask: Vec<bool> = src
            .iter()
            .zip(dst.iter())
            .map(|(&(x, y), &(u, v))| {
                let (px, py) = h.apply(x, y);
                ((px - u).powi(2) + (py - v).powi(2)).sqrt() < threshold
            })
            .collect();
        let count = mask.iter().filter(|&&b| b).count();
        if count > best_count {
            best_count = count;
            best_mask = Some(mask);
            best_h = Some(h);
            // adaptive iteration bound, 99.5% confidence
            let w = count as f64 / n as f64;
            let denom = (1.0 - w.powi(4)).max(1e-12).ln();
            if denom < 0.0 {
                let needed = ((1.0f64 - 0.995).ln() / denom).ceil() as usize;
                iters = iters.min(needed.max(it));
            }
        }
    }

    if best_count < 4 {
        return None;
    }
    Some((best_h?, best_mask?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Vec<(f64, f64)> {
        let mut pts = Vec::new();
        for y in 0..5 {
            for x in 0..5 {
                pts.push((x as f64 * 20.0 + 3.0, y as f64 * 17.0 + 5.0));
            }
        }
        pts
    }

    fn affine(pts: &[(f64, f64)], sx: f64, sy: f64, tx: f64, ty: f64) -> Vec<(f64, f64)> {
        pts.iter().map(|&(x, y)| (x * sx + tx, y * sy + ty)).collect()
    }

    #[test]
    fn test_fit_recovers_scale_translate() {
        let src = grid();
        let dst = affine(&src, 2.0, 0.5, 30.0, -12.0);
        let h = fit_homography(&src, &dst).unwrap();
        for (&(x, y), &(u, v)) in src.iter().zip(dst.iter()) {
            let (px, py) = h.apply(x, y);
            assert!((px - u).abs() < 1e-6 && (py - v).abs() < 1e-6);
        }
    }

    #[test]
    fn test_fit_needs_four_points() {
        let src = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)];
        let dst = src;
        assert!(fit_homography(&src, &dst).is_none());
    }

    #[test]
    fn test_ransac_flags_outliers() {
        let src = grid();
        let mut dst = affine(&src, 1.5, 1.5, 10.0, 20.0);
        // corrupt three correspondences
        dst[3] = (999.0, 999.0);
        dst[11] = (-500.0, 40.0);
        dst[20] = (0.0, -900.0);
        let (h, mask) = find_homography_ransac(&src, &dst, 5.0).unwrap();
        assert!(!mask[3] && !mask[11] && !mask[20]);
        assert_eq!(mask.iter().filter(|&&b| b).count(), src.len() - 3);
        let (px, py) = h.apply(src[0].0, src[0].1);
        assert!((px - dst[0].0).abs() < 1.0 && (py - dst[0].1).abs() < 1.0);
    }

    #[test]
    fn test_ransac_rejects_pure_noise_consensus() {
        // four wildly inconsistent pairs still fit one exact homography,
        // but five inconsistent pairs cannot reach a 4-inlier consensus
        // beyond the sample itself; accept either outcome shape
        let src = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0), (10.0, 10.0), (5.0, 5.0)];
        let dst = [(3.0, 97.0), (-40.0, 2.0), (55.0, -8.0), (0.3, 0.4), (1000.0, -1000.0)];
        if let Some((_, mask)) = find_homography_ransac(&src, &dst, 5.0) {
            assert!(mask.iter().filter(|&&b| b).count() >= 4);
        }
    }

    #[test]
    fn test_ransac_too_few_points() {
        let src = [(0.0, 0.0), (1.0, 1.0), (2.0, 2.0)];
        let dst = src;
        assert!(find_homography_ransac(&src, &dst, 5.0).is_none());
    }
}

//! Exact Euclidean distance transform of an edge map.
//!
//! Separable lower-envelope-of-parabolas algorithm (Felzenszwalb and
//! Huttenlocher): one pass over columns, one over rows, on squared distances.

use nalgebra::DMatrix;

/// Stand-in for infinity; finite so that parabola intersections stay finite.
const FAR: f64 = 1e20;

/// Euclidean distance (in pixels) from every pixel to the nearest `true` pixel.
///
/// With no edge pixels at all the field is filled with the image diagonal,
/// the largest distance any edge inside the image could be.
pub fn distance_transform(mask: &DMatrix<bool>) -> DMatrix<f64> {
    let (rows, cols) = mask.shape();
    let diagonal = ((rows * rows + cols * cols) as f64).sqrt();
    if !mask.iter().any(|&m| m) {
        return DMatrix::from_element(rows, cols, diagonal);
    }

    let mut squared = DMatrix::from_fn(rows, cols, |v, u| if mask[(v, u)] { 0.0 } else { FAR });
    let n = rows.max(cols);
    let mut scratch = Envelope::with_capacity(n);
    let mut line = vec![0.0; n];
    let mut out = vec![0.0; n];

    for u in 0..cols {
        for v in 0..rows {
            line[v] = squared[(v, u)];
        }
        scratch.transform(&line[..rows], &mut out[..rows]);
        for v in 0..rows {
            squared[(v, u)] = out[v];
        }
    }
    for v in 0..rows {
        for u in 0..cols {
            line[u] = squared[(v, u)];
        }
        scratch.transform(&line[..cols], &mut out[..cols]);
        for u in 0..cols {
            squared[(v, u)] = out[u];
        }
    }

    squared.map(|d| d.sqrt().min(diagonal))
}

struct Envelope {
    vertices: Vec<usize>,
    boundaries: Vec<f64>,
}

impl Envelope {
    fn with_capacity(n: usize) -> Self {
        Self {
            vertices: vec![0; n],
            boundaries: vec![0.0; n + 1],
        }
    }

    /// 1D squared distance transform of sampled function `f` into `d`.
    fn transform(&mut self, f: &[f64], d: &mut [f64]) {
        let n = f.len();
        if n == 0 {
            return;
        }
        let v = &mut self.vertices;
        let z = &mut self.boundaries;
        let intersect = |q: usize, p: usize| {
            let (qf, pf) = (q as f64, p as f64);
            ((f[q] + qf * qf) - (f[p] + pf * pf)) / (2.0 * qf - 2.0 * pf)
        };

        let mut k = 0usize;
        v[0] = 0;
        z[0] = f64::NEG_INFINITY;
        z[1] = f64::INFINITY;
        for q in 1..n {
            let mut s = intersect(q, v[k]);
            while s <= z[k] {
                k -= 1;
                s = intersect(q, v[k]);
            }
            k += 1;
            v[k] = q;
            z[k] = s;
            z[k + 1] = f64::INFINITY;
        }

        k = 0;
        for (q, out) in d.iter_mut().enumerate() {
            while z[k + 1] < q as f64 {
                k += 1;
            }
            let diff = q as f64 - v[k] as f64;
            *out = diff * diff + f[v[k]];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn brute_force(mask: &DMatrix<bool>) -> DMatrix<f64> {
        let (rows, cols) = mask.shape();
        DMatrix::from_fn(rows, cols, |v, u| {
            let mut best = f64::INFINITY;
            for ev in 0..rows {
                for eu in 0..cols {
                    if mask[(ev, eu)] {
                        let dv = v as f64 - ev as f64;
                        let du = u as f64 - eu as f64;
                        best = best.min((dv * dv + du * du).sqrt());
                    }
                }
            }
            best
        })
    }

    #[test]
    fn test_single_edge_pixel() {
        let mut mask = DMatrix::from_element(7, 9, false);
        mask[(3, 4)] = true;
        let dt = distance_transform(&mask);
        assert_relative_eq!(dt[(3, 4)], 0.0);
        assert_relative_eq!(dt[(3, 7)], 3.0);
        assert_relative_eq!(dt[(0, 0)], (9.0f64 + 16.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_matches_brute_force() {
        let mut mask = DMatrix::from_element(12, 15, false);
        for &(v, u) in &[(0, 0), (5, 7), (11, 14), (2, 12), (9, 3)] {
            mask[(v, u)] = true;
        }
        let dt = distance_transform(&mask);
        let expected = brute_force(&mask);
        for (a, b) in dt.iter().zip(expected.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_no_edges_clamped() {
        let mask = DMatrix::from_element(3, 4, false);
        let dt = distance_transform(&mask);
        assert!(dt.iter().all(|&d| (d - 5.0).abs() < 1e-12));
    }
}

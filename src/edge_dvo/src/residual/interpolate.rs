//! Sub-pixel image sampling.

use nalgebra::DMatrix;

/// Bilinearly interpolate `image` at `(u, v)`.
///
/// Returns `None` unless all four neighbouring pixels exist.
pub fn bilinear(image: &DMatrix<f64>, u: f64, v: f64) -> Option<f64> {
    if !(u >= 0.0 && v >= 0.0) {
        return None;
    }
    let (rows, cols) = image.shape();
    let u0 = u.floor() as usize;
    let v0 = v.floor() as usize;
    if u0 + 1 >= cols || v0 + 1 >= rows {
        return None;
    }
    let du = u - u0 as f64;
    let dv = v - v0 as f64;

    let top = image[(v0, u0)] * (1.0 - du) + image[(v0, u0 + 1)] * du;
    let bottom = image[(v0 + 1, u0)] * (1.0 - du) + image[(v0 + 1, u0 + 1)] * du;
    Some(top * (1.0 - dv) + bottom * dv)
}

/// Value of the pixel nearest to `(u, v)`.
pub fn nearest(image: &DMatrix<f64>, u: f64, v: f64) -> Option<f64> {
    if !(u >= -0.5 && v >= -0.5) {
        return None;
    }
    let (rows, cols) = image.shape();
    let ui = u.round() as usize;
    let vi = v.round() as usize;
    if ui >= cols || vi >= rows {
        return None;
    }
    Some(image[(vi, ui)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bilinear_plane_is_exact() {
        let image = DMatrix::from_fn(6, 8, |v, u| 3.0 * u as f64 - 2.0 * v as f64 + 1.0);
        let value = bilinear(&image, 2.3, 4.6).unwrap();
        assert_relative_eq!(value, 3.0 * 2.3 - 2.0 * 4.6 + 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_bilinear_at_pixel() {
        let image = DMatrix::from_fn(4, 4, |v, u| (v * 4 + u) as f64);
        assert_relative_eq!(bilinear(&image, 1.0, 2.0).unwrap(), 9.0);
    }

    #[test]
    fn test_bilinear_out_of_bounds() {
        let image = DMatrix::from_element(4, 4, 1.0);
        assert!(bilinear(&image, -0.1, 1.0).is_none());
        assert!(bilinear(&image, 3.0, 1.0).is_none());
        assert!(bilinear(&image, 1.0, f64::NAN).is_none());
    }

    #[test]
    fn test_nearest() {
        let image = DMatrix::from_fn(4, 4, |v, u| (v * 4 + u) as f64);
        assert_eq!(nearest(&image, 1.4, 2.6), Some(13.0));
        assert_eq!(nearest(&image, 3.6, 0.0), None);
    }
}

//! Image gradients by central differences.

use nalgebra::DMatrix;

/// Horizontal and vertical gradients of `image` (rows = v, cols = u).
///
/// Interior pixels use central differences `(I[x+1] - I[x-1]) / 2`; border
/// pixels fall back to one-sided differences. Dimensions of size one yield a
/// zero gradient along that axis.
pub fn image_gradient(image: &DMatrix<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
    let (rows, cols) = image.shape();
    let gx = DMatrix::from_fn(rows, cols, |v, u| {
        if cols < 2 {
            0.0
        } else if u == 0 {
            image[(v, 1)] - image[(v, 0)]
        } else if u == cols - 1 {
            image[(v, u)] - image[(v, u - 1)]
        } else {
            0.5 * (image[(v, u + 1)] - image[(v, u - 1)])
        }
    });
    let gy = DMatrix::from_fn(rows, cols, |v, u| {
        if rows < 2 {
            0.0
        } else if v == 0 {
            image[(1, u)] - image[(0, u)]
        } else if v == rows - 1 {
            image[(v, u)] - image[(v - 1, u)]
        } else {
            0.5 * (image[(v + 1, u)] - image[(v - 1, u)])
        }
    });
    (gx, gy)
}

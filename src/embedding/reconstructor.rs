use ndarray::{Array, Array1, Array2, ArrayView, ArrayView1, ArrayView2, Dimension};

use crate::error::{Result, WatermarkError};

/// `w0 = u_capᵀ · alpha + latent_mean`.
pub fn reconstruct(
    alpha: &ArrayView1<f64>,
    u_cap: &ArrayView2<f64>,
    latent_mean: &ArrayView1<f64>,
) -> Result<Array1<f64>> {
    check_shapes(alpha.len(), u_cap, latent_mean)?;
    Ok(u_cap.t().dot(alpha) + latent_mean)
}

pub fn reconstruct_batch(
    alpha: &ArrayView2<f64>,
    u_cap: &ArrayView2<f64>,
    latent_mean: &ArrayView1<f64>,
) -> Result<Array2<f64>> {
    check_shapes(alpha.ncols(), u_cap, latent_mean)?;
    Ok(alpha.dot(u_cap) + latent_mean)
}

/// `wx = w0 + displacement`. Works row-wise on batches as well.
pub fn apply_watermark<D: Dimension>(
    w0: &ArrayView<f64, D>,
    displacement: &ArrayView<f64, D>,
) -> Result<Array<f64, D>> {
    if w0.shape() != displacement.shape() {
        return Err(WatermarkError::MalformedTensor(format!(
            "latent shape {:?} does not match displacement shape {:?}",
            w0.shape(),
            displacement.shape()
        )));
    }
    let mut wx = w0.to_owned();
    wx += displacement;
    Ok(wx)
}

fn check_shapes(alpha_len: usize, u_cap: &ArrayView2<f64>, latent_mean: &ArrayView1<f64>) -> Result<()> {
    if alpha_len != u_cap.nrows() {
        return Err(WatermarkError::dimension("alpha coefficients", u_cap.nrows(), alpha_len));
    }
    if latent_mean.len() != u_cap.ncols() {
        return Err(WatermarkError::dimension("latent mean", u_cap.ncols(), latent_mean.len()));
    }
    Ok(())
}

//! Batched dense linear algebra over spatial locations.

use burn::prelude::Backend;
use burn::tensor::{Tensor, TensorData};
use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::error::{PadimError, Result};

/// Reads a tensor back to the host as `f32` values in row-major order.
///
/// # Errors
///
/// Returns [`PadimError::TensorData`] if the backend data cannot be converted.
pub fn host_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| PadimError::tensor_data(format!("{e:?}")))
}

/// Inverts a batch of symmetric matrices after adding `epsilon` to the diagonal.
///
/// `covariances` is `[batch, dim, dim]`. Each matrix is regularized as
/// `Σ + ε·I`, factored with Cholesky in `f64` and inverted; the batch is
/// processed in parallel. The result has the same shape.
///
/// # Errors
///
/// - [`PadimError::ShapeMismatch`] if the trailing matrices are not square.
/// - [`PadimError::Numerical`] naming the first location whose regularized
///   matrix is not positive definite, or whose inverse is not finite.
pub fn regularized_inverse<B: Backend>(
    covariances: Tensor<B, 3>,
    epsilon: f64,
) -> Result<Tensor<B, 3>> {
    let [batch, rows, cols] = covariances.dims();
    if rows != cols {
        return Err(PadimError::shape_mismatch(
            format!("[{batch}, {rows}, {rows}]"),
            format!("[{batch}, {rows}, {cols}]"),
        ));
    }
    let device = covariances.device();
    let values = host_values(covariances)?;
    let inverted = spd_inverse_batch(&values, rows, epsilon)?;
    Ok(Tensor::from_data(
        TensorData::new(inverted, [batch, rows, cols]),
        &device,
    ))
}

/// Host-side kernel behind [`regularized_inverse`] on flat row-major storage.
///
/// # Errors
///
/// Same as [`regularized_inverse`].
#[allow(clippy::cast_possible_truncation)]
pub fn spd_inverse_batch(values: &[f32], dim: usize, epsilon: f64) -> Result<Vec<f32>> {
    let block = dim * dim;
    if block == 0 || values.len() % block != 0 {
        return Err(PadimError::shape_mismatch(
            format!("multiple of {block} values"),
            values.len().to_string(),
        ));
    }

    let mut out = vec![0.0_f32; values.len()];
    out.par_chunks_exact_mut(block)
        .zip(values.par_chunks_exact(block))
        .enumerate()
        .try_for_each(|(location, (dst, src))| {
            let mut matrix = DMatrix::from_row_iterator(dim, dim, src.iter().map(|&v| f64::from(v)));
            for i in 0..dim {
                matrix[(i, i)] += epsilon;
            }
            let inverse = matrix
                .cholesky()
                .ok_or_else(|| {
                    PadimError::numerical(format!(
                        "covariance at location {location} is not positive definite after regularization (epsilon = {epsilon})"
                    ))
                })?
                .inverse();

            for (i, slot) in dst.iter_mut().enumerate() {
                let value = inverse[(i / dim, i % dim)];
                if !value.is_finite() {
                    return Err(PadimError::numerical(format!(
                        "inverse covariance at location {location} is not finite"
                    )));
                }
                *slot = value as f32;
            }
            Ok(())
        })?;

    Ok(out)
}

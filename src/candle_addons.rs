//! # Custom addons module to Candle
//!
//! #### Features
//! - `log_sigmoid`: a numerically stable `log(sigmoid(x))`
//! - `masked_fill`: fill positions of a tensor where a mask is set
//! - `causal_mask`: an upper-triangular mask for causal self-attention
use candle_core::{Device, Result, Tensor};

/// Computes `log(sigmoid(xs))` elementwise.
///
/// Uses `log_sigmoid(x) = min(x, 0) - log(1 + exp(-|x|))` so that large
/// negative inputs do not underflow to `log(0)`.
pub fn log_sigmoid(xs: &Tensor) -> Result<Tensor> {
    let min_x_zero = xs.neg()?.relu()?.neg()?;
    let log_term = (xs.abs()?.neg()?.exp()? + 1.0)?.log()?;
    min_x_zero - log_term
}

/// Replaces entries of `on_false` with `on_true` wherever `mask` is non-zero.
pub fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let shape = mask.shape();
    let on_true = Tensor::new(on_true, on_false.device())?
        .to_dtype(on_false.dtype())?
        .broadcast_as(shape.dims())?;
    mask.where_cond(&on_true, on_false)
}

/// Returns a `(size, size)` u8 mask with ones strictly above the diagonal.
pub fn causal_mask(size: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<u8> = (0..size)
        .flat_map(|i| (0..size).map(move |j| u8::from(j > i)))
        .collect();
    Tensor::from_slice(&mask, (size, size), device)
}

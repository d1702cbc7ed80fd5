// SPDX-License-Identifier: MIT OR Apache-2.0

//! Flatten/unflatten between positional and head-split layouts.
//!
//! Interventions see a flat feature axis; activations carry positions and
//! heads as separate axes. These helpers convert between the two and are
//! exact inverses of each other (pure reshapes and permutes, no arithmetic).

use candle_core::Tensor;

use crate::error::{MIError, Result};

/// `[b, s, d]` -> `[b, s * d]`.
///
/// # Errors
///
/// Returns [`MIError::Model`] if the tensor is not rank 3.
pub fn bsd_to_b_sd(tensor: &Tensor) -> Result<Tensor> {
    let (b, s, d) = tensor.dims3()?;
    Ok(tensor.reshape((b, s * d))?)
}

/// `[b, s * d]` -> `[b, s, d]`.
///
/// # Errors
///
/// Returns [`MIError::Unit`] if the flat axis is not a multiple of `s`.
pub fn b_sd_to_bsd(tensor: &Tensor, s: usize) -> Result<Tensor> {
    let (b, sd) = tensor.dims2()?;
    if s == 0 || sd % s != 0 {
        return Err(MIError::Unit(format!("cannot split flat axis {sd} into {s} units")));
    }
    Ok(tensor.reshape((b, s, sd / s))?)
}

/// `[b, h, s, d]` -> `[b, s, h * d]`.
///
/// # Errors
///
/// Returns [`MIError::Model`] if the tensor is not rank 4.
pub fn bhsd_to_bs_hd(tensor: &Tensor) -> Result<Tensor> {
    let (b, h, s, d) = tensor.dims4()?;
    Ok(tensor.permute((0, 2, 1, 3))?.reshape((b, s, h * d))?)
}

/// `[b, s, h * d]` -> `[b, h, s, d]`.
///
/// # Errors
///
/// Returns [`MIError::Unit`] if the merged axis is not a multiple of `h`.
pub fn bs_hd_to_bhsd(tensor: &Tensor, h: usize) -> Result<Tensor> {
    let (b, s, hd) = tensor.dims3()?;
    if h == 0 || hd % h != 0 {
        return Err(MIError::Unit(format!("cannot split merged axis {hd} into {h} heads")));
    }
    Ok(tensor.reshape((b, s, h, hd / h))?.permute((0, 2, 1, 3))?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

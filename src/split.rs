// SPDX-License-Identifier: MIT OR Apache-2.0

//! Subcomponent slicing along the last axis.
//!
//! Components that share storage with others (a query projection inside a
//! fused QKV output, one head inside a merged head axis) declare up to two
//! split specs. [`split`] applies them to a raw activation;
//! [`feature_window`] applies them to an index tensor to find which part of
//! the raw feature axis a component owns.

use candle_core::{D, Device, Tensor};
use tracing::debug;

use crate::error::{MIError, Result};
use crate::layout::{ModelContext, SplitFn, SplitSpec};

/// Maximum number of split specs a component may declare.
pub const MAX_SPLITS: usize = 2;

/// Apply one split function.
///
/// # Shapes
/// - `Half`, `Three`: `[..., d]` -> `[..., d / k]`
/// - `HeadAndPermute`: `[batch, seq, n * d]` -> `[batch, n, seq, d]`
///
/// # Errors
///
/// Returns [`MIError::UnsupportedSplit`] when the last axis does not divide
/// evenly or the slot is out of range.
pub fn apply_split(
    tensor: &Tensor,
    func: SplitFn,
    param: usize,
    component: &str,
) -> Result<Tensor> {
    let last = tensor.dim(D::Minus1)?;
    let unsupported = |reason: String| MIError::UnsupportedSplit {
        component: component.to_owned(),
        reason,
    };
    match func {
        SplitFn::Half | SplitFn::Three => {
            let parts = if func == SplitFn::Half { 2 } else { 3 };
            if param >= parts {
                return Err(unsupported(format!("slot {param} out of {parts} parts")));
            }
            if last % parts != 0 {
                return Err(unsupported(format!("last axis {last} not divisible by {parts}")));
            }
            let size = last / parts;
            Ok(tensor.narrow(D::Minus1, param * size, size)?)
        }
        SplitFn::HeadAndPermute => {
            if param == 0 || last % param != 0 {
                return Err(unsupported(format!(
                    "last axis {last} not divisible into {param} heads"
                )));
            }
            let (b, s, _) = tensor.dims3()?;
            Ok(tensor
                .reshape((b, s, param, last / param))?
                .permute((0, 2, 1, 3))?)
        }
    }
}

fn checked_splits<'s>(splits: &'s [SplitSpec], component: &str) -> Result<&'s [SplitSpec]> {
    if splits.len() > MAX_SPLITS {
        return Err(MIError::UnsupportedSplit {
            component: component.to_owned(),
            reason: format!("{} split specs declared, at most {MAX_SPLITS} allowed", splits.len()),
        });
    }
    Ok(splits)
}

/// Extract the subcomponent of `tensor` that `component` refers to.
///
/// Unregistered components and components without split specs come back
/// unchanged.
///
/// # Errors
///
/// Returns [`MIError::UnsupportedSplit`] if more than two split specs are
/// declared or a split does not fit the tensor.
pub fn split(tensor: &Tensor, component: &str, ctx: &ModelContext<'_>) -> Result<Tensor> {
    let Some(descriptor) = ctx.descriptor(component) else {
        return Ok(tensor.clone());
    };
    let mut out = tensor.clone();
    for spec in checked_splits(&descriptor.splits, component)? {
        let param = ctx.split_param(&spec.param)?;
        out = apply_split(&out, spec.func, param, component)?;
    }
    Ok(out)
}

/// Part of the raw feature axis owned by a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureWindow {
    /// First owned feature index.
    pub start: usize,
    /// One past the last owned feature index.
    pub end: usize,
    /// Axis 1 of the split index tensor (the head count after a head split).
    pub n_heads: usize,
    /// Last axis of the split index tensor (the per-head width).
    pub head_dim: usize,
}

impl FeatureWindow {
    /// Width of the window.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the window is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Run the splitter over `arange(features)` shaped `[1, 1, features]` and
/// report the window it selects.
///
/// # Errors
///
/// Returns the splitter's errors, or [`MIError::Unit`] for an empty feature
/// axis.
pub fn feature_window(
    features: usize,
    component: &str,
    ctx: &ModelContext<'_>,
) -> Result<FeatureWindow> {
    let n = u32::try_from(features)
        .map_err(|_| {
            MIError::Unit(format!("feature axis of {features} does not fit u32 indices"))
        })?;
    let meta = Tensor::arange(0u32, n, &Device::Cpu)?.reshape((1, 1, features))?;
    let meta = split(&meta, component, ctx)?;

    let dims = meta.dims().to_vec();
    let flat: Vec<u32> = meta.flatten_all()?.to_vec1()?;
    let (Some(min), Some(max)) = (flat.iter().min(), flat.iter().max()) else {
        return Err(MIError::Unit(format!("component `{component}` selects no features")));
    };
    let window = FeatureWindow {
        start: *min as usize,
        end: *max as usize + 1,
        n_heads: dims.get(1).copied().unwrap_or(1),
        head_dim: dims.last().copied().unwrap_or(features),
    };
    debug!(component, features, ?window, "feature window");
    Ok(window)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

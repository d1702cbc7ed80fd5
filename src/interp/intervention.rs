// SPDX-License-Identifier: MIT OR Apache-2.0

//! Intervention types and stock transforms.
//!
//! An [`Intervention`] is a tagged wrapper around a [`Transform`]:
//!
//! - [`Intervention::Functional`]: the transform owns its tensor contract;
//!   the dispatcher calls it as-is.
//! - [`Intervention::Structured`]: the dispatcher flattens position/head
//!   axes into the feature axis before the call and restores them after,
//!   unless the intervention opts out with `keep_last_dim` or `localist`.
//!
//! Stock transforms:
//!
//! | Constructor | Result |
//! |-------------|--------|
//! | [`Intervention::vanilla`] | `source` |
//! | [`Intervention::addition`] | `base + source` |
//! | [`Intervention::subtraction`] | `base - source` |
//! | [`Intervention::zero`] | zeros |
//! | [`Intervention::scale`] | `base * factor` |
//!
//! Stock transforms honour subspaces: given per-batch feature indices, only
//! those features take the transformed value and the rest keep `base`.

use std::collections::HashMap;
use std::fmt;

use candle_core::{D, Tensor};

use crate::error::{MIError, Result};

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Named auxiliary tensors passed to or returned by a transform.
pub type Extra = HashMap<String, Tensor>;

/// Intervened tensor plus auxiliary outputs.
#[derive(Debug, Clone)]
pub struct InterventionOutput {
    /// The intervened representation.
    pub output: Tensor,
    /// Side outputs (e.g. a latent or a loss term), passed through untouched.
    pub aux: Extra,
}

/// What a transform returns.
#[derive(Debug, Clone)]
pub enum Intervened {
    /// A bare tensor.
    Tensor(Tensor),
    /// A tensor with auxiliary outputs.
    Structured(InterventionOutput),
}

impl Intervened {
    /// The intervened tensor.
    #[must_use]
    pub const fn tensor(&self) -> &Tensor {
        match self {
            Self::Tensor(t) => t,
            Self::Structured(out) => &out.output,
        }
    }

    /// Consume and return the intervened tensor, dropping auxiliary outputs.
    #[must_use]
    pub fn into_tensor(self) -> Tensor {
        match self {
            Self::Tensor(t) => t,
            Self::Structured(out) => out.output,
        }
    }

    /// Auxiliary outputs, if any.
    #[must_use]
    pub const fn aux(&self) -> Option<&Extra> {
        match self {
            Self::Tensor(_) => None,
            Self::Structured(out) => Some(&out.aux),
        }
    }

    /// Replace the tensor, keeping the wrapping and any auxiliary outputs.
    ///
    /// # Errors
    ///
    /// Propagates the error of `f`.
    pub fn map_tensor(self, f: impl FnOnce(Tensor) -> Result<Tensor>) -> Result<Self> {
        Ok(match self {
            Self::Tensor(t) => Self::Tensor(f(t)?),
            Self::Structured(out) => Self::Structured(InterventionOutput {
                output: f(out.output)?,
                aux: out.aux,
            }),
        })
    }
}

impl From<Tensor> for Intervened {
    fn from(t: Tensor) -> Self {
        Self::Tensor(t)
    }
}

// ---------------------------------------------------------------------------
// Transform
// ---------------------------------------------------------------------------

/// A transformation of a base representation given a source representation.
///
/// `subspaces`, when present, holds one row of feature indices per batch
/// element. Implemented for every matching closure:
///
/// ```
/// use candle_core::Tensor;
/// use candle_intervene::interp::intervention::{Extra, Intervened, Intervention};
///
/// let swap = Intervention::functional(
///     |_base: &Tensor, source: &Tensor, _subspaces: Option<&[Vec<usize>]>, _extra: &Extra| {
///         Ok(Intervened::from(source.clone()))
///     },
/// );
/// assert!(swap.is_functional());
/// ```
pub trait Transform: Send + Sync {
    /// Apply the transform.
    ///
    /// # Errors
    ///
    /// Implementations report shape or dtype problems as
    /// [`MIError::Intervention`] or [`MIError::Model`].
    fn apply(
        &self,
        base: &Tensor,
        source: &Tensor,
        subspaces: Option<&[Vec<usize>]>,
        extra: &Extra,
    ) -> Result<Intervened>;
}

impl<F> Transform for F
where
    F: Fn(&Tensor, &Tensor, Option<&[Vec<usize>]>, &Extra) -> Result<Intervened> + Send + Sync,
{
    fn apply(
        &self,
        base: &Tensor,
        source: &Tensor,
        subspaces: Option<&[Vec<usize>]>,
        extra: &Extra,
    ) -> Result<Intervened> {
        self(base, source, subspaces, extra)
    }
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// A transform plus the flags the dispatcher needs to shape its inputs.
pub enum Intervention {
    /// Called directly, no flattening.
    Functional(Box<dyn Transform>),
    /// Called on flattened representations.
    Structured {
        /// The transformation.
        transform: Box<dyn Transform>,
        /// Keep the activation's axes instead of merging into the last one.
        keep_last_dim: bool,
        /// Operates on localist (non-distributed) units; never flattened.
        localist: bool,
    },
}

impl fmt::Debug for Intervention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Functional(_) => f.write_str("Intervention::Functional(..)"),
            Self::Structured {
                keep_last_dim,
                localist,
                ..
            } => f
                .debug_struct("Intervention::Structured")
                .field("keep_last_dim", keep_last_dim)
                .field("localist", localist)
                .finish_non_exhaustive(),
        }
    }
}

impl Intervention {
    /// Wrap a transform that handles its own shapes.
    #[must_use]
    pub fn functional(transform: impl Transform + 'static) -> Self {
        Self::Functional(Box::new(transform))
    }

    /// Wrap a transform that expects flattened representations.
    #[must_use]
    pub fn structured(transform: impl Transform + 'static) -> Self {
        Self::Structured {
            transform: Box::new(transform),
            keep_last_dim: false,
            localist: false,
        }
    }

    /// Set `keep_last_dim`. No effect on functional interventions.
    #[must_use]
    pub fn with_keep_last_dim(mut self, keep: bool) -> Self {
        if let Self::Structured { keep_last_dim, .. } = &mut self {
            *keep_last_dim = keep;
        }
        self
    }

    /// Set `localist`. No effect on functional interventions.
    #[must_use]
    pub fn with_localist(mut self, value: bool) -> Self {
        if let Self::Structured { localist, .. } = &mut self {
            *localist = value;
        }
        self
    }

    /// Replace base with source.
    #[must_use]
    pub fn vanilla() -> Self {
        Self::structured(Stock::Vanilla)
    }

    /// Add source to base.
    #[must_use]
    pub fn addition() -> Self {
        Self::structured(Stock::Addition)
    }

    /// Subtract source from base.
    #[must_use]
    pub fn subtraction() -> Self {
        Self::structured(Stock::Subtraction)
    }

    /// Zero the base.
    #[must_use]
    pub fn zero() -> Self {
        Self::structured(Stock::Zero)
    }

    /// Multiply the base by `factor`.
    #[must_use]
    pub fn scale(factor: f64) -> Self {
        Self::structured(Stock::Scale(factor))
    }

    /// Whether this is a functional wrapper.
    #[must_use]
    pub const fn is_functional(&self) -> bool {
        matches!(self, Self::Functional(_))
    }

    /// Whether the dispatcher must leave the representation's axes alone.
    #[must_use]
    pub const fn keeps_shape(&self) -> bool {
        match self {
            Self::Functional(_) => true,
            Self::Structured {
                keep_last_dim,
                localist,
                ..
            } => *keep_last_dim || *localist,
        }
    }

    /// The wrapped transform.
    #[must_use]
    pub fn transform(&self) -> &dyn Transform {
        match self {
            Self::Functional(t) | Self::Structured { transform: t, .. } => t.as_ref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stock transforms
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Stock {
    Vanilla,
    Addition,
    Subtraction,
    Zero,
    Scale(f64),
}

impl Transform for Stock {
    fn apply(
        &self,
        base: &Tensor,
        source: &Tensor,
        subspaces: Option<&[Vec<usize>]>,
        _extra: &Extra,
    ) -> Result<Intervened> {
        if base.dims() != source.dims() && !matches!(self, Self::Zero | Self::Scale(_)) {
            return Err(MIError::Intervention(format!(
                "base {:?} and source {:?} differ in shape",
                base.dims(),
                source.dims()
            )));
        }
        let source = source.to_dtype(base.dtype())?;
        let candidate = match self {
            Self::Vanilla => source,
            Self::Addition => (base + &source)?,
            Self::Subtraction => (base - &source)?,
            Self::Zero => base.zeros_like()?,
            Self::Scale(factor) => base.affine(*factor, 0.)?,
        };
        let output = match subspaces {
            Some(rows) => restrict_to_subspaces(base, &candidate, rows)?,
            None => candidate,
        };
        Ok(Intervened::Tensor(output))
    }
}

/// Take `candidate` on the listed last-axis features of each batch element
/// and `base` everywhere else.
///
/// # Shapes
/// - `base`, `candidate`: `[batch, ..., features]`
/// - `rows`: one feature-index row per batch element
fn restrict_to_subspaces(base: &Tensor, candidate: &Tensor, rows: &[Vec<usize>]) -> Result<Tensor> {
    let dims = base.dims();
    let batch = dims.first().copied().unwrap_or(0);
    let features = base.dim(D::Minus1)?;
    if rows.len() != batch {
        return Err(MIError::Intervention(format!(
            "subspaces cover {} batch elements, representation has {batch}",
            rows.len()
        )));
    }

    let mut mask = vec![0u8; batch * features];
    for (b, row) in rows.iter().enumerate() {
        for &i in row {
            if i >= features {
                return Err(MIError::Intervention(format!(
                    "subspace index {i} out of range for {features} features (batch {b})"
                )));
            }
            mask[b * features + i] = 1;
        }
    }

    let mut mask_shape = vec![1; dims.len()];
    mask_shape[0] = batch;
    if let Some(last) = mask_shape.last_mut() {
        *last = features;
    }
    let mask = Tensor::from_vec(mask, mask_shape, base.device())?.broadcast_as(dims)?;
    Ok(mask.where_cond(candidate, base)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    fn pair() -> (Tensor, Tensor) {
        let base = Tensor::new(&[[1f32, 2., 3.], [4., 5., 6.]], &Device::Cpu).unwrap();
        let source = Tensor::new(&[[10f32, 20., 30.], [40., 50., 60.]], &Device::Cpu).unwrap();
        (base, source)
    }

    fn run(
        iv: &Intervention,
        base: &Tensor,
        source: &Tensor,
        subspaces: Option<&[Vec<usize>]>,
    ) -> Vec<f32> {
        values(iv.transform().apply(base, source, subspaces, &Extra::new()).unwrap().tensor())
    }

    #[test]
    fn stock_transforms() {
        let (base, source) = pair();
        let stock = |iv: Intervention| run(&iv, &base, &source, None);
        assert_eq!(stock(Intervention::vanilla()), values(&source));
        assert_eq!(stock(Intervention::addition()), vec![11., 22., 33., 44., 55., 66.]);
        assert_eq!(stock(Intervention::subtraction()), vec![-9., -18., -27., -36., -45., -54.]);
        assert_eq!(stock(Intervention::zero()), vec![0.; 6]);
        assert_eq!(stock(Intervention::scale(2.)), vec![2., 4., 6., 8., 10., 12.]);
    }

    #[test]
    fn subspaces_restrict_per_batch() {
        let (base, source) = pair();
        let subspaces = vec![vec![0], vec![1, 2]];
        assert_eq!(
            run(&Intervention::vanilla(), &base, &source, Some(subspaces.as_slice())),
            vec![10., 2., 3., 4., 50., 60.]
        );
        assert_eq!(
            run(&Intervention::zero(), &base, &source, Some(subspaces.as_slice())),
            vec![0., 2., 3., 4., 0., 0.]
        );
    }

    #[test]
    fn bad_subspaces_rejected() {
        let (base, source) = pair();
        let transform = Intervention::vanilla();
        let apply = |subspaces: &[Vec<usize>]| {
            transform.transform().apply(&base, &source, Some(subspaces), &Extra::new())
        };
        assert!(apply(&[vec![3], vec![0]]).is_err());
        assert!(apply(&[vec![0]]).is_err());
    }

    #[test]
    fn flags_and_wrapping() {
        let iv = Intervention::vanilla().with_keep_last_dim(true);
        assert!(iv.keeps_shape() && !iv.is_functional());
        assert!(!Intervention::addition().keeps_shape());
        assert!(Intervention::zero().with_localist(true).keeps_shape());
        let f = Intervention::functional(
            |b: &Tensor, _: &Tensor, _: Option<&[Vec<usize>]>, _: &Extra| {
                Ok(Intervened::from(b.clone()))
            },
        );
        assert!(f.is_functional() && f.keeps_shape());
        assert!(format!("{f:?}").contains("Functional"));
    }

    #[test]
    fn map_tensor_keeps_aux() {
        let (base, source) = pair();
        let mut aux = Extra::new();
        aux.insert("latent".into(), source);
        let out = Intervened::Structured(InterventionOutput { output: base, aux });
        let out = out.map_tensor(|t| Ok(t.affine(0., 1.)?)).unwrap();
        assert_eq!(values(out.tensor()), vec![1.; 6]);
        assert!(out.aux().unwrap().contains_key("latent"));
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Intervention dispatch.
//!
//! [`do_intervention`] shapes base and source for a transform and restores
//! the result; [`intervene`] runs the whole pipeline on a raw activation:
//! split the component out, gather the addressed units, dispatch, and
//! scatter the result back in place.
//!
//! Flattening for structured interventions:
//!
//! | Base rank | Passed to the transform | Restored with |
//! |-----------|-------------------------|---------------|
//! | 2 | `[b, d]` unchanged | nothing |
//! | 3 | `[b, s * d]` | [`b_sd_to_bsd`] |
//! | 4 | `[b, s, h * d]` | [`bs_hd_to_bhsd`] |

use candle_core::Tensor;
use tracing::debug;

use crate::error::{MIError, Result};
use crate::interp::intervention::{Extra, Intervened, Intervention};
use crate::neurons::{ScatterTarget, Unit, UnitLocations, gather, scatter};
use crate::split::split;
use crate::util::reshape::{b_sd_to_bsd, bhsd_to_bs_hd, bs_hd_to_bhsd, bsd_to_b_sd};

// ---------------------------------------------------------------------------
// Flattening
// ---------------------------------------------------------------------------

/// How a representation was flattened, with what it takes to undo it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flattening {
    Keep,
    Positions(usize),
    Heads(usize),
}

impl Flattening {
    fn for_base(base: &Tensor, intervention: &Intervention) -> Result<Self> {
        let dims = base.dims();
        match dims.len() {
            2 => Ok(Self::Keep),
            3 | 4 if intervention.keeps_shape() => Ok(Self::Keep),
            3 => Ok(Self::Positions(dims[1])),
            4 => Ok(Self::Heads(dims[1])),
            _ => Err(MIError::ShapeInvariant(dims.to_vec())),
        }
    }

    fn flatten(self, t: &Tensor) -> Result<Tensor> {
        match self {
            Self::Keep => Ok(t.clone()),
            Self::Positions(_) => bsd_to_b_sd(t),
            Self::Heads(_) => bhsd_to_bs_hd(t),
        }
    }

    fn unflatten(self, t: Tensor) -> Result<Tensor> {
        match self {
            Self::Keep => Ok(t),
            Self::Positions(units) => b_sd_to_bsd(&t, units),
            Self::Heads(heads) => bs_hd_to_bhsd(&t, heads),
        }
    }
}

/// Apply `intervention` to `base` given `source`.
///
/// Functional interventions are called directly and their result returned
/// unchanged. Structured interventions see flattened representations (see
/// the module table) unless they set `keep_last_dim` or `localist`; a
/// structured output keeps its auxiliary fields.
///
/// # Errors
///
/// Returns [`MIError::ShapeInvariant`] for a base of rank other than 2, 3
/// or 4 reaching a structured intervention, and the transform's own errors.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use candle_intervene::{Intervention, do_intervention};
///
/// let base = Tensor::zeros((2, 3, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
/// let source = Tensor::ones((2, 3, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
/// let add = Intervention::addition();
/// let out = do_intervention(&base, &source, &add, None, &Default::default()).unwrap();
/// assert_eq!(out.tensor().dims(), &[2, 3, 4]);
/// ```
pub fn do_intervention(
    base: &Tensor,
    source: &Tensor,
    intervention: &Intervention,
    subspaces: Option<&[Vec<usize>]>,
    extra: &Extra,
) -> Result<Intervened> {
    if intervention.is_functional() {
        return intervention.transform().apply(base, source, subspaces, extra);
    }

    let flattening = Flattening::for_base(base, intervention)?;
    debug!(dims = ?base.dims(), ?flattening, "dispatching intervention");
    let base_f = flattening.flatten(base)?;
    let source_f = flattening.flatten(source)?;

    let out = intervention
        .transform()
        .apply(&base_f, &source_f, subspaces, extra)?;
    out.map_tensor(|t| flattening.unflatten(t))
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Everything that addresses one intervention inside a raw activation.
#[derive(Debug, Clone)]
pub struct InterventionSite<'c, 'a> {
    /// Component and model layout.
    pub target: ScatterTarget<'c, 'a>,
    /// Addressed unit.
    pub unit: Unit,
    /// Locations in the base activation.
    pub locations: UnitLocations,
    /// Locations in the source activation; `None` reuses `locations`.
    pub source_locations: Option<UnitLocations>,
    /// Per-batch feature indices the transform is restricted to.
    pub subspaces: Option<Vec<Vec<usize>>>,
    /// Allow the shared-row `pos` fast path when scattering.
    pub fast_path: bool,
}

impl<'c, 'a> InterventionSite<'c, 'a> {
    /// Site with identical base/source locations, no subspaces and no fast
    /// path.
    #[must_use]
    pub const fn new(target: ScatterTarget<'c, 'a>, unit: Unit, locations: UnitLocations) -> Self {
        Self {
            target,
            unit,
            locations,
            source_locations: None,
            subspaces: None,
            fast_path: false,
        }
    }

    /// Read the source at different locations.
    #[must_use]
    pub fn with_source_locations(mut self, locations: UnitLocations) -> Self {
        self.source_locations = Some(locations);
        self
    }

    /// Restrict the transform to per-batch feature indices.
    #[must_use]
    pub fn with_subspaces(mut self, subspaces: Vec<Vec<usize>>) -> Self {
        self.subspaces = Some(subspaces);
        self
    }

    /// Enable the shared-row `pos` fast path.
    #[must_use]
    pub fn with_fast_path(mut self, fast_path: bool) -> Self {
        self.fast_path = fast_path;
        self
    }
}

/// Intervene on a raw activation captured at a hook.
///
/// `activation` and `source` are the raw hook tensors (e.g. the fused QKV
/// output of `c_attn`). The component is split out of both, the addressed
/// units gathered, `intervention` applied through [`do_intervention`], and
/// the result scattered back into `activation`. On error `activation` is
/// left untouched.
///
/// Returns the transform's output (in gathered shape), including any
/// auxiliary fields.
///
/// # Errors
///
/// Returns the errors of the splitter, [`gather`], [`do_intervention`] and
/// [`scatter`].
pub fn intervene(
    activation: &mut Tensor,
    source: &Tensor,
    site: &InterventionSite<'_, '_>,
    intervention: &Intervention,
    extra: &Extra,
) -> Result<Intervened> {
    let component = site.target.component;
    let model = site.target.model;

    let base_units = gather(&split(activation, component, model)?, site.unit, &site.locations)?;
    let source_locations = site.source_locations.as_ref().unwrap_or(&site.locations);
    let source_units = gather(&split(source, component, model)?, site.unit, source_locations)?;
    debug!(
        component,
        unit = %site.unit,
        base = ?base_units.dims(),
        source = ?source_units.dims(),
        "intervening"
    );

    let out = do_intervention(
        &base_units,
        &source_units,
        intervention,
        site.subspaces.as_deref(),
        extra,
    )?;
    scatter(
        activation,
        out.tensor(),
        site.target,
        site.unit,
        &site.locations,
        site.fast_path,
    )?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::interp::intervention::InterventionOutput;
    use crate::layout::{ModelContext, ModelFamily, builtin};
    use crate::neurons::UnitAxis;
    use candle_core::{DType, Device};

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    fn ramp(shape: &[usize]) -> Tensor {
        let n: usize = shape.iter().product();
        Tensor::arange(0f32, n as f32, &Device::Cpu).unwrap().reshape(shape).unwrap()
    }

    /// Asserts the shape it is called with.
    fn expect_shape(expected: Vec<usize>) -> Intervention {
        Intervention::structured(
            move |base: &Tensor, source: &Tensor, _: Option<&[Vec<usize>]>, _: &Extra| {
                assert_eq!(base.dims(), expected.as_slice());
                Ok(Intervened::from(source.clone()))
            },
        )
    }

    #[test]
    fn rank_two_passes_through() {
        let base = ramp(&[2, 6]);
        let source = base.affine(-1., 0.).unwrap();
        for iv in [
            expect_shape(vec![2, 6]),
            expect_shape(vec![2, 6]).with_keep_last_dim(true),
            expect_shape(vec![2, 6]).with_localist(true),
        ] {
            let out = do_intervention(&base, &source, &iv, None, &Extra::new()).unwrap();
            assert_eq!(out.tensor().dims(), base.dims());
        }
    }

    #[test]
    fn rank_three_flattens_positions() {
        let base = ramp(&[2, 3, 4]);
        let source = base.affine(2., 0.).unwrap();
        let flat = expect_shape(vec![2, 12]);
        let out = do_intervention(&base, &source, &flat, None, &Extra::new()).unwrap();
        assert_eq!(out.tensor().dims(), &[2, 3, 4]);
        assert_eq!(values(out.tensor()), values(&source));

        let kept = expect_shape(vec![2, 3, 4]).with_keep_last_dim(true);
        let out = do_intervention(&base, &source, &kept, None, &Extra::new()).unwrap();
        assert_eq!(out.tensor().dims(), &[2, 3, 4]);
    }

    #[test]
    fn rank_four_merges_heads() {
        let base = ramp(&[1, 2, 3, 4]);
        let source = base.affine(1., 100.).unwrap();
        let merged = expect_shape(vec![1, 3, 8]);
        let out = do_intervention(&base, &source, &merged, None, &Extra::new()).unwrap();
        assert_eq!(out.tensor().dims(), &[1, 2, 3, 4]);
        assert_eq!(values(out.tensor()), values(&source));
    }

    #[test]
    fn structured_output_restored_with_aux() {
        let with_latent = Intervention::structured(
            |base: &Tensor, _: &Tensor, _: Option<&[Vec<usize>]>, _: &Extra| {
                let mut aux = Extra::new();
                aux.insert("latent".into(), base.clone());
                Ok(Intervened::Structured(InterventionOutput {
                    output: base.affine(2., 0.)?,
                    aux,
                }))
            },
        );
        // aux fields stay in the flattened layout the transform saw
        let cases = [(vec![2, 3, 4], vec![2, 12]), (vec![1, 2, 3, 4], vec![1, 3, 8])];
        for (shape, flat) in cases {
            let base = ramp(&shape);
            let out = do_intervention(&base, &base, &with_latent, None, &Extra::new()).unwrap();
            assert_eq!(out.tensor().dims(), shape.as_slice());
            assert_eq!(values(out.tensor()), values(&base.affine(2., 0.).unwrap()));
            let aux = out.aux().unwrap();
            assert_eq!(aux["latent"].dims(), flat.as_slice());
        }
    }

    #[test]
    fn functional_is_called_directly() {
        let base = Tensor::zeros((1, 2, 3, 4, 5), DType::F32, &Device::Cpu).unwrap();
        let iv = Intervention::functional(
            |b: &Tensor, _: &Tensor, _: Option<&[Vec<usize>]>, _: &Extra| {
                Ok(Intervened::from(b.sum_keepdim(4)?))
            },
        );
        let out = do_intervention(&base, &base, &iv, None, &Extra::new()).unwrap();
        assert_eq!(out.tensor().dims(), &[1, 2, 3, 4, 1]);
    }

    #[test]
    fn unsupported_rank_is_invariant_violation() {
        let base = Tensor::zeros((1, 2, 3, 4, 5), DType::F32, &Device::Cpu).unwrap();
        let vanilla = Intervention::vanilla();
        let err = do_intervention(&base, &base, &vanilla, None, &Extra::new()).unwrap_err();
        assert!(matches!(err, MIError::ShapeInvariant(ref dims) if dims.len() == 5));
    }

    #[test]
    fn time_unit_on_rank_two_keeps_shape() {
        let reg = builtin::registry();
        let config = serde_json::json!({"model_type": "gru", "h_dim": 3});
        let ctx = ModelContext::new(&reg, ModelFamily::Gru, &config);
        let site = InterventionSite::new(
            ScatterTarget::new(&ctx, "cell_output"),
            Unit::Time,
            UnitLocations::Simple(vec![vec![0], vec![0]]),
        );
        let mut activation = ramp(&[2, 3]);
        let source = Tensor::full(9f32, (2, 3), &Device::Cpu).unwrap();
        let vanilla = Intervention::vanilla();
        let out = intervene(&mut activation, &source, &site, &vanilla, &Extra::new()).unwrap();
        assert_eq!(out.tensor().dims(), &[2, 3]);
        assert_eq!(activation.dims(), &[2, 3]);
        assert_eq!(values(&activation), vec![9.; 6]);
    }

    #[test]
    fn intervene_on_fused_value_heads() {
        let reg = builtin::registry();
        let config =
            serde_json::json!({"model_type": "gpt2", "n_embd": 8, "n_head": 2, "n_inner": null});
        let ctx = ModelContext::new(&reg, ModelFamily::Gpt2, &config);
        let site = InterventionSite::new(
            ScatterTarget::new(&ctx, "head_value_output"),
            Unit::Composite(UnitAxis::Head, UnitAxis::Pos),
            UnitLocations::Composite {
                outer: vec![vec![0]],
                inner: vec![vec![1]],
            },
        );
        // [b=1, s=2, 3 * n_embd]
        let mut activation = ramp(&[1, 2, 24]);
        let source = Tensor::full(-1f32, (1, 2, 24), &Device::Cpu).unwrap();
        let vanilla = Intervention::vanilla();
        intervene(&mut activation, &source, &site, &vanilla, &Extra::new()).unwrap();

        // value slot starts at 16, head 0 spans 4 features, position 1 at 24
        for (i, x) in values(&activation).iter().enumerate() {
            if (40..44).contains(&i) {
                assert_eq!(*x, -1.);
            } else {
                assert_eq!(*x, i as f32);
            }
        }
    }

    #[test]
    fn intervene_with_subspaces_and_source_locations() {
        let reg = builtin::registry();
        let config =
            serde_json::json!({"model_type": "gpt2", "n_embd": 4, "n_head": 2, "n_inner": null});
        let ctx = ModelContext::new(&reg, ModelFamily::Gpt2, &config);
        let site = InterventionSite::new(
            ScatterTarget::new(&ctx, "block_output"),
            Unit::Simple(UnitAxis::Pos),
            UnitLocations::Simple(vec![vec![0]]),
        )
        .with_source_locations(UnitLocations::Simple(vec![vec![2]]))
        .with_subspaces(vec![vec![1, 2]]);

        let mut activation = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let source = ramp(&[1, 3, 4]);
        let vanilla = Intervention::vanilla();
        intervene(&mut activation, &source, &site, &vanilla, &Extra::new()).unwrap();
        // flattened [b, 1 * 4]: features 1 and 2 of source position 2 (9, 10)
        assert_eq!(
            values(&activation),
            vec![0., 9., 10., 0., 0., 0., 0., 0., 0., 0., 0., 0.]
        );
    }

    #[test]
    fn failed_intervention_leaves_activation() {
        let reg = builtin::registry();
        let config =
            serde_json::json!({"model_type": "gpt2", "n_embd": 4, "n_head": 2, "n_inner": null});
        let ctx = ModelContext::new(&reg, ModelFamily::Gpt2, &config);
        let site = InterventionSite::new(
            ScatterTarget::new(&ctx, "block_output"),
            Unit::Simple(UnitAxis::Pos),
            UnitLocations::Simple(vec![vec![7]]),
        );
        let mut activation = ramp(&[1, 3, 4]);
        let before = values(&activation);
        let source = activation.clone();
        let zero = Intervention::zero();
        assert!(intervene(&mut activation, &source, &site, &zero, &Extra::new()).is_err());
        assert_eq!(values(&activation), before);
    }
}

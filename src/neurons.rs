// SPDX-License-Identifier: MIT OR Apache-2.0

//! Neuron gather/scatter: reading and writing the addressed units of an
//! activation tensor.
//!
//! A [`Unit`] names the axis (or pair of axes) being addressed and
//! [`UnitLocations`] lists, per batch element, which entries of that axis.
//!
//! | Unit | Activation layout | Gathered shape |
//! |------|-------------------|----------------|
//! | `t` | `[batch, dim]` | unchanged |
//! | `pos`, `h`, `dim` | `[batch, n, ...]` | `[batch, k, ...]` |
//! | `h.pos` | `[batch, heads, seq, dim]` | `[batch, k_heads, k_pos, dim]` |
//!
//! # Scatter
//!
//! [`scatter`] writes a replacement back into the activation through the
//! same addressing. Heads and component slots are fused into the last axis
//! of a raw activation, so the head branch reads the feature axis as
//! `[n_components, n_heads, head_dim]` and addresses heads inside the
//! component's slot.
//!
//! The flat offsets of the addressed elements are computed on the host from
//! the feature window, the fused slot and the locations, in time
//! proportional to the number of elements written. One
//! [`Tensor::scatter`] over the flattened activation then writes the
//! replacement, for any dtype and device.
//!
//! [`scatter`] takes `&mut Tensor` and replaces it: after the call the
//! caller's binding holds the mutated activation. Every index is computed
//! and validated before the binding is touched. [`scatter_copy`] is the
//! value-returning variant.

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Tensor};
use tracing::{debug, trace, warn};

use crate::error::{MIError, Result};
use crate::layout::ModelContext;
use crate::split::{FeatureWindow, feature_window};
use crate::util::reshape::{bhsd_to_bs_hd, bs_hd_to_bhsd};

// ---------------------------------------------------------------------------
// Units and locations
// ---------------------------------------------------------------------------

/// Axis a unit token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitAxis {
    /// Sequence position (`pos`).
    Pos,
    /// Attention head (`h`).
    Head,
    /// Feature dimension (`dim`).
    Dim,
}

impl fmt::Display for UnitAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pos => write!(f, "pos"),
            Self::Head => write!(f, "h"),
            Self::Dim => write!(f, "dim"),
        }
    }
}

impl FromStr for UnitAxis {
    type Err = MIError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pos" => Ok(Self::Pos),
            "h" => Ok(Self::Head),
            "dim" => Ok(Self::Dim),
            other => Err(MIError::Unit(format!("unknown unit `{other}`"))),
        }
    }
}

/// Intervention unit.
///
/// ```
/// use candle_intervene::{Unit, UnitAxis};
///
/// assert_eq!("h.pos".parse::<Unit>().unwrap(), Unit::Composite(UnitAxis::Head, UnitAxis::Pos));
/// assert_eq!("t".parse::<Unit>().unwrap(), Unit::Time);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    /// Whole feature vector per time step (`t`); no positional addressing.
    Time,
    /// One addressed axis.
    Simple(UnitAxis),
    /// Outer axis, then an inner axis within the outer selection.
    Composite(UnitAxis, UnitAxis),
}

impl Unit {
    /// Whether the unit addresses two axes.
    #[must_use]
    pub const fn is_composite(&self) -> bool {
        matches!(self, Self::Composite(..))
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Time => write!(f, "t"),
            Self::Simple(axis) => write!(f, "{axis}"),
            Self::Composite(outer, inner) => write!(f, "{outer}.{inner}"),
        }
    }
}

impl FromStr for Unit {
    type Err = MIError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "t" {
            return Ok(Self::Time);
        }
        match s.split_once('.') {
            None => Ok(Self::Simple(s.parse()?)),
            Some((outer, inner)) if !inner.contains('.') => {
                Ok(Self::Composite(outer.parse()?, inner.parse()?))
            }
            Some(_) => Err(MIError::Unit(format!("unit `{s}` nests more than two axes"))),
        }
    }
}

/// Per-batch positions addressed by a unit.
///
/// Each row belongs to one batch element; rows of one matrix share a width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitLocations {
    /// Locations for a simple unit (or ignored for `t`).
    Simple(Vec<Vec<usize>>),
    /// Outer-axis and inner-axis locations for a composite unit.
    Composite {
        /// Locations on the first axis (e.g. heads).
        outer: Vec<Vec<usize>>,
        /// Locations on the second axis (e.g. positions).
        inner: Vec<Vec<usize>>,
    },
}

impl UnitLocations {
    fn simple(&self, unit: Unit) -> Result<&[Vec<usize>]> {
        match self {
            Self::Simple(rows) => Ok(rows),
            Self::Composite { .. } => Err(MIError::Unit(format!(
                "unit `{unit}` needs one location list, got a pair"
            ))),
        }
    }

    fn composite(&self, unit: Unit) -> Result<(&[Vec<usize>], &[Vec<usize>])> {
        match self {
            Self::Composite { outer, inner } => Ok((outer, inner)),
            Self::Simple(_) => Err(MIError::Unit(format!(
                "unit `{unit}` needs an (outer, inner) location pair"
            ))),
        }
    }
}

/// Check a location matrix against `[batch, axis_len]` and return its width.
fn check_rows(rows: &[Vec<usize>], batch: usize, axis_len: usize, what: &str) -> Result<usize> {
    if rows.len() != batch {
        return Err(MIError::Unit(format!(
            "{what} locations cover {} batch elements, tensor has {batch}",
            rows.len()
        )));
    }
    let width = rows.first().map_or(0, Vec::len);
    for (b, row) in rows.iter().enumerate() {
        if row.len() != width {
            return Err(MIError::Unit(format!(
                "{what} locations are ragged: row {b} has {} entries, row 0 has {width}",
                row.len()
            )));
        }
        if let Some(&bad) = row.iter().find(|&&i| i >= axis_len) {
            return Err(MIError::Unit(format!(
                "{what} location {bad} out of range for axis of {axis_len} (batch {b})"
            )));
        }
    }
    Ok(width)
}

/// `[batch, k]` u32 index tensor.
fn index_tensor(rows: &[Vec<usize>], width: usize, device: &Device) -> Result<Tensor> {
    let flat = rows
        .iter()
        .flatten()
        .map(|&i| u32::try_from(i).map_err(|_| MIError::Unit(format!("location {i} exceeds u32"))))
        .collect::<Result<Vec<u32>>>()?;
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}

// ---------------------------------------------------------------------------
// Gather
// ---------------------------------------------------------------------------

/// Gather along axis 1 with per-batch locations.
///
/// The `[batch, k]` index is reshaped to `[batch, k, 1, ...]` and expanded
/// over the trailing axes, which are never changed.
///
/// # Shapes
/// - `tensor`: `[batch, n, rest...]`
/// - returns: `[batch, k, rest...]`
fn gather_axis1(tensor: &Tensor, rows: &[Vec<usize>], what: &str) -> Result<Tensor> {
    let dims = tensor.dims();
    if dims.len() < 2 {
        return Err(MIError::Unit(format!(
            "{what} gather needs a tensor of rank >= 2, got {dims:?}"
        )));
    }
    let (batch, axis_len) = (dims[0], dims[1]);
    let width = check_rows(rows, batch, axis_len, what)?;

    let mut index_shape = vec![batch, width];
    index_shape.extend(std::iter::repeat_n(1, dims.len() - 2));
    let mut target_shape = vec![batch, width];
    target_shape.extend_from_slice(&dims[2..]);

    let ids = index_tensor(rows, width, tensor.device())?
        .reshape(index_shape)?
        .broadcast_as(target_shape)?
        .contiguous()?;
    Ok(tensor.contiguous()?.gather(&ids, 1)?)
}

/// Read the units addressed by `unit` and `locations`.
///
/// # Shapes
/// - `t`: `tensor` returned unchanged.
/// - simple unit: `[batch, n, rest...]` -> `[batch, k, rest...]`
/// - composite unit: `[batch, heads, seq, dim]` -> `[batch, k_heads, k_pos, dim]`
///
/// # Errors
///
/// Returns [`MIError::Unit`] if the locations do not match the tensor's
/// batch size, are ragged, or fall outside their axis.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use candle_intervene::{gather, Unit, UnitLocations};
///
/// let t = Tensor::arange(0f32, 80., &Device::Cpu).unwrap().reshape((2, 5, 8)).unwrap();
/// let locs = UnitLocations::Simple(vec![vec![1, 3], vec![0, 4]]);
/// let g = gather(&t, Unit::Simple(candle_intervene::UnitAxis::Pos), &locs).unwrap();
/// assert_eq!(g.dims(), &[2, 2, 8]);
/// ```
pub fn gather(tensor: &Tensor, unit: Unit, locations: &UnitLocations) -> Result<Tensor> {
    match unit {
        Unit::Time => Ok(tensor.clone()),
        Unit::Simple(_) => gather_axis1(tensor, locations.simple(unit)?, "unit"),
        Unit::Composite(..) => {
            let (outer, inner) = locations.composite(unit)?;
            if tensor.rank() != 4 {
                return Err(MIError::Unit(format!(
                    "composite unit `{unit}` needs [batch, heads, seq, dim], got {:?}",
                    tensor.dims()
                )));
            }
            let heads = gather_axis1(tensor, outer, "outer")?; // [b, H, s, d]
            let n_heads = heads.dim(1)?;
            let by_pos = bhsd_to_bs_hd(&heads)?; // [b, s, H*d]
            let picked = gather_axis1(&by_pos, inner, "inner")?; // [b, P, H*d]
            bs_hd_to_bhsd(&picked, n_heads) // [b, H, P, d]
        }
    }
}

// ---------------------------------------------------------------------------
// Scatter
// ---------------------------------------------------------------------------

/// Identity of the component being written: needed to find the feature
/// window and the fused slot it owns.
#[derive(Debug, Clone, Copy)]
pub struct ScatterTarget<'c, 'a> {
    /// Model layout context.
    pub model: &'c ModelContext<'a>,
    /// Component name as used with the layout registry.
    pub component: &'c str,
}

impl<'c, 'a> ScatterTarget<'c, 'a> {
    /// Build a scatter target.
    #[must_use]
    pub const fn new(model: &'c ModelContext<'a>, component: &'c str) -> Self {
        Self { model, component }
    }
}

/// Replace the addressed units of `tensor` with `replacement`.
///
/// `tensor` is updated in place: on success the binding holds the mutated
/// activation; on error it is left untouched. `replacement` must have the
/// shape [`gather`] would produce for the component's sub-slice.
///
/// `fast_path` lets the `pos` branch address all batch rows through
/// `locations[0]`; it is honoured only when every row is identical, so
/// results never depend on it.
///
/// # Errors
///
/// Returns [`MIError::Unit`] for invalid locations or a replacement whose
/// shape does not match the addressed region, [`MIError::UnsupportedSplit`]
/// for an unsupported fused slot, and candle errors for rank mismatches.
pub fn scatter(
    tensor: &mut Tensor,
    replacement: &Tensor,
    target: ScatterTarget<'_, '_>,
    unit: Unit,
    locations: &UnitLocations,
    fast_path: bool,
) -> Result<()> {
    let updated = scatter_copy(tensor, replacement, target, unit, locations, fast_path)?;
    *tensor = updated;
    Ok(())
}

/// Value-returning variant of [`scatter`]; `tensor` is not modified.
///
/// # Errors
///
/// Same as [`scatter`].
pub fn scatter_copy(
    tensor: &Tensor,
    replacement: &Tensor,
    target: ScatterTarget<'_, '_>,
    unit: Unit,
    locations: &UnitLocations,
    fast_path: bool,
) -> Result<Tensor> {
    let dims = tensor.dims();
    let numel = tensor.elem_count();
    let features = *dims
        .last()
        .ok_or_else(|| MIError::Unit("cannot scatter into a scalar".into()))?;
    let window = feature_window(features, target.component, target.model)?;

    debug!(component = target.component, %unit, ?dims, ?window, fast_path, "scatter");
    if zero_width(unit, locations) {
        if replacement.elem_count() != 0 {
            return Err(MIError::Unit(format!(
                "no units addressed but replacement has shape {:?}",
                replacement.dims()
            )));
        }
        return Ok(tensor.clone());
    }
    let plan = plan_targets(dims, &window, target, unit, locations, fast_path)?;
    if replacement.dims() != plan.shape.as_slice() {
        return Err(MIError::Unit(format!(
            "replacement shape {:?} does not match addressed shape {:?}",
            replacement.dims(),
            plan.shape
        )));
    }
    if plan.offsets.is_empty() {
        return Ok(tensor.clone());
    }
    if u32::try_from(numel).is_err() {
        return Err(MIError::Unit(format!(
            "activation of {numel} elements exceeds u32 indexing"
        )));
    }
    let k = plan.offsets.len();
    let offsets = plan
        .offsets
        .into_iter()
        .map(|o| u32::try_from(o).map_err(|_| MIError::Unit(format!("offset {o} exceeds u32"))))
        .collect::<Result<Vec<u32>>>()?;

    let device = tensor.device();
    let index = Tensor::from_vec(offsets, k, device)?;
    let values = replacement
        .to_device(device)?
        .to_dtype(tensor.dtype())?
        .flatten_all()?
        .contiguous()?;
    Ok(tensor
        .flatten_all()?
        .scatter(&index, &values, 0)?
        .reshape(dims)?)
}

/// Whether the locations address nothing (`t` always addresses the window).
fn zero_width(unit: Unit, locations: &UnitLocations) -> bool {
    let empty = |rows: &[Vec<usize>]| rows.iter().all(Vec::is_empty);
    match (unit, locations) {
        (Unit::Time, _) => false,
        (_, UnitLocations::Simple(rows)) => empty(rows),
        (_, UnitLocations::Composite { outer, inner }) => empty(outer) || empty(inner),
    }
}

fn rows_identical(rows: &[Vec<usize>]) -> bool {
    rows.windows(2).all(|w| w[0] == w[1])
}

/// Flat row-major offsets of the addressed elements, listed in the order
/// the replacement is read.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Targets {
    /// Shape the replacement must have.
    shape: Vec<usize>,
    offsets: Vec<usize>,
}

impl Targets {
    fn new(shape: Vec<usize>) -> Self {
        let capacity = shape.iter().product();
        Self {
            shape,
            offsets: Vec::with_capacity(capacity),
        }
    }

    /// Push `len` consecutive offsets starting at `base`.
    fn push_run(&mut self, base: usize, len: usize) {
        self.offsets.extend(base..base + len);
    }
}

/// Offsets written by a scatter into an activation of shape `dims`.
///
/// Work is proportional to the number of addressed elements, not to the
/// size of the activation.
///
/// # Shapes
/// - `t`: `[rest..., window]`
/// - `pos`: `[batch, k, mid..., window]` over `[batch, seq, mid..., features]`
/// - `h`: `[batch, k_heads, seq, head_dim]` over `[batch, seq, features]`
/// - `h.pos`: `[batch, k_heads, k_pos, head_dim]` over `[batch, seq, features]`
/// - other simple units: `[batch, k, rest...]` over `[batch, n, rest...]`
/// - other composite units: `[batch, k_outer, k_inner, rest...]`
fn plan_targets(
    dims: &[usize],
    window: &FeatureWindow,
    target: ScatterTarget<'_, '_>,
    unit: Unit,
    locations: &UnitLocations,
    fast_path: bool,
) -> Result<Targets> {
    let Some((&features, leading)) = dims.split_last() else {
        return Err(MIError::Unit("cannot scatter into a scalar".into()));
    };
    match unit {
        Unit::Time => {
            let mut shape = dims.to_vec();
            if let Some(last) = shape.last_mut() {
                *last = window.len();
            }
            let mut plan = Targets::new(shape);
            for row in 0..leading.iter().product::<usize>() {
                plan.push_run(row * features + window.start, window.len());
            }
            Ok(plan)
        }
        Unit::Simple(UnitAxis::Pos) => {
            pos_targets(dims, window, target, unit, locations, fast_path)
        }
        Unit::Simple(UnitAxis::Head) | Unit::Composite(UnitAxis::Head, UnitAxis::Pos) => {
            head_targets(dims, window, target, unit, locations)
        }
        Unit::Simple(_) => {
            let [batch, n, rest @ ..] = dims else {
                return Err(MIError::Unit(format!(
                    "unit `{unit}` needs a tensor of rank >= 2, got {dims:?}"
                )));
            };
            let rows = locations.simple(unit)?;
            let width = check_rows(rows, *batch, *n, "unit")?;
            let inner: usize = rest.iter().product();
            let mut shape = vec![*batch, width];
            shape.extend_from_slice(rest);
            let mut plan = Targets::new(shape);
            for (b, row) in rows.iter().enumerate() {
                for &p in row {
                    plan.push_run((b * n + p) * inner, inner);
                }
            }
            Ok(plan)
        }
        Unit::Composite(..) => {
            let [batch, n_outer, n_inner, rest @ ..] = dims else {
                return Err(MIError::Unit(format!(
                    "composite unit `{unit}` needs rank >= 3, got {dims:?}"
                )));
            };
            let (outer, inner) = locations.composite(unit)?;
            let k_outer = check_rows(outer, *batch, *n_outer, "outer")?;
            let k_inner = check_rows(inner, *batch, *n_inner, "inner")?;
            let cell: usize = rest.iter().product();
            let mut shape = vec![*batch, k_outer, k_inner];
            shape.extend_from_slice(rest);
            let mut plan = Targets::new(shape);
            for (b, (outer_row, inner_row)) in outer.iter().zip(inner).enumerate() {
                for &o in outer_row {
                    for &i in inner_row {
                        plan.push_run(((b * n_outer + o) * n_inner + i) * cell, cell);
                    }
                }
            }
            Ok(plan)
        }
    }
}

/// `pos` offsets, restricted to the component's feature window.
fn pos_targets(
    dims: &[usize],
    window: &FeatureWindow,
    target: ScatterTarget<'_, '_>,
    unit: Unit,
    locations: &UnitLocations,
    fast_path: bool,
) -> Result<Targets> {
    let [batch, seq, rest @ .., features] = dims else {
        return Err(MIError::Unit(format!(
            "pos scatter needs [batch, seq, ..., features], got {dims:?}"
        )));
    };
    let rows = locations.simple(unit)?;
    let width = check_rows(rows, *batch, *seq, "pos")?;
    let shared = fast_path && rows_identical(rows);
    if fast_path && !shared {
        warn!(component = target.component, "fast path requested but batch rows differ");
    }

    let mid: usize = rest.iter().product();
    let mut shape = vec![*batch, width];
    shape.extend_from_slice(rest);
    shape.push(window.len());
    let mut plan = Targets::new(shape);
    let first = rows.first().map_or(&[][..], Vec::as_slice);
    for (b, row) in rows.iter().enumerate() {
        let row = if shared { first } else { row.as_slice() };
        for &p in row {
            for m in 0..mid {
                let base = ((b * seq + p) * mid + m) * features;
                plan.push_run(base + window.start, window.len());
            }
        }
    }
    Ok(plan)
}

/// Head-addressed offsets.
///
/// The feature axis is read as `[n_components, n_heads, head_dim]` and the
/// component's fused slot is fixed.
///
/// # Shapes
/// - activation: `[batch, seq, n_components * n_heads * head_dim]`
/// - `h`: `[batch, k_heads, seq, head_dim]`
/// - `h.pos`: `[batch, k_heads, k_pos, head_dim]`
fn head_targets(
    dims: &[usize],
    window: &FeatureWindow,
    target: ScatterTarget<'_, '_>,
    unit: Unit,
    locations: &UnitLocations,
) -> Result<Targets> {
    let &[batch, seq, features] = dims else {
        return Err(MIError::Unit(format!(
            "head scatter needs [batch, seq, features], got {dims:?}"
        )));
    };
    let (n_heads, head_dim) = (window.n_heads, window.head_dim);
    let per_component = n_heads * head_dim;
    if per_component == 0 || features % per_component != 0 {
        return Err(MIError::Unit(format!(
            "feature axis {features} is not a multiple of {n_heads} heads x {head_dim}"
        )));
    }
    let n_components = features / per_component;
    let slot = match target.model.descriptor(target.component) {
        Some(descriptor) => descriptor.fused_slot(target.component)?,
        None => 0,
    };
    if slot >= n_components {
        return Err(MIError::UnsupportedSplit {
            component: target.component.to_owned(),
            reason: format!("slot {slot} out of {n_components} fused components"),
        });
    }
    // [b, s, c, h, d] row-major
    let cell = |b: usize, h: usize, s: usize| {
        (((b * seq + s) * n_components + slot) * n_heads + h) * head_dim
    };

    match unit {
        Unit::Composite(..) => {
            let (outer, inner) = locations.composite(unit)?;
            let k_heads = check_rows(outer, batch, n_heads, "outer")?;
            let k_pos = check_rows(inner, batch, seq, "inner")?;
            let mut plan = Targets::new(vec![batch, k_heads, k_pos, head_dim]);
            for (b, (heads, positions)) in outer.iter().zip(inner).enumerate() {
                trace!(batch = b, ?heads, ?positions, "head/pos scatter");
                for &h in heads {
                    for &s in positions {
                        plan.push_run(cell(b, h, s), head_dim);
                    }
                }
            }
            Ok(plan)
        }
        _ => {
            let rows = locations.simple(unit)?;
            let k_heads = check_rows(rows, batch, n_heads, "h")?;
            let mut plan = Targets::new(vec![batch, k_heads, seq, head_dim]);
            for (b, heads) in rows.iter().enumerate() {
                for &h in heads {
                    for s in 0..seq {
                        plan.push_run(cell(b, h, s), head_dim);
                    }
                }
            }
            Ok(plan)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::float_cmp,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::layout::{LayoutRegistry, ModelFamily, builtin};
    use candle_core::DType;

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    fn ramp(shape: &[usize]) -> Tensor {
        let n: usize = shape.iter().product();
        Tensor::arange(0f32, n as f32, &Device::Cpu)
            .unwrap()
            .reshape(shape)
            .unwrap()
    }

    fn with_ctx<R>(f: impl FnOnce(&ModelContext<'_>) -> R) -> R {
        let reg = builtin::registry();
        let config =
            serde_json::json!({"model_type": "gpt2", "n_embd": 8, "n_head": 2, "n_inner": null});
        let ctx = ModelContext::new(&reg, ModelFamily::Gpt2, &config);
        f(&ctx)
    }

    const POS: Unit = Unit::Simple(UnitAxis::Pos);
    const HEAD: Unit = Unit::Simple(UnitAxis::Head);
    const DIM: Unit = Unit::Simple(UnitAxis::Dim);
    const HEAD_POS: Unit = Unit::Composite(UnitAxis::Head, UnitAxis::Pos);

    #[test]
    fn unit_parsing() {
        assert_eq!("pos".parse::<Unit>().unwrap(), POS);
        assert_eq!(
            "dim.pos".parse::<Unit>().unwrap(),
            Unit::Composite(UnitAxis::Dim, UnitAxis::Pos)
        );
        assert!("h.pos.dim".parse::<Unit>().is_err());
        assert!("token".parse::<Unit>().is_err());
        assert_eq!(HEAD_POS.to_string(), "h.pos");
        assert!(HEAD_POS.is_composite());
    }

    #[test]
    fn gather_time_is_identity() {
        let t = ramp(&[2, 8]);
        let g = gather(&t, Unit::Time, &UnitLocations::Simple(vec![])).unwrap();
        assert_eq!(values(&g), values(&t));
    }

    #[test]
    fn gather_pos_rows() {
        let t = ramp(&[2, 5, 8]);
        let locs = UnitLocations::Simple(vec![vec![1, 3], vec![0, 4]]);
        let g = gather(&t, POS, &locs).unwrap();
        assert_eq!(g.dims(), &[2, 2, 8]);
        let v = values(&g);
        assert_eq!(v[0], 8.); // batch 0, pos 1
        assert_eq!(v[8], 24.); // batch 0, pos 3
        assert_eq!(v[16], 40.); // batch 1, pos 0
        assert_eq!(v[24], 72.); // batch 1, pos 4
    }

    #[test]
    fn gather_composite_selects_heads_then_positions() {
        // [b=1, h=3, s=4, d=2]
        let t = ramp(&[1, 3, 4, 2]);
        let locs = UnitLocations::Composite {
            outer: vec![vec![2, 0]],
            inner: vec![vec![3]],
        };
        let g = gather(&t, HEAD_POS, &locs).unwrap();
        assert_eq!(g.dims(), &[1, 2, 1, 2]);
        // head 2 pos 3 = 2*8 + 3*2 = 22; head 0 pos 3 = 6
        assert_eq!(values(&g), vec![22., 23., 6., 7.]);
    }

    #[test]
    fn gather_rejects_bad_locations() {
        let t = ramp(&[2, 5, 8]);
        let wrong_batch = UnitLocations::Simple(vec![vec![1]]);
        assert!(matches!(gather(&t, POS, &wrong_batch), Err(MIError::Unit(_))));
        let out_of_range = UnitLocations::Simple(vec![vec![1], vec![5]]);
        assert!(matches!(gather(&t, POS, &out_of_range), Err(MIError::Unit(_))));
        let ragged = UnitLocations::Simple(vec![vec![1, 2], vec![3]]);
        assert!(matches!(gather(&t, POS, &ragged), Err(MIError::Unit(_))));
        let pair = UnitLocations::Composite { outer: vec![], inner: vec![] };
        assert!(gather(&t, POS, &pair).is_err());
    }

    #[test]
    fn scatter_pos_writes_only_addressed_rows() {
        with_ctx(|ctx| {
            let mut t = ramp(&[2, 5, 8]);
            let original = values(&t);
            let locs = UnitLocations::Simple(vec![vec![1, 3], vec![0, 4]]);
            let repl = Tensor::full(-1f32, (2, 2, 8), &Device::Cpu).unwrap();
            let target = ScatterTarget::new(ctx, "block_output");
            scatter(&mut t, &repl, target, POS, &locs, false).unwrap();

            let v = values(&t);
            for b in 0..2 {
                for s in 0..5 {
                    let hit = matches!((b, s), (0, 1) | (0, 3) | (1, 0) | (1, 4));
                    for d in 0..8 {
                        let i = (b * 5 + s) * 8 + d;
                        if hit {
                            assert_eq!(v[i], -1.);
                        } else {
                            assert_eq!(v[i], original[i]);
                        }
                    }
                }
            }
        });
    }

    #[test]
    fn fast_path_matches_general_path() {
        with_ctx(|ctx| {
            let t = ramp(&[2, 5, 8]);
            let locs = UnitLocations::Simple(vec![vec![2, 4], vec![2, 4]]);
            let repl = Tensor::full(7f32, (2, 2, 8), &Device::Cpu).unwrap();
            let target = ScatterTarget::new(ctx, "block_output");
            let slow = scatter_copy(&t, &repl, target, POS, &locs, false).unwrap();
            let fast = scatter_copy(&t, &repl, target, POS, &locs, true).unwrap();
            assert_eq!(values(&slow), values(&fast));

            let differing = UnitLocations::Simple(vec![vec![2, 4], vec![0, 1]]);
            let slow = scatter_copy(&t, &repl, target, POS, &differing, false).unwrap();
            let fast = scatter_copy(&t, &repl, target, POS, &differing, true).unwrap();
            assert_eq!(values(&slow), values(&fast));
        });
    }

    #[test]
    fn scatter_pos_respects_feature_window() {
        with_ctx(|ctx| {
            // fused qkv output: [b=1, s=2, 3 * n_embd = 24]
            let t = ramp(&[1, 2, 24]);
            let locs = UnitLocations::Simple(vec![vec![1]]);
            let repl = Tensor::zeros((1, 1, 8), DType::F32, &Device::Cpu).unwrap();
            let target = ScatterTarget::new(ctx, "key_output");
            let out = scatter_copy(&t, &repl, target, POS, &locs, false).unwrap();
            let v = values(&out);
            // position 1 occupies 24..48; key third is 32..40
            for (i, x) in v.iter().enumerate() {
                if (32..40).contains(&i) {
                    assert_eq!(*x, 0.);
                } else {
                    assert_eq!(*x, i as f32);
                }
            }
        });
    }

    #[test]
    fn scatter_time_writes_window() {
        let reg = builtin::registry();
        let config = serde_json::json!({"model_type": "gru", "h_dim": 2});
        let ctx = ModelContext::new(&reg, ModelFamily::Gru, &config);
        let mut t = ramp(&[2, 6]);
        let repl = Tensor::full(-1f32, (2, 2), &Device::Cpu).unwrap();
        let locs = UnitLocations::Simple(vec![vec![0], vec![0]]);
        let target = ScatterTarget::new(&ctx, "update_x2h_output");
        scatter(&mut t, &repl, target, Unit::Time, &locs, false).unwrap();
        assert_eq!(values(&t), vec![0., 1., -1., -1., 4., 5., 6., 7., -1., -1., 10., 11.]);
    }

    #[test]
    fn scatter_head_into_fused_slot() {
        with_ctx(|ctx| {
            // [b=1, s=2, qkv=24]; value slot = 2, 2 heads of 4
            let t = ramp(&[1, 2, 24]);
            let locs = UnitLocations::Simple(vec![vec![1]]);
            let repl = Tensor::full(-1f32, (1, 1, 2, 4), &Device::Cpu).unwrap();
            let target = ScatterTarget::new(ctx, "head_value_output");
            let out = scatter_copy(&t, &repl, target, HEAD, &locs, false).unwrap();
            let v = values(&out);
            // value head 1 at each position: offset 16 + 4 .. 16 + 8
            for (i, x) in v.iter().enumerate() {
                let within = i % 24;
                if (20..24).contains(&within) {
                    assert_eq!(*x, -1.);
                } else {
                    assert_eq!(*x, i as f32);
                }
            }
        });
    }

    #[test]
    fn scatter_head_pos_single_cell() {
        with_ctx(|ctx| {
            // head_query_output: slot 0, 2 heads of 4, over [b=2, s=3, 24]
            let t = ramp(&[2, 3, 24]);
            let locs = UnitLocations::Composite {
                outer: vec![vec![1], vec![0]],
                inner: vec![vec![2], vec![0]],
            };
            let repl = Tensor::full(-1f32, (2, 1, 1, 4), &Device::Cpu).unwrap();
            let target = ScatterTarget::new(ctx, "head_query_output");
            let out = scatter_copy(&t, &repl, target, HEAD_POS, &locs, false).unwrap();
            let v = values(&out);
            // batch 0: pos 2, head 1 -> 0*72 + 2*24 + 4 .. +8
            // batch 1: pos 0, head 0 -> 72 + 0 .. 4
            let hits: Vec<usize> = (52..56).chain(72..76).collect();
            for (i, x) in v.iter().enumerate() {
                if hits.contains(&i) {
                    assert_eq!(*x, -1.);
                } else {
                    assert_eq!(*x, i as f32);
                }
            }
        });
    }

    #[test]
    fn scatter_dim_and_composite_default() {
        let reg = LayoutRegistry::builder().build();
        let config = serde_json::json!({});
        let ctx = ModelContext::new(&reg, ModelFamily::Mlp, &config);
        let target = ScatterTarget::new(&ctx, "h[0].act.output");

        let t = ramp(&[2, 4]);
        let locs = UnitLocations::Simple(vec![vec![3], vec![0]]);
        let repl = Tensor::full(-1f32, (2, 1), &Device::Cpu).unwrap();
        let out = scatter_copy(&t, &repl, target, DIM, &locs, false).unwrap();
        assert_eq!(values(&out), vec![0., 1., 2., -1., -1., 5., 6., 7.]);

        // [b=1, 3, 4]: outer axis 1, inner axis 2
        let t = ramp(&[1, 3, 4]);
        let locs = UnitLocations::Composite {
            outer: vec![vec![0, 2]],
            inner: vec![vec![1, 3]],
        };
        let repl = Tensor::full(-1f32, (1, 2, 2), &Device::Cpu).unwrap();
        let dim_pos = Unit::Composite(UnitAxis::Dim, UnitAxis::Pos);
        let out = scatter_copy(&t, &repl, target, dim_pos, &locs, false).unwrap();
        assert_eq!(
            values(&out),
            vec![0., -1., 2., -1., 4., 5., 6., 7., 8., -1., 10., -1.]
        );
    }

    #[test]
    fn failed_scatter_leaves_tensor_untouched() {
        with_ctx(|ctx| {
            let mut t = ramp(&[2, 5, 8]);
            let before = values(&t);
            let target = ScatterTarget::new(ctx, "block_output");
            let locs = UnitLocations::Simple(vec![vec![1, 9], vec![0, 4]]);
            let repl = Tensor::zeros((2, 2, 8), DType::F32, &Device::Cpu).unwrap();
            assert!(scatter(&mut t, &repl, target, POS, &locs, false).is_err());
            assert_eq!(values(&t), before);

            let locs = UnitLocations::Simple(vec![vec![1, 2], vec![0, 4]]);
            let wrong = Tensor::zeros((2, 3, 8), DType::F32, &Device::Cpu).unwrap();
            assert!(scatter(&mut t, &wrong, target, POS, &locs, false).is_err());
            assert_eq!(values(&t), before);
        });
    }

    #[test]
    fn composite_selection_commutes() {
        let t = Tensor::randn(0f32, 1., (2, 3, 5, 4), &Device::Cpu).unwrap();
        let heads = vec![vec![2, 0], vec![1, 1]];
        let positions = vec![vec![4, 1, 0], vec![3, 3, 2]];
        let locs = UnitLocations::Composite {
            outer: heads.clone(),
            inner: positions.clone(),
        };
        let heads_first = gather(&t, HEAD_POS, &locs).unwrap();

        let by_pos = t.permute((0, 2, 1, 3)).unwrap();
        let picked = gather_axis1(&by_pos, &positions, "pos").unwrap();
        let back = picked.permute((0, 2, 1, 3)).unwrap();
        let positions_first = gather_axis1(&back, &heads, "h").unwrap();

        assert_eq!(heads_first.dims(), &[2, 2, 3, 4]);
        assert_eq!(values(&heads_first), values(&positions_first));
    }

    #[test]
    fn head_gather_scatter_inverse() {
        with_ctx(|ctx| {
            let raw = Tensor::randn(0f32, 1., (2, 3, 24), &Device::Cpu).unwrap();
            let target = ScatterTarget::new(ctx, "head_query_output");
            let heads = crate::split::split(&raw, "head_query_output", ctx).unwrap();

            let locs = UnitLocations::Simple(vec![vec![1], vec![0]]);
            let g = gather(&heads, HEAD, &locs).unwrap();
            let mut copy = raw.copy().unwrap();
            scatter(&mut copy, &g, target, HEAD, &locs, false).unwrap();
            assert_eq!(values(&copy), values(&raw));

            let locs = UnitLocations::Composite {
                outer: vec![vec![0, 1], vec![1, 0]],
                inner: vec![vec![2], vec![0]],
            };
            let g = gather(&heads, HEAD_POS, &locs).unwrap();
            let mut copy = raw.copy().unwrap();
            scatter(&mut copy, &g, target, HEAD_POS, &locs, false).unwrap();
            assert_eq!(values(&copy), values(&raw));
        });
    }

    #[test]
    fn zero_width_scatter_is_noop() {
        with_ctx(|ctx| {
            let t = ramp(&[2, 5, 8]);
            let locs = UnitLocations::Simple(vec![vec![], vec![]]);
            let repl = Tensor::zeros((2, 0, 8), DType::F32, &Device::Cpu).unwrap();
            let target = ScatterTarget::new(ctx, "block_output");
            let out = scatter_copy(&t, &repl, target, POS, &locs, false).unwrap();
            assert_eq!(values(&out), values(&t));
        });
    }

    #[test]
    fn gather_scatter_inverse() {
        with_ctx(|ctx| {
            let target = ScatterTarget::new(ctx, "block_output");
            let t = Tensor::randn(0f32, 1., (2, 5, 8), &Device::Cpu).unwrap();
            let locs = UnitLocations::Simple(vec![vec![4, 1], vec![0, 2]]);
            for unit in [POS, DIM] {
                let g = gather(&t, unit, &locs).unwrap();
                let mut copy = t.copy().unwrap();
                scatter(&mut copy, &g, target, unit, &locs, false).unwrap();
                assert_eq!(values(&copy), values(&t));
            }
        });
    }

    #[test]
    fn scatter_plan_covers_only_written_heads() {
        let reg = builtin::registry();
        let config = serde_json::json!({"model_type": "gpt2", "n_embd": 768, "n_head": 12});
        let ctx = ModelContext::new(&reg, ModelFamily::Gpt2, &config);
        let target = ScatterTarget::new(&ctx, "head_value_output");
        // fused qkv activation [8, 256, 2304], never allocated
        let dims = [8, 256, 3 * 768];
        let window = feature_window(dims[2], "head_value_output", &ctx).unwrap();
        let locs = UnitLocations::Simple(vec![vec![1]; 8]);

        let plan = plan_targets(&dims, &window, target, HEAD, &locs, false).unwrap();
        assert_eq!(plan.shape, vec![8, 1, 256, 64]);
        assert_eq!(plan.offsets.len(), 8 * 256 * 64);
        // value slot starts at 2 * 768, head 1 at +64
        assert_eq!(plan.offsets[0], 2 * 768 + 64);
        assert!(plan.offsets.iter().all(|o| (1600..1664).contains(&(o % 2304))));
        let last = dims.iter().product::<usize>() - 2304 + 1663;
        assert_eq!(plan.offsets.last(), Some(&last));
    }
}

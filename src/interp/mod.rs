// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interventions: what to do with the addressed units.
//!
//! - [`intervention`]: the tagged [`Intervention`](intervention::Intervention)
//!   wrapper, the [`Transform`](intervention::Transform) trait and stock
//!   transforms.
//! - [`dispatch`]: flattening around a transform and the full
//!   split/gather/transform/scatter pipeline.

pub mod dispatch;
pub mod intervention;

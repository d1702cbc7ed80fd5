// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-intervene
//!
//! Activation addressing and intervention for models built on
//! [candle](https://github.com/huggingface/candle).
//!
//! Given a symbolic component name (`"head_value_output"`, `"mlp_input"`,
//! or a literal path such as `"h[0].mlp.act.output"`), candle-intervene
//! finds the sub-module to hook, slices the component out of a fused
//! activation, reads the addressed units (positions, heads, feature
//! dimensions, or head/position pairs), runs an intervention on them and
//! writes the result back in place.
//!
//! ## Pipeline
//!
//! - [`layout`] maps `(model family, component)` to a
//!   [`ComponentDescriptor`](layout::ComponentDescriptor), with built-in
//!   tables for GPT-2, `LLaMA`, GRU and MLP models and JSON tables via
//!   [`config`].
//! - [`navigate`] walks dotted/indexed attribute paths on any
//!   [`Navigable`] model or configuration.
//! - [`hooks`] turns a component and layer into an attachment point.
//! - [`dimension`] resolves per-component sizes from the model config.
//! - [`split`] slices a subcomponent out of the last axis.
//! - [`neurons`] gathers and scatters addressed units.
//! - [`interp`] holds intervention types and the dispatcher.
//!
//! ## Example
//!
//! ```
//! use candle_core::{Device, Tensor};
//! use candle_intervene::{
//!     Intervention, InterventionSite, ModelContext, ModelFamily, ScatterTarget, Unit,
//!     UnitLocations, intervene, layout,
//! };
//!
//! let config = serde_json::json!({"model_type": "gpt2", "n_embd": 8, "n_head": 2});
//! let ctx = ModelContext::new(layout::registry(), ModelFamily::Gpt2, &config);
//! let site = InterventionSite::new(
//!     ScatterTarget::new(&ctx, "block_output"),
//!     "pos".parse::<Unit>().unwrap(),
//!     UnitLocations::Simple(vec![vec![2]]),
//! );
//!
//! let mut base = Tensor::zeros((1, 4, 8), candle_core::DType::F32, &Device::Cpu).unwrap();
//! let source = Tensor::ones((1, 4, 8), candle_core::DType::F32, &Device::Cpu).unwrap();
//! intervene(&mut base, &source, &site, &Intervention::vanilla(), &Default::default()).unwrap();
//! assert_eq!(base.sum_all().unwrap().to_scalar::<f32>().unwrap(), 8.0);
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod dimension;
pub mod error;
pub mod hooks;
pub mod interp;
pub mod layout;
pub mod navigate;
pub mod neurons;
pub mod split;
pub mod util;

pub use error::{MIError, Result};
pub use hooks::{AttachmentPoint, Backend, HookKind, HookSite, module_hook};
pub use interp::dispatch::{InterventionSite, do_intervention, intervene};
pub use interp::intervention::{Extra, Intervened, Intervention, InterventionOutput, Transform};
pub use layout::{ComponentDescriptor, LayoutRegistry, ModelContext, ModelFamily};
pub use navigate::{ModuleTree, Navigable};
pub use neurons::{ScatterTarget, Unit, UnitAxis, UnitLocations, gather, scatter, scatter_copy};

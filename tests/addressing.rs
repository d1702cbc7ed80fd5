// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end addressing on small candle models.
//!
//! A two-layer candle-nn MLP implements [`Navigable`] so components resolve
//! against it directly; activations are captured and patched through the
//! public pipeline.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::float_cmp,
    clippy::cast_precision_loss,
    missing_docs
)]

use candle_core::{DType, Device, Module, Tensor};
use candle_intervene::layout::{self, LayoutRegistry, builtin};
use candle_intervene::{
    AttachmentPoint, Backend, Extra, HookKind, Intervention, InterventionSite, ModelContext,
    ModelFamily, ModuleTree, Navigable, ScatterTarget, Unit, UnitLocations, intervene, module_hook,
};
use candle_nn::Linear;

// ---------------------------------------------------------------------------
// Tiny MLP
// ---------------------------------------------------------------------------

struct Relu;

impl Navigable for Relu {
    fn attr(&self, _name: &str) -> Option<&dyn Navigable> {
        None
    }

    fn type_name(&self) -> Option<&str> {
        Some("ReLU")
    }
}

struct Layer {
    fc: Linear,
    act: Relu,
}

impl Navigable for Layer {
    fn attr(&self, name: &str) -> Option<&dyn Navigable> {
        match name {
            "act" => Some(&self.act),
            _ => None,
        }
    }

    fn type_name(&self) -> Option<&str> {
        Some("Layer")
    }
}

struct Layers(Vec<Layer>);

impl Navigable for Layers {
    fn attr(&self, _name: &str) -> Option<&dyn Navigable> {
        None
    }

    fn item(&self, index: usize) -> Option<&dyn Navigable> {
        self.0.get(index).map(|l| l as &dyn Navigable)
    }
}

struct TinyMlp {
    h: Layers,
}

impl Navigable for TinyMlp {
    fn attr(&self, name: &str) -> Option<&dyn Navigable> {
        match name {
            "h" => Some(&self.h),
            _ => None,
        }
    }

    fn type_name(&self) -> Option<&str> {
        Some("MLPModel")
    }
}

impl TinyMlp {
    /// Two position-wise layers, `4 -> 6 -> 4`, with fixed weights.
    fn new() -> Self {
        let dev = Device::Cpu;
        let w1 = Tensor::arange(0f32, 24., &dev)
            .unwrap()
            .affine(0.1, -1.0)
            .unwrap()
            .reshape((6, 4))
            .unwrap();
        let w2 = Tensor::arange(0f32, 24., &dev)
            .unwrap()
            .affine(-0.05, 0.6)
            .unwrap()
            .reshape((4, 6))
            .unwrap();
        let layer = |w: Tensor| Layer {
            fc: Linear::new(w, None),
            act: Relu,
        };
        Self {
            h: Layers(vec![layer(w1), layer(w2)]),
        }
    }

    /// Forward pass calling `hook` on the activation output of `hook_layer`.
    fn forward(
        &self,
        x: &Tensor,
        hook_layer: usize,
        hook: &mut dyn FnMut(&mut Tensor) -> candle_intervene::Result<()>,
    ) -> candle_intervene::Result<Tensor> {
        let mut h = x.clone();
        for (i, layer) in self.h.0.iter().enumerate() {
            h = layer.fc.forward(&h)?.relu()?;
            if i == hook_layer {
                hook(&mut h)?;
            }
        }
        Ok(h)
    }
}

fn values(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1().unwrap()
}

fn inputs() -> (Tensor, Tensor) {
    let base = Tensor::arange(0f32, 24., &Device::Cpu)
        .unwrap()
        .affine(0.1, 0.)
        .unwrap()
        .reshape((2, 3, 4))
        .unwrap();
    let source = base.affine(-1.0, 1.5).unwrap();
    (base, source)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn custom_model_resolves_hook_site() {
    let reg = builtin::registry();
    let model = TinyMlp::new();
    let point = module_hook(&reg, &model, "mlp_activation", 1, None, &Backend::Native).unwrap();
    let AttachmentPoint::Native(site) = point else {
        panic!("expected native attachment");
    };
    assert_eq!(site.module.type_name(), Some("ReLU"));
    assert_eq!(site.kind, HookKind::Output);
    assert_eq!(site.path, "h[1].act");
}

#[test]
fn activation_patching_on_tiny_mlp() {
    let reg = builtin::registry();
    let model = TinyMlp::new();
    let config = serde_json::json!({"model_type": "mlp", "h_dim": 6});
    let ctx = ModelContext::detect(&reg, &model, &config).unwrap();
    assert_eq!(ctx.family, ModelFamily::Mlp);

    let (base, source) = inputs();

    // Source run: capture layer 0's activation.
    let mut captured = None;
    let source_out = model
        .forward(&source, 0, &mut |h| {
            captured = Some(h.clone());
            Ok(())
        })
        .unwrap();
    let captured = captured.unwrap();
    let clean_out = model.forward(&base, 0, &mut |_| Ok(())).unwrap();

    // Base run: patch position 1 of every batch element with the source.
    let site = InterventionSite::new(
        ScatterTarget::new(&ctx, "mlp_activation"),
        "pos".parse::<Unit>().unwrap(),
        UnitLocations::Simple(vec![vec![1], vec![1]]),
    )
    .with_fast_path(true);
    let patched_out = model
        .forward(&base, 0, &mut |h| {
            intervene(h, &captured, &site, &Intervention::vanilla(), &Extra::new()).map(|_| ())
        })
        .unwrap();

    // The MLP is position-wise: position 1 follows the source run, the
    // others the clean run.
    let (patched, clean, src) = (values(&patched_out), values(&clean_out), values(&source_out));
    for b in 0..2 {
        for s in 0..3 {
            for d in 0..4 {
                let i = (b * 3 + s) * 4 + d;
                let expected = if s == 1 { src[i] } else { clean[i] };
                assert!((patched[i] - expected).abs() < 1e-5, "b={b} s={s} d={d}");
            }
        }
    }
}

#[test]
fn zeroing_whole_activation_on_tiny_mlp() {
    let reg = builtin::registry();
    let model = TinyMlp::new();
    let config = serde_json::json!({"model_type": "mlp", "h_dim": 6});
    let ctx = ModelContext::detect(&reg, &model, &config).unwrap();
    let (base, _) = inputs();

    let site = InterventionSite::new(
        ScatterTarget::new(&ctx, "mlp_activation"),
        Unit::Time,
        UnitLocations::Simple(vec![vec![], vec![]]),
    );
    let mut seen = None;
    model
        .forward(&base, 0, &mut |h| {
            let source = h.clone();
            intervene(h, &source, &site, &Intervention::zero(), &Extra::new())?;
            seen = Some(h.clone());
            Ok(())
        })
        .unwrap();
    assert!(values(&seen.unwrap()).iter().all(|&v| v == 0.));
}

#[test]
fn gpt2_tree_end_to_end() {
    let block = ModuleTree::new("GPT2Block").with_child(
        "attn",
        ModuleTree::new("GPT2Attention").with_child("c_attn", ModuleTree::new("Conv1D")),
    );
    let layers = ModuleTree::list("ModuleList", vec![block; 3]);
    let model = ModuleTree::new("GPT2Model").with_child("h", layers);
    let config =
        serde_json::json!({"model_type": "gpt2", "n_embd": 8, "n_head": 2, "n_inner": null});
    let reg = builtin::registry();

    let point = module_hook(&reg, &model, "head_key_output", 2, None, &Backend::Native).unwrap();
    assert_eq!(point.kind(), HookKind::Output);
    assert_eq!(point.module().type_name(), Some("Conv1D"));

    let ctx = ModelContext::detect(&reg, &model, &config).unwrap();
    let site = InterventionSite::new(
        ScatterTarget::new(&ctx, "head_key_output"),
        "h".parse().unwrap(),
        UnitLocations::Simple(vec![vec![1]]),
    );
    let n = 3 * 24;
    let mut qkv = Tensor::arange(0f32, n as f32, &Device::Cpu)
        .unwrap()
        .reshape((1, 3, 24))
        .unwrap();
    let zeros = Tensor::zeros((1, 3, 24), DType::F32, &Device::Cpu).unwrap();
    intervene(&mut qkv, &zeros, &site, &Intervention::vanilla(), &Extra::new()).unwrap();

    // key slot is 8..16, head 1 is its second half
    for (i, x) in values(&qkv).iter().enumerate() {
        let feature = i % 24;
        if (12..16).contains(&feature) {
            assert_eq!(*x, 0.);
        } else {
            assert_eq!(*x, i as f32);
        }
    }
}

#[test]
fn global_registry_installs_once() {
    let custom = builtin::mlp(LayoutRegistry::builder()).build();
    let first = layout::install(custom);
    assert!(first.is_ok());
    assert!(layout::install(builtin::registry()).is_err());
    let families: Vec<_> = layout::registry().families().cloned().collect();
    assert_eq!(families, vec![ModelFamily::Mlp]);
}

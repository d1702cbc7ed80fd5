// SPDX-License-Identifier: MIT OR Apache-2.0

//! Quick start: resolve GPT-2 components and patch one attention head.
//!
//! ```bash
//! RUST_LOG=debug cargo run --example quick_start_patching
//! ```
//!
//! Uses a synthetic fused QKV activation, so nothing is downloaded.

use candle_core::{DType, Device, Tensor};
use candle_intervene::{
    Backend, Extra, Intervention, InterventionSite, ModelContext, ModuleTree, ScatterTarget, Unit,
    UnitLocations, intervene, layout, module_hook,
};

fn main() -> candle_intervene::Result<()> {
    tracing_subscriber::fmt::init();

    // 1. Describe the model and its configuration
    let block = ModuleTree::new("GPT2Block").with_child(
        "attn",
        ModuleTree::new("GPT2Attention")
            .with_child("c_attn", ModuleTree::new("Conv1D"))
            .with_child("c_proj", ModuleTree::new("Conv1D")),
    );
    let layers = ModuleTree::list("ModuleList", vec![block; 12]);
    let model = ModuleTree::new("GPT2Model").with_child("h", layers);
    let config: serde_json::Value = serde_json::from_str(
        r#"{"model_type": "gpt2", "n_embd": 768, "n_head": 12, "n_inner": null}"#,
    )?;

    // 2. Find where to hook
    let registry = layout::registry();
    let point = module_hook(registry, &model, "head_value_output", 5, None, &Backend::Native)?;
    println!(
        "head_value_output @ layer 5 -> {:?} ({})",
        point.module(),
        point.kind()
    );

    // 3. Fake a clean and a corrupted c_attn output: [batch, seq, 3 * n_embd]
    let (batch, seq, fused) = (2, 6, 3 * 768);
    let mut corrupted = Tensor::zeros((batch, seq, fused), DType::F32, &Device::Cpu)?;
    let clean = Tensor::ones((batch, seq, fused), DType::F32, &Device::Cpu)?;

    // 4. Patch value head 3 at the last position from the clean run
    let ctx = ModelContext::detect(registry, &model, &config)?;
    let site = InterventionSite::new(
        ScatterTarget::new(&ctx, "head_value_output"),
        "h.pos".parse::<Unit>()?,
        UnitLocations::Composite {
            outer: vec![vec![3]; batch],
            inner: vec![vec![seq - 1]; batch],
        },
    );
    let out = intervene(&mut corrupted, &clean, &site, &Intervention::vanilla(), &Extra::new())?;
    println!("patched units: {:?}", out.tensor().dims());

    // 5. Exactly one head_dim slice per batch element changed
    let changed = corrupted.sum_all()?.to_scalar::<f32>()?;
    println!("changed elements: {changed} (expected {})", batch * 768 / 12);

    Ok(())
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Built-in layout and dimension tables.
//!
//! | Family | Type names | Layer container |
//! |--------|-----------|-----------------|
//! | GPT-2 | `GPT2Model`, `gpt2` | `h[i]`, fused `c_attn` QKV |
//! | `LLaMA` | `LlamaModel`, `llama` | `layers[i]`, separate projections |
//! | GRU | `GRUModel`, `gru` | `cells[i]`, fused `x2h` gates |
//! | MLP | `MLPModel`, `mlp` | `h[i]` |
//!
//! `model_type` strings are accepted so a parsed `config.json` identifies
//! its own family.

use crate::dimension::{DimProposal, Operand};
use crate::hooks::HookKind;

use super::{
    ComponentDescriptor, LayoutRegistry, LayoutRegistryBuilder, ModelFamily, PathTemplate, SplitFn,
    SplitParam,
};

fn at(path: &str, hook: HookKind) -> ComponentDescriptor {
    ComponentDescriptor::new(PathTemplate::new(path), hook)
}

fn attr(name: &str) -> DimProposal {
    DimProposal::Attr(name.to_owned())
}

fn scaled(name: &str, factor: usize) -> DimProposal {
    DimProposal::Scaled {
        base: Operand::Attr(name.to_owned()),
        factor,
    }
}

fn ratio(num: &str, den: &str) -> DimProposal {
    DimProposal::Ratio {
        num: Operand::Attr(num.to_owned()),
        den: Operand::Attr(den.to_owned()),
    }
}

fn heads(name: &str) -> SplitParam {
    SplitParam::Dimension(name.to_owned())
}

/// Registry holding every built-in family.
#[must_use]
pub fn registry() -> LayoutRegistry {
    let b = LayoutRegistry::builder();
    let b = gpt2(b);
    let b = llama(b);
    let b = gru(b);
    mlp(b).build()
}

/// GPT-2: fused QKV in `c_attn`, heads merged before `c_proj`.
pub fn gpt2(b: LayoutRegistryBuilder) -> LayoutRegistryBuilder {
    use HookKind::{Input, Output};
    let f = ModelFamily::Gpt2;
    let qkv = "h[{layer}].attn.c_attn";
    let mut b = b
        .family_type_names(f.clone(), ["GPT2Model", "gpt2"])
        .component(&f, "block_input", at("h[{layer}]", Input))
        .component(&f, "block_output", at("h[{layer}]", Output))
        .component(&f, "mlp_activation", at("h[{layer}].mlp.act", Output))
        .component(&f, "mlp_output", at("h[{layer}].mlp", Output))
        .component(&f, "mlp_input", at("h[{layer}].mlp", Input))
        .component(&f, "attention_value_output", at("h[{layer}].attn.c_proj", Input))
        .component(
            &f,
            "head_attention_value_output",
            at("h[{layer}].attn.c_proj", Input).split(SplitFn::HeadAndPermute, heads("n_head")),
        )
        .component(&f, "attention_output", at("h[{layer}].attn", Output))
        .component(&f, "attention_input", at("h[{layer}].attn", Input));

    for (slot, name) in ["query", "key", "value"].iter().enumerate() {
        b = b
            .component(
                &f,
                format!("{name}_output"),
                at(qkv, Output).split(SplitFn::Three, SplitParam::Literal(slot)),
            )
            .component(
                &f,
                format!("head_{name}_output"),
                at(qkv, Output)
                    .split(SplitFn::Three, SplitParam::Literal(slot))
                    .split(SplitFn::HeadAndPermute, heads("n_head")),
            )
            .dimension_proposals(&f, format!("{name}_output"), vec![attr("n_embd")])
            .dimension_proposals(
                &f,
                format!("head_{name}_output"),
                vec![ratio("n_embd", "n_head")],
            );
    }

    b.dimension_proposals(&f, "n_head", vec![attr("n_head")])
        .dimension_proposals(&f, "block_input", vec![attr("n_embd")])
        .dimension_proposals(&f, "block_output", vec![attr("n_embd")])
        .dimension_proposals(&f, "mlp_activation", vec![attr("n_inner"), scaled("n_embd", 4)])
        .dimension_proposals(&f, "mlp_output", vec![attr("n_embd")])
        .dimension_proposals(&f, "mlp_input", vec![attr("n_embd")])
        .dimension_proposals(&f, "attention_value_output", vec![attr("n_embd")])
        .dimension_proposals(&f, "head_attention_value_output", vec![ratio("n_embd", "n_head")])
        .dimension_proposals(&f, "attention_output", vec![attr("n_embd")])
        .dimension_proposals(&f, "attention_input", vec![attr("n_embd")])
}

/// `LLaMA`: separate projections, grouped-query key/value heads.
pub fn llama(b: LayoutRegistryBuilder) -> LayoutRegistryBuilder {
    use HookKind::{Input, Output};
    let f = ModelFamily::Llama;
    b.family_type_names(f.clone(), ["LlamaModel", "llama"])
        .component(&f, "block_input", at("layers[{layer}]", Input))
        .component(&f, "block_output", at("layers[{layer}]", Output))
        .component(&f, "mlp_activation", at("layers[{layer}].mlp.act_fn", Output))
        .component(&f, "mlp_output", at("layers[{layer}].mlp", Output))
        .component(&f, "mlp_input", at("layers[{layer}].mlp", Input))
        .component(&f, "attention_value_output", at("layers[{layer}].self_attn.o_proj", Input))
        .component(
            &f,
            "head_attention_value_output",
            at("layers[{layer}].self_attn.o_proj", Input)
                .split(SplitFn::HeadAndPermute, heads("n_head")),
        )
        .component(&f, "attention_output", at("layers[{layer}].self_attn", Output))
        .component(&f, "attention_input", at("layers[{layer}].self_attn", Input))
        .component(&f, "query_output", at("layers[{layer}].self_attn.q_proj", Output))
        .component(&f, "key_output", at("layers[{layer}].self_attn.k_proj", Output))
        .component(&f, "value_output", at("layers[{layer}].self_attn.v_proj", Output))
        .component(
            &f,
            "head_query_output",
            at("layers[{layer}].self_attn.q_proj", Output)
                .split(SplitFn::HeadAndPermute, heads("n_head")),
        )
        .component(
            &f,
            "head_key_output",
            at("layers[{layer}].self_attn.k_proj", Output)
                .split(SplitFn::HeadAndPermute, heads("n_kv_head")),
        )
        .component(
            &f,
            "head_value_output",
            at("layers[{layer}].self_attn.v_proj", Output)
                .split(SplitFn::HeadAndPermute, heads("n_kv_head")),
        )
        .dimension_proposals(&f, "n_head", vec![attr("num_attention_heads")])
        .dimension_proposals(&f, "n_kv_head", vec![attr("num_key_value_heads")])
        .dimension_proposals(&f, "block_input", vec![attr("hidden_size")])
        .dimension_proposals(&f, "block_output", vec![attr("hidden_size")])
        .dimension_proposals(&f, "mlp_activation", vec![attr("intermediate_size")])
        .dimension_proposals(&f, "mlp_output", vec![attr("hidden_size")])
        .dimension_proposals(&f, "mlp_input", vec![attr("hidden_size")])
        .dimension_proposals(&f, "attention_value_output", vec![attr("hidden_size")])
        .dimension_proposals(
            &f,
            "head_attention_value_output",
            vec![ratio("hidden_size", "num_attention_heads")],
        )
        .dimension_proposals(&f, "attention_output", vec![attr("hidden_size")])
        .dimension_proposals(&f, "attention_input", vec![attr("hidden_size")])
        .dimension_proposals(&f, "query_output", vec![attr("hidden_size")])
        .dimension_proposals(&f, "key_output", vec![attr("hidden_size")])
        .dimension_proposals(&f, "value_output", vec![attr("hidden_size")])
        .dimension_proposals(
            &f,
            "head_query_output",
            vec![ratio("hidden_size", "num_attention_heads")],
        )
        .dimension_proposals(
            &f,
            "head_key_output",
            vec![ratio("hidden_size", "num_attention_heads")],
        )
        .dimension_proposals(
            &f,
            "head_value_output",
            vec![ratio("hidden_size", "num_attention_heads")],
        )
}

/// GRU: per-cell gates fused in `x2h` / `h2h` as `[reset, update, new]`.
pub fn gru(b: LayoutRegistryBuilder) -> LayoutRegistryBuilder {
    use HookKind::{Input, Output};
    let f = ModelFamily::Gru;
    let mut b = b
        .family_type_names(f.clone(), ["GRUModel", "gru"])
        .component(&f, "cell_input", at("cells[{layer}]", Input))
        .component(&f, "cell_output", at("cells[{layer}]", Output))
        .component(&f, "x2h_output", at("cells[{layer}].x2h", Output))
        .component(&f, "h2h_output", at("cells[{layer}].h2h", Output))
        .dimension_proposals(&f, "cell_input", vec![attr("h_dim")])
        .dimension_proposals(&f, "cell_output", vec![attr("h_dim")])
        .dimension_proposals(&f, "x2h_output", vec![scaled("h_dim", 3)])
        .dimension_proposals(&f, "h2h_output", vec![scaled("h_dim", 3)]);

    for (slot, gate) in ["reset", "update", "new"].iter().enumerate() {
        for proj in ["x2h", "h2h"] {
            b = b
                .component(
                    &f,
                    format!("{gate}_{proj}_output"),
                    at(&format!("cells[{{layer}}].{proj}"), Output)
                        .split(SplitFn::Three, SplitParam::Literal(slot)),
                )
                .dimension_proposals(&f, format!("{gate}_{proj}_output"), vec![attr("h_dim")]);
        }
    }
    b
}

/// Plain MLP stack.
pub fn mlp(b: LayoutRegistryBuilder) -> LayoutRegistryBuilder {
    use HookKind::{Input, Output};
    let f = ModelFamily::Mlp;
    b.family_type_names(f.clone(), ["MLPModel", "mlp"])
        .component(&f, "block_input", at("h[{layer}]", Input))
        .component(&f, "block_output", at("h[{layer}]", Output))
        .component(&f, "mlp_activation", at("h[{layer}].act", Output))
        .dimension_proposals(&f, "block_input", vec![attr("h_dim")])
        .dimension_proposals(&f, "block_output", vec![attr("h_dim")])
        .dimension_proposals(&f, "mlp_activation", vec![attr("h_dim")])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::dimension::resolve_dimension;

    #[test]
    fn gpt2_query_is_first_third() {
        let reg = registry();
        let d = reg.descriptor(&ModelFamily::Gpt2, "head_key_output").unwrap();
        assert_eq!(d.render_path(4, None).unwrap(), "h[4].attn.c_attn");
        assert_eq!(d.splits.len(), 2);
        assert_eq!(d.fused_slot("head_key_output").unwrap(), 1);
    }

    #[test]
    fn gpt2_mlp_activation_falls_back_to_scaled() {
        let reg = registry();
        let config = serde_json::json!({
            "model_type": "gpt2",
            "n_embd": 768,
            "n_inner": null,
            "n_head": 12
        });
        let family = reg.model_family(&config).unwrap();
        assert_eq!(family, ModelFamily::Gpt2);
        assert_eq!(
            resolve_dimension(&reg, &family, &config, "mlp_activation").unwrap(),
            Some(3072)
        );
        assert_eq!(
            resolve_dimension(&reg, &family, &config, "head_query_output").unwrap(),
            Some(64)
        );
    }

    #[test]
    fn gru_gate_components() {
        let reg = registry();
        let d = reg.descriptor(&ModelFamily::Gru, "new_h2h_output").unwrap();
        assert_eq!(d.render_path(0, None).unwrap(), "cells[0].h2h");
        assert_eq!(d.fused_slot("new_h2h_output").unwrap(), 2);
    }

    #[test]
    fn families_registered_in_order() {
        let reg = registry();
        let families: Vec<_> = reg.families().cloned().collect();
        assert_eq!(
            families,
            vec![ModelFamily::Gpt2, ModelFamily::Llama, ModelFamily::Gru, ModelFamily::Mlp]
        );
    }
}

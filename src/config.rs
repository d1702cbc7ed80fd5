// SPDX-License-Identifier: MIT OR Apache-2.0

//! Layout tables loaded from JSON.
//!
//! A [`LayoutTableFile`] declares model families, their component
//! descriptors and their dimension proposals, and merges into a
//! [`LayoutRegistryBuilder`]. Families named like a built-in one (`gpt2`,
//! `llama`, `gru`, `mlp`) extend or override it; any other name becomes
//! [`ModelFamily::Custom`].
//!
//! # Usage
//!
//! ```
//! use candle_intervene::config::LayoutTableFile;
//! use candle_intervene::layout::{LayoutRegistry, ModelFamily};
//!
//! let table = r#"{"families": [{
//!     "name": "opt",
//!     "type_names": ["OPTModel"],
//!     "components": {
//!         "block_output": {"path": "decoder.layers[%s]", "hook": "output"},
//!         "head_query_output": {
//!             "path": "decoder.layers[%s].self_attn.q_proj",
//!             "hook": "output",
//!             "splits": [{"fn": "head_and_permute", "param": "n_head"}]
//!         }
//!     },
//!     "dimensions": {"block_output": ["hidden_size"], "n_head": ["num_attention_heads"]}
//! }]}"#;
//! let file = LayoutTableFile::from_json_str(table).unwrap();
//! let registry = file.apply(LayoutRegistry::builder()).unwrap().build();
//! let opt = ModelFamily::from("opt");
//! assert!(registry.descriptor(&opt, "head_query_output").is_some());
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{MIError, Result};
use crate::hooks::HookKind;
use crate::layout::{
    ComponentDescriptor, LayoutRegistryBuilder, ModelFamily, PathTemplate, SplitFn, SplitParam,
};

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

/// Top-level layout table document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LayoutTableFile {
    /// Family tables, registered in order.
    #[serde(default)]
    pub families: Vec<FamilyTable>,
}

/// One model family.
#[derive(Debug, Clone, Deserialize)]
pub struct FamilyTable {
    /// Family tag, e.g. `"gpt2"` or `"opt"`.
    pub name: String,
    /// Model type names that identify the family. When empty the family
    /// keeps whatever matcher is already registered.
    #[serde(default)]
    pub type_names: Vec<String>,
    /// Component name to descriptor.
    #[serde(default)]
    pub components: BTreeMap<String, ComponentEntry>,
    /// Component (or dimension) name to proposals, tried in order.
    #[serde(default)]
    pub dimensions: BTreeMap<String, Vec<String>>,
}

/// One component descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentEntry {
    /// Attachment path template (`{layer}` / `{expert}` or `%s` markers).
    pub path: String,
    /// `"input"` or `"output"`.
    pub hook: String,
    /// Split specs applied in order.
    #[serde(default)]
    pub splits: Vec<SplitEntry>,
}

/// One split spec.
#[derive(Debug, Clone, Deserialize)]
pub struct SplitEntry {
    /// Split function name, e.g. `"three"` or `"split_head_and_permute"`.
    #[serde(rename = "fn")]
    pub func: String,
    /// Literal slot / head count, or a dimension name.
    pub param: SplitParamEntry,
}

/// Split parameter as written in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SplitParamEntry {
    /// Integer literal.
    Literal(usize),
    /// Dimension name resolved against the model configuration.
    Dimension(String),
}

impl From<SplitParamEntry> for SplitParam {
    fn from(entry: SplitParamEntry) -> Self {
        match entry {
            SplitParamEntry::Literal(v) => Self::Literal(v),
            SplitParamEntry::Dimension(name) => Self::Dimension(name),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl LayoutTableFile {
    /// Parse a layout table from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Json`] on malformed JSON or a schema mismatch.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse a layout table from an already-parsed JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Json`] on a schema mismatch.
    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(Self::deserialize(value)?)
    }

    /// Read and parse a layout table file.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] if the file cannot be read and
    /// [`MIError::Json`] if it does not parse.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            MIError::Config(format!("cannot read layout table {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    /// Merge every family table into `builder`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] for an unknown hook kind, split function,
    /// malformed path template or dimension proposal.
    pub fn apply(self, mut builder: LayoutRegistryBuilder) -> Result<LayoutRegistryBuilder> {
        for table in self.families {
            builder = table.apply(builder)?;
        }
        Ok(builder)
    }
}

impl FamilyTable {
    fn apply(self, mut builder: LayoutRegistryBuilder) -> Result<LayoutRegistryBuilder> {
        let family = ModelFamily::from(self.name.as_str());
        debug!(
            %family,
            components = self.components.len(),
            dimensions = self.dimensions.len(),
            "loading layout table"
        );
        if !self.type_names.is_empty() {
            builder = builder.family_type_names(family.clone(), self.type_names);
        }
        for (name, entry) in self.components {
            builder = builder.component(&family, name, entry.into_descriptor()?);
        }
        for (name, proposals) in &self.dimensions {
            let proposals: Vec<&str> = proposals.iter().map(String::as_str).collect();
            builder = builder.dimension(&family, name.as_str(), &proposals)?;
        }
        Ok(builder)
    }
}

impl ComponentEntry {
    fn into_descriptor(self) -> Result<ComponentDescriptor> {
        let path: PathTemplate = self.path.parse()?;
        let hook: HookKind = self.hook.parse()?;
        let mut descriptor = ComponentDescriptor::new(path, hook);
        for split in self.splits {
            let func: SplitFn = split.func.parse()?;
            descriptor = descriptor.split(func, split.param.into());
        }
        Ok(descriptor)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::dimension::resolve_dimension;
    use crate::layout::{LayoutRegistry, builtin};
    use crate::navigate::ModuleTree;

    const TABLE: &str = r#"{
        "families": [{
            "name": "opt",
            "type_names": ["OPTModel", "opt"],
            "components": {
                "block_output": {"path": "decoder.layers[{layer}]", "hook": "output"},
                "mlp_input": {"path": "decoder.layers[{layer}].fc1", "hook": "input"},
                "head_value_output": {
                    "path": "decoder.layers[%s].self_attn.v_proj",
                    "hook": "output",
                    "splits": [{"fn": "split_head_and_permute", "param": "n_head"}]
                },
                "expert_output": {"path": "decoder.layers[%s].experts[%s]", "hook": "output"}
            },
            "dimensions": {
                "block_output": ["hidden_size"],
                "n_head": ["num_attention_heads"],
                "head_value_output": ["hidden_size/num_attention_heads"]
            }
        }]
    }"#;

    #[test]
    fn loads_custom_family() {
        let registry = LayoutTableFile::from_json_str(TABLE)
            .unwrap()
            .apply(LayoutRegistry::builder())
            .unwrap()
            .build();
        let opt = ModelFamily::from("opt");
        assert_eq!(registry.model_family(&ModuleTree::new("OPTModel")).unwrap(), opt);

        let d = registry.descriptor(&opt, "head_value_output").unwrap();
        assert_eq!(d.render_path(4, None).unwrap(), "decoder.layers[4].self_attn.v_proj");
        assert_eq!(d.splits.len(), 1);
        assert_eq!(d.splits[0].param, SplitParam::Dimension("n_head".into()));

        let d = registry.descriptor(&opt, "expert_output").unwrap();
        assert_eq!(d.render_path(1, Some(3)).unwrap(), "decoder.layers[1].experts[3]");
        assert_eq!(registry.descriptor(&opt, "mlp_input").unwrap().hook, HookKind::Input);

        let config = serde_json::json!({"hidden_size": 64, "num_attention_heads": 4});
        assert_eq!(
            resolve_dimension(&registry, &opt, &config, "head_value_output").unwrap(),
            Some(16)
        );
    }

    #[test]
    fn extends_builtin_family() {
        let table = r#"{"families": [{"name": "gpt2", "components": {
            "ln_2_input": {"path": "h[{layer}].ln_2", "hook": "input"}
        }}]}"#;
        let registry = LayoutTableFile::from_json_str(table)
            .unwrap()
            .apply(builtin::gpt2(LayoutRegistry::builder()))
            .unwrap()
            .build();
        assert!(registry.descriptor(&ModelFamily::Gpt2, "ln_2_input").is_some());
        assert!(registry.descriptor(&ModelFamily::Gpt2, "query_output").is_some());
        assert_eq!(registry.families().count(), 1);
    }

    #[test]
    fn bad_entries_are_config_errors() {
        let bad_hook = r#"{"families": [{
            "name": "x",
            "components": {"c": {"path": "a", "hook": "middle"}}
        }]}"#;
        let file = LayoutTableFile::from_json_str(bad_hook).unwrap();
        assert!(matches!(file.apply(LayoutRegistry::builder()), Err(MIError::Config(_))));

        let bad_split = r#"{"families": [{
            "name": "x",
            "components": {"c": {
                "path": "a",
                "hook": "output",
                "splits": [{"fn": "quarter", "param": 0}]
            }}
        }]}"#;
        let file = LayoutTableFile::from_json_str(bad_split).unwrap();
        assert!(matches!(file.apply(LayoutRegistry::builder()), Err(MIError::Config(_))));

        assert!(matches!(
            LayoutTableFile::from_json_str(r#"{"families": 3}"#),
            Err(MIError::Json(_))
        ));
        assert!(LayoutTableFile::from_path("/nonexistent/layout.json").is_err());
    }

    #[test]
    fn from_value_matches_from_str() {
        let value: Value = serde_json::from_str(TABLE).unwrap();
        let file = LayoutTableFile::from_value(&value).unwrap();
        assert_eq!(file.families.len(), 1);
        assert_eq!(file.families[0].components.len(), 4);
    }
}

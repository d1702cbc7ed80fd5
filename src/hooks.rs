// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook attachment points.
//!
//! Provides [`HookKind`] (read a module's input or its output),
//! [`Backend`] (where the forward pass runs) and [`module_hook`], which
//! turns a symbolic component into the concrete sub-module the caller
//! should attach its hook to. Registering and removing hooks stays with the
//! caller.

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::{MIError, Result};
use crate::layout::{ComponentDescriptor, LayoutRegistry};
use crate::navigate::{Navigable, navigate};

// ---------------------------------------------------------------------------
// HookKind
// ---------------------------------------------------------------------------

/// Which side of a module the hook observes.
///
/// ```
/// use candle_intervene::HookKind;
///
/// assert_eq!(HookKind::Output.to_string(), "output");
/// assert_eq!("input".parse::<HookKind>().unwrap(), HookKind::Input);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Pre-forward hook: sees the module's input.
    Input,
    /// Forward hook: sees the module's output.
    Output,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

impl FromStr for HookKind {
    type Err = MIError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "input" => Ok(Self::Input),
            "output" => Ok(Self::Output),
            other => Err(MIError::Config(format!("unknown hook kind `{other}`"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Execution backend the hook is meant for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// In-process forward pass; the caller attaches to the returned site.
    Native,
    /// Remote execution; input vs. output is interpreted by the caller.
    Remote(String),
}

impl From<&str> for Backend {
    fn from(tag: &str) -> Self {
        match tag {
            "native" => Self::Native,
            other => Self::Remote(other.to_owned()),
        }
    }
}

// ---------------------------------------------------------------------------
// AttachmentPoint
// ---------------------------------------------------------------------------

/// A resolved native hook site.
#[derive(Debug, Clone)]
pub struct HookSite<'m> {
    /// The sub-module to hook.
    pub module: &'m dyn Navigable,
    /// Whether to hook its input or its output.
    pub kind: HookKind,
    /// Concrete dotted path of `module` from the model root.
    pub path: String,
}

impl HookSite<'_> {
    /// Whether the hook runs before the module's forward.
    #[must_use]
    pub const fn is_pre_forward(&self) -> bool {
        matches!(self.kind, HookKind::Input)
    }
}

/// Where to attach a hook, per backend.
#[derive(Debug, Clone)]
pub enum AttachmentPoint<'m> {
    /// Native backend: a concrete hook site.
    Native(HookSite<'m>),
    /// Remote backend: the module and hook kind, uninterpreted.
    Remote(&'m dyn Navigable, HookKind),
}

impl<'m> AttachmentPoint<'m> {
    /// The module to attach to, regardless of backend.
    #[must_use]
    pub fn module(&self) -> &'m dyn Navigable {
        match self {
            Self::Native(site) => site.module,
            Self::Remote(module, _) => *module,
        }
    }

    /// The hook kind, regardless of backend.
    #[must_use]
    pub fn kind(&self) -> HookKind {
        match self {
            Self::Native(site) => site.kind,
            Self::Remote(_, kind) => *kind,
        }
    }
}

/// Resolve a descriptor on a live model.
///
/// # Errors
///
/// Returns [`MIError::Config`] if the path needs an expert index that was
/// not given, or [`MIError::AttributePath`] if the model has no such
/// sub-module.
pub fn attachment_point<'m>(
    model: &'m dyn Navigable,
    descriptor: &ComponentDescriptor,
    layer: usize,
    expert: Option<usize>,
    backend: &Backend,
) -> Result<AttachmentPoint<'m>> {
    let path = descriptor.render_path(layer, expert)?;
    let module = navigate(model, &path)?;
    debug!(path = %path, kind = %descriptor.hook, ?backend, "resolved attachment point");
    Ok(match backend {
        Backend::Native => AttachmentPoint::Native(HookSite {
            module,
            kind: descriptor.hook,
            path,
        }),
        Backend::Remote(_) => AttachmentPoint::Remote(module, descriptor.hook),
    })
}

/// Find the sub-module and hook kind for `component` at `layer`.
///
/// The model's family is detected through the registry's predicates, then
/// the component is resolved (registered, or a literal `*.input` /
/// `*.output` path) and navigated.
///
/// # Errors
///
/// Returns [`MIError::UnknownModelType`], [`MIError::UnknownComponent`] or
/// [`MIError::AttributePath`] at the first step that fails.
pub fn module_hook<'m>(
    registry: &LayoutRegistry,
    model: &'m dyn Navigable,
    component: &str,
    layer: usize,
    expert: Option<usize>,
    backend: &Backend,
) -> Result<AttachmentPoint<'m>> {
    let family = registry.model_family(model)?;
    let descriptor = registry.resolve(&family, component)?;
    attachment_point(model, &descriptor, layer, expert, backend)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::layout::builtin;
    use crate::navigate::ModuleTree;

    fn gpt2() -> ModuleTree {
        let block = ModuleTree::new("GPT2Block")
            .with_child(
                "attn",
                ModuleTree::new("GPT2Attention")
                    .with_child("c_attn", ModuleTree::new("Conv1D"))
                    .with_child("c_proj", ModuleTree::new("Conv1D")),
            )
            .with_child(
                "mlp",
                ModuleTree::new("GPT2MLP").with_child("act", ModuleTree::new("NewGELUActivation")),
            );
        ModuleTree::new("GPT2Model").with_child("h", ModuleTree::list("ModuleList", vec![block; 2]))
    }

    #[test]
    fn hook_kind_parse() {
        assert_eq!("output".parse::<HookKind>().unwrap(), HookKind::Output);
        assert!("middle".parse::<HookKind>().is_err());
    }

    #[test]
    fn native_attachment_for_registered_component() {
        let reg = builtin::registry();
        let model = gpt2();
        let point = module_hook(&reg, &model, "query_output", 1, None, &Backend::Native).unwrap();
        match point {
            AttachmentPoint::Native(site) => {
                assert_eq!(site.module.type_name(), Some("Conv1D"));
                assert!(!site.is_pre_forward());
                assert_eq!(site.path, "h[1].attn.c_attn");
            }
            AttachmentPoint::Remote(..) => panic!("expected native attachment"),
        }
    }

    #[test]
    fn remote_attachment_returns_pair() {
        let reg = builtin::registry();
        let model = gpt2();
        let backend = Backend::from("ndif");
        let point = module_hook(&reg, &model, "h[0].mlp.act.input", 0, None, &backend).unwrap();
        assert!(matches!(point, AttachmentPoint::Remote(_, HookKind::Input)));
        assert_eq!(point.module().type_name(), Some("NewGELUActivation"));
    }

    #[test]
    fn bare_output_hooks_the_model_itself() {
        let reg = builtin::registry();
        let model = gpt2();
        let point = module_hook(&reg, &model, "output", 0, None, &Backend::Native).unwrap();
        let AttachmentPoint::Native(site) = point else {
            panic!("expected native attachment");
        };
        assert_eq!(site.module.type_name(), Some("GPT2Model"));
        assert_eq!(site.kind, HookKind::Output);
        assert!(site.path.is_empty());
    }

    #[test]
    fn layer_out_of_range_is_path_error() {
        let reg = builtin::registry();
        let model = gpt2();
        assert!(matches!(
            module_hook(&reg, &model, "block_output", 5, None, &Backend::Native),
            Err(MIError::AttributePath { .. })
        ));
    }

    #[test]
    fn unknown_model_type() {
        let reg = builtin::registry();
        let model = ModuleTree::new("BertModel");
        assert!(matches!(
            module_hook(&reg, &model, "block_output", 0, None, &Backend::Native),
            Err(MIError::UnknownModelType(_))
        ));
    }
}

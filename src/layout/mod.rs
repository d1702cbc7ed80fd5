// SPDX-License-Identifier: MIT OR Apache-2.0

//! Component layout resolution.
//!
//! A [`LayoutRegistry`] maps `(model family, component name)` to a
//! [`ComponentDescriptor`]: where to attach in the model, whether to read the
//! module's input or output, and how to slice the component out of a fused
//! tensor. It also carries the per-family dimension tables used by
//! [`crate::dimension`].
//!
//! The registry is immutable once built. A process-wide instance can be
//! installed once with [`install`] and read back with [`registry`]; without
//! an explicit install, [`registry`] serves the built-in tables from
//! [`builtin`].

pub mod builtin;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use tracing::debug;

use crate::dimension::DimProposal;
use crate::error::{MIError, Result};
use crate::hooks::HookKind;
use crate::navigate::Navigable;

// ---------------------------------------------------------------------------
// ModelFamily
// ---------------------------------------------------------------------------

/// Closed set of supported model families.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    /// GPT-2 style decoder with fused `c_attn` QKV projection.
    Gpt2,
    /// `LLaMA` style decoder with separate Q/K/V projections.
    Llama,
    /// Gated recurrent unit network (stateful, addressed per time step).
    Gru,
    /// Plain multi-layer perceptron.
    Mlp,
    /// Family registered at runtime from a layout table file.
    Custom(String),
}

impl ModelFamily {
    /// Whether the family has no recurrent state.
    #[must_use]
    pub const fn is_stateless(&self) -> bool {
        !self.is_gru()
    }

    /// Whether this is a GRU family.
    #[must_use]
    pub const fn is_gru(&self) -> bool {
        matches!(self, Self::Gru)
    }

    /// Whether this is a plain MLP family.
    #[must_use]
    pub const fn is_mlp(&self) -> bool {
        matches!(self, Self::Mlp)
    }

    /// Anything that is neither recurrent nor a plain MLP.
    #[must_use]
    pub const fn is_transformer(&self) -> bool {
        !self.is_gru() && !self.is_mlp()
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpt2 => write!(f, "gpt2"),
            Self::Llama => write!(f, "llama"),
            Self::Gru => write!(f, "gru"),
            Self::Mlp => write!(f, "mlp"),
            Self::Custom(name) => write!(f, "{name}"),
        }
    }
}

impl From<&str> for ModelFamily {
    fn from(s: &str) -> Self {
        match s {
            "gpt2" => Self::Gpt2,
            "llama" => Self::Llama,
            "gru" => Self::Gru,
            "mlp" => Self::Mlp,
            other => Self::Custom(other.to_owned()),
        }
    }
}

/// How a registered family recognises a model instance.
#[derive(Debug, Clone)]
pub enum FamilyMatcher {
    /// Arbitrary predicate over the model handle.
    Predicate(fn(&dyn Navigable) -> bool),
    /// Match when [`Navigable::type_name`] is one of these.
    TypeNames(Vec<String>),
}

impl FamilyMatcher {
    fn matches(&self, model: &dyn Navigable) -> bool {
        match self {
            Self::Predicate(pred) => pred(model),
            Self::TypeNames(names) => model
                .type_name()
                .is_some_and(|t| names.iter().any(|n| n == t)),
        }
    }
}

// ---------------------------------------------------------------------------
// PathTemplate
// ---------------------------------------------------------------------------

/// One piece of an attachment path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSegment {
    /// Verbatim text.
    Literal(String),
    /// Replaced by the layer index.
    Layer,
    /// Replaced by the expert (mixture-of-experts) index.
    Expert,
}

/// Attachment path with typed layer/expert placeholders.
///
/// Parsed from `{layer}` / `{expert}` placeholders, or from `%s` markers
/// where the first is the layer and the second the expert:
///
/// ```
/// use candle_intervene::layout::PathTemplate;
///
/// let t: PathTemplate = "model.layers[{layer}].mlp.experts[{expert}]".parse().unwrap();
/// assert_eq!(t.render(3, Some(1)).unwrap(), "model.layers[3].mlp.experts[1]");
///
/// let t: PathTemplate = "h[%s].attn.c_attn".parse().unwrap();
/// assert_eq!(t.render(5, None).unwrap(), "h[5].attn.c_attn");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    segments: Vec<TemplateSegment>,
}

impl PathTemplate {
    /// A template with no placeholders.
    #[must_use]
    pub fn literal(path: impl Into<String>) -> Self {
        Self {
            segments: vec![TemplateSegment::Literal(path.into())],
        }
    }

    /// Parse `{layer}` / `{expert}` placeholders; everything else is literal.
    #[must_use]
    pub fn new(template: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = template;

        while !rest.is_empty() {
            let placeholder = if let Some(r) = rest.strip_prefix("{layer}") {
                rest = r;
                Some(TemplateSegment::Layer)
            } else if let Some(r) = rest.strip_prefix("{expert}") {
                rest = r;
                Some(TemplateSegment::Expert)
            } else {
                None
            };

            match placeholder {
                Some(p) => {
                    if !literal.is_empty() {
                        segments.push(TemplateSegment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(p);
                }
                None => {
                    let mut chars = rest.chars();
                    if let Some(c) = chars.next() {
                        literal.push(c);
                    }
                    rest = chars.as_str();
                }
            }
        }
        if !literal.is_empty() {
            segments.push(TemplateSegment::Literal(literal));
        }
        Self { segments }
    }

    /// Whether the template needs an expert index.
    #[must_use]
    pub fn needs_expert(&self) -> bool {
        self.segments.contains(&TemplateSegment::Expert)
    }

    /// Substitute placeholders.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] if the template has an expert placeholder
    /// and `expert` is `None`.
    pub fn render(&self, layer: usize, expert: Option<usize>) -> Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                TemplateSegment::Literal(s) => out.push_str(s),
                TemplateSegment::Layer => out.push_str(&layer.to_string()),
                TemplateSegment::Expert => {
                    let expert = expert.ok_or_else(|| {
                        MIError::Config(format!("path template `{self}` needs an expert index"))
                    })?;
                    out.push_str(&expert.to_string());
                }
            }
        }
        Ok(out)
    }
}

impl FromStr for PathTemplate {
    type Err = MIError;

    fn from_str(s: &str) -> Result<Self> {
        let markers = s.matches("%s").count();
        if markers > 2 {
            return Err(MIError::Config(format!(
                "path template `{s}` has more than two placeholders"
            )));
        }
        let braced = s.replacen("%s", "{layer}", 1).replacen("%s", "{expert}", 1);
        Ok(Self::new(&braced))
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                TemplateSegment::Literal(s) => write!(f, "{s}")?,
                TemplateSegment::Layer => write!(f, "{{layer}}")?,
                TemplateSegment::Expert => write!(f, "{{expert}}")?,
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Split specs and descriptors
// ---------------------------------------------------------------------------

/// Function slicing a subcomponent out of the last axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitFn {
    /// Keep the `param`-th half of the last axis.
    Half,
    /// Keep the `param`-th third of the last axis (fused QKV).
    Three,
    /// `(b, s, n*d) -> (b, n, s, d)` with `param` heads.
    HeadAndPermute,
}

impl FromStr for SplitFn {
    type Err = MIError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "half" | "split_half" => Ok(Self::Half),
            "three" | "split_three" => Ok(Self::Three),
            "head_and_permute" | "split_head_and_permute" => Ok(Self::HeadAndPermute),
            other => Err(MIError::Config(format!("unknown split function `{other}`"))),
        }
    }
}

/// Argument of a [`SplitFn`]: a literal, or a dimension name resolved
/// against the model configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitParam {
    /// Literal integer (a slot index or a head count).
    Literal(usize),
    /// Dimension-table entry, e.g. `"n_head"`.
    Dimension(String),
}

/// One `(split function, parameter)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSpec {
    /// Slicing function.
    pub func: SplitFn,
    /// Its argument.
    pub param: SplitParam,
}

impl SplitSpec {
    /// Build a split spec.
    #[must_use]
    pub const fn new(func: SplitFn, param: SplitParam) -> Self {
        Self { func, param }
    }
}

/// Where and how a component attaches to a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentDescriptor {
    /// Attachment path template.
    pub path: PathTemplate,
    /// Read the module's input or output.
    pub hook: HookKind,
    /// Subcomponent slicing applied along the last axis, in order.
    pub splits: Vec<SplitSpec>,
}

impl ComponentDescriptor {
    /// Build a descriptor without splits.
    #[must_use]
    pub const fn new(path: PathTemplate, hook: HookKind) -> Self {
        Self {
            path,
            hook,
            splits: Vec::new(),
        }
    }

    /// Append a split spec.
    #[must_use]
    pub fn split(mut self, func: SplitFn, param: SplitParam) -> Self {
        self.splits.push(SplitSpec::new(func, param));
        self
    }

    /// Concrete attachment path for a layer (and expert).
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] if an expert index is required but absent.
    pub fn render_path(&self, layer: usize, expert: Option<usize>) -> Result<String> {
        self.path.render(layer, expert)
    }

    /// Slot of this component among fused co-located components.
    ///
    /// Only a leading [`SplitFn::Three`] marks a non-zero slot. A leading
    /// [`SplitFn::Half`] with a non-zero slot is rejected rather than
    /// silently scattered into slot 0.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::UnsupportedSplit`] for a non-zero `Half` slot or a
    /// symbolic slot parameter.
    pub fn fused_slot(&self, component: &str) -> Result<usize> {
        let Some(first) = self.splits.first() else {
            return Ok(0);
        };
        match (first.func, &first.param) {
            (SplitFn::Three, SplitParam::Literal(slot)) => Ok(*slot),
            (SplitFn::Half, SplitParam::Literal(0)) | (SplitFn::HeadAndPermute, _) => Ok(0),
            (SplitFn::Half, SplitParam::Literal(slot)) => Err(MIError::UnsupportedSplit {
                component: component.to_owned(),
                reason: format!("head scatter into half slot {slot} is not supported"),
            }),
            (_, SplitParam::Dimension(name)) => Err(MIError::UnsupportedSplit {
                component: component.to_owned(),
                reason: format!("slot index must be a literal, got dimension `{name}`"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// LayoutRegistry
// ---------------------------------------------------------------------------

/// Immutable table of model families, component layouts and dimensions.
#[derive(Debug, Clone, Default)]
pub struct LayoutRegistry {
    families: Vec<(ModelFamily, FamilyMatcher)>,
    components: HashMap<ModelFamily, HashMap<String, ComponentDescriptor>>,
    dimensions: HashMap<ModelFamily, HashMap<String, Vec<DimProposal>>>,
}

impl LayoutRegistry {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> LayoutRegistryBuilder {
        LayoutRegistryBuilder::default()
    }

    /// Identify the family of a model instance.
    ///
    /// Families are tried in registration order.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::UnknownModelType`] if no predicate matches.
    pub fn model_family(&self, model: &dyn Navigable) -> Result<ModelFamily> {
        self.families
            .iter()
            .find(|(_, matcher)| matcher.matches(model))
            .map(|(family, _)| family.clone())
            .ok_or_else(|| {
                MIError::UnknownModelType(model.type_name().unwrap_or("<untyped>").to_owned())
            })
    }

    /// Registered descriptor, without the literal-path fallback.
    #[must_use]
    pub fn descriptor(
        &self,
        family: &ModelFamily,
        component: &str,
    ) -> Option<&ComponentDescriptor> {
        self.components.get(family)?.get(component)
    }

    /// Resolve a component to its descriptor.
    ///
    /// Unregistered components are read as literal paths whose last segment
    /// is `input` or `output`, e.g. `h[0].mlp.act.output`. A bare `output`
    /// or `input` resolves to the root module.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::UnknownComponent`] if the component is neither
    /// registered nor a valid literal path.
    pub fn resolve(&self, family: &ModelFamily, component: &str) -> Result<ComponentDescriptor> {
        if let Some(descriptor) = self.descriptor(family, component) {
            debug!(%family, component, path = %descriptor.path, "resolved registered component");
            return Ok(descriptor.clone());
        }

        // a bare `input`/`output` addresses the model itself
        let (prefix, last) = component.rsplit_once('.').unwrap_or(("", component));
        let hook = last
            .parse::<HookKind>()
            .map_err(|_| MIError::UnknownComponent(component.to_owned()))?;
        debug!(%family, component, path = prefix, %hook, "resolved literal component path");
        Ok(ComponentDescriptor::new(PathTemplate::literal(prefix), hook))
    }

    /// Dimension proposals for a component, if registered for the family.
    #[must_use]
    pub fn dimension_proposals(
        &self,
        family: &ModelFamily,
        component: &str,
    ) -> Option<&[DimProposal]> {
        self.dimensions
            .get(family)?
            .get(component)
            .map(Vec::as_slice)
    }

    /// Families in registration order.
    pub fn families(&self) -> impl Iterator<Item = &ModelFamily> {
        self.families.iter().map(|(family, _)| family)
    }
}

/// Builder for [`LayoutRegistry`].
#[derive(Debug, Default)]
#[must_use]
pub struct LayoutRegistryBuilder {
    inner: LayoutRegistry,
}

impl LayoutRegistryBuilder {
    /// Associate a family with a predicate over model instances.
    pub fn family(mut self, family: ModelFamily, predicate: fn(&dyn Navigable) -> bool) -> Self {
        self.inner
            .families
            .push((family, FamilyMatcher::Predicate(predicate)));
        self
    }

    /// Associate a family with a set of type names.
    pub fn family_type_names<S: Into<String>>(
        mut self,
        family: ModelFamily,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        let names = names.into_iter().map(Into::into).collect();
        self.inner
            .families
            .push((family, FamilyMatcher::TypeNames(names)));
        self
    }

    /// Register a component descriptor.
    pub fn component(
        mut self,
        family: &ModelFamily,
        name: impl Into<String>,
        descriptor: ComponentDescriptor,
    ) -> Self {
        self.inner
            .components
            .entry(family.clone())
            .or_default()
            .insert(name.into(), descriptor);
        self
    }

    /// Register dimension proposals for a component, tried in order.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] if a proposal does not parse.
    pub fn dimension(
        mut self,
        family: &ModelFamily,
        name: impl Into<String>,
        proposals: &[&str],
    ) -> Result<Self> {
        let parsed = proposals
            .iter()
            .map(|p| p.parse::<DimProposal>())
            .collect::<Result<Vec<_>>>()?;
        self = self.dimension_proposals(family, name, parsed);
        Ok(self)
    }

    /// Register already-parsed dimension proposals for a component.
    pub fn dimension_proposals(
        mut self,
        family: &ModelFamily,
        name: impl Into<String>,
        proposals: Vec<DimProposal>,
    ) -> Self {
        self.inner
            .dimensions
            .entry(family.clone())
            .or_default()
            .insert(name.into(), proposals);
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> LayoutRegistry {
        self.inner
    }
}

// ---------------------------------------------------------------------------
// ModelContext
// ---------------------------------------------------------------------------

/// Everything needed to interpret a component on one model: the registry,
/// the model's family, and its configuration object.
#[derive(Debug, Clone)]
pub struct ModelContext<'a> {
    /// Layout and dimension tables.
    pub registry: &'a LayoutRegistry,
    /// Family of the model being addressed.
    pub family: ModelFamily,
    /// Configuration object queried for dimension sizes.
    pub config: &'a dyn Navigable,
}

impl<'a> ModelContext<'a> {
    /// Bundle an explicit family with its registry and configuration.
    #[must_use]
    pub const fn new(
        registry: &'a LayoutRegistry,
        family: ModelFamily,
        config: &'a dyn Navigable,
    ) -> Self {
        Self {
            registry,
            family,
            config,
        }
    }

    /// Detect the family from a model instance.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::UnknownModelType`] if no family matches `model`.
    pub fn detect(
        registry: &'a LayoutRegistry,
        model: &dyn Navigable,
        config: &'a dyn Navigable,
    ) -> Result<Self> {
        let family = registry.model_family(model)?;
        Ok(Self::new(registry, family, config))
    }

    /// Registered descriptor for `component`, if any.
    #[must_use]
    pub fn descriptor(&self, component: &str) -> Option<&'a ComponentDescriptor> {
        self.registry.descriptor(&self.family, component)
    }

    /// Resolve a split parameter to an integer.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] if a symbolic parameter has no dimension
    /// entry for this family, or the errors of
    /// [`resolve_dimension`](crate::dimension::resolve_dimension).
    pub fn split_param(&self, param: &SplitParam) -> Result<usize> {
        match param {
            SplitParam::Literal(v) => Ok(*v),
            SplitParam::Dimension(name) => {
                crate::dimension::resolve_dimension(self.registry, &self.family, self.config, name)?
                    .ok_or_else(|| {
                        MIError::Config(format!(
                            "dimension `{name}` is not registered for {}",
                            self.family
                        ))
                    })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Process-wide registry
// ---------------------------------------------------------------------------

static REGISTRY: OnceLock<LayoutRegistry> = OnceLock::new();

/// Install the process-wide registry. Call once at startup.
///
/// # Errors
///
/// Returns [`MIError::Config`] if a registry is already installed (or the
/// built-in one was already served by [`registry`]).
pub fn install(registry: LayoutRegistry) -> Result<()> {
    REGISTRY
        .set(registry)
        .map_err(|_| MIError::Config("layout registry already installed".into()))
}

/// The process-wide registry, falling back to the built-in tables.
pub fn registry() -> &'static LayoutRegistry {
    REGISTRY.get_or_init(builtin::registry)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

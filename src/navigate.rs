// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attribute-path navigation over live model objects.
//!
//! A path is a dot-separated sequence of segments; each segment names an
//! attribute and may carry bracketed indices into an ordered sequence:
//!
//! ```
//! use candle_intervene::navigate::{navigate, Navigable};
//!
//! let config = serde_json::json!({"layers": [{"mlp": {"width": 64}}, {"mlp": {"width": 128}}]});
//! let width = navigate(&config, "layers[1].mlp.width").unwrap();
//! assert_eq!(width.as_usize(), Some(128));
//! ```
//!
//! Resolution runs strictly left to right with no backtracking.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::error::{MIError, Result};

// ---------------------------------------------------------------------------
// Navigable
// ---------------------------------------------------------------------------

/// An attribute-bearing object the core can walk by path.
///
/// Implemented for [`serde_json::Value`] (model configuration objects) and
/// [`ModuleTree`] (a description of a live model's sub-modules). Implement it
/// for your own model type to hook into its sub-modules directly.
pub trait Navigable {
    /// Named attribute lookup.
    fn attr(&self, name: &str) -> Option<&dyn Navigable>;

    /// Positional lookup into an ordered sequence.
    fn item(&self, _index: usize) -> Option<&dyn Navigable> {
        None
    }

    /// Integer value of a scalar attribute, if this object is one.
    fn as_usize(&self) -> Option<usize> {
        None
    }

    /// Whether this attribute is present but explicitly null.
    fn is_null(&self) -> bool {
        false
    }

    /// Type tag used by model-family predicates.
    fn type_name(&self) -> Option<&str> {
        None
    }
}

impl fmt::Debug for dyn Navigable + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Navigable({})", self.type_name().unwrap_or("?"))
    }
}

impl Navigable for Value {
    fn attr(&self, name: &str) -> Option<&dyn Navigable> {
        self.as_object()?.get(name).map(|v| v as &dyn Navigable)
    }

    fn item(&self, index: usize) -> Option<&dyn Navigable> {
        self.as_array()?.get(index).map(|v| v as &dyn Navigable)
    }

    fn as_usize(&self) -> Option<usize> {
        self.as_u64().and_then(|v| usize::try_from(v).ok())
    }

    fn is_null(&self) -> bool {
        Value::is_null(self)
    }

    /// `HuggingFace` configs carry their family in `model_type`.
    fn type_name(&self) -> Option<&str> {
        self.get("model_type").and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// ModuleTree
// ---------------------------------------------------------------------------

/// Structural description of a live model: named sub-modules plus an
/// optional ordered list of children (a module list).
///
/// ```
/// use candle_intervene::navigate::{navigate, ModuleTree, Navigable};
///
/// let block = ModuleTree::new("Block").with_child("mlp", ModuleTree::new("Mlp"));
/// let layers = ModuleTree::list("ModuleList", vec![block.clone(), block.clone(), block]);
/// let model = ModuleTree::new("Model").with_child("layers", layers);
///
/// let mlp = navigate(&model, "layers[2].mlp").unwrap();
/// assert_eq!(mlp.type_name(), Some("Mlp"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleTree {
    type_name: String,
    children: BTreeMap<String, ModuleTree>,
    items: Vec<ModuleTree>,
}

impl ModuleTree {
    /// A leaf module with the given type tag.
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Self::default()
        }
    }

    /// An ordered module list.
    #[must_use]
    pub fn list(type_name: impl Into<String>, items: Vec<Self>) -> Self {
        Self {
            type_name: type_name.into(),
            children: BTreeMap::new(),
            items,
        }
    }

    /// Attach a named sub-module.
    #[must_use]
    pub fn with_child(mut self, name: impl Into<String>, child: Self) -> Self {
        self.children.insert(name.into(), child);
        self
    }

    /// Number of ordered children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether this module has no ordered children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Navigable for ModuleTree {
    fn attr(&self, name: &str) -> Option<&dyn Navigable> {
        self.children.get(name).map(|m| m as &dyn Navigable)
    }

    fn item(&self, index: usize) -> Option<&dyn Navigable> {
        self.items.get(index).map(|m| m as &dyn Navigable)
    }

    fn type_name(&self) -> Option<&str> {
        Some(&self.type_name)
    }
}

// ---------------------------------------------------------------------------
// Path parsing
// ---------------------------------------------------------------------------

/// One dotted path segment: an attribute name and trailing indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    /// Attribute name (may be empty only when the segment is pure digits).
    pub name: String,
    /// Bracketed indices applied after the attribute, in order.
    pub indices: Vec<usize>,
}

/// Split a path like `model.layers[3].mlp` into segments.
///
/// # Errors
///
/// Returns [`MIError::AttributePath`] for empty segments, unbalanced
/// brackets or non-integer indices.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    path.split('.')
        .map(|raw| parse_segment(path, raw))
        .collect()
}

fn parse_segment(path: &str, raw: &str) -> Result<PathSegment> {
    let (name, mut rest) = match raw.find('[') {
        Some(open) => (&raw[..open], &raw[open..]),
        None => (raw, ""),
    };
    if name.is_empty() {
        return Err(MIError::attribute_path(path, raw));
    }

    let mut indices = Vec::new();
    while !rest.is_empty() {
        let inner = rest
            .strip_prefix('[')
            .and_then(|r| r.split_once(']'))
            .ok_or_else(|| MIError::attribute_path(path, raw))?;
        let index = inner
            .0
            .trim()
            .parse::<usize>()
            .map_err(|_| MIError::attribute_path(path, raw))?;
        indices.push(index);
        rest = inner.1;
    }

    Ok(PathSegment {
        name: name.to_owned(),
        indices,
    })
}

// ---------------------------------------------------------------------------
// Navigation
// ---------------------------------------------------------------------------

/// Resolve `path` against `root`, left to right.
///
/// A segment made only of digits that is not an attribute falls back to a
/// positional lookup, so `layers.2.mlp` and `layers[2].mlp` agree.
///
/// # Errors
///
/// Returns [`MIError::AttributePath`] naming the first segment that is
/// missing on the object reached so far.
pub fn navigate<'a>(root: &'a dyn Navigable, path: &str) -> Result<&'a dyn Navigable> {
    let mut current = root;
    for segment in parse_path(path)? {
        let missing = || MIError::attribute_path(path, &segment.name);
        current = match current.attr(&segment.name) {
            Some(next) => next,
            None => segment
                .name
                .parse::<usize>()
                .ok()
                .and_then(|i| current.item(i))
                .ok_or_else(missing)?,
        };
        for &index in &segment.indices {
            current = current.item(index).ok_or_else(|| {
                MIError::attribute_path(path, &format!("{}[{index}]", segment.name))
            })?;
        }
    }
    Ok(current)
}

/// Resolve `path` and read it as an integer; `Ok(None)` when it is null.
///
/// # Errors
///
/// Returns [`MIError::AttributePath`] if the path is missing or the value
/// is neither null nor a non-negative integer.
pub fn navigate_usize(root: &dyn Navigable, path: &str) -> Result<Option<usize>> {
    let value = navigate(root, path)?;
    if value.is_null() {
        return Ok(None);
    }
    value
        .as_usize()
        .map(Some)
        .ok_or_else(|| MIError::attribute_path(path, path.rsplit('.').next().unwrap_or(path)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

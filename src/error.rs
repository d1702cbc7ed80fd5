// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-intervene.
//!
//! Every error is deterministic: a mismatch between the layout table, the
//! live model, and the tensors flowing through it. Nothing here is retried.

/// Errors that can occur while addressing or intervening on activations.
#[derive(Debug, thiserror::Error)]
pub enum MIError {
    /// Tensor operation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// The model instance matched no registered family predicate.
    #[error("unknown model type: {0}")]
    UnknownModelType(String),

    /// Component is neither registered nor a literal `*.input`/`*.output` path.
    #[error("unknown component `{0}`")]
    UnknownComponent(String),

    /// A dotted/indexed path segment is missing on the live object.
    #[error("attribute path `{path}` failed at segment `{segment}`")]
    AttributePath {
        /// The full path being resolved.
        path: String,
        /// The segment that could not be resolved.
        segment: String,
    },

    /// A component declares a split layout the splitter cannot apply.
    #[error("unsupported split for `{component}`: {reason}")]
    UnsupportedSplit {
        /// Component whose split list is defective.
        component: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Activation rank outside the supported `{2, 3, 4}`.
    #[error("shape invariant violated: expected rank 2, 3 or 4, got shape {0:?}")]
    ShapeInvariant(Vec<usize>),

    /// Malformed unit specification or unit locations.
    #[error("unit error: {0}")]
    Unit(String),

    /// Intervention transform returned something unusable.
    #[error("intervention error: {0}")]
    Intervention(String),

    /// Layout or dimension table configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// JSON parsing error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl MIError {
    /// Build an [`MIError::AttributePath`] error.
    pub(crate) fn attribute_path(path: &str, segment: &str) -> Self {
        Self::AttributePath {
            path: path.to_owned(),
            segment: segment.to_owned(),
        }
    }
}

/// Result type alias for candle-intervene operations.
pub type Result<T> = std::result::Result<T, MIError>;

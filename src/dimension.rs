// SPDX-License-Identifier: MIT OR Apache-2.0

//! Symbolic dimension sizes resolved against a model configuration.
//!
//! Each component maps to an ordered list of proposals; the first one that
//! resolves to a non-null integer wins. Proposal syntax:
//!
//! | Form | Meaning |
//! |------|---------|
//! | `768` | literal |
//! | `n_embd*4` | attribute times literal |
//! | `n_embd/n_head`, `768/12` | integer division, operands literal or attribute |
//! | `hidden_size` | bare attribute |
//!
//! ```
//! use candle_intervene::dimension::DimProposal;
//!
//! let config = serde_json::json!({"n_embd": 768, "n_head": 12});
//! let p: DimProposal = "n_embd/n_head".parse().unwrap();
//! assert_eq!(p.resolve(&config).unwrap(), Some(64));
//! ```

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::{MIError, Result};
use crate::layout::{LayoutRegistry, ModelFamily};
use crate::navigate::{Navigable, navigate_usize};

/// Literal integer or configuration attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Literal integer.
    Literal(usize),
    /// Attribute path on the configuration object.
    Attr(String),
}

impl Operand {
    fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MIError::Config("empty dimension operand".into()));
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            let value = s
                .parse::<usize>()
                .map_err(|e| MIError::Config(format!("dimension literal `{s}`: {e}")))?;
            Ok(Self::Literal(value))
        } else {
            Ok(Self::Attr(s.to_owned()))
        }
    }

    fn resolve(&self, config: &dyn Navigable) -> Result<Option<usize>> {
        match self {
            Self::Literal(v) => Ok(Some(*v)),
            Self::Attr(path) => navigate_usize(config, path),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => write!(f, "{v}"),
            Self::Attr(a) => write!(f, "{a}"),
        }
    }
}

/// One way of computing a dimension size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DimProposal {
    /// Constant size.
    Literal(usize),
    /// `base * factor`.
    Scaled {
        /// Left operand, usually an attribute.
        base: Operand,
        /// Literal multiplier.
        factor: usize,
    },
    /// `num / den`, truncating.
    Ratio {
        /// Numerator.
        num: Operand,
        /// Denominator.
        den: Operand,
    },
    /// Direct attribute lookup.
    Attr(String),
}

impl DimProposal {
    /// Evaluate against a configuration object. `Ok(None)` when an attribute
    /// involved is present but null.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::AttributePath`] for a missing attribute and
    /// [`MIError::Config`] for a zero denominator or an overflowing product.
    pub fn resolve(&self, config: &dyn Navigable) -> Result<Option<usize>> {
        match self {
            Self::Literal(v) => Ok(Some(*v)),
            Self::Scaled { base, factor } => base
                .resolve(config)?
                .map(|b| {
                    b.checked_mul(*factor).ok_or_else(|| {
                        MIError::Config(format!("dimension `{self}` overflows usize"))
                    })
                })
                .transpose(),
            Self::Ratio { num, den } => {
                let (Some(n), Some(d)) = (num.resolve(config)?, den.resolve(config)?) else {
                    return Ok(None);
                };
                if d == 0 {
                    return Err(MIError::Config(format!("dimension `{self}` divides by zero")));
                }
                Ok(Some(n / d))
            }
            Self::Attr(path) => navigate_usize(config, path),
        }
    }
}

impl FromStr for DimProposal {
    type Err = MIError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((base, factor)) = s.split_once('*') {
            let factor = match Operand::parse(factor)? {
                Operand::Literal(k) => k,
                Operand::Attr(a) => {
                    return Err(MIError::Config(format!(
                        "dimension multiplier must be a literal, got `{a}`"
                    )));
                }
            };
            return Ok(Self::Scaled {
                base: Operand::parse(base)?,
                factor,
            });
        }
        if let Some((num, den)) = s.split_once('/') {
            return Ok(Self::Ratio {
                num: Operand::parse(num)?,
                den: Operand::parse(den)?,
            });
        }
        Ok(match Operand::parse(s)? {
            Operand::Literal(v) => Self::Literal(v),
            Operand::Attr(a) => Self::Attr(a),
        })
    }
}

impl fmt::Display for DimProposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => write!(f, "{v}"),
            Self::Scaled { base, factor } => write!(f, "{base}*{factor}"),
            Self::Ratio { num, den } => write!(f, "{num}/{den}"),
            Self::Attr(a) => write!(f, "{a}"),
        }
    }
}

/// Resolve the dimension size of `component` for a model family.
///
/// Returns `Ok(None)` when the component has no dimension entry for the
/// family.
///
/// # Errors
///
/// Returns [`MIError::AttributePath`] if a proposal names a missing
/// attribute, and [`MIError::Config`] if every proposal resolves to null.
pub fn resolve_dimension(
    registry: &LayoutRegistry,
    family: &ModelFamily,
    config: &dyn Navigable,
    component: &str,
) -> Result<Option<usize>> {
    let Some(proposals) = registry.dimension_proposals(family, component) else {
        return Ok(None);
    };
    for proposal in proposals {
        if let Some(dim) = proposal.resolve(config)? {
            debug!(%family, component, %proposal, dim, "resolved dimension");
            return Ok(Some(dim));
        }
    }
    Err(MIError::Config(format!(
        "no dimension proposal for `{component}` resolved on {family}"
    )))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn registry(proposals: &[&str]) -> LayoutRegistry {
        LayoutRegistry::builder()
            .dimension(&ModelFamily::Gpt2, "mlp_activation", proposals)
            .unwrap()
            .build()
    }

    #[test]
    fn parses_all_forms() {
        assert_eq!("20".parse::<DimProposal>().unwrap(), DimProposal::Literal(20));
        assert_eq!(
            "n_embd*4".parse::<DimProposal>().unwrap(),
            DimProposal::Scaled {
                base: Operand::Attr("n_embd".into()),
                factor: 4
            }
        );
        assert_eq!(
            "768/n_head".parse::<DimProposal>().unwrap(),
            DimProposal::Ratio {
                num: Operand::Literal(768),
                den: Operand::Attr("n_head".into())
            }
        );
        assert_eq!(
            "hidden_size".parse::<DimProposal>().unwrap(),
            DimProposal::Attr("hidden_size".into())
        );
        assert!("n_embd*n_head".parse::<DimProposal>().is_err());
    }

    #[test]
    fn first_non_null_proposal_wins() {
        let config = serde_json::json!({"n_inner": null, "n_embd": 10});
        let reg = registry(&["n_inner*2", "20"]);
        assert_eq!(
            resolve_dimension(&reg, &ModelFamily::Gpt2, &config, "mlp_activation").unwrap(),
            Some(20)
        );

        let reg = registry(&["n_embd*4", "20"]);
        assert_eq!(
            resolve_dimension(&reg, &ModelFamily::Gpt2, &config, "mlp_activation").unwrap(),
            Some(40)
        );
    }

    #[test]
    fn division_truncates() {
        let config = serde_json::json!({});
        let reg = registry(&["5/2"]);
        assert_eq!(
            resolve_dimension(&reg, &ModelFamily::Gpt2, &config, "mlp_activation").unwrap(),
            Some(2)
        );
    }

    #[test]
    fn literal_only() {
        let config = serde_json::json!({});
        let reg = registry(&["3072"]);
        assert_eq!(
            resolve_dimension(&reg, &ModelFamily::Gpt2, &config, "mlp_activation").unwrap(),
            Some(3072)
        );
    }

    #[test]
    fn unregistered_component_is_none() {
        let config = serde_json::json!({});
        let reg = registry(&["1"]);
        assert_eq!(
            resolve_dimension(&reg, &ModelFamily::Gpt2, &config, "block_output").unwrap(),
            None
        );
        assert_eq!(
            resolve_dimension(&reg, &ModelFamily::Llama, &config, "mlp_activation").unwrap(),
            None
        );
    }

    #[test]
    fn missing_attribute_and_zero_division_error() {
        let config = serde_json::json!({"zero": 0});
        let reg = registry(&["n_embd"]);
        assert!(matches!(
            resolve_dimension(&reg, &ModelFamily::Gpt2, &config, "mlp_activation"),
            Err(MIError::AttributePath { .. })
        ));
        let reg = registry(&["8/zero"]);
        assert!(matches!(
            resolve_dimension(&reg, &ModelFamily::Gpt2, &config, "mlp_activation"),
            Err(MIError::Config(_))
        ));
    }

    #[test]
    fn overflowing_product_is_config_error() {
        let config = serde_json::json!({"n_embd": usize::MAX / 2});
        let reg = registry(&["n_embd*4"]);
        assert!(matches!(
            resolve_dimension(&reg, &ModelFamily::Gpt2, &config, "mlp_activation"),
            Err(MIError::Config(_))
        ));
        let reg = registry(&["n_embd*2"]);
        assert_eq!(
            resolve_dimension(&reg, &ModelFamily::Gpt2, &config, "mlp_activation").unwrap(),
            Some(usize::MAX - 1)
        );
    }

    #[test]
    fn all_null_is_config_error() {
        let config = serde_json::json!({"n_inner": null});
        let reg = registry(&["n_inner"]);
        assert!(resolve_dimension(&reg, &ModelFamily::Gpt2, &config, "mlp_activation").is_err());
    }
}

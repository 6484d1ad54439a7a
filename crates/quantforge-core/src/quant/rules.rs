//! Per-tensor precision selection.
//!
//! Each tensor of a source artifact is matched against an ordered rule
//! table; matching rules accumulate a bump that advances the target quant
//! along the precision ladder. The output is the override list handed to
//! the external quantizer.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use super::ladder::{ladder_index, substitute, FALLBACK_SYMBOL, QUANT_LADDER};
use crate::error::{ForgeError, Result};

static LAYER_ORDINAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"blk\.(\d+)\.").unwrap());

/// One tensor of the intermediate container, as reported by the external
/// tensor-info dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    /// Current precision symbol, e.g. `BF16` or `F32`.
    pub dtype: String,
}

/// Caller-selected full-precision keep mode for matching layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecisionOverride {
    F16,
    Bf16,
}

impl PrecisionOverride {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrecisionOverride::F16 => "F16",
            PrecisionOverride::Bf16 => "BF16",
        }
    }
}

/// One rule of the table. Every optional is explicit; the set is never
/// mutated at runtime.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuantRule {
    /// Target quants this rule applies to (matched after substitution).
    #[serde(default, deserialize_with = "one_or_many")]
    pub base_type: Vec<String>,
    /// Tensor-name patterns, `*` wildcard honored.
    #[serde(default, deserialize_with = "one_or_many")]
    pub layer_name: Vec<String>,
    /// Unconditional ladder bump when the rule matches.
    #[serde(default)]
    pub bump: Option<i64>,
    /// Substituted for `bump` on Mixture-of-Experts models.
    #[serde(default)]
    pub bump_experts: Option<i64>,
    /// Normalized layer-order boundaries for the order bump.
    #[serde(default)]
    pub bump_order_low: Option<f64>,
    #[serde(default)]
    pub bump_order_high: Option<f64>,
    /// Bump applied when the normalized order crosses a boundary.
    #[serde(default)]
    pub bump_order_val: Option<i64>,
    #[serde(default)]
    pub bump_order_experts_val: Option<i64>,
    /// Precision-override modes for which this rule fires.
    #[serde(default)]
    pub override_types: Vec<String>,
    /// Optional MoE gate for override rules.
    #[serde(default)]
    pub experts: Option<bool>,
    /// Optional absolute-ordinal gate for override rules.
    #[serde(default)]
    pub order_low: Option<i64>,
    #[serde(default)]
    pub order_high: Option<i64>,
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<QuantRule>,
}

/// Extract the layer ordinal from a tensor name (`blk.27.attn_k` → 27),
/// `-1` when absent.
pub fn extract_layer_order(name: &str) -> i64 {
    LAYER_ORDINAL
        .captures(name)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(-1)
}

/// Normalize a layer ordinal into `[0, 10]`.
pub fn normalize_layer_order(layer_order: i64, max_layer_order: i64) -> f64 {
    if max_layer_order <= 0 {
        return 0.0;
    }
    (10.0 * layer_order as f64 / max_layer_order as f64).min(10.0)
}

/// Whether a tensor name matches a pattern with `*` wildcards.
pub fn layer_matches(layer_name: &str, pattern: &str) -> bool {
    if pattern.contains('*') {
        let escaped = format!("^{}$", regex::escape(pattern).replace(r"\*", ".*"));
        Regex::new(&escaped)
            .map(|re| re.is_match(layer_name))
            .unwrap_or(false)
    } else {
        pattern == layer_name
    }
}

/// The ordered rule table.
pub struct RuleEngine {
    rules: Vec<QuantRule>,
}

impl RuleEngine {
    /// Load the rule table from its JSON file. A malformed file is a
    /// contract violation and fatal to the process.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| ForgeError::Contract {
            what: "rule table".to_string(),
            message: format!("{}: {e}", path.display()),
        })?;
        let file: RuleFile = serde_json::from_str(&raw).map_err(|e| ForgeError::Contract {
            what: "rule table".to_string(),
            message: format!("{}: {e}", path.display()),
        })?;
        Ok(Self { rules: file.rules })
    }

    pub fn from_rules(rules: Vec<QuantRule>) -> Self {
        Self { rules }
    }

    /// Effective precision for one tensor, or `None` to keep it as is.
    ///
    /// `layer_order` is the raw ordinal from the tensor name;
    /// `max_layer_order` is the artifact-wide maximum.
    pub fn decide(
        &self,
        tensor: &TensorInfo,
        target: &str,
        is_moe: bool,
        max_layer_order: i64,
        override_mode: Option<PrecisionOverride>,
    ) -> Option<String> {
        // mxfp4 containers keep their packed tensors untouched.
        if tensor.dtype.to_lowercase().contains("mxfp4") {
            return None;
        }

        let layer_order = extract_layer_order(&tensor.name);
        let normalized_order = normalize_layer_order(layer_order, max_layer_order);
        let normalized_target = substitute(target);

        let bumped = self.bumped_symbol(tensor, normalized_target, is_moe, normalized_order);

        // Override semantics trump ladder bumping for matching tensors.
        if let Some(mode) = override_mode {
            if self.override_applies(&tensor.name, mode, is_moe, layer_order) {
                return Some(mode.as_str().to_string());
            }
        }

        bumped
    }

    /// Ladder-bump portion of the decision. `None` when nothing bumps.
    fn bumped_symbol(
        &self,
        tensor: &TensorInfo,
        normalized_target: &str,
        is_moe: bool,
        normalized_order: f64,
    ) -> Option<String> {
        // F32 tensors never bump.
        if tensor.dtype == "F32" {
            return None;
        }

        let target_idx =
            ladder_index(normalized_target).unwrap_or_else(|| ladder_index(FALLBACK_SYMBOL).unwrap());

        let mut total_bump: i64 = 0;
        for rule in &self.rules {
            if !rule.base_type.iter().any(|t| t == normalized_target) {
                continue;
            }
            if !rule.layer_name.is_empty()
                && !rule.layer_name.iter().any(|p| layer_matches(&tensor.name, p))
            {
                continue;
            }

            let base_bump = if is_moe {
                rule.bump_experts.or(rule.bump).unwrap_or(0)
            } else {
                rule.bump.unwrap_or(0)
            };
            total_bump += base_bump;

            if rule.bump_order_low.is_some() || rule.bump_order_high.is_some() {
                let low = rule.bump_order_low.unwrap_or(f64::NEG_INFINITY);
                let high = rule.bump_order_high.unwrap_or(f64::INFINITY);
                if normalized_order <= low || normalized_order >= high {
                    let order_bump = if is_moe {
                        rule.bump_order_experts_val.or(rule.bump_order_val).unwrap_or(0)
                    } else {
                        rule.bump_order_val.unwrap_or(0)
                    };
                    total_bump += order_bump;
                }
            }
        }

        if total_bump == 0 {
            return None;
        }

        let new_idx = (target_idx as i64 + total_bump).clamp(0, QUANT_LADDER.len() as i64 - 1);
        Some(QUANT_LADDER[new_idx as usize].to_string())
    }

    /// Whether any override rule fires for this tensor under `mode`.
    fn override_applies(
        &self,
        tensor_name: &str,
        mode: PrecisionOverride,
        is_moe: bool,
        layer_order: i64,
    ) -> bool {
        for rule in &self.rules {
            if !rule.override_types.iter().any(|t| t == mode.as_str()) {
                continue;
            }
            if !rule.layer_name.iter().any(|p| layer_matches(tensor_name, p)) {
                continue;
            }
            if let Some(experts) = rule.experts {
                if experts != is_moe {
                    continue;
                }
            }
            if let (Some(low), Some(high)) = (rule.order_low, rule.order_high) {
                if layer_order < low || layer_order > high {
                    continue;
                }
            }
            return true;
        }
        false
    }

    /// Build the per-tensor override list for one quant step, sorted by
    /// layer ordinal ascending for transport.
    pub fn plan_overrides(
        &self,
        tensors: &[TensorInfo],
        target: &str,
        is_moe: bool,
        override_mode: Option<PrecisionOverride>,
    ) -> Vec<(String, String)> {
        let max_layer_order = tensors
            .iter()
            .map(|t| extract_layer_order(&t.name))
            .max()
            .unwrap_or(-1);

        let mut overrides: Vec<(String, String)> = tensors
            .iter()
            .filter_map(|tensor| {
                self.decide(tensor, target, is_moe, max_layer_order, override_mode)
                    .map(|quant| (tensor.name.clone(), quant))
            })
            .collect();

        overrides.sort_by_key(|(name, _)| extract_layer_order(name));
        overrides
    }
}

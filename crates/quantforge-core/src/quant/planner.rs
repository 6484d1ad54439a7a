//! Quant-step planning.
//!
//! Loads the static quant-config list, filters it by model size, and
//! supplies the compatibility fallback for tensor/embedding types the
//! external quantizer rejects.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use super::ladder::bit_level;
use super::rules::PrecisionOverride;
use crate::error::{ForgeError, Result};

/// One entry of the static quant-config list. `name` is the artifact
/// suffix; empty `type` strings mean "not specified".
#[derive(Debug, Clone, Deserialize)]
pub struct QuantConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub target: String,
    #[serde(default)]
    pub embed_type: String,
    #[serde(default)]
    pub output_type: String,
    #[serde(default)]
    pub use_imatrix: bool,
    #[serde(default)]
    pub use_pure: bool,
}

impl QuantConfig {
    pub fn output_type(&self) -> Option<&str> {
        if self.output_type.is_empty() {
            None
        } else {
            Some(&self.output_type)
        }
    }

    pub fn embed_type(&self) -> Option<&str> {
        if self.embed_type.is_empty() {
            None
        } else {
            Some(&self.embed_type)
        }
    }
}

/// Load the quant-config list. A malformed file is a contract violation.
pub fn load_quant_configs(path: &Path) -> Result<Vec<QuantConfig>> {
    let raw = std::fs::read_to_string(path).map_err(|e| ForgeError::Contract {
        what: "quant-config file".to_string(),
        message: format!("{}: {e}", path.display()),
    })?;
    let configs: Vec<QuantConfig> = serde_json::from_str(&raw).map_err(|e| ForgeError::Contract {
        what: "quant-config file".to_string(),
        message: format!("{}: {e}", path.display()),
    })?;
    Ok(configs)
}

static SIZE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)(\d+\.?\d*)\s*([bm])b?",
        r"(?i)-(\d+)([bm])-",
        r"(?i)_(\d+)([bm])_",
        r"(?i)(\d+)([bm])\D",
        r"(?i)(\d+)([bm])$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Estimate a parameter count from the model base name (`7b`, `1.5B`,
/// `350m`, ...). `None` when no size marker is present.
pub fn model_size_from_name(base_name: &str) -> Option<i64> {
    for pattern in SIZE_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(base_name) {
            let size: f64 = caps[1].parse().ok()?;
            return match caps[2].to_ascii_lowercase().as_str() {
                "b" => Some((size * 1e9) as i64),
                "m" => Some((size * 1e6) as i64),
                _ => None,
            };
        }
    }
    warn!("Couldn't determine model size from name: {base_name}");
    None
}

/// Parameter count used for the size filter: the catalog count when known,
/// otherwise the name-derived estimate.
pub fn effective_model_size(base_name: &str, catalog_parameters: i64) -> Option<i64> {
    if catalog_parameters > 0 {
        Some(catalog_parameters)
    } else {
        model_size_from_name(base_name)
    }
}

/// Filter the config list by model size.
///
/// Minimum bit threshold: `< 3B → 3 bits`, `< 10B → 2 bits`, `≥ 10B → 1 bit`.
/// Ternary (`TQ`-prefixed) configs are kept only when the base name carries
/// the `TriLM` marker. Unknown size keeps every config.
pub fn plan_quants(
    base_name: &str,
    model_size: Option<i64>,
    configs: &[QuantConfig],
) -> Vec<QuantConfig> {
    let Some(size) = model_size else {
        warn!("No size for {base_name}; using all quantizations");
        return configs
            .iter()
            .filter(|c| !c.target.starts_with("TQ") || base_name.contains("TriLM"))
            .cloned()
            .collect();
    };

    let min_bits = if size < 3_000_000_000 {
        3
    } else if size < 10_000_000_000 {
        2
    } else {
        1
    };

    let mut kept = Vec::new();
    for config in configs {
        let bits = bit_level(&config.target);
        let trilm_ok = !config.target.starts_with("TQ") || base_name.contains("TriLM");
        if bits >= min_bits && trilm_ok {
            kept.push(config.clone());
        } else {
            info!(
                "Skipping {} ({bits} bit) for {base_name} ({:.1}B) - too aggressive",
                config.target,
                size as f64 / 1e9
            );
        }
    }
    kept
}

/// Whether this type pair can hit the quantizer's Q5_K/Q6_K rejection.
pub fn needs_compatibility_fallback(output_type: Option<&str>, embed_type: Option<&str>) -> bool {
    let risky = |t: Option<&str>| matches!(t, Some("Q5_K") | Some("Q6_K"));
    risky(output_type) || risky(embed_type)
}

/// The Q5_1 fallback pair for a rejected type combination.
pub fn fallback_types(
    output_type: Option<&str>,
    embed_type: Option<&str>,
) -> (Option<String>, Option<String>) {
    let adjust = |t: Option<&str>| {
        t.map(|t| {
            if t == "Q5_K" || t == "Q6_K" {
                "Q5_1".to_string()
            } else {
                t.to_string()
            }
        })
    };
    (adjust(output_type), adjust(embed_type))
}

/// Full-precision keep mode implied by a quant suffix (`bf16` wins over
/// `f16` since every `bf16` suffix also contains `f16`).
pub fn precision_override_for_suffix(suffix: &str) -> Option<PrecisionOverride> {
    let lower = suffix.to_lowercase();
    if lower.contains("bf16") {
        Some(PrecisionOverride::Bf16)
    } else if lower.contains("f16") {
        Some(PrecisionOverride::F16)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, target: &str) -> QuantConfig {
        QuantConfig {
            name: name.to_string(),
            target: target.to_string(),
            embed_type: String::new(),
            output_type: String::new(),
            use_imatrix: false,
            use_pure: false,
        }
    }

    #[test]
    fn test_model_size_from_name() {
        assert_eq!(model_size_from_name("llama-7b"), Some(7_000_000_000));
        assert_eq!(model_size_from_name("Demo-1B"), Some(1_000_000_000));
        assert_eq!(model_size_from_name("gpt-350m-chat"), Some(350_000_000));
        assert_eq!(model_size_from_name("qwen-1.5b-instruct"), Some(1_500_000_000));
        assert_eq!(model_size_from_name("mystery-model"), None);
    }

    #[test]
    fn test_size_filter_drops_low_bits_for_small_models() {
        // 1B model: threshold is 3 bits; everything below is dropped,
        // declared order preserved.
        let configs = vec![
            config("iq1_s", "IQ1_S"),
            config("iq2_m", "IQ2_M"),
            config("q3_k_m", "Q3_K_M"),
            config("q4_k_m", "Q4_K_M"),
            config("q8_0", "Q8_0"),
        ];
        let kept = plan_quants("Demo-1B", Some(1_000_000_000), &configs);
        let names: Vec<&str> = kept.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["q3_k_m", "q4_k_m", "q8_0"]);
    }

    #[test]
    fn test_size_filter_thresholds() {
        let configs = vec![config("iq1_s", "IQ1_S"), config("iq2_m", "IQ2_M")];

        // 7B: 2-bit threshold keeps IQ2 but not IQ1.
        let kept = plan_quants("model-7b", Some(7_000_000_000), &configs);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "iq2_m");

        // 70B: 1-bit threshold keeps everything.
        let kept = plan_quants("model-70b", Some(70_000_000_000), &configs);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_ternary_requires_trilm_marker() {
        let configs = vec![config("tq1_0", "TQ1_0"), config("q4_k_m", "Q4_K_M")];

        let kept = plan_quants("model-70b", Some(70_000_000_000), &configs);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "q4_k_m");

        let kept = plan_quants("TriLM-70b", Some(70_000_000_000), &configs);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_unknown_size_keeps_all_but_gates_ternary() {
        let configs = vec![config("iq1_s", "IQ1_S"), config("tq1_0", "TQ1_0")];
        let kept = plan_quants("mystery", None, &configs);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "iq1_s");
    }

    #[test]
    fn test_effective_model_size_prefers_catalog() {
        assert_eq!(effective_model_size("Demo-1B", 5_000_000_000), Some(5_000_000_000));
        assert_eq!(effective_model_size("Demo-1B", -1), Some(1_000_000_000));
        assert_eq!(effective_model_size("mystery", -1), None);
    }

    #[test]
    fn test_compatibility_fallback() {
        assert!(needs_compatibility_fallback(Some("Q5_K"), None));
        assert!(needs_compatibility_fallback(None, Some("Q6_K")));
        assert!(!needs_compatibility_fallback(Some("Q5_1"), Some("Q8_0")));
        assert!(!needs_compatibility_fallback(None, None));

        let (output, embed) = fallback_types(Some("Q5_K"), Some("Q6_K"));
        assert_eq!(output.as_deref(), Some("Q5_1"));
        assert_eq!(embed.as_deref(), Some("Q5_1"));

        let (output, embed) = fallback_types(Some("Q8_0"), None);
        assert_eq!(output.as_deref(), Some("Q8_0"));
        assert_eq!(embed, None);
    }

    #[test]
    fn test_precision_override_for_suffix() {
        assert_eq!(precision_override_for_suffix("bf16"), Some(PrecisionOverride::Bf16));
        assert_eq!(precision_override_for_suffix("q4_k_f16"), Some(PrecisionOverride::F16));
        assert_eq!(precision_override_for_suffix("q4_k_m"), None);
    }

    #[test]
    fn test_empty_type_strings_are_none() {
        let c = config("q4_k_m", "Q4_K_M");
        assert_eq!(c.output_type(), None);
        assert_eq!(c.embed_type(), None);
    }
}

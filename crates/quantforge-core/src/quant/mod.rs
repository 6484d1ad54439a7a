//! Quantization policy: the precision ladder, the per-tensor rule engine,
//! and the quant-step planner.

mod ladder;
mod planner;
mod rules;

pub use ladder::{bit_level, ladder_index, substitute, QUANT_LADDER};
pub use planner::{
    effective_model_size, fallback_types, load_quant_configs, model_size_from_name,
    needs_compatibility_fallback, plan_quants, precision_override_for_suffix, QuantConfig,
};
pub use rules::{
    extract_layer_order, layer_matches, normalize_layer_order, PrecisionOverride, QuantRule,
    RuleEngine, TensorInfo,
};

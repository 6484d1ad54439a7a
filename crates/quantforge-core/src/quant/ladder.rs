//! The precision ladder and its lookup tables.

/// Ordered precision symbols, lowest effective bit count first. Rule bumps
/// advance along this ladder and clamp at the top.
pub const QUANT_LADDER: &[&str] = &[
    "IQ1_S", "IQ1_M", "IQ2_XXS", "IQ2_XS", "IQ2_S", "Q2_K", "IQ3_XXS", "IQ3_S", "Q3_K", "IQ4_XS",
    "IQ4_NL", "Q4_K", "Q5_K", "Q6_K", "Q8_0",
];

/// Ladder index used when a target symbol is unknown.
pub const FALLBACK_SYMBOL: &str = "Q4_K";

/// Normalize family aliases onto their ladder representative.
pub fn substitute(symbol: &str) -> &str {
    match symbol {
        "IQ2_M" => "IQ2_S",
        "IQ3_M" => "IQ3_S",
        "IQ3_XS" => "IQ3_XXS",
        "Q2_K_S" | "Q2_K_M" => "Q2_K",
        "Q3_K_S" | "Q3_K_M" => "Q3_K",
        "Q4_K_S" | "Q4_K_M" => "Q4_K",
        "Q5_K_S" | "Q5_K_M" => "Q5_K",
        "Q6_K_S" | "Q6_K_M" => "Q6_K",
        other => other,
    }
}

/// Position of a (substituted) symbol on the ladder.
pub fn ladder_index(symbol: &str) -> Option<usize> {
    QUANT_LADDER.iter().position(|s| *s == substitute(symbol))
}

/// Effective bit count of a quant symbol, used by the size filter.
/// Unknown symbols are treated as full precision.
pub fn bit_level(symbol: &str) -> u32 {
    match symbol {
        "IQ1_S" | "IQ1_M" | "TQ1_0" => 1,
        "Q2_K" | "Q2_K_S" | "Q2_K_M" | "IQ2_XS" | "IQ2_S" | "IQ2_M" | "IQ2_XXS" | "TQ2_0" => 2,
        "Q3_K" | "Q3_K_S" | "Q3_K_M" | "IQ3_XS" | "IQ3_S" | "IQ3_M" | "IQ3_XXS" => 3,
        "Q4_K" | "Q4_K_S" | "Q4_K_M" | "IQ4_XS" | "IQ4_NL" | "Q4_0" | "Q4_1" => 4,
        "Q5_K" | "Q5_K_S" | "Q5_K_M" | "Q5_0" | "Q5_1" => 5,
        "Q6_K" => 6,
        "Q8_0" => 8,
        _ => 16,
    }
}

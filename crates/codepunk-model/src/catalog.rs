// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

/// Static metadata for a known model.
///
/// Prices are USD per million tokens. The catalog exists so usage events
/// can carry an estimated cost without a network round trip; models not
/// listed here simply report no cost.
#[derive(Debug, Clone)]
pub struct ModelCatalogEntry {
    pub id: &'static str,
    pub provider: &'static str,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub input_price_per_mtok: f64,
    pub output_price_per_mtok: f64,
}

/// Model ids carry date suffixes (`claude-sonnet-4-5-20250929`), so lookup
/// matches on the catalog id as a prefix of the requested id.
pub fn lookup(model_id: &str) -> Option<&'static ModelCatalogEntry> {
    CATALOG.iter().find(|e| model_id.starts_with(e.id))
}

/// Estimated request cost in USD, or `None` for unknown models.
pub fn estimate_cost(model_id: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
    let entry = lookup(model_id)?;
    Some(
        input_tokens as f64 / 1_000_000.0 * entry.input_price_per_mtok
            + output_tokens as f64 / 1_000_000.0 * entry.output_price_per_mtok,
    )
}

static CATALOG: &[ModelCatalogEntry] = &[
    ModelCatalogEntry {
        id: "claude-opus-4",
        provider: "anthropic",
        context_window: 200_000,
        max_output_tokens: 32_000,
        input_price_per_mtok: 15.0,
        output_price_per_mtok: 75.0,
    },
    ModelCatalogEntry {
        id: "claude-sonnet-4",
        provider: "anthropic",
        context_window: 200_000,
        max_output_tokens: 64_000,
        input_price_per_mtok: 3.0,
        output_price_per_mtok: 15.0,
    },
    ModelCatalogEntry {
        id: "claude-haiku-4",
        provider: "anthropic",
        context_window: 200_000,
        max_output_tokens: 64_000,
        input_price_per_mtok: 1.0,
        output_price_per_mtok: 5.0,
    },
    ModelCatalogEntry {
        id: "claude-3-5-sonnet",
        provider: "anthropic",
        context_window: 200_000,
        max_output_tokens: 8_192,
        input_price_per_mtok: 3.0,
        output_price_per_mtok: 15.0,
    },
    ModelCatalogEntry {
        id: "claude-3-5-haiku",
        provider: "anthropic",
        context_window: 200_000,
        max_output_tokens: 8_192,
        input_price_per_mtok: 0.8,
        output_price_per_mtok: 4.0,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_matches_dated_model_id() {
        let e = lookup("claude-sonnet-4-5-20250929").unwrap();
        assert_eq!(e.provider, "anthropic");
    }

    #[test]
    fn lookup_unknown_model_is_none() {
        assert!(lookup("gpt-4o").is_none());
    }

    #[test]
    fn estimate_cost_uses_both_prices() {
        // 1M input at $3 + 1M output at $15
        let cost = estimate_cost("claude-sonnet-4-5", 1_000_000, 1_000_000).unwrap();
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn estimate_cost_unknown_model_is_none() {
        assert!(estimate_cost("unknown-model", 100, 100).is_none());
    }
}

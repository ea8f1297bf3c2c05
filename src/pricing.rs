//! Model Pricing Table
//!
//! Static per-(provider, model) cost rates. Lookups are pure; unknown keys
//! price as zero with a warning rather than failing the call. Pricing
//! changes require a redeploy.

use std::collections::HashMap;
use tracing::warn;

use crate::providers::Provider;

/// Input/output cost per 1k tokens, USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRate {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Immutable pricing lookup, built at boot.
#[derive(Debug, Clone)]
pub struct PricingTable {
    rates: HashMap<(Provider, String), ModelRate>,
}

impl PricingTable {
    pub fn new(entries: Vec<(Provider, &str, ModelRate)>) -> Self {
        let rates = entries
            .into_iter()
            .map(|(provider, model, rate)| ((provider, model.to_string()), rate))
            .collect();
        Self { rates }
    }

    pub fn rate(&self, provider: Provider, model: &str) -> Option<ModelRate> {
        self.rates.get(&(provider, model.to_string())).copied()
    }

    /// Pure cost estimate. Unknown (provider, model) pairs cost zero.
    pub fn estimate(
        &self,
        provider: Provider,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) -> f64 {
        match self.rate(provider, model) {
            Some(rate) => {
                (input_tokens as f64 / 1000.0) * rate.input_per_1k
                    + (output_tokens as f64 / 1000.0) * rate.output_per_1k
            }
            None => {
                warn!(%provider, model, "no pricing entry; estimating cost as zero");
                0.0
            }
        }
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new(vec![
            (
                Provider::Anthropic,
                "claude-opus-4",
                ModelRate { input_per_1k: 0.015, output_per_1k: 0.075 },
            ),
            (
                Provider::Anthropic,
                "claude-sonnet-4-20250514",
                ModelRate { input_per_1k: 0.003, output_per_1k: 0.015 },
            ),
            (
                Provider::Anthropic,
                "claude-3-5-haiku-latest",
                ModelRate { input_per_1k: 0.0008, output_per_1k: 0.004 },
            ),
            (
                Provider::OpenAi,
                "gpt-4o",
                ModelRate { input_per_1k: 0.0025, output_per_1k: 0.01 },
            ),
            (
                Provider::OpenAi,
                "gpt-4o-mini",
                ModelRate { input_per_1k: 0.00015, output_per_1k: 0.0006 },
            ),
            (
                Provider::OpenAi,
                "o3-mini",
                ModelRate { input_per_1k: 0.0011, output_per_1k: 0.0044 },
            ),
            (
                Provider::Google,
                "gemini-1.5-pro",
                ModelRate { input_per_1k: 0.00125, output_per_1k: 0.005 },
            ),
            (
                Provider::Google,
                "gemini-2.0-flash",
                ModelRate { input_per_1k: 0.0001, output_per_1k: 0.0004 },
            ),
            (
                Provider::Google,
                "gemini-2.0-flash-lite",
                ModelRate { input_per_1k: 0.000075, output_per_1k: 0.0003 },
            ),
        ])
    }
}

//! Per-model token pricing

use forge_agent::Usage;

/// USD per million tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

const OPUS: ModelPricing = ModelPricing {
    input_per_million: 15.0,
    output_per_million: 75.0,
};

const SONNET: ModelPricing = ModelPricing {
    input_per_million: 3.0,
    output_per_million: 15.0,
};

const HAIKU: ModelPricing = ModelPricing {
    input_per_million: 0.80,
    output_per_million: 4.0,
};

impl ModelPricing {
    /// Rates for an API model name. Unknown models are billed at Sonnet rates.
    pub fn for_model(model: &str) -> Self {
        let model = model.to_lowercase();
        if model.contains("opus") {
            OPUS
        } else if model.contains("haiku") {
            HAIKU
        } else {
            SONNET
        }
    }

    pub fn cost(&self, usage: &Usage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_million
            + usage.output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

/// Cost in USD of `usage` on `model`
pub fn cost_usd(model: &str, usage: &Usage) -> f64 {
    ModelPricing::for_model(model).cost(usage)
}

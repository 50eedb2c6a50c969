//! Best-effort cost estimates for child runs.
//!
//! Rates come from `models.providers.<provider>.models[].cost` (USD per
//! million tokens). Lookups match on the model portion after an optional
//! `provider/` prefix, so "anthropic/claude-sonnet-4" and
//! "claude-sonnet-4" both resolve. Unknown models yield no estimate.

use crate::config::{ModelCost, ModelsConfig};

fn model_portion(model_name: &str) -> &str {
    model_name
        .split_once('/')
        .map(|(_, model)| model)
        .unwrap_or(model_name)
}

/// Look up configured pricing for a model name.
pub fn find_model_cost<'a>(models: &'a ModelsConfig, model_name: &str) -> Option<&'a ModelCost> {
    let portion = model_portion(model_name);
    models
        .providers
        .values()
        .flat_map(|provider| provider.models.iter())
        .find(|entry| entry.id == portion || entry.id == model_name)
        .and_then(|entry| entry.cost.as_ref())
}

/// Whether the configuration knows this model at all (used to validate
/// spawn-time model overrides).
pub fn is_known_model(models: &ModelsConfig, model_name: &str) -> bool {
    let portion = model_portion(model_name);
    models
        .providers
        .values()
        .flat_map(|provider| provider.models.iter())
        .any(|entry| entry.id == portion || entry.id == model_name)
}

/// Estimate cost in USD for a completed run.
pub fn estimate_cost(cost: &ModelCost, input_tokens: u64, output_tokens: u64) -> f64 {
    (input_tokens as f64 * cost.input + output_tokens as f64 * cost.output) / 1_000_000.0
}

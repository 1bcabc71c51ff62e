//! Token/call accounting and budget checks for a single run.

use tracing::debug;

use crate::config::AgentConfig;
use crate::types::{AgentUsage, TokenUsage};

/// USD per 1M tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

impl ModelPricing {
    const fn new(input: f64, output: f64, cache_read: f64, cache_write: f64) -> Self {
        Self {
            input,
            output,
            cache_read,
            cache_write,
        }
    }
}

/// Matched by prefix, first hit wins, so longer prefixes come first.
const PRICING_TABLE: &[(&str, ModelPricing)] = &[
    ("gpt-4o-mini", ModelPricing::new(0.15, 0.60, 0.075, 0.15)),
    ("gpt-4o", ModelPricing::new(2.50, 10.00, 1.25, 2.50)),
    ("gpt-4.1-nano", ModelPricing::new(0.10, 0.40, 0.025, 0.10)),
    ("gpt-4.1-mini", ModelPricing::new(0.40, 1.60, 0.10, 0.40)),
    ("gpt-4.1", ModelPricing::new(2.00, 8.00, 0.50, 2.00)),
    ("claude-3-5-haiku", ModelPricing::new(0.80, 4.00, 0.08, 1.00)),
    ("claude-haiku-4", ModelPricing::new(1.00, 5.00, 0.10, 1.25)),
    ("claude-sonnet-4", ModelPricing::new(3.00, 15.00, 0.30, 3.75)),
    ("claude-opus-4", ModelPricing::new(15.00, 75.00, 1.50, 18.75)),
];

const FALLBACK_PRICING: ModelPricing = ModelPricing::new(3.00, 15.00, 0.30, 3.75);

pub fn pricing_for(model: &str) -> ModelPricing {
    let lower = model.to_ascii_lowercase();
    PRICING_TABLE
        .iter()
        .find(|(prefix, _)| lower.starts_with(prefix))
        .map(|(_, pricing)| *pricing)
        .unwrap_or(FALLBACK_PRICING)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetCheck {
    Available,
    StepExhausted { used: u32, limit: u32 },
    RunExhausted { used: u32, limit: u32 },
}

/// Sole mutator of `AgentUsage` for one run. Owned by the orchestrator and
/// lent to the agent loop; never shared between runs.
#[derive(Debug)]
pub struct CostTracker {
    model: String,
    pricing: ModelPricing,
    max_api_calls: u32,
    max_calls_per_step: u32,
    usage: AgentUsage,
}

impl CostTracker {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            model: config.model.clone(),
            pricing: pricing_for(&config.model),
            max_api_calls: config.max_api_calls,
            max_calls_per_step: config.max_calls_per_step,
            usage: AgentUsage::default(),
        }
    }

    /// Count one model call and its tokens.
    pub fn record_call(&mut self, tokens: &TokenUsage) {
        let cost = (tokens.input_tokens as f64 * self.pricing.input
            + tokens.output_tokens as f64 * self.pricing.output
            + tokens.cache_read_tokens as f64 * self.pricing.cache_read
            + tokens.cache_write_tokens as f64 * self.pricing.cache_write)
            / 1_000_000.0;

        self.usage.api_calls += 1;
        self.usage.input_tokens += tokens.input_tokens;
        self.usage.output_tokens += tokens.output_tokens;
        self.usage.cache_read_tokens += tokens.cache_read_tokens;
        self.usage.cache_write_tokens += tokens.cache_write_tokens;
        self.usage.estimated_cost_usd += cost;

        debug!(
            model = %self.model,
            calls = self.usage.api_calls,
            input_tokens = tokens.input_tokens,
            output_tokens = tokens.output_tokens,
            cost,
            total_cost = self.usage.estimated_cost_usd,
            "Tracked model call"
        );
    }

    /// Snapshot of the totals so far.
    pub fn usage(&self) -> AgentUsage {
        self.usage.clone()
    }

    /// Run-wide exhaustion is reported ahead of the per-step limit because it
    /// aborts the whole run rather than one step.
    pub fn check_budget(&self, step_calls: u32) -> BudgetCheck {
        if self.usage.api_calls >= self.max_api_calls {
            BudgetCheck::RunExhausted {
                used: self.usage.api_calls,
                limit: self.max_api_calls,
            }
        } else if step_calls >= self.max_calls_per_step {
            BudgetCheck::StepExhausted {
                used: step_calls,
                limit: self.max_calls_per_step,
            }
        } else {
            BudgetCheck::Available
        }
    }

    pub fn has_remaining_calls(&self, step_calls: u32) -> bool {
        self.check_budget(step_calls) == BudgetCheck::Available
    }
}

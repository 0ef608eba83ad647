//! In-process token/cost totals for one pipeline invocation.

use serde::Serialize;

use crate::core::types::TokenUsage;

/// Running totals; starts from zero on every invocation, even when resuming.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TokenUsageAggregate {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub step_count: u32,
}

impl TokenUsageAggregate {
    /// Fold one step's numbers into the totals.
    pub fn record_step(&mut self, usage: Option<TokenUsage>, cost_usd: Option<f64>, duration_ms: u64) {
        if let Some(usage) = usage {
            self.input_tokens += usage.input_tokens;
            self.output_tokens += usage.output_tokens;
            self.cache_read_tokens += usage.cache_read_tokens;
            self.cache_creation_tokens += usage.cache_creation_tokens;
        }
        self.cost_usd += cost_usd.unwrap_or(0.0);
        self.duration_ms += duration_ms;
        self.step_count += 1;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }

    /// Human-readable summary printed at the end of a run.
    pub fn render_summary(&self) -> String {
        let mut buf = String::new();
        buf.push_str(&format!("steps:          {}\n", self.step_count));
        buf.push_str(&format!(
            "duration:       {}\n",
            format_duration_ms(self.duration_ms)
        ));
        buf.push_str(&format!("input tokens:   {}\n", self.input_tokens));
        buf.push_str(&format!("output tokens:  {}\n", self.output_tokens));
        buf.push_str(&format!("cache read:     {}\n", self.cache_read_tokens));
        buf.push_str(&format!("cache creation: {}\n", self.cache_creation_tokens));
        buf.push_str(&format!("total tokens:   {}\n", self.total_tokens()));
        buf.push_str(&format!("cost:           ${:.4}\n", self.cost_usd));
        buf
    }
}

fn format_duration_ms(ms: u64) -> String {
    let secs = ms / 1000;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

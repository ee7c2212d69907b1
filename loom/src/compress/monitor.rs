//! `CompactionMonitor`: pure policy over context usage vs. threshold (spec §4.3).

use model_spec_core::{effective_context_limit, ModelString, ProvidersConfig};

/// Percentage points added on top of `threshold*100` to distinguish "warn"
/// from "force" (§4.3).
pub const FORCE_BUFFER_PCT: f64 = 10.0;

#[derive(Debug, Clone, Copy)]
pub struct ContextUsage {
    pub input_tokens: u64,
    pub cached_input_tokens: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreSendCheck {
    pub should_show_warning: bool,
    pub should_force_compact: bool,
    pub usage_percentage: f64,
    pub threshold_percentage: f64,
}

pub struct CheckInputs<'a> {
    pub model: &'a ModelString,
    pub usage: Option<ContextUsage>,
    pub use_1m_context: bool,
    pub providers_config: &'a ProvidersConfig,
}

pub struct CompactionMonitor {
    threshold: f64,
    has_triggered_for_current_stream: bool,
}

impl CompactionMonitor {
    /// `threshold` ∈ (0,1]; 1.0 disables auto-compaction.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(f64::MIN_POSITIVE, 1.0),
            has_triggered_for_current_stream: false,
        }
    }

    fn usage_percentage(inputs: &CheckInputs<'_>) -> Option<f64> {
        let usage = inputs.usage?;
        let limit = effective_context_limit(inputs.model, inputs.use_1m_context, inputs.providers_config)?;
        if limit == 0 {
            return None;
        }
        Some((usage.input_tokens as f64 / limit as f64) * 100.0)
    }

    pub fn check_before_send(&self, inputs: &CheckInputs<'_>) -> PreSendCheck {
        let threshold_pct = self.threshold * 100.0;
        let usage_pct = match Self::usage_percentage(inputs) {
            Some(p) => p,
            None => {
                return PreSendCheck {
                    should_show_warning: false,
                    should_force_compact: false,
                    usage_percentage: 0.0,
                    threshold_percentage: threshold_pct,
                }
            }
        };
        let force_threshold = threshold_pct + FORCE_BUFFER_PCT;
        PreSendCheck {
            should_show_warning: usage_pct >= threshold_pct,
            should_force_compact: self.threshold < 1.0 && usage_pct >= force_threshold,
            usage_percentage: usage_pct,
            threshold_percentage: threshold_pct,
        }
    }

    /// Returns `true` only on the first crossing of `threshold*100 + FORCE_BUFFER_PCT`
    /// per stream; latches until `reset_for_new_stream`.
    pub fn check_mid_stream(&mut self, inputs: &CheckInputs<'_>) -> bool {
        if self.threshold >= 1.0 || self.has_triggered_for_current_stream {
            return false;
        }
        let usage_pct = match Self::usage_percentage(inputs) {
            Some(p) => p,
            None => return false,
        };
        let force_threshold = self.threshold * 100.0 + FORCE_BUFFER_PCT;
        if usage_pct >= force_threshold {
            self.has_triggered_for_current_stream = true;
            true
        } else {
            false
        }
    }

    pub fn reset_for_new_stream(&mut self) {
        self.has_triggered_for_current_stream = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs<'a>(
        model: &'a ModelString,
        input_tokens: u64,
        providers: &'a ProvidersConfig,
    ) -> CheckInputs<'a> {
        CheckInputs {
            model,
            usage: Some(ContextUsage {
                input_tokens,
                cached_input_tokens: None,
            }),
            use_1m_context: false,
            providers_config: providers,
        }
    }

    #[test]
    fn threshold_one_disables_force_compact() {
        let monitor = CompactionMonitor::new(1.0);
        let model = ModelString("anthropic:claude-sonnet-4-5".into());
        let providers = ProvidersConfig::default();
        let result = monitor.check_before_send(&inputs(&model, 199_999, &providers));
        assert!(!result.should_force_compact);
    }

    #[test]
    fn crosses_force_buffer_triggers_force_compact() {
        let monitor = CompactionMonitor::new(0.85);
        let model = ModelString("anthropic:claude-sonnet-4-5".into());
        let providers = ProvidersConfig::default();
        // context_limit 200_000; 95% = 190_000 > (85+10)% = 95% boundary
        let result = monitor.check_before_send(&inputs(&model, 191_000, &providers));
        assert!(result.should_force_compact);
        assert!(result.should_show_warning);
    }

    #[test]
    fn warning_only_below_force_buffer() {
        let monitor = CompactionMonitor::new(0.70);
        let model = ModelString("anthropic:claude-sonnet-4-5".into());
        let providers = ProvidersConfig::default();
        // 72% usage: above 70% warn, below 80% force
        let result = monitor.check_before_send(&inputs(&model, 144_000, &providers));
        assert!(result.should_show_warning);
        assert!(!result.should_force_compact);
    }

    #[test]
    fn mid_stream_latches_until_reset() {
        let mut monitor = CompactionMonitor::new(0.85);
        let model = ModelString("anthropic:claude-sonnet-4-5".into());
        let providers = ProvidersConfig::default();
        let over = inputs(&model, 191_000, &providers);
        assert!(monitor.check_mid_stream(&over));
        assert!(!monitor.check_mid_stream(&over), "latched until reset");
        monitor.reset_for_new_stream();
        assert!(monitor.check_mid_stream(&over));
    }

    #[test]
    fn malformed_context_limit_returns_false_not_panic() {
        let mut monitor = CompactionMonitor::new(0.85);
        let model = ModelString("no-colon-here".into());
        let providers = ProvidersConfig::default();
        let usage = inputs(&model, 1000, &providers);
        assert!(!monitor.check_mid_stream(&usage));
    }

    #[test]
    fn cached_input_tokens_are_not_added_to_input_tokens() {
        let monitor = CompactionMonitor::new(0.85);
        let model = ModelString("anthropic:claude-sonnet-4-5".into());
        let providers = ProvidersConfig::default();
        let inputs = CheckInputs {
            model: &model,
            usage: Some(ContextUsage {
                input_tokens: 50_000,
                cached_input_tokens: Some(1_000_000),
            }),
            use_1m_context: false,
            providers_config: &providers,
        };
        let result = monitor.check_before_send(&inputs);
        assert!((result.usage_percentage - 25.0).abs() < 0.01);
    }
}

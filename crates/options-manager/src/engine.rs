//! Priority-ordered rule evaluation.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::context::RuleContext;
use crate::metrics::RuleCounters;
use crate::rules::{ExitRule, Rule};
use crate::types::RuleResult;

/// Walks the rules from most to least urgent and returns the first exit.
///
/// `no_action` and `skip` fall through to the next rule. A rule that errors
/// or panics is logged, counted as a fault and treated as a skip, so it
/// cannot suppress the rules behind it.
pub struct RuleEngine {
    rules: Vec<Rule>,
    counters: Arc<RuleCounters>,
}

impl RuleEngine {
    #[must_use]
    pub fn new(counters: Arc<RuleCounters>) -> Self {
        Self::with_rules(Rule::all(), counters)
    }

    #[must_use]
    pub fn with_rules(mut rules: Vec<Rule>, counters: Arc<RuleCounters>) -> Self {
        rules.sort_by_key(ExitRule::priority);
        Self { rules, counters }
    }

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn evaluate(&self, ctx: &RuleContext) -> RuleResult {
        if !ctx.is_active() {
            return RuleResult::skip(format!("position is {}", ctx.status));
        }

        for rule in &self.rules {
            if !rule.enabled(ctx.risk()) {
                continue;
            }
            let kind = rule.kind();
            match panic::catch_unwind(AssertUnwindSafe(|| rule.evaluate(ctx))) {
                Ok(Ok(RuleResult::Exit(signal))) => {
                    self.counters.record_hit(kind);
                    info!(
                        position_id = ctx.position_id,
                        rule = %kind,
                        reason = signal.reason,
                        "Exit rule fired"
                    );
                    return RuleResult::Exit(signal);
                }
                Ok(Ok(RuleResult::NoAction)) => {}
                Ok(Ok(RuleResult::Skip { reason })) => {
                    self.counters.record_skip(kind);
                    debug!(position_id = ctx.position_id, rule = %kind, reason, "Rule skipped");
                }
                Ok(Err(e)) => {
                    self.counters.record_fault(kind);
                    error!(position_id = ctx.position_id, rule = %kind, error = %e, "Rule failed");
                }
                Err(_) => {
                    self.counters.record_fault(kind);
                    error!(position_id = ctx.position_id, rule = %kind, "Rule panicked");
                }
            }
        }
        RuleResult::NoAction
    }
}

//! Loss and clock-driven exits.

use algo_trade_core::RiskConfig;
use serde_json::json;

use super::{require_positive, ExitRule, RuleError, NO_PNL};
use crate::context::RuleContext;
use crate::types::{ExitSignal, RuleKind, RuleResult};

/// Force-close at the session exit cutoff, whatever the pnl.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionEndRule;

impl ExitRule for SessionEndRule {
    fn kind(&self) -> RuleKind {
        RuleKind::SessionEnd
    }

    fn enabled(&self, config: &RiskConfig) -> bool {
        config.rules.session_end
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleResult, RuleError> {
        let cutoff = ctx.config.session.exit_cutoff;
        let now = ctx.time_of_day();
        if now < cutoff {
            return Ok(RuleResult::NoAction);
        }
        tracing::warn!(
            position_id = ctx.position_id,
            time = %now,
            cutoff = %cutoff,
            "Session end cutoff reached"
        );
        Ok(RuleResult::Exit(ExitSignal::new(
            RuleKind::SessionEnd,
            "SESSION END",
            json!({ "time": now.to_string(), "cutoff": cutoff.to_string() }),
        )))
    }
}

/// Close once the loss reaches `sl_pct` of the entry premium.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopLossRule;

impl ExitRule for StopLossRule {
    fn kind(&self) -> RuleKind {
        RuleKind::StopLoss
    }

    fn enabled(&self, config: &RiskConfig) -> bool {
        config.rules.stop_loss
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleResult, RuleError> {
        let sl_pct = require_positive(RuleKind::StopLoss, "sl_pct", ctx.risk().sl_pct)?;
        let Some(pnl_pct) = ctx.pnl_pct() else {
            return Ok(RuleResult::skip(NO_PNL));
        };
        if pnl_pct > -sl_pct {
            return Ok(RuleResult::NoAction);
        }
        tracing::warn!(
            position_id = ctx.position_id,
            pnl_pct = %pnl_pct,
            threshold = %sl_pct,
            "Stop loss triggered"
        );
        Ok(RuleResult::Exit(ExitSignal::new(
            RuleKind::StopLoss,
            "SL HIT",
            json!({
                "pnl_pct": pnl_pct.to_string(),
                "pnl_rupees": ctx.pnl_rupees().map(|r| r.to_string()),
                "sl_pct": sl_pct.to_string(),
            }),
        )))
    }
}

/// After `time_exit_cutoff`, bank positions that are above the profit floor.
/// Positions below it are left to the other rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeBasedExitRule;

impl ExitRule for TimeBasedExitRule {
    fn kind(&self) -> RuleKind {
        RuleKind::TimeBasedExit
    }

    fn enabled(&self, config: &RiskConfig) -> bool {
        config.rules.time_based_exit
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleResult, RuleError> {
        let cutoff = ctx.risk().time_exit_cutoff;
        let now = ctx.time_of_day();
        if now < cutoff {
            return Ok(RuleResult::NoAction);
        }
        let Some(pnl_rupees) = ctx.pnl_rupees() else {
            return Ok(RuleResult::skip(NO_PNL));
        };
        let floor = ctx.risk().time_exit_min_profit_rupees;
        if pnl_rupees <= floor {
            return Ok(RuleResult::NoAction);
        }
        tracing::info!(
            position_id = ctx.position_id,
            pnl_rupees = %pnl_rupees,
            cutoff = %cutoff,
            "Time-based exit"
        );
        Ok(RuleResult::Exit(ExitSignal::new(
            RuleKind::TimeBasedExit,
            "TIME EXIT",
            json!({
                "time": now.to_string(),
                "cutoff": cutoff.to_string(),
                "pnl_rupees": pnl_rupees.to_string(),
                "min_profit_rupees": floor.to_string(),
            }),
        )))
    }
}

//! Profit-taking exits.

use algo_trade_core::RiskConfig;
use serde_json::json;

use super::{require_positive, ExitRule, RuleError, NO_PNL};
use crate::context::RuleContext;
use crate::types::{ExitSignal, RuleKind, RuleResult};

/// An exchange-side bracket order already closed the position; record it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BracketLimitRule;

impl ExitRule for BracketLimitRule {
    fn kind(&self) -> RuleKind {
        RuleKind::BracketLimit
    }

    fn enabled(&self, config: &RiskConfig) -> bool {
        config.rules.bracket_limit
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleResult, RuleError> {
        let Some(fill) = &ctx.bracket_fill else {
            return Ok(RuleResult::NoAction);
        };
        tracing::info!(
            position_id = ctx.position_id,
            order_id = fill.order_id,
            price = %fill.price,
            "Bracket order filled"
        );
        Ok(RuleResult::Exit(
            ExitSignal::new(
                RuleKind::BracketLimit,
                "BRACKET LIMIT FILLED",
                json!({
                    "order_id": fill.order_id,
                    "fill_price": fill.price.to_string(),
                    "filled_at": fill.filled_at.to_rfc3339(),
                }),
            )
            .with_fill_price(fill.price),
        ))
    }
}

/// Close once the gain reaches `tp_pct` of the entry premium.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TakeProfitRule;

impl ExitRule for TakeProfitRule {
    fn kind(&self) -> RuleKind {
        RuleKind::TakeProfit
    }

    fn enabled(&self, config: &RiskConfig) -> bool {
        config.rules.take_profit
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleResult, RuleError> {
        let tp_pct = require_positive(RuleKind::TakeProfit, "tp_pct", ctx.risk().tp_pct)?;
        let Some(pnl_pct) = ctx.pnl_pct() else {
            return Ok(RuleResult::skip(NO_PNL));
        };
        if pnl_pct < tp_pct {
            return Ok(RuleResult::NoAction);
        }
        tracing::info!(
            position_id = ctx.position_id,
            pnl_pct = %pnl_pct,
            target = %tp_pct,
            "Take profit reached"
        );
        Ok(RuleResult::Exit(ExitSignal::new(
            RuleKind::TakeProfit,
            "TP HIT",
            json!({
                "pnl_pct": pnl_pct.to_string(),
                "pnl_rupees": ctx.pnl_rupees().map(|r| r.to_string()),
                "tp_pct": tp_pct.to_string(),
            }),
        )))
    }
}

/// Once the peak rupee profit has crossed the threshold, do not give back
/// more than `secure_profit_drawdown_pct` of it. Not gated on trailing
/// activation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecureProfitRule;

impl ExitRule for SecureProfitRule {
    fn kind(&self) -> RuleKind {
        RuleKind::SecureProfit
    }

    fn enabled(&self, config: &RiskConfig) -> bool {
        config.rules.secure_profit
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleResult, RuleError> {
        let risk = ctx.risk();
        let threshold = require_positive(
            RuleKind::SecureProfit,
            "secure_profit_threshold_rupees",
            risk.secure_profit_threshold_rupees,
        )?;
        let max_drawdown = require_positive(
            RuleKind::SecureProfit,
            "secure_profit_drawdown_pct",
            risk.secure_profit_drawdown_pct,
        )?;

        if ctx.peak_pnl_rupees < threshold {
            return Ok(RuleResult::NoAction);
        }
        if ctx.pnl.is_none() {
            return Ok(RuleResult::skip(NO_PNL));
        }
        let Some(drawdown) = ctx.drawdown_from_peak_pct() else {
            return Ok(RuleResult::NoAction);
        };
        if drawdown < max_drawdown {
            return Ok(RuleResult::NoAction);
        }
        tracing::info!(
            position_id = ctx.position_id,
            peak_rupees = %ctx.peak_pnl_rupees,
            drawdown_pct = %drawdown,
            "Securing profit"
        );
        Ok(RuleResult::Exit(ExitSignal::new(
            RuleKind::SecureProfit,
            "SECURE PROFIT",
            json!({
                "peak_pnl_rupees": ctx.peak_pnl_rupees.to_string(),
                "peak_pnl_pct": ctx.peak_pnl_pct.to_string(),
                "pnl_rupees": ctx.pnl_rupees().map(|r| r.to_string()),
                "drawdown_pct": drawdown.to_string(),
            }),
        )))
    }
}

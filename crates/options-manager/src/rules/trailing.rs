//! Peak-anchored exits. Both rules stay dormant until the position is
//! trailing-activated (`pnl_pct >= trailing_activation_pct`).

use algo_trade_core::RiskConfig;
use rust_decimal::Decimal;
use serde_json::json;

use super::{require_positive, ExitRule, RuleError, NO_PNL};
use crate::context::RuleContext;
use crate::types::{ExitSignal, RuleKind, RuleResult};

/// Exit when the retrace from the peak reaches `peak_drawdown_exit_pct`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeakDrawdownRule;

impl ExitRule for PeakDrawdownRule {
    fn kind(&self) -> RuleKind {
        RuleKind::PeakDrawdown
    }

    fn enabled(&self, config: &RiskConfig) -> bool {
        config.rules.peak_drawdown
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleResult, RuleError> {
        let limit = require_positive(
            RuleKind::PeakDrawdown,
            "peak_drawdown_exit_pct",
            ctx.risk().peak_drawdown_exit_pct,
        )?;
        if ctx.pnl.is_none() {
            return Ok(RuleResult::skip(NO_PNL));
        }
        if !ctx.trailing_activated() {
            return Ok(RuleResult::NoAction);
        }
        let Some(drawdown) = ctx.drawdown_from_peak_pct() else {
            return Ok(RuleResult::NoAction);
        };
        if drawdown < limit {
            return Ok(RuleResult::NoAction);
        }
        tracing::info!(
            position_id = ctx.position_id,
            peak_pct = %ctx.peak_pnl_pct,
            drawdown_pct = %drawdown,
            "Peak drawdown exit"
        );
        Ok(RuleResult::Exit(ExitSignal::new(
            RuleKind::PeakDrawdown,
            "PEAK DRAWDOWN",
            json!({
                "peak_pnl_pct": ctx.peak_pnl_pct.to_string(),
                "pnl_pct": ctx.pnl_pct().map(|p| p.to_string()),
                "drawdown_pct": drawdown.to_string(),
                "limit_pct": limit.to_string(),
            }),
        )))
    }
}

/// Sliding stop at `peak * (1 - drawdown_pct / 100)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrailingStopRule;

impl TrailingStopRule {
    /// Stop level in pnl-percent terms.
    ///
    /// # Errors
    ///
    /// Returns an error for a distance outside `(0, 100)` or on overflow.
    pub fn stop_level(peak_pct: Decimal, drawdown_pct: Decimal) -> Result<Decimal, RuleError> {
        let distance = require_positive(RuleKind::TrailingStop, "drawdown_pct", drawdown_pct)?;
        if distance >= Decimal::ONE_HUNDRED {
            return Err(RuleError::BadThreshold {
                rule: RuleKind::TrailingStop,
                field: "drawdown_pct",
                value: distance.to_string(),
            });
        }
        let keep = Decimal::ONE - distance / Decimal::ONE_HUNDRED;
        peak_pct
            .checked_mul(keep)
            .map(|level| level.round_dp(4))
            .ok_or(RuleError::Overflow {
                rule: RuleKind::TrailingStop,
            })
    }
}

impl ExitRule for TrailingStopRule {
    fn kind(&self) -> RuleKind {
        RuleKind::TrailingStop
    }

    fn enabled(&self, config: &RiskConfig) -> bool {
        config.rules.trailing_stop
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleResult, RuleError> {
        let stop = Self::stop_level(ctx.peak_pnl_pct, ctx.risk().drawdown_pct)?;
        let Some(pnl_pct) = ctx.pnl_pct() else {
            return Ok(RuleResult::skip(NO_PNL));
        };
        if !ctx.trailing_activated() || ctx.peak_pnl_pct <= Decimal::ZERO {
            return Ok(RuleResult::NoAction);
        }
        if pnl_pct >= stop {
            return Ok(RuleResult::NoAction);
        }
        tracing::info!(
            position_id = ctx.position_id,
            peak_pct = %ctx.peak_pnl_pct,
            stop_pct = %stop,
            pnl_pct = %pnl_pct,
            "Trailing stop hit"
        );
        Ok(RuleResult::Exit(ExitSignal::new(
            RuleKind::TrailingStop,
            "TRAILING STOP",
            json!({
                "peak_pnl_pct": ctx.peak_pnl_pct.to_string(),
                "stop_pct": stop.to_string(),
                "pnl_pct": pnl_pct.to_string(),
            }),
        )))
    }
}

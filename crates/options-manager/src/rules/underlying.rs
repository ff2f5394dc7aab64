//! Last-resort exit on a structural break in the underlying.

use algo_trade_core::{OptionRight, RiskConfig};
use rust_decimal::Decimal;
use serde_json::json;

use super::{require_positive, ExitRule, RuleError};
use crate::context::RuleContext;
use crate::types::{ExitSignal, RuleKind, RuleResult};

/// Exit when the underlying trend turns against the position or its
/// volatility collapses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnderlyingExitRule;

impl UnderlyingExitRule {
    /// +1 when the position profits from the underlying rising, -1 otherwise.
    #[must_use]
    pub fn directional_bias(ctx: &RuleContext) -> Decimal {
        let right = match ctx.right {
            Some(OptionRight::Put) => Decimal::NEGATIVE_ONE,
            Some(OptionRight::Call) | None => Decimal::ONE,
        };
        ctx.side.sign() * right
    }
}

impl ExitRule for UnderlyingExitRule {
    fn kind(&self) -> RuleKind {
        RuleKind::UnderlyingExit
    }

    fn enabled(&self, config: &RiskConfig) -> bool {
        config.rules.underlying_exit
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleResult, RuleError> {
        let thresholds = &ctx.risk().underlying;
        let reversal = require_positive(
            RuleKind::UnderlyingExit,
            "trend_reversal_score",
            thresholds.trend_reversal_score,
        )?;
        let collapse = require_positive(
            RuleKind::UnderlyingExit,
            "atr_collapse_ratio",
            thresholds.atr_collapse_ratio,
        )?;
        let Some(state) = &ctx.underlying else {
            return Ok(RuleResult::skip("no fresh underlying reading"));
        };

        let aligned = state.trend_score * Self::directional_bias(ctx);
        let reason = if aligned <= -reversal {
            "UNDERLYING TREND REVERSAL"
        } else if state.atr_ratio <= collapse {
            "UNDERLYING VOLATILITY COLLAPSE"
        } else {
            return Ok(RuleResult::NoAction);
        };

        tracing::info!(
            position_id = ctx.position_id,
            trend = %state.trend_score,
            atr_ratio = %state.atr_ratio,
            reason,
            "Underlying exit"
        );
        Ok(RuleResult::Exit(ExitSignal::new(
            RuleKind::UnderlyingExit,
            reason,
            json!({
                "trend_score": state.trend_score.to_string(),
                "aligned_trend": aligned.to_string(),
                "atr_ratio": state.atr_ratio.to_string(),
                "observed_at": state.observed_at.to_rfc3339(),
            }),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::{context, morning};
    use crate::types::UnderlyingState;
    use algo_trade_core::{AppConfig, Side};
    use rust_decimal_macros::dec;

    fn reading(trend: Decimal, atr: Decimal) -> Option<UnderlyingState> {
        Some(UnderlyingState {
            trend_score: trend,
            atr_ratio: atr,
            observed_at: morning(),
        })
    }

    #[test]
    fn skips_without_reading() {
        let ctx = context(AppConfig::default(), morning());
        assert!(matches!(
            UnderlyingExitRule.evaluate(&ctx).unwrap(),
            RuleResult::Skip { .. }
        ));
    }

    #[test]
    fn long_call_exits_on_downtrend() {
        let mut ctx = context(AppConfig::default(), morning());
        ctx.underlying = reading(dec!(-0.7), dec!(1.1));
        let result = UnderlyingExitRule.evaluate(&ctx).unwrap();
        assert_eq!(result.exit_signal().unwrap().reason, "UNDERLYING TREND REVERSAL");
    }

    #[test]
    fn long_put_profits_from_downtrend() {
        let mut ctx = context(AppConfig::default(), morning());
        ctx.right = Some(OptionRight::Put);
        ctx.underlying = reading(dec!(-0.7), dec!(1.1));
        assert_eq!(UnderlyingExitRule.evaluate(&ctx).unwrap(), RuleResult::NoAction);

        ctx.side = Side::Short;
        assert!(UnderlyingExitRule.evaluate(&ctx).unwrap().is_exit());
    }

    #[test]
    fn volatility_collapse() {
        let mut ctx = context(AppConfig::default(), morning());
        ctx.underlying = reading(dec!(0.2), dec!(0.5));
        let result = UnderlyingExitRule.evaluate(&ctx).unwrap();
        assert_eq!(
            result.exit_signal().unwrap().reason,
            "UNDERLYING VOLATILITY COLLAPSE"
        );
    }
}

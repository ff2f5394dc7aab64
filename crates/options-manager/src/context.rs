//! Per-cycle view of one position, as the rules see it.

use std::sync::Arc;

use algo_trade_core::{
    AppConfig, InstrumentKey, OptionRight, PnlSnapshot, PositionStatus, RiskConfig, Side,
};
use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::bracket::BracketFillRegistry;
use crate::cache::{CacheEntry, PnlCache};
use crate::ledger::PositionLedger;
use crate::session;
use crate::types::{BracketFill, UnderlyingState};
use crate::underlying::UnderlyingTracker;

/// Read-only snapshot handed to every rule. Rebuilt each cycle.
#[derive(Debug, Clone)]
pub struct RuleContext {
    pub position_id: i64,
    pub instrument: InstrumentKey,
    pub side: Side,
    pub right: Option<OptionRight>,
    pub status: PositionStatus,
    pub entry_price: Decimal,
    pub quantity: i64,
    /// Freshest pnl within the staleness window, if any.
    pub pnl: Option<PnlSnapshot>,
    pub peak_pnl_pct: Decimal,
    pub peak_pnl_rupees: Decimal,
    pub entered_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
    pub bracket_fill: Option<BracketFill>,
    pub underlying: Option<UnderlyingState>,
    pub config: Arc<AppConfig>,
}

impl RuleContext {
    /// An active position with no pnl, peaks or external inputs yet.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        position_id: i64,
        instrument: InstrumentKey,
        side: Side,
        right: Option<OptionRight>,
        entry_price: Decimal,
        quantity: i64,
        entered_at: DateTime<Utc>,
        config: Arc<AppConfig>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            position_id,
            instrument,
            side,
            right,
            status: PositionStatus::Active,
            entry_price,
            quantity,
            pnl: None,
            peak_pnl_pct: Decimal::ZERO,
            peak_pnl_rupees: Decimal::ZERO,
            entered_at: Some(entered_at),
            now,
            bracket_fill: None,
            underlying: None,
            config,
        }
    }

    #[must_use]
    pub fn risk(&self) -> &RiskConfig {
        &self.config.risk
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == PositionStatus::Active
    }

    #[must_use]
    pub fn pnl_pct(&self) -> Option<Decimal> {
        self.pnl.as_ref().map(|p| p.pnl_pct)
    }

    #[must_use]
    pub fn pnl_rupees(&self) -> Option<Decimal> {
        self.pnl.as_ref().map(|p| p.pnl_rupees)
    }

    /// Retracement from the peak, as a percentage of the peak.
    ///
    /// `None` until the position has been in profit and while pnl is absent.
    #[must_use]
    pub fn drawdown_from_peak_pct(&self) -> Option<Decimal> {
        let pnl_pct = self.pnl_pct()?;
        if self.peak_pnl_pct <= Decimal::ZERO {
            return None;
        }
        let retrace = self.peak_pnl_pct.checked_sub(pnl_pct)?;
        retrace
            .checked_mul(Decimal::ONE_HUNDRED)?
            .checked_div(self.peak_pnl_pct)
            .map(|d| d.max(Decimal::ZERO).round_dp(4))
    }

    /// Gate for the trailing-style rules.
    #[must_use]
    pub fn trailing_activated(&self) -> bool {
        self.pnl_pct()
            .is_some_and(|pct| pct >= self.risk().trailing_activation_pct)
    }

    #[must_use]
    pub fn seconds_since_entry(&self) -> Option<i64> {
        self.entered_at
            .map(|at| self.now.signed_duration_since(at).num_seconds())
    }

    /// Wall-clock time at the exchange.
    #[must_use]
    pub fn time_of_day(&self) -> NaiveTime {
        session::local_time(&self.config.session, self.now)
    }
}

/// Assembles [`RuleContext`]s from the live caches and raises peaks as a
/// side effect.
#[derive(Clone)]
pub struct ContextBuilder {
    ledger: Arc<PositionLedger>,
    pnl: Arc<PnlCache>,
    brackets: Arc<BracketFillRegistry>,
    underlying: Arc<UnderlyingTracker>,
}

impl ContextBuilder {
    #[must_use]
    pub fn new(
        ledger: Arc<PositionLedger>,
        pnl: Arc<PnlCache>,
        brackets: Arc<BracketFillRegistry>,
        underlying: Arc<UnderlyingTracker>,
    ) -> Self {
        Self {
            ledger,
            pnl,
            brackets,
            underlying,
        }
    }

    pub async fn build(
        &self,
        entry: &CacheEntry,
        config: Arc<AppConfig>,
        now: DateTime<Utc>,
    ) -> RuleContext {
        let staleness = config.monitor.pnl_staleness();
        let pnl = self.pnl.resolve(entry.position_id, now, staleness).await;

        let mut status = PositionStatus::Active;
        let mut peak_pnl_pct = entry.peak_pnl_pct;
        let mut peak_pnl_rupees = entry.peak_pnl_rupees;

        if let Some(snapshot) = &pnl {
            if snapshot.pnl_pct > peak_pnl_pct || snapshot.pnl_rupees > peak_pnl_rupees {
                match self
                    .ledger
                    .raise_peak(entry.position_id, snapshot.pnl_pct, snapshot.pnl_rupees)
                    .await
                {
                    Ok(position) => {
                        status = position.status;
                        peak_pnl_pct = position.peak_pnl_pct;
                        peak_pnl_rupees = position.peak_pnl_rupees;
                        debug!(
                            position_id = entry.position_id,
                            peak_pct = %peak_pnl_pct,
                            "Peak raised"
                        );
                    }
                    Err(e) => {
                        // Rules still see the higher peak this cycle.
                        warn!(position_id = entry.position_id, error = %e, "Failed to persist peak");
                        peak_pnl_pct = peak_pnl_pct.max(snapshot.pnl_pct);
                        peak_pnl_rupees = peak_pnl_rupees.max(snapshot.pnl_rupees);
                    }
                }
            }
        }

        let underlying = entry.underlying.as_ref().and_then(|key| {
            self.underlying
                .fresh(key, now, config.risk.underlying.max_age())
        });

        RuleContext {
            position_id: entry.position_id,
            instrument: entry.instrument.clone(),
            side: entry.side,
            right: entry.right,
            status,
            entry_price: entry.entry_price,
            quantity: entry.quantity,
            pnl,
            peak_pnl_pct,
            peak_pnl_rupees,
            entered_at: entry.entered_at,
            now,
            bracket_fill: self.brackets.get(entry.position_id),
            underlying,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::{at_pct, context, morning, with_peak};
    use rust_decimal_macros::dec;

    #[test]
    fn drawdown_is_share_of_peak() {
        let ctx = with_peak(context(AppConfig::default(), morning()), dec!(15));
        let ctx = at_pct(ctx, dec!(11.5));
        assert_eq!(ctx.peak_pnl_pct, dec!(15));
        assert_eq!(ctx.drawdown_from_peak_pct(), Some(dec!(23.3333)));
    }

    #[test]
    fn drawdown_undefined_without_profit_peak() {
        let ctx = at_pct(context(AppConfig::default(), morning()), dec!(-5));
        assert_eq!(ctx.drawdown_from_peak_pct(), None);
        let ctx = with_peak(context(AppConfig::default(), morning()), dec!(12));
        assert_eq!(ctx.drawdown_from_peak_pct(), None);
    }

    #[test]
    fn trailing_gate_is_inclusive() {
        let base = context(AppConfig::default(), morning());
        assert!(!at_pct(base.clone(), dec!(9.9)).trailing_activated());
        assert!(at_pct(base.clone(), dec!(10.0)).trailing_activated());
        assert!(!base.trailing_activated());
    }

    #[test]
    fn clock_reads_exchange_time() {
        let ctx = context(AppConfig::default(), morning());
        assert_eq!(ctx.time_of_day().to_string(), "10:30:00");
        assert_eq!(ctx.seconds_since_entry(), Some(1200));
    }
}

use chrono::{NaiveTime, TimeDelta};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub risk: RiskConfig,
    pub session: SessionConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL url. `None` keeps positions in memory (paper sessions, tests).
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Exit-rule thresholds. Percentages are return on premium.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Stop loss (e.g., 30.0 = exit at -30%).
    pub sl_pct: Decimal,
    /// Take profit (e.g., 60.0 = exit at +60%).
    pub tp_pct: Decimal,
    /// Minimum pnl % before trailing-style rules are eligible.
    pub trailing_activation_pct: Decimal,
    /// Trailing stop distance below the peak, as % of peak pnl.
    pub drawdown_pct: Decimal,
    /// Peak rupee profit that arms the secure-profit rule.
    pub secure_profit_threshold_rupees: Decimal,
    /// Drawdown from peak (% of peak) that fires the secure-profit rule.
    pub secure_profit_drawdown_pct: Decimal,
    /// Wall-clock cutoff (session timezone) for the time-based exit.
    pub time_exit_cutoff: NaiveTime,
    /// Time-based exit only closes positions with pnl above this floor.
    pub time_exit_min_profit_rupees: Decimal,
    /// Drawdown from peak (% of peak) that fires the peak-drawdown rule.
    pub peak_drawdown_exit_pct: Decimal,
    pub underlying: UnderlyingThresholds,
    pub rules: RuleToggles,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            sl_pct: Decimal::from(30),
            tp_pct: Decimal::from(60),
            trailing_activation_pct: Decimal::from(10),
            drawdown_pct: Decimal::from(3),
            secure_profit_threshold_rupees: Decimal::from(1000),
            secure_profit_drawdown_pct: Decimal::from(3),
            time_exit_cutoff: hm(15, 0),
            time_exit_min_profit_rupees: Decimal::ZERO,
            peak_drawdown_exit_pct: Decimal::from(5),
            underlying: UnderlyingThresholds::default(),
            rules: RuleToggles::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnderlyingThresholds {
    /// Trend score against the position at or beyond which the trend has collapsed.
    pub trend_reversal_score: Decimal,
    /// ATR ratio at or below which volatility has collapsed.
    pub atr_collapse_ratio: Decimal,
    /// Underlying readings older than this are ignored.
    pub max_age_secs: u64,
}

impl Default for UnderlyingThresholds {
    fn default() -> Self {
        Self {
            trend_reversal_score: Decimal::new(6, 1),
            atr_collapse_ratio: Decimal::new(5, 1),
            max_age_secs: 60,
        }
    }
}

impl UnderlyingThresholds {
    #[must_use]
    pub fn max_age(&self) -> TimeDelta {
        seconds(self.max_age_secs)
    }
}

/// Per-rule enable switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleToggles {
    pub session_end: bool,
    pub stop_loss: bool,
    pub bracket_limit: bool,
    pub take_profit: bool,
    pub secure_profit: bool,
    pub time_based_exit: bool,
    pub peak_drawdown: bool,
    pub trailing_stop: bool,
    pub underlying_exit: bool,
}

impl Default for RuleToggles {
    fn default() -> Self {
        Self {
            session_end: true,
            stop_loss: true,
            bracket_limit: true,
            take_profit: true,
            secure_profit: true,
            time_based_exit: true,
            peak_drawdown: true,
            trailing_stop: true,
            underlying_exit: true,
        }
    }
}

/// Trading session, expressed in the exchange timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timezone: Tz,
    pub market_open: NaiveTime,
    pub market_close: NaiveTime,
    /// Positions still open at this time are force-closed.
    pub exit_cutoff: NaiveTime,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Asia::Kolkata,
            market_open: hm(9, 15),
            market_close: hm(15, 30),
            exit_cutoff: hm(15, 15),
        }
    }
}

/// Loop cadences and cache tolerances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    /// Sleep between sweeps while the session is closed.
    pub idle_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    /// PnL older than this is treated as absent.
    pub pnl_staleness_secs: u64,
    /// Allowed Tier-1/Tier-2 pnl divergence, in percentage points.
    pub pnl_tolerance_pct: Decimal,
    /// Minimum spacing of throttled Tier-2 writes per position.
    pub tier2_write_interval_secs: u64,
    /// Bound on a single exit submission.
    pub exit_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            idle_interval_secs: 30,
            reconcile_interval_secs: 5,
            pnl_staleness_secs: 15,
            pnl_tolerance_pct: Decimal::new(5, 1),
            tier2_write_interval_secs: 10,
            exit_timeout_ms: 5000,
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub fn pnl_staleness(&self) -> TimeDelta {
        seconds(self.pnl_staleness_secs)
    }

    #[must_use]
    pub fn tier2_write_interval(&self) -> TimeDelta {
        seconds(self.tier2_write_interval_secs)
    }

    #[must_use]
    pub fn exit_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.exit_timeout_ms)
    }
}

/// Longest cadence or age the engine accepts: one day.
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Saturates at `TimeDelta::MAX` instead of panicking on out-of-range input.
fn seconds(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl AppConfig {
    /// Rejects configurations the engine cannot run safely with.
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let risk = &self.risk;
        let positive = [
            ("risk.sl_pct", risk.sl_pct),
            ("risk.tp_pct", risk.tp_pct),
            ("risk.trailing_activation_pct", risk.trailing_activation_pct),
            ("risk.drawdown_pct", risk.drawdown_pct),
            ("risk.secure_profit_drawdown_pct", risk.secure_profit_drawdown_pct),
            ("risk.peak_drawdown_exit_pct", risk.peak_drawdown_exit_pct),
            ("monitor.pnl_tolerance_pct", self.monitor.pnl_tolerance_pct),
        ];
        for (field, value) in positive {
            if value <= Decimal::ZERO {
                return Err(invalid(field, format!("must be positive, got {value}")));
            }
        }
        if risk.drawdown_pct >= Decimal::ONE_HUNDRED {
            return Err(invalid("risk.drawdown_pct", "must be below 100"));
        }

        let monitor = &self.monitor;
        if monitor.poll_interval_ms == 0 {
            return Err(invalid("monitor.poll_interval_ms", "must be positive"));
        }
        if monitor.exit_timeout_ms == 0 {
            return Err(invalid("monitor.exit_timeout_ms", "must be positive"));
        }
        if monitor.reconcile_interval_secs == 0
            || monitor.reconcile_interval_secs >= monitor.pnl_staleness_secs
        {
            return Err(invalid(
                "monitor.reconcile_interval_secs",
                format!(
                    "must be positive and shorter than pnl_staleness_secs ({})",
                    monitor.pnl_staleness_secs
                ),
            ));
        }

        let bounded = [
            ("monitor.poll_interval_ms", monitor.poll_interval_ms / 1000),
            ("monitor.exit_timeout_ms", monitor.exit_timeout_ms / 1000),
            ("monitor.idle_interval_secs", monitor.idle_interval_secs),
            ("monitor.reconcile_interval_secs", monitor.reconcile_interval_secs),
            ("monitor.pnl_staleness_secs", monitor.pnl_staleness_secs),
            ("monitor.tier2_write_interval_secs", monitor.tier2_write_interval_secs),
            ("risk.underlying.max_age_secs", risk.underlying.max_age_secs),
        ];
        for (field, secs) in bounded {
            if secs > MAX_INTERVAL_SECS {
                return Err(invalid(
                    field,
                    format!("must not exceed {MAX_INTERVAL_SECS} seconds"),
                ));
            }
        }

        let session = &self.session;
        if session.market_open >= session.market_close {
            return Err(invalid("session.market_open", "must precede market_close"));
        }
        if session.exit_cutoff <= session.market_open || session.exit_cutoff > session.market_close
        {
            return Err(invalid("session.exit_cutoff", "must fall inside the session"));
        }
        Ok(())
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(AppConfig::default().validate(), Ok(()));
    }

    #[test]
    fn reconcile_must_outpace_staleness() {
        let mut config = AppConfig::default();
        config.monitor.reconcile_interval_secs = config.monitor.pnl_staleness_secs;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "monitor.reconcile_interval_secs",
                ..
            })
        ));
    }

    #[test]
    fn zero_tolerance_rejected() {
        let mut config = AppConfig::default();
        config.monitor.pnl_tolerance_pct = Decimal::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_staleness_rejected() {
        let mut config = AppConfig::default();
        config.monitor.pnl_staleness_secs = 10_000_000_000_000_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "monitor.pnl_staleness_secs",
                ..
            })
        ));

        let mut config = AppConfig::default();
        config.risk.underlying.max_age_secs = MAX_INTERVAL_SECS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn durations_saturate_instead_of_panicking() {
        let mut config = AppConfig::default();
        config.monitor.pnl_staleness_secs = 10_000_000_000_000_000;
        config.risk.underlying.max_age_secs = u64::MAX;
        assert_eq!(config.monitor.pnl_staleness(), TimeDelta::MAX);
        assert_eq!(config.risk.underlying.max_age(), TimeDelta::MAX);
        assert_eq!(
            AppConfig::default().monitor.pnl_staleness(),
            TimeDelta::seconds(15)
        );
    }

    #[test]
    fn cutoff_outside_session_rejected() {
        let mut config = AppConfig::default();
        config.session.exit_cutoff = hm(16, 0);
        assert!(config.validate().is_err());
    }
}

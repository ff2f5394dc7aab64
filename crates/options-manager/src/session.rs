//! Trading-session clock in the exchange timezone.

use algo_trade_core::SessionConfig;
use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};

/// Wall-clock time at the exchange.
#[must_use]
pub fn local_time(session: &SessionConfig, now: DateTime<Utc>) -> NaiveTime {
    now.with_timezone(&session.timezone).time()
}

/// Weekday between market open (inclusive) and close (exclusive).
#[must_use]
pub fn is_open(session: &SessionConfig, now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&session.timezone);
    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let time = local.time();
    time >= session.market_open && time < session.market_close
}

#[must_use]
pub fn past_exit_cutoff(session: &SessionConfig, now: DateTime<Utc>) -> bool {
    local_time(session, now) >= session.exit_cutoff
}

//! Position entity and its lifecycle state machine.
//!
//! Status only advances `pending -> active -> {exited, cancelled}`. Every
//! mutator validates the transition before touching any field, so a rejected
//! call leaves the position exactly as it was.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pnl::{PnlSnapshot, PnlSource};

/// Instrument identity as the broker addresses it: exchange segment plus
/// security id (e.g. `NSE_FNO:43251`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub segment: String,
    pub security_id: String,
}

impl InstrumentKey {
    pub fn new(segment: impl Into<String>, security_id: impl Into<String>) -> Self {
        Self {
            segment: segment.into(),
            security_id: security_id.into(),
        }
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.security_id)
    }
}

impl FromStr for InstrumentKey {
    type Err = PositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((segment, security_id)) if !segment.is_empty() && !security_id.is_empty() => {
                Ok(Self::new(segment, security_id))
            }
            _ => Err(PositionError::InvalidEntry(format!(
                "instrument key must be SEGMENT:SECURITY_ID, got {s:?}"
            ))),
        }
    }
}

/// Direction of the premium exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Bought premium: profits when the option price rises.
    Long,
    /// Sold premium: profits when the option price falls.
    Short,
}

impl Side {
    /// +1 for long, -1 for short.
    #[must_use]
    pub fn sign(self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }
}

impl FromStr for Side {
    type Err = PositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(Self::Long),
            "short" => Ok(Self::Short),
            other => Err(PositionError::InvalidEntry(format!("unknown side {other:?}"))),
        }
    }
}

/// Options contract right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionRight {
    Call,
    Put,
}

impl OptionRight {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Put => "put",
        }
    }
}

impl fmt::Display for OptionRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call => write!(f, "CE"),
            Self::Put => write!(f, "PE"),
        }
    }
}

impl FromStr for OptionRight {
    type Err = PositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" => Ok(Self::Call),
            "put" => Ok(Self::Put),
            other => Err(PositionError::InvalidEntry(format!(
                "unknown option right {other:?}"
            ))),
        }
    }
}

/// Lifecycle status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Pending,
    Active,
    Exited,
    Cancelled,
}

impl PositionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Exited => "exited",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Cancelled)
    }

    /// The full transition table. Anything not listed here is illegal.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active)
                | (Self::Active, Self::Exited)
                | (Self::Active, Self::Cancelled)
                | (Self::Pending, Self::Cancelled)
        )
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionStatus {
    type Err = PositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "exited" => Ok(Self::Exited),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(PositionError::InvalidEntry(format!("unknown status {other:?}"))),
        }
    }
}

/// Errors raised by position mutators.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PositionError {
    /// The requested status change is not in the transition table.
    #[error("position {position_id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        position_id: i64,
        from: PositionStatus,
        to: PositionStatus,
    },

    /// Entry or fill data that can never describe a real position.
    #[error("invalid position data: {0}")]
    InvalidEntry(String),
}

/// Data needed to open a tracked position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPosition {
    pub instrument: InstrumentKey,
    #[serde(default)]
    pub underlying: Option<InstrumentKey>,
    #[serde(default)]
    pub right: Option<OptionRight>,
    pub side: Side,
    pub entry_price: Decimal,
    pub quantity: i64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub paper: bool,
}

impl NewPosition {
    /// Long position without underlying or metadata; handy for tests and tools.
    #[must_use]
    pub fn long(instrument: InstrumentKey, entry_price: Decimal, quantity: i64) -> Self {
        Self {
            instrument,
            underlying: None,
            right: None,
            side: Side::Long,
            entry_price,
            quantity,
            metadata: serde_json::Value::Null,
            paper: false,
        }
    }

    /// Rejects entries that would make every PnL computation meaningless.
    pub fn validate(&self) -> Result<(), PositionError> {
        if self.entry_price <= Decimal::ZERO {
            return Err(PositionError::InvalidEntry(format!(
                "entry price must be positive, got {}",
                self.entry_price
            )));
        }
        if self.quantity <= 0 {
            return Err(PositionError::InvalidEntry(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        Ok(())
    }
}

/// Terminal exit data of a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub position_id: i64,
    pub exit_price: Decimal,
    pub exit_reason: String,
    pub exited_at: DateTime<Utc>,
}

/// Result of `mark_exited`.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitTransition {
    /// This call performed the transition.
    Exited(ExitRecord),
    /// The position was already exited; carries the original exit data.
    AlreadyExited(ExitRecord),
}

impl ExitTransition {
    #[must_use]
    pub fn record(&self) -> &ExitRecord {
        match self {
            Self::Exited(r) | Self::AlreadyExited(r) => r,
        }
    }

    #[must_use]
    pub const fn is_new(&self) -> bool {
        matches!(self, Self::Exited(_))
    }
}

/// The unit of tracking. Never deleted, only marked terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub instrument: InstrumentKey,
    pub underlying: Option<InstrumentKey>,
    pub right: Option<OptionRight>,
    pub side: Side,
    pub entry_price: Decimal,
    pub quantity: i64,
    pub status: PositionStatus,
    pub created_at: DateTime<Utc>,
    pub entered_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub exit_reason: Option<String>,
    /// High-water mark of pnl %, monotonic while active.
    pub peak_pnl_pct: Decimal,
    /// High-water mark of pnl in rupees, monotonic while active.
    pub peak_pnl_rupees: Decimal,
    /// Tier-2 (authoritative, throttled) pnl.
    pub last_pnl: Option<PnlSnapshot>,
    pub metadata: serde_json::Value,
    pub paper: bool,
}

impl Position {
    /// Creates a pending position with a zeroed high-water mark.
    pub fn pending(id: i64, new: NewPosition, now: DateTime<Utc>) -> Result<Self, PositionError> {
        new.validate()?;
        Ok(Self {
            id,
            instrument: new.instrument,
            underlying: new.underlying,
            right: new.right,
            side: new.side,
            entry_price: new.entry_price,
            quantity: new.quantity,
            status: PositionStatus::Pending,
            created_at: now,
            entered_at: None,
            exited_at: None,
            exit_price: None,
            exit_reason: None,
            peak_pnl_pct: Decimal::ZERO,
            peak_pnl_rupees: Decimal::ZERO,
            last_pnl: None,
            metadata: new.metadata,
            paper: new.paper,
        })
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == PositionStatus::Active
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn check_transition(&self, to: PositionStatus) -> Result<(), PositionError> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(PositionError::IllegalTransition {
                position_id: self.id,
                from: self.status,
                to,
            })
        }
    }

    /// `pending -> active`. A confirmed fill price replaces the planned entry.
    pub fn activate(
        &mut self,
        fill_price: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> Result<(), PositionError> {
        self.check_transition(PositionStatus::Active)?;
        if let Some(price) = fill_price {
            if price <= Decimal::ZERO {
                return Err(PositionError::InvalidEntry(format!(
                    "entry fill price must be positive, got {price}"
                )));
            }
            self.entry_price = price;
        }
        self.status = PositionStatus::Active;
        self.entered_at = Some(at);
        Ok(())
    }

    /// `active -> exited`, idempotent.
    ///
    /// A second call on an exited position is a no-op that hands back the
    /// original exit data, whatever price and reason it was called with.
    pub fn mark_exited(
        &mut self,
        exit_price: Decimal,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<ExitTransition, PositionError> {
        if self.status == PositionStatus::Exited {
            if let Some(record) = self.exit_record() {
                return Ok(ExitTransition::AlreadyExited(record));
            }
        }
        self.check_transition(PositionStatus::Exited)?;
        if exit_price < Decimal::ZERO {
            return Err(PositionError::InvalidEntry(format!(
                "exit price must not be negative, got {exit_price}"
            )));
        }

        self.status = PositionStatus::Exited;
        self.exit_price = Some(exit_price);
        self.exit_reason = Some(reason.to_string());
        self.exited_at = Some(at);

        Ok(ExitTransition::Exited(ExitRecord {
            position_id: self.id,
            exit_price,
            exit_reason: reason.to_string(),
            exited_at: at,
        }))
    }

    /// `pending|active -> cancelled`. The reason lands in metadata since
    /// exit fields are reserved for exited positions.
    pub fn cancel(&mut self, reason: &str, at: DateTime<Utc>) -> Result<(), PositionError> {
        self.check_transition(PositionStatus::Cancelled)?;
        self.status = PositionStatus::Cancelled;

        let note = serde_json::json!({ "reason": reason, "at": at.to_rfc3339() });
        match &mut self.metadata {
            serde_json::Value::Object(map) => {
                map.insert("cancellation".to_string(), note);
            }
            other => {
                let previous = std::mem::take(other);
                let mut map = serde_json::Map::new();
                if !previous.is_null() {
                    map.insert("entry".to_string(), previous);
                }
                map.insert("cancellation".to_string(), note);
                *other = serde_json::Value::Object(map);
            }
        }
        Ok(())
    }

    /// Raises the high-water marks. Never lowers them, and does nothing once
    /// the position has left the active window.
    ///
    /// Returns `true` when either mark moved.
    pub fn raise_peak(&mut self, pnl_pct: Decimal, pnl_rupees: Decimal) -> bool {
        if !self.is_active() {
            return false;
        }
        let mut raised = false;
        if pnl_pct > self.peak_pnl_pct {
            self.peak_pnl_pct = pnl_pct;
            raised = true;
        }
        if pnl_rupees > self.peak_pnl_rupees {
            self.peak_pnl_rupees = pnl_rupees;
            raised = true;
        }
        raised
    }

    /// PnL of this position if it were marked at `price`.
    #[must_use]
    pub fn pnl_at(&self, price: Decimal, at: DateTime<Utc>, source: PnlSource) -> Option<PnlSnapshot> {
        PnlSnapshot::compute(
            self.id,
            self.side,
            self.entry_price,
            self.quantity,
            price,
            at,
            source,
        )
    }

    #[must_use]
    pub fn exit_record(&self) -> Option<ExitRecord> {
        match (self.status, self.exit_price, self.exited_at) {
            (PositionStatus::Exited, Some(exit_price), Some(exited_at)) => Some(ExitRecord {
                position_id: self.id,
                exit_price,
                exit_reason: self.exit_reason.clone().unwrap_or_default(),
                exited_at,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn make_position(status: PositionStatus) -> Position {
        let now = Utc::now();
        let mut pos = Position::pending(
            7,
            NewPosition::long(InstrumentKey::new("NSE_FNO", "43251"), dec!(100), 75),
            now,
        )
        .unwrap();
        match status {
            PositionStatus::Pending => {}
            PositionStatus::Active => pos.activate(None, now).unwrap(),
            PositionStatus::Exited => {
                pos.activate(None, now).unwrap();
                pos.mark_exited(dec!(110), "TP HIT", now).unwrap();
            }
            PositionStatus::Cancelled => pos.cancel("entry rejected", now).unwrap(),
        }
        pos
    }

    #[test]
    fn transition_table_is_exhaustive() {
        use PositionStatus::*;
        let all = [Pending, Active, Exited, Cancelled];
        let allowed = [
            (Pending, Active),
            (Active, Exited),
            (Active, Cancelled),
            (Pending, Cancelled),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn pending_activates_with_fill_price() {
        let mut pos = make_position(PositionStatus::Pending);
        let at = Utc::now();
        pos.activate(Some(dec!(102.5)), at).unwrap();
        assert_eq!(pos.status, PositionStatus::Active);
        assert_eq!(pos.entry_price, dec!(102.5));
        assert_eq!(pos.entered_at, Some(at));
    }

    #[test]
    fn illegal_transition_leaves_fields_untouched() {
        let mut pos = make_position(PositionStatus::Pending);
        let before = pos.clone();
        let err = pos.mark_exited(dec!(90), "SL HIT", Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            PositionError::IllegalTransition {
                from: PositionStatus::Pending,
                to: PositionStatus::Exited,
                ..
            }
        ));
        assert_eq!(pos, before);
    }

    #[test]
    fn terminal_states_reject_everything_else() {
        let mut exited = make_position(PositionStatus::Exited);
        assert!(exited.activate(None, Utc::now()).is_err());
        assert!(exited.cancel("late", Utc::now()).is_err());

        let mut cancelled = make_position(PositionStatus::Cancelled);
        assert!(cancelled.activate(None, Utc::now()).is_err());
        assert!(cancelled.mark_exited(dec!(1), "x", Utc::now()).is_err());
        assert!(cancelled.cancel("again", Utc::now()).is_err());
    }

    #[test]
    fn mark_exited_twice_is_a_noop_returning_first_result() {
        let mut pos = make_position(PositionStatus::Active);
        let first_at = Utc::now();
        let first = pos.mark_exited(dec!(97.5), "SL HIT", first_at).unwrap();
        assert!(first.is_new());

        let second = pos
            .mark_exited(dec!(120), "TP HIT", first_at + Duration::seconds(3))
            .unwrap();
        assert!(!second.is_new());
        assert_eq!(second.record(), first.record());
        assert_eq!(pos.exit_price, Some(dec!(97.5)));
        assert_eq!(pos.exit_reason.as_deref(), Some("SL HIT"));
    }

    #[test]
    fn exit_fields_set_iff_exited() {
        let active = make_position(PositionStatus::Active);
        assert!(active.exit_price.is_none() && active.exited_at.is_none());

        let cancelled = make_position(PositionStatus::Cancelled);
        assert!(cancelled.exit_price.is_none() && cancelled.exited_at.is_none());
        assert_eq!(cancelled.metadata["cancellation"]["reason"], "entry rejected");

        let exited = make_position(PositionStatus::Exited);
        assert!(exited.exit_price.is_some() && exited.exited_at.is_some());
    }

    #[test]
    fn peak_is_monotonic_and_frozen_when_terminal() {
        let mut pos = make_position(PositionStatus::Active);
        assert!(pos.raise_peak(dec!(5), dec!(375)));
        assert!(!pos.raise_peak(dec!(3), dec!(225)));
        assert_eq!(pos.peak_pnl_pct, dec!(5));

        pos.mark_exited(dec!(104), "TP HIT", Utc::now()).unwrap();
        assert!(!pos.raise_peak(dec!(50), dec!(5000)));
        assert_eq!(pos.peak_pnl_pct, dec!(5));
    }

    #[test]
    fn rejects_non_positive_entry() {
        let new = NewPosition::long(InstrumentKey::new("NSE_FNO", "1"), dec!(0), 75);
        assert!(Position::pending(1, new, Utc::now()).is_err());
    }

    #[test]
    fn instrument_key_round_trips_through_display() {
        let key: InstrumentKey = "NSE_FNO:43251".parse().unwrap();
        assert_eq!(key.to_string(), "NSE_FNO:43251");
        assert!("garbage".parse::<InstrumentKey>().is_err());
    }
}

//! Types shared by the exit rules, the engine and the exit path.

use std::fmt;

use algo_trade_core::{ExitRecord, PositionStatus};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Every exit rule the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    SessionEnd,
    StopLoss,
    BracketLimit,
    TakeProfit,
    SecureProfit,
    TimeBasedExit,
    PeakDrawdown,
    TrailingStop,
    UnderlyingExit,
}

impl RuleKind {
    pub const ALL: [RuleKind; 9] = [
        RuleKind::SessionEnd,
        RuleKind::StopLoss,
        RuleKind::BracketLimit,
        RuleKind::TakeProfit,
        RuleKind::SecureProfit,
        RuleKind::TimeBasedExit,
        RuleKind::PeakDrawdown,
        RuleKind::TrailingStop,
        RuleKind::UnderlyingExit,
    ];

    /// Evaluation order; lower runs first.
    #[must_use]
    pub const fn priority(self) -> u16 {
        match self {
            RuleKind::SessionEnd => 10,
            RuleKind::StopLoss => 20,
            RuleKind::BracketLimit => 25,
            RuleKind::TakeProfit => 30,
            RuleKind::SecureProfit => 35,
            RuleKind::TimeBasedExit => 40,
            RuleKind::PeakDrawdown => 45,
            RuleKind::TrailingStop => 50,
            RuleKind::UnderlyingExit => 60,
        }
    }

    /// Dense index, for per-rule counter arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            RuleKind::SessionEnd => 0,
            RuleKind::StopLoss => 1,
            RuleKind::BracketLimit => 2,
            RuleKind::TakeProfit => 3,
            RuleKind::SecureProfit => 4,
            RuleKind::TimeBasedExit => 5,
            RuleKind::PeakDrawdown => 6,
            RuleKind::TrailingStop => 7,
            RuleKind::UnderlyingExit => 8,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RuleKind::SessionEnd => "session_end",
            RuleKind::StopLoss => "stop_loss",
            RuleKind::BracketLimit => "bracket_limit",
            RuleKind::TakeProfit => "take_profit",
            RuleKind::SecureProfit => "secure_profit",
            RuleKind::TimeBasedExit => "time_based_exit",
            RuleKind::PeakDrawdown => "peak_drawdown",
            RuleKind::TrailingStop => "trailing_stop",
            RuleKind::UnderlyingExit => "underlying_exit",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule's decision to close a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub rule: RuleKind,
    pub reason: String,
    /// Price the position is already closed at outside the engine (bracket fills).
    pub fill_price: Option<Decimal>,
    pub metadata: serde_json::Value,
}

impl ExitSignal {
    #[must_use]
    pub fn new(rule: RuleKind, reason: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            rule,
            reason: reason.into(),
            fill_price: None,
            metadata,
        }
    }

    #[must_use]
    pub fn with_fill_price(mut self, price: Decimal) -> Self {
        self.fill_price = Some(price);
        self
    }
}

/// Outcome of one rule against one position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuleResult {
    Exit(ExitSignal),
    NoAction,
    /// The rule could not judge (missing inputs); later rules still run.
    Skip { reason: String },
}

impl RuleResult {
    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        RuleResult::Skip {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_exit(&self) -> bool {
        matches!(self, RuleResult::Exit(_))
    }

    #[must_use]
    pub fn exit_signal(&self) -> Option<&ExitSignal> {
        match self {
            RuleResult::Exit(signal) => Some(signal),
            _ => None,
        }
    }
}

/// Bracket (exchange-side limit) fill observed on the order stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketFill {
    pub order_id: String,
    pub price: Decimal,
    pub filled_at: DateTime<Utc>,
}

/// Latest reading for an underlying instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnderlyingState {
    /// Signed trend strength, -1..=1 (positive = up).
    pub trend_score: Decimal,
    /// Current ATR over its trailing average.
    pub atr_ratio: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// Request to close one position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRequest {
    pub position_id: i64,
    pub rule: Option<RuleKind>,
    pub reason: String,
    /// Already filled elsewhere at this price; finalize without submitting.
    pub external_fill: Option<Decimal>,
}

impl ExitRequest {
    #[must_use]
    pub fn from_signal(position_id: i64, signal: &ExitSignal) -> Self {
        Self {
            position_id,
            rule: Some(signal.rule),
            reason: signal.reason.clone(),
            external_fill: signal.fill_price,
        }
    }

    #[must_use]
    pub fn manual(position_id: i64, reason: impl Into<String>) -> Self {
        Self {
            position_id,
            rule: None,
            reason: reason.into(),
            external_fill: None,
        }
    }
}

/// What an exit request achieved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExitOutcome {
    /// This request performed the transition.
    Exited(ExitRecord),
    /// Someone else got there first; nothing was submitted.
    AlreadyTerminal {
        status: PositionStatus,
        record: Option<ExitRecord>,
    },
    /// Submission failed or timed out; the position stays active.
    Deferred { reason: String },
}

impl ExitOutcome {
    #[must_use]
    pub fn is_exited(&self) -> bool {
        matches!(self, ExitOutcome::Exited(_))
    }
}

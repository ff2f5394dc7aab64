//! Exit rules.
//!
//! The rule set is closed: each rule is a variant of [`Rule`], and every
//! variant implements [`ExitRule`]. Rules are pure functions of a
//! [`RuleContext`]; a rule that lacks an input it needs returns
//! [`RuleResult::Skip`] instead of guessing.

pub mod stops;
pub mod targets;
pub mod trailing;
pub mod underlying;

use algo_trade_core::RiskConfig;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::context::RuleContext;
use crate::types::{RuleKind, RuleResult};

pub use stops::{SessionEndRule, StopLossRule, TimeBasedExitRule};
pub use targets::{BracketLimitRule, SecureProfitRule, TakeProfitRule};
pub use trailing::{PeakDrawdownRule, TrailingStopRule};
pub use underlying::UnderlyingExitRule;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("{rule}: threshold {field} is unusable ({value})")]
    BadThreshold {
        rule: RuleKind,
        field: &'static str,
        value: String,
    },
    #[error("{rule}: arithmetic overflow")]
    Overflow { rule: RuleKind },
}

/// One exit rule.
pub trait ExitRule {
    fn kind(&self) -> RuleKind;

    fn priority(&self) -> u16 {
        self.kind().priority()
    }

    fn enabled(&self, config: &RiskConfig) -> bool;

    /// # Errors
    ///
    /// Returns an error when the rule cannot run with the given inputs
    /// (e.g. a non-positive threshold). The engine isolates it.
    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleResult, RuleError>;
}

/// Every exit rule, dispatched by variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    SessionEnd(SessionEndRule),
    StopLoss(StopLossRule),
    BracketLimit(BracketLimitRule),
    TakeProfit(TakeProfitRule),
    SecureProfit(SecureProfitRule),
    TimeBasedExit(TimeBasedExitRule),
    PeakDrawdown(PeakDrawdownRule),
    TrailingStop(TrailingStopRule),
    UnderlyingExit(UnderlyingExitRule),
}

impl Rule {
    #[must_use]
    pub fn of(kind: RuleKind) -> Self {
        match kind {
            RuleKind::SessionEnd => Rule::SessionEnd(SessionEndRule),
            RuleKind::StopLoss => Rule::StopLoss(StopLossRule),
            RuleKind::BracketLimit => Rule::BracketLimit(BracketLimitRule),
            RuleKind::TakeProfit => Rule::TakeProfit(TakeProfitRule),
            RuleKind::SecureProfit => Rule::SecureProfit(SecureProfitRule),
            RuleKind::TimeBasedExit => Rule::TimeBasedExit(TimeBasedExitRule),
            RuleKind::PeakDrawdown => Rule::PeakDrawdown(PeakDrawdownRule),
            RuleKind::TrailingStop => Rule::TrailingStop(TrailingStopRule),
            RuleKind::UnderlyingExit => Rule::UnderlyingExit(UnderlyingExitRule),
        }
    }

    /// The full rule set in ascending priority.
    #[must_use]
    pub fn all() -> Vec<Rule> {
        let mut rules: Vec<Rule> = RuleKind::ALL.iter().map(|k| Rule::of(*k)).collect();
        rules.sort_by_key(ExitRule::priority);
        rules
    }

    fn inner(&self) -> &dyn ExitRule {
        match self {
            Rule::SessionEnd(r) => r,
            Rule::StopLoss(r) => r,
            Rule::BracketLimit(r) => r,
            Rule::TakeProfit(r) => r,
            Rule::SecureProfit(r) => r,
            Rule::TimeBasedExit(r) => r,
            Rule::PeakDrawdown(r) => r,
            Rule::TrailingStop(r) => r,
            Rule::UnderlyingExit(r) => r,
        }
    }
}

impl ExitRule for Rule {
    fn kind(&self) -> RuleKind {
        self.inner().kind()
    }

    fn enabled(&self, config: &RiskConfig) -> bool {
        self.inner().enabled(config)
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleResult, RuleError> {
        self.inner().evaluate(ctx)
    }
}

/// Rejects thresholds that must be strictly positive.
pub(crate) fn require_positive(
    rule: RuleKind,
    field: &'static str,
    value: Decimal,
) -> Result<Decimal, RuleError> {
    if value > Decimal::ZERO {
        Ok(value)
    } else {
        Err(RuleError::BadThreshold {
            rule,
            field,
            value: value.to_string(),
        })
    }
}

pub(crate) const NO_PNL: &str = "pnl unavailable";

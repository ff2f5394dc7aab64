//! Exit risk engine for intraday options positions.
//!
//! Evaluates prioritized exit rules against live positions and closes each
//! position at most once, while tick ingestion, broker fills and periodic
//! reconciliation mutate the same state concurrently.
//!
//! # Components
//!
//! - [`rules`] / [`engine`]: the closed rule set and its priority evaluator
//! - [`context`]: per-cycle rule inputs, peak tracking, pnl staleness
//! - [`ledger`]: position lifecycle, per-position locking, typed events
//! - [`cache`]: active projections by instrument, two-tier pnl
//! - [`executor`]: exactly-once exit execution
//! - [`monitor`] / [`reconcile`]: the periodic loops
//! - [`service`]: wiring and actor startup

pub mod bracket;
pub mod cache;
pub mod context;
pub mod engine;
pub mod executor;
pub mod feed;
pub mod fills;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod monitor;
pub mod paper;
pub mod reconcile;
pub mod rules;
pub mod service;
pub mod session;
pub mod store;
pub mod types;
pub mod underlying;

pub use cache::{ActivePositionCache, CacheEntry, InMemoryTier1, PnlCache};
pub use context::{ContextBuilder, RuleContext};
pub use engine::RuleEngine;
pub use executor::{ExitEngine, ExitError};
pub use ledger::{LedgerError, PositionLedger, PositionObserver};
pub use monitor::{CycleReport, MonitorLoop};
pub use reconcile::{ReconcileReport, ReconciliationService};
pub use service::{Collaborators, Inputs, OptionsManager};
pub use types::{ExitOutcome, ExitRequest, ExitSignal, RuleKind, RuleResult};

//! Lock-free counters for the monitor, exit and reconciliation paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::types::RuleKind;

#[derive(Debug, Default)]
struct RuleSlot {
    hits: AtomicU64,
    skips: AtomicU64,
    faults: AtomicU64,
}

/// Per-rule hit, skip and fault counts.
#[derive(Debug, Default)]
pub struct RuleCounters {
    slots: [RuleSlot; 9],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleCount {
    pub rule: RuleKind,
    pub hits: u64,
    pub skips: u64,
    pub faults: u64,
}

impl RuleCounters {
    pub fn record_hit(&self, rule: RuleKind) {
        self.slots[rule.index()].hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self, rule: RuleKind) {
        self.slots[rule.index()].skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self, rule: RuleKind) {
        self.slots[rule.index()].faults.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn hits(&self, rule: RuleKind) -> u64 {
        self.slots[rule.index()].hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn faults(&self, rule: RuleKind) -> u64 {
        self.slots[rule.index()].faults.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<RuleCount> {
        RuleKind::ALL
            .iter()
            .map(|&rule| {
                let slot = &self.slots[rule.index()];
                RuleCount {
                    rule,
                    hits: slot.hits.load(Ordering::Relaxed),
                    skips: slot.skips.load(Ordering::Relaxed),
                    faults: slot.faults.load(Ordering::Relaxed),
                }
            })
            .collect()
    }
}

/// Exit-path outcomes.
#[derive(Debug, Default)]
pub struct ExitCounters {
    pub submitted: AtomicU64,
    pub exited: AtomicU64,
    pub external_fills: AtomicU64,
    pub deferred: AtomicU64,
    pub already_terminal: AtomicU64,
    pub unrecorded: AtomicU64,
}

/// Reconciliation repairs, cumulative across passes.
#[derive(Debug, Default)]
pub struct ReconcileCounters {
    pub passes: AtomicU64,
    pub subscriptions_restored: AtomicU64,
    pub projections_restored: AtomicU64,
    pub projections_removed: AtomicU64,
    pub pnl_repaired: AtomicU64,
    pub tier1_purged: AtomicU64,
    pub errors: AtomicU64,
}

/// Shared handles; each component keeps the one it writes.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub rules: Arc<RuleCounters>,
    pub exits: Arc<ExitCounters>,
    pub reconcile: Arc<ReconcileCounters>,
}

/// Point-in-time copy for logging or the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub rules: Vec<RuleCount>,
    pub exits_submitted: u64,
    pub exits_completed: u64,
    pub external_fills: u64,
    pub exits_deferred: u64,
    pub exits_already_terminal: u64,
    pub reconcile_passes: u64,
    pub reconcile_repairs: u64,
    pub reconcile_errors: u64,
}

impl EngineMetrics {
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let r = &self.reconcile;
        let repairs = [
            &r.subscriptions_restored,
            &r.projections_restored,
            &r.projections_removed,
            &r.pnl_repaired,
            &r.tier1_purged,
        ]
        .iter()
        .map(|c| c.load(Ordering::Relaxed))
        .sum();

        MetricsSnapshot {
            rules: self.rules.snapshot(),
            exits_submitted: self.exits.submitted.load(Ordering::Relaxed),
            exits_completed: self.exits.exited.load(Ordering::Relaxed),
            external_fills: self.exits.external_fills.load(Ordering::Relaxed),
            exits_deferred: self.exits.deferred.load(Ordering::Relaxed),
            exits_already_terminal: self.exits.already_terminal.load(Ordering::Relaxed),
            reconcile_passes: r.passes.load(Ordering::Relaxed),
            reconcile_repairs: repairs,
            reconcile_errors: r.errors.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

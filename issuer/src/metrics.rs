//! Counters for issuer operations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Issuer metrics.
#[derive(Debug, Default)]
pub struct IssuerMetrics {
    /// Successful money loads.
    pub loads_total: AtomicU64,
    /// Cardholder accounts created on first load.
    pub accounts_provisioned: AtomicU64,
    /// Approved authorisations.
    pub authorisations_approved: AtomicU64,
    /// Authorisations declined for insufficient funds.
    pub authorisations_declined: AtomicU64,
    /// Settled presentments.
    pub presentments_total: AtomicU64,
    /// Operations that returned an error.
    pub failures_total: AtomicU64,
}

impl IssuerMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_recorded(&self) {
        self.loads_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn account_provisioned(&self) {
        self.accounts_provisioned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn authorisation_approved(&self) {
        self.authorisations_approved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn authorisation_declined(&self) {
        self.authorisations_declined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn presentment_recorded(&self) {
        self.presentments_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failure(&self) {
        self.failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            loads_total: self.loads_total.load(Ordering::Relaxed),
            accounts_provisioned: self.accounts_provisioned.load(Ordering::Relaxed),
            authorisations_approved: self.authorisations_approved.load(Ordering::Relaxed),
            authorisations_declined: self.authorisations_declined.load(Ordering::Relaxed),
            presentments_total: self.presentments_total.load(Ordering::Relaxed),
            failures_total: self.failures_total.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub loads_total: u64,
    pub accounts_provisioned: u64,
    pub authorisations_approved: u64,
    pub authorisations_declined: u64,
    pub presentments_total: u64,
    pub failures_total: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<IssuerMetrics>;

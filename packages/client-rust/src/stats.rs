//! Per-proxy call statistics.
//!
//! Every counter is kept twice: as an in-process atomic readable through
//! [`ProxyStats::snapshot`], and as a `metrics` counter labelled with the
//! service name for whatever recorder the host installs.

use std::sync::atomic::{AtomicU64, Ordering};

use tailrpc_core::Status;

/// Point-in-time copy of a proxy's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStatsSnapshot {
    pub calls: u64,
    pub failures: u64,
    pub rejected: u64,
    pub backup_fired: u64,
    pub backup_discarded: u64,
    /// Race attempts that failed, winners excluded.
    pub attempts_failed: u64,
    /// Dispatches refused at the in-flight limit.
    pub shed: u64,
}

/// Counters owned by one `ServiceProxy`.
#[derive(Debug)]
pub struct ProxyStats {
    service: String,
    calls: AtomicU64,
    failures: AtomicU64,
    rejected: AtomicU64,
    backup_fired: AtomicU64,
    backup_discarded: AtomicU64,
    attempts_failed: AtomicU64,
    shed: AtomicU64,
}

impl ProxyStats {
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            backup_fired: AtomicU64::new(0),
            backup_discarded: AtomicU64::new(0),
            attempts_failed: AtomicU64::new(0),
            shed: AtomicU64::new(0),
        }
    }

    pub fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tailrpc_client_calls_total", "service" => self.service.clone())
            .increment(1);
    }

    /// Counts a finished call that did not succeed.
    pub fn record_failure(&self, status: &Status) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "tailrpc_client_failures_total",
            "service" => self.service.clone(),
            "code" => status.framework_code().to_string(),
        )
        .increment(1);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backup_fired(&self) {
        self.backup_fired.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tailrpc_client_backup_fired_total", "service" => self.service.clone())
            .increment(1);
    }

    /// Counts a losing backup-race response that arrived and was dropped.
    pub fn record_backup_discarded(&self) {
        self.backup_discarded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "tailrpc_client_backup_discarded_total",
            "service" => self.service.clone()
        )
        .increment(1);
    }

    /// Counts a backup-race attempt that ended in failure, whether it was
    /// seen during the race or after a winner was chosen.
    pub fn record_attempt_failed(&self) {
        self.attempts_failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "tailrpc_client_backup_attempt_failures_total",
            "service" => self.service.clone()
        )
        .increment(1);
    }

    pub fn record_shed(&self) {
        self.shed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tailrpc_client_shed_total", "service" => self.service.clone())
            .increment(1);
    }

    #[must_use]
    pub fn snapshot(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            backup_fired: self.backup_fired.load(Ordering::Relaxed),
            backup_discarded: self.backup_discarded.load(Ordering::Relaxed),
            attempts_failed: self.attempts_failed.load(Ordering::Relaxed),
            shed: self.shed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use tailrpc_core::ErrorKind;

    use super::*;

    #[test]
    fn counters_show_up_in_snapshot() {
        let stats = ProxyStats::new("ledger");
        stats.record_call();
        stats.record_call();
        stats.record_failure(&Status::from_kind(ErrorKind::Timeout, "slow"));
        stats.record_backup_fired();
        stats.record_backup_discarded();
        stats.record_attempt_failed();
        stats.record_shed();

        assert_eq!(
            stats.snapshot(),
            ProxyStatsSnapshot {
                calls: 2,
                failures: 1,
                rejected: 0,
                backup_fired: 1,
                backup_discarded: 1,
                attempts_failed: 1,
                shed: 1,
            }
        );
    }
}

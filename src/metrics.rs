use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    pub envelopes_submitted: AtomicU64,
    pub attempts_sent: AtomicU64,
    pub envelopes_completed: AtomicU64,
    pub retries: AtomicU64,
    pub requeues: AtomicU64,
    pub rejections: AtomicU64,
    pub unreachable: AtomicU64,
    pub superseded: AtomicU64,
    pub cancelled: AtomicU64,

    // Echo protocol
    pub echo_probes: AtomicU64,
    pub echo_failures: AtomicU64,
    pub drains: AtomicU64,
}

impl DispatcherMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            envelopes_submitted: self.envelopes_submitted.load(Ordering::Relaxed),
            attempts_sent: self.attempts_sent.load(Ordering::Relaxed),
            envelopes_completed: self.envelopes_completed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            requeues: self.requeues.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            unreachable: self.unreachable.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            echo_probes: self.echo_probes.load(Ordering::Relaxed),
            echo_failures: self.echo_failures.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub envelopes_submitted: u64,
    pub attempts_sent: u64,
    pub envelopes_completed: u64,
    pub retries: u64,
    pub requeues: u64,
    pub rejections: u64,
    pub unreachable: u64,
    pub superseded: u64,
    pub cancelled: u64,
    pub echo_probes: u64,
    pub echo_failures: u64,
    pub drains: u64,
}

impl MetricsSnapshot {
    /// Envelopes that reached any final outcome.
    pub fn resolved(&self) -> u64 {
        self.envelopes_completed
            + self.rejections
            + self.unreachable
            + self.superseded
            + self.cancelled
    }
}

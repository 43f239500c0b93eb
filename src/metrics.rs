use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Point-in-time copy of the negotiation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub offers_sent: u64,
    pub answers_sent: u64,
    pub answers_applied: u64,
    pub renegotiations: u64,
    pub stale_ignored: u64,
    pub candidates_sent: u64,
    pub candidates_buffered: u64,
    pub candidates_flushed: u64,
    pub candidates_applied: u64,
    pub signaling_write_failures: u64,
    pub links_connected: u64,
    pub links_failed: u64,
}

#[derive(Default)]
struct Counters {
    offers_sent: AtomicU64,
    answers_sent: AtomicU64,
    answers_applied: AtomicU64,
    renegotiations: AtomicU64,
    stale_ignored: AtomicU64,
    candidates_sent: AtomicU64,
    candidates_buffered: AtomicU64,
    candidates_flushed: AtomicU64,
    candidates_applied: AtomicU64,
    signaling_write_failures: AtomicU64,
    links_connected: AtomicU64,
    links_failed: AtomicU64,
}

/// Counters for the offer/answer/candidate exchange. Clones share state.
#[derive(Clone, Default)]
pub struct NegotiationMetrics {
    counters: Arc<Counters>,
}

macro_rules! counter {
    ($($name:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.counters.$name.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl NegotiationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(
        offers_sent,
        answers_sent,
        answers_applied,
        renegotiations,
        stale_ignored,
        candidates_sent,
        candidates_buffered,
        candidates_applied,
        signaling_write_failures,
        links_connected,
        links_failed,
    );

    pub fn candidates_flushed(&self, count: usize) {
        self.counters
            .candidates_flushed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        MetricsSnapshot {
            offers_sent: c.offers_sent.load(Ordering::Relaxed),
            answers_sent: c.answers_sent.load(Ordering::Relaxed),
            answers_applied: c.answers_applied.load(Ordering::Relaxed),
            renegotiations: c.renegotiations.load(Ordering::Relaxed),
            stale_ignored: c.stale_ignored.load(Ordering::Relaxed),
            candidates_sent: c.candidates_sent.load(Ordering::Relaxed),
            candidates_buffered: c.candidates_buffered.load(Ordering::Relaxed),
            candidates_flushed: c.candidates_flushed.load(Ordering::Relaxed),
            candidates_applied: c.candidates_applied.load(Ordering::Relaxed),
            signaling_write_failures: c.signaling_write_failures.load(Ordering::Relaxed),
            links_connected: c.links_connected.load(Ordering::Relaxed),
            links_failed: c.links_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_count_together() {
        let metrics = NegotiationMetrics::new();
        let other = metrics.clone();
        metrics.offers_sent();
        other.offers_sent();
        other.candidates_flushed(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.offers_sent, 2);
        assert_eq!(snapshot.candidates_flushed, 3);
        assert_eq!(snapshot.answers_applied, 0);
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for tracking write-path events: proposals, commit outcomes, and
/// schema changes with their index rebuilds.
///
/// Implementations must be cheap; every method is called on the hot path of
/// mutation application or commit.
pub trait MutationMetrics: Send + Sync {
    /// Records a proposal applied to local state.
    fn proposal_applied(&self);

    /// Records the outcome of a commit request.
    ///
    /// # Parameters
    /// * `outcome` - `"committed"`, `"aborted"` (coordinator refused), or
    ///   `"discarded"` (client asked to abort).
    fn commit_outcome(&self, outcome: &'static str);

    /// Records a durable schema update.
    fn schema_updated(&self);

    /// Records a background index rebuild starting.
    fn rebuild_started(&self);

    /// Records a background index rebuild failing.
    fn rebuild_failed(&self);
}

/// A no-op implementation of [`MutationMetrics`].
#[derive(Default)]
pub struct NoopMetrics;

impl MutationMetrics for NoopMetrics {
    fn proposal_applied(&self) {}
    fn commit_outcome(&self, _outcome: &'static str) {}
    fn schema_updated(&self) {}
    fn rebuild_started(&self) {}
    fn rebuild_failed(&self) {}
}

/// Atomic counter implementation of [`MutationMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Number of proposals applied.
    pub proposals: AtomicU64,

    /// Number of transactions committed.
    pub commits: AtomicU64,

    /// Number of transactions aborted by the coordinator.
    pub aborts: AtomicU64,

    /// Number of transactions discarded by the client.
    pub discards: AtomicU64,

    /// Number of schema records written.
    pub schema_updates: AtomicU64,

    /// Number of background index rebuilds started.
    pub rebuilds_started: AtomicU64,

    /// Number of background index rebuilds that failed.
    pub rebuilds_failed: AtomicU64,
}

impl MutationMetrics for CounterMetrics {
    fn proposal_applied(&self) {
        self.proposals.fetch_add(1, Ordering::Relaxed);
    }

    fn commit_outcome(&self, outcome: &'static str) {
        match outcome {
            "committed" => {
                self.commits.fetch_add(1, Ordering::Relaxed);
            }
            "aborted" => {
                self.aborts.fetch_add(1, Ordering::Relaxed);
            }
            "discarded" => {
                self.discards.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn schema_updated(&self) {
        self.schema_updates.fetch_add(1, Ordering::Relaxed);
    }

    fn rebuild_started(&self) {
        self.rebuilds_started.fetch_add(1, Ordering::Relaxed);
    }

    fn rebuild_failed(&self) {
        self.rebuilds_failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation, [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn MutationMetrics> {
    Arc::new(NoopMetrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_outcomes_land_in_separate_counters() {
        let metrics = CounterMetrics::default();
        metrics.commit_outcome("committed");
        metrics.commit_outcome("aborted");
        metrics.commit_outcome("discarded");
        metrics.commit_outcome("discarded");
        metrics.commit_outcome("unknown");
        assert_eq!(metrics.commits.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.aborts.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.discards.load(Ordering::Relaxed), 2);
    }
}

// Fire-and-forget usage counters.
//
// Incremented on the side of the request path; nothing here may fail a
// request. Counters are process-local and reset on restart.

use std::collections::HashMap;

use dashmap::DashMap;

/// Sink for usage events. Implementations must be Send + Sync so handlers
/// can share them via `Arc`.
pub trait UsageRecorder: Send + Sync {
    /// Count one occurrence of `event`. Infallible by contract.
    fn record(&self, event: &str);

    /// Current counter values.
    fn snapshot(&self) -> HashMap<String, u64>;
}

/// In-process counter map.
#[derive(Default)]
pub struct InMemoryUsage {
    counts: DashMap<String, u64>,
}

impl InMemoryUsage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UsageRecorder for InMemoryUsage {
    fn record(&self, event: &str) {
        *self.counts.entry(event.to_string()).or_insert(0) += 1;
    }

    fn snapshot(&self) -> HashMap<String, u64> {
        self.counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_event() {
        let usage = InMemoryUsage::new();
        usage.record("invoke");
        usage.record("invoke");
        usage.record("contest_page_opened");

        let snapshot = usage.snapshot();
        assert_eq!(snapshot["invoke"], 2);
        assert_eq!(snapshot["contest_page_opened"], 1);
    }

    #[test]
    fn snapshot_of_untouched_recorder_is_empty() {
        assert!(InMemoryUsage::new().snapshot().is_empty());
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        use std::sync::Arc;

        let usage = Arc::new(InMemoryUsage::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let usage = usage.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    usage.record("invoke");
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(usage.snapshot()["invoke"], 800);
    }
}

//! Per-operation timing recorder, attached when the transport is configured
//! with `profile: true`.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::info;

/// Accumulates wall times per operation kind across all worker tasks.
#[derive(Debug, Default)]
pub struct TransferProfiler {
    records: Mutex<Vec<(&'static str, Duration)>>,
}

/// Aggregated timings of one operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpTiming {
    pub count: u64,
    pub total: Duration,
}

impl TransferProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, op: &'static str, elapsed: Duration) {
        self.records
            .lock()
            .expect("profiler lock poisoned")
            .push((op, elapsed));
    }

    /// Aggregate recorded timings per operation kind.
    pub fn summary(&self) -> BTreeMap<&'static str, OpTiming> {
        let records = self.records.lock().expect("profiler lock poisoned");
        let mut out: BTreeMap<&'static str, OpTiming> = BTreeMap::new();
        for (op, elapsed) in records.iter() {
            let entry = out.entry(op).or_insert(OpTiming {
                count: 0,
                total: Duration::ZERO,
            });
            entry.count += 1;
            entry.total += *elapsed;
        }
        out
    }

    /// Log the aggregated timings.
    pub fn report(&self) {
        for (op, timing) in self.summary() {
            info!(
                op,
                count = timing.count,
                total_ms = timing.total.as_millis() as u64,
                avg_ms = (timing.total.as_millis() as u64).checked_div(timing.count).unwrap_or(0),
                "Transfer timing"
            );
        }
    }
}

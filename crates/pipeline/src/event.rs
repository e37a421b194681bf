use adapters::Parameters;
use chrono::{DateTime, Utc};
use ledger::LedgerState;
use models::Document;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// One lifecycle event on the pipeline's stream. The serialized form carries
/// a `type` discriminator matching the variant name, so `--output json`
/// consumers can dispatch without peeking at fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    DocumentStarted {
        doc_id: String,
        adapter: String,
        parameters: Parameters,
        timestamp: DateTime<Utc>,
        pipeline_id: String,
    },
    DocumentCompleted {
        document: Document,
        duration_ms: u64,
        adapter_metadata: BTreeMap<String, serde_json::Value>,
        timestamp: DateTime<Utc>,
    },
    DocumentFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        doc_id: Option<String>,
        error_type: String,
        error_message: String,
        retry_count: u32,
        retryable: bool,
        timestamp: DateTime<Utc>,
    },
    BatchProgress {
        completed: u64,
        failed: u64,
        in_flight: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        estimated_total: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eta_seconds: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    AdapterStateChange {
        adapter: String,
        old_state: LedgerState,
        new_state: LedgerState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

/// One terminally failed document, as collected by `run()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFailure {
    pub doc_id: Option<String>,
    pub error_type: String,
    pub error_message: String,
    pub retry_count: u32,
    pub retryable: bool,
}

/// Final accounting for one pipeline invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Highest observed event-queue depth; bounded by buffer_size.
    pub peak_queue_depth: usize,
    /// Total time producers spent suspended on the full event queue.
    pub backpressure_wait: Duration,
    pub elapsed: Duration,
}

/// Eager collection result. Memory is O(total documents); large batches
/// should consume `stream_events` instead.
#[derive(Debug)]
pub struct PipelineResult {
    pub documents: Vec<Document>,
    pub errors: Vec<DocumentFailure>,
    pub stats: PipelineStats,
}

/// Counters shared between workers and the supervisor.
pub(crate) struct SharedStats {
    started_at: Instant,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    in_flight: AtomicU64,
    peak_queue_depth: AtomicUsize,
    backpressure_wait_us: AtomicU64,
    last_progress_at: AtomicU64,
}

impl SharedStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            peak_queue_depth: AtomicUsize::new(0),
            backpressure_wait_us: AtomicU64::new(0),
            last_progress_at: AtomicU64::new(0),
        }
    }

    pub fn note_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    fn settle_in_flight(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn note_completed(&self) {
        self.settle_in_flight();
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_failed(&self, was_in_flight: bool) {
        if was_in_flight {
            self.settle_in_flight();
        }
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_queue_depth(&self, depth: usize) {
        self.peak_queue_depth.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn note_backpressure_wait(&self, wait: Duration) {
        self.backpressure_wait_us
            .fetch_add(wait.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed)
    }

    /// Claim a progress emission: true when at least `interval` documents
    /// finished since the last claim, with racing workers deduplicated.
    pub fn claim_progress(&self, interval: u64) -> bool {
        if interval == 0 {
            return false;
        }
        let processed = self.processed();
        let last = self.last_progress_at.load(Ordering::Relaxed);
        processed >= last + interval
            && self
                .last_progress_at
                .compare_exchange(last, processed, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
    }

    pub fn progress_event(&self, estimated_total: Option<u64>) -> PipelineEvent {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let skipped = self.skipped.load(Ordering::Relaxed);
        let processed = completed + failed;

        let eta_seconds = estimated_total.and_then(|total| {
            let accounted = processed + skipped;
            if processed == 0 || accounted >= total {
                return None;
            }
            let rate = processed as f64 / self.started_at.elapsed().as_secs_f64();
            Some(((total - accounted) as f64 / rate) as u64)
        });

        PipelineEvent::BatchProgress {
            completed,
            failed,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            estimated_total,
            eta_seconds,
            timestamp: Utc::now(),
        }
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            peak_queue_depth: self.peak_queue_depth.load(Ordering::Relaxed),
            backpressure_wait: Duration::from_micros(
                self.backpressure_wait_us.load(Ordering::Relaxed),
            ),
            elapsed: self.started_at.elapsed(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn events_serialize_with_a_type_discriminator() {
        let event = PipelineEvent::DocumentFailed {
            doc_id: Some("nct:NCT01234567".into()),
            error_type: "ValidationError".into(),
            error_message: "invalid nct_id".into(),
            retry_count: 0,
            retryable: false,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "DocumentFailed");
        assert_eq!(value["retryable"], false);

        let progress = PipelineEvent::BatchProgress {
            completed: 10,
            failed: 1,
            in_flight: 2,
            estimated_total: None,
            eta_seconds: None,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&progress).unwrap();
        assert_eq!(value["type"], "BatchProgress");
        assert!(value.get("estimated_total").is_none());
    }

    #[test]
    fn progress_claims_deduplicate() {
        let stats = SharedStats::new();
        stats.note_started();
        stats.note_completed();
        assert!(!stats.claim_progress(2));
        stats.note_started();
        stats.note_completed();
        assert!(stats.claim_progress(2));
        // Claimed once; the same watermark cannot be claimed again.
        assert!(!stats.claim_progress(2));
    }
}

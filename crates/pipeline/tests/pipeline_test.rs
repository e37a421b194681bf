//! End-to-end pipeline scenarios against a stub adapter: event ordering,
//! retry loops, idempotent resume, backpressure bounds, and dry runs.

use adapters::{Adapter, Dependencies, FetchStream, Fetched, IngestError, Parameters, Registry};
use futures::StreamExt;
use ledger::{Ledger, LedgerConfig, LedgerState};
use models::{validate, Document, PubMedArticle, ValidationError};
use pipeline::{Pipeline, PipelineEvent, StreamOptions};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A stub source: serves canned PubMed-shaped records, optionally failing
/// retryably a configured number of times before succeeding.
struct StubAdapter {
    records: Vec<PubMedArticle>,
    failures_remaining: Arc<AtomicU32>,
    /// When true, a `pmid` parameter addresses one record (deterministic
    /// doc_id); when false the adapter behaves as a sweep source.
    hinted: bool,
}

fn retryable_503() -> IngestError {
    IngestError::Fetch(fetch::Error::HttpStatus {
        url: "https://stub.example.org/records".into(),
        status: 503,
        elapsed: Duration::from_millis(5),
        retryable: true,
        retry_after: None,
    })
}

fn article(pmid: &str) -> PubMedArticle {
    PubMedArticle {
        pmid: pmid.to_string(),
        title: format!("Article {pmid}"),
        abstract_text: None,
        journal: None,
        authors: vec![],
        pub_date: Some("2024-03-01".into()),
        doi: None,
        mesh_terms: vec![],
        language: Some("en".into()),
    }
}

impl Adapter for StubAdapter {
    type Payload = PubMedArticle;

    fn name(&self) -> &'static str {
        "stub"
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        if !self.hinted {
            return None;
        }
        params
            .get("pmid")
            .and_then(|v| v.as_str())
            .map(|pmid| format!("pmid:{pmid}"))
    }

    fn fetch(&self, params: Parameters) -> FetchStream<PubMedArticle> {
        if self.failures_remaining.load(Ordering::SeqCst) > 0 {
            self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
            return Box::pin(futures::stream::once(async { Err(retryable_503()) }));
        }

        let wanted = params.get("pmid").and_then(|v| v.as_str()).map(str::to_string);
        let records: Vec<_> = self
            .records
            .iter()
            .filter(|r| wanted.as_deref().map_or(true, |pmid| r.pmid == pmid))
            .cloned()
            .map(|record| {
                let raw = serde_json::to_value(&record).unwrap();
                let bytes = serde_json::to_vec(&raw).unwrap();
                Ok(Fetched {
                    payload: record,
                    content_hash: Document::content_hash(&bytes),
                    source_version: Some("stub-1".into()),
                    uri: None,
                })
            })
            .collect();
        Box::pin(futures::stream::iter(records))
    }

    fn parse(&self, fetched: Fetched<PubMedArticle>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri: _,
        } = fetched;
        let doc_id = format!("pmid:{}", payload.pmid);
        let metadata = models::DocumentMetadata {
            ingested_at: chrono::Utc::now(),
            source_version: source_version.unwrap_or_else(|| "stub-1".into()),
            content_hash,
            extra: Default::default(),
        };
        Ok(Document::new(doc_id, "stub", payload, metadata))
    }

    fn validate(&self, document: &Document) -> Result<(), ValidationError> {
        let record = document
            .raw
            .as_pubmed()
            .ok_or(ValidationError::PayloadMismatch {
                expected: "pubmed_article",
                actual: "other",
            })?;
        validate::pmid(&record.pmid)?;
        validate::metadata(&document.metadata)?;
        Ok(())
    }
}

struct Harness {
    pipeline: Pipeline,
    _dir: tempfile::TempDir,
}

async fn harness(records: Vec<PubMedArticle>, failures: u32, hinted: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(Ledger::open(LedgerConfig::in_dir(dir.path())).await.unwrap());
    let client = fetch::Client::builder().build().unwrap();

    let failures = Arc::new(AtomicU32::new(failures));
    let mut registry = Registry::new();
    registry.register("stub", move |_deps: Dependencies| {
        Arc::new(StubAdapter {
            records: records.clone(),
            failures_remaining: failures.clone(),
            hinted,
        }) as Arc<dyn adapters::DynAdapter>
    });

    Harness {
        pipeline: Pipeline::new(Arc::new(registry), client, ledger),
        _dir: dir,
    }
}

fn pmid_params(pmid: &str) -> Parameters {
    let mut params = Parameters::new();
    params.insert("pmid".into(), json!(pmid));
    params
}

fn fast_options() -> StreamOptions {
    StreamOptions {
        retry_initial: Duration::from_millis(1),
        retry_max: Duration::from_millis(5),
        ..Default::default()
    }
}

#[tokio::test]
async fn happy_path_emits_ordered_events_and_completes_the_ledger() {
    let h = harness(vec![article("12345")], 0, true).await;

    let stream = h
        .pipeline
        .stream_events("stub", vec![pmid_params("12345")], fast_options())
        .unwrap();
    let events: Vec<PipelineEvent> = stream.collect().await;

    let kinds: Vec<&str> = events
        .iter()
        .map(|e| match e {
            PipelineEvent::DocumentStarted { .. } => "started",
            PipelineEvent::DocumentCompleted { .. } => "completed",
            PipelineEvent::DocumentFailed { .. } => "failed",
            PipelineEvent::BatchProgress { .. } => "progress",
            PipelineEvent::AdapterStateChange { .. } => "state",
        })
        .collect();
    assert_eq!(kinds, vec!["started", "completed", "progress"]);

    match &events[0] {
        PipelineEvent::DocumentStarted { doc_id, adapter, .. } => {
            assert_eq!(doc_id, "pmid:12345");
            assert_eq!(adapter, "stub");
        }
        other => panic!("unexpected event {other:?}"),
    }
    match &events[1] {
        PipelineEvent::DocumentCompleted { document, .. } => {
            assert_eq!(document.doc_id, "pmid:12345");
            assert_eq!(document.raw.as_pubmed().unwrap().pmid, "12345");
        }
        other => panic!("unexpected event {other:?}"),
    }
    match &events[2] {
        PipelineEvent::BatchProgress { completed, failed, .. } => {
            assert_eq!((*completed, *failed), (1, 0));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let entry = h.pipeline.ledger().get("pmid:12345").unwrap();
    assert_eq!(entry.state, LedgerState::Completed);
    assert_eq!(entry.attempt, 0);
}

#[tokio::test]
async fn transient_failures_retry_and_record_the_full_history() {
    let h = harness(vec![article("12345")], 2, true).await;

    let result = h
        .pipeline
        .run("stub", vec![pmid_params("12345")], fast_options())
        .await
        .unwrap();
    assert_eq!(result.documents.len(), 1);
    assert!(result.errors.is_empty());

    let history = h.pipeline.ledger().history("pmid:12345").await.unwrap();
    let states: Vec<LedgerState> = history.iter().map(|r| r.new_state).collect();
    use LedgerState::*;
    assert_eq!(
        states,
        vec![
            Pending,
            Fetching,
            FailedRetryable,
            Retrying,
            Fetching,
            FailedRetryable,
            Retrying,
            Fetching,
            Parsing,
            Validating,
            Writing,
            Completed
        ]
    );
    assert_eq!(h.pipeline.ledger().get("pmid:12345").unwrap().attempt, 2);
}

#[tokio::test]
async fn retry_events_surface_as_adapter_state_changes() {
    let h = harness(vec![article("12345")], 2, true).await;

    let stream = h
        .pipeline
        .stream_events("stub", vec![pmid_params("12345")], fast_options())
        .unwrap();
    let events: Vec<PipelineEvent> = stream.collect().await;

    let retries = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                PipelineEvent::AdapterStateChange {
                    new_state: LedgerState::Retrying,
                    ..
                }
            )
        })
        .count();
    assert_eq!(retries, 2);
    assert!(events
        .iter()
        .any(|e| matches!(e, PipelineEvent::DocumentCompleted { .. })));
}

#[tokio::test]
async fn invalid_identifier_fails_terminally() {
    let h = harness(vec![article("NOTAPMID")], 0, true).await;

    let result = h
        .pipeline
        .run("stub", vec![pmid_params("NOTAPMID")], fast_options())
        .await
        .unwrap();

    assert!(result.documents.is_empty());
    assert_eq!(result.errors.len(), 1);
    let failure = &result.errors[0];
    assert_eq!(failure.error_type, "ValidationError");
    assert!(!failure.retryable);
    assert!(failure.error_message.contains("pmid"));

    assert_eq!(
        h.pipeline.ledger().get("pmid:NOTAPMID").unwrap().state,
        LedgerState::FailedTerminal
    );
}

#[tokio::test]
async fn exhausted_retries_report_the_configured_attempts() {
    // Fetch always fails retryably.
    let h = harness(vec![article("12345")], u32::MAX, true).await;

    let options = StreamOptions {
        max_attempts: 3,
        ..fast_options()
    };
    let result = h
        .pipeline
        .run("stub", vec![pmid_params("12345")], options)
        .await
        .unwrap();

    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].retry_count, 3);
    assert!(!result.errors[0].retryable);

    let entry = h.pipeline.ledger().get("pmid:12345").unwrap();
    assert_eq!(entry.state, LedgerState::FailedTerminal);
    assert_eq!(entry.attempt, 2);
}

#[tokio::test]
async fn resume_skips_completed_documents_without_events() {
    let h = harness(vec![article("12345")], 0, true).await;

    let first = h
        .pipeline
        .run("stub", vec![pmid_params("12345")], fast_options())
        .await
        .unwrap();
    assert_eq!(first.stats.completed, 1);
    let entry_before = h.pipeline.ledger().get("pmid:12345").unwrap();

    let stream = h
        .pipeline
        .stream_events("stub", vec![pmid_params("12345")], fast_options())
        .unwrap();
    let events: Vec<PipelineEvent> = stream.collect().await;

    // Only the terminal BatchProgress; the ledger entry is untouched.
    assert_eq!(events.len(), 1);
    match &events[0] {
        PipelineEvent::BatchProgress { completed, failed, .. } => {
            assert_eq!((*completed, *failed), (0, 0));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(h.pipeline.ledger().get("pmid:12345").unwrap(), entry_before);
}

#[tokio::test]
async fn force_re_ingests_a_completed_document() {
    let h = harness(vec![article("12345")], 0, true).await;

    h.pipeline
        .run("stub", vec![pmid_params("12345")], fast_options())
        .await
        .unwrap();

    let options = StreamOptions {
        force: true,
        ..fast_options()
    };
    let result = h
        .pipeline
        .run("stub", vec![pmid_params("12345")], options)
        .await
        .unwrap();
    assert_eq!(result.stats.completed, 1);
    assert_eq!(result.stats.skipped, 0);
}

#[tokio::test]
async fn backpressure_bounds_the_queue_under_a_slow_consumer() {
    let records: Vec<PubMedArticle> = (1..=300).map(|n| article(&n.to_string())).collect();
    let h = harness(records, 0, false).await;

    let options = StreamOptions {
        buffer_size: 10,
        workers: 4,
        progress_interval: 1000,
        ..fast_options()
    };
    let mut stream = h
        .pipeline
        .stream_events("stub", vec![Parameters::new()], options)
        .unwrap();

    let mut completed = 0u64;
    while let Some(event) = stream.next().await {
        if matches!(event, PipelineEvent::DocumentCompleted { .. }) {
            completed += 1;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let stats = stream.finish().await.unwrap();

    assert_eq!(completed, 300);
    assert_eq!(stats.completed, 300);
    assert!(stats.peak_queue_depth <= 10, "peak {}", stats.peak_queue_depth);
    assert!(stats.backpressure_wait > Duration::ZERO);
}

#[tokio::test]
async fn event_filter_and_transform_run_on_the_consumer_side() {
    let h = harness(vec![article("12345")], 0, true).await;

    let options = StreamOptions {
        event_filter: Some(Box::new(|event: &PipelineEvent| {
            matches!(event, PipelineEvent::DocumentCompleted { .. })
        })),
        event_transform: Some(Box::new(|event: PipelineEvent| match event {
            PipelineEvent::DocumentCompleted {
                mut document,
                duration_ms,
                adapter_metadata,
                timestamp,
            } => {
                document.source = "transformed".into();
                PipelineEvent::DocumentCompleted {
                    document,
                    duration_ms,
                    adapter_metadata,
                    timestamp,
                }
            }
            other => other,
        })),
        ..fast_options()
    };

    let stream = h
        .pipeline
        .stream_events("stub", vec![pmid_params("12345")], options)
        .unwrap();
    let events: Vec<PipelineEvent> = stream.collect().await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        PipelineEvent::DocumentCompleted { document, .. } => {
            assert_eq!(document.source, "transformed");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn dry_run_emits_events_but_records_nothing() {
    let h = harness(vec![article("12345")], 0, true).await;

    let options = StreamOptions {
        dry_run: true,
        ..fast_options()
    };
    let result = h
        .pipeline
        .run("stub", vec![pmid_params("12345")], options)
        .await
        .unwrap();

    assert_eq!(result.documents.len(), 1);
    assert!(h.pipeline.ledger().is_empty());
}

#[tokio::test]
async fn fail_fast_cancels_after_the_first_terminal_failure() {
    let records = vec![article("BAD1"), article("BAD2"), article("BAD3")];
    let h = harness(records, 0, false).await;

    let options = StreamOptions {
        fail_fast: true,
        workers: 1,
        ..fast_options()
    };
    let result = h
        .pipeline
        .run("stub", vec![Parameters::new()], options)
        .await
        .unwrap();

    assert!(result.errors.len() >= 1);
    assert!(result.stats.failed >= 1);
    assert!(result.documents.is_empty());
}

#[tokio::test]
async fn unknown_adapter_fails_the_invocation() {
    let h = harness(vec![], 0, true).await;
    let err = h
        .pipeline
        .stream_events("nope", vec![], StreamOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("unknown adapter"), "{err}");
}

#[tokio::test]
async fn iter_documents_yields_only_documents() {
    let h = harness(vec![article("1"), article("2")], 0, false).await;

    let docs: Vec<Document> = h
        .pipeline
        .iter_documents("stub", vec![Parameters::new()], fast_options())
        .unwrap()
        .collect()
        .await;

    let mut ids: Vec<&str> = docs.iter().map(|d| d.doc_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["pmid:1", "pmid:2"]);
}

use crate::event::{PipelineEvent, SharedStats};
use crate::{PipelineError, StreamOptions};
use adapters::{classify, error_info, error_type, Disposition, DynAdapter, IngestError, Parameters};
use chrono::Utc;
use futures::TryStreamExt;
use ledger::{Ledger, LedgerState};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) struct WorkerCtx {
    pub adapter: Arc<dyn DynAdapter>,
    pub ledger: Arc<Ledger>,
    pub tx: mpsc::Sender<PipelineEvent>,
    pub stats: Arc<SharedStats>,
    pub options: StreamOptions,
    pub cancel: CancellationToken,
    pub pipeline_id: String,
    pub estimated_total: Option<u64>,
}

impl WorkerCtx {
    /// Enqueue an event, suspending while the queue is full. A dropped
    /// consumer reads as cancellation.
    async fn emit(&self, event: PipelineEvent) {
        let depth = self.options.buffer_size - self.tx.capacity().min(self.options.buffer_size);
        self.stats
            .note_queue_depth((depth + 1).min(self.options.buffer_size));

        let waiting = Instant::now();
        if self.tx.send(event).await.is_err() {
            self.cancel.cancel();
        }
        self.stats.note_backpressure_wait(waiting.elapsed());
    }

    async fn emit_progress_if_due(&self) {
        if self.stats.claim_progress(self.options.progress_interval as u64) {
            self.emit(self.stats.progress_event(self.estimated_total)).await;
        }
    }

    /// Record `target` for `doc_id` when the transition map permits it from
    /// the current state. A document resumed mid-lifecycle (stuck from an
    /// interrupted run) re-traverses earlier stages without re-recording
    /// them. Dry runs record nothing. Genuine violations still surface: the
    /// ledger's own validation runs on every write that happens.
    async fn advance(
        &self,
        doc_id: &str,
        target: LedgerState,
        error: Option<ledger::ErrorInfo>,
        metadata: Option<BTreeMap<String, serde_json::Value>>,
    ) -> Result<(), PipelineError> {
        if self.options.dry_run {
            return Ok(());
        }
        if let Some(current) = self.ledger.get(doc_id).map(|entry| entry.state) {
            if current == target || !LedgerState::may_record(Some(current), target) {
                return Ok(());
            }
        }
        self.ledger
            .record(doc_id, self.adapter.name(), target, error, metadata)
            .await?;
        Ok(())
    }

    fn completed_in_ledger(&self, doc_id: &str) -> bool {
        self.ledger.get(doc_id).map(|entry| entry.state) == Some(LedgerState::Completed)
    }

    async fn fail_document(
        &self,
        doc_id: Option<&str>,
        err: &IngestError,
        retry_count: u32,
        retryable: bool,
        was_in_flight: bool,
    ) -> Result<(), PipelineError> {
        if let Some(doc_id) = doc_id {
            self.advance(doc_id, LedgerState::FailedTerminal, Some(error_info(err)), None)
                .await?;
        }
        self.stats.note_failed(was_in_flight);
        self.emit(PipelineEvent::DocumentFailed {
            doc_id: doc_id.map(str::to_string),
            error_type: error_type(err).to_string(),
            error_message: err.to_string(),
            retry_count,
            retryable,
            timestamp: Utc::now(),
        })
        .await;
        self.emit_progress_if_due().await;

        if self.options.fail_fast {
            self.cancel.cancel();
        }
        Ok(())
    }
}

fn params_metadata(params: &Parameters) -> Option<BTreeMap<String, serde_json::Value>> {
    if params.is_empty() {
        None
    } else {
        Some(params.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

fn retry_backoff(options: &StreamOptions, attempt: u32) -> std::time::Duration {
    let mut backoff = exponential_backoff::Backoff::new(
        options.max_attempts.max(1),
        options.retry_initial,
        Some(options.retry_max),
    );
    backoff.set_factor(2);
    backoff.set_jitter(0.2);
    backoff.next(attempt).unwrap_or(options.retry_max)
}

/// Drain parameter objects until the queue is empty or the run is cancelled.
pub(crate) async fn worker_loop(
    ctx: Arc<WorkerCtx>,
    queue: Arc<Mutex<VecDeque<Parameters>>>,
) -> Result<(), PipelineError> {
    loop {
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        let params = queue.lock().unwrap().pop_front();
        match params {
            Some(params) => run_param(&ctx, params).await?,
            None => return Ok(()),
        }
    }
}

enum PassOutcome {
    Done,
    Failed(IngestError),
}

/// Process one parameter object: the fetch-level retry loop plus per-record
/// stage driving. Per-document terminal failures are absorbed (the pipeline
/// continues); only ledger-level failures propagate.
async fn run_param(ctx: &WorkerCtx, params: Parameters) -> Result<(), PipelineError> {
    let hinted = ctx.adapter.document_id(&params);

    // Idempotent skip: completed documents are never re-run (the entry is
    // terminal and stays untouched) unless forced.
    if let Some(doc_id) = &hinted {
        if !ctx.options.force && ctx.completed_in_ledger(doc_id) {
            ctx.stats.note_skipped();
            return Ok(());
        }
    }

    let mut attempt: u32 = 0;
    loop {
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }

        match fetch_pass(ctx, &params, hinted.as_deref(), attempt).await? {
            PassOutcome::Done => return Ok(()),
            PassOutcome::Failed(err) => {
                let retryable = classify(&err) == Disposition::Retryable;
                let tries = attempt + 1;

                if retryable && tries < ctx.options.max_attempts && !ctx.cancel.is_cancelled() {
                    attempt = tries;
                    tracing::debug!(
                        adapter = ctx.adapter.name(),
                        doc_id = hinted.as_deref().unwrap_or(""),
                        attempt,
                        error = %err,
                        "retrying after transient failure"
                    );
                    if let Some(doc_id) = hinted.as_deref() {
                        ctx.advance(
                            doc_id,
                            LedgerState::FailedRetryable,
                            Some(error_info(&err)),
                            None,
                        )
                        .await?;
                        ctx.advance(doc_id, LedgerState::Retrying, None, None).await?;
                    }
                    ctx.emit(PipelineEvent::AdapterStateChange {
                        adapter: ctx.adapter.name().to_string(),
                        old_state: LedgerState::FailedRetryable,
                        new_state: LedgerState::Retrying,
                        reason: Some(err.to_string()),
                        timestamp: Utc::now(),
                    })
                    .await;

                    let backoff = retry_backoff(&ctx.options, attempt);
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        () = ctx.cancel.cancelled() => return Ok(()),
                    }
                    if let Some(doc_id) = hinted.as_deref() {
                        ctx.advance(doc_id, LedgerState::Fetching, None, None).await?;
                    }
                    continue;
                }

                // Exhausted retries (or terminal outright): one failed
                // document. Exhaustion reports retryable=false; only an
                // abort mid-retry leaves it true.
                let aborted_early = retryable && tries < ctx.options.max_attempts;
                let retry_count = if retryable { tries } else { attempt };
                ctx.fail_document(hinted.as_deref(), &err, retry_count, aborted_early, hinted.is_some())
                    .await?;
                return Ok(());
            }
        }
    }
}

async fn fetch_pass(
    ctx: &WorkerCtx,
    params: &Parameters,
    hinted: Option<&str>,
    attempt: u32,
) -> Result<PassOutcome, PipelineError> {
    if let Some(doc_id) = hinted {
        if attempt == 0 {
            ctx.advance(doc_id, LedgerState::Pending, None, params_metadata(params))
                .await?;
            ctx.stats.note_started();
            ctx.emit(PipelineEvent::DocumentStarted {
                doc_id: doc_id.to_string(),
                adapter: ctx.adapter.name().to_string(),
                parameters: params.clone(),
                timestamp: Utc::now(),
                pipeline_id: ctx.pipeline_id.clone(),
            })
            .await;
        }
        ctx.advance(doc_id, LedgerState::Fetching, None, None).await?;
    }

    let mut yielded = false;
    let mut stream = std::pin::pin!(ctx.adapter.fetch(params.clone()));

    loop {
        let next = async {
            match ctx.options.document_timeout {
                Some(timeout) => tokio::time::timeout(timeout, stream.try_next())
                    .await
                    .unwrap_or(Err(IngestError::Timeout {
                        stage: "fetch",
                        timeout,
                    })),
                None => stream.try_next().await,
            }
        };
        let item = tokio::select! {
            item = next => item,
            () = ctx.cancel.cancelled() => return Ok(PassOutcome::Done),
        };

        match item {
            Err(err) => return Ok(PassOutcome::Failed(err)),
            Ok(None) => break,
            Ok(Some(fetched)) => {
                yielded = true;
                process_record(ctx, params, hinted, attempt, fetched).await?;
            }
        }
    }

    if let Some(doc_id) = hinted {
        if !yielded && !ctx.completed_in_ledger(doc_id) {
            // The upstream answered without a record; nothing to ingest.
            ctx.advance(doc_id, LedgerState::Skipped, None, None).await?;
            ctx.stats.note_skipped();
        }
    }
    Ok(PassOutcome::Done)
}

/// Drive one fetched record through parse → validate → write, recording the
/// lifecycle and emitting events. Per-record failures are terminal for the
/// record only.
async fn process_record(
    ctx: &WorkerCtx,
    params: &Parameters,
    hinted: Option<&str>,
    attempt: u32,
    fetched: adapters::Fetched<models::AdapterPayload>,
) -> Result<(), PipelineError> {
    let started = Instant::now();

    if let Some(doc_id) = hinted {
        ctx.advance(doc_id, LedgerState::Parsing, None, None).await?;
    }

    let document = match ctx.adapter.parse(fetched) {
        Ok(document) => document,
        Err(err) => {
            return ctx
                .fail_document(hinted, &err, attempt, false, hinted.is_some())
                .await;
        }
    };
    let doc_id = document.doc_id.clone();

    // Sweep records reach their identity only now: register the lifecycle
    // retroactively (fetch already happened) and check idempotent skip.
    if hinted.is_none() {
        if !ctx.options.force && ctx.completed_in_ledger(&doc_id) {
            ctx.stats.note_skipped();
            return Ok(());
        }
        ctx.advance(&doc_id, LedgerState::Pending, None, params_metadata(params))
            .await?;
        ctx.stats.note_started();
        ctx.emit(PipelineEvent::DocumentStarted {
            doc_id: doc_id.clone(),
            adapter: ctx.adapter.name().to_string(),
            parameters: params.clone(),
            timestamp: Utc::now(),
            pipeline_id: ctx.pipeline_id.clone(),
        })
        .await;
        ctx.advance(&doc_id, LedgerState::Fetching, None, None).await?;
        ctx.advance(&doc_id, LedgerState::Parsing, None, None).await?;
    }

    ctx.advance(&doc_id, LedgerState::Validating, None, None).await?;
    if let Err(validation) = ctx.adapter.validate(&document) {
        let lenient = matches!(
            validation,
            models::ValidationError::InvalidMetadata { .. }
        ) && !ctx.options.strict_validation;

        if lenient {
            tracing::warn!(
                doc_id = %doc_id,
                error = %validation,
                "metadata validation downgraded to a warning"
            );
        } else {
            let err = IngestError::Validation(validation);
            return ctx.fail_document(Some(&doc_id), &err, attempt, false, true).await;
        }
    }

    ctx.advance(&doc_id, LedgerState::Writing, None, None).await?;

    // The completion is durable before its event is observable.
    ctx.advance(&doc_id, LedgerState::Completed, None, None).await?;
    ctx.stats.note_completed();

    let mut adapter_metadata = BTreeMap::new();
    adapter_metadata.insert(
        "adapter".to_string(),
        serde_json::Value::String(ctx.adapter.name().to_string()),
    );
    adapter_metadata.insert("attempt".to_string(), serde_json::Value::from(attempt));

    ctx.emit(PipelineEvent::DocumentCompleted {
        document,
        duration_ms: started.elapsed().as_millis() as u64,
        adapter_metadata,
        timestamp: Utc::now(),
    })
    .await;
    ctx.emit_progress_if_due().await;
    Ok(())
}

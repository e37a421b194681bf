mod event;
mod worker;

pub use event::{DocumentFailure, PipelineEvent, PipelineResult, PipelineStats};

use adapters::{Dependencies, IngestError, Parameters, Registry};
use futures::{Stream, StreamExt};
use ledger::Ledger;
use models::Document;
use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use worker::{worker_loop, WorkerCtx};

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Invalid transition or corruption. Indicates a bug or damaged state;
    /// never absorbed into per-document failure accounting.
    #[error(transparent)]
    Ledger(#[from] ledger::Error),

    /// Registry miss or adapter-level setup failure.
    #[error(transparent)]
    Adapter(#[from] IngestError),

    #[error("pipeline worker panicked")]
    Worker(#[from] tokio::task::JoinError),
}

pub type EventFilter = Box<dyn Fn(&PipelineEvent) -> bool + Send + Sync>;
pub type EventTransform = Box<dyn Fn(PipelineEvent) -> PipelineEvent + Send + Sync>;

/// Per-invocation knobs for the streaming executor.
pub struct StreamOptions {
    pub workers: usize,
    /// Capacity of the bounded event queue: the backpressure window.
    pub buffer_size: usize,
    /// Emit BatchProgress at most every this many finished documents
    /// (a final one is always emitted at termination).
    pub progress_interval: usize,
    /// Total tries per document, including the first.
    pub max_attempts: u32,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// Deadline for obtaining each record from the adapter's fetch stream.
    pub document_timeout: Option<Duration>,
    /// Fetch/parse/validate without recording ledger state or emitting to
    /// downstream sinks.
    pub dry_run: bool,
    /// Re-ingest documents whose ledger entry is already terminal.
    pub force: bool,
    /// Cancel the run after the first terminally failed document.
    pub fail_fast: bool,
    /// Treat metadata validation failures as errors instead of warnings.
    pub strict_validation: bool,
    pub event_filter: Option<EventFilter>,
    pub event_transform: Option<EventTransform>,
    pub cancel: Option<CancellationToken>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            buffer_size: 100,
            progress_interval: 100,
            max_attempts: 3,
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_secs(30),
            document_timeout: None,
            dry_run: false,
            force: false,
            fail_fast: false,
            strict_validation: false,
            event_filter: None,
            event_transform: None,
            cancel: None,
        }
    }
}

/// The streaming pipeline executor: runs one adapter over a set of
/// parameter objects with a bounded worker pool, recording every lifecycle
/// transition in the ledger and emitting events through a bounded queue.
pub struct Pipeline {
    registry: Arc<Registry>,
    client: fetch::Client,
    ledger: Arc<Ledger>,
    secrets: BTreeMap<String, String>,
}

impl Pipeline {
    pub fn new(registry: Arc<Registry>, client: fetch::Client, ledger: Arc<Ledger>) -> Self {
        Self {
            registry,
            client,
            ledger,
            secrets: BTreeMap::new(),
        }
    }

    pub fn with_secrets(mut self, secrets: BTreeMap<String, String>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dependencies(&self) -> Dependencies {
        Dependencies {
            client: self.client.clone(),
            secrets: self.secrets.clone(),
        }
    }

    /// The primary API: a lazy, bounded stream of PipelineEvents. The stream
    /// is finite (it ends when every parameter object is exhausted) or
    /// cancellable through `options.cancel`; a dropped stream also winds the
    /// workers down. Call `finish()` after draining to obtain final stats
    /// and surface any fatal error.
    pub fn stream_events(
        &self,
        adapter_name: &str,
        parameters: Vec<Parameters>,
        options: StreamOptions,
    ) -> Result<EventStream> {
        let adapter = self.registry.build(adapter_name, self.dependencies())?;

        let StreamOptions {
            workers,
            buffer_size,
            progress_interval,
            max_attempts,
            retry_initial,
            retry_max,
            document_timeout,
            dry_run,
            force,
            fail_fast,
            strict_validation,
            event_filter: filter,
            event_transform: transform,
            cancel,
        } = options;

        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        let cancel = cancel.unwrap_or_default();
        let stats = Arc::new(event::SharedStats::new());

        // A document-count estimate exists only when every parameter object
        // addresses exactly one document.
        let estimated_total = parameters
            .iter()
            .all(|params| adapter.document_id(params).is_some())
            .then_some(parameters.len() as u64);

        let ctx = Arc::new(WorkerCtx {
            adapter,
            ledger: self.ledger.clone(),
            tx: tx.clone(),
            stats: stats.clone(),
            options: StreamOptions {
                workers,
                buffer_size: buffer_size.max(1),
                progress_interval,
                max_attempts,
                retry_initial,
                retry_max,
                document_timeout,
                dry_run,
                force,
                fail_fast,
                strict_validation,
                event_filter: None,
                event_transform: None,
                cancel: None,
            },
            cancel: cancel.clone(),
            pipeline_id: uuid::Uuid::new_v4().to_string(),
            estimated_total,
        });

        let queue = Arc::new(Mutex::new(parameters.into_iter().collect::<VecDeque<_>>()));
        let workers = ctx.options.workers.max(1);

        let supervisor = tokio::spawn(async move {
            let mut join = JoinSet::new();
            for _ in 0..workers {
                join.spawn(worker_loop(ctx.clone(), queue.clone()));
            }

            let mut fatal: Option<PipelineError> = None;
            while let Some(joined) = join.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(join_err) => Err(PipelineError::Worker(join_err)),
                };
                if let Err(err) = outcome {
                    tracing::error!(error = %err, "pipeline worker failed fatally");
                    if fatal.is_none() {
                        fatal = Some(err);
                    }
                    ctx.cancel.cancel();
                }
            }

            // Terminal BatchProgress, then close the stream.
            let _ = tx.send(stats.progress_event(ctx.estimated_total)).await;
            drop(tx);

            match fatal {
                Some(err) => Err(err),
                None => Ok(stats.snapshot()),
            }
        });

        Ok(EventStream {
            rx,
            filter,
            transform,
            supervisor,
        })
    }

    /// Convenience filter over `stream_events`, yielding completed
    /// Documents. Fatal pipeline errors terminate the stream early and are
    /// logged; use `stream_events` + `finish()` to observe them typed.
    pub fn iter_documents(
        &self,
        adapter_name: &str,
        parameters: Vec<Parameters>,
        options: StreamOptions,
    ) -> Result<impl Stream<Item = Document> + Send> {
        let stream = self.stream_events(adapter_name, parameters, options)?;
        Ok(stream.filter_map(|event| {
            futures::future::ready(match event {
                PipelineEvent::DocumentCompleted { document, .. } => Some(document),
                _ => None,
            })
        }))
    }

    /// Eager collector. Memory is O(total documents + failures): suitable
    /// for small batches and tests; large batches should consume
    /// `stream_events` instead.
    pub async fn run(
        &self,
        adapter_name: &str,
        parameters: Vec<Parameters>,
        options: StreamOptions,
    ) -> Result<PipelineResult> {
        let mut stream = self.stream_events(adapter_name, parameters, options)?;
        let mut documents = Vec::new();
        let mut errors = Vec::new();

        while let Some(event) = stream.next().await {
            match event {
                PipelineEvent::DocumentCompleted { document, .. } => documents.push(document),
                PipelineEvent::DocumentFailed {
                    doc_id,
                    error_type,
                    error_message,
                    retry_count,
                    retryable,
                    ..
                } => errors.push(DocumentFailure {
                    doc_id,
                    error_type,
                    error_message,
                    retry_count,
                    retryable,
                }),
                _ => {}
            }
        }

        let stats = stream.finish().await?;
        Ok(PipelineResult {
            documents,
            errors,
            stats,
        })
    }
}

/// The lazy event sequence returned by `stream_events`. Caller-supplied
/// filter and transform run inline on the consumer side.
pub struct EventStream {
    rx: mpsc::Receiver<PipelineEvent>,
    filter: Option<EventFilter>,
    transform: Option<EventTransform>,
    supervisor: JoinHandle<Result<PipelineStats>>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

impl Stream for EventStream {
    type Item = PipelineEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(event)) => {
                    if let Some(filter) = &this.filter {
                        if !filter(&event) {
                            continue;
                        }
                    }
                    let event = match &this.transform {
                        Some(transform) => transform(event),
                        None => event,
                    };
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl EventStream {
    /// Drain any remaining events and wait for the workers to settle.
    /// Returns final stats, or the fatal error (invalid state transition,
    /// ledger corruption, worker panic) that ended the run.
    pub async fn finish(mut self) -> Result<PipelineStats> {
        while self.next().await.is_some() {}
        self.supervisor.await?
    }
}

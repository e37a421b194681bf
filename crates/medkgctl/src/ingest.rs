use crate::logging::LogArgs;
use crate::output::{OutputMode, Reporter};
use adapters::{Parameters, Registry, SweepWindow};
use anyhow::Context;
use futures::StreamExt;
use ledger::{Ledger, LedgerConfig, LedgerState};
use pipeline::{Pipeline, StreamOptions};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Environment variables consulted for source credentials; each adapter
/// documents which one it reads.
const SECRET_KEYS: &[&str] = &[
    "NCBI_API_KEY",
    "UMLS_API_KEY",
    "OPENFDA_API_KEY",
    "ICD11_TOKEN",
    "NICE_API_KEY",
    "SOCRATA_APP_TOKEN",
];

#[derive(Debug, clap::Args)]
pub struct IngestArgs {
    /// Registered source adapter to run.
    adapter: String,

    /// NDJSON file with one parameter object per line.
    #[arg(long)]
    batch: Option<PathBuf>,

    /// Let the adapter produce its own parameters (date-window sweep).
    #[arg(long, conflicts_with = "batch")]
    auto: bool,

    /// Skip parameters whose document is already COMPLETED in the ledger.
    #[arg(long, visible_alias = "continue")]
    resume: bool,

    /// Stop after at most this many documents.
    #[arg(long)]
    limit: Option<u64>,

    /// Fetch, parse, and validate without recording completions or emitting
    /// to downstream sinks.
    #[arg(long)]
    dry_run: bool,

    /// Re-ingest documents whose ledger entry is already terminal.
    #[arg(long)]
    force: bool,

    #[arg(long, value_enum, default_value_t = OutputMode::Text)]
    output: OutputMode,

    /// Print progress lines (text mode).
    #[arg(long)]
    progress: bool,

    #[arg(long, conflicts_with = "verbose")]
    quiet: bool,

    #[arg(long)]
    verbose: bool,

    /// Treat metadata validation failures as errors instead of warnings.
    #[arg(long)]
    strict_validation: bool,

    /// Cancel the run after the first terminally failed document.
    #[arg(long)]
    fail_fast: bool,

    #[command(flatten)]
    log: LogArgs,

    /// Window start for sweeps (ISO 8601 date).
    #[arg(long)]
    start_date: Option<chrono::NaiveDate>,

    /// Window end for sweeps (ISO 8601 date).
    #[arg(long)]
    end_date: Option<chrono::NaiveDate>,

    #[arg(long)]
    page_size: Option<u32>,

    /// Append-only ledger log location.
    #[arg(long, env = "LEDGER_PATH", default_value = "medkg-ledger/ledger.log")]
    ledger_path: PathBuf,

    /// Ledger snapshot location (defaults to snapshot.json beside the log).
    #[arg(long, env = "LEDGER_SNAPSHOT_PATH")]
    ledger_snapshot_path: Option<PathBuf>,

    /// Total per-request HTTP timeout.
    #[arg(long, env = "HTTP_TIMEOUT_MS", default_value_t = 60_000)]
    http_timeout_ms: u64,

    /// Attempts per HTTP request, including the first.
    #[arg(long, env = "HTTP_MAX_ATTEMPTS", default_value_t = 5)]
    http_max_attempts: u32,

    /// Concurrent pipeline workers.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Event queue capacity (the backpressure window).
    #[arg(long, default_value_t = 100)]
    buffer_size: usize,

    /// Enable a telemetry exporter (log, otlp).
    #[arg(long)]
    export_telemetry: Option<String>,
}

pub async fn run(args: IngestArgs) -> ExitCode {
    if let Err(err) = crate::logging::init(&args.log, args.quiet, args.verbose) {
        eprintln!("error: {err:#}");
        return ExitCode::from(2);
    }

    // Usage-class failures (unknown adapter, bad batch file, missing
    // optional dependency) exit 2; runtime failures exit 1.
    match run_inner(args).await {
        Ok(code) => code,
        Err(Failure::Usage(err)) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
        Err(Failure::Runtime(err)) => {
            tracing::error!(error = ?err, "ingestion failed");
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

enum Failure {
    Usage(anyhow::Error),
    Runtime(anyhow::Error),
}

async fn run_inner(args: IngestArgs) -> Result<ExitCode, Failure> {
    let registry = Arc::new(Registry::with_builtin_sources());
    if !registry.contains(&args.adapter) {
        return Err(Failure::Usage(anyhow::anyhow!(
            "unknown adapter '{}'; known adapters: {}",
            args.adapter,
            registry.names().join(", ")
        )));
    }

    let retry = fetch::RetryPolicy {
        max_attempts: args.http_max_attempts,
        ..Default::default()
    };
    let client = fetch::Client::builder()
        .retry_policy(retry)
        .total_timeout(Duration::from_millis(args.http_timeout_ms))
        .traceparent(std::env::var("TRACEPARENT").ok())
        .build()
        .context("failed to build HTTP client")
        .map_err(Failure::Runtime)?;

    if let Some(exporter) = &args.export_telemetry {
        crate::extras::enable_telemetry_exporter(exporter, &client)
            .map_err(|err| Failure::Usage(err.into()))?;
    }

    let snapshot_path = args.ledger_snapshot_path.clone().unwrap_or_else(|| {
        args.ledger_path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join("snapshot.json")
    });
    let ledger = Ledger::open(LedgerConfig {
        log_path: args.ledger_path.clone(),
        snapshot_path,
        retain_snapshots: 7,
    })
    .await
    .context("failed to open ingestion ledger")
    .map_err(Failure::Runtime)?;
    let ledger = Arc::new(ledger);

    let secrets: BTreeMap<String, String> = SECRET_KEYS
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect();

    let pipeline = Pipeline::new(registry.clone(), client, ledger.clone()).with_secrets(secrets);

    // Assemble parameter objects: batch file, adapter-produced sweep, or a
    // single object carrying the window flags.
    let window = SweepWindow {
        start_date: args.start_date,
        end_date: args.end_date,
        page_size: args.page_size,
    };
    let mut parameters = if let Some(batch) = &args.batch {
        read_batch(batch).map_err(Failure::Usage)?
    } else if args.auto {
        let adapter = registry
            .build(&args.adapter, pipeline.dependencies())
            .map_err(|err| Failure::Usage(err.into()))?;
        adapter
            .auto_parameters(&window)
            .map_err(|err| Failure::Runtime(err.into()))?
    } else {
        vec![window_parameters(&window)]
    };

    // Window flags apply to batch parameters too, without overriding
    // per-line values.
    for params in &mut parameters {
        merge_window(params, &window);
        if let Some(limit) = args.limit {
            params
                .entry("limit".to_string())
                .or_insert_with(|| limit.into());
        }
    }

    // Resume: drop parameters whose deterministic doc_id already completed.
    let mut skipped_by_resume = 0u64;
    if args.resume {
        let adapter = registry
            .build(&args.adapter, pipeline.dependencies())
            .map_err(|err| Failure::Usage(err.into()))?;
        parameters.retain(|params| {
            let completed = adapter
                .document_id(params)
                .and_then(|doc_id| ledger.get(&doc_id))
                .map_or(false, |entry| entry.state == LedgerState::Completed);
            if completed {
                skipped_by_resume += 1;
            }
            !completed
        });
    }

    if let Some(limit) = args.limit {
        parameters.truncate(limit as usize);
    }

    // Ctrl-C cancels cooperatively: in-flight entries stay resumable.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; draining pipeline");
            signal_cancel.cancel();
        }
    });

    let options = StreamOptions {
        workers: args.workers,
        buffer_size: args.buffer_size,
        dry_run: args.dry_run,
        force: args.force,
        fail_fast: args.fail_fast,
        strict_validation: args.strict_validation,
        cancel: Some(cancel),
        ..Default::default()
    };

    let mut reporter = Reporter::new(
        args.output,
        &args.adapter,
        args.quiet,
        args.verbose,
        args.progress,
    );
    let mut stream = pipeline
        .stream_events(&args.adapter, parameters, options)
        .map_err(|err| Failure::Usage(anyhow::Error::from(err)))?;

    while let Some(event) = stream.next().await {
        reporter.handle(&event);
    }
    let stats = stream
        .finish()
        .await
        .context("pipeline terminated fatally")
        .map_err(Failure::Runtime)?;

    reporter.summary(&stats, skipped_by_resume, args.dry_run);

    if stats.failed > 0 {
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn window_parameters(window: &SweepWindow) -> Parameters {
    let mut params = Parameters::new();
    merge_window(&mut params, window);
    params
}

fn merge_window(params: &mut Parameters, window: &SweepWindow) {
    if let Some(start) = window.start_date {
        params
            .entry("start_date".to_string())
            .or_insert_with(|| start.to_string().into());
    }
    if let Some(end) = window.end_date {
        params
            .entry("end_date".to_string())
            .or_insert_with(|| end.to_string().into());
    }
    if let Some(page_size) = window.page_size {
        params
            .entry("page_size".to_string())
            .or_insert_with(|| page_size.into());
    }
}

/// Read an NDJSON batch file: one JSON object per line, blank lines ignored.
fn read_batch(path: &PathBuf) -> anyhow::Result<Vec<Parameters>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read batch file {}", path.display()))?;

    let mut parameters = Vec::new();
    for (n, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let params: Parameters = serde_json::from_str(line).with_context(|| {
            format!("batch file {} line {}: not a JSON object", path.display(), n + 1)
        })?;
        parameters.push(params);
    }
    anyhow::ensure!(
        !parameters.is_empty(),
        "batch file {} contains no parameter objects",
        path.display()
    );
    Ok(parameters)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn batch_files_parse_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.ndjson");
        std::fs::write(&path, "{\"pmid\":\"1\"}\n\n{\"pmid\":\"2\"}\n").unwrap();

        let parameters = read_batch(&path).unwrap();
        assert_eq!(parameters.len(), 2);
        assert_eq!(parameters[1]["pmid"], serde_json::json!("2"));
    }

    #[test]
    fn malformed_batch_lines_are_usage_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.ndjson");
        std::fs::write(&path, "{\"pmid\":\"1\"}\nnot json\n").unwrap();

        let err = read_batch(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn window_flags_do_not_override_batch_values() {
        let mut params = Parameters::new();
        params.insert("start_date".into(), serde_json::json!("2023-01-01"));

        let window = SweepWindow {
            start_date: Some("2024-06-01".parse().unwrap()),
            end_date: Some("2024-06-30".parse().unwrap()),
            page_size: Some(50),
        };
        merge_window(&mut params, &window);

        assert_eq!(params["start_date"], serde_json::json!("2023-01-01"));
        assert_eq!(params["end_date"], serde_json::json!("2024-06-30"));
        assert_eq!(params["page_size"], serde_json::json!(50));
    }
}

//! Event and summary rendering for the three output modes.

use pipeline::{DocumentFailure, PipelineEvent, PipelineStats};

#[derive(Debug, clap::ValueEnum, Copy, Clone, PartialEq)]
pub enum OutputMode {
    /// Human-readable lines.
    Text,
    /// One JSON event per line, tagged by `type`.
    Json,
    /// Failure and summary tables at the end of the run.
    Table,
}

pub struct Reporter {
    mode: OutputMode,
    adapter: String,
    quiet: bool,
    verbose: bool,
    progress: bool,
    failures: Vec<DocumentFailure>,
}

impl Reporter {
    pub fn new(
        mode: OutputMode,
        adapter: &str,
        quiet: bool,
        verbose: bool,
        progress: bool,
    ) -> Self {
        Self {
            mode,
            adapter: adapter.to_string(),
            quiet,
            verbose,
            progress,
            failures: Vec::new(),
        }
    }

    pub fn handle(&mut self, event: &PipelineEvent) {
        if let PipelineEvent::DocumentFailed {
            doc_id,
            error_type,
            error_message,
            retry_count,
            retryable,
            ..
        } = event
        {
            self.failures.push(DocumentFailure {
                doc_id: doc_id.clone(),
                error_type: error_type.clone(),
                error_message: error_message.clone(),
                retry_count: *retry_count,
                retryable: *retryable,
            });
        }

        match self.mode {
            OutputMode::Json => {
                let line =
                    serde_json::to_string(event).expect("pipeline events always serialize");
                println!("{line}");
            }
            OutputMode::Text => self.text_line(event),
            // Table mode holds everything for the end.
            OutputMode::Table => {}
        }
    }

    fn text_line(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::DocumentStarted { doc_id, .. } if self.verbose => {
                println!("started   {doc_id}");
            }
            PipelineEvent::DocumentCompleted { document, duration_ms, .. } if !self.quiet => {
                println!("completed {} ({duration_ms}ms)", document.doc_id);
            }
            PipelineEvent::DocumentFailed {
                doc_id,
                error_type,
                error_message,
                retry_count,
                retryable,
                ..
            } => {
                // One line per failed document, always.
                println!(
                    "failed    {} adapter={} error={error_type} retryable={retryable} attempt={retry_count}: {error_message}",
                    doc_id.as_deref().unwrap_or("<no doc id>"),
                    self.adapter,
                );
            }
            PipelineEvent::BatchProgress {
                completed,
                failed,
                in_flight,
                estimated_total,
                ..
            } if self.progress => {
                let total = estimated_total
                    .map(|t| format!("/{t}"))
                    .unwrap_or_default();
                println!("progress  {completed}{total} completed, {failed} failed, {in_flight} in flight");
            }
            PipelineEvent::AdapterStateChange { adapter, new_state, reason, .. }
                if self.verbose =>
            {
                println!(
                    "adapter   {adapter} -> {new_state}{}",
                    reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default()
                );
            }
            _ => {}
        }
    }

    /// Final accounting. Text and table modes print a summary; json mode
    /// already emitted the terminal BatchProgress event.
    pub fn summary(&self, stats: &PipelineStats, skipped_by_resume: u64, dry_run: bool) {
        match self.mode {
            OutputMode::Json => {}
            OutputMode::Text => {
                let skipped = stats.skipped + skipped_by_resume;
                println!(
                    "{}{} completed, {} failed, {} skipped in {:.1}s",
                    if dry_run { "[dry run] " } else { "" },
                    stats.completed,
                    stats.failed,
                    skipped,
                    stats.elapsed.as_secs_f64(),
                );
            }
            OutputMode::Table => {
                if !self.failures.is_empty() {
                    let mut table = comfy_table::Table::new();
                    table.set_header(vec![
                        "doc_id",
                        "adapter",
                        "error_type",
                        "message",
                        "retryable",
                        "attempt",
                    ]);
                    for failure in &self.failures {
                        table.add_row(vec![
                            failure.doc_id.clone().unwrap_or_else(|| "-".into()),
                            self.adapter.clone(),
                            failure.error_type.clone(),
                            failure.error_message.clone(),
                            failure.retryable.to_string(),
                            failure.retry_count.to_string(),
                        ]);
                    }
                    println!("{table}");
                }

                let mut table = comfy_table::Table::new();
                table.set_header(vec!["completed", "failed", "skipped", "elapsed"]);
                table.add_row(vec![
                    stats.completed.to_string(),
                    stats.failed.to_string(),
                    (stats.skipped + skipped_by_resume).to_string(),
                    format!("{:.1}s", stats.elapsed.as_secs_f64()),
                ]);
                println!("{table}");
            }
        }
    }
}

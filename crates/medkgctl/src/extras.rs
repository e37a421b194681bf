//! Registry of optional capabilities. A capability that is not compiled
//! into this build fails with a structured MissingDependency error carrying
//! the package, extras group, and install hint; nothing degrades to a
//! silent no-op.

use adapters::IngestError;
use fetch::{TelemetryEvent, TelemetryHandler};
use std::sync::Arc;

struct LogExporter;

impl TelemetryHandler for LogExporter {
    fn on_event(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::RequestStarted { url, method } => {
                tracing::debug!(target: "telemetry", %url, method, "request started");
            }
            TelemetryEvent::RequestCompleted {
                url,
                status,
                duration,
                bytes,
            } => {
                tracing::info!(
                    target: "telemetry",
                    %url,
                    status,
                    duration_ms = duration.as_millis() as u64,
                    bytes,
                    "request completed"
                );
            }
            TelemetryEvent::RequestRetried {
                url,
                attempt,
                reason,
                backoff,
            } => {
                tracing::warn!(
                    target: "telemetry",
                    %url,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    reason,
                    "request retried"
                );
            }
            TelemetryEvent::RequestFailed { url, kind, duration } => {
                tracing::warn!(
                    target: "telemetry",
                    %url,
                    ?kind,
                    duration_ms = duration.as_millis() as u64,
                    "request failed"
                );
            }
        }
    }
}

/// Enable the named telemetry exporter on the shared client.
///
/// `log` bridges request telemetry onto the tracing pipeline and is always
/// available. `otlp` requires the opentelemetry exporter stack, which this
/// packaging does not include.
pub fn enable_telemetry_exporter(name: &str, client: &fetch::Client) -> Result<(), IngestError> {
    match name {
        "log" => {
            client.subscribe_telemetry(Arc::new(LogExporter));
            Ok(())
        }
        "otlp" => Err(IngestError::MissingDependency {
            feature: "OTLP telemetry export",
            package: "opentelemetry-otlp",
            extras_group: "observability",
            install_hint: "install the observability build of medkgctl to export OTLP",
        }),
        other => Err(IngestError::Schema {
            url: String::new(),
            detail: format!("unknown telemetry exporter '{other}' (expected: log, otlp)"),
        }),
    }
}

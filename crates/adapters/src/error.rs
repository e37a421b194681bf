use models::ValidationError;

/// The ingestion error taxonomy. Transport, HTTP status, decode, and
/// rate-limit failures arrive wrapped from the fetch crate; the remaining
/// variants originate here. Classification is decided by `classify()` alone;
/// adapters and the pipeline both consult it and neither re-derives it.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] fetch::Error),

    /// The response's top-level structure does not match the shape this
    /// adapter's boundary expects. Terminal.
    #[error("response shape mismatch from {url}: {detail}")]
    Schema { url: String, detail: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A pipeline-imposed deadline elapsed. Reported as a timeout transport
    /// error; retryable.
    #[error("{stage} exceeded its deadline of {timeout:?}")]
    Timeout {
        stage: &'static str,
        timeout: std::time::Duration,
    },

    #[error("unknown adapter '{name}'; known adapters: {}", known.join(", "))]
    UnknownAdapter { name: String, known: Vec<String> },

    /// An optional capability was requested but its dependency is not
    /// compiled in. Carries everything the operator needs to fix it.
    #[error(
        "{feature} requires the optional '{package}' dependency \
         (extras group '{extras_group}'): {install_hint}"
    )]
    MissingDependency {
        feature: &'static str,
        package: &'static str,
        extras_group: &'static str,
        install_hint: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retryable,
    Terminal,
}

/// The single classification consulted by adapters and the pipeline:
/// transport failures, retryable statuses, and rate limiting are worth
/// retrying; shape and semantic failures never are.
pub fn classify(error: &IngestError) -> Disposition {
    match error {
        IngestError::Fetch(err) if err.retryable() => Disposition::Retryable,
        IngestError::Timeout { .. } => Disposition::Retryable,
        _ => Disposition::Terminal,
    }
}

/// Canonical error-type name, as surfaced in events, ledger records, and
/// user-visible failure lines.
pub fn error_type(error: &IngestError) -> &'static str {
    match error {
        IngestError::Fetch(err) => match err.kind() {
            fetch::ErrorKind::Transport | fetch::ErrorKind::Timeout => "TransportError",
            fetch::ErrorKind::HttpStatus => "HttpStatusError",
            fetch::ErrorKind::Decode => "DecodeError",
            fetch::ErrorKind::RateLimited => "RateLimited",
        },
        IngestError::Schema { .. } => "SchemaError",
        IngestError::Validation(_) => "ValidationError",
        IngestError::Timeout { .. } => "TransportError",
        IngestError::UnknownAdapter { .. } => "UnknownAdapter",
        IngestError::MissingDependency { .. } => "MissingDependency",
    }
}

/// Structured form for ledger records.
pub fn error_info(error: &IngestError) -> ledger::ErrorInfo {
    ledger::ErrorInfo {
        error_type: error_type(error).to_string(),
        message: error.to_string(),
        retryable: classify(error) == Disposition::Retryable,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn http_error(status: u16, retryable: bool) -> IngestError {
        IngestError::Fetch(fetch::Error::HttpStatus {
            url: "https://api.example.org/x".into(),
            status,
            elapsed: std::time::Duration::from_millis(10),
            retryable,
            retry_after: None,
        })
    }

    #[test]
    fn transport_and_429_retry_schema_and_validation_do_not() {
        assert_eq!(classify(&http_error(503, true)), Disposition::Retryable);
        assert_eq!(classify(&http_error(404, false)), Disposition::Terminal);

        let schema = IngestError::Schema {
            url: "https://api.example.org/x".into(),
            detail: "expected top-level object".into(),
        };
        assert_eq!(classify(&schema), Disposition::Terminal);
        assert_eq!(error_type(&schema), "SchemaError");

        let validation = IngestError::Validation(ValidationError::InvalidMetadata {
            field: "source_version",
        });
        assert_eq!(classify(&validation), Disposition::Terminal);
        assert_eq!(error_type(&validation), "ValidationError");
    }

    #[test]
    fn missing_dependency_is_structured() {
        let err = IngestError::MissingDependency {
            feature: "telemetry export",
            package: "opentelemetry-otlp",
            extras_group: "observability",
            install_hint: "rebuild with `--features otlp-export`",
        };
        assert_eq!(error_type(&err), "MissingDependency");
        let message = err.to_string();
        assert!(message.contains("opentelemetry-otlp"));
        assert!(message.contains("observability"));
    }
}

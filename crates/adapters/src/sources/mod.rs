//! First-party source adapters, grouped by family. Each adapter documents
//! the upstream API and version its boundary coercion assumes; the wire
//! structs beside each fetch are that documentation in executable form.

pub mod clinical;
pub mod guidelines;
pub mod literature;
pub mod terminology;

use crate::adapter::Fetched;
use crate::{IngestError, Parameters, Registry};
use chrono::Utc;
use models::DocumentMetadata;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

pub fn register_all(registry: &mut Registry) {
    use clinical::*;
    use guidelines::*;
    use literature::*;
    use terminology::*;

    registry.register(ClinicalTrialsAdapter::NAME, |deps| {
        Arc::new(ClinicalTrialsAdapter::new(&deps))
    });
    registry.register(OpenFdaAdapter::NAME, |deps| {
        Arc::new(OpenFdaAdapter::new(&deps))
    });
    registry.register(DailyMedAdapter::NAME, |deps| {
        Arc::new(DailyMedAdapter::new(&deps))
    });
    registry.register(RxNormAdapter::NAME, |deps| {
        Arc::new(RxNormAdapter::new(&deps))
    });
    registry.register(GudidAdapter::NAME, |deps| Arc::new(GudidAdapter::new(&deps)));
    registry.register(PubMedAdapter::NAME, |deps| Arc::new(PubMedAdapter::new(&deps)));
    registry.register(PmcAdapter::NAME, |deps| Arc::new(PmcAdapter::new(&deps)));
    registry.register(MedRxivAdapter::NAME, |deps| {
        Arc::new(MedRxivAdapter::new(&deps))
    });
    registry.register(MeshAdapter::NAME, |deps| Arc::new(MeshAdapter::new(&deps)));
    registry.register(UmlsAdapter::NAME, |deps| Arc::new(UmlsAdapter::new(&deps)));
    registry.register(LoincAdapter::NAME, |deps| Arc::new(LoincAdapter::new(&deps)));
    registry.register(Icd11Adapter::NAME, |deps| Arc::new(Icd11Adapter::new(&deps)));
    registry.register(SnomedAdapter::NAME, |deps| Arc::new(SnomedAdapter::new(&deps)));
    registry.register(NiceAdapter::NAME, |deps| Arc::new(NiceAdapter::new(&deps)));
    registry.register(CdcAdapter::NAME, |deps| Arc::new(CdcAdapter::new(&deps)));
    registry.register(WhoGhoAdapter::NAME, |deps| Arc::new(WhoGhoAdapter::new(&deps)));
    registry.register(OpenPrescribingAdapter::NAME, |deps| {
        Arc::new(OpenPrescribingAdapter::new(&deps))
    });
}

pub(crate) fn schema_error(url: &str, detail: impl Into<String>) -> IngestError {
    IngestError::Schema {
        url: url.to_string(),
        detail: detail.into(),
    }
}

pub(crate) fn parse_url(raw: String) -> Result<Url, IngestError> {
    Url::parse(&raw).map_err(|err| schema_error(&raw, format!("invalid request URL: {err}")))
}

/// Wrap a coerced record with its provenance. The content hash is taken over
/// the record's own raw JSON, so each record of a multi-record page hashes
/// independently and deterministically.
pub(crate) fn fetched<P>(
    payload: P,
    raw: &Value,
    source_version: Option<String>,
    uri: Option<String>,
) -> Fetched<P> {
    let bytes = serde_json::to_vec(raw).expect("JSON values always serialize");
    Fetched {
        payload,
        content_hash: models::Document::content_hash(&bytes),
        source_version,
        uri,
    }
}

/// Standard Document metadata assembly for parse() implementations.
pub(crate) fn metadata(source_version: Option<String>, content_hash: String) -> DocumentMetadata {
    DocumentMetadata {
        ingested_at: Utc::now(),
        source_version: source_version.unwrap_or_else(|| "unversioned".to_string()),
        content_hash,
        extra: Default::default(),
    }
}

pub(crate) fn str_param(params: &Parameters, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn u32_param(params: &Parameters, key: &str) -> Option<u32> {
    params.get(key).and_then(Value::as_u64).map(|n| n as u32)
}

pub(crate) fn u64_param(params: &Parameters, key: &str) -> Option<u64> {
    params.get(key).and_then(Value::as_u64)
}

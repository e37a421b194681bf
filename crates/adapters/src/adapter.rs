use crate::{IngestError, Parameters};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use models::{AdapterPayload, Document, ValidationError};
use std::collections::BTreeMap;

/// Dependencies injected into adapter factories at registry build time.
#[derive(Clone)]
pub struct Dependencies {
    pub client: fetch::Client,
    /// Source-specific API keys and tokens, keyed by the name each adapter
    /// documents (e.g. `NCBI_API_KEY`, `UMLS_API_KEY`).
    pub secrets: BTreeMap<String, String>,
}

impl Dependencies {
    pub fn new(client: fetch::Client) -> Self {
        Self {
            client,
            secrets: BTreeMap::new(),
        }
    }

    pub fn secret(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(String::as_str)
    }
}

/// Date window and paging hints for `--auto` sweeps.
#[derive(Debug, Clone, Default)]
pub struct SweepWindow {
    pub start_date: Option<chrono::NaiveDate>,
    pub end_date: Option<chrono::NaiveDate>,
    pub page_size: Option<u32>,
}

/// One raw record produced by `fetch`: the typed payload plus the provenance
/// that `parse` folds into Document metadata. The hash is taken over the raw
/// response bytes at the fetch boundary so buffers need not be retained.
#[derive(Debug, Clone)]
pub struct Fetched<P> {
    pub payload: P,
    pub content_hash: String,
    pub source_version: Option<String>,
    pub uri: Option<String>,
}

impl<P> Fetched<P> {
    pub fn map_payload<Q>(self, f: impl FnOnce(P) -> Q) -> Fetched<Q> {
        Fetched {
            payload: f(self.payload),
            content_hash: self.content_hash,
            source_version: self.source_version,
            uri: self.uri,
        }
    }
}

pub type FetchStream<P> = BoxStream<'static, Result<Fetched<P>, IngestError>>;

/// The per-source contract. An adapter knows how to fetch raw typed records
/// for a parameter object, parse each into a Document, and validate the
/// result. Fetching is lazy: the returned stream paginates internally,
/// honors rate limits through the shared client, and surfaces classified
/// errors as items.
pub trait Adapter: Send + Sync + 'static {
    type Payload: Into<AdapterPayload>
        + TryFrom<AdapterPayload, Error = ValidationError>
        + Send
        + 'static;

    fn name(&self) -> &'static str;

    /// The doc_id implied by a parameter object, when the parameters address
    /// exactly one record. Enables driver-side resume filtering and full
    /// per-document ledger histories; sweep parameters return None.
    fn document_id(&self, params: &Parameters) -> Option<String>;

    /// Produce parameter objects for an `--auto` run. The default is a
    /// single sweep carrying the window hints; adapters with windowed
    /// upstreams override to split the window.
    fn auto_parameters(&self, window: &SweepWindow) -> Result<Vec<Parameters>, IngestError> {
        Ok(vec![window_params(window)])
    }

    fn fetch(&self, params: Parameters) -> FetchStream<Self::Payload>;

    /// Deterministic: the same fetched record yields the same doc_id, uri,
    /// content, and content_hash.
    fn parse(&self, fetched: Fetched<Self::Payload>) -> Result<Document, IngestError>;

    /// Semantic validation of a parsed Document. Narrows `document.raw`
    /// through the payload union and checks value-level invariants; never
    /// mutates.
    fn validate(&self, document: &Document) -> Result<(), ValidationError>;
}

pub(crate) fn window_params(window: &SweepWindow) -> Parameters {
    let mut params = Parameters::new();
    if let Some(start) = window.start_date {
        params.insert("start_date".into(), start.to_string().into());
    }
    if let Some(end) = window.end_date {
        params.insert("end_date".into(), end.to_string().into());
    }
    if let Some(page_size) = window.page_size {
        params.insert("page_size".into(), page_size.into());
    }
    params
}

/// Object-safe erasure of Adapter, so the registry and pipeline can hold
/// heterogeneous adapters uniformly. Payloads widen into the union on the
/// way out of fetch and narrow fallibly on the way into parse; a family
/// mismatch is a ValidationError, never an unchecked access.
pub trait DynAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn document_id(&self, params: &Parameters) -> Option<String>;
    fn auto_parameters(&self, window: &SweepWindow) -> Result<Vec<Parameters>, IngestError>;
    fn fetch(&self, params: Parameters) -> FetchStream<AdapterPayload>;
    fn parse(&self, fetched: Fetched<AdapterPayload>) -> Result<Document, IngestError>;
    fn validate(&self, document: &Document) -> Result<(), ValidationError>;
}

impl std::fmt::Debug for dyn DynAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynAdapter").field("name", &self.name()).finish()
    }
}

impl<A: Adapter> DynAdapter for A {
    fn name(&self) -> &'static str {
        Adapter::name(self)
    }

    fn document_id(&self, params: &Parameters) -> Option<String> {
        Adapter::document_id(self, params)
    }

    fn auto_parameters(&self, window: &SweepWindow) -> Result<Vec<Parameters>, IngestError> {
        Adapter::auto_parameters(self, window)
    }

    fn fetch(&self, params: Parameters) -> FetchStream<AdapterPayload> {
        Box::pin(Adapter::fetch(self, params).map_ok(|fetched| fetched.map_payload(Into::into)))
    }

    fn parse(&self, fetched: Fetched<AdapterPayload>) -> Result<Document, IngestError> {
        let Fetched {
            payload,
            content_hash,
            source_version,
            uri,
        } = fetched;
        let payload = A::Payload::try_from(payload).map_err(IngestError::Validation)?;
        Adapter::parse(
            self,
            Fetched {
                payload,
                content_hash,
                source_version,
                uri,
            },
        )
    }

    fn validate(&self, document: &Document) -> Result<(), ValidationError> {
        Adapter::validate(self, document)
    }
}

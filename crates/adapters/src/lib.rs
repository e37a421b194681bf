mod adapter;
mod error;
mod paginate;
mod registry;
pub mod sources;

pub use adapter::{Adapter, Dependencies, DynAdapter, FetchStream, Fetched, SweepWindow};
pub use error::{classify, error_info, error_type, Disposition, IngestError};
pub use paginate::pages;
pub use registry::Registry;

/// One parameter object for an adapter invocation: a JSON mapping, as read
/// from a `--batch` NDJSON line or produced by `--auto`.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

mod entry;
mod ledger;
mod state;

pub use entry::{AuditRecord, ErrorInfo, LedgerEntry};
pub use ledger::{Ledger, LedgerConfig};
pub use state::{LedgerState, RETRYABLE_STATES, TERMINAL_STATES};

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An attempted transition outside the state machine. This is a
    /// programming error in the caller and must never be swallowed.
    #[error("invalid ledger transition for {doc_id}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        doc_id: String,
        from: Option<LedgerState>,
        to: LedgerState,
    },

    /// The snapshot or delta log on disk is unreadable or inconsistent.
    /// Fatal to the process; requires operator action.
    #[error("ledger corruption in {path}: {detail}")]
    Corruption { path: PathBuf, detail: String },

    #[error("ledger I/O failure on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Error {
        let path = path.into();
        move |source| Error::Io { path, source }
    }
}

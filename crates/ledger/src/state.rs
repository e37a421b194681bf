use serde::{Deserialize, Serialize};

/// Per-document lifecycle state. This enum is the sole accepted type at
/// every ledger boundary; serialized forms use the enum names and unknown
/// names are deserialization errors. There is no string coercion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerState {
    Pending,
    Fetching,
    Parsing,
    Validating,
    Writing,
    Completed,
    FailedRetryable,
    Retrying,
    FailedTerminal,
    Skipped,
}

/// States from which no transition is permitted.
pub const TERMINAL_STATES: [LedgerState; 3] = [
    LedgerState::Completed,
    LedgerState::FailedTerminal,
    LedgerState::Skipped,
];

/// States eligible to transition into Retrying.
pub const RETRYABLE_STATES: [LedgerState; 1] = [LedgerState::FailedRetryable];

impl LedgerState {
    /// The permissible successor states. Total over non-terminal states;
    /// terminal states map to the empty set.
    pub fn successors(self) -> &'static [LedgerState] {
        use LedgerState::*;
        match self {
            Pending => &[Fetching, Skipped],
            Fetching => &[Parsing, FailedRetryable, FailedTerminal, Skipped],
            Parsing => &[Validating, FailedTerminal],
            Validating => &[Writing, FailedTerminal],
            Writing => &[Completed, FailedRetryable, FailedTerminal],
            FailedRetryable => &[Retrying, FailedTerminal],
            Retrying => &[Fetching, FailedTerminal],
            Completed | FailedTerminal | Skipped => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }

    pub fn can_transition_to(self, next: LedgerState) -> bool {
        self.successors().contains(&next)
    }

    /// The single validity rule for recording `next` over `prior`, shared by
    /// the live write path and delta replay. Within a lifecycle the
    /// transition map governs; a fresh Pending record is additionally
    /// permitted over a terminal entry, beginning a new lifecycle (re-runs
    /// of failed documents, forced re-ingestion).
    pub fn may_record(prior: Option<LedgerState>, next: LedgerState) -> bool {
        match prior {
            None => next == LedgerState::Pending,
            Some(state) if next == LedgerState::Pending => state.is_terminal(),
            Some(state) => state.can_transition_to(next),
        }
    }

    /// Canonical name, identical to the serialized form.
    pub fn name(self) -> &'static str {
        use LedgerState::*;
        match self {
            Pending => "PENDING",
            Fetching => "FETCHING",
            Parsing => "PARSING",
            Validating => "VALIDATING",
            Writing => "WRITING",
            Completed => "COMPLETED",
            FailedRetryable => "FAILED_RETRYABLE",
            Retrying => "RETRYING",
            FailedTerminal => "FAILED_TERMINAL",
            Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for LedgerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use LedgerState::*;

    const ALL: [LedgerState; 10] = [
        Pending,
        Fetching,
        Parsing,
        Validating,
        Writing,
        Completed,
        FailedRetryable,
        Retrying,
        FailedTerminal,
        Skipped,
    ];

    #[test]
    fn terminal_states_have_no_successors() {
        for state in TERMINAL_STATES {
            assert!(state.is_terminal());
            assert!(state.successors().is_empty());
        }
    }

    #[test]
    fn only_failed_retryable_reaches_retrying() {
        for state in ALL {
            let reaches = state.can_transition_to(Retrying);
            assert_eq!(reaches, RETRYABLE_STATES.contains(&state), "{state}");
        }
    }

    #[test]
    fn happy_path_is_valid() {
        let path = [Pending, Fetching, Parsing, Validating, Writing, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn serde_uses_names_and_rejects_unknown() {
        let json = serde_json::to_string(&FailedRetryable).unwrap();
        assert_eq!(json, r#""FAILED_RETRYABLE""#);

        let back: LedgerState = serde_json::from_str(r#""COMPLETED""#).unwrap();
        assert_eq!(back, Completed);

        assert!(serde_json::from_str::<LedgerState>(r#""completed""#).is_err());
        assert!(serde_json::from_str::<LedgerState>(r#""RUNNING""#).is_err());
    }
}

//! End-to-end tests of ledger durability: record/replay, snapshot+delta
//! equivalence, compaction, and transition enforcement.

use ledger::{ErrorInfo, Ledger, LedgerConfig, LedgerState};
use std::collections::BTreeMap;
use std::time::Duration;

fn config(dir: &tempfile::TempDir) -> LedgerConfig {
    LedgerConfig::in_dir(dir.path())
}

async fn drive_to_completed(ledger: &Ledger, doc_id: &str, adapter: &str) {
    use LedgerState::*;
    for state in [Pending, Fetching, Parsing, Validating, Writing, Completed] {
        ledger.transition(doc_id, adapter, state).await.unwrap();
    }
}

#[tokio::test]
async fn records_and_reads_back() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(config(&dir)).await.unwrap();

    let entry = ledger
        .record(
            "pmid:12345",
            "pubmed",
            LedgerState::Pending,
            None,
            Some(BTreeMap::from([(
                "pmid".to_string(),
                serde_json::json!("12345"),
            )])),
        )
        .await
        .unwrap();

    assert_eq!(entry.state, LedgerState::Pending);
    assert_eq!(entry.attempt, 0);
    assert_eq!(ledger.get("pmid:12345").unwrap(), entry);
    assert!(ledger.get("pmid:99999").is_none());
}

#[tokio::test]
async fn rejects_illegal_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(config(&dir)).await.unwrap();

    // The first record for a doc must be Pending.
    let err = ledger
        .transition("nct:NCT01234567", "clinicaltrials", LedgerState::Completed)
        .await
        .unwrap_err();
    assert!(matches!(err, ledger::Error::InvalidStateTransition { .. }));

    drive_to_completed(&ledger, "nct:NCT01234567", "clinicaltrials").await;

    // Terminal states admit no transitions, including into Skipped.
    let err = ledger
        .transition("nct:NCT01234567", "clinicaltrials", LedgerState::Skipped)
        .await
        .unwrap_err();
    assert!(matches!(err, ledger::Error::InvalidStateTransition { .. }));

    // The failed write did not disturb the entry.
    assert_eq!(
        ledger.get("nct:NCT01234567").unwrap().state,
        LedgerState::Completed
    );
}

#[tokio::test]
async fn retry_loop_increments_attempt() {
    use LedgerState::*;
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(config(&dir)).await.unwrap();

    let error = ErrorInfo {
        error_type: "HttpStatusError".into(),
        message: "503 from upstream".into(),
        retryable: true,
    };

    ledger.transition("pmid:1", "pubmed", Pending).await.unwrap();
    ledger.transition("pmid:1", "pubmed", Fetching).await.unwrap();
    for expected_attempt in 1..=2u32 {
        ledger
            .record("pmid:1", "pubmed", FailedRetryable, Some(error.clone()), None)
            .await
            .unwrap();
        let entry = ledger.transition("pmid:1", "pubmed", Retrying).await.unwrap();
        assert_eq!(entry.attempt, expected_attempt);
        ledger.transition("pmid:1", "pubmed", Fetching).await.unwrap();
    }

    let history = ledger.history("pmid:1").await.unwrap();
    let states: Vec<LedgerState> = history.iter().map(|r| r.new_state).collect();
    assert_eq!(
        states,
        vec![
            Pending,
            Fetching,
            FailedRetryable,
            Retrying,
            Fetching,
            FailedRetryable,
            Retrying,
            Fetching
        ]
    );
    // No Retrying without a preceding FailedRetryable.
    for (i, record) in history.iter().enumerate() {
        if record.new_state == Retrying {
            assert_eq!(history[i - 1].new_state, FailedRetryable);
        }
    }
}

#[tokio::test]
async fn snapshot_plus_delta_equals_full_history() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(config(&dir)).await.unwrap();

    // A batch of completed documents, then snapshot, then more activity.
    for n in 0..20 {
        drive_to_completed(&ledger, &format!("pmid:{n}"), "pubmed").await;
    }
    ledger.snapshot().await.unwrap();

    for n in 20..30 {
        drive_to_completed(&ledger, &format!("pmid:{n}"), "pubmed").await;
    }
    ledger
        .transition("pmid:999", "pubmed", LedgerState::Pending)
        .await
        .unwrap();

    let before: Vec<_> = {
        let mut entries = ledger.entries(None, None);
        entries.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        entries
    };
    let history_before = ledger.history("pmid:5").await.unwrap();
    drop(ledger);

    // Restart prefers snapshot + delta; state and history must be identical.
    let reopened = Ledger::open(config(&dir)).await.unwrap();
    let after: Vec<_> = {
        let mut entries = reopened.entries(None, None);
        entries.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        entries
    };
    assert_eq!(before, after);
    assert_eq!(reopened.history("pmid:5").await.unwrap(), history_before);
    assert_eq!(reopened.get("pmid:999").unwrap().state, LedgerState::Pending);
}

#[tokio::test]
async fn compact_discards_history_and_rotates_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(config(&dir)).await.unwrap();

    drive_to_completed(&ledger, "pmid:1", "pubmed").await;
    ledger.snapshot().await.unwrap();
    drive_to_completed(&ledger, "pmid:2", "pubmed").await;
    ledger.compact().await.unwrap();

    // Archived segments are gone, pre-compaction history with them.
    assert!(ledger.history("pmid:1").await.unwrap().is_empty());

    // But current state survives a restart.
    drop(ledger);
    let reopened = Ledger::open(config(&dir)).await.unwrap();
    assert_eq!(reopened.get("pmid:1").unwrap().state, LedgerState::Completed);
    assert_eq!(reopened.get("pmid:2").unwrap().state, LedgerState::Completed);

    // Two snapshots so far: the live one plus one rotation.
    assert!(dir.path().join("snapshot.json").exists());
    assert!(dir.path().join("snapshot.json.1").exists());
}

#[tokio::test]
async fn snapshot_retention_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(&dir);
    cfg.retain_snapshots = 2;
    let ledger = Ledger::open(cfg).await.unwrap();

    ledger
        .transition("pmid:1", "pubmed", LedgerState::Pending)
        .await
        .unwrap();
    for _ in 0..5 {
        ledger.snapshot().await.unwrap();
    }

    assert!(dir.path().join("snapshot.json").exists());
    assert!(dir.path().join("snapshot.json.1").exists());
    assert!(dir.path().join("snapshot.json.2").exists());
    assert!(!dir.path().join("snapshot.json.3").exists());
}

#[tokio::test]
async fn stuck_reports_old_non_terminal_entries() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(config(&dir)).await.unwrap();

    ledger
        .transition("pmid:1", "pubmed", LedgerState::Pending)
        .await
        .unwrap();
    ledger
        .transition("pmid:1", "pubmed", LedgerState::Fetching)
        .await
        .unwrap();
    drive_to_completed(&ledger, "pmid:2", "pubmed").await;

    // Everything is fresh; nothing is stuck at a 1h threshold.
    assert!(ledger.stuck(Duration::from_secs(3600)).is_empty());

    // At a zero threshold the in-flight fetch shows up, the completed
    // document does not.
    let stuck = ledger.stuck(Duration::ZERO);
    assert_eq!(stuck, vec!["pmid:1".to_string()]);
}

#[tokio::test]
async fn corrupt_delta_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    {
        let ledger = Ledger::open(config(&dir)).await.unwrap();
        drive_to_completed(&ledger, "pmid:1", "pubmed").await;
    }

    // A torn write leaves a line that is not a complete JSON record.
    let log = dir.path().join("ledger.log");
    let mut contents = std::fs::read_to_string(&log).unwrap();
    contents.push_str("{\"doc_id\":\"pmid:2\",\"new_st");
    std::fs::write(&log, contents).unwrap();

    let err = Ledger::open(config(&dir)).await.unwrap_err();
    assert!(matches!(err, ledger::Error::Corruption { .. }), "{err}");
}

#[tokio::test]
async fn entries_filters_by_state_and_adapter() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(config(&dir)).await.unwrap();

    drive_to_completed(&ledger, "pmid:1", "pubmed").await;
    ledger
        .transition("nct:NCT01234567", "clinicaltrials", LedgerState::Pending)
        .await
        .unwrap();

    assert_eq!(ledger.entries(None, None).len(), 2);
    assert_eq!(ledger.entries(Some(LedgerState::Completed), None).len(), 1);
    assert_eq!(ledger.entries(None, Some("clinicaltrials")).len(), 1);
    assert_eq!(
        ledger.entries(Some(LedgerState::Pending), Some("pubmed")).len(),
        0
    );
    assert_eq!(
        ledger.documents_in_state(LedgerState::Completed),
        vec!["pmid:1".to_string()]
    );
}

#[tokio::test]
async fn terminal_entries_accept_a_fresh_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(config(&dir)).await.unwrap();

    use LedgerState::*;
    for state in [Pending, Fetching, FailedRetryable, Retrying, Fetching, FailedRetryable] {
        ledger.transition("pmid:1", "pubmed", state).await.unwrap();
    }
    ledger
        .transition("pmid:1", "pubmed", FailedTerminal)
        .await
        .unwrap();

    // A re-run begins over: Pending is accepted and the attempt counter
    // starts from zero, while mid-lifecycle states are still rejected.
    let entry = ledger.transition("pmid:1", "pubmed", Pending).await.unwrap();
    assert_eq!(entry.attempt, 0);
    let err = ledger
        .transition("pmid:1", "pubmed", Completed)
        .await
        .unwrap_err();
    assert!(matches!(err, ledger::Error::InvalidStateTransition { .. }));

    // The replayed file accepts the same sequence.
    drop(ledger);
    let reopened = Ledger::open(config(&dir)).await.unwrap();
    assert_eq!(reopened.get("pmid:1").unwrap().state, Pending);
}

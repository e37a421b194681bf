use crate::entry::{AuditRecord, ErrorInfo, LedgerEntry};
use crate::state::LedgerState;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// On-disk snapshot: full dump of current entries, paired with the delta log
/// of audit records appended since it was written.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    metadata: SnapshotMetadata,
    entries: BTreeMap<String, LedgerEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMetadata {
    created_at: DateTime<Utc>,
    entry_count: usize,
    schema_version: u32,
}

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// The live append-only delta log (NDJSON audit records).
    pub log_path: PathBuf,
    /// The snapshot file. Rotated copies live beside it as `<name>.1`, ….
    pub snapshot_path: PathBuf,
    /// How many rotated snapshots to retain.
    pub retain_snapshots: usize,
}

impl LedgerConfig {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            log_path: dir.join("ledger.log"),
            snapshot_path: dir.join("snapshot.json"),
            retain_snapshots: 7,
        }
    }
}

/// The durable, single source of truth for per-document lifecycle.
///
/// Writes serialize through one writer lock around validate + append + fsync,
/// so transitions for any doc_id are globally ordered and durable before the
/// caller proceeds. Reads are served from the in-memory index and never touch
/// disk. Initialization replays snapshot + delta, never full history.
pub struct Ledger {
    config: LedgerConfig,
    index: RwLock<HashMap<String, LedgerEntry>>,
    writer: tokio::sync::Mutex<Writer>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").field("config", &self.config).finish_non_exhaustive()
    }
}

struct Writer {
    file: tokio::fs::File,
    /// Clamp for non-decreasing timestamps across records.
    last_ts: DateTime<Utc>,
    /// Sequence number of the most recently archived log segment.
    segment_seq: u64,
}

impl Ledger {
    /// Open (or create) a ledger. When a snapshot exists, initialization is
    /// O(snapshot entries + delta entries); otherwise the retained log
    /// segments are replayed from the beginning.
    pub async fn open(config: LedgerConfig) -> Result<Self> {
        if let Some(parent) = config.log_path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::io(parent))?;
        }

        let mut index: HashMap<String, LedgerEntry> = HashMap::new();
        let segments = archived_segments(&config.log_path)?;

        if config.snapshot_path.exists() {
            let snapshot = read_snapshot(&config.snapshot_path)?;
            index.extend(snapshot.entries);
            replay_log(&config.log_path, &mut index)?;
        } else {
            for (_, segment) in &segments {
                replay_log(segment, &mut index)?;
            }
            replay_log(&config.log_path, &mut index)?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_path)
            .await
            .map_err(Error::io(&config.log_path))?;

        let last_ts = index
            .values()
            .map(|entry| entry.updated_at)
            .max()
            .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC);
        let segment_seq = segments.last().map(|(seq, _)| *seq).unwrap_or(0);

        tracing::debug!(
            entries = index.len(),
            segments = segments.len(),
            "opened ledger"
        );

        Ok(Self {
            config,
            index: RwLock::new(index),
            writer: tokio::sync::Mutex::new(Writer {
                file,
                last_ts,
                segment_seq,
            }),
        })
    }

    /// Record a state transition. Validates against the transition map,
    /// appends the audit record durably, then updates the in-memory index.
    /// The first record for a doc_id must be Pending.
    pub async fn record(
        &self,
        doc_id: &str,
        adapter: &str,
        state: LedgerState,
        error: Option<ErrorInfo>,
        metadata: Option<BTreeMap<String, serde_json::Value>>,
    ) -> Result<LedgerEntry> {
        let mut writer = self.writer.lock().await;

        let prior = self.index.read().unwrap().get(doc_id).cloned();
        if !LedgerState::may_record(prior.as_ref().map(|p| p.state), state) {
            return Err(Error::InvalidStateTransition {
                doc_id: doc_id.to_string(),
                from: prior.map(|p| p.state),
                to: state,
            });
        }

        let timestamp = Utc::now().max(writer.last_ts);
        let attempt = match &prior {
            Some(entry) if state == LedgerState::Retrying => entry.attempt + 1,
            // A fresh Pending lifecycle starts its retry count over.
            Some(_) if state == LedgerState::Pending => 0,
            Some(entry) => entry.attempt,
            None => 0,
        };
        let duration_ms = prior.as_ref().map(|p| {
            (timestamp - p.updated_at).num_milliseconds().max(0) as u64
        });

        let record = AuditRecord {
            doc_id: doc_id.to_string(),
            old_state: prior.as_ref().map(|p| p.state),
            new_state: state,
            timestamp,
            adapter: adapter.to_string(),
            attempt,
            error,
            duration_ms,
            parameters: metadata,
        };

        let mut line = serde_json::to_vec(&record).expect("audit records always serialize");
        line.push(b'\n');
        writer
            .file
            .write_all(&line)
            .await
            .map_err(Error::io(&self.config.log_path))?;
        writer
            .file
            .sync_data()
            .await
            .map_err(Error::io(&self.config.log_path))?;
        writer.last_ts = timestamp;

        let entry = record.into_entry();
        self.index
            .write()
            .unwrap()
            .insert(doc_id.to_string(), entry.clone());

        Ok(entry)
    }

    /// Sugar for a transition with no error or metadata.
    pub async fn transition(
        &self,
        doc_id: &str,
        adapter: &str,
        state: LedgerState,
    ) -> Result<LedgerEntry> {
        self.record(doc_id, adapter, state, None, None).await
    }

    pub fn get(&self, doc_id: &str) -> Option<LedgerEntry> {
        self.index.read().unwrap().get(doc_id).cloned()
    }

    /// Snapshot of current entries, optionally filtered by state and adapter.
    pub fn entries(
        &self,
        state: Option<LedgerState>,
        adapter: Option<&str>,
    ) -> Vec<LedgerEntry> {
        self.index
            .read()
            .unwrap()
            .values()
            .filter(|entry| state.map_or(true, |s| entry.state == s))
            .filter(|entry| adapter.map_or(true, |a| entry.adapter == a))
            .cloned()
            .collect()
    }

    pub fn documents_in_state(&self, state: LedgerState) -> Vec<String> {
        self.index
            .read()
            .unwrap()
            .values()
            .filter(|entry| entry.state == state)
            .map(|entry| entry.doc_id.clone())
            .collect()
    }

    /// Non-terminal doc_ids whose last update is older than `threshold`.
    pub fn stuck(&self, threshold: Duration) -> Vec<String> {
        let cutoff = Utc::now() - chrono::Duration::from_std(threshold).unwrap_or_default();
        self.index
            .read()
            .unwrap()
            .values()
            .filter(|entry| !entry.state.is_terminal() && entry.updated_at < cutoff)
            .map(|entry| entry.doc_id.clone())
            .collect()
    }

    /// Full retained transition history for a doc_id, oldest first. Replays
    /// the archived log segments plus the live delta from disk. `compact()`
    /// discards archived segments, and the history before it with them.
    pub async fn history(&self, doc_id: &str) -> Result<Vec<AuditRecord>> {
        // Hold the writer lock so the live log is quiescent while read.
        let _writer = self.writer.lock().await;

        let mut paths: Vec<PathBuf> = archived_segments(&self.config.log_path)?
            .into_iter()
            .map(|(_, path)| path)
            .collect();
        paths.push(self.config.log_path.clone());

        let mut records = Vec::new();
        for path in paths {
            for record in read_log(&path)? {
                let record = record?;
                if record.doc_id == doc_id {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// Write an atomic snapshot of current entries, rotate prior snapshots,
    /// and rotate the live log to an archived segment so subsequent records
    /// append to a fresh delta.
    pub async fn snapshot(&self) -> Result<PathBuf> {
        let mut writer = self.writer.lock().await;

        let entries: BTreeMap<String, LedgerEntry> = self
            .index
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let snapshot = SnapshotFile {
            metadata: SnapshotMetadata {
                created_at: Utc::now(),
                entry_count: entries.len(),
                schema_version: SCHEMA_VERSION,
            },
            entries,
        };

        rotate_snapshots(&self.config.snapshot_path, self.config.retain_snapshots)?;
        write_snapshot_atomic(&self.config.snapshot_path, &snapshot)?;

        // Archive the live log and start a fresh delta.
        writer
            .file
            .sync_all()
            .await
            .map_err(Error::io(&self.config.log_path))?;
        writer.segment_seq += 1;
        let archived = segment_path(&self.config.log_path, writer.segment_seq);
        std::fs::rename(&self.config.log_path, &archived)
            .map_err(Error::io(&self.config.log_path))?;
        writer.file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.log_path)
            .await
            .map_err(Error::io(&self.config.log_path))?;

        tracing::info!(
            path = %self.config.snapshot_path.display(),
            entries = snapshot.metadata.entry_count,
            "wrote ledger snapshot"
        );
        Ok(self.config.snapshot_path.clone())
    }

    /// Snapshot, then discard archived log segments. After compaction the
    /// on-disk state is the rotated snapshots plus an empty delta.
    pub async fn compact(&self) -> Result<()> {
        self.snapshot().await?;

        let _writer = self.writer.lock().await;
        for (_, segment) in archived_segments(&self.config.log_path)? {
            std::fs::remove_file(&segment).map_err(Error::io(&segment))?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().unwrap().is_empty()
    }
}

fn segment_path(log_path: &Path, seq: u64) -> PathBuf {
    let mut name = log_path.as_os_str().to_os_string();
    name.push(format!(".{seq}"));
    PathBuf::from(name)
}

/// Archived segments beside `log_path`, ordered by sequence number.
fn archived_segments(log_path: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let Some(parent) = log_path.parent() else {
        return Ok(Vec::new());
    };
    let Some(base) = log_path.file_name().and_then(|n| n.to_str()) else {
        return Ok(Vec::new());
    };
    if !parent.exists() {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    for dir_entry in std::fs::read_dir(parent).map_err(Error::io(parent))? {
        let dir_entry = dir_entry.map_err(Error::io(parent))?;
        let name = dir_entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(suffix) = name.strip_prefix(base).and_then(|s| s.strip_prefix('.')) else {
            continue;
        };
        if let Ok(seq) = suffix.parse::<u64>() {
            segments.push((seq, dir_entry.path()));
        }
    }
    segments.sort();
    Ok(segments)
}

fn read_snapshot(path: &Path) -> Result<SnapshotFile> {
    let file = std::fs::File::open(path).map_err(Error::io(path))?;
    let snapshot: SnapshotFile =
        serde_json::from_reader(std::io::BufReader::new(file)).map_err(|err| Error::Corruption {
            path: path.to_path_buf(),
            detail: err.to_string(),
        })?;
    if snapshot.metadata.schema_version != SCHEMA_VERSION {
        return Err(Error::Corruption {
            path: path.to_path_buf(),
            detail: format!(
                "unsupported snapshot schema version {}",
                snapshot.metadata.schema_version
            ),
        });
    }
    Ok(snapshot)
}

fn write_snapshot_atomic(path: &Path, snapshot: &SnapshotFile) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(Error::io(parent))?;

    serde_json::to_writer(&mut temp, snapshot).map_err(|err| Error::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::Other, err),
    })?;
    use std::io::Write;
    temp.write_all(b"\n").map_err(Error::io(path))?;
    temp.as_file().sync_all().map_err(Error::io(path))?;
    temp.persist(path)
        .map_err(|err| Error::io(path)(err.error))?;
    Ok(())
}

fn rotate_snapshots(path: &Path, retain: usize) -> Result<()> {
    if retain == 0 || !path.exists() {
        return Ok(());
    }
    // Shift <name>.k to <name>.k+1 from the oldest down, dropping overflow.
    let rotated = |k: usize| segment_path(path, k as u64);
    let overflow = rotated(retain);
    if overflow.exists() {
        std::fs::remove_file(&overflow).map_err(Error::io(&overflow))?;
    }
    for k in (1..retain).rev() {
        let from = rotated(k);
        if from.exists() {
            std::fs::rename(&from, rotated(k + 1)).map_err(Error::io(&from))?;
        }
    }
    std::fs::rename(path, rotated(1)).map_err(Error::io(path))?;
    Ok(())
}

/// Iterate audit records in a log file. Missing files read as empty.
fn read_log(path: &Path) -> Result<impl Iterator<Item = Result<AuditRecord>>> {
    use std::io::BufRead;

    let lines = match std::fs::File::open(path) {
        Ok(file) => std::io::BufReader::new(file).lines().collect::<Vec<_>>(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(Error::io(path)(err)),
    };

    let path = path.to_path_buf();
    Ok(lines
        .into_iter()
        .enumerate()
        .filter(|(_, line)| !matches!(line, Ok(l) if l.is_empty()))
        .map(move |(n, line)| {
            let line = line.map_err(Error::io(&path))?;
            serde_json::from_str::<AuditRecord>(&line).map_err(|err| Error::Corruption {
                path: path.clone(),
                detail: format!("line {}: {err}", n + 1),
            })
        }))
}

/// Replay a delta log into the index, validating that each record extends
/// the state the index currently holds.
fn replay_log(path: &Path, index: &mut HashMap<String, LedgerEntry>) -> Result<()> {
    for record in read_log(path)? {
        let record = record?;
        let prior_state = index.get(&record.doc_id).map(|entry| entry.state);
        if prior_state != record.old_state {
            return Err(Error::Corruption {
                path: path.to_path_buf(),
                detail: format!(
                    "audit record for {} expects prior state {:?} but index holds {:?}",
                    record.doc_id, record.old_state, prior_state
                ),
            });
        }
        if !LedgerState::may_record(prior_state, record.new_state) {
            return Err(Error::Corruption {
                path: path.to_path_buf(),
                detail: format!(
                    "illegal recorded transition for {}: {:?} -> {}",
                    record.doc_id, prior_state, record.new_state
                ),
            });
        }
        index.insert(record.doc_id.clone(), record.into_entry());
    }
    Ok(())
}

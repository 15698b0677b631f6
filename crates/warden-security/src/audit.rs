use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};
use warden_core::{WardenError, WardenResult};

/// File name of the JSONL sink inside the audit directory.
pub const AUDIT_FILE: &str = "audit.jsonl";

/// `prev_hash` of the first entry in a log.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Kind of state transition recorded by an [`AuditEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    /// An agent joined the registry.
    AgentRegistered,
    /// An agent left the registry.
    AgentDeregistered,
    /// A job was accepted.
    JobSubmitted,
    /// A job changed status.
    JobStatusChanged,
    /// Cancellation was requested.
    JobCancelled,
    /// A subtask was added to a job graph.
    SubtaskCreated,
    /// A subtask changed status.
    SubtaskStatusChanged,
    /// A subtask was handed to an agent.
    SubtaskDispatched,
    /// An agent call failed.
    ExecutionFailed,
    /// The agent's breaker refused the call.
    CircuitRejected,
    /// An agent's breaker changed state.
    CircuitTransition,
    /// An agent returned output.
    ResultReceived,
    /// A result was scored.
    ResultValidated,
    /// A result was assigned a tier.
    RiskClassified,
    /// A result was held for review.
    ApprovalRequested,
    /// A review decision was stored.
    ApprovalRecorded,
    /// A pending request was cancelled.
    ApprovalWithdrawn,
    /// A scope started drifting.
    DriftAlert,
    /// A drifting scope recovered.
    DriftCleared,
    /// A drift response was applied to an agent.
    DriftPolicyApplied,
}

impl AuditEvent {
    /// Parse the snake_case name used on the wire.
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

/// One immutable, sequentially numbered record in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the log, starting at 1.
    pub sequence: u64,
    /// When the entry was appended.
    pub timestamp: DateTime<Utc>,
    /// Job, subtask or agent the entry is about.
    pub entity_id: String,
    /// Owning job, when the entity belongs to one.
    pub job_id: Option<String>,
    /// What happened.
    pub event: AuditEvent,
    /// Snapshot of the state relevant to the transition.
    pub payload: serde_json::Value,
    /// Hash of the previous entry, or [`GENESIS_HASH`] for the first.
    pub prev_hash: String,
    /// SHA-256 over `prev_hash` and this entry's content.
    pub hash: String,
}

#[derive(Serialize)]
struct HashedFields<'a> {
    sequence: u64,
    timestamp: &'a DateTime<Utc>,
    entity_id: &'a str,
    job_id: Option<&'a str>,
    event: AuditEvent,
    payload: &'a serde_json::Value,
}

fn compute_hash(prev_hash: &str, fields: &HashedFields<'_>) -> WardenResult<String> {
    let body = serde_json::to_vec(fields)?;
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(&body);
    Ok(hex::encode(hasher.finalize()))
}

impl AuditEntry {
    /// Recompute this entry's hash from its content and `prev_hash`.
    pub fn recompute_hash(&self) -> WardenResult<String> {
        compute_hash(
            &self.prev_hash,
            &HashedFields {
                sequence: self.sequence,
                timestamp: &self.timestamp,
                entity_id: &self.entity_id,
                job_id: self.job_id.as_deref(),
                event: self.event,
                payload: &self.payload,
            },
        )
    }
}

/// Read-side filter for [`AuditLog::query`] and exports.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Only entries about this entity.
    pub entity_id: Option<String>,
    /// Only entries of this job.
    pub job_id: Option<String>,
    /// Only these events. Empty means any.
    pub events: Vec<AuditEvent>,
    /// Only entries after this sequence.
    pub since_sequence: Option<u64>,
}

impl AuditFilter {
    /// A filter that matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one entity.
    pub fn entity(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    /// Restrict to one job.
    pub fn job(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    /// Add an accepted event kind.
    pub fn event(mut self, event: AuditEvent) -> Self {
        self.events.push(event);
        self
    }

    /// Skip entries up to and including `sequence`.
    pub fn since(mut self, sequence: u64) -> Self {
        self.since_sequence = Some(sequence);
        self
    }

    /// Whether `entry` passes every configured criterion. A job filter also
    /// matches the job's own entries.
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(ref id) = self.entity_id {
            if &entry.entity_id != id {
                return false;
            }
        }
        if let Some(ref job) = self.job_id {
            let owned = entry.job_id.as_deref() == Some(job.as_str());
            if !owned && &entry.entity_id != job {
                return false;
            }
        }
        if !self.events.is_empty() && !self.events.contains(&entry.event) {
            return false;
        }
        if let Some(since) = self.since_sequence {
            if entry.sequence < since {
                return false;
            }
        }
        true
    }
}

enum SinkMessage {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Append-only, hash-chained audit log.
///
/// Sequence assignment and chaining happen under a single write lock, which
/// makes [`AuditLog::append`] the one serialization point of the engine.
/// Readers take the read side of the same lock. When created with a
/// directory, every entry is also written as one JSON line to `audit.jsonl`
/// by a background task, in sequence order.
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
    sink: Option<mpsc::UnboundedSender<SinkMessage>>,
}

impl AuditLog {
    /// An audit log that only keeps entries in memory.
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            sink: None,
        }
    }

    /// Create an AuditLog backed by `log_dir/audit.jsonl`. Spawns a background
    /// task that writes entries to disk, so it must be called inside a tokio runtime.
    pub fn new(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SinkMessage>();

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;

            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                error!(dir = %log_dir.display(), error = %e, "Cannot create audit directory");
            }
            let log_file = log_dir.join(AUDIT_FILE);
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .await
            {
                Ok(f) => Some(f),
                Err(e) => {
                    error!(file = %log_file.display(), error = %e, "Cannot open audit sink");
                    None
                }
            };

            while let Some(msg) = rx.recv().await {
                match msg {
                    SinkMessage::Line(line) => {
                        if let Some(f) = file.as_mut() {
                            if let Err(e) = f.write_all(line.as_bytes()).await {
                                error!(error = %e, "Audit sink write failed");
                            }
                        }
                    }
                    SinkMessage::Flush(ack) => {
                        if let Some(f) = file.as_mut() {
                            let _ = f.flush().await;
                        }
                        let _ = ack.send(());
                    }
                }
            }
        });

        Self {
            entries: RwLock::new(Vec::new()),
            sink: Some(tx),
        }
    }

    /// Append a new entry and return it. The only mutator of the log.
    pub fn append(
        &self,
        entity_id: impl Into<String>,
        job_id: Option<String>,
        event: AuditEvent,
        payload: serde_json::Value,
    ) -> WardenResult<AuditEntry> {
        let entity_id = entity_id.into();
        let mut entries = self.entries.write();

        let (sequence, prev_hash) = match entries.last() {
            Some(last) => (last.sequence + 1, last.hash.clone()),
            None => (1, GENESIS_HASH.to_string()),
        };
        let timestamp = Utc::now();
        let hash = compute_hash(
            &prev_hash,
            &HashedFields {
                sequence,
                timestamp: &timestamp,
                entity_id: &entity_id,
                job_id: job_id.as_deref(),
                event,
                payload: &payload,
            },
        )?;

        let entry = AuditEntry {
            sequence,
            timestamp,
            entity_id,
            job_id,
            event,
            payload,
            prev_hash,
            hash,
        };

        if let Some(ref tx) = self.sink {
            let line = format!("{}\n", serde_json::to_string(&entry)?);
            let _ = tx.send(SinkMessage::Line(line));
        }

        info!(
            sequence = entry.sequence,
            entity_id = %entry.entity_id,
            event = ?entry.event,
            "audit"
        );
        entries.push(entry.clone());
        Ok(entry)
    }

    /// Entries matching `filter`, in sequence order.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// A copy of every entry.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Sequence number of the newest entry, 0 when empty.
    pub fn last_sequence(&self) -> u64 {
        self.entries.read().last().map_or(0, |e| e.sequence)
    }

    /// Wait until every entry appended so far has reached the sink file.
    pub async fn flush(&self) {
        if let Some(ref tx) = self.sink {
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(SinkMessage::Flush(ack_tx)).is_ok() {
                let _ = ack_rx.await;
            }
        }
    }

    /// Write matching entries as JSON lines. Returns the number written.
    pub fn export_jsonl<W: Write>(&self, mut out: W, filter: &AuditFilter) -> WardenResult<usize> {
        let entries = self.query(filter);
        write_jsonl(&mut out, &entries)?;
        Ok(entries.len())
    }

    /// Check the in-memory chain.
    pub fn verify(&self) -> WardenResult<()> {
        verify_chain(&self.entries.read())
    }
}

/// Write entries as JSON lines.
pub fn write_jsonl<W: Write>(out: &mut W, entries: &[AuditEntry]) -> WardenResult<()> {
    for entry in entries {
        serde_json::to_writer(&mut *out, entry)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Read an `audit.jsonl` file back. Blank lines are skipped.
pub async fn load_jsonl(path: impl AsRef<Path>) -> WardenResult<Vec<AuditEntry>> {
    let content = tokio::fs::read_to_string(path.as_ref()).await?;
    let mut entries = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = serde_json::from_str(line).map_err(|e| {
            WardenError::Audit(format!("line {}: {e}", idx + 1))
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Verify ordering and hash chaining of a full log.
///
/// Fails on the first entry whose sequence is not exactly one more than its
/// predecessor, whose `prev_hash` does not match, or whose content no longer
/// matches its own hash.
pub fn verify_chain(entries: &[AuditEntry]) -> WardenResult<()> {
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut last_seq = 0u64;
    for entry in entries {
        if entry.sequence != last_seq + 1 {
            return Err(WardenError::Audit(format!(
                "sequence gap: expected {}, found {}",
                last_seq + 1,
                entry.sequence
            )));
        }
        if entry.prev_hash != expected_prev {
            return Err(WardenError::Audit(format!(
                "chain broken at sequence {}",
                entry.sequence
            )));
        }
        if entry.recompute_hash()? != entry.hash {
            return Err(WardenError::Audit(format!(
                "entry {} was modified",
                entry.sequence
            )));
        }
        expected_prev = entry.hash.clone();
        last_seq = entry.sequence;
    }
    Ok(())
}

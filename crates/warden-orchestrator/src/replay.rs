//! Rebuild job and subtask state from audit entries alone.

use crate::types::{JobStatus, SubtaskStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use warden_core::{ApprovalRecord, WardenError, WardenResult};
use warden_security::{AuditEntry, AuditEvent};

/// State reconstructed by [`replay`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayState {
    /// Job id to last recorded status.
    pub jobs: BTreeMap<String, JobStatus>,
    /// Subtask id to last recorded status.
    pub subtasks: BTreeMap<String, SubtaskStatus>,
    /// Subtask id to owning job id.
    pub subtask_jobs: BTreeMap<String, String>,
    /// Subtask id to name.
    pub subtask_names: BTreeMap<String, String>,
    /// Subtask id to its recorded approval decision.
    pub approvals: BTreeMap<String, ApprovalRecord>,
    /// Subtasks with an open approval request.
    pub open_requests: BTreeMap<String, serde_json::Value>,
    /// Sequence of the last entry replayed.
    pub last_sequence: u64,
}

impl ReplayState {
    /// Subtask ids of `job_id`, in id order.
    pub fn subtasks_of(&self, job_id: &str) -> Vec<&str> {
        self.subtask_jobs
            .iter()
            .filter(|(_, job)| job.as_str() == job_id)
            .map(|(subtask, _)| subtask.as_str())
            .collect()
    }

    /// Approval requests never decided nor withdrawn.
    pub fn pending_approvals(&self) -> Vec<&serde_json::Value> {
        self.open_requests.values().collect()
    }
}

/// Fold audit entries, in order, into job and subtask statuses.
///
/// Sequence numbers must be strictly increasing. Entries that carry no
/// state (results, circuit changes, drift) are skipped.
pub fn replay(entries: &[AuditEntry]) -> WardenResult<ReplayState> {
    let mut state = ReplayState::default();

    for entry in entries {
        if entry.sequence <= state.last_sequence {
            return Err(WardenError::Audit(format!(
                "sequence {} follows {}",
                entry.sequence, state.last_sequence
            )));
        }
        state.last_sequence = entry.sequence;
        let id = entry.entity_id.clone();

        match entry.event {
            AuditEvent::JobSubmitted => {
                if entry.payload["accepted"].as_bool() == Some(true) {
                    state.jobs.insert(id, JobStatus::Pending);
                }
            }
            AuditEvent::JobStatusChanged => {
                state.jobs.insert(id, status_of(entry)?);
            }
            AuditEvent::SubtaskCreated => {
                if let Some(job) = &entry.job_id {
                    state.subtask_jobs.insert(id.clone(), job.clone());
                }
                if let Some(name) = entry.payload["name"].as_str() {
                    state.subtask_names.insert(id.clone(), name.to_string());
                }
                state.subtasks.insert(id, SubtaskStatus::Queued);
            }
            AuditEvent::SubtaskStatusChanged | AuditEvent::SubtaskDispatched => {
                state.subtasks.insert(id, status_of(entry)?);
            }
            AuditEvent::ApprovalRequested => {
                state.open_requests.insert(id, entry.payload.clone());
            }
            AuditEvent::ApprovalRecorded => {
                let record: ApprovalRecord = serde_json::from_value(entry.payload.clone())
                    .map_err(|e| {
                        WardenError::Audit(format!("sequence {}: {e}", entry.sequence))
                    })?;
                state.open_requests.remove(&id);
                state.approvals.insert(id, record);
            }
            AuditEvent::ApprovalWithdrawn => {
                state.open_requests.remove(&id);
            }
            _ => {}
        }
    }

    Ok(state)
}

fn status_of<T: serde::de::DeserializeOwned>(entry: &AuditEntry) -> WardenResult<T> {
    serde_json::from_value(entry.payload["status"].clone()).map_err(|e| {
        WardenError::Audit(format!(
            "sequence {}: unreadable status: {e}",
            entry.sequence
        ))
    })
}

//! Security primitives for the Warden engine.
//!
//! Provides the tamper-evident audit log every state transition is written to,
//! and the deterministic content filter used by validation rules.
//!
//! # Main types
//!
//! - [`AuditLog`] — Append-only, hash-chained audit trail with an optional JSONL sink.
//! - [`AuditEntry`] — One sequentially numbered record.
//! - [`AuditFilter`] — Read-side filter for queries and exports.
//! - [`ContentFilter`] — Forbidden-pattern, control-character and size checks.

/// Audit logging module.
pub mod audit;
/// Output content filtering.
pub mod filter;

pub use audit::{
    load_jsonl, verify_chain, write_jsonl, AuditEntry, AuditEvent, AuditFilter, AuditLog,
    AUDIT_FILE,
};
pub use filter::{preview, ContentFilter, ContentFinding};

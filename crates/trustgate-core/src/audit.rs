//! Audit events and sinks
//!
//! Verification outcomes are reported through the one-way [`AuditSink`]
//! interface. Recording is infallible from the caller's point of view: a sink
//! that cannot persist an event logs the problem and moves on, so auditing can
//! never change a verification or lock outcome.
//!
//! [`HashChainAuditSink`] links every event to its predecessor with SHA-256
//! for tamper evidence:
//!
//! ```text
//! chain_hash_n = sha256(chain_hash_{n-1} || canonical_json(event_n))
//! ```

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::types::TrustLevel;

/// Structured event emitted by the verifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    /// Token accepted and its nonce consumed
    TrustVerified {
        trust: TrustLevel,
        nonce: String,
        trace: String,
    },
    /// Nonce had already been claimed
    ReplayDetected { nonce: String, trace: String },
    /// Coordination store unavailable, request failed closed
    DegradedMode { reason: String, trace: String },
}

impl AuditEvent {
    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::TrustVerified { .. } => "TRUST_VERIFIED",
            AuditEvent::ReplayDetected { .. } => "REPLAY_DETECTED",
            AuditEvent::DegradedMode { .. } => "DEGRADED_MODE",
        }
    }

    /// Trace id carried by the event
    pub fn trace(&self) -> &str {
        match self {
            AuditEvent::TrustVerified { trace, .. }
            | AuditEvent::ReplayDetected { trace, .. }
            | AuditEvent::DegradedMode { trace, .. } => trace,
        }
    }
}

/// Append-only receiver of audit events
pub trait AuditSink: Send + Sync {
    /// Record an event. Must not block on or surface delivery failures.
    fn record(&self, event: &AuditEvent);
}

/// One link of the audit hash chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Event fields plus `timestamp`, keys sorted
    pub event: serde_json::Value,
    /// Hash over the previous link and this event
    pub chain_hash: String,
    /// Hash of the previous link, `None` for the first entry
    pub prev_hash: Option<String>,
}

fn chain_hash(prev_hash: Option<&str>, event_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.unwrap_or("").as_bytes());
    hasher.update(event_json.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check that every entry links to its predecessor and hashes correctly
pub fn verify_chain(entries: &[AuditEntry]) -> bool {
    let mut prev: Option<&str> = None;
    for entry in entries {
        if entry.prev_hash.as_deref() != prev {
            return false;
        }
        // serde_json maps are key-sorted, so re-serializing is canonical
        let event_json = match serde_json::to_string(&entry.event) {
            Ok(json) => json,
            Err(_) => return false,
        };
        if chain_hash(prev, &event_json) != entry.chain_hash {
            return false;
        }
        prev = Some(entry.chain_hash.as_str());
    }
    true
}

/// Audit sink that hash-chains events and writes them to `tracing`
#[derive(Debug, Default)]
pub struct HashChainAuditSink {
    previous_hash: Mutex<Option<String>>,
}

impl HashChainAuditSink {
    /// Create a sink with an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event to the chain and return the new link
    pub fn append(&self, event: &AuditEvent) -> Option<AuditEntry> {
        let mut previous = self.previous_hash.lock();

        // Timestamp under the lock so chain order matches time order
        let mut value = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, kind = event.kind(), "Failed to serialize audit event");
                return None;
            }
        };
        if let Some(fields) = value.as_object_mut() {
            fields.insert(
                "timestamp".into(),
                serde_json::Value::String(Utc::now().to_rfc3339()),
            );
        }

        let event_json = match serde_json::to_string(&value) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, kind = event.kind(), "Failed to encode audit event");
                return None;
            }
        };

        let current = chain_hash(previous.as_deref(), &event_json);
        let entry = AuditEntry {
            event: value,
            chain_hash: current.clone(),
            prev_hash: previous.clone(),
        };

        match serde_json::to_string(&entry) {
            Ok(line) => info!(target: "trustgate::audit", kind = event.kind(), entry = %line),
            Err(e) => error!(error = %e, "Failed to encode audit entry"),
        }

        *previous = Some(current);
        Some(entry)
    }

    /// Hash of the most recent link
    pub fn head(&self) -> Option<String> {
        self.previous_hash.lock().clone()
    }

    /// Forget the chain (used when rotating audit files)
    pub fn reset(&self) {
        *self.previous_hash.lock() = None;
    }
}

impl AuditSink for HashChainAuditSink {
    fn record(&self, event: &AuditEvent) {
        let _ = self.append(event);
    }
}

/// Audit sink that keeps events in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events, oldest first
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events with the given wire type
    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}

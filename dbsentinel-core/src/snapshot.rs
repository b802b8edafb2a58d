//! Point-in-time captures of a database.
//!
//! A [`Snapshot`] holds the nodes, sessions and transactions of one
//! database at one instant, plus per-state counters computed once when the
//! snapshot is built. Snapshots encode to a compact binary form: one format
//! version byte followed by the postcard encoding of the snapshot. The link
//! back to the live [`Database`] is not encoded.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::{MonitorError, Result};
use crate::models::{EngineType, Session, SessionState, Transaction, TransactionState};
use crate::node::NodeInfo;

/// Version byte leading every encoded snapshot.
pub const FORMAT_VERSION: u8 = 1;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Sessions per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounts {
    /// Running a statement
    pub active: usize,
    /// Waiting on the server
    pub waiting: usize,
    /// Blocked on a lock
    pub blocked: usize,
    /// Idle
    pub inactive: usize,
    /// Being killed
    pub killed: usize,
}

impl SessionCounts {
    /// Counts sessions by state.
    pub fn from_sessions(sessions: &[Session]) -> Self {
        sessions.iter().fold(Self::default(), |mut counts, session| {
            let slot = match session.state() {
                SessionState::Active => &mut counts.active,
                SessionState::Waiting => &mut counts.waiting,
                SessionState::Blocked => &mut counts.blocked,
                SessionState::Inactive => &mut counts.inactive,
                SessionState::Killed => &mut counts.killed,
            };
            *slot = slot.saturating_add(1);
            counts
        })
    }

    /// Sum over all states
    pub const fn total(&self) -> usize {
        self.active
            .saturating_add(self.waiting)
            .saturating_add(self.blocked)
            .saturating_add(self.inactive)
            .saturating_add(self.killed)
    }
}

/// Transactions per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCounts {
    /// Running
    pub running: usize,
    /// Waiting on a lock
    pub lock_wait: usize,
    /// Committing
    pub committing: usize,
    /// Rolling back
    pub rolling_back: usize,
}

impl TransactionCounts {
    /// Counts transactions by state.
    pub fn from_transactions(transactions: &[Transaction]) -> Self {
        transactions
            .iter()
            .fold(Self::default(), |mut counts, transaction| {
                let slot = match transaction.state() {
                    TransactionState::Running => &mut counts.running,
                    TransactionState::LockWait => &mut counts.lock_wait,
                    TransactionState::Committing => &mut counts.committing,
                    TransactionState::RollingBack => &mut counts.rolling_back,
                };
                *slot = slot.saturating_add(1);
                counts
            })
    }

    /// Sum over all states
    pub const fn total(&self) -> usize {
        self.running
            .saturating_add(self.lock_wait)
            .saturating_add(self.committing)
            .saturating_add(self.rolling_back)
    }
}

/// Immutable capture of one database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    id: String,
    database_id: String,
    engine: EngineType,
    captured_at: DateTime<Utc>,
    nodes: Vec<NodeInfo>,
    sessions: Vec<Session>,
    transactions: Vec<Transaction>,
    session_counts: SessionCounts,
    transaction_counts: TransactionCounts,
    incomplete: bool,
    #[serde(skip)]
    database: Option<Arc<Database>>,
}

impl Snapshot {
    /// Captures the given samples. Counters are computed here, once.
    pub fn new(
        database_id: impl Into<String>,
        engine: EngineType,
        nodes: Vec<NodeInfo>,
        sessions: Vec<Session>,
        transactions: Vec<Transaction>,
    ) -> Self {
        let database_id = database_id.into();
        let captured_at = Utc::now();
        Self {
            id: next_id(&database_id, captured_at),
            database_id,
            engine,
            captured_at,
            session_counts: SessionCounts::from_sessions(&sessions),
            transaction_counts: TransactionCounts::from_transactions(&transactions),
            nodes,
            sessions,
            transactions,
            incomplete: false,
            database: None,
        }
    }

    /// Marks a capture known to be partial.
    #[must_use]
    pub const fn with_incomplete(mut self, incomplete: bool) -> Self {
        self.incomplete = incomplete;
        self
    }

    /// Links the snapshot to its live database.
    #[must_use]
    pub fn with_database(mut self, database: Arc<Database>) -> Self {
        self.database = Some(database);
        self
    }

    /// Unique id, derived from the database id, the capture time and a
    /// process-wide sequence
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the captured database
    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    /// Live database, absent on decoded snapshots
    pub const fn database(&self) -> Option<&Arc<Database>> {
        self.database.as_ref()
    }

    /// Engine family
    pub const fn engine(&self) -> EngineType {
        self.engine
    }

    /// Capture time
    pub const fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Captured nodes
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    /// Captured sessions
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// Captured transactions
    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Sessions per state
    pub const fn session_counts(&self) -> &SessionCounts {
        &self.session_counts
    }

    /// Transactions per state
    pub const fn transaction_counts(&self) -> &TransactionCounts {
        &self.transaction_counts
    }

    /// True when part of the capture failed or timed out
    pub const fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    /// Compact description for listings.
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            id: self.id.clone(),
            database_id: self.database_id.clone(),
            engine: self.engine,
            captured_at: self.captured_at,
            nodes: self.nodes.len(),
            available_nodes: self.nodes.iter().filter(|node| node.available).count(),
            sessions: self.session_counts,
            transactions: self.transaction_counts,
            incomplete: self.incomplete,
        }
    }

    /// Encodes the snapshot.
    ///
    /// # Errors
    /// Returns a serialization error when encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let encoded = postcard::to_allocvec(self).map_err(|e| MonitorError::Serialization {
            context: format!("Failed to encode snapshot {}", self.id),
            source: e,
        })?;
        let mut bytes = Vec::with_capacity(encoded.len().saturating_add(1));
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&encoded);
        Ok(bytes)
    }

    /// Decodes a snapshot produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    /// Returns a configuration error for an unknown format version and a
    /// serialization error for malformed content.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let Some((&version, body)) = bytes.split_first() else {
            return Err(MonitorError::configuration("empty snapshot"));
        };
        if version != FORMAT_VERSION {
            return Err(MonitorError::configuration(format!(
                "unsupported snapshot format version {version}"
            )));
        }
        postcard::from_bytes(body).map_err(|e| MonitorError::Serialization {
            context: "Failed to decode snapshot".to_string(),
            source: e,
        })
    }

    /// Writes the encoded snapshot to a file.
    ///
    /// # Errors
    /// Returns an I/O error when the file cannot be written.
    pub async fn write_to(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| MonitorError::Io {
                context: format!("Failed to write snapshot to {}", path.display()),
                source: e,
            })
    }

    /// Reads a snapshot written by [`write_to`](Self::write_to).
    ///
    /// # Errors
    /// Returns an I/O error when the file cannot be read, or a decoding
    /// error.
    pub async fn read_from(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| MonitorError::Io {
            context: format!("Failed to read snapshot from {}", path.display()),
            source: e,
        })?;
        Self::from_bytes(&bytes)
    }
}

/// Counters of a snapshot without its samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    /// Snapshot id
    pub id: String,
    /// Captured database
    pub database_id: String,
    /// Engine family
    pub engine: EngineType,
    /// Capture time
    pub captured_at: DateTime<Utc>,
    /// Number of nodes
    pub nodes: usize,
    /// Number of available nodes
    pub available_nodes: usize,
    /// Sessions per state
    pub sessions: SessionCounts,
    /// Transactions per state
    pub transactions: TransactionCounts,
    /// True when part of the capture failed
    pub incomplete: bool,
}

fn next_id(database_id: &str, captured_at: DateTime<Utc>) -> String {
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let millis = u64::try_from(captured_at.timestamp_millis()).unwrap_or_default();
    format!("{database_id}_{}_{sequence}", base36(millis))
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut encoded = Vec::new();
    loop {
        encoded.push(DIGITS[usize::try_from(value % 36).unwrap_or_default()]);
        value /= 36;
        if value == 0 {
            break;
        }
    }
    encoded.reverse();
    String::from_utf8_lossy(&encoded).into_owned()
}

//! Transaction status as seen by the storage engine.
//!
//! The engine never records commit or abort itself; it only asks a
//! [`TransactionStatus`] provider owned by the layer above.

use dashmap::DashMap;

use super::id::TransactionId;

/// The possible states of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Committed => write!(f, "Committed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Per-xid status queries consumed by recovery.
///
/// Implementations must report [`TransactionId::SYSTEM`] as committed.
pub trait TransactionStatus: Send + Sync {
    fn is_active(&self, xid: TransactionId) -> bool;
    fn is_committed(&self, xid: TransactionId) -> bool;
    fn is_aborted(&self, xid: TransactionId) -> bool;
}

/// In-memory status table. Unknown xids are reported as aborted.
#[derive(Debug, Default)]
pub struct MemoryStatusTable {
    states: DashMap<TransactionId, TransactionState>,
}

impl MemoryStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, xid: TransactionId) {
        self.states.insert(xid, TransactionState::Active);
    }

    pub fn commit(&self, xid: TransactionId) {
        self.states.insert(xid, TransactionState::Committed);
    }

    pub fn abort(&self, xid: TransactionId) {
        self.states.insert(xid, TransactionState::Aborted);
    }

    pub fn state(&self, xid: TransactionId) -> TransactionState {
        if xid.is_system() {
            return TransactionState::Committed;
        }
        self.states
            .get(&xid)
            .map(|entry| *entry.value())
            .unwrap_or(TransactionState::Aborted)
    }
}

impl TransactionStatus for MemoryStatusTable {
    fn is_active(&self, xid: TransactionId) -> bool {
        self.state(xid).is_active()
    }

    fn is_committed(&self, xid: TransactionId) -> bool {
        self.state(xid).is_committed()
    }

    fn is_aborted(&self, xid: TransactionId) -> bool {
        self.state(xid).is_aborted()
    }
}

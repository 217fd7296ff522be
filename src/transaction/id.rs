//! Transaction identifiers.

use serde::{Deserialize, Serialize};

/// A transaction identifier as handed down by the layers above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Reserved id for work done by the storage engine itself; always
    /// treated as committed.
    pub const SYSTEM: TransactionId = TransactionId(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_system(&self) -> bool {
        *self == Self::SYSTEM
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Txn{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_display() {
        assert_eq!(format!("{}", TransactionId::new(123)), "Txn123");
    }

    #[test]
    fn test_system_id() {
        assert!(TransactionId::SYSTEM.is_system());
        assert!(!TransactionId::new(1).is_system());
        assert_eq!(TransactionId::SYSTEM.value(), 0);
    }
}

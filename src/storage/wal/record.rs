//! Log record types.
//!
//! Every record names the data item it touches by uid and carries full byte
//! images of the item, so replay never needs anything but the record and the
//! page it points at.

use serde::{Deserialize, Serialize};

use crate::storage::data_item::uid_to_address;
use crate::storage::page::PageId;
use crate::transaction::TransactionId;

/// A new item appended to a page. `raw` is the complete item
/// (flag, length, payload) as written at the uid's offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertRecord {
    pub xid: TransactionId,
    pub uid: u64,
    pub raw: Vec<u8>,
}

/// Written when a mutation bracket opens, before any byte changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeforeRecord {
    pub uid: u64,
    pub pre_image: Vec<u8>,
}

/// Written when a mutation bracket closes. Both images cover the whole item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub xid: TransactionId,
    pub uid: u64,
    pub pre_image: Vec<u8>,
    pub post_image: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    Insert(InsertRecord),
    Before(BeforeRecord),
    Update(UpdateRecord),
}

impl LogRecord {
    pub fn insert(xid: TransactionId, uid: u64, raw: Vec<u8>) -> Self {
        LogRecord::Insert(InsertRecord { xid, uid, raw })
    }

    pub fn before(uid: u64, pre_image: Vec<u8>) -> Self {
        LogRecord::Before(BeforeRecord { uid, pre_image })
    }

    pub fn update(xid: TransactionId, uid: u64, pre_image: Vec<u8>, post_image: Vec<u8>) -> Self {
        LogRecord::Update(UpdateRecord {
            xid,
            uid,
            pre_image,
            post_image,
        })
    }

    /// The transaction the record belongs to; open-bracket records have none.
    pub fn xid(&self) -> Option<TransactionId> {
        match self {
            LogRecord::Insert(r) => Some(r.xid),
            LogRecord::Update(r) => Some(r.xid),
            LogRecord::Before(_) => None,
        }
    }

    pub fn uid(&self) -> u64 {
        match self {
            LogRecord::Insert(r) => r.uid,
            LogRecord::Before(r) => r.uid,
            LogRecord::Update(r) => r.uid,
        }
    }

    pub fn page_id(&self) -> PageId {
        uid_to_address(self.uid()).0
    }

    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

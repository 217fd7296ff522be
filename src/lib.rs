pub mod database;
pub mod recovery;
pub mod storage;
pub mod transaction;

pub use database::{DataManager, DataManagerConfig};

//! Transaction engine: journaled, snapshot-isolated sessions with
//! optimistic commit and conflict retry.

pub mod error;
pub mod journal;
pub mod retry;
pub mod tx;

pub use error::{ReadError, TransactionError, WriteError};
pub use journal::{Activity, Journal, ReadRecord, WriteRecord};
pub use retry::{edit_with_retry, DEFAULT_MAX_RETRIES};
pub use tx::{
    CommitHook, ReadOptions, Reader, StatusReport, Transaction, TxStatus, WriteOptions, Writer,
};

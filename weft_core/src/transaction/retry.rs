//! Conflict-retry wrapper around transaction bodies.

use tracing::debug;

use super::error::TransactionError;
use super::tx::Transaction;

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Run `body` in a fresh transaction and commit, retrying on conflicts
/// and explicit aborts.
///
/// `open` supplies a fresh transaction per attempt. Returns `true` once a
/// commit succeeds, `false` after `max_retries + 1` failed attempts or on
/// the first non-retryable error.
pub fn edit_with_retry<O, F>(open: O, mut body: F, max_retries: u32) -> bool
where
    O: Fn() -> Transaction,
    F: FnMut(&mut Transaction) -> Result<(), TransactionError>,
{
    for attempt in 0..=max_retries {
        let mut tx = open();
        match body(&mut tx) {
            Ok(()) => match tx.commit() {
                Ok(_) => return true,
                Err(e) if e.is_retryable() => {
                    debug!(attempt, error = %e, "commit failed, retrying");
                }
                Err(e) => {
                    debug!(attempt, error = %e, "commit failed, giving up");
                    return false;
                }
            },
            Err(e) if e.is_retryable() => {
                tx.abort(e.to_string());
                debug!(attempt, error = %e, "body failed, retrying");
            }
            Err(e) => {
                tx.abort(e.to_string());
                debug!(attempt, error = %e, "body failed, giving up");
                return false;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, EntityId, SpaceId};
    use crate::cfc::CfcConfig;
    use crate::storage::StorageManager;
    use crate::transaction::tx::{ReadOptions, WriteOptions};
    use serde_json::json;
    use std::sync::Arc;

    fn addr() -> Address {
        Address::root(SpaceId::new("s"), EntityId::of("counter"))
    }

    fn open_factory(storage: &Arc<StorageManager>) -> impl Fn() -> Transaction + '_ {
        move || Transaction::new(storage.clone(), CfcConfig::default())
    }

    #[test]
    fn test_simple_success() {
        let storage = Arc::new(StorageManager::ephemeral());
        let ok = edit_with_retry(
            open_factory(&storage),
            |tx| {
                tx.write(&addr(), Some(json!(1)), WriteOptions::default())?;
                Ok(())
            },
            DEFAULT_MAX_RETRIES,
        );
        assert!(ok);
    }

    #[test]
    fn test_retries_after_conflict() {
        let storage = Arc::new(StorageManager::ephemeral());

        // Seed the counter.
        assert!(edit_with_retry(
            open_factory(&storage),
            |tx| {
                tx.write(&addr(), Some(json!(0)), WriteOptions::default())?;
                Ok(())
            },
            0,
        ));

        // Body reads then increments; a competing commit lands between the
        // first read and the first commit attempt.
        let mut interfered = false;
        let ok = edit_with_retry(
            || Transaction::new(storage.clone(), CfcConfig::default()),
            |tx| {
                let n = tx
                    .read(&addr(), ReadOptions::default())?
                    .value
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                if !interfered {
                    interfered = true;
                    let mut rival = Transaction::new(storage.clone(), CfcConfig::default());
                    rival.read(&addr(), ReadOptions::default())?;
                    rival.write(&addr(), Some(json!(n + 1)), WriteOptions::default())?;
                    rival.commit()?;
                }
                tx.write(&addr(), Some(json!(n + 1)), WriteOptions::default())?;
                Ok(())
            },
            DEFAULT_MAX_RETRIES,
        );
        assert!(ok);

        // Both increments landed.
        let mut check = Transaction::new(storage.clone(), CfcConfig::default());
        let value = check.read(&addr(), ReadOptions::default()).unwrap().value;
        assert_eq!(value, Some(json!(2)));
    }

    #[test]
    fn test_exhausts_retries() {
        let storage = Arc::new(StorageManager::ephemeral());
        let mut attempts = 0;
        let ok = edit_with_retry(
            open_factory(&storage),
            |_tx| {
                attempts += 1;
                Err(TransactionError::Aborted {
                    reason: "always".to_string(),
                })
            },
            2,
        );
        assert!(!ok);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_non_retryable_stops_immediately() {
        let storage = Arc::new(StorageManager::ephemeral());
        let mut attempts = 0;
        let ok = edit_with_retry(
            open_factory(&storage),
            |_tx| {
                attempts += 1;
                Err(TransactionError::Complete)
            },
            5,
        );
        assert!(!ok);
        assert_eq!(attempts, 1);
    }
}

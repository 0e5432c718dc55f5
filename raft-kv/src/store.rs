//! In-memory key-value storage behind the state machine.
//!
//! Mutated only by the FSM adapter while applying committed entries. Request
//! handlers read from it directly.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::{PoisonError, RwLock};

/// Thread-safe key-value map guarded by a single reader/writer lock.
///
/// `BTreeMap` keeps serialization output stable, so two nodes holding the
/// same content produce byte-identical snapshots.
#[derive(Default)]
pub struct KvStore {
    data: RwLock<BTreeMap<String, String>>,
}

impl KvStore {
    /// Creates an empty key-value store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a key-value pair, overwriting any existing value.
    pub fn set(&self, key: String, value: String) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
    }

    /// Returns the current value for `key`, or `None` when it was never set.
    ///
    /// This is a local read with no cluster coordination.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes the whole map as a JSON object.
    ///
    /// The read lock is held until the bytes are produced, so writers cannot
    /// interleave with the capture.
    pub fn serialize(&self) -> serde_json::Result<Vec<u8>> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_vec(&*data)
    }

    /// Replaces the entire map with the content decoded from `source`.
    ///
    /// Decoding happens before the write lock is taken; on error the current
    /// content is left untouched.
    pub fn deserialize<R: Read>(&self, source: R) -> serde_json::Result<()> {
        let restored: BTreeMap<String, String> = serde_json::from_reader(source)?;
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_and_get_reads_latest() {
        let store = KvStore::new();
        store.set("k".into(), "v1".into());
        store.set("k".into(), "v2".into());
        assert_eq!(store.get("k"), Some("v2".to_string()));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn serialize_then_deserialize_preserves_content() {
        let source = KvStore::new();
        source.set("a".into(), "1".into());
        source.set("b".into(), String::new());

        let bytes = source.serialize().unwrap();
        let target = KvStore::new();
        target.deserialize(&bytes[..]).unwrap();

        assert_eq!(target.len(), 2);
        assert_eq!(target.get("a"), Some("1".to_string()));
        assert_eq!(target.get("b"), Some(String::new()));
    }

    #[test]
    fn empty_store_round_trips() {
        let bytes = KvStore::new().serialize().unwrap();
        assert_eq!(bytes, b"{}");

        let target = KvStore::new();
        target.set("stale".into(), "x".into());
        target.deserialize(&bytes[..]).unwrap();
        assert!(target.is_empty());
    }

    #[test]
    fn deserialize_replaces_wholesale() {
        let store = KvStore::new();
        store.set("old".into(), "gone".into());
        store.deserialize(&br#"{"new":"here"}"#[..]).unwrap();

        assert_eq!(store.get("old"), None);
        assert_eq!(store.get("new"), Some("here".to_string()));
    }

    #[test]
    fn bad_input_leaves_content_untouched() {
        let store = KvStore::new();
        store.set("keep".into(), "me".into());
        assert!(store.deserialize(&b"not json"[..]).is_err());
        assert_eq!(store.get("keep"), Some("me".to_string()));
    }
}

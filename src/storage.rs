//! RocksDB-backed document store for game state
//!
//! Records are JSON documents under prefixed keys; multi-key mutations go
//! through an atomic write batch.

use crate::errors::{CrashResult, StorageError};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Shared handle to the on-disk store
#[derive(Clone)]
pub struct Store {
    db: Arc<DB>,
}

impl Store {
    /// Open (or create) the store at the given directory
    pub fn open<P: AsRef<Path>>(path: P) -> CrashResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        // Players, rounds, and transactions are all fetched by exact key;
        // scans are short paging runs over narrow prefixes.
        opts.optimize_for_point_lookup(512);
        opts.increase_parallelism(2);

        let db = DB::open(&opts, path).map_err(|e| StorageError::OpenFailed(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Read a raw value
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.db.get(key).ok().flatten()
    }

    /// Write a single key/value pair
    pub fn put(&self, key: &[u8], value: &[u8]) -> CrashResult<()> {
        self.db
            .put(key, value)
            .map_err(|e| StorageError::WriteFailed(e.to_string()).into())
    }

    /// Delete a key
    pub fn delete(&self, key: &[u8]) -> CrashResult<()> {
        self.db
            .delete(key)
            .map_err(|e| StorageError::WriteFailed(e.to_string()).into())
    }

    /// Write a group of key/value pairs as one atomic unit
    pub fn batch_write(&self, pairs: Vec<(Vec<u8>, Vec<u8>)>) -> CrashResult<()> {
        let mut batch = WriteBatch::default();
        for (key, value) in &pairs {
            batch.put(key, value);
        }
        self.db
            .write(batch)
            .map_err(|e| StorageError::WriteFailed(e.to_string()).into())
    }

    /// Decode a JSON document, if present
    pub fn get_doc<T: DeserializeOwned>(&self, key: &[u8]) -> CrashResult<Option<T>> {
        let Some(bytes) = self.get(key) else {
            return Ok(None);
        };

        let doc = serde_json::from_slice(&bytes).map_err(|e| StorageError::CorruptedRecord {
            key: String::from_utf8_lossy(key).to_string(),
            reason: e.to_string(),
        })?;

        Ok(Some(doc))
    }

    /// Encode and write a JSON document
    pub fn put_doc<T: Serialize>(&self, key: &[u8], doc: &T) -> CrashResult<()> {
        let bytes = serde_json::to_vec(doc).map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        self.put(key, &bytes)
    }

    /// Encode a JSON document for inclusion in a write batch
    pub fn encode_doc<T: Serialize>(doc: &T) -> CrashResult<Vec<u8>> {
        serde_json::to_vec(doc).map_err(|e| StorageError::WriteFailed(e.to_string()).into())
    }

    /// Page through the records stored under a key prefix, ascending.
    ///
    /// `cursor` is the last key of the previous page; it is excluded from
    /// the results so repeated calls walk the prefix without overlap.
    pub fn scan_prefix(
        &self,
        prefix: &[u8],
        cursor: Option<&[u8]>,
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let from = cursor.unwrap_or(prefix);
        let mut page = Vec::with_capacity(limit.min(64));

        for entry in self.db.iterator(IteratorMode::From(from, Direction::Forward)) {
            let Ok((key, value)) = entry else { continue };

            if !key.starts_with(prefix) {
                break;
            }
            if Some(key.as_ref()) == cursor {
                continue;
            }

            page.push((key.into_vec(), value.into_vec()));
            if page.len() == limit {
                break;
            }
        }

        page
    }
}

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::kv::{KvBackend, KvRead, KvTxn};
use super::StoreResult;
use crate::error::StoreError;

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

fn poisoned() -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

fn scan(table: &Table, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    table
        .range(prefix.to_vec()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Volatile backend: one global lock, readers in parallel, writers serialized.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    table: RwLock<Table>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

struct Snapshot<'a>(&'a Table);

impl KvRead for Snapshot<'_> {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.0.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(scan(self.0, prefix))
    }
}

/// Buffers writes over the locked table; `None` marks a delete.
struct Overlay<'a> {
    base: &'a Table,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl KvRead for Overlay<'_> {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        match self.writes.get(key) {
            Some(pending) => Ok(pending.clone()),
            None => Ok(self.base.get(key).cloned()),
        }
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: Table = scan(self.base, prefix).into_iter().collect();
        for (key, pending) in self
            .writes
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
        {
            match pending {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

impl KvTxn for Overlay<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> StoreResult<()> {
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }
}

impl KvBackend for MemoryBackend {
    fn view<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&dyn KvRead) -> StoreResult<T>,
    {
        let table = self.table.read().map_err(|_| poisoned())?;
        f(&Snapshot(&*table))
    }

    fn update_then<T, F, C>(&self, f: F, on_commit: C) -> StoreResult<T>
    where
        F: FnOnce(&mut dyn KvTxn) -> StoreResult<T>,
        C: FnOnce(&T),
    {
        let mut table = self.table.write().map_err(|_| poisoned())?;
        let mut overlay = Overlay {
            base: &*table,
            writes: BTreeMap::new(),
        };
        let result = f(&mut overlay)?;
        let writes = overlay.writes;

        for (key, pending) in writes {
            match pending {
                Some(value) => {
                    table.insert(key, value);
                }
                None => {
                    table.remove(&key);
                }
            }
        }
        on_commit(&result);
        Ok(result)
    }
}

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::counter::StateCounter;
use super::{ExecutionStore, StoreResult, UpdateExecutionStateRequest, NEW_EXECUTION_COMMENT};
use crate::error::StoreError;
use crate::models::{Execution, ExecutionHistory, ExecutionState};

const EXECUTIONS_PREFIX: &str = "executions/";
const SHARDS_PREFIX: &str = "shards/";
const HISTORY_PREFIX: &str = "history/";

/// Read access inside a view or update.
pub trait KvRead {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Every pair whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Write access inside an update. Writes become visible to other callers
/// only when the update closure returns `Ok`.
pub trait KvTxn: KvRead {
    fn put(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    fn delete(&mut self, key: &[u8]) -> StoreResult<()>;
}

/// The narrow surface a storage engine supplies.
///
/// `update_then` runs its closure atomically: concurrent updates are
/// serialized, and an `Err` from the closure discards every write it made.
/// `on_commit` runs after a successful commit and before the next update
/// can start.
pub trait KvBackend: Send + Sync {
    fn view<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&dyn KvRead) -> StoreResult<T>;

    fn update_then<T, F, C>(&self, f: F, on_commit: C) -> StoreResult<T>
    where
        F: FnOnce(&mut dyn KvTxn) -> StoreResult<T>,
        C: FnOnce(&T);

    fn update<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut dyn KvTxn) -> StoreResult<T>,
    {
        self.update_then(f, |_| {})
    }
}

/// Percent-escape the key separator so an ID can never reach into a
/// neighbouring key range.
fn escape(component: &str) -> String {
    component.replace('%', "%25").replace('/', "%2F")
}

fn execution_key(id: &str) -> Vec<u8> {
    format!("{}{}", EXECUTIONS_PREFIX, escape(id)).into_bytes()
}

fn shard_prefix(shard_id: &str) -> String {
    format!("{}{}/", SHARDS_PREFIX, escape(shard_id))
}

fn shard_key(shard_id: &str, id: &str) -> Vec<u8> {
    format!("{}{}", shard_prefix(shard_id), escape(id)).into_bytes()
}

fn history_prefix(id: &str) -> String {
    format!("{}{}/", HISTORY_PREFIX, escape(id))
}

/// Zero-padded so lexical key order is version order.
fn history_key(id: &str, version: u64) -> Vec<u8> {
    format!("{}{:020}", history_prefix(id), version).into_bytes()
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn read_execution<R: KvRead + ?Sized>(reader: &R, id: &str) -> StoreResult<Execution> {
    match reader.get(&execution_key(id))? {
        Some(bytes) => decode(&bytes),
        None => Err(StoreError::ExecutionNotFound(id.to_string())),
    }
}

fn scan_executions<R: KvRead + ?Sized>(reader: &R) -> StoreResult<Vec<Execution>> {
    reader
        .scan_prefix(EXECUTIONS_PREFIX.as_bytes())?
        .iter()
        .map(|(_, value)| decode(value))
        .collect()
}

/// Execution store over any [`KvBackend`].
///
/// Layout: `executions/<id>` holds the record, `shards/<shard>/<id>` indexes
/// executions by shard, and `history/<id>/<version>` holds one entry per
/// accepted transition. Key components are escaped; the shard index value
/// is the raw execution ID.
///
/// The per-state counter is adjusted inside each commit so that counter
/// changes land in commit order.
pub struct KvExecutionStore<B> {
    backend: B,
    counter: StateCounter,
}

impl<B: KvBackend> KvExecutionStore<B> {
    /// Wrap `backend`, scanning it once to populate the per-state counter.
    pub fn open(backend: B) -> StoreResult<Self> {
        let counter = StateCounter::new();
        let executions = backend.view(|reader| scan_executions(reader))?;
        counter.populate(executions.iter().map(|e| e.state));
        tracing::debug!(executions = executions.len(), "Opened execution store");
        Ok(Self { backend, counter })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: KvBackend> ExecutionStore for KvExecutionStore<B> {
    fn get_execution(&self, id: &str) -> StoreResult<Execution> {
        self.backend.view(|reader| read_execution(reader, id))
    }

    fn get_executions(&self, shard_id: &str) -> StoreResult<Vec<Execution>> {
        let prefix = shard_prefix(shard_id);
        let mut executions = self.backend.view(|reader| {
            let index = reader.scan_prefix(prefix.as_bytes())?;
            index
                .iter()
                .map(|(_, value)| read_execution(reader, &String::from_utf8_lossy(value)))
                .collect::<StoreResult<Vec<_>>>()
        })?;

        if executions.is_empty() {
            return Err(StoreError::ExecutionsNotFoundForShard(shard_id.to_string()));
        }
        executions.sort_by_key(|e| e.update_time);
        Ok(executions)
    }

    fn get_live_executions(&self) -> StoreResult<Vec<Execution>> {
        let mut executions = self.backend.view(|reader| scan_executions(reader))?;
        executions.retain(|e| e.state.is_executing());
        executions.sort_by_key(|e| e.update_time);
        Ok(executions)
    }

    fn get_active_executions(&self) -> StoreResult<Vec<Execution>> {
        let mut executions = self.backend.view(|reader| scan_executions(reader))?;
        executions.retain(|e| e.state.is_active());
        executions.sort_by_key(|e| e.update_time);
        Ok(executions)
    }

    fn get_execution_history(&self, id: &str) -> StoreResult<Vec<ExecutionHistory>> {
        let prefix = history_prefix(id);
        let history = self.backend.view(|reader| {
            reader
                .scan_prefix(prefix.as_bytes())?
                .iter()
                .map(|(_, value)| decode::<ExecutionHistory>(value))
                .collect::<StoreResult<Vec<_>>>()
        })?;

        if history.is_empty() {
            return Err(StoreError::ExecutionHistoryNotFound(id.to_string()));
        }
        Ok(history)
    }

    fn create_execution(&self, mut execution: Execution) -> StoreResult<()> {
        let now = Utc::now();
        execution.version = 1;
        execution.create_time = now;
        execution.update_time = now;
        execution.latest_comment = NEW_EXECUTION_COMMENT.to_string();

        let history = ExecutionHistory {
            execution_id: execution.id.clone(),
            previous_state: ExecutionState::Undefined,
            new_state: execution.state,
            new_version: execution.version,
            comment: NEW_EXECUTION_COMMENT.to_string(),
            time: now,
        };

        let state = execution.state;
        self.backend.update_then(
            |txn| {
                if txn.get(&execution_key(&execution.id))?.is_some() {
                    return Err(StoreError::ExecutionAlreadyExists(execution.id.clone()));
                }
                if !matches!(state, ExecutionState::Created | ExecutionState::BidAccepted) {
                    return Err(StoreError::InvalidNewExecution {
                        id: execution.id.clone(),
                        actual: state,
                    });
                }

                txn.put(&execution_key(&execution.id), &encode(&execution)?)?;
                txn.put(
                    &shard_key(&execution.shard_id(), &execution.id),
                    execution.id.as_bytes(),
                )?;
                txn.put(&history_key(&execution.id, history.new_version), &encode(&history)?)?;
                Ok(())
            },
            |_| self.counter.increment(state),
        )?;

        tracing::debug!(execution_id = %execution.id, shard = %execution.shard, "Created execution");
        Ok(())
    }

    fn update_execution_state(&self, request: UpdateExecutionStateRequest) -> StoreResult<()> {
        let (previous, current) = self.backend.update_then(
            |txn| {
                let mut execution = read_execution(&*txn, &request.execution_id)?;

                if let Some(expected) = request.expected_state {
                    if execution.state != expected {
                        return Err(StoreError::InvalidExecutionState {
                            id: execution.id,
                            actual: execution.state,
                            expected,
                        });
                    }
                }
                if let Some(expected) = request.expected_version {
                    if execution.version != expected {
                        return Err(StoreError::InvalidExecutionVersion {
                            id: execution.id,
                            actual: execution.version,
                            expected,
                        });
                    }
                }
                if execution.state.is_terminal() {
                    return Err(StoreError::ExecutionAlreadyTerminal {
                        id: execution.id,
                        actual: execution.state,
                        requested: request.new_state,
                    });
                }

                let previous = execution.state;
                let now = Utc::now();
                execution.state = request.new_state;
                execution.version += 1;
                execution.update_time = now;
                execution.latest_comment = request.comment.clone();

                let history = ExecutionHistory {
                    execution_id: execution.id.clone(),
                    previous_state: previous,
                    new_state: execution.state,
                    new_version: execution.version,
                    comment: request.comment.clone(),
                    time: now,
                };

                txn.put(&execution_key(&execution.id), &encode(&execution)?)?;
                txn.put(&history_key(&execution.id, execution.version), &encode(&history)?)?;
                Ok((previous, execution.state))
            },
            |(previous, current)| self.counter.transition(*previous, *current),
        )?;

        tracing::debug!(
            execution_id = %request.execution_id,
            from = %previous,
            to = %current,
            "Updated execution state"
        );
        Ok(())
    }

    fn delete_execution(&self, id: &str) -> StoreResult<()> {
        self.backend.update_then(
            |txn| {
                let execution = read_execution(&*txn, id)?;

                txn.delete(&execution_key(id))?;
                txn.delete(&shard_key(&execution.shard_id(), id))?;
                let history = txn.scan_prefix(history_prefix(id).as_bytes())?;
                for (key, _) in history {
                    txn.delete(&key)?;
                }
                Ok(execution.state)
            },
            |state| self.counter.decrement(*state),
        )?;

        tracing::debug!(execution_id = %id, "Deleted execution");
        Ok(())
    }

    fn get_execution_count(&self, state: ExecutionState) -> StoreResult<u64> {
        Ok(self.counter.get(state))
    }
}

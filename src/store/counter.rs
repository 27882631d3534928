use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::ExecutionState;

/// In-memory count of executions per state.
///
/// Populated once by a full scan when the store opens, then adjusted after
/// every committed create, transition and delete.
#[derive(Debug, Default)]
pub struct StateCounter {
    counts: Mutex<HashMap<ExecutionState, u64>>,
}

impl StateCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn populate(&self, states: impl IntoIterator<Item = ExecutionState>) {
        let mut counts = self.lock();
        counts.clear();
        for state in states {
            *counts.entry(state).or_insert(0) += 1;
        }
    }

    pub fn get(&self, state: ExecutionState) -> u64 {
        self.lock().get(&state).copied().unwrap_or(0)
    }

    pub fn increment(&self, state: ExecutionState) {
        *self.lock().entry(state).or_insert(0) += 1;
    }

    pub fn decrement(&self, state: ExecutionState) {
        let mut counts = self.lock();
        if let Some(count) = counts.get_mut(&state) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn transition(&self, from: ExecutionState, to: ExecutionState) {
        if from == to {
            return;
        }
        let mut counts = self.lock();
        if let Some(count) = counts.get_mut(&from) {
            *count = count.saturating_sub(1);
        }
        *counts.entry(to).or_insert(0) += 1;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ExecutionState, u64>> {
        // counts stay consistent even if a holder panicked mid-update
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

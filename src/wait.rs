//! Polling wait for an execution to reach a set of states.

use std::time::Duration;

use thiserror::Error;

use crate::error::StoreError;
use crate::models::{Execution, ExecutionState};
use crate::store::ExecutionStore;

#[derive(Error, Debug)]
pub enum WaitError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("execution {id} reached terminal state {state} before any of {desired:?}")]
    UnexpectedTerminal {
        id: String,
        state: ExecutionState,
        desired: Vec<ExecutionState>,
    },

    #[error("execution {id} still in state {state} after {attempts} attempts")]
    TimedOut {
        id: String,
        state: ExecutionState,
        attempts: u32,
    },
}

#[derive(Debug, Clone)]
pub struct WaitParams {
    pub execution_id: String,
    pub desired: Vec<ExecutionState>,
    pub attempts: u32,
    pub delay: Duration,
}

impl WaitParams {
    pub fn new(execution_id: impl Into<String>, desired: &[ExecutionState]) -> Self {
        Self {
            execution_id: execution_id.into(),
            desired: desired.to_vec(),
            attempts: 100,
            delay: Duration::from_millis(50),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Poll until the execution is in one of `params.desired`.
///
/// Fails fast when it lands in a terminal state that is not desired, and
/// gives up after `params.attempts` reads.
pub async fn wait_for_execution_state(
    store: &dyn ExecutionStore,
    params: WaitParams,
) -> Result<Execution, WaitError> {
    let mut state = ExecutionState::Undefined;
    for attempt in 0..params.attempts {
        let execution = store.get_execution(&params.execution_id)?;
        if params.desired.contains(&execution.state) {
            return Ok(execution);
        }
        if execution.state.is_terminal() {
            return Err(WaitError::UnexpectedTerminal {
                id: execution.id,
                state: execution.state,
                desired: params.desired,
            });
        }
        state = execution.state;
        if attempt + 1 < params.attempts {
            tokio::time::sleep(params.delay).await;
        }
    }

    Err(WaitError::TimedOut {
        id: params.execution_id,
        state,
        attempts: params.attempts,
    })
}

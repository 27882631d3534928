use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ResourceUsage;

/// Points in the execution state machine.
///
/// `Undefined` never appears on a stored execution; it is the `previous_state`
/// of the history entry written at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    Undefined,
    Created,
    BidAccepted,
    Running,
    WaitingVerification,
    ResultAccepted,
    Publishing,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub const ALL: [ExecutionState; 10] = [
        ExecutionState::Undefined,
        ExecutionState::Created,
        ExecutionState::BidAccepted,
        ExecutionState::Running,
        ExecutionState::WaitingVerification,
        ExecutionState::ResultAccepted,
        ExecutionState::Publishing,
        ExecutionState::Completed,
        ExecutionState::Failed,
        ExecutionState::Cancelled,
    ];

    /// Any state before a terminal one, including `Created`.
    pub fn is_active(&self) -> bool {
        *self != ExecutionState::Undefined && !self.is_terminal()
    }

    /// States in which backend resources are held.
    pub fn is_executing(&self) -> bool {
        matches!(
            self,
            ExecutionState::Running
                | ExecutionState::WaitingVerification
                | ExecutionState::ResultAccepted
                | ExecutionState::Publishing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionState::Undefined => write!(f, "undefined"),
            ExecutionState::Created => write!(f, "created"),
            ExecutionState::BidAccepted => write!(f, "bid_accepted"),
            ExecutionState::Running => write!(f, "running"),
            ExecutionState::WaitingVerification => write!(f, "waiting_verification"),
            ExecutionState::ResultAccepted => write!(f, "result_accepted"),
            ExecutionState::Publishing => write!(f, "publishing"),
            ExecutionState::Completed => write!(f, "completed"),
            ExecutionState::Failed => write!(f, "failed"),
            ExecutionState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionState::ALL
            .into_iter()
            .find(|state| state.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown execution state: {}", s))
    }
}

/// What to run and which providers handle it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Executor provider name
    pub engine: String,
    /// Verifier provider name
    pub verifier: String,
    /// Publisher provider name
    pub publisher: String,
    /// Container image, for engines that need one
    pub image: Option<String>,
    /// Shell command run by the engine
    pub command: String,
    /// Requested resources; zero fields are filled from node defaults
    pub resources: ResourceUsage,
    /// Per-job execution timeout; the node default applies when unset
    pub timeout_secs: Option<u64>,
    /// Number of independently executable shards
    pub shard_count: u32,
}

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            engine: "noop".to_string(),
            verifier: "noop".to_string(),
            publisher: "noop".to_string(),
            image: None,
            command: String::new(),
            resources: ResourceUsage::default(),
            timeout_secs: None,
            shard_count: 1,
        }
    }
}

impl JobSpec {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub client_id: String,
    pub spec: JobSpec,
}

impl Job {
    pub fn new(id: impl Into<String>, spec: JobSpec) -> Self {
        Self {
            id: id.into(),
            client_id: String::new(),
            spec,
        }
    }
}

/// One independently executed portion of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionShard {
    pub job: Job,
    pub index: u32,
}

impl ExecutionShard {
    pub fn new(job: Job, index: u32) -> Self {
        Self { job, index }
    }

    /// `"{job_id}:{index}"`
    pub fn id(&self) -> String {
        format!("{}:{}", self.job.id, self.index)
    }
}

impl std::fmt::Display for ExecutionShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.job.id, self.index)
    }
}

/// The tracked record of this node's attempt to run one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub shard: ExecutionShard,
    pub resource_usage: ResourceUsage,
    pub state: ExecutionState,
    pub version: u64,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub latest_comment: String,
}

impl Execution {
    /// A fresh execution in `Created` at version 1. The store re-stamps the
    /// timestamps when the record is persisted.
    pub fn new(id: impl Into<String>, shard: ExecutionShard, resource_usage: ResourceUsage) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            shard,
            resource_usage,
            state: ExecutionState::Created,
            version: 1,
            create_time: now,
            update_time: now,
            latest_comment: String::new(),
        }
    }

    pub fn shard_id(&self) -> String {
        self.shard.id()
    }
}

/// One immutable record per accepted transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionHistory {
    pub execution_id: String,
    pub previous_state: ExecutionState,
    pub new_state: ExecutionState,
    pub new_version: u64,
    pub comment: String,
    pub time: DateTime<Utc>,
}

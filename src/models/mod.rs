pub mod execution;
pub mod resources;

pub use execution::{Execution, ExecutionHistory, ExecutionShard, ExecutionState, Job, JobSpec};
pub use resources::ResourceUsage;

pub mod backend;
pub mod capacity;
pub mod config;
pub mod error;
pub mod executors;
pub mod frontend;
pub mod metrics;
pub mod models;
pub mod node;
pub mod shutdown;
pub mod status;
pub mod store;
pub mod wait;

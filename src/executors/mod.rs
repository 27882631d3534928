//! Built-in providers.

pub mod docker;
pub mod noop;

pub use docker::DockerExecutor;
pub use noop::{NoopExecutor, NoopPublisher, NoopVerifier};

/// Name the noop providers are registered under.
pub const NOOP: &str = "noop";
/// Name the Docker executor is registered under.
pub const DOCKER: &str = "docker";

//! Execution environments, step executors, and secret handling for Conveyor.
//!
//! Provides the `EnvironmentProvisioner` trait with local-workspace and
//! container implementations, the `StepExecutor` trait with the built-in
//! `ShellExecutor`, the `ExecutorRegistry`, and `SecretResolver`s whose values
//! never leak into logs or persisted state.

pub mod container;
pub mod environment;
pub mod executor;
pub mod local_env;
pub mod routing;
pub mod secrets;
pub mod shell;
pub mod truncation;

pub use container::ContainerProvisioner;
pub use environment::{
    EnvHandle, EnvScope, EnvironmentProvisioner, EnvironmentSpec, Mount, NetworkPolicy,
    ScopedEnvironment, CONTAINER_WORKDIR,
};
pub use executor::{default_registry, CommandSpec, ExecutorRegistry, StepExecutor, StepOutput};
pub use local_env::LocalProvisioner;
pub use routing::DefaultProvisioner;
pub use secrets::{
    EnvSecretResolver, SecretBindings, SecretResolver, SecretValue, StaticSecretResolver,
};
pub use shell::ShellExecutor;
pub use truncation::truncate_tail;

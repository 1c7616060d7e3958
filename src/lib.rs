//! qa-runner - execute generated test scripts in isolated subprocesses.
//!
//! A [`Runner`] stages each submitted script in its own temporary directory,
//! runs it with the configured interpreter under a wall-clock deadline, and
//! always returns an [`ExecutionResult`]. Gateways expose the runner either
//! in-process ([`LocalGateway`]) or over HTTP ([`http_server`], consumed by
//! [`RemoteGateway`]).

#[cfg(not(unix))]
compile_error!("qa-runner only works on Unix-like systems.");

pub mod config;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod http_server;
pub mod runner;
pub mod sandbox;
pub mod state;

pub use config::{Limits, RunnerConfig};
pub use error::{GatewayError, RunnerError};
pub use execution::{Execution, ExecutionRequest, ExecutionResult, Outcome};
pub use gateway::{ExecutionGateway, LocalGateway, RemoteGateway};
pub use runner::Runner;
pub use sandbox::{ProcessSandbox, Sandbox};
pub use state::AppState;

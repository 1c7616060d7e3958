//! Error types.

use std::path::PathBuf;
use thiserror::Error;

/// Failures that prevent a submitted script from being launched or observed.
///
/// None of these reach a caller of [`Runner::run`](crate::runner::Runner::run);
/// they are folded into a `System Error:` result.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("could not create working directory under {path}: {source}")]
    CreateWorkingDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not write working file {path}: {source}")]
    WriteWorkingFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for child: {0}")]
    Wait(#[source] std::io::Error),

    #[error("failed to capture {stream}: {reason}")]
    Capture { stream: &'static str, reason: String },

    #[error("{0}")]
    Internal(String),
}

/// Errors returned by a gateway client.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("request to execution service failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("execution service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode execution result: {0}")]
    Decode(String),
}

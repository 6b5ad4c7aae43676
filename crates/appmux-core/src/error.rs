use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::height::ChainHeight;

/// Terminal failures of the multiplexer. None of these are retried; they
/// propagate to the command line and end the process with a non-zero status.
#[derive(Debug, Error)]
pub enum MultiplexerError {
    #[error("invalid version registry: {0}")]
    InvalidRegistry(String),

    #[error("invalid activation height override '{value}': {reason}")]
    InvalidActivationOverride { value: String, reason: String },

    #[error("failed to extract app version {app_version} ({label}): {reason}")]
    Extraction {
        app_version: u64,
        label: String,
        reason: String,
    },

    #[error("failed to launch app version {app_version} from {}: {source}", path.display())]
    Launch {
        app_version: u64,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("app version {app_version} did not become ready within {timeout:?}")]
    NotReady { app_version: u64, timeout: Duration },

    #[error("failed to read chain height: {0}")]
    HeightSource(String),

    #[error("no app version is active at {height}")]
    NoActiveVersion { height: ChainHeight },

    #[error("unknown app version {0}")]
    UnknownVersion(u64),

    /// `code` follows shell convention: `128 + signo` for a signalled exit.
    #[error("app version {app_version} exited unexpectedly ({})", describe_exit_code(*code))]
    ChildProcessExited { app_version: u64, code: Option<i32> },

    #[error("failed to stop app version {app_version}: {source}")]
    Stop {
        app_version: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("abci proxy failure: {0}")]
    Proxy(String),
}

fn describe_exit_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "exit status unavailable".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, MultiplexerError>;

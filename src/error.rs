//! Error types for the connectivity daemon.

use std::path::PathBuf;

use thiserror::Error;

use crate::at::FinalResult;

#[derive(Debug, Error)]
pub enum NetdError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call: {0}")]
    Nix(#[from] nix::Error),

    #[error("Config: {0}")]
    Config(String),

    /// No final result line arrived within the command's budget.
    #[error("AT timeout: {command}")]
    Timeout { command: String },

    /// The modem answered with an explicit error result.
    #[error("modem rejected {command}: {result}")]
    Modem { command: String, result: FinalResult },

    /// A send was attempted without an open AT handle.  This is a caller bug,
    /// never a transient I/O condition.
    #[error("AT handle not open (sending {command})")]
    InvalidHandle { command: String },

    #[error("device node missing: {}", .0.display())]
    DeviceMissing(PathBuf),

    #[error("parse: {0}")]
    Parse(String),

    #[error("supervisor: {0}")]
    Supervisor(String),

    #[error("GPIO: {0}")]
    Gpio(String),
}

impl NetdError {
    /// True for explicit modem error responses (`ERROR`, `+CME ERROR`, ...).
    pub fn is_protocol(&self) -> bool {
        matches!(self, NetdError::Modem { .. })
    }

    /// True for failures that must escalate to a hardware reset rather than be
    /// retried locally.
    pub fn is_resource(&self) -> bool {
        matches!(self, NetdError::InvalidHandle { .. } | NetdError::DeviceMissing(_))
    }
}

pub type Result<T> = std::result::Result<T, NetdError>;

use serde::Serialize;
use thiserror::Error;

use crate::models::ConnectionState;

/// Macro-operations that reject concurrent invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MacroOperation {
    RecordingStart,
    RecordingStop,
}

impl std::fmt::Display for MacroOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MacroOperation::RecordingStart => write!(f, "recording start"),
            MacroOperation::RecordingStop => write!(f, "recording stop"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "error_kind", rename_all = "snake_case")]
pub enum CoreError {
    #[error("adb not found: {program}")]
    AdbMissing { program: String },

    #[error("device {serial} is in state {state:?} and cannot run this operation")]
    DeviceUnavailable {
        serial: String,
        state: ConnectionState,
    },

    #[error("`{command}` timed out after {elapsed_seconds:.1}s")]
    Timeout {
        command: String,
        elapsed_seconds: f64,
    },

    #[error("`{command}` exited with code {code}: {tail}")]
    NonZeroExit {
        command: String,
        code: i32,
        tail: String,
    },

    #[error("failed to parse {context} output")]
    Parse { context: String, raw: String },

    #[error("{kind} already in progress for {serials:?}")]
    OperationInProgress {
        kind: MacroOperation,
        serials: Vec<String>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{message}")]
    Io { message: String },

    #[error("{message}")]
    Config { message: String },
}

impl CoreError {
    pub fn io(message: impl Into<String>) -> Self {
        CoreError::Io {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        CoreError::Config {
            message: message.into(),
        }
    }

    pub fn timeout(command: impl Into<String>, elapsed: std::time::Duration) -> Self {
        CoreError::Timeout {
            command: command.into(),
            elapsed_seconds: elapsed.as_secs_f64(),
        }
    }

    /// Stable machine-readable code, mirrored into event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::AdbMissing { .. } => "ADB_MISSING",
            CoreError::DeviceUnavailable { .. } => "DEVICE_UNAVAILABLE",
            CoreError::Timeout { .. } => "TIMEOUT",
            CoreError::NonZeroExit { .. } => "NON_ZERO_EXIT",
            CoreError::Parse { .. } => "PARSE_ERROR",
            CoreError::OperationInProgress { .. } => "OPERATION_IN_PROGRESS",
            CoreError::Cancelled => "CANCELLED",
            CoreError::Io { .. } => "IO_ERROR",
            CoreError::Config { .. } => "CONFIG_ERROR",
        }
    }

    /// True for errors that a retry budget is allowed to absorb.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Timeout { .. } | CoreError::NonZeroExit { .. } | CoreError::Io { .. }
        )
    }

    /// Single-line form for inline status rows; the full error stays in the payload.
    pub fn summary_line(&self) -> String {
        let text = self.to_string();
        match text.split('\n').next() {
            Some(first) => first.to_string(),
            None => text,
        }
    }
}

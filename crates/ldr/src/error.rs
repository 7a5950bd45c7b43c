//! Error kinds reported for failed tasks and farm-level errors.

use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// Why a task or worker failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad challenge response; the remote worker was never admitted.
    AuthenticationFailed,
    /// Worker declined the task. The task is re-enqueued.
    TaskRefused,
    /// Socket error or unexpected close.
    ConnectionLost,
    ProcessSpawnFailed,
    Timeout,
    /// Malformed or out-of-sequence message. Handled like ConnectionLost.
    ProtocolError,
    /// Renderer exited nonzero, was killed, or the worker reported an error.
    RenderFailed,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "authentication_failed",
            Self::TaskRefused => "task_refused",
            Self::ConnectionLost => "connection_lost",
            Self::ProcessSpawnFailed => "process_spawn_failed",
            Self::Timeout => "timeout",
            Self::ProtocolError => "protocol_error",
            Self::RenderFailed => "render_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the operator-facing farm surface.
#[derive(Debug, thiserror::Error)]
pub enum FarmError {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
    #[error("task {0} is already queued or running")]
    DuplicateTask(TaskId),
    #[error("farm is terminating, no new tasks accepted")]
    Terminating,
    #[error("farm event loop has stopped")]
    ChannelClosed,
    #[error("remote workers need a password")]
    MissingPassword,
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("listener error: {0}")]
    Listener(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ProcessSpawnFailed).unwrap();
        assert_eq!(json, r#""process_spawn_failed""#);
        let back: ErrorKind = serde_json::from_str(r#""connection_lost""#).unwrap();
        assert_eq!(back, ErrorKind::ConnectionLost);
    }

    #[test]
    fn display_matches_serde_name() {
        for kind in [
            ErrorKind::AuthenticationFailed,
            ErrorKind::TaskRefused,
            ErrorKind::ConnectionLost,
            ErrorKind::ProcessSpawnFailed,
            ErrorKind::Timeout,
            ErrorKind::ProtocolError,
            ErrorKind::RenderFailed,
            ErrorKind::Cancelled,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }
}

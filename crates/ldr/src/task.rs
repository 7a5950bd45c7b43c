//! Task records and their outcomes.

use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bridge::protocol::{FileEntry, TaskRequest};
use crate::config::opt_duration_secs;
use crate::error::ErrorKind;
use crate::process::ExitOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A required input file, named relative to the farm's input directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: PathBuf,
    /// Modification time, milliseconds since the epoch.
    pub mtime: u64,
    pub size: u64,
}

impl FileInfo {
    /// Stat `base/path` and record it under `path`.
    pub fn from_path(base: &Path, path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let meta = std::fs::metadata(base.join(&path))?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Self {
            path,
            mtime,
            size: meta.len(),
        })
    }

    /// Name as sent on the wire.
    pub fn wire_name(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// One frame to render. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(default)]
    pub id: TaskId,
    pub frame_no: u32,
    pub width: u16,
    pub height: u16,
    pub oformat: String,
    #[serde(default)]
    pub files: Vec<FileInfo>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Higher runs first; equal priorities run in arrival order.
    #[serde(default)]
    pub priority: i32,
    #[serde(default, with = "opt_duration_secs", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl TaskRecord {
    pub fn new(frame_no: u32, width: u16, height: u16, oformat: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            frame_no,
            width,
            height,
            oformat: oformat.into(),
            files: Vec::new(),
            args: Vec::new(),
            priority: 0,
            timeout: None,
        }
    }

    pub fn with_file(mut self, file: FileInfo) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// True if `name` is one of this task's input files.
    pub fn has_file(&self, name: &str) -> bool {
        self.files.iter().any(|f| f.path.as_os_str() == name)
    }

    pub fn to_request(&self) -> TaskRequest {
        TaskRequest {
            frame_no: self.frame_no,
            width: self.width,
            height: self.height,
            oformat: self.oformat.clone(),
            files: self
                .files
                .iter()
                .map(|f| FileEntry {
                    mtime: f.mtime,
                    size: f.size,
                    name: f.wire_name(),
                })
                .collect(),
            args: self.args.clone(),
        }
    }
}

/// Metadata of a successfully rendered task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResult {
    /// Human-readable worker description, e.g. `local#3` or `remote 10.0.0.5:3104`.
    pub worker: String,
    pub exit_code: i32,
    #[serde(with = "crate::config::duration_secs")]
    pub render_time: Duration,
}

/// A terminal task failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub task: TaskId,
    pub frame_no: u32,
    pub kind: ErrorKind,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitOutcome>,
}

impl TaskFailure {
    pub fn new(task: &TaskRecord, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            task: task.id,
            frame_no: task.frame_no,
            kind,
            detail: detail.into(),
            exit: None,
        }
    }

    pub fn with_exit(mut self, exit: ExitOutcome) -> Self {
        self.exit = Some(exit);
        self
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "task {} (frame {}) failed: {}: {}",
            self.task, self.frame_no, self.kind, self.detail
        )?;
        match self.exit {
            Some(ExitOutcome {
                signal: Some(sig), ..
            }) => write!(f, " (signal {sig})"),
            Some(ExitOutcome {
                code: Some(code), ..
            }) => write!(f, " (exit code {code})"),
            _ => Ok(()),
        }
    }
}

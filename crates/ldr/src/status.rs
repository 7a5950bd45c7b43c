//! Farm status snapshot types.

use serde::{Deserialize, Serialize};

use crate::driver::{DriverId, DriverState};
use crate::scheduler::Thresholds;
use crate::task::TaskId;
use crate::version::VersionInfo;
use crate::worker::{ClientId, WorkerId};

/// Coarse farm state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FarmHealth {
    /// Admitting tasks.
    #[default]
    Ready,
    /// Active count reached the high threshold; waiting to fall to low.
    Saturated,
    /// TerminateAll in progress or done; nothing new starts.
    Draining,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub id: ClientId,
    pub peer: String,
    pub njobs: u16,
    pub busy: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverStatus {
    pub id: DriverId,
    pub task: TaskId,
    pub frame_no: u32,
    pub worker: WorkerId,
    pub state: DriverState,
    pub stopped: bool,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FarmStatus {
    pub version: VersionInfo,
    pub health: FarmHealth,
    /// When the farm started (RFC 3339).
    pub started_at: String,
    pub accepting: bool,
    pub thresholds: Thresholds,
    pub queued: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub clients: Vec<ClientStatus>,
    pub drivers: Vec<DriverStatus>,
}

/// Format a millisecond epoch timestamp as RFC 3339.
pub fn format_start_time(start_ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(start_ms as i64)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

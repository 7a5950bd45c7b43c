//! ldr: render farm task dispatcher speaking the LDR protocol.

mod error;
mod status;
mod version;

pub mod bridge;
pub mod client;
pub mod config;
pub mod connection;
pub mod driver;
mod listener;
pub mod orchestrator;
pub mod process;
pub mod scheduler;
pub mod source;
pub mod task;
pub mod transport;
pub mod worker;

pub use client::{ClientError, ClientSummary, run_client};
pub use config::{ClientConfig, ConfigError, FarmConfig, RendererConfig};
pub use error::{ErrorKind, FarmError};
pub use orchestrator::{FarmControl, FarmHandle, spawn_farm, spawn_farm_with};
pub use scheduler::Thresholds;
pub use source::{
    FrameRangeSource, Outcome, OutcomeLog, QueueSource, RangeSummary, RenderJob, TaskSource,
};
pub use status::{ClientStatus, DriverStatus, FarmHealth, FarmStatus};
pub use task::{FileInfo, TaskFailure, TaskId, TaskRecord, TaskResult};
pub use version::{LDR_VERSION, VersionInfo};

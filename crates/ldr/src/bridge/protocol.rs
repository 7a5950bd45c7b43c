//! Wire protocol types for the LDR (Local Distributed Rendering) protocol.
//!
//! Every frame is a fixed 10-byte header followed by a command-specific body:
//!
//! ```text
//! Header { length: u32, command: u16, seq_no: u16, ack_no: u16 }
//! ```
//!
//! All integers are big-endian, strings are `u16` length-prefixed and never
//! NUL terminated. `length` counts body bytes only.

use std::fmt;

use tokio_util::bytes::Bytes;

pub const DEFAULT_PORT: u16 = 3104;
pub const PROTOCOL_VERSION: u16 = 1;

pub const HEADER_LEN: usize = 10;
pub const ID_STRING_LEN: usize = 18;
pub const CHALLENGE_LEN: usize = 16;
pub const RESPONSE_LEN: usize = 20;
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

pub const SERVER_ID: &str = "LDR-SERVER";
pub const CLIENT_ID: &str = "LDR-CLIENT";

/// Generates a `u16`-backed wire enum with checked conversion from the raw value.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $name {
            pub fn from_u16(value: u16) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            pub fn as_u16(self) -> u16 {
                self as u16
            }
        }
    };
}

wire_enum! {
    /// Command identifiers carried in the frame header.
    pub enum Command {
        None = 0,
        ChallengeRequest = 1,
        ChallengeResponse = 2,
        NowConnected = 3,
        ConnectionRefused = 4,
        TaskRequest = 5,
        TaskRefused = 6,
        FileRequest = 7,
        TaskState = 8,
        TaskDone = 9,
        FileTransmission = 10,
        SpecialTaskRequest = 11,
        /// Orderly protocol termination marker.
        EndOfStream = 0xDEAD,
    }
}

wire_enum! {
    /// Why the server refused a connection.
    pub enum RefuseReason {
        AuthenticationFailed = 1,
        VersionMismatch = 2,
        NotAccepting = 3,
    }
}

wire_enum! {
    /// Why a client declined a task.
    pub enum TaskRefusedReason {
        /// All job slots on the client are in use.
        Busy = 1,
        /// The client has no renderer configured.
        NoRenderer = 2,
        BadRequest = 3,
        FileError = 4,
    }
}

wire_enum! {
    /// Progress states reported by a client while a task runs.
    pub enum TaskStateKind {
        Rendering = 1,
        Stopped = 2,
        Resumed = 3,
    }
}

wire_enum! {
    /// Final outcome carried by `TaskDone`.
    pub enum DoneOutcome {
        Success = 0,
        /// Renderer exited nonzero; `code` holds the exit code.
        ExitFailure = 1,
        /// Renderer was killed; `code` holds the signal number.
        Signalled = 2,
        SpawnFailed = 3,
        Cancelled = 4,
        FileError = 5,
    }
}

wire_enum! {
    /// Control requests for a task already dispatched to a client.
    pub enum SpecialRequest {
        Stop = 1,
        Continue = 2,
        Cancel = 3,
    }
}

/// Fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: u32,
    pub command: u16,
    pub seq_no: u16,
    pub ack_no: u16,
}

/// Fixed 18-byte identification field, zero padded.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IdString([u8; ID_STRING_LEN]);

impl IdString {
    /// Build from text; input longer than 18 bytes is truncated.
    pub fn new(id: &str) -> Self {
        let mut raw = [0u8; ID_STRING_LEN];
        let len = id.len().min(ID_STRING_LEN);
        raw[..len].copy_from_slice(&id.as_bytes()[..len]);
        Self(raw)
    }

    pub fn from_bytes(raw: [u8; ID_STRING_LEN]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; ID_STRING_LEN] {
        &self.0
    }

    /// The identifier with zero padding stripped.
    pub fn as_str(&self) -> String {
        let end = self
            .0
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(ID_STRING_LEN);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }

    pub fn server() -> Self {
        Self::new(SERVER_ID)
    }

    pub fn client() -> Self {
        Self::new(CLIENT_ID)
    }
}

impl fmt::Debug for IdString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdString({:?})", self.as_str())
    }
}

/// One entry of a task's input file manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Modification time, milliseconds since the epoch.
    pub mtime: u64,
    pub size: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub frame_no: u32,
    pub width: u16,
    pub height: u16,
    pub oformat: String,
    pub files: Vec<FileEntry>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDone {
    pub frame_no: u32,
    pub outcome: DoneOutcome,
    pub code: i32,
    pub render_ms: u64,
}

impl TaskDone {
    pub fn is_success(&self) -> bool {
        self.outcome == DoneOutcome::Success
    }
}

/// One chunk of a streamed input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub frame_no: u32,
    pub name: String,
    pub total_size: u64,
    pub offset: u64,
    pub data: Bytes,
}

impl FileChunk {
    /// True when this chunk completes the file.
    pub fn is_last(&self) -> bool {
        self.offset + self.data.len() as u64 >= self.total_size
    }
}

/// Decoded LDR message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ChallengeRequest {
        id: IdString,
        protocol_vers: u16,
        challenge: [u8; CHALLENGE_LEN],
    },
    ChallengeResponse {
        id: IdString,
        response: [u8; RESPONSE_LEN],
    },
    NowConnected {
        njobs: u16,
        /// Server start time, milliseconds since the epoch.
        start_time: u64,
    },
    ConnectionRefused {
        reason: RefuseReason,
    },
    TaskRequest(TaskRequest),
    TaskRefused {
        frame_no: u32,
        reason: TaskRefusedReason,
    },
    FileRequest {
        frame_no: u32,
        files: Vec<String>,
    },
    TaskState {
        frame_no: u32,
        state: TaskStateKind,
    },
    TaskDone(TaskDone),
    FileTransmission(FileChunk),
    SpecialTaskRequest {
        frame_no: u32,
        request: SpecialRequest,
    },
    EndOfStream,
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::ChallengeRequest { .. } => Command::ChallengeRequest,
            Message::ChallengeResponse { .. } => Command::ChallengeResponse,
            Message::NowConnected { .. } => Command::NowConnected,
            Message::ConnectionRefused { .. } => Command::ConnectionRefused,
            Message::TaskRequest(_) => Command::TaskRequest,
            Message::TaskRefused { .. } => Command::TaskRefused,
            Message::FileRequest { .. } => Command::FileRequest,
            Message::TaskState { .. } => Command::TaskState,
            Message::TaskDone(_) => Command::TaskDone,
            Message::FileTransmission(_) => Command::FileTransmission,
            Message::SpecialTaskRequest { .. } => Command::SpecialTaskRequest,
            Message::EndOfStream => Command::EndOfStream,
        }
    }

    /// Frame number for task-scoped messages.
    pub fn frame_no(&self) -> Option<u32> {
        match self {
            Message::TaskRequest(req) => Some(req.frame_no),
            Message::TaskRefused { frame_no, .. }
            | Message::FileRequest { frame_no, .. }
            | Message::TaskState { frame_no, .. }
            | Message::SpecialTaskRequest { frame_no, .. } => Some(*frame_no),
            Message::TaskDone(done) => Some(done.frame_no),
            Message::FileTransmission(chunk) => Some(chunk.frame_no),
            _ => None,
        }
    }
}

/// A message together with its sequence/acknowledgement numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq_no: u16,
    pub ack_no: u16,
    pub message: Message,
}

/// True if sequence number `a` is at or after `b`, modulo 65536.
pub fn seq_at_or_after(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) >= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_values_match_wire() {
        assert_eq!(Command::None.as_u16(), 0);
        assert_eq!(Command::SpecialTaskRequest.as_u16(), 11);
        assert_eq!(Command::EndOfStream.as_u16(), 0xDEAD);
        assert_eq!(Command::from_u16(9), Some(Command::TaskDone));
        assert_eq!(Command::from_u16(12), None);
    }

    #[test]
    fn id_string_pads_and_trims() {
        let id = IdString::new("LDR-CLIENT");
        assert_eq!(&id.as_bytes()[..10], b"LDR-CLIENT");
        assert!(id.as_bytes()[10..].iter().all(|b| *b == 0));
        assert_eq!(id.as_str(), "LDR-CLIENT");
    }

    #[test]
    fn id_string_truncates_long_input() {
        let id = IdString::new("a-very-long-identifier-string");
        assert_eq!(id.as_str(), "a-very-long-identi");
    }

    #[test]
    fn seq_comparison_wraps() {
        assert!(seq_at_or_after(5, 5));
        assert!(seq_at_or_after(6, 5));
        assert!(!seq_at_or_after(4, 5));
        assert!(seq_at_or_after(2, 65530));
        assert!(!seq_at_or_after(65530, 2));
    }

    #[test]
    fn chunk_completion() {
        let chunk = FileChunk {
            frame_no: 1,
            name: "scene.pov".to_string(),
            total_size: 10,
            offset: 6,
            data: Bytes::from_static(b"abcd"),
        };
        assert!(chunk.is_last());

        let empty = FileChunk {
            frame_no: 1,
            name: "empty".to_string(),
            total_size: 0,
            offset: 0,
            data: Bytes::new(),
        };
        assert!(empty.is_last());
    }
}

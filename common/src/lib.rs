//! Messages exchanged between cache workers and their clients.
//!
//! Every RPC is a single `WorkerRequest` answered by a single `WorkerResponse`.
//! Bulk block payloads travel on a separate listener as `DataRequest` /
//! `DataResponse` frames.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type SessionId = u64;
pub type BlockId = u64;
pub type FileId = u64;

/// Upper bound for a single encoded control message.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Most payload bytes a single `DataResponse` carries. Longer reads are
/// answered short and continued by offset.
pub const MAX_DATA_CHUNK: u64 = 4 * 1024 * 1024;

/// Frame limit of the data channel: one full chunk plus its envelope.
pub const MAX_DATA_FRAME_BYTES: usize = MAX_DATA_CHUNK as usize + 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FaultKind {
    NotFound,
    SizeMismatch,
    CheckpointFailure,
    BlockInfoInvalid,
    TransportFailure,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::NotFound => "not found",
            FaultKind::SizeMismatch => "size mismatch",
            FaultKind::CheckpointFailure => "checkpoint failure",
            FaultKind::BlockInfoInvalid => "block info invalid",
            FaultKind::TransportFailure => "transport failure",
        };
        f.write_str(name)
    }
}

/// A typed failure returned by the worker in place of a result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: Option<String>,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.kind, msg),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Fault {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CheckpointStatus {
    Pending,
    InProgress,
    Done,
    Failed(String),
}

impl CheckpointStatus {
    /// Pending and in-progress tasks are still owned by the checkpoint queue.
    pub fn is_active(&self) -> bool {
        matches!(self, CheckpointStatus::Pending | CheckpointStatus::InProgress)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerRequest {
    AccessBlock { block_id: BlockId },
    AddCheckpoint { session_id: SessionId, file_id: FileId },
    AsyncCheckpoint { file_id: FileId },
    CheckpointStatus { file_id: FileId },
    CacheBlock { session_id: SessionId, block_id: BlockId },
    LockBlock { block_id: BlockId, session_id: SessionId },
    UnlockBlock { block_id: BlockId, session_id: SessionId },
    RequestSpace { session_id: SessionId, bytes: u64 },
    ReturnSpace { session_id: SessionId, bytes: u64 },
    UserHeartbeat { session_id: SessionId },
    ReleaseSession { session_id: SessionId },
    GetDataFolder,
    GetUserTempFolder { session_id: SessionId },
    GetUserUnderfsTempFolder { session_id: SessionId },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerResponse {
    Ack,
    Accepted(bool),
    Granted(bool),
    Path(String),
    Status(Option<CheckpointStatus>),
    Fault(Fault),
}

/// Read `length` bytes of a committed block starting at `offset`. At most
/// `MAX_DATA_CHUNK` bytes come back per request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataRequest {
    pub block_id: BlockId,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataResponse {
    pub block_id: BlockId,
    pub offset: u64,
    pub payload: Result<Vec<u8>, Fault>,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, WireError> {
    bincode::serialize(msg).map_err(WireError::Encode)
}

pub fn decode<'a, T: Deserialize<'a>>(buf: &'a [u8]) -> Result<T, WireError> {
    bincode::deserialize(buf).map_err(WireError::Decode)
}

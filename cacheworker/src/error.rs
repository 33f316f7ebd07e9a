use common::{BlockId, Fault, FaultKind, FileId};
use std::io;

use crate::coordinator::CoordinatorError;

pub type Result<T, E = WorkerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("size mismatch for {what}: declared {declared} bytes, found {actual} bytes")]
    SizeMismatch {
        what: String,
        declared: u64,
        actual: u64,
    },

    #[error("cannot reserve {requested} bytes, only {available} bytes available")]
    CapacityExceeded { requested: u64, available: u64 },

    #[error("checkpoint of file {file_id} failed: {message}")]
    CheckpointFailure { file_id: FileId, message: String },

    #[error("invalid block info: {0}")]
    BlockInfoInvalid(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl WorkerError {
    pub fn block_not_found(block_id: BlockId) -> Self {
        WorkerError::NotFound(format!("block {block_id}"))
    }

    pub fn file_not_found(file_id: FileId) -> Self {
        WorkerError::NotFound(format!("file {file_id}"))
    }

    pub fn checkpoint(file_id: FileId, message: impl Into<String>) -> Self {
        WorkerError::CheckpointFailure {
            file_id,
            message: message.into(),
        }
    }

    /// Maps the error to the fault reported on the wire.
    pub fn fault(&self) -> Fault {
        let kind = match self {
            WorkerError::NotFound(_) => FaultKind::NotFound,
            WorkerError::SizeMismatch { .. } => FaultKind::SizeMismatch,
            // a block that does not fit the reservation is reported against its block info
            WorkerError::CapacityExceeded { .. } => FaultKind::BlockInfoInvalid,
            WorkerError::CheckpointFailure { .. } => FaultKind::CheckpointFailure,
            WorkerError::BlockInfoInvalid(_) => FaultKind::BlockInfoInvalid,
            WorkerError::Transport(_) => FaultKind::TransportFailure,
            WorkerError::Io(_) => FaultKind::CheckpointFailure,
        };
        Fault::new(kind, self.to_string())
    }
}

impl From<CoordinatorError> for WorkerError {
    fn from(e: CoordinatorError) -> Self {
        match e {
            CoordinatorError::FileNotFound(id) => WorkerError::file_not_found(id),
            CoordinatorError::BlockNotFound(id) => WorkerError::block_not_found(id),
            CoordinatorError::InvalidBlockInfo(msg) => WorkerError::BlockInfoInvalid(msg),
            CoordinatorError::Unavailable(msg) => WorkerError::Transport(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_kinds() {
        let cases = [
            (WorkerError::block_not_found(7), FaultKind::NotFound),
            (
                WorkerError::SizeMismatch {
                    what: "block 7".into(),
                    declared: 100,
                    actual: 90,
                },
                FaultKind::SizeMismatch,
            ),
            (WorkerError::checkpoint(3, "boom"), FaultKind::CheckpointFailure),
            (
                WorkerError::BlockInfoInvalid("negative length".into()),
                FaultKind::BlockInfoInvalid,
            ),
            (
                WorkerError::Transport("coordinator down".into()),
                FaultKind::TransportFailure,
            ),
        ];
        for (err, kind) in cases {
            assert_eq!(err.fault().kind, kind, "{err}");
        }
    }

    #[test]
    fn test_fault_keeps_message() {
        let err = WorkerError::Io(io::Error::other("disk on fire"));
        let fault = err.fault();
        assert_eq!(fault.kind, FaultKind::CheckpointFailure);
        assert!(fault.message.unwrap().contains("disk on fire"));
    }

    #[test]
    fn test_coordinator_errors_are_translated() {
        let e: WorkerError = CoordinatorError::FileNotFound(9).into();
        assert!(matches!(e, WorkerError::NotFound(ref m) if m == "file 9"));
        let e: WorkerError = CoordinatorError::Unavailable("refused".into()).into();
        assert_eq!(e.fault().kind, FaultKind::TransportFailure);
    }
}

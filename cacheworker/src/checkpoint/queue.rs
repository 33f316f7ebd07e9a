use common::{CheckpointStatus, FileId};
use log::{error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{CHECKPOINT_SESSION, Checkpointer};
use crate::error::{Result, WorkerError};

/// How many finished checkpoints keep their status around for queries.
pub const SETTLED_STATUS_LIMIT: usize = 1024;

/// Status of every active checkpoint plus the most recently settled ones.
struct StatusBoard {
    by_file: HashMap<FileId, CheckpointStatus>,
    settled: VecDeque<FileId>,
    limit: usize,
}

impl StatusBoard {
    fn new(limit: usize) -> Self {
        Self {
            by_file: HashMap::new(),
            settled: VecDeque::new(),
            limit,
        }
    }

    fn get(&self, file_id: FileId) -> Option<&CheckpointStatus> {
        self.by_file.get(&file_id)
    }

    fn set(&mut self, file_id: FileId, status: CheckpointStatus) {
        self.settled.retain(|&id| id != file_id);
        if !status.is_active() {
            self.settled.push_back(file_id);
        }
        self.by_file.insert(file_id, status);
        while self.settled.len() > self.limit {
            if let Some(oldest) = self.settled.pop_front() {
                self.by_file.remove(&oldest);
            }
        }
    }
}

type StatusMap = Arc<Mutex<StatusBoard>>;

/// Bounded FIFO of files to checkpoint, drained by a fixed pool of tasks.
pub struct CheckpointQueue {
    tx: mpsc::Sender<FileId>,
    status: StatusMap,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CheckpointQueue {
    pub fn start(checkpointer: Arc<Checkpointer>, capacity: usize, workers: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let status: StatusMap = Arc::new(Mutex::new(StatusBoard::new(SETTLED_STATUS_LIMIT)));
        let cancel = CancellationToken::new();

        let handles = (0..workers.max(1))
            .map(|n| {
                tokio::spawn(drain(
                    n,
                    checkpointer.clone(),
                    rx.clone(),
                    status.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        Self {
            tx,
            status,
            cancel,
            workers: Mutex::new(handles),
        }
    }

    /// Queues `file_id`. Returns false when the queue is full; a file that is
    /// already waiting or running is accepted without being queued again.
    pub async fn submit(&self, file_id: FileId) -> Result<bool> {
        let mut status = self.status.lock().await;
        if status.get(file_id).is_some_and(CheckpointStatus::is_active) {
            return Ok(true);
        }
        match self.tx.try_send(file_id) {
            Ok(()) => {
                status.set(file_id, CheckpointStatus::Pending);
                Ok(true)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("checkpoint queue full, rejecting file {file_id}");
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(WorkerError::checkpoint(
                file_id,
                "checkpoint queue is closed",
            )),
        }
    }

    pub async fn status(&self, file_id: FileId) -> Option<CheckpointStatus> {
        self.status.lock().await.get(file_id).cloned()
    }

    /// Stops the workers after their current checkpoint. Files still queued
    /// are dropped and later submissions fail.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("checkpoint worker failed: {e}");
            }
        }
    }
}

async fn drain(
    n: usize,
    checkpointer: Arc<Checkpointer>,
    rx: Arc<Mutex<mpsc::Receiver<FileId>>>,
    status: StatusMap,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = async { rx.lock().await.recv().await } => next,
        };
        let Some(file_id) = next else {
            break;
        };

        status
            .lock()
            .await
            .set(file_id, CheckpointStatus::InProgress);
        let outcome = match checkpointer.checkpoint(CHECKPOINT_SESSION, file_id).await {
            Ok(()) => CheckpointStatus::Done,
            Err(e) => {
                error!("checkpoint worker {n}: file {file_id} failed: {e}");
                CheckpointStatus::Failed(e.to_string())
            }
        };
        status.lock().await.set(file_id, outcome);
    }
    // closing here makes later submissions fail instead of piling up
    rx.lock().await.close();
    info!("checkpoint worker {n} stopped");
}

//! Background task that reclaims sessions which stopped sending heartbeats.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Something that can reclaim expired sessions. Returns how many it reclaimed.
#[async_trait]
pub trait SessionCleaner: Send + Sync {
    async fn cleanup_users(&self) -> usize;
}

pub struct Reaper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Reaper {
    /// Runs `cleaner` once every `interval`. A cycle that takes longer than
    /// the interval is followed by the next one without sleeping.
    pub fn spawn(cleaner: Arc<dyn SessionCleaner>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            info!("session reaper started, interval {}ms", interval.as_millis());
            let mut last = Instant::now();
            loop {
                if token.is_cancelled() {
                    break;
                }
                let elapsed = last.elapsed();
                if elapsed < interval {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval - elapsed) => {}
                    }
                } else {
                    warn!(
                        "session reaper cycle took {}ms, longer than the {}ms interval",
                        elapsed.as_millis(),
                        interval.as_millis()
                    );
                }
                last = Instant::now();

                let reclaimed = cleaner.cleanup_users().await;
                if reclaimed > 0 {
                    debug!("session reaper reclaimed {reclaimed} sessions");
                }
            }
            info!("session reaper stopped");
        });
        Self { cancel, handle }
    }

    /// Prevents further cycles. A cleanup pass already running completes.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!("session reaper task failed: {e}");
        }
    }
}

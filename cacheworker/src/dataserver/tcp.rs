//! TCP data server: length-delimited bincode `DataRequest` frames in,
//! `DataResponse` frames out, any number of requests per connection. A
//! response carries at most `MAX_DATA_CHUNK` bytes; `TcpDataClient::read_all`
//! pages through longer ranges.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use common::{BlockId, DataRequest, DataResponse, MAX_DATA_CHUNK, MAX_DATA_FRAME_BYTES};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::DataServer;
use crate::block::BlockDataManager;

pub struct TcpDataServer {
    port: u16,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl TcpDataServer {
    pub async fn bind(addr: SocketAddr, manager: Arc<BlockDataManager>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind data server to {addr}"))?;
        let local_addr = listener.local_addr()?;
        info!("data server listening on {local_addr}");

        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(accept_loop(
            listener,
            manager,
            cancel.clone(),
            closed.clone(),
        ));

        Ok(Self {
            port: local_addr.port(),
            closed,
            cancel,
            accept_loop: Mutex::new(Some(handle)),
        })
    }
}

#[async_trait]
impl DataServer for TcpDataServer {
    fn port(&self) -> u16 {
        self.port
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.cancel.cancel();
        let handle = self.accept_loop.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("data server accept loop failed: {e}");
            }
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}

async fn accept_loop(
    listener: TcpListener,
    manager: Arc<BlockDataManager>,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("data connection from {peer}");
                    let manager = manager.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, manager, cancel).await {
                            warn!("data connection from {peer} failed: {e:#}");
                        }
                    });
                }
                Err(e) => warn!("failed to accept data connection: {e}"),
            },
            _ = cancel.cancelled() => break,
        }
    }
    closed.store(true, Ordering::SeqCst);
    info!("data server closed");
}

fn data_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_DATA_FRAME_BYTES)
        .new_codec()
}

async fn serve_connection(
    stream: TcpStream,
    manager: Arc<BlockDataManager>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, data_codec());
    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = cancel.cancelled() => return Ok(()),
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        let req: DataRequest = common::decode(&frame?)?;
        let payload = manager
            .read_block(req.block_id, req.offset, req.length.min(MAX_DATA_CHUNK))
            .await
            .map_err(|e| e.fault());
        let resp = DataResponse {
            block_id: req.block_id,
            offset: req.offset,
            payload,
        };
        framed.send(Bytes::from(common::encode(&resp)?)).await?;
    }
}

/// Client side of the TCP data server.
pub struct TcpDataClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl TcpDataClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to data server at {addr}"))?;
        Ok(Self {
            framed: Framed::new(stream, data_codec()),
        })
    }

    pub async fn read(&mut self, req: &DataRequest) -> anyhow::Result<DataResponse> {
        self.framed.send(Bytes::from(common::encode(req)?)).await?;
        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| anyhow!("data server closed the connection"))??;
        Ok(common::decode(&frame)?)
    }

    /// Reads `length` bytes from `offset`, one chunk per request, stopping
    /// early at the end of the block.
    pub async fn read_all(
        &mut self,
        block_id: BlockId,
        offset: u64,
        length: u64,
    ) -> anyhow::Result<Vec<u8>> {
        let end = offset.saturating_add(length);
        let mut next = offset;
        let mut data = Vec::new();
        while next < end {
            let resp = self
                .read(&DataRequest {
                    block_id,
                    offset: next,
                    length: end - next,
                })
                .await?;
            let chunk = resp.payload?;
            if chunk.is_empty() {
                break;
            }
            next += chunk.len() as u64;
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }
}

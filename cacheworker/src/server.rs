use anyhow::Context;
use common::{Fault, FaultKind, MAX_MESSAGE_BYTES, WorkerRequest, WorkerResponse};
use log::{debug, info, warn};
use quinn::{Connection, ConnectionError, Endpoint, RecvStream, SendStream, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::block::BlockDataManager;
use crate::error::WorkerError;

/// QUIC endpoint serving worker requests, one request per bidirectional
/// stream.
pub struct RpcServer {
    endpoint: Endpoint,
    manager: Arc<BlockDataManager>,
}

impl RpcServer {
    pub fn bind(addr: SocketAddr, manager: Arc<BlockDataManager>) -> anyhow::Result<Self> {
        let server_config = configure_server()?;
        let endpoint = Endpoint::server(server_config, addr)
            .with_context(|| format!("Failed to bind RPC endpoint to {addr}"))?;
        Ok(Self { endpoint, manager })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("RPC server listening on {}", self.local_addr()?);
        loop {
            let incoming = tokio::select! {
                incoming = self.endpoint.accept() => incoming,
                _ = shutdown.cancelled() => break,
            };
            let Some(incoming) = incoming else {
                break;
            };
            let manager = self.manager.clone();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!("connection accepted: addr={remote}");
                        if let Err(e) = handle_connection(conn, manager).await {
                            warn!("connection {remote} failed: {e:#}");
                        }
                    }
                    Err(e) => warn!("failed to establish connection: {e}"),
                }
            });
        }
        self.endpoint.close(0u32.into(), b"shutdown");
        self.endpoint.wait_idle().await;
        info!("RPC server stopped");
        Ok(())
    }
}

async fn handle_connection(conn: Connection, manager: Arc<BlockDataManager>) -> anyhow::Result<()> {
    loop {
        let (send, recv) = match conn.accept_bi().await {
            Ok(streams) => streams,
            Err(ConnectionError::ApplicationClosed(_))
            | Err(ConnectionError::LocallyClosed)
            | Err(ConnectionError::ConnectionClosed(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(send, recv, manager).await {
                warn!("stream failed: {e:#}");
            }
        });
    }
}

async fn handle_stream(
    mut send: SendStream,
    mut recv: RecvStream,
    manager: Arc<BlockDataManager>,
) -> anyhow::Result<()> {
    let buf = recv.read_to_end(MAX_MESSAGE_BYTES).await?;
    let resp = match common::decode::<WorkerRequest>(&buf) {
        Ok(req) => dispatch(&manager, req).await,
        Err(e) => WorkerResponse::Fault(Fault::new(FaultKind::TransportFailure, e.to_string())),
    };
    send.write_all(&common::encode(&resp)?).await?;
    send.finish()?;
    Ok(())
}

fn fault(e: WorkerError) -> WorkerResponse {
    debug!("request failed: {e}");
    WorkerResponse::Fault(e.fault())
}

/// Translates one request into block manager calls.
pub async fn dispatch(manager: &BlockDataManager, req: WorkerRequest) -> WorkerResponse {
    match req {
        WorkerRequest::AccessBlock { block_id } => {
            manager.access_block(block_id).await;
            WorkerResponse::Ack
        }
        WorkerRequest::AddCheckpoint {
            session_id,
            file_id,
        } => match manager.add_checkpoint(session_id, file_id).await {
            Ok(()) => WorkerResponse::Ack,
            Err(e) => fault(e),
        },
        WorkerRequest::AsyncCheckpoint { file_id } => {
            match manager.async_checkpoint(file_id).await {
                Ok(accepted) => WorkerResponse::Accepted(accepted),
                Err(e) => fault(e),
            }
        }
        WorkerRequest::CheckpointStatus { file_id } => {
            WorkerResponse::Status(manager.checkpoint_status(file_id).await)
        }
        WorkerRequest::CacheBlock {
            session_id,
            block_id,
        } => match manager.cache_block(session_id, block_id).await {
            Ok(()) => WorkerResponse::Ack,
            Err(e) => fault(e),
        },
        WorkerRequest::LockBlock {
            block_id,
            session_id,
        } => {
            manager.lock_block(block_id, session_id).await;
            WorkerResponse::Ack
        }
        WorkerRequest::UnlockBlock {
            block_id,
            session_id,
        } => {
            manager.unlock_block(block_id, session_id).await;
            WorkerResponse::Ack
        }
        WorkerRequest::RequestSpace { session_id, bytes } => {
            WorkerResponse::Granted(manager.request_space(session_id, bytes).await)
        }
        WorkerRequest::ReturnSpace { session_id, bytes } => {
            manager.return_space(session_id, bytes).await;
            WorkerResponse::Ack
        }
        WorkerRequest::UserHeartbeat { session_id } => {
            manager.user_heartbeat(session_id).await;
            WorkerResponse::Ack
        }
        WorkerRequest::ReleaseSession { session_id } => {
            manager.release_session(session_id).await;
            WorkerResponse::Ack
        }
        WorkerRequest::GetDataFolder => {
            WorkerResponse::Path(manager.data_folder().display().to_string())
        }
        WorkerRequest::GetUserTempFolder { session_id } => {
            WorkerResponse::Path(manager.user_temp_folder(session_id).display().to_string())
        }
        WorkerRequest::GetUserUnderfsTempFolder { session_id } => {
            WorkerResponse::Path(manager.user_underfs_temp_folder(session_id))
        }
    }
}

/// generates a self-signed TLS certificate and constructs QUIC server config.
fn configure_server() -> anyhow::Result<ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let cert_der = CertificateDer::from(cert.serialize_der()?);
    let key = PrivatePkcs8KeyDer::from(cert.serialize_private_key_der());
    let certs = vec![cert_der];
    let server_config =
        ServerConfig::with_single_cert(certs, rustls::pki_types::PrivateKeyDer::Pkcs8(key))?;
    Ok(server_config)
}

use anyhow::Result;
use common::{
    BlockId, CheckpointStatus, Fault, FileId, MAX_MESSAGE_BYTES, SessionId, WorkerRequest,
    WorkerResponse,
};
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig as QuinnClientConfig, Connection, Endpoint};
use rustls::DigitallySignedStruct;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig as RustlsClientConfig, RootCertStore, SignatureScheme};
use std::net::SocketAddr;
use std::sync::Arc;

/// Skip certificate verification
#[derive(Debug)]
pub struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}

/// Error returned by [`WorkerClient`] calls.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("worker fault: {0}")]
    Fault(Fault),
    #[error("unexpected response: {0:?}")]
    Unexpected(WorkerResponse),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// QUIC client of the worker RPC endpoint.
pub struct WorkerClient {
    endpoint: Endpoint,
    conn: Connection,
}

impl WorkerClient {
    pub async fn connect(server_addr: SocketAddr) -> Result<Self> {
        // already installed by an earlier client or the server
        let _ = CryptoProvider::install_default(rustls::crypto::ring::default_provider());

        let mut tls = RustlsClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        tls.dangerous()
            .set_certificate_verifier(Arc::new(SkipServerVerification));

        let quic_crypto = QuicClientConfig::try_from(tls)?;
        let client_cfg = QuinnClientConfig::new(Arc::new(quic_crypto));
        let bind: SocketAddr = if server_addr.is_ipv6() {
            "[::]:0".parse()?
        } else {
            "0.0.0.0:0".parse()?
        };
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_cfg);

        let conn = endpoint.connect(server_addr, "localhost")?.await?;
        Ok(Self { endpoint, conn })
    }

    /// Sends one request on a fresh stream and waits for its response.
    pub async fn call(&self, req: &WorkerRequest) -> Result<WorkerResponse> {
        let (mut send, mut recv) = self.conn.open_bi().await?;
        send.write_all(&common::encode(req)?).await?;
        send.finish()?;
        let buf = recv.read_to_end(MAX_MESSAGE_BYTES).await?;
        Ok(common::decode(&buf)?)
    }

    async fn ack(&self, req: WorkerRequest) -> ClientResult<()> {
        match self.call(&req).await? {
            WorkerResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn path(&self, req: WorkerRequest) -> ClientResult<String> {
        match self.call(&req).await? {
            WorkerResponse::Path(p) => Ok(p),
            other => Err(unexpected(other)),
        }
    }

    pub async fn access_block(&self, block_id: BlockId) -> ClientResult<()> {
        self.ack(WorkerRequest::AccessBlock { block_id }).await
    }

    pub async fn add_checkpoint(&self, session_id: SessionId, file_id: FileId) -> ClientResult<()> {
        self.ack(WorkerRequest::AddCheckpoint {
            session_id,
            file_id,
        })
        .await
    }

    pub async fn async_checkpoint(&self, file_id: FileId) -> ClientResult<bool> {
        match self.call(&WorkerRequest::AsyncCheckpoint { file_id }).await? {
            WorkerResponse::Accepted(accepted) => Ok(accepted),
            other => Err(unexpected(other)),
        }
    }

    pub async fn checkpoint_status(&self, file_id: FileId) -> ClientResult<Option<CheckpointStatus>> {
        match self.call(&WorkerRequest::CheckpointStatus { file_id }).await? {
            WorkerResponse::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cache_block(&self, session_id: SessionId, block_id: BlockId) -> ClientResult<()> {
        self.ack(WorkerRequest::CacheBlock {
            session_id,
            block_id,
        })
        .await
    }

    pub async fn lock_block(&self, block_id: BlockId, session_id: SessionId) -> ClientResult<()> {
        self.ack(WorkerRequest::LockBlock {
            block_id,
            session_id,
        })
        .await
    }

    pub async fn unlock_block(&self, block_id: BlockId, session_id: SessionId) -> ClientResult<()> {
        self.ack(WorkerRequest::UnlockBlock {
            block_id,
            session_id,
        })
        .await
    }

    pub async fn request_space(&self, session_id: SessionId, bytes: u64) -> ClientResult<bool> {
        match self
            .call(&WorkerRequest::RequestSpace { session_id, bytes })
            .await?
        {
            WorkerResponse::Granted(granted) => Ok(granted),
            other => Err(unexpected(other)),
        }
    }

    pub async fn return_space(&self, session_id: SessionId, bytes: u64) -> ClientResult<()> {
        self.ack(WorkerRequest::ReturnSpace { session_id, bytes })
            .await
    }

    pub async fn user_heartbeat(&self, session_id: SessionId) -> ClientResult<()> {
        self.ack(WorkerRequest::UserHeartbeat { session_id }).await
    }

    pub async fn release_session(&self, session_id: SessionId) -> ClientResult<()> {
        self.ack(WorkerRequest::ReleaseSession { session_id }).await
    }

    pub async fn data_folder(&self) -> ClientResult<String> {
        self.path(WorkerRequest::GetDataFolder).await
    }

    pub async fn user_temp_folder(&self, session_id: SessionId) -> ClientResult<String> {
        self.path(WorkerRequest::GetUserTempFolder { session_id })
            .await
    }

    pub async fn user_underfs_temp_folder(&self, session_id: SessionId) -> ClientResult<String> {
        self.path(WorkerRequest::GetUserUnderfsTempFolder { session_id })
            .await
    }

    pub async fn close(self) {
        self.conn.close(0u32.into(), b"bye");
        self.endpoint.wait_idle().await;
    }
}

fn unexpected(resp: WorkerResponse) -> ClientError {
    match resp {
        WorkerResponse::Fault(f) => ClientError::Fault(f),
        other => ClientError::Unexpected(other),
    }
}

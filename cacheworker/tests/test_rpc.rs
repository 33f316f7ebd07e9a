mod support;

use cacheworker::client::{ClientError, WorkerClient};
use cacheworker::config::Config;
use cacheworker::coordinator::InMemoryCoordinator;
use cacheworker::dataserver::DataServerRegistry;
use cacheworker::dataserver::tcp::TcpDataClient;
use cacheworker::worker::Worker;
use common::{CheckpointStatus, DataRequest, FaultKind};
use serial_test::serial;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Cluster {
    dir: TempDir,
    coordinator: Arc<InMemoryCoordinator>,
    worker: Worker,
}

async fn start_worker() -> Cluster {
    support::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
worker_id: 7
rpc_addr: 127.0.0.1:0
data_addr: 127.0.0.1:0
data_folder: {}
underfs_root: {}
capacity_bytes: 4096
heartbeat_interval_ms: 100
"#,
        dir.path().join("local").display(),
        dir.path().join("ufs").display()
    );
    let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let worker = Worker::start(&cfg, coordinator.clone(), &DataServerRegistry::default())
        .await
        .unwrap();
    Cluster {
        dir,
        coordinator,
        worker,
    }
}

#[tokio::test]
#[serial]
async fn test_block_lifecycle_over_rpc() {
    let c = start_worker().await;
    c.coordinator.register_file(1, &[(10, 5), (11, 6)], None).await;
    let client = WorkerClient::connect(c.worker.rpc_addr()).await.unwrap();

    client.user_heartbeat(3).await.unwrap();
    assert!(client.request_space(3, 11).await.unwrap());
    let temp = client.user_temp_folder(3).await.unwrap();
    tokio::fs::write(format!("{temp}/10"), b"hello").await.unwrap();
    tokio::fs::write(format!("{temp}/11"), b" world").await.unwrap();
    client.cache_block(3, 10).await.unwrap();
    client.cache_block(3, 11).await.unwrap();

    let data_folder = client.data_folder().await.unwrap();
    assert!(std::path::Path::new(&data_folder).join("10").exists());
    assert_eq!(
        client.user_underfs_temp_folder(3).await.unwrap(),
        "/workers/7/users/3"
    );

    client.lock_block(10, 3).await.unwrap();
    client.access_block(10).await.unwrap();
    client.unlock_block(10, 3).await.unwrap();

    client.add_checkpoint(3, 1).await.unwrap();
    let data = std::fs::read(c.dir.path().join("ufs/data/1")).unwrap();
    assert_eq!(data, b"hello world");

    // bulk reads go through the data server
    let addr = SocketAddr::from(([127, 0, 0, 1], c.worker.data_server().port()));
    let mut data_client = TcpDataClient::connect(addr).await.unwrap();
    let resp = data_client
        .read(&DataRequest {
            block_id: 11,
            offset: 1,
            length: 5,
        })
        .await
        .unwrap();
    assert_eq!(resp.payload.unwrap(), b"world");
    let resp = data_client
        .read(&DataRequest {
            block_id: 99,
            offset: 0,
            length: 1,
        })
        .await
        .unwrap();
    assert_eq!(resp.payload.unwrap_err().kind, FaultKind::NotFound);

    client.release_session(3).await.unwrap();
    client.close().await;
    c.worker.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_faults_over_rpc() {
    let c = start_worker().await;
    c.coordinator.register_file(2, &[(20, 100)], None).await;
    let client = WorkerClient::connect(c.worker.rpc_addr()).await.unwrap();

    assert!(client.request_space(4, 100).await.unwrap());
    let temp = client.user_temp_folder(4).await.unwrap();
    tokio::fs::write(format!("{temp}/20"), vec![0u8; 90]).await.unwrap();
    match client.cache_block(4, 20).await {
        Err(ClientError::Fault(f)) => assert_eq!(f.kind, FaultKind::SizeMismatch),
        other => panic!("unexpected result {other:?}"),
    }
    match client.cache_block(4, 21).await {
        Err(ClientError::Fault(f)) => assert_eq!(f.kind, FaultKind::NotFound),
        other => panic!("unexpected result {other:?}"),
    }
    match client.add_checkpoint(4, 2).await {
        Err(ClientError::Fault(f)) => assert_eq!(f.kind, FaultKind::NotFound),
        other => panic!("unexpected result {other:?}"),
    }
    // more than the whole capacity
    assert!(!client.request_space(4, 5000).await.unwrap());

    assert!(client.async_checkpoint(2).await.unwrap());
    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.checkpoint_status(2).await.unwrap() {
                Some(s) if !s.is_active() => return s,
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(status, CheckpointStatus::Failed(_)));

    client.close().await;
    c.worker.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_silent_client_is_reaped() {
    let c = start_worker().await;
    let client = WorkerClient::connect(c.worker.rpc_addr()).await.unwrap();
    client.user_heartbeat(9).await.unwrap();
    client.lock_block(1, 9).await.unwrap();
    assert!(client.request_space(9, 1000).await.unwrap());

    // interval 100ms, multiplier 3: gone within 400ms
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(c.worker.manager().session_usage(9).await.is_none());
    assert_eq!(c.worker.manager().space_usage().await.reserved, 0);

    client.close().await;
    assert!(!c.worker.data_server().is_closed());
    c.worker.shutdown().await.unwrap();
}

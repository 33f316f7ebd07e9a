//! Process level wiring: builds the block manager from a [`Config`], starts
//! the reaper, the data server and the RPC endpoint, and tears them down.

use anyhow::Context;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::block::store::WorkerPaths;
use crate::block::{BlockDataManager, Reaper};
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::dataserver::{DataServer, DataServerRegistry};
use crate::server::RpcServer;
use crate::ufs::LocalUnderFileSystem;

pub struct Worker {
    manager: Arc<BlockDataManager>,
    reaper: Reaper,
    data_server: Box<dyn DataServer>,
    rpc_addr: SocketAddr,
    shutdown: CancellationToken,
    rpc_task: JoinHandle<anyhow::Result<()>>,
}

impl Worker {
    pub async fn start(
        cfg: &Config,
        coordinator: Arc<dyn Coordinator>,
        data_servers: &DataServerRegistry,
    ) -> anyhow::Result<Self> {
        cfg.validate()?;
        if let Err(e) = coordinator.ping().await {
            warn!("coordinator not reachable at startup: {e}");
        }

        tokio::fs::create_dir_all(&cfg.underfs_root)
            .await
            .with_context(|| format!("Failed to create {}", cfg.underfs_root.display()))?;
        let ufs = Arc::new(LocalUnderFileSystem::new(&cfg.underfs_root));
        let manager = Arc::new(
            BlockDataManager::open(
                WorkerPaths::new(&cfg.data_folder, cfg.worker_id),
                cfg.manager_options(),
                coordinator,
                ufs,
            )
            .await
            .context("Failed to open block data manager")?,
        );

        let reaper = Reaper::spawn(manager.clone(), cfg.heartbeat_interval());

        let data_server = match data_servers
            .create(&cfg.data_server, cfg.data_addr, manager.clone())
            .await
        {
            Ok(server) => server,
            Err(e) => {
                abort_start(&manager, reaper, None).await;
                return Err(e);
            }
        };

        let bound = RpcServer::bind(cfg.rpc_addr, manager.clone())
            .and_then(|rpc| rpc.local_addr().map(|addr| (rpc, addr)));
        let (rpc, rpc_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                abort_start(&manager, reaper, Some(data_server.as_ref())).await;
                return Err(e);
            }
        };
        let shutdown = CancellationToken::new();
        let rpc_task = tokio::spawn(rpc.serve(shutdown.clone()));

        info!(
            "worker {} started: rpc {rpc_addr}, data port {}",
            cfg.worker_id,
            data_server.port()
        );
        Ok(Self {
            manager,
            reaper,
            data_server,
            rpc_addr,
            shutdown,
            rpc_task,
        })
    }

    pub fn manager(&self) -> &Arc<BlockDataManager> {
        &self.manager
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    pub fn data_server(&self) -> &dyn DataServer {
        self.data_server.as_ref()
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        let served = self.rpc_task.await.context("RPC server task failed")?;
        self.data_server.close().await;
        self.reaper.stop();
        self.reaper.join().await;
        self.manager.shutdown().await;
        info!("worker stopped");
        served
    }
}

/// Stops what `Worker::start` already brought up before it failed.
async fn abort_start(
    manager: &BlockDataManager,
    reaper: Reaper,
    data_server: Option<&dyn DataServer>,
) {
    warn!("worker start failed, stopping started services");
    if let Some(server) = data_server {
        server.close().await;
    }
    reaper.stop();
    reaper.join().await;
    manager.shutdown().await;
}

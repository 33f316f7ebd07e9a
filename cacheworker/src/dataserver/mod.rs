//! Bulk block transfer endpoint.
//!
//! The block manager only needs to know the port a data server listens on and
//! whether it is still open. Implementations are picked by name from a
//! [`DataServerRegistry`]; `tcp` is always registered.

pub mod tcp;

use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::block::BlockDataManager;

pub use tcp::TcpDataServer;

pub const DEFAULT_DATA_SERVER: &str = "tcp";

#[async_trait]
pub trait DataServer: Send + Sync {
    fn port(&self) -> u16;

    fn is_closed(&self) -> bool;

    /// Stops accepting connections and waits for the accept loop to exit.
    async fn close(&self);
}

pub type DataServerNewFunc = fn(
    SocketAddr,
    Arc<BlockDataManager>,
) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = anyhow::Result<Box<dyn DataServer>>> + Send>,
>;

pub struct DataServerRegistry {
    factories: BTreeMap<String, DataServerNewFunc>,
}

impl Default for DataServerRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
        };
        registry.register(DEFAULT_DATA_SERVER, |addr, manager| {
            Box::pin(new_tcp_data_server(addr, manager))
        });
        registry
    }
}

async fn new_tcp_data_server(
    addr: SocketAddr,
    manager: Arc<BlockDataManager>,
) -> anyhow::Result<Box<dyn DataServer>> {
    let server = TcpDataServer::bind(addr, manager).await?;
    Ok(Box::new(server))
}

impl DataServerRegistry {
    pub fn register(&mut self, name: &str, func: DataServerNewFunc) {
        self.factories.insert(name.to_string(), func);
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub async fn create(
        &self,
        name: &str,
        addr: SocketAddr,
        manager: Arc<BlockDataManager>,
    ) -> anyhow::Result<Box<dyn DataServer>> {
        let func = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "unknown data server {name:?}, available: {}",
                self.names().join(", ")
            )
        })?;
        func(addr, manager).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        let registry = DataServerRegistry::default();
        assert_eq!(registry.names(), vec!["tcp"]);
    }

    #[test]
    fn test_register_custom() {
        let mut registry = DataServerRegistry::default();
        registry.register("none", |_, _| {
            Box::pin(async { Err::<Box<dyn DataServer>, _>(anyhow!("disabled")) })
        });
        assert_eq!(registry.names(), vec!["none", "tcp"]);
    }
}

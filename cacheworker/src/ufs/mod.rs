//! Under file system (durable store) adapter.
//!
//! Submodules:
//! - `local`: adapter that maps durable paths below a local root directory
//!
//! Durable paths are absolute, `/`-separated strings independent of the
//! backend (e.g. `/workers/3/users/17/42`).

pub mod local;

use async_trait::async_trait;
use std::io;
use tokio::io::AsyncWrite;

pub use local::LocalUnderFileSystem;

pub type UfsWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[async_trait]
pub trait UnderFileSystem: Send + Sync {
    /// Creates `path` and all missing parents.
    async fn mkdirs(&self, path: &str) -> io::Result<()>;

    /// Creates (or truncates) the object at `path` and returns a writer for it.
    async fn create(&self, path: &str) -> io::Result<UfsWriter>;

    async fn rename(&self, src: &str, dst: &str) -> io::Result<()>;

    /// Removes `path`. A missing path is not an error.
    async fn delete(&self, path: &str, recursive: bool) -> io::Result<()>;

    async fn exists(&self, path: &str) -> io::Result<bool>;
}

/// Joins durable path segments with exactly one `/` between them.
pub fn join_path(base: &str, child: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        child.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/workers/1", "users"), "/workers/1/users");
        assert_eq!(join_path("/workers/1/", "/users"), "/workers/1/users");
        assert_eq!(join_path("/", "data"), "/data");
    }
}

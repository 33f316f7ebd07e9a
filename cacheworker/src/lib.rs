// Library crate of the cache worker: re-export modules for the daemon binary and integration tests.

pub mod block;
pub mod checkpoint;
pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod dataserver;
pub mod error;
pub mod server;
pub mod ufs;
pub mod worker;

pub use error::{Result, WorkerError};

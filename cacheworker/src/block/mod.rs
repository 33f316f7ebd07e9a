//! Worker side block management
//!
//! Responsibilities:
//! - Track the blocks held in the local data folder and the temporary blocks
//!   sessions are still writing.
//! - Pin blocks with per-session reference-counted locks.
//! - Account space reservations against the worker capacity and evict cold,
//!   unlocked blocks when a reservation does not fit.
//! - Keep sessions alive on heartbeats and reclaim the ones that went silent.
//!
//! Submodules:
//! - `store`: block metadata and local/durable folder layout
//! - `lock`: block lock table
//! - `space`: space allocator with LRU eviction
//! - `session`: session registry
//! - `reaper`: background reclamation of expired sessions
//! - `manager`: `BlockDataManager`, the facade the RPC layer talks to
pub mod lock;
pub mod manager;
pub mod reaper;
pub mod session;
pub mod space;
pub mod store;

pub use manager::{BlockDataManager, ManagerOptions, SessionUsage};
pub use reaper::Reaper;

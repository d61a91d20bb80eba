//! Per-placement connection reuse and deadlock-avoidance core for a sharded
//! SQL coordinator.
//!
//! Given the list of shard placements one statement is about to touch, this
//! crate decides which single open connection — if any — must be reused for
//! all of them, and refuses combinations that would either deadlock the
//! coordinator against itself or let a later read miss an earlier write in
//! the same transaction (read-your-own-writes). It also classifies, at
//! commit time, which shards survived on at least one placement and which
//! didn't.
//!
//! # Components
//!
//! - **`types`** — placements, access kinds, and acquire flags: the inputs
//! - **`connection`** — the shared, mutable connection reference and the
//!   handle trait a pool adapter implements
//! - **`adapter`** — the pool and catalog traits this crate is generic over
//! - **`index`** — the Placement Index and Colocation Index entry types
//! - **`manager`** — [`PlacementConnectionManager`], where the rules live
//! - **`error`** — the typed failures acquire and commit can produce
//!
//! Opening sockets, speaking a wire protocol, and persisting shard state are
//! all out of scope; [`adapter::ConnectionPool`] and [`adapter::CatalogAdapter`]
//! are the seams a real coordinator plugs into.

pub mod adapter;
pub mod connection;
pub mod error;
pub mod index;
pub mod manager;
pub mod types;

pub use adapter::{CatalogAdapter, ConnectionPool, ShardPlacementState};
pub use connection::{ConnectionHandle, ConnectionRef, SharedConnectionRef};
pub use error::{PlacementConnectionError, PlacementConnectionResult};
pub use index::{ColocatedEntry, ColocationKey, PlacementEntry, MAX_NODE_LENGTH};
pub use manager::{PlacementConnectionManager, PlacementConnectionManagerConfig, PlacementSnapshot};
pub use types::{
    AccessKind, AcquireFlags, Placement, PlacementAccess, PartitionMethod, FORCE_NEW_CONNECTION,
    FOR_DDL, FOR_DML, INVALID_SHARD_ID,
};

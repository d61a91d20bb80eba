//! External collaborators (§6): the connection pool and the metadata catalog.
//!
//! Neither is implemented here — opening sockets, speaking the wire protocol,
//! and persisting shard state are all explicitly out of scope (§1, §12).
//! These traits are the contract a real adapter, or a test mock, implements.

use crate::connection::ConnectionHandle;

/// The connection pool boundary (§6 "Pool adapter contract").
pub trait ConnectionPool {
    type Handle: ConnectionHandle;
    type Error: std::error::Error + 'static;

    /// Start a new connection to `(node_name, node_port)`. `flags` carries
    /// `FOR_DML`/`FOR_DDL` plus whatever opaque bits the caller set; the core
    /// forwards them unchanged and never inspects bits it doesn't define.
    fn start_node_connection(
        &mut self,
        flags: u32,
        node_name: &str,
        node_port: u16,
    ) -> Result<Self::Handle, Self::Error>;

    /// Block until the connection above is ready or has failed. Acquire's
    /// eager variant calls this; the lazy variant may defer it to the caller.
    fn finish_connection_establishment(&mut self, handle: &Self::Handle) -> Result<(), Self::Error>;

    /// The role to use when the caller didn't specify one.
    fn current_user_name(&self) -> String;
}

/// A shard placement's persisted state, as tracked by the metadata catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardPlacementState {
    Finalized,
    Inactive,
    /// Any other catalog state (e.g. `TO_DELETE`); commit-time classification
    /// only ever acts on `Finalized`, so further variants are opaque to it.
    Other,
}

/// The metadata catalog boundary (§6 "Catalog adapter contract").
pub trait CatalogAdapter {
    type Error: std::error::Error + 'static;

    fn load_group_shard_placement(
        &mut self,
        shard_id: u64,
        placement_id: u64,
    ) -> Result<ShardPlacementState, Self::Error>;

    fn update_shard_placement_state(
        &mut self,
        placement_id: u64,
        new_state: ShardPlacementState,
    ) -> Result<(), Self::Error>;
}

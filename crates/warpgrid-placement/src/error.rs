//! Typed failures the core can return.

use thiserror::Error;

/// Errors produced by [`crate::manager::PlacementConnectionManager`].
///
/// Generic over the pool adapter's and catalog adapter's own error types so a
/// collaborator failure keeps its original type instead of being flattened
/// into a string early (`source()` chains through to it).
#[derive(Debug, Error)]
pub enum PlacementConnectionError<PE, CE>
where
    PE: std::error::Error + 'static,
    CE: std::error::Error + 'static,
{
    #[error(
        "cannot perform DDL on placement {placement_id}, which has been read over multiple connections"
    )]
    DdlOnSecondaryRead { placement_id: u64 },

    #[error(
        "cannot perform DDL on placement {placement_id} since a co-located placement has been read over multiple connections"
    )]
    DdlOnColocatedSecondaryRead { placement_id: u64 },

    #[error("cannot perform query with placements that were modified over multiple connections")]
    MultiConnectionWrite,

    #[error(
        "cannot establish a new connection for placement {placement_id}, since DDL has been executed on a connection that is in use"
    )]
    NewConnOverDdl { placement_id: u64 },

    #[error(
        "cannot establish a new connection for placement {placement_id}, since DML has been executed on a connection that is in use"
    )]
    NewConnOverDml { placement_id: u64 },

    #[error(
        "cannot perform a parallel DDL command because multiple placements have been accessed over the same connection"
    )]
    ParallelDdl,

    #[error("could not make changes to shard {shard_id} on any node")]
    ShardAllPlacementsFailed { shard_id: u64 },

    #[error("could not commit transaction on any active node")]
    NoShardCommitted,

    /// A failure surfaced by the connection pool adapter (e.g. the node could
    /// not be reached). Not one of the eight logical rule/commit failures
    /// above — this forwards the adapter's own error unchanged.
    #[error("connection pool error: {0}")]
    Pool(#[source] PE),

    /// A failure surfaced by the catalog adapter while transitioning a shard
    /// placement's state.
    #[error("catalog error: {0}")]
    Catalog(#[source] CE),
}

/// Result type alias for manager operations.
pub type PlacementConnectionResult<T, PE, CE> = Result<T, PlacementConnectionError<PE, CE>>;

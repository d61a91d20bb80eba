//! Placement and access-kind types — the inputs to an acquire call.

/// How a distributed table's rows are assigned to shards.
///
/// Only `Hash` and `None` participate in colocation (see
/// [`crate::index::ColocationKey`]); `Range` and `Append` placements always get
/// their own connection reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionMethod {
    Hash,
    None,
    Range,
    Append,
}

impl PartitionMethod {
    /// Whether placements of this method participate in colocation groups.
    pub fn is_colocatable(self) -> bool {
        matches!(self, PartitionMethod::Hash | PartitionMethod::None)
    }
}

/// One physical copy of a shard on one worker node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub placement_id: u64,
    /// [`INVALID_SHARD_ID`] marks an empty-prune placeholder that carries no
    /// connection state and is skipped entirely by acquire.
    pub shard_id: u64,
    pub node_name: String,
    pub node_port: u16,
    pub partition_method: PartitionMethod,
    pub colocation_group_id: u32,
    pub representative_value: u32,
}

/// Sentinel `shardId` used by empty-pruned SELECTs that fall back to a dummy
/// placement. Placements carrying this id require no indexing.
pub const INVALID_SHARD_ID: u64 = u64::MAX;

impl Placement {
    pub fn is_invalid(&self) -> bool {
        self.shard_id == INVALID_SHARD_ID
    }
}

/// The kind of SQL operation a placement is being accessed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Select,
    Dml,
    Ddl,
}

impl AccessKind {
    pub fn is_modifying(self) -> bool {
        matches!(self, AccessKind::Dml | AccessKind::Ddl)
    }
}

/// One placement touched by the current statement, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementAccess {
    pub placement: Placement,
    pub access_kind: AccessKind,
}

impl PlacementAccess {
    pub fn new(placement: Placement, access_kind: AccessKind) -> Self {
        Self { placement, access_kind }
    }
}

/// Forbid reuse of an existing connection; always open a fresh one.
pub const FORCE_NEW_CONNECTION: u32 = 1 << 0;
/// Signal that the access list is going to perform DML (modifications).
pub const FOR_DML: u32 = 1 << 1;
/// Signal that the access list is going to perform DDL.
pub const FOR_DDL: u32 = 1 << 2;

/// Flag bits recognized by acquire. Unrecognized bits are opaque and are
/// forwarded to the pool adapter unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireFlags(pub u32);

impl AcquireFlags {
    pub fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub fn force_new_connection(self) -> bool {
        self.0 & FORCE_NEW_CONNECTION != 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

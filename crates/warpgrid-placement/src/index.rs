//! The Placement Index (PI), Colocation Index (CI), and their entry types.
//!
//! The Shard Index (SI) itself is just `HashMap<u64, Vec<u64>>` (shard id to
//! member placement ids, in first-seen order) and lives directly on
//! [`crate::manager::PlacementConnectionManager`] — there was no separate
//! entry type worth factoring out for it (see `ShardEntry` below, kept only
//! to name the concept in one place).

use std::cell::RefCell;
use std::rc::Rc;

use crate::connection::SharedConnectionRef;

/// Fixed bound used when comparing/hashing a colocation key's node name,
/// mirroring the fixed `strcpy` buffer of the source this core is modeled on
/// (see DESIGN.md, "Colocation key string comparison"). Node names are
/// truncated to this many bytes before use; two names differing only beyond
/// it are treated as identical, by design.
pub const MAX_NODE_LENGTH: usize = 64;

/// Identifies a set of colocated placements on one node: same host, same
/// colocation group, same hash-range slice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColocationKey {
    node_name: String,
    node_port: u16,
    colocation_group_id: u32,
    representative_value: u32,
}

impl ColocationKey {
    pub fn new(
        node_name: &str,
        node_port: u16,
        colocation_group_id: u32,
        representative_value: u32,
    ) -> Self {
        let truncated: String = node_name.chars().take(MAX_NODE_LENGTH).collect();
        Self {
            node_name: truncated,
            node_port,
            colocation_group_id,
            representative_value,
        }
    }
}

/// The set of colocated placements on a single node sharing one primary
/// connection (§4.2). Only hash- and none-partitioned placements participate.
#[derive(Debug)]
pub struct ColocatedEntry<H> {
    pub key: ColocationKey,
    pub primary: SharedConnectionRef<H>,
    pub has_secondary: bool,
}

/// A [`ColocatedEntry`] shared by every `PlacementEntry` that participates in
/// it (I2) — `Rc<RefCell<_>>` for the same single-threaded-arena reason as
/// [`SharedConnectionRef`].
pub type SharedColocatedEntry<H> = Rc<RefCell<ColocatedEntry<H>>>;

/// One placement's state within the current transaction (§3).
#[derive(Debug)]
pub struct PlacementEntry<H> {
    pub placement_id: u64,
    /// Set by commit-time classification (§4.4) when this placement's write
    /// did not survive. Never read back by acquire.
    pub failed: bool,
    pub primary: SharedConnectionRef<H>,
    /// Monotonic within a transaction (I3): once another connection has read
    /// this placement, it stays `true` even if that connection later closes.
    pub has_secondary: bool,
    pub colocated: Option<SharedColocatedEntry<H>>,
}

/// Named for symmetry with the spec's §3 data model; the manager stores the
/// member list directly as `Vec<u64>` rather than a dedicated struct.
pub struct ShardEntry;

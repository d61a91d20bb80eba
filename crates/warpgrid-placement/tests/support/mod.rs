//! In-memory `ConnectionPool`/`CatalogAdapter` pair used by the scenario and
//! property tests. Not part of the crate's public API.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use warpgrid_placement::{CatalogAdapter, ConnectionHandle, ConnectionPool, ShardPlacementState};

#[derive(Debug, Clone)]
pub struct MockHandle {
    id: u64,
    state: Rc<MockConnState>,
}

#[derive(Debug)]
struct MockConnState {
    claimed_exclusively: Cell<bool>,
    remote_failed: Cell<bool>,
}

impl PartialEq for MockHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for MockHandle {}
impl std::hash::Hash for MockHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl MockHandle {
    pub fn claim_exclusively(&self) {
        self.state.claimed_exclusively.set(true);
    }

    pub fn release(&self) {
        self.state.claimed_exclusively.set(false);
    }

    pub fn fail_remote_transaction(&self) {
        self.state.remote_failed.set(true);
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl ConnectionHandle for MockHandle {
    fn claimed_exclusively(&self) -> bool {
        self.state.claimed_exclusively.get()
    }

    fn remote_transaction_failed(&self) -> bool {
        self.state.remote_failed.get()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MockPoolError {
    #[error("node {0} is unreachable")]
    Unreachable(String),
}

/// A pool that hands out one fresh `MockHandle` per call, never actually
/// connecting anywhere.
pub struct MockPool {
    next_id: u64,
    user: String,
    unreachable: Vec<String>,
}

impl MockPool {
    pub fn new(user: &str) -> Self {
        Self { next_id: 0, user: user.to_owned(), unreachable: Vec::new() }
    }

    pub fn mark_unreachable(&mut self, node_name: &str) {
        self.unreachable.push(node_name.to_owned());
    }
}

impl ConnectionPool for MockPool {
    type Handle = MockHandle;
    type Error = MockPoolError;

    fn start_node_connection(
        &mut self,
        _flags: u32,
        node_name: &str,
        _node_port: u16,
    ) -> Result<Self::Handle, Self::Error> {
        if self.unreachable.iter().any(|n| n == node_name) {
            return Err(MockPoolError::Unreachable(node_name.to_owned()));
        }
        self.next_id += 1;
        Ok(MockHandle {
            id: self.next_id,
            state: Rc::new(MockConnState {
                claimed_exclusively: Cell::new(false),
                remote_failed: Cell::new(false),
            }),
        })
    }

    fn finish_connection_establishment(&mut self, _handle: &Self::Handle) -> Result<(), Self::Error> {
        Ok(())
    }

    fn current_user_name(&self) -> String {
        self.user.clone()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("no such shard placement {0}")]
pub struct MockCatalogError(pub u64);

/// Tracks each placement's `ShardPlacementState`, starting `Finalized`.
#[derive(Default)]
pub struct MockCatalog {
    states: HashMap<u64, ShardPlacementState>,
    transitions: Vec<(u64, ShardPlacementState)>,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_of(&self, placement_id: u64) -> ShardPlacementState {
        self.states.get(&placement_id).copied().unwrap_or(ShardPlacementState::Finalized)
    }

    pub fn transitions(&self) -> &[(u64, ShardPlacementState)] {
        &self.transitions
    }
}

impl CatalogAdapter for MockCatalog {
    type Error = MockCatalogError;

    fn load_group_shard_placement(
        &mut self,
        _shard_id: u64,
        placement_id: u64,
    ) -> Result<ShardPlacementState, Self::Error> {
        Ok(self.state_of(placement_id))
    }

    fn update_shard_placement_state(
        &mut self,
        placement_id: u64,
        new_state: ShardPlacementState,
    ) -> Result<(), Self::Error> {
        self.states.insert(placement_id, new_state);
        self.transitions.push((placement_id, new_state));
        Ok(())
    }
}

pub fn placement(
    placement_id: u64,
    shard_id: u64,
    node_name: &str,
    node_port: u16,
) -> warpgrid_placement::Placement {
    warpgrid_placement::Placement {
        placement_id,
        shard_id,
        node_name: node_name.to_owned(),
        node_port,
        partition_method: warpgrid_placement::PartitionMethod::Hash,
        colocation_group_id: 0,
        representative_value: 0,
    }
}

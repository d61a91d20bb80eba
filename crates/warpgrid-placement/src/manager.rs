//! The core state machine: acquire (§4.1), entry lookup (§4.2), reuse rules
//! (§4.3), commit-time classification (§4.4), connection closure (§4.5), and
//! the transaction-end reset (§4.6).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, error, warn};

use crate::adapter::{CatalogAdapter, ConnectionPool, ShardPlacementState};
use crate::connection::{ConnectionHandle, SharedConnectionRef, new_shared_ref};
use crate::error::{PlacementConnectionError, PlacementConnectionResult};
use crate::index::{ColocatedEntry, ColocationKey, PlacementEntry, SharedColocatedEntry};
use crate::types::{AccessKind, FORCE_NEW_CONNECTION, Placement, PlacementAccess};

/// Pre-sizing hints for the three indices (§11). Capacity only — not policy.
#[derive(Debug, Clone, Copy)]
pub struct PlacementConnectionManagerConfig {
    pub initial_placement_capacity: usize,
    pub initial_colocation_capacity: usize,
    pub initial_shard_capacity: usize,
}

impl Default for PlacementConnectionManagerConfig {
    fn default() -> Self {
        Self {
            initial_placement_capacity: 64,
            initial_colocation_capacity: 64,
            initial_shard_capacity: 64,
        }
    }
}

/// A read-only snapshot of one placement's connection state, for inspection
/// and testing. Not part of the acquire/commit control flow itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementSnapshot<H> {
    pub conn: Option<H>,
    pub had_ddl: bool,
    pub had_dml: bool,
    pub has_secondary: bool,
    pub colocated_has_secondary: bool,
}

/// Outcome of classifying one shard's placements at commit time (§4.4).
enum ShardCheckOutcome {
    /// No shard-wide failure; any individually-failed placements were
    /// transitioned in the catalog.
    Ok,
    /// Every modifying placement of this shard failed — the shard is
    /// unrepresented.
    AllFailed,
}

/// The per-transaction core: Placement Index, Colocation Index, and Shard
/// Index, plus the connection-closure side-table that plays the role of each
/// connection's intrusive `referencedRefs` list (§4.5).
///
/// Generic over the pool and catalog adapters (§6.1) so the logic here never
/// depends on a concrete wire protocol or catalog backend. Built on
/// `Rc<RefCell<_>>`, not `Arc<Mutex<_>>`: §5 specifies a single-threaded
/// coordinator backend, and a lock would misrepresent that model.
pub struct PlacementConnectionManager<P: ConnectionPool, C: CatalogAdapter> {
    pool: P,
    catalog: C,
    placements: HashMap<u64, PlacementEntry<P::Handle>>,
    colocated: HashMap<ColocationKey, SharedColocatedEntry<P::Handle>>,
    shards: HashMap<u64, Vec<u64>>,
    referenced: HashMap<P::Handle, Vec<SharedConnectionRef<P::Handle>>>,
}

impl<P: ConnectionPool, C: CatalogAdapter> PlacementConnectionManager<P, C> {
    /// Equivalent of `init_placement_connection_management()` (§6): builds
    /// the three indices pre-sized per `config`.
    pub fn new(pool: P, catalog: C) -> Self {
        Self::with_config(pool, catalog, PlacementConnectionManagerConfig::default())
    }

    pub fn with_config(pool: P, catalog: C, config: PlacementConnectionManagerConfig) -> Self {
        Self {
            pool,
            catalog,
            placements: HashMap::with_capacity(config.initial_placement_capacity),
            colocated: HashMap::with_capacity(config.initial_colocation_capacity),
            shards: HashMap::with_capacity(config.initial_shard_capacity),
            referenced: HashMap::new(),
        }
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut P {
        &mut self.pool
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    /// Equivalent of `reset_placement_connection_management()` (§4.6):
    /// empties PI, CI, and SI. Called on both commit and abort.
    pub fn reset(&mut self) {
        self.placements.clear();
        self.colocated.clear();
        self.shards.clear();
        self.referenced.clear();
    }

    /// Equivalent of the pool's close hook invoking `on_connection_closing`
    /// (§4.5). Sets `conn = None` on every reference that pointed at
    /// `handle`, leaving `had_dml`/`had_ddl` untouched so a later acquire
    /// sees the frozen history.
    pub fn on_connection_closing(&mut self, handle: &P::Handle) {
        if let Some(refs) = self.referenced.remove(handle) {
            for r in refs {
                r.borrow_mut().conn = None;
            }
        }
    }

    /// A read-only snapshot of a placement's current connection state.
    pub fn placement_snapshot(&self, placement_id: u64) -> Option<PlacementSnapshot<P::Handle>> {
        let entry = self.placements.get(&placement_id)?;
        let r = entry.primary.borrow();
        let colocated_has_secondary =
            entry.colocated.as_ref().map(|c| c.borrow().has_secondary).unwrap_or(false);
        Some(PlacementSnapshot {
            conn: r.conn.clone(),
            had_ddl: r.had_ddl,
            had_dml: r.had_dml,
            has_secondary: entry.has_secondary,
            colocated_has_secondary,
        })
    }

    /// Whether two placements currently share the same physical
    /// `ConnectionRef` object (I2/I4's "same object identity" requirement).
    pub fn shares_connection_identity(&self, placement_a: u64, placement_b: u64) -> bool {
        match (self.placements.get(&placement_a), self.placements.get(&placement_b)) {
            (Some(a), Some(b)) => Rc::ptr_eq(&a.primary, &b.primary),
            _ => false,
        }
    }

    /// §4.2: find or create the `PlacementEntry` for `placement`, wiring up
    /// its colocation group if applicable, and associating it with its shard
    /// for commit-time classification.
    fn find_or_create_placement_entry(&mut self, placement: &Placement) -> SharedConnectionRef<P::Handle> {
        if !self.placements.contains_key(&placement.placement_id) {
            let (primary, colocated) = if placement.partition_method.is_colocatable() {
                let key = ColocationKey::new(
                    &placement.node_name,
                    placement.node_port,
                    placement.colocation_group_id,
                    placement.representative_value,
                );
                let shared = self
                    .colocated
                    .entry(key.clone())
                    .or_insert_with(|| {
                        Rc::new(RefCell::new(ColocatedEntry {
                            key: key.clone(),
                            primary: new_shared_ref(),
                            has_secondary: false,
                        }))
                    })
                    .clone();
                let primary = shared.borrow().primary.clone();
                (primary, Some(shared))
            } else {
                (new_shared_ref(), None)
            };

            self.placements.insert(
                placement.placement_id,
                PlacementEntry {
                    placement_id: placement.placement_id,
                    failed: false,
                    primary,
                    has_secondary: false,
                    colocated,
                },
            );
        }

        self.associate_placement_with_shard(placement);
        self.placements[&placement.placement_id].primary.clone()
    }

    /// §4.2's last step: records shard→placement membership in SI, used only
    /// at commit. A placement is linked at most once per shard (I5).
    fn associate_placement_with_shard(&mut self, placement: &Placement) {
        let members = self.shards.entry(placement.shard_id).or_default();
        if !members.contains(&placement.placement_id) {
            members.push(placement.placement_id);
        }
    }

    /// §4.3: whether an existing connection reference can be reused as-is.
    fn reusable(&self, flags: u32, user: &str, connection_ref: &SharedConnectionRef<P::Handle>) -> bool {
        let r = connection_ref.borrow();
        // Precondition made explicit (§9 ambiguity): bail before touching
        // `r.user` if no connection has ever been bound.
        let Some(conn) = r.conn.as_ref() else {
            return false;
        };
        if conn.claimed_exclusively() {
            return false;
        }
        if flags & FORCE_NEW_CONNECTION != 0 {
            return false;
        }
        r.user == user
    }

    /// §4.1: resolve the one connection valid for every access in `accesses`,
    /// or fail with a typed reason (§7). `accesses` must be non-empty.
    pub fn start_placement_list_connection(
        &mut self,
        flags: u32,
        accesses: &[PlacementAccess],
        user: Option<&str>,
    ) -> PlacementConnectionResult<P::Handle, P::Error, C::Error> {
        debug_assert!(!accesses.is_empty(), "acquire requires a non-empty access list");

        let user = match user {
            Some(u) => u.to_owned(),
            None => self.pool.current_user_name(),
        };

        let mut chosen: Option<P::Handle> = None;
        let mut found_modifying = false;

        // ── Selection pass (§4.1.1) ──────────────────────────────────
        for access in accesses {
            if access.placement.is_invalid() {
                continue;
            }

            let placement_id = access.placement.placement_id;
            let access_kind = access.access_kind;
            let connection_ref = self.find_or_create_placement_entry(&access.placement);

            let entry = &self.placements[&placement_id];
            let has_secondary = entry.has_secondary;
            let colocated_has_secondary =
                entry.colocated.as_ref().map(|c| c.borrow().has_secondary).unwrap_or(false);

            let (conn_is_none, had_ddl, had_dml, matches_chosen) = {
                let r = connection_ref.borrow();
                let matches_chosen = match (&r.conn, &chosen) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                };
                (r.conn.is_none(), r.had_ddl, r.had_dml, matches_chosen)
            };

            if conn_is_none {
                // R1: no connection chosen for this placement yet.
            } else if access_kind == AccessKind::Ddl && has_secondary {
                warn!(placement_id, rule = "R2", "DDL on placement read over multiple connections");
                return Err(PlacementConnectionError::DdlOnSecondaryRead { placement_id });
            } else if access_kind == AccessKind::Ddl && colocated_has_secondary {
                warn!(
                    placement_id,
                    rule = "R3",
                    "DDL on placement whose co-located sibling was read over multiple connections"
                );
                return Err(PlacementConnectionError::DdlOnColocatedSecondaryRead { placement_id });
            } else if found_modifying && (had_ddl || had_dml) && !matches_chosen {
                warn!(placement_id, rule = "R4", "placements modified over multiple connections");
                return Err(PlacementConnectionError::MultiConnectionWrite);
            } else if self.reusable(flags, &user, &connection_ref) {
                // R5: reuse this placement's existing connection.
                chosen = connection_ref.borrow().conn.clone();
                if had_ddl || had_dml {
                    found_modifying = true;
                }
                debug!(placement_id, rule = "R5", "reusing existing connection");
            } else if had_ddl {
                warn!(placement_id, rule = "R6", "in-use connection already executed DDL");
                return Err(PlacementConnectionError::NewConnOverDdl { placement_id });
            } else if had_dml {
                warn!(placement_id, rule = "R7", "in-use connection already executed DML");
                return Err(PlacementConnectionError::NewConnOverDml { placement_id });
            } else if access_kind == AccessKind::Ddl {
                warn!(placement_id, rule = "R8", "parallel DDL across connections forbidden");
                return Err(PlacementConnectionError::ParallelDdl);
            } else {
                // R9: a previous read via a different, now-claimed
                // connection is tolerable for a non-DDL access.
            }
        }

        let chosen = match chosen {
            Some(c) => c,
            None => {
                let first = &accesses[0].placement;
                let handle = self
                    .pool
                    .start_node_connection(flags, &first.node_name, first.node_port)
                    .map_err(PlacementConnectionError::Pool)?;
                self.pool
                    .finish_connection_establishment(&handle)
                    .map_err(PlacementConnectionError::Pool)?;
                debug!(node = %first.node_name, port = first.node_port, "opened new connection");
                handle
            }
        };

        // ── Installation pass (§4.1.2) ───────────────────────────────
        for access in accesses {
            if access.placement.is_invalid() {
                continue;
            }

            let placement_id = access.placement.placement_id;
            let access_kind = access.access_kind;
            let connection_ref = self.placements[&placement_id].primary.clone();

            let (conn_eq_chosen, conn_is_none) = {
                let r = connection_ref.borrow();
                (r.conn.as_ref() == Some(&chosen), r.conn.is_none())
            };

            if conn_eq_chosen {
                // Already using the chosen connection — no change.
            } else if conn_is_none {
                {
                    let mut r = connection_ref.borrow_mut();
                    r.conn = Some(chosen.clone());
                    r.user = user.clone();
                    r.had_ddl = false;
                    r.had_dml = false;
                }
                self.referenced.entry(chosen.clone()).or_default().push(connection_ref.clone());
            } else {
                // Held a different connection previously; R4/R6/R7 would
                // already have fired unless that prior use was SELECT-only.
                if access_kind != AccessKind::Select {
                    let mut r = connection_ref.borrow_mut();
                    debug_assert!(!r.had_ddl && !r.had_dml);
                    r.conn = Some(chosen.clone());
                    r.user = user.clone();
                }

                if let Some(entry) = self.placements.get_mut(&placement_id) {
                    entry.has_secondary = true;
                    if let Some(colocated) = &entry.colocated {
                        colocated.borrow_mut().has_secondary = true;
                    }
                }
            }

            let mut r = connection_ref.borrow_mut();
            r.had_ddl |= access_kind == AccessKind::Ddl;
            r.had_dml |= access_kind == AccessKind::Dml;
        }

        Ok(chosen)
    }

    /// §4.4 per-shard classification, shared by both commit-time entry
    /// points.
    fn check_shard_placements(
        &mut self,
        shard_id: u64,
    ) -> PlacementConnectionResult<ShardCheckOutcome, P::Error, C::Error> {
        let member_ids = self.shards.get(&shard_id).cloned().unwrap_or_default();

        let mut failures = 0usize;
        let mut successes = 0usize;
        let mut failed_ids = Vec::new();

        for placement_id in &member_ids {
            let Some(entry) = self.placements.get(placement_id) else { continue };
            let (had_write, conn_is_none, remote_failed) = {
                let r = entry.primary.borrow();
                let had_write = r.had_ddl || r.had_dml;
                let remote_failed = r.conn.as_ref().is_some_and(|c| c.remote_transaction_failed());
                (had_write, r.conn.is_none(), remote_failed)
            };

            // Read-only placements cannot be made invalid.
            if !had_write {
                continue;
            }

            if conn_is_none || remote_failed {
                failures += 1;
                failed_ids.push(*placement_id);
            } else {
                successes += 1;
            }
        }

        if failures > 0 && successes == 0 {
            return Ok(ShardCheckOutcome::AllFailed);
        }

        for placement_id in failed_ids {
            if let Some(entry) = self.placements.get_mut(&placement_id) {
                entry.failed = true;
            }

            let state = self
                .catalog
                .load_group_shard_placement(shard_id, placement_id)
                .map_err(PlacementConnectionError::Catalog)?;
            if state == ShardPlacementState::Finalized {
                self.catalog
                    .update_shard_placement_state(placement_id, ShardPlacementState::Inactive)
                    .map_err(PlacementConnectionError::Catalog)?;
            }
        }

        Ok(ShardCheckOutcome::Ok)
    }

    /// §4.4 pre-commit classifier. Errors here are always fatal, so 2PC
    /// never attempts to commit a transaction with an unrepresented shard.
    pub fn mark_failed_shard_placements(&mut self) -> PlacementConnectionResult<(), P::Error, C::Error> {
        let shard_ids: Vec<u64> = self.shards.keys().copied().collect();
        for shard_id in shard_ids {
            if let ShardCheckOutcome::AllFailed = self.check_shard_placements(shard_id)? {
                error!(shard_id, "could not make changes to shard on any node");
                return Err(PlacementConnectionError::ShardAllPlacementsFailed { shard_id });
            }
        }
        Ok(())
    }

    /// §4.4 post-commit classifier. When `using_2pc` is false, a single
    /// shard's failure is downgraded to a warning (some remote transactions
    /// may already have committed), but the aggregate all-failed case is
    /// still fatal.
    pub fn post_commit_mark_failed_shard_placements(
        &mut self,
        using_2pc: bool,
    ) -> PlacementConnectionResult<(), P::Error, C::Error> {
        let shard_ids: Vec<u64> = self.shards.keys().copied().collect();
        let mut attempts = 0usize;
        let mut successes = 0usize;

        for shard_id in shard_ids {
            attempts += 1;
            match self.check_shard_placements(shard_id)? {
                ShardCheckOutcome::Ok => successes += 1,
                ShardCheckOutcome::AllFailed if using_2pc => {
                    error!(shard_id, "could not commit transaction for shard on any active node");
                    return Err(PlacementConnectionError::ShardAllPlacementsFailed { shard_id });
                }
                ShardCheckOutcome::AllFailed => {
                    warn!(shard_id, "could not commit transaction for shard on any active node");
                }
            }
        }

        if attempts > 0 && successes == 0 {
            error!("could not commit transaction on any active node");
            return Err(PlacementConnectionError::NoShardCommitted);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::types::PartitionMethod;

    #[derive(Debug, Clone)]
    struct FakeHandle(u64, Rc<Cell<bool>>, Rc<Cell<bool>>);

    impl PartialEq for FakeHandle {
        fn eq(&self, other: &Self) -> bool {
            self.0 == other.0
        }
    }
    impl Eq for FakeHandle {}
    impl std::hash::Hash for FakeHandle {
        fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
            self.0.hash(state);
        }
    }
    impl ConnectionHandle for FakeHandle {
        fn claimed_exclusively(&self) -> bool {
            self.1.get()
        }
        fn remote_transaction_failed(&self) -> bool {
            self.2.get()
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("unreachable")]
    struct FakePoolError;

    struct FakePool {
        next: u64,
    }
    impl ConnectionPool for FakePool {
        type Handle = FakeHandle;
        type Error = FakePoolError;
        fn start_node_connection(
            &mut self,
            _flags: u32,
            _node_name: &str,
            _node_port: u16,
        ) -> Result<Self::Handle, Self::Error> {
            self.next += 1;
            Ok(FakeHandle(self.next, Rc::new(Cell::new(false)), Rc::new(Cell::new(false))))
        }
        fn finish_connection_establishment(&mut self, _handle: &Self::Handle) -> Result<(), Self::Error> {
            Ok(())
        }
        fn current_user_name(&self) -> String {
            "u".to_owned()
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("no such placement")]
    struct FakeCatalogError;

    #[derive(Default)]
    struct FakeCatalog;
    impl CatalogAdapter for FakeCatalog {
        type Error = FakeCatalogError;
        fn load_group_shard_placement(
            &mut self,
            _shard_id: u64,
            _placement_id: u64,
        ) -> Result<ShardPlacementState, Self::Error> {
            Ok(ShardPlacementState::Finalized)
        }
        fn update_shard_placement_state(
            &mut self,
            _placement_id: u64,
            _new_state: ShardPlacementState,
        ) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    fn manager() -> PlacementConnectionManager<FakePool, FakeCatalog> {
        PlacementConnectionManager::new(FakePool { next: 0 }, FakeCatalog)
    }

    fn non_colocatable(placement_id: u64, shard_id: u64, node: &str) -> Placement {
        Placement {
            placement_id,
            shard_id,
            node_name: node.to_owned(),
            node_port: 5432,
            partition_method: PartitionMethod::Range,
            colocation_group_id: 0,
            representative_value: 0,
        }
    }

    #[test]
    fn r1_unbound_placement_passes() {
        let mut mgr = manager();
        let p = non_colocatable(1, 1, "n1");
        let h = mgr
            .start_placement_list_connection(0, &[PlacementAccess::new(p, AccessKind::Select)], None)
            .unwrap();
        assert_eq!(mgr.placement_snapshot(1).unwrap().conn, Some(h));
    }

    #[test]
    fn r6_new_connection_over_ddl_rejected() {
        let mut mgr = manager();
        let p = non_colocatable(1, 1, "n1");
        let h1 = mgr
            .start_placement_list_connection(0, &[PlacementAccess::new(p.clone(), AccessKind::Ddl)], None)
            .unwrap();
        h1.1.set(true); // claimedExclusively
        let err = mgr
            .start_placement_list_connection(0, &[PlacementAccess::new(p, AccessKind::Select)], None)
            .unwrap_err();
        assert!(matches!(err, PlacementConnectionError::NewConnOverDdl { placement_id: 1 }));
    }

    #[test]
    fn r7_new_connection_over_dml_rejected() {
        let mut mgr = manager();
        let p = non_colocatable(1, 1, "n1");
        let h1 = mgr
            .start_placement_list_connection(0, &[PlacementAccess::new(p.clone(), AccessKind::Dml)], None)
            .unwrap();
        h1.1.set(true);
        let err = mgr
            .start_placement_list_connection(0, &[PlacementAccess::new(p, AccessKind::Select)], None)
            .unwrap_err();
        assert!(matches!(err, PlacementConnectionError::NewConnOverDml { placement_id: 1 }));
    }

    #[test]
    fn r8_parallel_ddl_rejected() {
        let mut mgr = manager();
        let p = non_colocatable(1, 1, "n1");
        let h1 = mgr
            .start_placement_list_connection(0, &[PlacementAccess::new(p.clone(), AccessKind::Select)], None)
            .unwrap();
        h1.1.set(true);
        let err = mgr
            .start_placement_list_connection(0, &[PlacementAccess::new(p, AccessKind::Ddl)], None)
            .unwrap_err();
        assert!(matches!(err, PlacementConnectionError::ParallelDdl));
    }

    #[test]
    fn r9_secondary_select_tolerated() {
        let mut mgr = manager();
        let p = non_colocatable(1, 1, "n1");
        let h1 = mgr
            .start_placement_list_connection(0, &[PlacementAccess::new(p.clone(), AccessKind::Select)], None)
            .unwrap();
        h1.1.set(true);
        let h2 = mgr
            .start_placement_list_connection(0, &[PlacementAccess::new(p, AccessKind::Select)], None)
            .unwrap();
        assert_ne!(h1, h2);
        assert!(mgr.placement_snapshot(1).unwrap().has_secondary);
    }

    #[test]
    fn force_new_connection_flag_defeats_reuse() {
        let mut mgr = manager();
        let p = non_colocatable(1, 1, "n1");
        let h1 = mgr
            .start_placement_list_connection(0, &[PlacementAccess::new(p.clone(), AccessKind::Select)], None)
            .unwrap();
        let h2 = mgr
            .start_placement_list_connection(
                FORCE_NEW_CONNECTION,
                &[PlacementAccess::new(p, AccessKind::Select)],
                None,
            )
            .unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn different_user_defeats_reuse() {
        let mut mgr = manager();
        let p = non_colocatable(1, 1, "n1");
        let h1 = mgr
            .start_placement_list_connection(0, &[PlacementAccess::new(p.clone(), AccessKind::Select)], Some("alice"))
            .unwrap();
        let h2 = mgr
            .start_placement_list_connection(0, &[PlacementAccess::new(p, AccessKind::Select)], Some("bob"))
            .unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn invalid_shard_id_placement_is_skipped() {
        let mut mgr = manager();
        let mut p = non_colocatable(1, crate::types::INVALID_SHARD_ID, "n1");
        p.placement_id = 99;
        mgr.start_placement_list_connection(0, &[PlacementAccess::new(p, AccessKind::Select)], None)
            .unwrap();
        assert!(mgr.placement_snapshot(99).is_none());
    }
}

//! The shared, mutable connection reference (§3) and the handle trait a pool
//! adapter must implement.

use std::cell::RefCell;
use std::hash::Hash;
use std::rc::Rc;

/// A connection handle as observed by this core. The pool adapter owns the
/// real socket/session; the core only ever asks it two questions.
///
/// `Eq + Hash` lets the manager key its referenced-connections side-table
/// (§4.5) on handle identity instead of requiring the adapter to expose a
/// mutable intrusive list field on its own handle type.
pub trait ConnectionHandle: Clone + Eq + Hash {
    /// Whether the pool has leased this connection out exclusively to
    /// someone else, making it unavailable for reuse here.
    fn claimed_exclusively(&self) -> bool;

    /// Whether the remote transaction on this connection is known to have
    /// failed.
    fn remote_transaction_failed(&self) -> bool;
}

/// Registers that a connection has been used to read or modify either a
/// single placement, or — when shared — a whole colocation group.
///
/// Outlives the underlying connection: if the pool closes the connection,
/// `conn` becomes `None` but `had_dml`/`had_ddl` are left untouched, so a
/// later acquire sees the frozen history rather than silently bypassing it.
#[derive(Debug, Clone)]
pub struct ConnectionRef<H> {
    /// The user the connection was established/reused as. Connections can't
    /// be reused across users since permissions may differ.
    pub user: String,
    pub conn: Option<H>,
    /// There can only be one connection executing DML for a placement (or
    /// colocated group), to avoid deadlocks and read-your-own-writes
    /// violations.
    pub had_dml: bool,
    /// Same restriction as `had_dml`, tracked separately only so error
    /// messages can be precise about which kind of write is in conflict.
    pub had_ddl: bool,
}

impl<H> ConnectionRef<H> {
    pub fn unbound() -> Self {
        Self { user: String::new(), conn: None, had_dml: false, had_ddl: false }
    }
}

/// A [`ConnectionRef`] shared between a [`crate::index::PlacementEntry`] and,
/// when the placement is colocated, a [`crate::index::ColocatedEntry`]. I2
/// requires that both views observe the same physical object; `Rc<RefCell<_>>`
/// is the safe-Rust equivalent of a single arena allocation reached through
/// two pointers (§9's "single physical object" requirement), appropriate
/// because the whole manager is single-threaded per §5.
pub type SharedConnectionRef<H> = Rc<RefCell<ConnectionRef<H>>>;

pub fn new_shared_ref<H>() -> SharedConnectionRef<H> {
    Rc::new(RefCell::new(ConnectionRef::unbound()))
}

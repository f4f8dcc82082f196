//! Postgres-backed realization of the Task Repository and Task Queue.
//!
//! Any store offering add-if-absent set membership, check-and-set hash
//! entries, and blocking stream reads would satisfy the same contract;
//! this crate picks Postgres, reached through `sqlx`, with `FOR UPDATE
//! SKIP LOCKED` standing in for the native queue/lease primitives.

mod queue;
mod repository;
mod row;

pub use queue::{PgQueue, DEFAULT_LEASE_MS};
pub use repository::PgRepository;

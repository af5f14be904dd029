//! # Conveyor persistence
//!
//! SQL-backed storage for the orchestration engine behind a single
//! [`CoreStore`] trait:
//!
//! - [`InMemoryStore`] — the embedded driver, used by tests and as the
//!   fallback when no database server is reachable
//! - [`PostgresStore`] — the production driver, using sqlx with
//!   `$1`-style binds and `ON CONFLICT` upserts
//!
//! Events are the source of truth for a run's history; the run row's
//! status column is a denormalized cache over the ledger. Readers may
//! observe an event before the matching status update and must tolerate
//! that.

pub mod memory;
pub mod postgres;
pub mod schema;
pub mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    AnomalyFilter, CoreStore, DeadLetterFilter, Page, Pagination, RunFilter, StoreError,
    StoreHealth, TableCount,
};

//! Persistence layer: libSQL-backed storage for settings, leases, tags,
//! threads, audit and retag jobs.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;

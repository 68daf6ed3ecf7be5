//! Persistence layer: libSQL-backed task store plus chunk object storage.

pub mod libsql_backend;
pub mod migrations;
pub mod objects;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use objects::{FileObjectStore, MemoryObjectStore, ObjectStore};
pub use traits::{Completion, Database, DispatchCandidate, DispatchCursor, ExpiringEntry};

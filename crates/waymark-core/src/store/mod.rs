//! Element store backends.

mod sqlite;

pub use sqlite::SqliteElementStore;

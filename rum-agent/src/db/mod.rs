//! Local storage for buffered spans.
//!
//! SQLite in WAL mode: every append and delete is a single statement or
//! transaction, so after an unclean shutdown a record is either fully present
//! or fully absent.

pub mod sqlite;
pub mod tables;

pub use sqlite::{Database, DbConn};

//! Persistence layer — rules, groups, accounts and the attempt archive.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod seed;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{AttemptArchive, AttemptQuery, RuleStore};

//! SQLite backend for the Carebase health record.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. The composite unique indexes on events
//! and active consents are what keep concurrent writers correct; there is no
//! application-level lock.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;

#[cfg(test)]
mod tests;

//! Core types and trait definitions for the Carebase health record.
//!
//! This crate is deliberately free of HTTP and database dependencies.
//! All other crates depend on it. It owns the pure rules: identity
//! derivation, the metric taxonomy and its conflict-resolution function,
//! rollup arithmetic and the consent state machine.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod consent;
pub mod device;
pub mod error;
pub mod gate;
pub mod identity;
pub mod ingest;
pub mod metric;
pub mod rollup;
pub mod store;

pub use error::{Error, Result};

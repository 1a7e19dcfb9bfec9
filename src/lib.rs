//! seriesgate library
//!
//! A token-authenticated, deduplicating ingestion gateway: signed request
//! tokens are verified and mapped to a deterministic request identity;
//! fresh rows are served from a durable SQLite store, while stale or
//! absent rows trigger exactly one upstream fetch whose nested JSON
//! response is flattened into fixed-width rows and persisted. Two
//! independent expiry sweeps bound storage growth.

pub mod cli;
pub mod clock;
pub mod config;
pub mod fetch;
pub mod flatten;
pub mod gateway;
pub mod identity;
pub mod store;
pub mod sweep;
pub mod token;

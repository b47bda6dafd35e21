//! renderstash keeps prerendered pages in two stores at once: a
//! content-addressed blob store holding the payloads and a Postgres ledger
//! holding per-URL request history plus an inline copy of the last good
//! response. Lookups prefer the blob store and fall back to the ledger.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;

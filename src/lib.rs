//! Tessera: a dependency-tracked fragment cache.
//!
//! Rendered fragments are stored together with the entities and saved
//! queries they were built from, and deleted when that content changes.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;

//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed rows returned by repositories.
//! - `repo`: SQL-only functions for blocks, contents, collections, the job
//!   queue and sync cycles.
//!
//! External modules should import from `notion_mirror::db`; the repository API
//! is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{BlockRecord, ClaimedJob, ContentRecord, CycleCounts};

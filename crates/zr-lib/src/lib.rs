#![deny(clippy::all)]

//! Core library for `zr`, a task runner for polyglot monorepos.
//!
//! The library consumes a parsed configuration, normalizes it into a task
//! table (template, matrix, and profile expansion), builds a validated
//! dependency graph, and executes it on a bounded concurrency pool with
//! caching, retry, timeout, and workflow staging.

pub mod alias;
pub mod config;
pub mod engine;
pub mod expr;
pub mod opts;
pub mod process;
pub mod run;
pub mod task_graph;
pub mod task_hash;
pub mod toolchain;
pub mod workflow;

use camino::Utf8PathBuf;

/// Root directory for zr's persisted state (aliases, cache, toolchains).
pub fn zr_home() -> Option<Utf8PathBuf> {
    let home = dirs_next::home_dir()?;
    Utf8PathBuf::from_path_buf(home).ok().map(|home| home.join(".zr"))
}

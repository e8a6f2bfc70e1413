//! `depno` library: address one exported definition by identity, resolve
//! the definitions it transitively needs into a self-contained program, and
//! run that program in-process or in a forked runner.
//!
//! Layers, leaves first:
//! - model: `identity`, `expression`, `value`, `args`, `program`
//! - resolution: `host` (trait), `fs_host` / `memory_host`, `resolve`
//! - execution: `eval`, `execute`, `package`
//! - testing: `scenario`, `schema`, `harness`
//! - inspection and serving: `plan`, `graph`, `registry_server`
//!
//! Invariants:
//! - a program never lists an identity twice and contains every identity
//!   any of its closures references
//! - program order is first-discovery breadth-first, independent of lookup
//!   completion order
//! - publishing an artifact never exposes a missing or partial file

pub mod args;
pub mod config;
pub mod eval;
pub mod execute;
pub mod expression;
pub mod fs_host;
pub mod graph;
pub mod harness;
pub mod host;
pub mod identity;
pub mod memory_host;
pub mod package;
pub mod plan;
pub mod program;
pub mod registry_server;
pub mod resolve;
pub mod scenario;
pub mod schema;
pub mod value;

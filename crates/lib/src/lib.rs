//! idem-lib: Core types and logic for Idem
//!
//! This crate provides the engine behind idempotent state application:
//! - `render`/`source`: gathering SLS documents into a declarative tree
//! - `compile`: flattening declarations into executable chunks
//! - `seq`/`exec`: requisite-driven wave sequencing and dispatch
//! - `esm`: the locked, versioned record of enforced state
//! - `registry`: the capability table embedders extend with plugins

pub mod argbind;
pub mod chunk;
pub mod compile;
pub mod esm;
pub mod exec;
pub mod registry;
pub mod render;
pub mod resource;
pub mod run;
pub mod seq;
pub mod source;
pub mod tunnel;

pub use chunk::{Chunk, ChunkResult, ChunkTag};
pub use registry::Registry;
pub use run::RunContext;

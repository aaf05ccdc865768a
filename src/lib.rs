//! Constellation: a content-addressed pipeline compilation and execution
//! engine.
//!
//! A pipeline is compiled once (by an external [`pipeline::PipelineCompiler`])
//! into a [`dag::DagSpec`], wrapped in a content-addressed [`pipeline::PipelineImage`],
//! stored in a [`store::PipelineStore`], and executed by [`runtime::Runtime`]
//! against a [`module::ModuleRegistry`]. Executions that stall on missing
//! inputs can be parked as a [`runtime::suspension::SuspendedExecution`] and
//! resumed later. [`cache`] memoizes module invocations and compiler output;
//! [`canary`] routes traffic across pipeline versions during a gradual
//! rollout; [`ratelimit`] and (behind the `server` feature) [`api`] expose
//! the engine over HTTP.
//!
//! Module layout mirrors the component shares of the design: `runtime` is
//! the largest piece, `store`/`cache`/`canary` are independent subsystems
//! composed together only in [`api::state::AppState`].

pub mod cache;
pub mod canary;
pub mod config;
pub mod content_hash;
pub mod dag;
pub mod error;
pub mod execution_storage;
pub mod metrics;
pub mod module;
pub mod pipeline;
pub mod ratelimit;
pub mod runtime;
pub mod store;
pub mod value;

#[cfg(feature = "server")]
pub mod api;

pub use content_hash::ContentHash;
pub use dag::{DagNode, DagSpec, InputRef, NodeId, OutputRef};
pub use error::{ConstellationError, Result};
pub use module::{ModuleFactory, ModuleInstance, ModuleRegistry};
pub use pipeline::{LoadedPipeline, PipelineCompiler, PipelineImage};
pub use value::{CType, CValue};

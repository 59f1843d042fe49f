//! Courier - HTTP request execution and scripting engine.
//!
//! Requests are resolved against an environment, optionally rewritten by a
//! pre-request script, sent, and checked by a test script. Collections of
//! requests run sequentially under stop and delay policies.

pub mod assertion;
pub mod collection;
pub mod config;
pub mod curl;
pub mod engine;
pub mod executor;
pub mod materializer;
pub mod model;
pub mod report;
pub mod runner;
pub mod script;
pub mod variables;

pub use collection::{Collection, CollectionError, CollectionItem, Node, NodeId, NodeKind};
pub use config::{CollectionFile, EngineConfig, Workspace, WorkspaceLoader};
pub use curl::to_curl;
pub use engine::{RequestPipeline, SendOutcome};
pub use executor::{ExecutionOutcome, HttpExecutor, ReqwestExecutor};
pub use materializer::{materialize, MaterializedBody, MaterializedRequest};
pub use model::*;
pub use report::{RunExport, RunReport, RunStats};
pub use runner::{
    CollectionRunner, NoopListener, RunControl, RunListener, RunState, Runner, RunnerError,
};
pub use script::{PreRequestOutcome, ScriptBudget, ScriptSandbox, TestOutcome};
pub use variables::resolve;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! skein-core: workflow graph model, execution state and runner.
//!
//! The core of the skein agent workflow runtime. A workflow is a directed
//! graph of typed nodes; each node is driven by an executor that streams
//! incremental steps; a [`Runner`](runner::Runner) walks the graph for one
//! [`WorkflowExecution`](state::WorkflowExecution), mediating prompts,
//! confirmations, tool calls and nested workflows with its driver through
//! the [`proto`] event protocol.
//!
//! Externals (shell manager, chat provider, tool registry, project
//! lifecycle) are reached through the traits in [`project`]; concrete
//! implementations live in the server and llm crates.

pub mod config;
pub mod error;
pub mod executor;
pub mod executors;
pub mod llm;
pub mod model;
pub mod project;
pub mod proto;
pub mod runner;
pub mod state;
pub mod testing;
pub mod tools;

pub use error::{CoreError, Result};
pub use executor::{Executor, ExecutorInput, ExecutorRegistry, StepStream};
pub use model::{
    Confirmation, Edge, Graph, Node, OutcomeSlot, OutputMode, ResultMode, Role, RuntimeGraph,
    StateResetPolicy,
};
pub use proto::{
    RunEventKind, RunEventReq, RunEventResp, RunEventResponseType, RunEventStream, RunReply,
    RunStats, StartWorkflowPayload,
};
pub use runner::{Runner, Workflow};
pub use state::{
    shared, LlmUsageStats, Message, NodeExecution, RunStatus, RunnerStatus, SharedExecution, Step,
    StepType, ToolCallReq, ToolCallReqStatus, ToolCallResp, ToolCallStatus, WorkflowExecution,
};

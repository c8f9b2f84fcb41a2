//! Workflow graphs: stored definitions, compilation and execution.
//!
//! A [`FlowDefinition`] is compiled once into a [`CompiledGraph`] and run by
//! a [`FlowEngine`] for every trigger. Node behaviour is supplied by
//! [`Action`] implementations registered in an [`ActionRegistry`].

mod action;
mod call_stack;
mod compiler;
mod context;
mod definition;
mod engine;
mod subflow;
mod trace;
mod types;

pub use action::{
    Action, ActionError, ActionFactory, ActionInput, ActionOutput, ActionRegistry, ActionResult,
};
pub use call_stack::{CallStack, DEFAULT_MAX_DEPTH};
pub use compiler::{compile, CompiledGraph, CompiledNode};
pub use context::FlowContext;
pub use definition::{EdgeSpec, Endpoint, FlowDefinition, NodeSpec, DEFAULT_PORT};
pub use engine::{FlowEngine, FlowRun};
pub use subflow::{FlowCatalog, SubFlowAction, SubFlowError, SUBFLOW_ACTION_TYPE};
pub use trace::{ExecutionTrace, InMemoryTraceSink, NodeCall, TraceSink};
pub use types::{EdgeId, ExecutionError, FlowId, GraphError, GraphResult, NodeId, RunId};

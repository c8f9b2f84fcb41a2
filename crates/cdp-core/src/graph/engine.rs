//! Flow engine - runs a compiled graph for one trigger.
//!
//! Nodes are visited once each in compiled order. A start node fires once
//! with the run payload; any other node fires once per value buffered on
//! each of its enabled in-edges, and all firings of a node are awaited
//! together before the next node is visited. An in-edge with nothing
//! buffered is a void firing: the action is not run, so branches that were
//! not selected upstream never block the graph.
//!
//! The first action error halts the run. Completed calls stay in the trace,
//! the failing node's `on_error` hook is invoked and every instantiated
//! action is still closed.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use profileflow_core::event::Event;
//! use profileflow_core::graph::{ActionRegistry, FlowContext, FlowDefinition, FlowEngine};
//!
//! # async fn example(definition: FlowDefinition, registry: ActionRegistry) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = FlowEngine::compile(&definition, Arc::new(registry))?;
//! let ctx = FlowContext::new(Event::new("page-view"), None);
//! let run = engine.run(serde_json::json!({"url": "/"}), &ctx).await?;
//! println!("{} calls, success: {}", run.trace.calls.len(), run.is_success());
//! # Ok(())
//! # }
//! ```

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::action::{
    Action, ActionError, ActionFactory, ActionInput, ActionOutput, ActionRegistry, ActionResult,
};
use super::compiler::{compile, CompiledGraph, CompiledNode};
use super::context::FlowContext;
use super::definition::FlowDefinition;
use super::trace::{ExecutionTrace, NodeCall, TraceSink};
use super::types::{EdgeId, ExecutionError, FlowId, GraphError, GraphResult};
use crate::config::EngineConfig;

// ============================================================================
// FLOW RUN
// ============================================================================

/// Outcome of one run.
///
/// A failed node does not make `run` return `Err`; the failure is carried
/// here together with the partial trace.
#[derive(Debug, Clone)]
pub struct FlowRun {
    pub trace: ExecutionTrace,
    /// Results emitted on ports with no outgoing edge.
    pub outputs: Vec<ActionResult>,
}

impl FlowRun {
    pub fn is_success(&self) -> bool {
        self.trace.is_success()
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        self.trace.error.as_ref()
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Executes one compiled graph. Cheap to share behind an `Arc`.
pub struct FlowEngine {
    graph: Arc<CompiledGraph>,
    registry: Arc<ActionRegistry>,
    config: EngineConfig,
    trace_sink: Option<Arc<dyn TraceSink>>,
}

/// Values waiting on each edge.
type Buffers = HashMap<EdgeId, Vec<Value>>;

impl FlowEngine {
    pub fn new(graph: Arc<CompiledGraph>, registry: Arc<ActionRegistry>) -> Self {
        Self {
            graph,
            registry,
            config: EngineConfig::default(),
            trace_sink: None,
        }
    }

    /// Compile `definition` and build an engine for it.
    ///
    /// # Errors
    ///
    /// Returns the compile error, see [`compile`].
    pub fn compile(definition: &FlowDefinition, registry: Arc<ActionRegistry>) -> GraphResult<Self> {
        let graph = compile(definition, &registry)?;
        Ok(Self::new(Arc::new(graph), registry))
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    pub fn flow_id(&self) -> &FlowId {
        &self.graph.flow_id
    }

    /// Run the graph once.
    ///
    /// # Errors
    ///
    /// Only instantiation failures are returned as `Err`; node failures are
    /// reported through [`FlowRun::error`].
    #[instrument(skip(self, payload, ctx), fields(flow_id = %self.graph.flow_id, run_id = %ctx.run_id()))]
    pub async fn run(&self, payload: Value, ctx: &FlowContext) -> GraphResult<FlowRun> {
        let actions = self.instantiate().await?;

        let mut trace = ExecutionTrace::new(
            self.graph.flow_id.clone(),
            ctx.run_id().clone(),
            ctx.event().id.clone(),
        );
        let mut buffers = Buffers::new();
        let mut outputs = Vec::new();
        let mut failure = None;

        for (node, action) in self.graph.nodes.iter().zip(&actions) {
            let inputs = Self::collect_inputs(node, &payload, &mut buffers);
            if inputs.is_empty() {
                debug!(node_id = %node.id(), "Void firing, node skipped");
                continue;
            }

            let firings = inputs
                .into_iter()
                .map(|input| self.fire(node, action.as_ref(), input, ctx));
            let calls = join_all(firings).await;

            for (call, input, result) in calls {
                trace.record(call);
                match result {
                    Ok(output) => Self::route(node, output, &mut buffers, &mut outputs),
                    Err(e) => {
                        if failure.is_none() {
                            failure = Some(ExecutionError {
                                flow_id: self.graph.flow_id.clone(),
                                node_id: node.id().clone(),
                                edge_id: input.edge_id,
                                port: input.port,
                                input: input.payload,
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }

            if let Some(error) = &failure {
                warn!(node_id = %node.id(), error = %error, "Node failed, halting run");
                action.on_error(error).await;
                break;
            }
        }

        self.close_all(&actions).await;

        trace.finish(failure);
        self.persist(&trace).await;

        info!(
            calls = trace.calls.len(),
            success = trace.is_success(),
            "Flow run finished"
        );

        Ok(FlowRun { trace, outputs })
    }

    /// Build and set up one action instance per node, in order.
    async fn instantiate(&self) -> GraphResult<Vec<Box<dyn Action>>> {
        let mut actions: Vec<Box<dyn Action>> = Vec::with_capacity(self.graph.nodes.len());

        for node in &self.graph.nodes {
            let spec = &node.spec;
            let factory = self
                .registry
                .get(&spec.action_type)
                .ok_or_else(|| GraphError::UnknownActionType {
                    node: spec.id.clone(),
                    action_type: spec.action_type.clone(),
                })?;

            match Self::build(factory.as_ref(), &spec.init).await {
                Ok(action) => actions.push(action),
                Err(e) => {
                    self.close_all(&actions).await;
                    return Err(GraphError::SetUpFailed {
                        node: spec.id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(actions)
    }

    async fn build(factory: &dyn ActionFactory, init: &Value) -> Result<Box<dyn Action>, ActionError> {
        let mut action = factory.create(init)?;
        action.set_up(init).await?;
        Ok(action)
    }

    fn collect_inputs(node: &CompiledNode, payload: &Value, buffers: &mut Buffers) -> Vec<ActionInput> {
        if node.is_start() {
            return vec![ActionInput {
                port: node.spec.start_port().to_string(),
                payload: payload.clone(),
                edge_id: None,
            }];
        }

        let mut inputs = Vec::new();
        for edge in node.enabled_in_edges() {
            let values = buffers.remove(&edge.id).unwrap_or_default();
            inputs.extend(values.into_iter().map(|value| ActionInput {
                port: edge.target.port.clone(),
                payload: value,
                edge_id: Some(edge.id.clone()),
            }));
        }
        inputs
    }

    async fn fire(
        &self,
        node: &CompiledNode,
        action: &dyn Action,
        input: ActionInput,
        ctx: &FlowContext,
    ) -> (NodeCall, ActionInput, Result<ActionOutput, ActionError>) {
        let started_at = Utc::now();
        let result = self.invoke(action, input.clone(), ctx).await;
        let finished_at = Utc::now();

        let (outputs, error) = match &result {
            Ok(output) => (output.clone().into_results(), None),
            Err(e) => (Vec::new(), Some(e.to_string())),
        };

        let call = NodeCall {
            node_id: node.id().clone(),
            action_type: node.spec.action_type.clone(),
            edge_id: input.edge_id.clone(),
            input_port: input.port.clone(),
            input: input.payload.clone(),
            init: node.spec.init.clone(),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            outputs,
            error,
        };

        (call, input, result)
    }

    async fn invoke(
        &self,
        action: &dyn Action,
        input: ActionInput,
        ctx: &FlowContext,
    ) -> Result<ActionOutput, ActionError> {
        match self.config.node_timeout() {
            Some(limit) => tokio::time::timeout(limit, action.run(input, ctx))
                .await
                .unwrap_or_else(|_| {
                    Err(ActionError::Timeout {
                        timeout_ms: self.config.node_timeout_ms,
                    })
                }),
            None => action.run(input, ctx).await,
        }
    }

    /// Copy every result into the buffers of the matching out-edges.
    fn route(
        node: &CompiledNode,
        output: ActionOutput,
        buffers: &mut Buffers,
        outputs: &mut Vec<ActionResult>,
    ) {
        for result in output.into_results() {
            let mut delivered = false;
            for edge in node.out_edges_for(&result.port) {
                buffers
                    .entry(edge.id.clone())
                    .or_default()
                    .push(result.value.clone());
                delivered = true;
            }
            if !delivered {
                outputs.push(result);
            }
        }
    }

    async fn close_all(&self, actions: &[Box<dyn Action>]) {
        let closes = actions.iter().map(|action| action.close());
        for (node, result) in self.graph.nodes.iter().zip(join_all(closes).await) {
            if let Err(e) = result {
                warn!(node_id = %node.id(), error = %e, "Failed to close action");
            }
        }
    }

    async fn persist(&self, trace: &ExecutionTrace) {
        if !(self.graph.debug || self.config.always_persist_trace) {
            return;
        }
        if let Some(sink) = &self.trace_sink {
            if let Err(e) = sink.save(trace).await {
                warn!(run_id = %trace.run_id, error = %e, "Failed to persist trace");
            }
        }
    }
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("flow_id", &self.graph.flow_id)
            .field("nodes", &self.graph.nodes.len())
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

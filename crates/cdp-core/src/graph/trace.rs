//! Execution trace - the per-run debug document.
//!
//! A trace is created when a run starts, appended to as nodes fire, sealed
//! when the run ends and then handed to a [`TraceSink`]. Inspection tooling
//! reads it as JSON.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::action::ActionResult;
use super::types::{EdgeId, ExecutionError, FlowId, NodeId, RunId};
use profileflow_storage::StorageError;

// ============================================================================
// NODE CALL
// ============================================================================

/// Record of one node invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCall {
    pub node_id: NodeId,
    pub action_type: String,
    /// Delivering edge, `None` for start nodes.
    pub edge_id: Option<EdgeId>,
    pub input_port: String,
    pub input: Value,
    pub init: Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outputs: Vec<ActionResult>,
    pub error: Option<String>,
}

impl NodeCall {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ============================================================================
// EXECUTION TRACE
// ============================================================================

/// Per-run debug document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub flow_id: FlowId,
    pub run_id: RunId,
    pub event_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub calls: Vec<NodeCall>,
    pub error: Option<ExecutionError>,
}

impl ExecutionTrace {
    pub fn new(flow_id: FlowId, run_id: RunId, event_id: impl Into<String>) -> Self {
        Self {
            flow_id,
            run_id,
            event_id: event_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            calls: Vec::new(),
            error: None,
        }
    }

    pub(crate) fn record(&mut self, call: NodeCall) {
        self.calls.push(call);
    }

    pub(crate) fn finish(&mut self, error: Option<ExecutionError>) {
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    /// Calls made to one node, in completion order.
    pub fn calls_for(&self, node_id: &NodeId) -> Vec<&NodeCall> {
        self.calls.iter().filter(|c| &c.node_id == node_id).collect()
    }

    /// Whether a node fired at least once.
    pub fn executed(&self, node_id: &NodeId) -> bool {
        self.calls.iter().any(|c| &c.node_id == node_id)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }
}

// ============================================================================
// TRACE SINK
// ============================================================================

/// Destination for finished traces.
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn save(&self, trace: &ExecutionTrace) -> Result<(), StorageError>;
}

/// In-memory trace sink for testing.
#[derive(Debug, Default)]
pub struct InMemoryTraceSink {
    traces: RwLock<HashMap<RunId, ExecutionTrace>>,
}

impl InMemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, run_id: &RunId) -> Option<ExecutionTrace> {
        self.traces.read().await.get(run_id).cloned()
    }

    /// All traces of one flow, oldest first.
    pub async fn for_flow(&self, flow_id: &FlowId) -> Vec<ExecutionTrace> {
        let mut traces: Vec<_> = self
            .traces
            .read()
            .await
            .values()
            .filter(|t| &t.flow_id == flow_id)
            .cloned()
            .collect();
        traces.sort_by_key(|t| t.started_at);
        traces
    }

    pub async fn len(&self) -> usize {
        self.traces.read().await.len()
    }
}

#[async_trait]
impl TraceSink for InMemoryTraceSink {
    async fn save(&self, trace: &ExecutionTrace) -> Result<(), StorageError> {
        self.traces
            .write()
            .await
            .insert(trace.run_id.clone(), trace.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(node: &str, error: Option<&str>) -> NodeCall {
        let now = Utc::now();
        NodeCall {
            node_id: NodeId::new(node),
            action_type: "noop".into(),
            edge_id: None,
            input_port: "payload".into(),
            input: json!({"a": 1}),
            init: Value::Null,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            outputs: vec![],
            error: error.map(String::from),
        }
    }

    #[test]
    fn test_trace_queries() {
        let mut trace = ExecutionTrace::new(FlowId::new("f"), RunId::generate(), "e-1");
        trace.record(call("a", None));
        trace.record(call("b", Some("boom")));
        trace.finish(None);

        assert!(trace.executed(&NodeId::new("a")));
        assert!(!trace.executed(&NodeId::new("c")));
        assert!(trace.calls_for(&NodeId::new("b"))[0].is_error());
        assert!(trace.finished_at.is_some());
        assert!(trace.duration_ms().is_some());
    }

    #[test]
    fn test_trace_serializes_for_inspection() {
        let mut trace = ExecutionTrace::new(FlowId::new("f"), RunId::new("r"), "e-1");
        trace.record(call("a", None));
        let value = serde_json::to_value(&trace).unwrap();

        assert_eq!(value["flow_id"], "f");
        assert_eq!(value["calls"][0]["input"], json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_in_memory_sink() {
        let sink = InMemoryTraceSink::new();
        let trace = ExecutionTrace::new(FlowId::new("f"), RunId::new("r-1"), "e-1");
        sink.save(&trace).await.unwrap();

        assert_eq!(sink.len().await, 1);
        assert_eq!(sink.get(&RunId::new("r-1")).await, Some(trace));
        assert_eq!(sink.for_flow(&FlowId::new("f")).await.len(), 1);
        assert!(sink.for_flow(&FlowId::new("other")).await.is_empty());
    }
}

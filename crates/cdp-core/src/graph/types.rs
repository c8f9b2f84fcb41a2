//! Core types for flow graphs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

// ============================================================================
// IDENTIFIERS
// ============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }
    };
}

string_id!(
    /// Unique identifier for a node in a flow graph.
    NodeId
);

string_id!(
    /// Unique identifier for an edge in a flow graph.
    EdgeId
);

string_id!(
    /// Unique identifier for a flow (one stored graph).
    FlowId
);

string_id!(
    /// Unique identifier for one execution of a flow.
    RunId
);

impl RunId {
    pub fn generate() -> Self {
        Self(format!("run-{}", uuid::Uuid::new_v4()))
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors raised while compiling or instantiating a flow.
///
/// None of these can happen once a run has started; they surface to the
/// caller before any action executes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Edge {edge} references unknown node {node}")]
    UnknownNode { edge: EdgeId, node: NodeId },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Edge {edge} uses port '{port}' not declared by node {node}")]
    UnknownPort {
        edge: EdgeId,
        node: NodeId,
        port: String,
    },

    #[error("Flow has no start node")]
    NoStartNode,

    #[error("Cycle detected at node {0}")]
    Cycle(NodeId),

    #[error("Node {node} uses unregistered action type '{action_type}'")]
    UnknownActionType { node: NodeId, action_type: String },

    #[error("Set-up of node {node} failed: {message}")]
    SetUpFailed { node: NodeId, message: String },

    #[error("Flow {0} is already running in this call chain")]
    CyclicInvocation(FlowId),

    #[error("Flow call chain exceeds {0} levels")]
    CallDepthExceeded(usize),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// A node failure captured during a run, with the context that triggered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub flow_id: FlowId,
    pub node_id: NodeId,
    /// In-edge that delivered the failing input (`None` for start nodes).
    pub edge_id: Option<EdgeId>,
    pub port: String,
    pub input: Value,
    pub message: String,
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.edge_id {
            Some(edge) => write!(
                f,
                "[{}/{}] node failed on edge {} port '{}': {}",
                self.flow_id, self.node_id, edge, self.port, self.message
            ),
            None => write!(
                f,
                "[{}/{}] node failed on port '{}': {}",
                self.flow_id, self.node_id, self.port, self.message
            ),
        }
    }
}

impl std::error::Error for ExecutionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id() {
        let id1 = NodeId::new("start");
        let id2: NodeId = "start".into();
        assert_eq!(id1, id2);
        assert_eq!(id1.as_str(), "start");
        assert_eq!(serde_json::to_string(&id1).unwrap(), "\"start\"");
    }

    #[test]
    fn test_run_id_generate() {
        let id = RunId::generate();
        assert!(id.as_str().starts_with("run-"));
        assert_ne!(id, RunId::generate());
    }

    #[test]
    fn test_execution_error_display() {
        let err = ExecutionError {
            flow_id: FlowId::new("f"),
            node_id: NodeId::new("n"),
            edge_id: Some(EdgeId::new("e")),
            port: "payload".into(),
            input: Value::Null,
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "[f/n] node failed on edge e port 'payload': boom");
    }
}

//! Stored flow definitions: the editor-authored node/edge graph.
//!
//! # Example
//!
//! ```rust
//! use profileflow_core::graph::{EdgeSpec, FlowDefinition, NodeSpec};
//!
//! let flow = FlowDefinition::new("welcome-flow")
//!     .node(NodeSpec::new("start", "start").start())
//!     .node(NodeSpec::new("tag", "add_segment").init(serde_json::json!({"segment": "new"})))
//!     .edge(EdgeSpec::new("e1", ("start", "payload"), ("tag", "payload")));
//!
//! assert_eq!(flow.nodes.len(), 2);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{EdgeId, FlowId, NodeId};

/// Default port used when a node declares none.
pub const DEFAULT_PORT: &str = "payload";

/// A node as stored by the flow editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    /// Registry identifier of the action implementation.
    pub action_type: String,
    #[serde(default)]
    pub init: Value,
    #[serde(default)]
    pub start: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, action_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action_type: action_type.into(),
            init: Value::Null,
            start: false,
            debug: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Mark as a start node.
    pub fn start(mut self) -> Self {
        self.start = true;
        self
    }

    pub fn debug(mut self) -> Self {
        self.debug = true;
        self
    }

    pub fn init(mut self, init: Value) -> Self {
        self.init = init;
        self
    }

    pub fn inputs<I, S>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = ports.into_iter().map(Into::into).collect();
        self
    }

    pub fn outputs<I, S>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = ports.into_iter().map(Into::into).collect();
        self
    }

    /// Port a start node receives the run payload on.
    pub fn start_port(&self) -> &str {
        self.inputs.first().map_or(DEFAULT_PORT, String::as_str)
    }
}

/// One end of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub node_id: NodeId,
    pub port: String,
}

impl Endpoint {
    pub fn new(node_id: impl Into<NodeId>, port: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            port: port.into(),
        }
    }
}

impl<N: Into<NodeId>, P: Into<String>> From<(N, P)> for Endpoint {
    fn from((node_id, port): (N, P)) -> Self {
        Self::new(node_id, port)
    }
}

/// A directed port-to-port connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub id: EdgeId,
    pub source: Endpoint,
    pub target: Endpoint,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl EdgeSpec {
    pub fn new(
        id: impl Into<EdgeId>,
        source: impl Into<Endpoint>,
        target: impl Into<Endpoint>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A complete stored flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: FlowId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    /// Persist the trace of every run.
    #[serde(default)]
    pub debug: bool,
}

impl FlowDefinition {
    pub fn new(id: impl Into<FlowId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            debug: false,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: EdgeSpec) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn debug(mut self) -> Self {
        self.debug = true;
        self
    }

    /// Parse a flow stored as JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_port_defaults_to_payload() {
        assert_eq!(NodeSpec::new("a", "x").start_port(), DEFAULT_PORT);
        assert_eq!(NodeSpec::new("a", "x").inputs(["event"]).start_port(), "event");
    }

    #[test]
    fn test_from_json_applies_defaults() {
        let flow = FlowDefinition::from_json(
            r#"{
                "id": "f-1",
                "nodes": [
                    {"id": "a", "action_type": "start", "start": true},
                    {"id": "b", "action_type": "noop"}
                ],
                "edges": [
                    {"id": "e", "source": {"node_id": "a", "port": "payload"},
                                "target": {"node_id": "b", "port": "payload"}}
                ]
            }"#,
        )
        .unwrap();

        assert!(flow.nodes[0].start);
        assert!(!flow.nodes[1].start);
        assert!(flow.edges[0].enabled);
        assert_eq!(flow.nodes[1].init, json!(null));
    }
}

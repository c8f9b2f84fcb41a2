//! Graph compiler - turns a stored flow into an ordered execution plan.
//!
//! Compilation validates the graph, prunes nodes that can never take part
//! in a run and fixes the order the engine visits nodes in:
//!
//! 1. every edge endpoint (and declared port) must exist, every action type
//!    must be registered, at least one node must be a start node;
//! 2. a forward pass from the start nodes over enabled edges finds the
//!    reachable set and its leaves;
//! 3. a backward pass from the leaves over enabled edges adds upstream nodes;
//!    anything reached by neither pass is dead and dropped;
//! 4. a depth-first topological sort of the kept nodes gives a total order.
//!
//! The same definition always compiles to the same order.

use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

use super::action::ActionRegistry;
use super::definition::{EdgeSpec, FlowDefinition, NodeSpec};
use super::types::{FlowId, GraphError, GraphResult, NodeId};

// ============================================================================
// COMPILED GRAPH
// ============================================================================

/// A node with its resolved connections.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledNode {
    pub spec: NodeSpec,
    pub in_edges: Vec<EdgeSpec>,
    pub out_edges: Vec<EdgeSpec>,
}

impl CompiledNode {
    pub fn id(&self) -> &NodeId {
        &self.spec.id
    }

    pub fn is_start(&self) -> bool {
        self.spec.start
    }

    /// Enabled in-edges, in definition order.
    pub fn enabled_in_edges(&self) -> impl Iterator<Item = &EdgeSpec> {
        self.in_edges.iter().filter(|e| e.enabled)
    }

    /// Enabled out-edges leaving `port`.
    pub fn out_edges_for<'a>(&'a self, port: &'a str) -> impl Iterator<Item = &'a EdgeSpec> + 'a {
        self.out_edges
            .iter()
            .filter(move |e| e.enabled && e.source.port == port)
    }
}

/// Validated, pruned and topologically ordered flow.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledGraph {
    pub flow_id: FlowId,
    pub name: Option<String>,
    /// Nodes in execution order.
    pub nodes: Vec<CompiledNode>,
    pub start_ids: BTreeSet<NodeId>,
    /// Dead nodes removed during compilation.
    pub excluded: Vec<NodeId>,
    pub debug: bool,
}

impl CompiledGraph {
    pub fn node(&self, id: &NodeId) -> Option<&CompiledNode> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    /// Node ids in execution order.
    pub fn order(&self) -> Vec<&NodeId> {
        self.nodes.iter().map(CompiledNode::id).collect()
    }

    /// Position of a node in the execution order.
    pub fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id() == id)
    }
}

// ============================================================================
// COMPILE
// ============================================================================

/// Compile a stored flow against the action registry.
///
/// # Errors
///
/// Returns a [`GraphError`] for dangling edges, undeclared ports, duplicate
/// nodes, unregistered action types, a missing start node or a cycle.
pub fn compile(definition: &FlowDefinition, registry: &ActionRegistry) -> GraphResult<CompiledGraph> {
    let index = index_nodes(&definition.nodes)?;

    for node in &definition.nodes {
        if !registry.contains(&node.action_type) {
            return Err(GraphError::UnknownActionType {
                node: node.id.clone(),
                action_type: node.action_type.clone(),
            });
        }
    }

    validate_edges(definition, &index)?;

    let starts: Vec<usize> = definition
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.start)
        .map(|(i, _)| i)
        .collect();

    if starts.is_empty() {
        return Err(GraphError::NoStartNode);
    }

    let adjacency = Adjacency::build(definition, &index);

    // Forward pass: everything reachable from a start node.
    let forward = adjacency.reach(&starts, Direction::Forward);
    let leaves: Vec<usize> = forward
        .iter()
        .copied()
        .filter(|&i| adjacency.outgoing[i].is_empty())
        .collect();

    // Backward pass: everything that feeds a leaf.
    let backward = adjacency.reach(&leaves, Direction::Backward);

    let kept: HashSet<usize> = forward.union(&backward).copied().collect();
    let order = topological_order(definition.nodes.len(), &kept, &adjacency, definition)?;

    // Attach edges whose endpoints both survived, keeping definition order.
    let mut in_edges = vec![Vec::new(); definition.nodes.len()];
    let mut out_edges = vec![Vec::new(); definition.nodes.len()];
    for edge in &definition.edges {
        let source = index[&edge.source.node_id];
        let target = index[&edge.target.node_id];
        if kept.contains(&source) && kept.contains(&target) {
            out_edges[source].push(edge.clone());
            in_edges[target].push(edge.clone());
        }
    }

    let nodes = order
        .iter()
        .map(|&i| CompiledNode {
            spec: definition.nodes[i].clone(),
            in_edges: std::mem::take(&mut in_edges[i]),
            out_edges: std::mem::take(&mut out_edges[i]),
        })
        .collect::<Vec<_>>();

    let excluded: Vec<NodeId> = definition
        .nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| !kept.contains(i))
        .map(|(_, n)| n.id.clone())
        .collect();

    let start_ids = starts
        .iter()
        .map(|&i| definition.nodes[i].id.clone())
        .collect();

    debug!(
        flow_id = %definition.id,
        nodes = nodes.len(),
        excluded = excluded.len(),
        "Compiled flow"
    );

    Ok(CompiledGraph {
        flow_id: definition.id.clone(),
        name: definition.name.clone(),
        debug: definition.debug || nodes.iter().any(|n| n.spec.debug),
        nodes,
        start_ids,
        excluded,
    })
}

fn index_nodes(nodes: &[NodeSpec]) -> GraphResult<HashMap<NodeId, usize>> {
    let mut index = HashMap::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        if index.insert(node.id.clone(), i).is_some() {
            return Err(GraphError::DuplicateNode(node.id.clone()));
        }
    }
    Ok(index)
}

fn validate_edges(definition: &FlowDefinition, index: &HashMap<NodeId, usize>) -> GraphResult<()> {
    for edge in &definition.edges {
        let source = index.get(&edge.source.node_id).ok_or_else(|| GraphError::UnknownNode {
            edge: edge.id.clone(),
            node: edge.source.node_id.clone(),
        })?;
        let target = index.get(&edge.target.node_id).ok_or_else(|| GraphError::UnknownNode {
            edge: edge.id.clone(),
            node: edge.target.node_id.clone(),
        })?;

        let source_node = &definition.nodes[*source];
        if !source_node.outputs.is_empty() && !source_node.outputs.contains(&edge.source.port) {
            return Err(GraphError::UnknownPort {
                edge: edge.id.clone(),
                node: source_node.id.clone(),
                port: edge.source.port.clone(),
            });
        }

        let target_node = &definition.nodes[*target];
        if !target_node.inputs.is_empty() && !target_node.inputs.contains(&edge.target.port) {
            return Err(GraphError::UnknownPort {
                edge: edge.id.clone(),
                node: target_node.id.clone(),
                port: edge.target.port.clone(),
            });
        }
    }
    Ok(())
}

// ============================================================================
// ADJACENCY
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

/// Enabled-edge adjacency by node index, in edge definition order.
struct Adjacency {
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
}

impl Adjacency {
    fn build(definition: &FlowDefinition, index: &HashMap<NodeId, usize>) -> Self {
        let n = definition.nodes.len();
        let mut outgoing = vec![Vec::new(); n];
        let mut incoming = vec![Vec::new(); n];

        for edge in definition.edges.iter().filter(|e| e.enabled) {
            let source = index[&edge.source.node_id];
            let target = index[&edge.target.node_id];
            outgoing[source].push(target);
            incoming[target].push(source);
        }

        Self { outgoing, incoming }
    }

    fn reach(&self, from: &[usize], direction: Direction) -> HashSet<usize> {
        let neighbours = match direction {
            Direction::Forward => &self.outgoing,
            Direction::Backward => &self.incoming,
        };

        let mut seen = HashSet::new();
        let mut stack: Vec<usize> = from.to_vec();
        while let Some(current) = stack.pop() {
            if seen.insert(current) {
                stack.extend(neighbours[current].iter().filter(|n| !seen.contains(*n)));
            }
        }
        seen
    }
}

// ============================================================================
// TOPOLOGICAL SORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

fn topological_order(
    node_count: usize,
    kept: &HashSet<usize>,
    adjacency: &Adjacency,
    definition: &FlowDefinition,
) -> GraphResult<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; node_count];
    let mut postorder = Vec::with_capacity(kept.len());

    for i in (0..node_count).filter(|i| kept.contains(i)) {
        visit(i, kept, adjacency, &mut marks, &mut postorder, definition)?;
    }

    postorder.reverse();
    Ok(postorder)
}

/// Depth-first visit with an explicit `(node, next child index)` stack, so
/// long chains never grow the thread stack.
fn visit(
    root: usize,
    kept: &HashSet<usize>,
    adjacency: &Adjacency,
    marks: &mut [Mark],
    postorder: &mut Vec<usize>,
    definition: &FlowDefinition,
) -> GraphResult<()> {
    if marks[root] == Mark::Done {
        return Ok(());
    }

    marks[root] = Mark::InProgress;
    let mut stack = vec![(root, 0usize)];

    while let Some((node, cursor)) = stack.last_mut() {
        let node = *node;
        let children = &adjacency.outgoing[node];

        let Some(offset) = children[*cursor..].iter().position(|n| kept.contains(n)) else {
            marks[node] = Mark::Done;
            postorder.push(node);
            stack.pop();
            continue;
        };
        let next = children[*cursor + offset];
        *cursor += offset + 1;

        match marks[next] {
            Mark::Done => {}
            Mark::InProgress => return Err(GraphError::Cycle(definition.nodes[next].id.clone())),
            Mark::Unvisited => {
                marks[next] = Mark::InProgress;
                stack.push((next, 0));
            }
        }
    }

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Action, ActionError, ActionInput, ActionOutput, FlowContext};
    use async_trait::async_trait;

    #[derive(Default)]
    struct Noop;

    #[async_trait]
    impl Action for Noop {
        async fn run(
            &self,
            _input: ActionInput,
            _ctx: &FlowContext,
        ) -> Result<ActionOutput, ActionError> {
            Ok(ActionOutput::None)
        }
    }

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry.register_default::<Noop>("noop");
        registry
    }

    fn node(id: &str) -> NodeSpec {
        NodeSpec::new(id, "noop")
    }

    fn edge(id: &str, from: &str, to: &str) -> EdgeSpec {
        EdgeSpec::new(id, (from, "payload"), (to, "payload"))
    }

    fn diamond() -> FlowDefinition {
        FlowDefinition::new("diamond")
            .node(node("d"))
            .node(node("b"))
            .node(node("a").start())
            .node(node("c"))
            .edge(edge("e1", "a", "b"))
            .edge(edge("e2", "a", "c"))
            .edge(edge("e3", "b", "d"))
            .edge(edge("e4", "c", "d"))
    }

    #[test]
    fn test_edges_precede_in_order() {
        let definition = diamond();
        let graph = compile(&definition, &registry()).unwrap();

        for e in &definition.edges {
            let source = graph.position(&e.source.node_id).unwrap();
            let target = graph.position(&e.target.node_id).unwrap();
            assert!(source < target, "{} must precede {}", e.source.node_id, e.target.node_id);
        }
        assert_eq!(graph.start_ids, BTreeSet::from([NodeId::new("a")]));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let definition = diamond();
        let first = compile(&definition, &registry()).unwrap();
        for _ in 0..10 {
            let again = compile(&definition, &registry()).unwrap();
            assert_eq!(first.order(), again.order());
        }
    }

    #[test]
    fn test_unknown_edge_endpoint() {
        let definition = FlowDefinition::new("f")
            .node(node("a").start())
            .edge(edge("e1", "a", "ghost"));

        assert_eq!(
            compile(&definition, &registry()).unwrap_err(),
            GraphError::UnknownNode {
                edge: "e1".into(),
                node: "ghost".into()
            }
        );
    }

    #[test]
    fn test_no_start_node() {
        let definition = FlowDefinition::new("f").node(node("a")).node(node("b"));
        assert_eq!(
            compile(&definition, &registry()).unwrap_err(),
            GraphError::NoStartNode
        );
    }

    #[test]
    fn test_unregistered_action_type() {
        let definition = FlowDefinition::new("f").node(NodeSpec::new("a", "mailchimp").start());
        assert!(matches!(
            compile(&definition, &registry()),
            Err(GraphError::UnknownActionType { .. })
        ));
    }

    #[test]
    fn test_duplicate_node() {
        let definition = FlowDefinition::new("f").node(node("a").start()).node(node("a"));
        assert_eq!(
            compile(&definition, &registry()).unwrap_err(),
            GraphError::DuplicateNode("a".into())
        );
    }

    #[test]
    fn test_undeclared_port() {
        let definition = FlowDefinition::new("f")
            .node(node("a").start().outputs(["true", "false"]))
            .node(node("b"))
            .edge(EdgeSpec::new("e1", ("a", "maybe"), ("b", "payload")));

        assert!(matches!(
            compile(&definition, &registry()),
            Err(GraphError::UnknownPort { .. })
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let definition = FlowDefinition::new("f")
            .node(node("a").start())
            .node(node("b"))
            .node(node("c"))
            .edge(edge("e1", "a", "b"))
            .edge(edge("e2", "b", "c"))
            .edge(edge("e3", "c", "b"));

        assert!(matches!(
            compile(&definition, &registry()),
            Err(GraphError::Cycle(_))
        ));
    }

    #[test]
    fn test_dead_nodes_excluded() {
        // "island" is disconnected; "feeder" only feeds a reachable node.
        let definition = FlowDefinition::new("f")
            .node(node("a").start())
            .node(node("b"))
            .node(node("island"))
            .node(node("feeder"))
            .edge(edge("e1", "a", "b"))
            .edge(edge("e2", "feeder", "b"));

        let graph = compile(&definition, &registry()).unwrap();

        assert_eq!(graph.excluded, vec![NodeId::new("island")]);
        assert!(graph.node(&NodeId::new("feeder")).is_some());
        assert_eq!(graph.node(&NodeId::new("b")).unwrap().in_edges.len(), 2);
    }

    #[test]
    fn test_disabled_edge_does_not_reach() {
        let definition = FlowDefinition::new("f")
            .node(node("a").start())
            .node(node("b"))
            .edge(edge("e1", "a", "b").disabled());

        let graph = compile(&definition, &registry()).unwrap();
        assert_eq!(graph.excluded, vec![NodeId::new("b")]);
    }

    #[test]
    fn test_long_chain_compiles() {
        let len = 10_000;
        let mut definition = FlowDefinition::new("chain").node(node("n0").start());
        for i in 1..len {
            definition = definition
                .node(node(&format!("n{i}")))
                .edge(edge(&format!("e{i}"), &format!("n{}", i - 1), &format!("n{i}")));
        }

        let graph = compile(&definition, &registry()).unwrap();

        assert_eq!(graph.nodes.len(), len);
        assert_eq!(graph.nodes[0].id(), &NodeId::new("n0"));
        assert_eq!(graph.nodes[len - 1].id(), &NodeId::new(format!("n{}", len - 1)));
        assert!(graph.excluded.is_empty());
    }

    #[test]
    fn test_long_cycle_detected() {
        let len = 10_000;
        let mut definition = FlowDefinition::new("ring").node(node("n0").start());
        for i in 1..len {
            definition = definition
                .node(node(&format!("n{i}")))
                .edge(edge(&format!("e{i}"), &format!("n{}", i - 1), &format!("n{i}")));
        }
        definition = definition
            .node(node("exit"))
            .edge(edge("back", &format!("n{}", len - 1), "n1"))
            .edge(edge("out", "n0", "exit"));

        assert_eq!(
            compile(&definition, &registry()).unwrap_err(),
            GraphError::Cycle(NodeId::new("n1"))
        );
    }

    #[test]
    fn test_debug_flag_from_any_node() {
        let definition = FlowDefinition::new("f").node(node("a").start().debug());
        assert!(compile(&definition, &registry()).unwrap().debug);

        let definition = FlowDefinition::new("f").node(node("a").start());
        assert!(!compile(&definition, &registry()).unwrap().debug);
    }
}

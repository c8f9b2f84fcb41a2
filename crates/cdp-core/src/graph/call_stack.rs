//! Flow call stack - guards against cyclic flow invocation.
//!
//! Each top-level trigger starts with an empty stack. A flow that starts
//! another flow hands down a child stack, so a flow already present in its
//! own call chain is refused instead of recursing forever. Unrelated
//! triggers never see each other's stacks.

use super::types::{FlowId, GraphError, GraphResult};

/// Default maximum nesting of flows started from flows.
pub const DEFAULT_MAX_DEPTH: usize = 16;

/// The chain of flows currently executing for one trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStack {
    frames: Vec<FlowId>,
    max_depth: usize,
}

impl Default for CallStack {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStack {
    pub fn new() -> Self {
        Self::with_max_depth(DEFAULT_MAX_DEPTH)
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
        }
    }

    /// Return a new stack with `flow_id` pushed on top.
    ///
    /// # Errors
    ///
    /// `CyclicInvocation` if the flow is already on the stack,
    /// `CallDepthExceeded` if the stack is full.
    pub fn enter(&self, flow_id: &FlowId) -> GraphResult<CallStack> {
        if self.contains(flow_id) {
            return Err(GraphError::CyclicInvocation(flow_id.clone()));
        }
        if self.frames.len() >= self.max_depth {
            return Err(GraphError::CallDepthExceeded(self.max_depth));
        }

        let mut frames = self.frames.clone();
        frames.push(flow_id.clone());
        Ok(Self {
            frames,
            max_depth: self.max_depth,
        })
    }

    pub fn contains(&self, flow_id: &FlowId) -> bool {
        self.frames.contains(flow_id)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Flow currently on top.
    pub fn current(&self) -> Option<&FlowId> {
        self.frames.last()
    }

    pub fn frames(&self) -> &[FlowId] {
        &self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_pushes_without_mutating_parent() {
        let root = CallStack::new();
        let child = root.enter(&FlowId::new("a")).unwrap();
        let grandchild = child.enter(&FlowId::new("b")).unwrap();

        assert_eq!(root.depth(), 0);
        assert_eq!(child.depth(), 1);
        assert_eq!(grandchild.current(), Some(&FlowId::new("b")));
        assert_eq!(grandchild.frames(), &[FlowId::new("a"), FlowId::new("b")]);
    }

    #[test]
    fn test_cycle_rejected() {
        let stack = CallStack::new()
            .enter(&FlowId::new("a"))
            .unwrap()
            .enter(&FlowId::new("b"))
            .unwrap();

        assert_eq!(
            stack.enter(&FlowId::new("a")),
            Err(GraphError::CyclicInvocation(FlowId::new("a")))
        );
    }

    #[test]
    fn test_sibling_stacks_are_independent() {
        let root = CallStack::new();
        let _first = root.enter(&FlowId::new("a")).unwrap();
        // A second trigger of the same flow is not a cycle.
        assert!(root.enter(&FlowId::new("a")).is_ok());
    }

    #[test]
    fn test_depth_limit() {
        let stack = CallStack::with_max_depth(1).enter(&FlowId::new("a")).unwrap();
        assert_eq!(
            stack.enter(&FlowId::new("b")),
            Err(GraphError::CallDepthExceeded(1))
        );
    }
}

//! Action capability - the contract every node implementation fulfils.
//!
//! Actions are resolved by a stable type identifier through an
//! [`ActionRegistry`] populated at start-up. The compiler rejects flows that
//! reference unregistered types, so a compiled graph can always be built.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use profileflow_core::graph::{
//!     Action, ActionError, ActionInput, ActionOutput, ActionRegistry, FlowContext,
//! };
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Action for Echo {
//!     async fn run(
//!         &self,
//!         input: ActionInput,
//!         _ctx: &FlowContext,
//!     ) -> Result<ActionOutput, ActionError> {
//!         Ok(ActionOutput::port("payload", input.payload))
//!     }
//! }
//!
//! let mut registry = ActionRegistry::new();
//! registry.register("echo", |_init: &serde_json::Value| Ok(Box::new(Echo) as Box<dyn Action>));
//! assert!(registry.contains("echo"));
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::context::FlowContext;
use super::types::{EdgeId, ExecutionError};

// ============================================================================
// RESULTS
// ============================================================================

/// A value produced by a node on one of its output ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub port: String,
    pub value: Value,
}

impl ActionResult {
    pub fn new(port: impl Into<String>, value: Value) -> Self {
        Self {
            port: port.into(),
            value,
        }
    }
}

/// What a node invocation returns.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ActionOutput {
    /// Nothing fires downstream.
    #[default]
    None,
    /// One result on one port.
    One(ActionResult),
    /// Several results, one per port (multi-port fan-out).
    Many(Vec<ActionResult>),
}

impl ActionOutput {
    /// Single result on `port`.
    pub fn port(port: impl Into<String>, value: Value) -> Self {
        Self::One(ActionResult::new(port, value))
    }

    pub fn into_results(self) -> Vec<ActionResult> {
        match self {
            Self::None => Vec::new(),
            Self::One(result) => vec![result],
            Self::Many(results) => results,
        }
    }
}

impl From<ActionResult> for ActionOutput {
    fn from(result: ActionResult) -> Self {
        Self::One(result)
    }
}

impl From<Vec<ActionResult>> for ActionOutput {
    fn from(results: Vec<ActionResult>) -> Self {
        Self::Many(results)
    }
}

// ============================================================================
// INPUT
// ============================================================================

/// The input delivered to one firing of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionInput {
    /// Input port the value arrived on.
    pub port: String,
    pub payload: Value,
    /// Delivering edge; `None` when a start node receives the run payload.
    pub edge_id: Option<EdgeId>,
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors raised by action implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),

    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

// ============================================================================
// ACTION TRAIT
// ============================================================================

/// A unit of work bound to a node.
///
/// Only [`run`](Action::run) is required. `set_up` is awaited once when the
/// engine instantiates the node, `close` once after the run loop ends, and
/// `on_error` when a run of this node fails.
#[async_trait]
pub trait Action: Send + Sync {
    /// Prepare the instance from the node's init config.
    async fn set_up(&mut self, _init: &Value) -> Result<(), ActionError> {
        Ok(())
    }

    /// Process one input.
    async fn run(&self, input: ActionInput, ctx: &FlowContext)
        -> Result<ActionOutput, ActionError>;

    /// Release resources held by the instance.
    async fn close(&self) -> Result<(), ActionError> {
        Ok(())
    }

    /// Observe a failure of this node.
    async fn on_error(&self, _error: &ExecutionError) {}
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Constructor capability for one action type.
pub trait ActionFactory: Send + Sync {
    fn create(&self, init: &Value) -> Result<Box<dyn Action>, ActionError>;
}

impl<F> ActionFactory for F
where
    F: Fn(&Value) -> Result<Box<dyn Action>, ActionError> + Send + Sync,
{
    fn create(&self, init: &Value) -> Result<Box<dyn Action>, ActionError> {
        self(init)
    }
}

/// Maps action-type identifiers to constructors.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    factories: HashMap<String, Arc<dyn ActionFactory>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor closure; replaces an earlier registration of
    /// the same type.
    pub fn register<F>(&mut self, action_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Box<dyn Action>, ActionError> + Send + Sync + 'static,
    {
        self.register_factory(action_type, Arc::new(factory))
    }

    /// Register a shared factory object.
    pub fn register_factory(
        &mut self,
        action_type: impl Into<String>,
        factory: Arc<dyn ActionFactory>,
    ) -> &mut Self {
        self.factories.insert(action_type.into(), factory);
        self
    }

    /// Register a type constructed with `Default` and configured in `set_up`.
    pub fn register_default<A>(&mut self, action_type: impl Into<String>) -> &mut Self
    where
        A: Action + Default + 'static,
    {
        self.register(action_type, |_: &Value| {
            Ok(Box::new(A::default()) as Box<dyn Action>)
        })
    }

    pub fn get(&self, action_type: &str) -> Option<&Arc<dyn ActionFactory>> {
        self.factories.get(action_type)
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.factories.contains_key(action_type)
    }

    /// Registered identifiers, sorted.
    pub fn action_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("action_types", &self.action_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

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

    #[test]
    fn test_output_into_results() {
        assert!(ActionOutput::None.into_results().is_empty());
        assert_eq!(
            ActionOutput::port("true", json!(1)).into_results(),
            vec![ActionResult::new("true", json!(1))]
        );

        let many: ActionOutput = vec![
            ActionResult::new("a", json!(1)),
            ActionResult::new("b", json!(2)),
        ]
        .into();
        assert_eq!(many.into_results().len(), 2);
    }

    #[test]
    fn test_registry() {
        let mut registry = ActionRegistry::new();
        registry
            .register_default::<Noop>("noop")
            .register("configured", |init: &Value| {
                if init.get("required").is_none() {
                    return Err(ActionError::InvalidConfig("missing 'required'".into()));
                }
                Ok(Box::new(Noop) as Box<dyn Action>)
            });

        assert_eq!(registry.action_types(), vec!["configured", "noop"]);
        assert!(registry.get("noop").unwrap().create(&Value::Null).is_ok());
        assert!(registry
            .get("configured")
            .unwrap()
            .create(&json!({}))
            .is_err());
        assert!(registry.get("missing").is_none());
    }
}

//! Flow catalog and the sub-flow action.
//!
//! The catalog holds one engine per flow id. A `subflow` node runs another
//! flow of the catalog with its input as payload and returns that flow's
//! outputs. The call stack in [`FlowContext`] rejects a flow that is already
//! running further up the chain.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::debug;

use super::action::{Action, ActionError, ActionInput, ActionOutput, ActionRegistry};
use super::context::FlowContext;
use super::engine::{FlowEngine, FlowRun};
use super::types::{FlowId, GraphError};

/// Action type under which [`SubFlowAction`] is registered.
pub const SUBFLOW_ACTION_TYPE: &str = "subflow";

// ============================================================================
// CATALOG
// ============================================================================

/// Compiled flows addressable by id.
#[derive(Debug, Default)]
pub struct FlowCatalog {
    engines: RwLock<HashMap<FlowId, Arc<FlowEngine>>>,
}

impl FlowCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the `subflow` action type against this catalog.
    ///
    /// The factory holds a weak reference, so engines stored in the catalog
    /// do not keep the catalog alive.
    pub fn register_action(self: &Arc<Self>, registry: &mut ActionRegistry) {
        let catalog = Arc::downgrade(self);
        registry.register(SUBFLOW_ACTION_TYPE, move |_: &Value| {
            Ok(Box::new(SubFlowAction::new(catalog.clone())) as Box<dyn Action>)
        });
    }

    pub async fn insert(&self, engine: FlowEngine) -> Option<Arc<FlowEngine>> {
        let flow_id = engine.flow_id().clone();
        debug!(flow_id = %flow_id, "Registering flow");
        self.engines.write().await.insert(flow_id, Arc::new(engine))
    }

    pub async fn get(&self, flow_id: &FlowId) -> Option<Arc<FlowEngine>> {
        self.engines.read().await.get(flow_id).cloned()
    }

    pub async fn remove(&self, flow_id: &FlowId) -> Option<Arc<FlowEngine>> {
        self.engines.write().await.remove(flow_id)
    }

    /// Registered flow ids, sorted.
    pub async fn flow_ids(&self) -> Vec<FlowId> {
        let mut ids: Vec<FlowId> = self.engines.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run `flow_id` as a child of `parent`.
    ///
    /// # Errors
    ///
    /// Fails when the flow is unknown, already running in the parent's call
    /// chain, or cannot be instantiated.
    pub async fn run(
        &self,
        flow_id: &FlowId,
        payload: Value,
        parent: &FlowContext,
    ) -> Result<FlowRun, SubFlowError> {
        let ctx = parent.enter(flow_id)?;
        let engine = self
            .get(flow_id)
            .await
            .ok_or_else(|| SubFlowError::UnknownFlow(flow_id.clone()))?;
        Ok(engine.run(payload, &ctx).await?)
    }
}

/// Errors starting a flow from the catalog.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SubFlowError {
    #[error("Unknown flow: {0}")]
    UnknownFlow(FlowId),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

// ============================================================================
// SUB-FLOW ACTION
// ============================================================================

/// Runs another flow of the catalog. Init config: `{"flow_id": "..."}`.
pub struct SubFlowAction {
    catalog: Weak<FlowCatalog>,
    flow_id: Option<FlowId>,
}

impl SubFlowAction {
    fn new(catalog: Weak<FlowCatalog>) -> Self {
        Self {
            catalog,
            flow_id: None,
        }
    }
}

#[async_trait]
impl Action for SubFlowAction {
    async fn set_up(&mut self, init: &Value) -> Result<(), ActionError> {
        let flow_id = init
            .get("flow_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::InvalidConfig("subflow requires `flow_id`".into()))?;
        self.flow_id = Some(FlowId::new(flow_id));
        Ok(())
    }

    async fn run(&self, input: ActionInput, ctx: &FlowContext) -> Result<ActionOutput, ActionError> {
        let flow_id = self
            .flow_id
            .as_ref()
            .ok_or_else(|| ActionError::InvalidConfig("subflow not set up".into()))?;
        let catalog = self
            .catalog
            .upgrade()
            .ok_or_else(|| ActionError::Failed("flow catalog dropped".into()))?;

        let run = catalog
            .run(flow_id, input.payload, ctx)
            .await
            .map_err(|e| ActionError::Failed(e.to_string()))?;

        if let Some(error) = run.error() {
            return Err(ActionError::Failed(error.to_string()));
        }

        Ok(if run.outputs.is_empty() {
            ActionOutput::None
        } else {
            ActionOutput::Many(run.outputs)
        })
    }
}

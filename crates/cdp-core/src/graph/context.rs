//! FlowContext - per-run state shared by every action of a run.
//!
//! Holds the triggering event, the profile being processed and the call
//! stack. The profile slot is shared with child contexts created for
//! sub-flows, so a flow started from another flow mutates the same profile.

use std::sync::Arc;
use tokio::sync::RwLock;

use super::call_stack::CallStack;
use super::types::{FlowId, GraphResult, RunId};
use crate::event::Event;
use crate::profile::Profile;

/// Shared state handed to actions during a run.
#[derive(Debug, Clone)]
pub struct FlowContext {
    run_id: RunId,
    event: Arc<Event>,
    profile: Arc<RwLock<Option<Profile>>>,
    call_stack: CallStack,
}

impl FlowContext {
    /// Context for a top-level trigger.
    pub fn new(event: Event, profile: Option<Profile>) -> Self {
        Self {
            run_id: RunId::generate(),
            event: Arc::new(event),
            profile: Arc::new(RwLock::new(profile)),
            call_stack: CallStack::new(),
        }
    }

    pub fn with_call_stack(mut self, call_stack: CallStack) -> Self {
        self.call_stack = call_stack;
        self
    }

    /// Context for running `flow_id` inside the current call chain.
    ///
    /// # Errors
    ///
    /// Fails when `flow_id` is already executing in this chain.
    pub fn enter(&self, flow_id: &FlowId) -> GraphResult<FlowContext> {
        Ok(Self {
            run_id: RunId::generate(),
            event: Arc::clone(&self.event),
            profile: Arc::clone(&self.profile),
            call_stack: self.call_stack.enter(flow_id)?,
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn call_stack(&self) -> &CallStack {
        &self.call_stack
    }

    /// Snapshot of the current profile.
    pub async fn profile(&self) -> Option<Profile> {
        self.profile.read().await.clone()
    }

    /// Mutate the profile in place; returns `None` when there is no profile.
    pub async fn update_profile<F, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut Profile) -> T,
    {
        self.profile.write().await.as_mut().map(f)
    }

    pub async fn replace_profile(&self, profile: Profile) -> Option<Profile> {
        self.profile.write().await.replace(profile)
    }

    pub async fn take_profile(&self) -> Option<Profile> {
        self.profile.write().await.take()
    }
}

//! # profileflow-core
//!
//! Core of a customer-data platform worker.
//!
//! This crate provides:
//! - [`graph`] - compile user-authored action graphs and run them per event
//! - [`lock`] - a TTL mutex shared by every worker through a key-value store
//! - [`profile`] - the canonical profile and the duplicate merge engine
//! - [`middleware`] - cached and locked handler wrappers
//! - [`processor`] - end-to-end event handling under the profile lock
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use profileflow_core::prelude::*;
//! use profileflow_storage::InMemoryKvStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PlatformConfig::from_env()?;
//!     let processor = EventProcessor::new(
//!         Arc::new(InMemoryKvStore::new()),
//!         Arc::new(InMemoryProfileStore::new()),
//!         FlowCatalog::new(),
//!         config,
//!     );
//!
//!     let mut registry = ActionRegistry::new();
//!     processor.catalog().register_action(&mut registry);
//!     let flow = FlowDefinition::from_json(
//!         r#"{"id": "welcome", "nodes": [
//!             {"id": "run", "action_type": "subflow", "start": true, "init": {"flow_id": "onboarding"}}
//!         ]}"#,
//!     )?;
//!     processor.install(&flow, Arc::new(registry)).await?;
//!
//!     let event = Event::new("page-view").with_profile("p-1");
//!     let outcome = processor.process(event, &FlowId::new("welcome")).await?;
//!     println!("profile {} merged {:?}", outcome.profile.id, outcome.merged_ids);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod event;
pub mod graph;
pub mod lock;
pub mod middleware;
pub mod prelude;
pub mod processor;
pub mod profile;

pub use config::{ConfigError, EngineConfig, LockConfig, MergeConfig, PlatformConfig};
pub use event::Event;
pub use graph::{
    compile, Action, ActionError, ActionRegistry, CompiledGraph, ExecutionError, FlowContext,
    FlowDefinition, FlowEngine, FlowRun, GraphError,
};
pub use lock::{Acquisition, GlobalMutex, LockError, LockState};
pub use processor::{EventProcessor, ProcessError, ProcessOutcome};
pub use profile::{MergeError, MergeOutcome, Profile, ProfileMerger, ProfileStore};

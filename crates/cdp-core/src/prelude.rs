//! Prelude - the commonly used types in one import.
//!
//! ```rust
//! use profileflow_core::prelude::*;
//! ```

pub use crate::config::{
    ConflictStrategy, EngineConfig, ListMergeRule, LockConfig, MergeConfig, PlatformConfig,
};
pub use crate::event::Event;
pub use crate::graph::{
    Action, ActionError, ActionInput, ActionOutput, ActionRegistry, ActionResult, EdgeSpec,
    ExecutionTrace, FlowCatalog, FlowContext, FlowDefinition, FlowEngine, FlowId, FlowRun,
    GraphError, NodeId, NodeSpec, TraceSink, DEFAULT_PORT,
};
pub use crate::lock::{Acquisition, GlobalMutex, LockError, LockState};
pub use crate::middleware::{Cached, Handler, HandlerError, Locked};
pub use crate::processor::{EventProcessor, ProcessError, ProcessOutcome};
pub use crate::profile::{
    InMemoryProfileStore, MergeOutcome, Profile, ProfileMerger, ProfileStore,
};

//! EventProcessor - end-to-end handling of one incoming event.
//!
//! 1. take the profile lock, then the session lock inside it;
//! 2. load (or create) the profile and run the flow with it in context;
//! 3. merge duplicates when a merge key is set, otherwise persist;
//! 4. release both locks.

use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::PlatformConfig;
use crate::event::Event;
use crate::graph::{
    ActionRegistry, FlowCatalog, FlowContext, FlowDefinition, FlowEngine, FlowId, FlowRun,
    GraphError, SubFlowError, TraceSink,
};
use crate::lock::{GlobalMutex, LockError};
use crate::profile::{needs_merge, MergeError, Profile, ProfileMerger, ProfileStore};
use profileflow_storage::{KvStore, StorageError};

/// Errors from processing an event.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ProcessError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Flow(#[from] SubFlowError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Flow removed the profile of {0} from its context")]
    ProfileMissing(String),
}

/// What processing an event produced.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// The profile as persisted.
    pub profile: Profile,
    pub run: FlowRun,
    /// Ids of profiles merged into `profile`.
    pub merged_ids: Vec<String>,
}

/// Routes events through flows under the profile and session locks.
pub struct EventProcessor {
    locks: Arc<dyn KvStore>,
    profiles: Arc<dyn ProfileStore>,
    catalog: Arc<FlowCatalog>,
    merger: ProfileMerger<dyn ProfileStore>,
    trace_sink: Option<Arc<dyn TraceSink>>,
    config: PlatformConfig,
}

impl EventProcessor {
    pub fn new(
        locks: Arc<dyn KvStore>,
        profiles: Arc<dyn ProfileStore>,
        catalog: Arc<FlowCatalog>,
        config: PlatformConfig,
    ) -> Self {
        let merger = ProfileMerger::new(Arc::clone(&profiles), config.merge.clone());
        Self {
            locks,
            profiles,
            catalog,
            merger,
            trace_sink: None,
            config,
        }
    }

    /// Persist traces of flows installed after this call.
    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    pub fn catalog(&self) -> &Arc<FlowCatalog> {
        &self.catalog
    }

    /// Compile `definition` with this worker's engine settings and add it to
    /// the catalog.
    ///
    /// # Errors
    ///
    /// Returns the compile error.
    pub async fn install(
        &self,
        definition: &FlowDefinition,
        registry: Arc<ActionRegistry>,
    ) -> Result<(), GraphError> {
        let mut engine =
            FlowEngine::compile(definition, registry)?.with_config(self.config.engine.clone());
        if let Some(sink) = &self.trace_sink {
            engine = engine.with_trace_sink(Arc::clone(sink));
        }
        self.catalog.insert(engine).await;
        Ok(())
    }

    /// Run `flow_id` for `event`.
    ///
    /// An event without a profile id starts a new profile.
    #[instrument(skip(self, event, flow_id), fields(event_id = %event.id, flow_id = %flow_id))]
    pub async fn process(&self, event: Event, flow_id: &FlowId) -> Result<ProcessOutcome, ProcessError> {
        let profile_id = event
            .profile_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let owner = format!("{}:{}", self.config.worker_name, Uuid::new_v4());

        let profile_lock = GlobalMutex::for_profile(
            Arc::clone(&self.locks),
            &profile_id,
            self.config.lock.clone(),
        );

        profile_lock
            .scoped(&owner, || self.process_in_session(&event, &profile_id, flow_id, &owner))
            .await?
    }

    async fn process_in_session(
        &self,
        event: &Event,
        profile_id: &str,
        flow_id: &FlowId,
        owner: &str,
    ) -> Result<ProcessOutcome, ProcessError> {
        match event.session_id.as_deref() {
            Some(session_id) => {
                let session_lock = GlobalMutex::for_session(
                    Arc::clone(&self.locks),
                    session_id,
                    self.config.lock.clone(),
                );
                session_lock
                    .scoped(owner, || self.process_locked(event, profile_id, flow_id))
                    .await?
            }
            None => self.process_locked(event, profile_id, flow_id).await,
        }
    }

    async fn process_locked(
        &self,
        event: &Event,
        profile_id: &str,
        flow_id: &FlowId,
    ) -> Result<ProcessOutcome, ProcessError> {
        let profile = match self.profiles.load(profile_id).await? {
            Some(profile) => profile,
            None => {
                debug!(profile_id, "Creating profile");
                Profile::new(profile_id)
            }
        };

        let ctx = FlowContext::new(event.clone(), Some(profile));
        let run = self
            .catalog
            .run(flow_id, event.properties.clone(), &ctx)
            .await?;

        let profile = ctx
            .take_profile()
            .await
            .ok_or_else(|| ProcessError::ProfileMissing(profile_id.to_string()))?;

        let (profile, merged_ids) = if needs_merge(&profile, &self.config.merge.merge_keys) {
            let outcome = self.merger.merge(&profile).await?;
            match outcome.merged {
                Some(merged) => {
                    let ids = outcome.duplicates.into_iter().map(|d| d.id).collect();
                    (merged, ids)
                }
                None => {
                    self.profiles.upsert(&profile).await?;
                    (profile, Vec::new())
                }
            }
        } else {
            self.profiles.upsert(&profile).await?;
            (profile, Vec::new())
        };

        info!(
            profile_id = %profile.id,
            merged = merged_ids.len(),
            success = run.is_success(),
            "Event processed"
        );

        Ok(ProcessOutcome {
            profile,
            run,
            merged_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::graph::{
        Action, ActionError, ActionInput, ActionOutput, InMemoryTraceSink, NodeSpec,
    };
    use crate::profile::InMemoryProfileStore;
    use async_trait::async_trait;
    use profileflow_storage::{InMemoryKvStore, KeyPatterns};
    use serde_json::{json, Value};

    /// Tags the profile and copies `email` from the payload.
    #[derive(Default)]
    struct Identify;

    #[async_trait]
    impl Action for Identify {
        async fn run(&self, input: ActionInput, ctx: &FlowContext) -> Result<ActionOutput, ActionError> {
            let email = input.payload.get("email").cloned();
            ctx.update_profile(|p| {
                p.segments.insert("seen".into());
                p.stats.views += 1;
                if let Some(email) = email {
                    p.data.insert("contact".into(), json!({ "email": email }));
                }
            })
            .await;
            Ok(ActionOutput::None)
        }
    }

    struct Fixture {
        locks: Arc<InMemoryKvStore>,
        profiles: Arc<InMemoryProfileStore>,
        sink: Arc<InMemoryTraceSink>,
        processor: EventProcessor,
    }

    async fn fixture(config: PlatformConfig) -> Fixture {
        let locks = Arc::new(InMemoryKvStore::new());
        let profiles = Arc::new(InMemoryProfileStore::new());
        let sink = Arc::new(InMemoryTraceSink::new());
        let processor = EventProcessor::new(
            locks.clone(),
            profiles.clone(),
            FlowCatalog::new(),
            config.clone(),
        )
        .with_trace_sink(sink.clone());

        let mut registry = ActionRegistry::new();
        registry.register_default::<Identify>("identify");
        processor.catalog().register_action(&mut registry);

        let flow = FlowDefinition::new("identify").node(NodeSpec::new("id", "identify").start());
        processor.install(&flow, Arc::new(registry)).await.unwrap();

        Fixture {
            locks,
            profiles,
            sink,
            processor,
        }
    }

    fn event(properties: Value) -> Event {
        Event::new("identify")
            .with_profile("p-1")
            .with_session("s-1")
            .with_properties(properties)
    }

    #[tokio::test]
    async fn test_processes_and_persists_under_lock() {
        let f = fixture(PlatformConfig::default()).await;

        let outcome = f
            .processor
            .process(event(json!({})), &FlowId::new("identify"))
            .await
            .unwrap();

        assert!(outcome.run.is_success());
        assert!(outcome.merged_ids.is_empty());
        let stored = f.profiles.load("p-1").await.unwrap().unwrap();
        assert!(stored.segments.contains("seen"));
        assert_eq!(stored.stats.views, 1);
        assert!(f.locks.is_empty());
    }

    #[tokio::test]
    async fn test_merges_duplicates() {
        let f = fixture(PlatformConfig::default()).await;

        let mut existing = Profile::new("old");
        existing.stats.views = 4;
        existing
            .data
            .insert("contact".into(), json!({ "email": "jo@x.io" }));
        f.profiles.upsert(&existing).await.unwrap();

        let outcome = f
            .processor
            .process(event(json!({ "email": "jo@x.io" })), &FlowId::new("identify"))
            .await
            .unwrap();

        assert_eq!(outcome.merged_ids, vec!["old".to_string()]);
        assert_eq!(outcome.profile.id, "p-1");
        assert_eq!(outcome.profile.stats.views, 5);
        assert!(outcome.profile.ids.contains("old"));

        assert_eq!(f.profiles.len().await, 1);
        assert_eq!(f.profiles.load("p-1").await.unwrap(), Some(outcome.profile));
    }

    #[tokio::test]
    async fn test_fail_fast_when_profile_locked() {
        let mut config = PlatformConfig::default();
        config.lock = LockConfig::new().with_raise_error_when_locked(true);
        let f = fixture(config.clone()).await;

        GlobalMutex::for_profile(f.locks.clone(), "p-1", config.lock.clone())
            .lock("other-worker")
            .await
            .unwrap();

        let result = f
            .processor
            .process(event(json!({})), &FlowId::new("identify"))
            .await;

        assert_eq!(
            result.unwrap_err(),
            ProcessError::Lock(LockError::Locked {
                key: KeyPatterns::profile_lock("p-1"),
                owner: "other-worker".into()
            })
        );
        assert!(f.profiles.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_flow() {
        let f = fixture(PlatformConfig::default()).await;
        let result = f
            .processor
            .process(event(json!({})), &FlowId::new("missing"))
            .await;

        assert!(matches!(
            result,
            Err(ProcessError::Flow(SubFlowError::UnknownFlow(_)))
        ));
        assert!(f.locks.is_empty());
    }

    #[tokio::test]
    async fn test_trace_persisted_when_configured() {
        let mut config = PlatformConfig::default();
        config.engine.always_persist_trace = true;
        let f = fixture(config).await;

        f.processor
            .process(event(json!({})), &FlowId::new("identify"))
            .await
            .unwrap();

        assert_eq!(f.sink.for_flow(&FlowId::new("identify")).await.len(), 1);
    }
}

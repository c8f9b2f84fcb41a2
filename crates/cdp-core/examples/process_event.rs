//! Demo: two anonymous visitors identify with the same email and end up as
//! one profile.
//!
//! Run with:
//! ```bash
//! RUST_LOG=profileflow_core=debug cargo run -p profileflow-core --example process_event
//! ```
//!
//! With `--features redis` and `PROFILEFLOW_REDIS_URL` set, locks go
//! through Redis instead of process memory.

use async_trait::async_trait;
use profileflow_core::prelude::*;
use profileflow_storage::{InMemoryKvStore, KvStore};
use serde_json::{json, Value};
use std::sync::Arc;

const FLOW: &str = r#"{
    "id": "identify",
    "name": "Identify visitor",
    "nodes": [
        {"id": "has-email", "action_type": "has_field", "start": true,
         "init": {"field": "email"}, "outputs": ["true", "false"]},
        {"id": "identify", "action_type": "identify"},
        {"id": "anonymous", "action_type": "add_segment", "init": {"segment": "anonymous"}}
    ],
    "edges": [
        {"id": "e1", "source": {"node_id": "has-email", "port": "true"},
         "target": {"node_id": "identify", "port": "payload"}},
        {"id": "e2", "source": {"node_id": "has-email", "port": "false"},
         "target": {"node_id": "anonymous", "port": "payload"}}
    ]
}"#;

/// Routes the payload to `true` or `false` depending on a field.
#[derive(Default)]
struct HasField {
    field: String,
}

#[async_trait]
impl Action for HasField {
    async fn set_up(&mut self, init: &Value) -> Result<(), ActionError> {
        self.field = init
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::InvalidConfig("`field` is required".into()))?
            .to_string();
        Ok(())
    }

    async fn run(&self, input: ActionInput, _ctx: &FlowContext) -> Result<ActionOutput, ActionError> {
        let port = if input.payload.get(&self.field).is_some() { "true" } else { "false" };
        Ok(ActionOutput::port(port, input.payload))
    }
}

#[derive(Default)]
struct Identify;

#[async_trait]
impl Action for Identify {
    async fn run(&self, input: ActionInput, ctx: &FlowContext) -> Result<ActionOutput, ActionError> {
        let email = input.payload["email"].clone();
        ctx.update_profile(|p| {
            p.data.insert("contact".into(), json!({ "email": email }));
            p.stats.views += 1;
        })
        .await;
        Ok(ActionOutput::None)
    }
}

#[derive(Default)]
struct AddSegment {
    segment: String,
}

#[async_trait]
impl Action for AddSegment {
    async fn set_up(&mut self, init: &Value) -> Result<(), ActionError> {
        self.segment = init["segment"].as_str().unwrap_or("default").to_string();
        Ok(())
    }

    async fn run(&self, _input: ActionInput, ctx: &FlowContext) -> Result<ActionOutput, ActionError> {
        let segment = self.segment.clone();
        ctx.update_profile(|p| p.segments.insert(segment)).await;
        Ok(ActionOutput::None)
    }
}

#[cfg(feature = "redis")]
async fn lock_store(config: &PlatformConfig) -> Result<Arc<dyn KvStore>, Box<dyn std::error::Error>> {
    match &config.redis_url {
        Some(url) => Ok(Arc::new(profileflow_storage::RedisKvStore::connect(url).await?)),
        None => Ok(Arc::new(InMemoryKvStore::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn lock_store(_config: &PlatformConfig) -> Result<Arc<dyn KvStore>, Box<dyn std::error::Error>> {
    Ok(Arc::new(InMemoryKvStore::new()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("profileflow_core=info".parse()?),
        )
        .init();

    let config = PlatformConfig::from_env()?;
    let profiles = Arc::new(InMemoryProfileStore::new());
    let processor = EventProcessor::new(
        lock_store(&config).await?,
        profiles.clone(),
        FlowCatalog::new(),
        config,
    );

    let mut registry = ActionRegistry::new();
    registry
        .register_default::<HasField>("has_field")
        .register_default::<Identify>("identify")
        .register_default::<AddSegment>("add_segment");
    processor.catalog().register_action(&mut registry);
    processor
        .install(&FlowDefinition::from_json(FLOW)?, Arc::new(registry))
        .await?;

    let flow = FlowId::new("identify");
    let events = [
        Event::new("page-view").with_profile("visitor-a").with_properties(json!({})),
        Event::new("signup")
            .with_profile("visitor-a")
            .with_properties(json!({ "email": "jo@example.com" })),
        Event::new("login")
            .with_profile("visitor-b")
            .with_properties(json!({ "email": "jo@example.com" })),
    ];

    for event in events {
        let outcome = processor.process(event, &flow).await?;
        println!(
            "{:<10} segments={:?} views={} merged={:?}",
            outcome.profile.id,
            outcome.profile.segments,
            outcome.profile.stats.views,
            outcome.merged_ids
        );
    }

    println!("profiles stored: {}", profiles.len().await);
    Ok(())
}

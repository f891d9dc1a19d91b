//! Per-agent view over a managed context

use super::manager::ContextManager;
use super::types::{Context, DataSchema};
use crate::agent::retry::RetryPolicy;
use crate::error::AgentResult;
use serde_json::Value;
use std::collections::HashMap;

/// Execution-scoped view of a pipeline's shared state
///
/// Holds ids only; every read and write goes through the context manager, so
/// a view may observe "context not found" at any time if the context expires.
#[derive(Debug, Clone)]
pub struct AgentContext {
    manager: ContextManager,
    pipeline_id: String,
    context_id: String,
    parent_context_id: Option<String>,
    version: String,
    agent_id: Option<String>,
    agent_config: HashMap<String, Value>,
    retries_override: Option<u32>,
    retry_policy: RetryPolicy,
}

impl AgentContext {
    pub fn new(
        manager: ContextManager,
        pipeline_id: String,
        context_id: String,
        parent_context_id: Option<String>,
        version: String,
    ) -> Self {
        Self {
            manager,
            pipeline_id,
            context_id,
            parent_context_id,
            version,
            agent_id: None,
            agent_config: HashMap::new(),
            retries_override: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Narrow the view to a specific agent
    pub fn for_agent<S: Into<String>>(mut self, agent_id: S) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Attach the per-agent configuration from the pipeline definition
    pub fn with_agent_config(mut self, config: HashMap<String, Value>) -> Self {
        self.agent_config = config;
        self
    }

    /// Pipeline-level override of the agent's retry count
    pub fn with_retries_override(mut self, retries: Option<u32>) -> Self {
        self.retries_override = retries;
        self
    }

    pub(crate) fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = RetryPolicy {
            max_retries: self.retries_override.unwrap_or(policy.max_retries),
            ..policy
        };
        self
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn parent_context_id(&self) -> Option<&str> {
        self.parent_context_id.as_deref()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    pub fn agent_config(&self) -> &HashMap<String, Value> {
        &self.agent_config
    }

    pub fn retries_override(&self) -> Option<u32> {
        self.retries_override
    }

    /// Retry policy for agent-internal retries
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    pub fn manager(&self) -> &ContextManager {
        &self.manager
    }

    pub async fn get(&self, key: &str) -> AgentResult<Option<Value>> {
        self.manager.get_data(&self.context_id, key).await
    }

    pub async fn set(&self, key: &str, value: Value) -> AgentResult<bool> {
        self.manager
            .set_data(&self.context_id, key, value, None)
            .await
    }

    pub async fn set_with_schema(
        &self,
        key: &str,
        value: Value,
        schema: DataSchema,
    ) -> AgentResult<bool> {
        self.manager
            .set_data(&self.context_id, key, value, Some(schema))
            .await
    }

    pub async fn update<F>(&self, key: &str, updater: F) -> AgentResult<bool>
    where
        F: FnOnce(&Value) -> Value + Send,
    {
        self.manager
            .update_data(&self.context_id, key, updater)
            .await
    }

    pub async fn delete(&self, key: &str) -> AgentResult<bool> {
        self.manager.delete_data(&self.context_id, key).await
    }

    /// Copy of the underlying context
    pub async fn snapshot(&self) -> AgentResult<Context> {
        self.manager.get_context(&self.context_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::types::{ContextMetadata, SchemaType};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_view_reads_and_writes_through_manager() {
        let manager = ContextManager::default();
        let context = manager
            .create_context("p1", ContextMetadata::owned_by("p1"))
            .await;
        let view = manager.agent_context(&context.id).await.unwrap();

        assert_eq!(view.pipeline_id(), "p1");
        assert_eq!(view.version(), "1");
        assert!(view.set("k", json!("v")).await.unwrap());
        assert_eq!(
            manager.get_data(&context.id, "k").await.unwrap(),
            Some(json!("v"))
        );
        assert!(!view
            .set_with_schema("n", json!("x"), DataSchema::new(SchemaType::Number))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_view_sees_deleted_context() {
        let manager = ContextManager::default();
        let context = manager.create_context("p1", ContextMetadata::default()).await;
        let view = manager.agent_context(&context.id).await.unwrap();

        manager.delete_context(&context.id).await;
        assert!(view.get("k").await.is_err());
    }

    #[test]
    fn test_retry_override_wins() {
        let view = AgentContext::new(
            ContextManager::default(),
            "p".to_string(),
            "c".to_string(),
            None,
            "1".to_string(),
        )
        .with_retries_override(Some(7))
        .with_retry_policy(RetryPolicy::new(2, Duration::from_millis(5)));

        assert_eq!(view.retry_policy().max_retries, 7);
        assert_eq!(view.retry_policy().base_delay, Duration::from_millis(5));
    }
}

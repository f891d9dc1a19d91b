//! Context manager: sole owner of run-scoped shared state
//!
//! All reads and writes go through [`ContextManager`] so cloning, sharing,
//! and versioning have a single source of truth. Callers always receive
//! copies; mutating a returned [`Context`] never touches managed state.

use super::types::{Context, ContextEntry, ContextMetadata, DataSchema};
use super::view::AgentContext;
use crate::config::ContextSection;
use crate::error::{AgentError, AgentResult};
use crate::observability::metrics::metrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Outcome of [`ContextManager::optimize_storage`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageReport {
    pub expired_removed: usize,
    pub lineage_removed: usize,
    pub bytes_freed: usize,
}

/// Thread-safe handle over the context store
#[derive(Debug, Clone)]
pub struct ContextManager {
    contexts: Arc<RwLock<HashMap<String, Context>>>,
    settings: ContextSection,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(ContextSection::default())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Globally unique id: owning pipeline, creation millis, random suffix
fn generate_context_id(pipeline_id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{pipeline_id}_{}_{}",
        Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}

/// Snapshot id; the suffix keeps ids unique once a revert reuses a version number
fn version_id(context_id: &str, version: u64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{context_id}_v{version}_{}", &suffix[..8])
}

impl ContextManager {
    pub fn new(settings: ContextSection) -> Self {
        Self {
            contexts: Arc::new(RwLock::new(HashMap::new())),
            settings,
        }
    }

    pub fn settings(&self) -> &ContextSection {
        &self.settings
    }

    /// Allocate a fresh context; expiration defaults to the configured root TTL
    pub async fn create_context(&self, pipeline_id: &str, metadata: ContextMetadata) -> Context {
        let now = Utc::now();
        let mut metadata = metadata;
        if metadata.expiration.is_none() {
            metadata.expiration = Some(now + to_chrono(self.settings.default_expiration()));
        }

        let context = Context {
            id: generate_context_id(pipeline_id),
            pipeline_id: pipeline_id.to_string(),
            data: HashMap::new(),
            metadata,
            version: 1,
            created: now,
            updated: now,
        };

        self.contexts
            .write()
            .await
            .insert(context.id.clone(), context.clone());
        metrics().record_context_created();

        debug!(
            context_id = %context.id,
            pipeline_id = %pipeline_id,
            "Created context"
        );
        context
    }

    /// Fetch a copy of a live context
    ///
    /// Expired contexts are deleted on read and reported as not found.
    pub async fn get_context(&self, context_id: &str) -> AgentResult<Context> {
        let now = Utc::now();
        {
            let contexts = self.contexts.read().await;
            match contexts.get(context_id) {
                None => return Err(AgentError::context_not_found(context_id)),
                Some(context) if !context.is_expired_at(now) => return Ok(context.clone()),
                Some(_) => {}
            }
        }

        let mut contexts = self.contexts.write().await;
        if let Some(context) = contexts.get(context_id) {
            if context.is_expired_at(now) {
                contexts.remove(context_id);
                metrics().record_contexts_expired(1);
                debug!(context_id = %context_id, "Removed expired context on read");
            } else {
                return Ok(context.clone());
            }
        }
        Err(AgentError::context_not_found(context_id))
    }

    /// Run `f` against a live context under the write lock
    async fn with_live_context<T>(
        &self,
        context_id: &str,
        f: impl FnOnce(&mut Context) -> T + Send,
    ) -> AgentResult<T> {
        let now = Utc::now();
        let mut contexts = self.contexts.write().await;
        let expired = match contexts.get(context_id) {
            None => return Err(AgentError::context_not_found(context_id)),
            Some(context) => context.is_expired_at(now),
        };
        if expired {
            contexts.remove(context_id);
            metrics().record_contexts_expired(1);
            return Err(AgentError::context_not_found(context_id));
        }
        match contexts.get_mut(context_id) {
            Some(context) => Ok(f(context)),
            None => Err(AgentError::context_not_found(context_id)),
        }
    }

    /// Deep-copy a context under a new id with version reset to 1
    pub async fn clone_context(&self, context_id: &str) -> AgentResult<Context> {
        let source = self.get_context(context_id).await?;
        let metadata = ContextMetadata {
            parent_id: Some(source.id.clone()),
            lineage: Some(source.metadata.lineage.clone().unwrap_or(source.id.clone())),
            ..source.metadata.clone()
        }
        .with_tag("cloned");

        let copy = self.insert_derived(&source, &source.pipeline_id, metadata).await;
        info!(source = %context_id, clone = %copy.id, "Cloned context");
        Ok(copy)
    }

    /// Copy a context into a new one owned by `target_pipeline_id`
    pub async fn share_context(
        &self,
        context_id: &str,
        target_pipeline_id: &str,
    ) -> AgentResult<Context> {
        let source = self.get_context(context_id).await?;
        let metadata = ContextMetadata {
            owner: target_pipeline_id.to_string(),
            parent_id: Some(source.id.clone()),
            lineage: Some(source.metadata.lineage.clone().unwrap_or(source.id.clone())),
            ..source.metadata.clone()
        }
        .with_tag("shared");

        let copy = self
            .insert_derived(&source, target_pipeline_id, metadata)
            .await;
        info!(
            source = %context_id,
            shared = %copy.id,
            target_pipeline = %target_pipeline_id,
            "Shared context"
        );
        Ok(copy)
    }

    async fn insert_derived(
        &self,
        source: &Context,
        pipeline_id: &str,
        metadata: ContextMetadata,
    ) -> Context {
        let now = Utc::now();
        let copy = Context {
            id: generate_context_id(pipeline_id),
            pipeline_id: pipeline_id.to_string(),
            data: source.data.clone(),
            metadata,
            version: 1,
            created: now,
            updated: now,
        };
        self.contexts
            .write()
            .await
            .insert(copy.id.clone(), copy.clone());
        metrics().record_context_created();
        copy
    }

    /// Store a value, optionally validated against `schema`
    ///
    /// Returns `Ok(false)` and leaves the context untouched when the value
    /// does not satisfy the schema.
    pub async fn set_data(
        &self,
        context_id: &str,
        key: &str,
        value: Value,
        schema: Option<DataSchema>,
    ) -> AgentResult<bool> {
        if let Some(schema) = &schema {
            if let Err(violations) = schema.check(&value) {
                warn!(
                    context_id = %context_id,
                    key = %key,
                    violations = ?violations,
                    "Rejected context write failing schema"
                );
                // Absent contexts still fail loudly
                self.with_live_context(context_id, |_| ()).await?;
                return Ok(false);
            }
        }

        self.with_live_context(context_id, |context| {
            let now = Utc::now();
            context.data.insert(
                key.to_string(),
                ContextEntry {
                    value,
                    timestamp: now,
                    schema,
                },
            );
            context.updated = now;
            true
        })
        .await
    }

    /// Read a single value
    pub async fn get_data(&self, context_id: &str, key: &str) -> AgentResult<Option<Value>> {
        let context = self.get_context(context_id).await?;
        Ok(context.value(key).cloned())
    }

    /// Replace an existing value with `updater(current)`
    ///
    /// Never creates keys: returns `Ok(false)` when `key` is absent or when
    /// the new value violates the entry's stored schema.
    pub async fn update_data<F>(&self, context_id: &str, key: &str, updater: F) -> AgentResult<bool>
    where
        F: FnOnce(&Value) -> Value + Send,
    {
        self.with_live_context(context_id, |context| {
            let Some(entry) = context.data.get_mut(key) else {
                return false;
            };
            let updated = updater(&entry.value);
            if let Some(schema) = &entry.schema {
                if schema.check(&updated).is_err() {
                    return false;
                }
            }
            let now = Utc::now();
            entry.value = updated;
            entry.timestamp = now;
            context.updated = now;
            true
        })
        .await
    }

    /// Remove a key; `Ok(false)` when it was already absent
    pub async fn delete_data(&self, context_id: &str, key: &str) -> AgentResult<bool> {
        self.with_live_context(context_id, |context| {
            let removed = context.data.remove(key).is_some();
            if removed {
                context.updated = Utc::now();
            }
            removed
        })
        .await
    }

    /// Remove a context; `false` when it was already absent
    pub async fn delete_context(&self, context_id: &str) -> bool {
        let removed = self.contexts.write().await.remove(context_id).is_some();
        if removed {
            debug!(context_id = %context_id, "Deleted context");
        }
        removed
    }

    /// Snapshot the live context and bump its version
    ///
    /// The snapshot is an independent context stored under
    /// `<id>_v<version>_<suffix>`; the returned id is accepted by
    /// [`ContextManager::revert_to_version`].
    pub async fn create_version(&self, context_id: &str) -> AgentResult<String> {
        let now = Utc::now();
        let snapshot = self
            .with_live_context(context_id, |context| {
                let mut snapshot = context.clone();
                snapshot.id = version_id(&context.id, context.version);
                snapshot.metadata = ContextMetadata {
                    parent_id: Some(context.id.clone()),
                    lineage: None,
                    ..context.metadata.clone()
                }
                .with_tag("version");
                snapshot.created = now;

                context.version += 1;
                context.updated = now;
                snapshot
            })
            .await?;

        let snapshot_id = snapshot.id.clone();
        self.contexts
            .write()
            .await
            .insert(snapshot_id.clone(), snapshot);

        info!(context_id = %context_id, version_id = %snapshot_id, "Created context version");
        Ok(snapshot_id)
    }

    /// Restore data and version number from a snapshot made by `create_version`
    pub async fn revert_to_version(&self, context_id: &str, version_id: &str) -> AgentResult<()> {
        let snapshot = self.get_context(version_id).await?;
        if snapshot.metadata.parent_id.as_deref() != Some(context_id)
            || !snapshot.metadata.has_tag("version")
        {
            return Err(AgentError::validation(format!(
                "{version_id} is not a version of context {context_id}"
            )));
        }

        self.with_live_context(context_id, |context| {
            context.data = snapshot.data.clone();
            context.version = snapshot.version;
            context.updated = Utc::now();
        })
        .await?;

        info!(context_id = %context_id, version_id = %version_id, "Reverted context");
        Ok(())
    }

    /// Delete every expired context, returning how many were removed
    pub async fn cleanup_expired_contexts(&self) -> usize {
        self.remove_expired(Utc::now())
            .instrument(crate::context_span!(operation = "cleanup_expired"))
            .await
            .0
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> (usize, usize) {
        let mut contexts = self.contexts.write().await;
        let mut removed = 0;
        let mut bytes = 0;
        contexts.retain(|context_id, context| {
            if context.is_expired_at(now) {
                debug!(context_id = %context_id, "Removing expired context");
                removed += 1;
                bytes += context.estimated_size();
                false
            } else {
                true
            }
        });

        if removed > 0 {
            metrics().record_contexts_expired(removed as u64);
            info!(removed, remaining = contexts.len(), "Cleaned up expired contexts");
        }
        (removed, bytes)
    }

    /// Expire stale contexts, then cap each clone/share lineage
    ///
    /// Only the `max_lineage` most recently created derived contexts per base
    /// id survive. Base contexts themselves are never removed here.
    pub async fn optimize_storage(&self) -> StorageReport {
        let (expired_removed, mut bytes_freed) = self.remove_expired(Utc::now()).await;

        let mut contexts = self.contexts.write().await;
        let mut lineages: HashMap<String, Vec<(DateTime<Utc>, String)>> = HashMap::new();
        for context in contexts.values() {
            if let Some(base) = &context.metadata.lineage {
                lineages
                    .entry(base.clone())
                    .or_default()
                    .push((context.created, context.id.clone()));
            }
        }

        let mut lineage_removed = 0;
        for members in lineages.values_mut() {
            if members.len() <= self.settings.max_lineage {
                continue;
            }
            members.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
            for (_, context_id) in members.drain(self.settings.max_lineage..) {
                if let Some(context) = contexts.remove(&context_id) {
                    bytes_freed += context.estimated_size();
                    lineage_removed += 1;
                }
            }
        }

        let report = StorageReport {
            expired_removed,
            lineage_removed,
            bytes_freed,
        };
        info!(
            expired_removed,
            lineage_removed,
            bytes_freed,
            "Optimized context storage"
        );
        report
    }

    /// Build the per-agent view of a live context
    pub async fn agent_context(&self, context_id: &str) -> AgentResult<AgentContext> {
        let context = self.get_context(context_id).await?;
        Ok(AgentContext::new(
            self.clone(),
            context.pipeline_id,
            context.id,
            context.metadata.parent_id,
            context.version.to_string(),
        ))
    }

    /// Persist an agent's view as a child context with the agent TTL
    pub async fn persist_agent_context(&self, agent_context: &AgentContext) -> AgentResult<Context> {
        let source = self.get_context(agent_context.context_id()).await?;
        let owner = agent_context
            .agent_id()
            .unwrap_or(agent_context.pipeline_id())
            .to_string();
        let metadata = ContextMetadata::owned_by(owner)
            .with_expiration(Utc::now() + to_chrono(self.settings.agent_context_expiration()))
            .with_tag("agent");
        let metadata = ContextMetadata {
            parent_id: Some(source.id.clone()),
            ..metadata
        };

        let persisted = self
            .insert_derived(&source, agent_context.pipeline_id(), metadata)
            .await;
        debug!(
            context_id = %source.id,
            persisted = %persisted.id,
            "Persisted agent context"
        );
        Ok(persisted)
    }

    /// Live (unexpired) contexts belonging to `pipeline_id`
    pub async fn list_contexts(&self, pipeline_id: &str) -> Vec<Context> {
        let now = Utc::now();
        self.contexts
            .read()
            .await
            .values()
            .filter(|c| c.pipeline_id == pipeline_id && !c.is_expired_at(now))
            .cloned()
            .collect()
    }

    /// Number of stored contexts, including not-yet-swept expired ones
    pub async fn context_count(&self) -> usize {
        self.contexts.read().await.len()
    }

    /// Spawn the expiry sweep at the configured `cleanup_interval_secs`
    pub fn spawn_default_cleanup_task(&self) -> JoinHandle<()> {
        self.spawn_cleanup_task(self.settings.cleanup_interval())
    }

    /// Spawn the periodic expiry sweep
    ///
    /// The sweep runs until the returned handle is aborted.
    pub fn spawn_cleanup_task(&self, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick completes immediately, skip it

            loop {
                ticker.tick().await;
                let removed = manager.cleanup_expired_contexts().await;
                debug!(removed, "Context expiry sweep finished");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::types::SchemaType;
    use serde_json::json;

    async fn manager_with_context() -> (ContextManager, Context) {
        let manager = ContextManager::default();
        let context = manager
            .create_context("pipeline-1", ContextMetadata::owned_by("pipeline-1"))
            .await;
        (manager, context)
    }

    #[tokio::test]
    async fn test_create_assigns_default_expiration() {
        let (_, context) = manager_with_context().await;
        let expiration = context.metadata.expiration.unwrap();
        let ttl = expiration - context.created;
        assert_eq!(ttl.num_hours(), 24);
        assert!(context.id.starts_with("pipeline-1_"));
        assert_eq!(context.version, 1);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let manager = ContextManager::default();
        let a = manager.create_context("p", ContextMetadata::default()).await;
        let b = manager.create_context("p", ContextMetadata::default()).await;
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_returned_context_is_a_copy() {
        let (manager, mut context) = manager_with_context().await;
        context.data.insert(
            "leak".to_string(),
            ContextEntry {
                value: json!(1),
                timestamp: Utc::now(),
                schema: None,
            },
        );

        let stored = manager.get_context(&context.id).await.unwrap();
        assert!(stored.data.is_empty());
    }

    #[tokio::test]
    async fn test_set_data_refreshes_updated_not_version() {
        let (manager, context) = manager_with_context().await;
        assert!(manager
            .set_data(&context.id, "k", json!("v"), None)
            .await
            .unwrap());

        let stored = manager.get_context(&context.id).await.unwrap();
        assert_eq!(stored.value("k"), Some(&json!("v")));
        assert!(stored.updated >= context.updated);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_schema_rejection_leaves_context_unchanged() {
        let (manager, context) = manager_with_context().await;
        let accepted = manager
            .set_data(
                &context.id,
                "count",
                json!("three"),
                Some(DataSchema::new(SchemaType::Number)),
            )
            .await
            .unwrap();

        assert!(!accepted);
        assert_eq!(manager.get_data(&context.id, "count").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_data_requires_existing_key() {
        let (manager, context) = manager_with_context().await;
        let updated = manager
            .update_data(&context.id, "missing", |_| json!(1))
            .await
            .unwrap();
        assert!(!updated);
        assert_eq!(manager.get_data(&context.id, "missing").await.unwrap(), None);

        manager
            .set_data(&context.id, "n", json!(1), None)
            .await
            .unwrap();
        let updated = manager
            .update_data(&context.id, "n", |v| json!(v.as_i64().unwrap_or(0) + 1))
            .await
            .unwrap();
        assert!(updated);
        assert_eq!(
            manager.get_data(&context.id, "n").await.unwrap(),
            Some(json!(2))
        );
    }

    #[tokio::test]
    async fn test_update_respects_stored_schema() {
        let (manager, context) = manager_with_context().await;
        manager
            .set_data(
                &context.id,
                "n",
                json!(1),
                Some(DataSchema::new(SchemaType::Number)),
            )
            .await
            .unwrap();

        let updated = manager
            .update_data(&context.id, "n", |_| json!("not a number"))
            .await
            .unwrap();
        assert!(!updated);
        assert_eq!(
            manager.get_data(&context.id, "n").await.unwrap(),
            Some(json!(1))
        );
    }

    #[tokio::test]
    async fn test_delete_flags() {
        let (manager, context) = manager_with_context().await;
        manager
            .set_data(&context.id, "k", json!(true), None)
            .await
            .unwrap();

        assert!(manager.delete_data(&context.id, "k").await.unwrap());
        assert!(!manager.delete_data(&context.id, "k").await.unwrap());
        assert!(manager.delete_context(&context.id).await);
        assert!(!manager.delete_context(&context.id).await);
        assert!(manager.get_context(&context.id).await.is_err());
    }

    #[tokio::test]
    async fn test_version_and_revert() {
        let (manager, context) = manager_with_context().await;
        manager
            .set_data(&context.id, "draft", json!("v1"), None)
            .await
            .unwrap();

        let version = manager.create_version(&context.id).await.unwrap();
        assert!(version.starts_with(&format!("{}_v1_", context.id)));
        assert_eq!(manager.get_context(&context.id).await.unwrap().version, 2);

        manager
            .set_data(&context.id, "draft", json!("v2"), None)
            .await
            .unwrap();
        manager.revert_to_version(&context.id, &version).await.unwrap();

        let reverted = manager.get_context(&context.id).await.unwrap();
        assert_eq!(reverted.value("draft"), Some(&json!("v1")));
        assert_eq!(reverted.version, 1);

        // Snapshot is independent of later writes
        let snapshot = manager.get_context(&version).await.unwrap();
        assert_eq!(snapshot.value("draft"), Some(&json!("v1")));
    }

    #[tokio::test]
    async fn test_version_after_revert_keeps_earlier_snapshot() {
        let (manager, context) = manager_with_context().await;
        manager
            .set_data(&context.id, "k", json!("A"), None)
            .await
            .unwrap();
        let first = manager.create_version(&context.id).await.unwrap();

        manager
            .set_data(&context.id, "k", json!("B"), None)
            .await
            .unwrap();
        manager.revert_to_version(&context.id, &first).await.unwrap();
        manager
            .set_data(&context.id, "k", json!("C"), None)
            .await
            .unwrap();
        let second = manager.create_version(&context.id).await.unwrap();

        assert_ne!(first, second);
        let first_snapshot = manager.get_context(&first).await.unwrap();
        assert_eq!(first_snapshot.value("k"), Some(&json!("A")));
        let second_snapshot = manager.get_context(&second).await.unwrap();
        assert_eq!(second_snapshot.value("k"), Some(&json!("C")));
    }

    #[tokio::test]
    async fn test_revert_rejects_foreign_snapshot() {
        let (manager, context) = manager_with_context().await;
        let other = manager.create_context("p2", ContextMetadata::default()).await;
        let version = manager.create_version(&other.id).await.unwrap();

        let result = manager.revert_to_version(&context.id, &version).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_optimize_caps_lineage() {
        let (manager, context) = manager_with_context().await;
        manager
            .set_data(&context.id, "k", json!("payload"), None)
            .await
            .unwrap();

        let mut clones = Vec::new();
        for _ in 0..5 {
            clones.push(manager.clone_context(&context.id).await.unwrap());
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let report = manager.optimize_storage().await;
        assert_eq!(report.lineage_removed, 2);
        assert_eq!(report.expired_removed, 0);
        assert!(report.bytes_freed > 0);

        // Base and the three newest clones survive
        assert!(manager.get_context(&context.id).await.is_ok());
        assert!(manager.get_context(&clones[0].id).await.is_err());
        assert!(manager.get_context(&clones[1].id).await.is_err());
        for clone in &clones[2..] {
            assert!(manager.get_context(&clone.id).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_clone_of_clone_shares_lineage() {
        let (manager, context) = manager_with_context().await;
        let first = manager.clone_context(&context.id).await.unwrap();
        let second = manager.clone_context(&first.id).await.unwrap();
        assert_eq!(second.metadata.lineage.as_deref(), Some(context.id.as_str()));
        assert_eq!(second.metadata.parent_id.as_deref(), Some(first.id.as_str()));
    }

    #[tokio::test]
    async fn test_persist_agent_context_uses_agent_ttl() {
        let (manager, context) = manager_with_context().await;
        manager
            .set_data(&context.id, "k", json!(1), None)
            .await
            .unwrap();
        let view = manager
            .agent_context(&context.id)
            .await
            .unwrap()
            .for_agent("writer");

        let persisted = manager.persist_agent_context(&view).await.unwrap();
        assert_eq!(persisted.metadata.owner, "writer");
        assert_eq!(
            persisted.metadata.parent_id.as_deref(),
            Some(context.id.as_str())
        );
        let ttl = persisted.metadata.expiration.unwrap() - persisted.created;
        assert!((59..=60).contains(&ttl.num_minutes()));
        assert_eq!(persisted.value("k"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_list_contexts_by_pipeline() {
        let manager = ContextManager::default();
        manager.create_context("a", ContextMetadata::default()).await;
        manager.create_context("a", ContextMetadata::default()).await;
        manager.create_context("b", ContextMetadata::default()).await;

        assert_eq!(manager.list_contexts("a").await.len(), 2);
        assert_eq!(manager.context_count().await, 3);
    }

    #[tokio::test]
    async fn test_background_sweep_removes_expired() {
        let manager = ContextManager::default();
        let expired = manager
            .create_context(
                "p",
                ContextMetadata::default().with_expiration(Utc::now() - chrono::Duration::seconds(1)),
            )
            .await;

        let handle = manager.spawn_cleanup_task(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert_eq!(manager.context_count().await, 0);
        assert!(manager.get_context(&expired.id).await.is_err());
    }

    #[tokio::test]
    async fn test_default_sweep_uses_configured_interval() {
        let manager = ContextManager::new(ContextSection {
            cleanup_interval_secs: 1,
            ..ContextSection::default()
        });
        manager
            .create_context(
                "p",
                ContextMetadata::default().with_expiration(Utc::now() - chrono::Duration::seconds(1)),
            )
            .await;

        let handle = manager.spawn_default_cleanup_task();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.context_count().await, 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(manager.context_count().await, 0);
        handle.abort();
    }
}

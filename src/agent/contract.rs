//! Uniform execution envelope around agent domain logic
//!
//! Concrete agents implement [`Agent`]. The orchestrator only ever talks to a
//! [`ManagedAgent`], which adds lifecycle state, input/output validation,
//! a hard timeout, panic isolation, and result stamping.

use super::retry::RetryPolicy;
use crate::context::AgentContext;
use crate::error::{AgentError, AgentResult};
use crate::observability::metrics::metrics;
use async_trait::async_trait;
use futures::FutureExt;
use jsonschema::Validator;
use once_cell::sync::OnceCell;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn, Instrument};

/// Input handed to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentInput {
    /// Payload to process
    pub data: Value,
    /// Caller-supplied metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    /// Correlates this input with an upstream request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl AgentInput {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            metadata: None,
            correlation_id: None,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_correlation_id<S: Into<String>>(mut self, correlation_id: S) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Result produced by an agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentOutput {
    pub success: bool,
    pub data: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<AgentError>,
}

impl AgentOutput {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data,
            metadata: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// A handled failure; the agent reports why instead of erroring out
    pub fn failure(data: Value, errors: Vec<AgentError>) -> Self {
        Self {
            success: false,
            data,
            metadata: HashMap::new(),
            errors,
        }
    }

    pub fn with_metadata<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Declared capability with a routing priority in `[0, 100]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub priority: u32,
}

impl Capability {
    pub fn new<S: Into<String>>(name: S, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }
}

/// Static description of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl AgentMetadata {
    pub fn new<S: Into<String>>(id: S, version: S) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: version.into(),
            description: String::new(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Execution settings for a managed agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(with = "super::retry::duration_millis")]
    pub timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "super::retry::duration_millis")]
    pub retry_base_delay: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

impl AgentSettings {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_base_delay)
    }
}

/// Default input schema, generated from [`AgentInput`]
pub fn default_input_schema() -> Value {
    let schema = schemars::schema_for!(AgentInput);
    serde_json::to_value(schema).unwrap_or_else(|_| json!({"type": "object"}))
}

/// Default output schema: an object carrying `success` and `data`
pub fn default_output_schema() -> Value {
    json!({
        "type": "object",
        "required": ["success", "data"],
        "properties": {
            "success": {"type": "boolean"}
        }
    })
}

/// Domain logic of a processing unit
///
/// Implementations stay ignorant of timeouts, validation, and lifecycle
/// bookkeeping; [`ManagedAgent`] supplies those.
#[async_trait]
pub trait Agent: Send + Sync {
    fn metadata(&self) -> AgentMetadata;

    /// JSON schema applied to the serialized [`AgentInput`]
    fn input_schema(&self) -> Value {
        default_input_schema()
    }

    /// JSON schema applied to the serialized [`AgentOutput`]
    fn output_schema(&self) -> Value {
        default_output_schema()
    }

    async fn on_initialize(&self, _context: &AgentContext) -> AgentResult<()> {
        Ok(())
    }

    async fn execute(&self, context: &AgentContext, input: AgentInput) -> AgentResult<AgentOutput>;

    async fn on_cleanup(&self, _context: &AgentContext) -> AgentResult<()> {
        Ok(())
    }
}

struct SchemaValidators {
    input: Validator,
    output: Validator,
}

fn compile_schema(agent_id: &str, which: &str, schema: &Value) -> AgentResult<Validator> {
    jsonschema::validator_for(schema).map_err(|e| {
        AgentError::validation(format!("Invalid {which} schema: {e}")).with_agent(agent_id)
    })
}

fn schema_violations(validator: &Validator, instance: &Value) -> Vec<String> {
    match validator.validate(instance) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|e| format!("At '{}': {}", e.instance_path, e))
            .collect(),
    }
}

/// Lifecycle and execution envelope around an [`Agent`]
pub struct ManagedAgent {
    agent: Arc<dyn Agent>,
    metadata: AgentMetadata,
    settings: AgentSettings,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    validators: OnceCell<SchemaValidators>,
}

impl std::fmt::Debug for ManagedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedAgent")
            .field("metadata", &self.metadata)
            .field("settings", &self.settings)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl ManagedAgent {
    pub fn new(agent: Arc<dyn Agent>, settings: AgentSettings) -> Self {
        let metadata = agent.metadata();
        Self {
            agent,
            metadata,
            settings,
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            validators: OnceCell::new(),
        }
    }

    /// Wrap an agent with default settings
    pub fn with_defaults<A: Agent + 'static>(agent: A) -> Self {
        Self::new(Arc::new(agent), AgentSettings::default())
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn metadata(&self) -> &AgentMetadata {
        &self.metadata
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn input_schema(&self) -> Value {
        self.agent.input_schema()
    }

    pub fn output_schema(&self) -> Value {
        self.agent.output_schema()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Check the agent's own configuration, collecting every violation
    pub fn validate_settings(&self) -> AgentResult<()> {
        let mut violations = Vec::new();
        if self.settings.timeout.is_zero() {
            violations.push("timeout must be greater than 0".to_string());
        }
        if self.metadata.id.trim().is_empty() {
            violations.push("agent id must not be empty".to_string());
        }
        for capability in &self.metadata.capabilities {
            if capability.priority > 100 {
                violations.push(format!(
                    "capability '{}' priority {} outside [0, 100]",
                    capability.name, capability.priority
                ));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(AgentError::validation_violations(
                &format!("Agent {} configuration", self.metadata.id),
                violations,
            )
            .with_agent(self.id()))
        }
    }

    /// Validate configuration and run the agent's setup hook
    ///
    /// A second call after a successful initialization is a no-op.
    pub async fn initialize(&self, context: &AgentContext) -> AgentResult<()> {
        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        self.validate_settings()?;
        if self.validators.get().is_none() {
            let validators = SchemaValidators {
                input: compile_schema(self.id(), "input", &self.agent.input_schema())?,
                output: compile_schema(self.id(), "output", &self.agent.output_schema())?,
            };
            let _ = self.validators.set(validators);
        }

        let scoped = context.clone().for_agent(self.id());
        self.run_hook("on_initialize", self.agent.on_initialize(&scoped))
            .await
            .map_err(|e| self.stamp_error(e, context))?;

        self.initialized.store(true, Ordering::SeqCst);
        info!(agent_id = %self.id(), version = %self.metadata.version, "Agent initialized");
        Ok(())
    }

    /// Process with the agent's configured timeout
    pub async fn process(
        &self,
        context: &AgentContext,
        input: AgentInput,
    ) -> AgentResult<AgentOutput> {
        self.process_with_timeout(context, input, None).await
    }

    /// Run the agent's domain logic inside the execution envelope
    ///
    /// The logic runs on its own task. When the deadline passes the envelope
    /// stops waiting and reports a timeout; the task itself is not aborted.
    pub async fn process_with_timeout(
        &self,
        context: &AgentContext,
        input: AgentInput,
        timeout_override: Option<Duration>,
    ) -> AgentResult<AgentOutput> {
        let span = crate::agent_span!(
            agent_id = %self.id(),
            pipeline_id = %context.pipeline_id()
        );
        self.process_inner(context, input, timeout_override)
            .instrument(span)
            .await
    }

    async fn process_inner(
        &self,
        context: &AgentContext,
        input: AgentInput,
        timeout_override: Option<Duration>,
    ) -> AgentResult<AgentOutput> {
        if !self.is_initialized() {
            return Err(self.stamp_error(
                AgentError::validation(format!("Agent {} is not initialized", self.id())),
                context,
            ));
        }
        let validators = self.validators.get().ok_or_else(|| {
            self.stamp_error(
                AgentError::validation(format!("Agent {} has no compiled schemas", self.id())),
                context,
            )
        })?;

        self.validate_input(validators, &input)
            .map_err(|e| self.stamp_error(e, context))?;

        let timeout = timeout_override.unwrap_or(self.settings.timeout);
        let scoped = context
            .clone()
            .for_agent(self.id())
            .with_retry_policy(self.settings.retry_policy());
        let agent = Arc::clone(&self.agent);
        let started = Instant::now();

        debug!(timeout_ms = timeout.as_millis() as u64, "Dispatching agent");
        let handle = tokio::spawn(async move { agent.execute(&scoped, input).await });

        let outcome = match tokio::time::timeout(timeout, handle).await {
            Err(_) => {
                metrics().record_agent_timeout();
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Agent exceeded its deadline"
                );
                return Err(self.stamp_error(
                    AgentError::timeout(format!(
                        "Agent {} timed out after {}ms",
                        self.id(),
                        timeout.as_millis()
                    ))
                    .critical(false)
                    .retryable(true),
                    context,
                ));
            }
            Ok(Err(join_error)) => {
                error!(error = %join_error, "Agent task aborted");
                Err(AgentError::agent_failure(format!(
                    "Agent {} panicked: {join_error}",
                    self.id()
                ))
                .with_cause(join_error))
            }
            Ok(Ok(result)) => result,
        };

        let elapsed = started.elapsed();
        match outcome.and_then(|output| self.validate_output(validators, output)) {
            Ok(mut output) => {
                output
                    .metadata
                    .insert("agent_id".to_string(), json!(self.id()));
                output.metadata.insert(
                    "processing_time_ms".to_string(),
                    json!(elapsed.as_millis() as u64),
                );
                output
                    .metadata
                    .insert("agent_version".to_string(), json!(self.metadata.version));
                for e in &mut output.errors {
                    if e.agent_id.is_none() {
                        e.agent_id = Some(self.id().to_string());
                    }
                }
                metrics().record_agent_execution(output.success, elapsed);
                debug!(
                    success = output.success,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Agent finished"
                );
                Ok(output)
            }
            Err(e) => {
                metrics().record_agent_execution(false, elapsed);
                Err(self.stamp_error(e, context))
            }
        }
    }

    fn validate_input(&self, validators: &SchemaValidators, input: &AgentInput) -> AgentResult<()> {
        let mut violations = Vec::new();
        if input.data.is_null() {
            violations.push("data must not be null".to_string());
        }
        match serde_json::to_value(input) {
            Ok(instance) => violations.extend(schema_violations(&validators.input, &instance)),
            Err(e) => violations.push(format!("input is not serializable: {e}")),
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(AgentError::validation_violations("Agent input", violations))
        }
    }

    fn validate_output(
        &self,
        validators: &SchemaValidators,
        output: AgentOutput,
    ) -> AgentResult<AgentOutput> {
        let mut violations = Vec::new();
        if !output.success && output.errors.is_empty() {
            violations.push("failed result must carry error details".to_string());
        }
        match serde_json::to_value(&output) {
            Ok(instance) => violations.extend(schema_violations(&validators.output, &instance)),
            Err(e) => violations.push(format!("output is not serializable: {e}")),
        }

        if violations.is_empty() {
            Ok(output)
        } else {
            Err(AgentError::validation_violations("Agent output", violations))
        }
    }

    fn stamp_error(&self, mut error: AgentError, context: &AgentContext) -> AgentError {
        if error.agent_id.is_none() {
            error.agent_id = Some(self.id().to_string());
        }
        if error.pipeline_id.is_none() {
            error.pipeline_id = Some(context.pipeline_id().to_string());
        }
        error
    }

    /// Best-effort teardown; failures are logged and the agent is marked
    /// uninitialized regardless
    pub async fn cleanup(&self, context: &AgentContext) {
        let _guard = self.init_lock.lock().await;
        let scoped = context.clone().for_agent(self.id());
        if let Err(e) = self.run_hook("on_cleanup", self.agent.on_cleanup(&scoped)).await {
            warn!(agent_id = %self.id(), error = %e, "Agent cleanup failed");
        }
        self.initialized.store(false, Ordering::SeqCst);
        debug!(agent_id = %self.id(), "Agent cleaned up");
    }

    /// Await a lifecycle hook, reporting a panic as `agent_failure`
    async fn run_hook<F>(&self, hook: &str, future: F) -> AgentResult<()>
    where
        F: Future<Output = AgentResult<()>>,
    {
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let reason = panic_reason(payload.as_ref());
                error!(agent_id = %self.id(), hook, reason = %reason, "Agent hook panicked");
                Err(AgentError::agent_failure(format!(
                    "Agent {} panicked in {hook}: {reason}",
                    self.id()
                )))
            }
        }
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextManager, ContextMetadata};
    use crate::error::ErrorKind;

    struct Upper;

    #[async_trait]
    impl Agent for Upper {
        fn metadata(&self) -> AgentMetadata {
            AgentMetadata::new("upper", "1.2.0").with_capability(Capability::new("text", 80))
        }

        fn input_schema(&self) -> Value {
            json!({
                "type": "object",
                "required": ["data"],
                "properties": {
                    "data": {
                        "type": "object",
                        "required": ["text"],
                        "properties": {"text": {"type": "string"}}
                    }
                }
            })
        }

        async fn execute(
            &self,
            _context: &AgentContext,
            input: AgentInput,
        ) -> AgentResult<AgentOutput> {
            let text = input.data["text"].as_str().unwrap_or_default();
            Ok(AgentOutput::success(json!(text.to_uppercase())))
        }
    }

    struct BadPriority;

    #[async_trait]
    impl Agent for BadPriority {
        fn metadata(&self) -> AgentMetadata {
            AgentMetadata::new("bad", "0.1.0")
                .with_capability(Capability::new("a", 101))
                .with_capability(Capability::new("b", 200))
        }

        async fn execute(&self, _: &AgentContext, _: AgentInput) -> AgentResult<AgentOutput> {
            Ok(AgentOutput::success(json!(null)))
        }
    }

    struct SilentFailure;

    #[async_trait]
    impl Agent for SilentFailure {
        fn metadata(&self) -> AgentMetadata {
            AgentMetadata::new("silent", "0.1.0")
        }

        async fn execute(&self, _: &AgentContext, _: AgentInput) -> AgentResult<AgentOutput> {
            Ok(AgentOutput::failure(json!({}), Vec::new()))
        }
    }

    struct PanicOnInit;

    #[async_trait]
    impl Agent for PanicOnInit {
        fn metadata(&self) -> AgentMetadata {
            AgentMetadata::new("fragile", "0.1.0")
        }

        async fn on_initialize(&self, _: &AgentContext) -> AgentResult<()> {
            panic!("setup exploded");
        }

        async fn execute(&self, _: &AgentContext, _: AgentInput) -> AgentResult<AgentOutput> {
            Ok(AgentOutput::success(json!(null)))
        }
    }

    struct CleanupFault {
        panics: bool,
    }

    #[async_trait]
    impl Agent for CleanupFault {
        fn metadata(&self) -> AgentMetadata {
            AgentMetadata::new("leaky", "0.1.0")
        }

        async fn execute(&self, _: &AgentContext, _: AgentInput) -> AgentResult<AgentOutput> {
            Ok(AgentOutput::success(json!(null)))
        }

        async fn on_cleanup(&self, _: &AgentContext) -> AgentResult<()> {
            if self.panics {
                panic!("teardown exploded");
            }
            Err(AgentError::agent_failure("socket already closed"))
        }
    }

    async fn context() -> AgentContext {
        let manager = ContextManager::default();
        let context = manager
            .create_context("pipeline", ContextMetadata::default())
            .await;
        manager.agent_context(&context.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_process_requires_initialization() {
        let agent = ManagedAgent::with_defaults(Upper);
        let ctx = context().await;

        let err = agent
            .process(&ctx, AgentInput::new(json!({"text": "hi"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
        assert_eq!(err.agent_id.as_deref(), Some("upper"));
    }

    #[tokio::test]
    async fn test_process_stamps_metadata() {
        let agent = ManagedAgent::with_defaults(Upper);
        let ctx = context().await;
        agent.initialize(&ctx).await.unwrap();

        let output = agent
            .process(&ctx, AgentInput::new(json!({"text": "hi"})))
            .await
            .unwrap();
        assert_eq!(output.data, json!("HI"));
        assert_eq!(output.metadata["agent_id"], json!("upper"));
        assert_eq!(output.metadata["agent_version"], json!("1.2.0"));
        assert!(output.metadata.contains_key("processing_time_ms"));
    }

    #[tokio::test]
    async fn test_input_violations_are_all_reported() {
        let agent = ManagedAgent::with_defaults(Upper);
        let ctx = context().await;
        agent.initialize(&ctx).await.unwrap();

        let err = agent
            .process(&ctx, AgentInput::new(Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
        let violations = err.metadata["violations"].as_array().unwrap();
        assert!(violations.len() >= 2, "null data and schema type mismatch");
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let agent = ManagedAgent::with_defaults(Upper);
        let ctx = context().await;
        agent.initialize(&ctx).await.unwrap();
        agent.initialize(&ctx).await.unwrap();
        assert!(agent.is_initialized());
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected() {
        let agent = ManagedAgent::with_defaults(BadPriority);
        let ctx = context().await;
        let err = agent.initialize(&ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
        assert_eq!(err.metadata["violations"].as_array().unwrap().len(), 2);
        assert!(!agent.is_initialized());

        let zero_timeout = ManagedAgent::new(
            Arc::new(Upper),
            AgentSettings::default().with_timeout(Duration::ZERO),
        );
        assert!(zero_timeout.initialize(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_result_needs_errors() {
        let agent = ManagedAgent::with_defaults(SilentFailure);
        let ctx = context().await;
        agent.initialize(&ctx).await.unwrap();

        let err = agent
            .process(&ctx, AgentInput::new(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_cleanup_marks_uninitialized() {
        let agent = ManagedAgent::with_defaults(Upper);
        let ctx = context().await;
        agent.initialize(&ctx).await.unwrap();
        agent.cleanup(&ctx).await;
        assert!(!agent.is_initialized());
    }

    #[tokio::test]
    async fn test_initialize_panic_becomes_agent_failure() {
        let agent = ManagedAgent::with_defaults(PanicOnInit);
        let ctx = context().await;

        let err = agent.initialize(&ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AgentFailure);
        assert!(err.message.contains("setup exploded"));
        assert_eq!(err.agent_id.as_deref(), Some("fragile"));
        assert!(!agent.is_initialized());
    }

    #[tokio::test]
    async fn test_failing_cleanup_still_uninitializes() {
        let ctx = context().await;
        for panics in [false, true] {
            let agent = ManagedAgent::with_defaults(CleanupFault { panics });
            agent.initialize(&ctx).await.unwrap();
            agent.cleanup(&ctx).await;
            assert!(!agent.is_initialized(), "panics = {panics}");
        }
    }

    #[test]
    fn test_default_input_schema_requires_data() {
        let schema = default_input_schema();
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&json!("data")));
    }
}

//! Mock agents and message handlers
//!
//! `MockAgent` stands in for domain logic with configurable outcome and
//! delay, and records when each execution started and finished so tests can
//! check scheduling order.

use crate::agent::contract::{
    Agent, AgentInput, AgentMetadata, AgentOutput, AgentSettings, Capability, ManagedAgent,
};
use crate::bus::{AgentMessage, MessageBus, MessageHandler, MessageType};
use crate::context::AgentContext;
use crate::error::{AgentError, AgentResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// What a [`MockAgent`] does when executed
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Return a successful result with this data; `None` echoes the input
    Succeed(Option<Value>),
    /// Return the error
    Fail(AgentError),
    /// Return a handled failure result carrying the error
    FailResult(AgentError),
    /// Panic inside the agent
    Panic,
}

/// Start and finish of one mock execution
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub agent_id: String,
    pub started: Instant,
    pub finished: Instant,
}

/// Execution records shared across mocks
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    records: Arc<std::sync::Mutex<Vec<ExecutionRecord>>>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: ExecutionRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }

    /// Records in completion order
    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.agent_id).collect()
    }

    pub fn record_for(&self, agent_id: &str) -> Option<ExecutionRecord> {
        self.records().into_iter().find(|r| r.agent_id == agent_id)
    }
}

/// Configurable stand-in agent
#[derive(Debug, Clone)]
pub struct MockAgent {
    metadata: AgentMetadata,
    behavior: MockBehavior,
    delay: Duration,
    context_write: Option<(String, Value)>,
    log: ExecutionLog,
    invocations: Arc<AtomicUsize>,
}

impl MockAgent {
    fn with_behavior(id: &str, behavior: MockBehavior) -> Self {
        Self {
            metadata: AgentMetadata::new(id, "1.0.0")
                .with_description(format!("Mock agent {id}")),
            behavior,
            delay: Duration::ZERO,
            context_write: None,
            log: ExecutionLog::new(),
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Succeeds, echoing its input data
    pub fn succeeding(id: &str) -> Self {
        Self::with_behavior(id, MockBehavior::Succeed(None))
    }

    /// Fails with an `agent_failure` error, critical if requested
    pub fn failing(id: &str, critical: bool) -> Self {
        let error = AgentError::agent_failure(format!("{id} failed")).critical(critical);
        Self::with_behavior(id, MockBehavior::Fail(error))
    }

    pub fn failing_with(id: &str, error: AgentError) -> Self {
        Self::with_behavior(id, MockBehavior::Fail(error))
    }

    /// Returns `success: false` instead of an error
    pub fn reporting_failure(id: &str) -> Self {
        let error = AgentError::agent_failure(format!("{id} could not finish"));
        Self::with_behavior(id, MockBehavior::FailResult(error))
    }

    pub fn panicking(id: &str) -> Self {
        Self::with_behavior(id, MockBehavior::Panic)
    }

    pub fn with_output(mut self, data: Value) -> Self {
        self.behavior = MockBehavior::Succeed(Some(data));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_capability(mut self, name: &str, priority: u32) -> Self {
        self.metadata = self.metadata.with_capability(Capability::new(name, priority));
        self
    }

    /// Write `key = value` into the run context during execution
    pub fn with_context_write(mut self, key: &str, value: Value) -> Self {
        self.context_write = Some((key.to_string(), value));
        self
    }

    pub fn with_log(mut self, log: ExecutionLog) -> Self {
        self.log = log;
        self
    }

    pub fn log(&self) -> ExecutionLog {
        self.log.clone()
    }

    /// Shared counter of `execute` calls
    pub fn invocation_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.invocations)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn into_managed(self) -> Arc<ManagedAgent> {
        self.into_managed_with(AgentSettings::default())
    }

    pub fn into_managed_with(self, settings: AgentSettings) -> Arc<ManagedAgent> {
        Arc::new(ManagedAgent::new(Arc::new(self), settings))
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn metadata(&self) -> AgentMetadata {
        self.metadata.clone()
    }

    async fn execute(&self, context: &AgentContext, input: AgentInput) -> AgentResult<AgentOutput> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some((key, value)) = &self.context_write {
            context.set(key, value.clone()).await?;
        }

        let outcome = match &self.behavior {
            MockBehavior::Succeed(Some(data)) => Ok(AgentOutput::success(data.clone())),
            MockBehavior::Succeed(None) => Ok(AgentOutput::success(input.data)),
            MockBehavior::Fail(error) => Err(error.clone()),
            MockBehavior::FailResult(error) => {
                Ok(AgentOutput::failure(json!(null), vec![error.clone()]))
            }
            MockBehavior::Panic => panic!("mock agent {} panicked", self.metadata.id),
        };

        self.log.push(ExecutionRecord {
            agent_id: self.metadata.id.clone(),
            started,
            finished: Instant::now(),
        });
        outcome
    }
}

/// Handler that stores every message it receives
#[derive(Debug, Default)]
pub struct RecordingHandler {
    received: Mutex<Vec<AgentMessage>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<AgentMessage> {
        self.received.lock().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.received.lock().await.len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: AgentMessage) -> AgentResult<()> {
        self.received.lock().await.push(message);
        Ok(())
    }
}

/// Handler that always fails with the configured text
#[derive(Debug)]
pub struct FailingHandler {
    message: String,
}

impl FailingHandler {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(&self, _message: AgentMessage) -> AgentResult<()> {
        Err(AgentError::agent_failure(self.message.clone()))
    }
}

/// Handler that answers requests by echoing their data back
#[derive(Debug)]
pub struct EchoResponder {
    bus: MessageBus,
    agent_id: String,
    delay: Duration,
}

impl EchoResponder {
    pub fn new(bus: MessageBus, agent_id: &str) -> Self {
        Self {
            bus,
            agent_id: agent_id.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl MessageHandler for EchoResponder {
    async fn handle(&self, message: AgentMessage) -> AgentResult<()> {
        if message.message_type != MessageType::Request {
            return Ok(());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let reply = message.reply(self.agent_id.as_str(), message.payload.data.clone());
        self.bus.publish(reply).await
    }
}

//! Declarative pipeline configuration and run records

use crate::agent::contract::AgentOutput;
use crate::config::ConfigError;
use crate::context::AgentContext;
use crate::error::AgentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Scheduling strategy for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
    /// Stages derived from connections; agents within a stage run concurrently
    Hybrid,
}

/// One agent's slot in a pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    /// Per-agent configuration exposed through the agent's context view
    #[serde(default)]
    pub config: HashMap<String, Value>,
    /// Overrides the agent's own timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Overrides the agent's own retry count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl AgentDefinition {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_config<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }
}

/// Directed edge `from -> to`
///
/// Hybrid mode orders stages by these edges. The predicates are carried for
/// conditional routing and do not affect scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConnection {
    pub from: String,
    pub to: String,
    #[serde(default = "default_true")]
    pub on_success: bool,
    #[serde(default)]
    pub on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl AgentConnection {
    pub fn new<S: Into<String>>(from: S, to: S) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            on_success: true,
            on_error: false,
            condition: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineTimeouts {
    /// Deadline for the whole run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_ms: Option<u64>,
    /// Agent timeout for definitions without their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRetries {
    /// Retry count for definitions without their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Runs with more agents fail with `resource_exhausted` before starting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_agents: Option<usize>,
    /// Bound on concurrently executing agents in parallel and hybrid modes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// Publish lifecycle events to orchestrator subscribers
    #[serde(default)]
    pub emit_events: bool,
}

/// Immutable run definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub connections: Vec<AgentConnection>,
    #[serde(default)]
    pub timeouts: PipelineTimeouts,
    #[serde(default)]
    pub retries: PipelineRetries,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub notifications: NotificationSettings,
}

impl PipelineConfig {
    pub fn new<S: Into<String>>(id: S, mode: ExecutionMode) -> Self {
        Self {
            id: id.into(),
            mode,
            ..Self::default()
        }
    }

    pub fn with_agent(mut self, agent: AgentDefinition) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_agents<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agents.extend(ids.into_iter().map(AgentDefinition::new));
        self
    }

    pub fn with_connection(mut self, connection: AgentConnection) -> Self {
        self.connections.push(connection);
        self
    }

    pub fn with_events(mut self) -> Self {
        self.notifications.emit_events = true;
        self
    }

    /// Load a pipeline definition from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse a pipeline definition; structural validation happens when the
    /// pipeline is created
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Every structural problem with this configuration
    pub fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.id.trim().is_empty() {
            violations.push("id is required".to_string());
        }
        if self.agents.is_empty() {
            violations.push("at least one agent definition is required".to_string());
        }

        let mut seen = HashSet::new();
        for (index, agent) in self.agents.iter().enumerate() {
            if agent.id.trim().is_empty() {
                violations.push(format!("agents[{index}] is missing an id"));
            } else if !seen.insert(agent.id.as_str()) {
                violations.push(format!("agents[{index}] duplicates agent id '{}'", agent.id));
            }
            if agent.timeout_ms == Some(0) {
                violations.push(format!("agents[{index}] timeout_ms must be greater than 0"));
            }
        }

        for (index, connection) in self.connections.iter().enumerate() {
            if connection.from.trim().is_empty() {
                violations.push(format!("connections[{index}] is missing 'from'"));
            }
            if connection.to.trim().is_empty() {
                violations.push(format!("connections[{index}] is missing 'to'"));
            }
        }

        if self.timeouts.pipeline_ms == Some(0) {
            violations.push("timeouts.pipeline_ms must be greater than 0".to_string());
        }
        if self.timeouts.agent_ms == Some(0) {
            violations.push("timeouts.agent_ms must be greater than 0".to_string());
        }
        if self.resource_limits.max_concurrency == Some(0) {
            violations.push("resource_limits.max_concurrency must be greater than 0".to_string());
        }
        violations
    }

    pub fn agent_timeout(&self, definition: &AgentDefinition) -> Option<Duration> {
        definition
            .timeout_ms
            .or(self.timeouts.agent_ms)
            .map(Duration::from_millis)
    }

    pub fn agent_retries(&self, definition: &AgentDefinition) -> Option<u32> {
        definition.retries.or(self.retries.max_retries)
    }
}

/// Run state machine:
/// `pending -> running -> {paused <-> running} -> {completed | failed | cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Completed | PipelineState::Failed | PipelineState::Cancelled
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineState::Pending => "pending",
            PipelineState::Running => "running",
            PipelineState::Paused => "paused",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
            PipelineState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Live or synthesized status of a run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub pipeline_id: String,
    pub state: PipelineState,
    /// 0-100
    pub progress: u8,
    pub completed_agents: usize,
    pub total_agents: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_agent: Option<String>,
    pub errors: Vec<AgentError>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineStatus {
    pub fn pending(pipeline_id: &str, total_agents: usize) -> Self {
        let now = Utc::now();
        Self {
            pipeline_id: pipeline_id.to_string(),
            state: PipelineState::Pending,
            progress: 0,
            completed_agents: 0,
            total_agents,
            current_agent: None,
            errors: Vec::new(),
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Count one more settled agent and recompute progress
    pub fn agent_settled(&mut self) {
        self.completed_agents = (self.completed_agents + 1).min(self.total_agents);
        self.progress = progress_percent(self.completed_agents, self.total_agents);
        self.updated_at = Utc::now();
    }
}

pub(crate) fn progress_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

/// A created run, ready to execute
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Equal to the configuration id
    pub id: String,
    /// Distinguishes this run from earlier runs of the same configuration
    pub run_id: String,
    pub config: PipelineConfig,
    pub context: AgentContext,
}

/// Outcome of one agent within a run
#[derive(Debug, Clone, Serialize)]
pub struct AgentRun {
    pub agent_id: String,
    pub output: AgentOutput,
}

/// Aggregated outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub pipeline_id: String,
    pub success: bool,
    /// Sequential: data of the last successful agent.
    /// Parallel and hybrid: object keyed by agent id.
    pub result: Value,
    #[serde(with = "crate::agent::retry::duration_millis")]
    pub execution_time: Duration,
    pub errors: Vec<AgentError>,
    pub agent_results: Vec<AgentRun>,
}

impl PipelineResult {
    pub fn agent_result(&self, agent_id: &str) -> Option<&AgentOutput> {
        self.agent_results
            .iter()
            .find(|r| r.agent_id == agent_id)
            .map(|r| &r.output)
    }
}

/// Terminal snapshot of a run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineHistoryEntry {
    pub pipeline_id: String,
    pub run_id: String,
    pub mode: ExecutionMode,
    pub state: PipelineState,
    pub success: bool,
    pub progress: u8,
    pub completed_agents: usize,
    pub total_agents: usize,
    pub errors: Vec<AgentError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

impl PipelineHistoryEntry {
    /// Status view of this record
    pub fn to_status(&self) -> PipelineStatus {
        PipelineStatus {
            pipeline_id: self.pipeline_id.clone(),
            state: self.state,
            progress: self.progress,
            completed_agents: self.completed_agents,
            total_agents: self.total_agents,
            current_agent: None,
            errors: self.errors.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            updated_at: self.finished_at,
            finished_at: Some(self.finished_at),
        }
    }
}

/// Filter and page over run history
///
/// Date bounds apply to the run's creation time and are inclusive.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub state: Option<PipelineState>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn with_state(mut self, state: PipelineState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &PipelineHistoryEntry) -> bool {
        self.from.map_or(true, |from| entry.created_at >= from)
            && self.to.map_or(true, |to| entry.created_at <= to)
            && self.state.map_or(true, |state| entry.state == state)
    }
}

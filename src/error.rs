//! Typed failure taxonomy for the orchestration core
//!
//! Every component boundary (agent execution, context operations, message
//! delivery, pipeline orchestration) reports failures as an [`AgentError`]
//! tagged with an [`ErrorKind`]. Untyped errors are wrapped with
//! [`AgentError::wrap`] before they cross a boundary.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Maximum length of error text that leaves the process boundary
const MAX_ERROR_MESSAGE_LEN: usize = 500;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

/// Failure classification shared by every component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Agent's own logic failed or panicked
    AgentFailure,
    /// Context missing, expired, or unreadable
    ContextCorruption,
    /// Message delivery or routing failure
    CommunicationException,
    /// An operation exceeded its deadline
    TimeoutExceeded,
    /// Declared resource limit breached
    ResourceExhausted,
    /// Input, output, or config failed schema checks
    ValidationError,
}

impl ErrorKind {
    /// Whether sequential execution stops on this kind by default
    pub fn default_critical(self) -> bool {
        matches!(
            self,
            ErrorKind::ContextCorruption | ErrorKind::ResourceExhausted
        )
    }

    /// Whether an operation failing with this kind may be retried by default
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::AgentFailure | ErrorKind::CommunicationException | ErrorKind::TimeoutExceeded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AgentFailure => "agent_failure",
            ErrorKind::ContextCorruption => "context_corruption",
            ErrorKind::CommunicationException => "communication_exception",
            ErrorKind::TimeoutExceeded => "timeout_exceeded",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::ValidationError => "validation_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Typed error carried across every component boundary
///
/// Cloning is cheap: the optional cause is reference counted, so the same
/// error can be reported in a `PipelineResult` and in a `PipelineError`.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct AgentError {
    pub kind: ErrorKind,
    pub message: String,
    pub critical: bool,
    pub retryable: bool,
    pub agent_id: Option<String>,
    pub pipeline_id: Option<String>,
    pub metadata: HashMap<String, Value>,
    #[source]
    cause: Option<Cause>,
}

impl AgentError {
    /// Create an error of the given kind with the kind's default flags
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            critical: kind.default_critical(),
            retryable: kind.default_retryable(),
            agent_id: None,
            pipeline_id: None,
            metadata: HashMap::new(),
            cause: None,
        }
    }

    pub fn agent_failure<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::AgentFailure, message)
    }

    pub fn context_corruption<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::ContextCorruption, message)
    }

    /// Context lookup failure (missing or expired)
    pub fn context_not_found(context_id: &str) -> Self {
        Self::new(
            ErrorKind::ContextCorruption,
            format!("Context not found or expired: {context_id}"),
        )
        .with_metadata("context_id", Value::String(context_id.to_string()))
    }

    pub fn communication<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::CommunicationException, message)
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::TimeoutExceeded, message)
    }

    pub fn resource_exhausted<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    /// Validation error listing every violation found
    pub fn validation_violations(subject: &str, violations: Vec<String>) -> Self {
        let message = format!("{subject} failed validation: {}", violations.join("; "));
        Self::new(ErrorKind::ValidationError, message).with_metadata(
            "violations",
            Value::Array(violations.into_iter().map(Value::String).collect()),
        )
    }

    /// Wrap an untyped error as `agent_failure`, keeping the original as cause
    pub fn wrap<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::agent_failure(error.to_string()).with_cause(error)
    }

    pub fn with_agent<S: Into<String>>(mut self, agent_id: S) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_pipeline<S: Into<String>>(mut self, pipeline_id: S) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self
    }

    pub fn with_metadata<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Override the kind's default criticality
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Override the kind's default retryability
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Plain record form used for history and transport
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord {
            kind: self.kind,
            message: self.message.clone(),
            critical: self.critical,
            retryable: self.retryable,
            agent_id: self.agent_id.clone(),
            pipeline_id: self.pipeline_id.clone(),
            metadata: self.metadata.clone(),
            cause: self.cause.as_ref().map(|c| c.to_string()),
        }
    }

    /// Message text safe to place in a bus message or event
    pub fn sanitized_message(&self) -> String {
        sanitize_error_message(&self.message)
    }
}

impl Serialize for AgentError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_record().serialize(serializer)
    }
}

/// Serializable snapshot of an [`AgentError`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub critical: bool,
    pub retryable: bool,
    pub agent_id: Option<String>,
    pub pipeline_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub cause: Option<String>,
}

/// Errors surfaced by the pipeline orchestrator
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Invalid pipeline configuration: {}", violations.join("; "))]
    InvalidConfig { violations: Vec<String> },

    #[error("Pipeline {pipeline_id} failed with {} error(s)", errors.len())]
    Execution {
        pipeline_id: String,
        errors: Vec<AgentError>,
    },

    #[error("Pipeline not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl PipelineError {
    /// Errors carried by this failure, in reporting order
    pub fn errors(&self) -> Vec<AgentError> {
        match self {
            PipelineError::Execution { errors, .. } => errors.clone(),
            PipelineError::Agent(e) => vec![e.clone()],
            PipelineError::InvalidConfig { violations } => {
                vec![AgentError::validation_violations(
                    "Pipeline configuration",
                    violations.clone(),
                )]
            }
            PipelineError::NotFound(id) => vec![AgentError::validation(format!(
                "Pipeline not found: {id}"
            ))],
        }
    }
}

/// Redact secrets and sensitive paths, and cap length at 500 characters
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN.replace_all(message, "${1}=***").to_string();
    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for core operations
pub type AgentResult<T> = Result<T, AgentError>;

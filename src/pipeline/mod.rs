//! Pipeline definitions, scheduling, and run tracking
//!
//! A [`PipelineConfig`] declares agents and how to schedule them; the
//! [`PipelineOrchestrator`] turns it into a run with its own context and
//! drives it to a terminal state.

pub mod events;
pub mod orchestrator;
pub mod planner;
pub mod types;

pub use events::{EventEmitter, PipelineEvent};
pub use orchestrator::{result_key, PipelineOrchestrator, INPUT_KEY};
pub use planner::plan_stages;
pub use types::{
    AgentConnection, AgentDefinition, AgentRun, ExecutionMode, HistoryQuery, NotificationSettings,
    Pipeline, PipelineConfig, PipelineHistoryEntry, PipelineResult, PipelineRetries,
    PipelineState, PipelineStatus, PipelineTimeouts, ResourceLimits,
};

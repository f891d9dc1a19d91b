//! Pipeline lifecycle events
//!
//! Emitted over a broadcast channel when a pipeline opts in through
//! `notifications.emit_events`. Slow subscribers lag rather than block runs.

use super::types::PipelineState;
use crate::error::ErrorRecord;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Started {
        pipeline_id: String,
        total_agents: usize,
    },
    Progress {
        pipeline_id: String,
        progress: u8,
        completed_agents: usize,
    },
    AgentCompleted {
        pipeline_id: String,
        agent_id: String,
        success: bool,
    },
    Completed {
        pipeline_id: String,
        success: bool,
        execution_time_ms: u64,
    },
    Failed {
        pipeline_id: String,
        errors: Vec<ErrorRecord>,
    },
    Cancelled {
        pipeline_id: String,
        state_before: PipelineState,
    },
}

impl PipelineEvent {
    pub fn pipeline_id(&self) -> &str {
        match self {
            PipelineEvent::Started { pipeline_id, .. }
            | PipelineEvent::Progress { pipeline_id, .. }
            | PipelineEvent::AgentCompleted { pipeline_id, .. }
            | PipelineEvent::Completed { pipeline_id, .. }
            | PipelineEvent::Failed { pipeline_id, .. }
            | PipelineEvent::Cancelled { pipeline_id, .. } => pipeline_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::Started { .. } => "started",
            PipelineEvent::Progress { .. } => "progress",
            PipelineEvent::AgentCompleted { .. } => "agent_completed",
            PipelineEvent::Completed { .. } => "completed",
            PipelineEvent::Failed { .. } => "failed",
            PipelineEvent::Cancelled { .. } => "cancelled",
        }
    }
}

/// Sender side shared by an orchestrator and its clones
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Send if `enabled`; having no subscribers is not an error
    pub fn emit(&self, enabled: bool, event: PipelineEvent) {
        if enabled {
            let _ = self.sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_respects_toggle() {
        let emitter = EventEmitter::new(8);
        let mut rx = emitter.subscribe();

        emitter.emit(
            false,
            PipelineEvent::Started {
                pipeline_id: "hidden".to_string(),
                total_agents: 1,
            },
        );
        emitter.emit(
            true,
            PipelineEvent::Started {
                pipeline_id: "shown".to_string(),
                total_agents: 1,
            },
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.pipeline_id(), "shown");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_without_subscribers() {
        EventEmitter::new(1).emit(
            true,
            PipelineEvent::Progress {
                pipeline_id: "p".to_string(),
                progress: 50,
                completed_agents: 1,
            },
        );
    }

    #[test]
    fn test_event_wire_shape() {
        let event = PipelineEvent::AgentCompleted {
            pipeline_id: "p".to_string(),
            agent_id: "a".to_string(),
            success: true,
        };
        assert_eq!(event.name(), "agent_completed");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], json!("agent_completed"));
        assert_eq!(value["agent_id"], json!("a"));
    }
}

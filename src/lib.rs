//! Agent Conductor
//!
//! Orchestration core for multi-agent pipelines: a versioned context store,
//! an agent execution contract, an in-process message bus, and a pipeline
//! orchestrator with sequential, parallel, and staged scheduling.
//!
//! # Quick Start
//!
//! ```rust
//! use agent_conductor::pipeline::{ExecutionMode, PipelineConfig, PipelineOrchestrator};
//! use agent_conductor::testing::MockAgent;
//! use agent_conductor::{AgentRegistry, ContextManager};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let registry = AgentRegistry::new();
//! registry.register_agent(MockAgent::succeeding("summarize").into_managed());
//!
//! let orchestrator = PipelineOrchestrator::new(registry, ContextManager::default());
//! let config = PipelineConfig::new("demo", ExecutionMode::Sequential).with_agents(["summarize"]);
//! let pipeline = orchestrator.create_pipeline(config).await.unwrap();
//!
//! let result = orchestrator
//!     .execute_pipeline(&pipeline, json!({"text": "hello"}))
//!     .await
//!     .unwrap();
//! assert!(result.success);
//! # });
//! ```

pub mod agent;
pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod testing;

pub use agent::{Agent, AgentInput, AgentMetadata, AgentOutput, AgentRegistry, ManagedAgent};
pub use bus::{AgentMessage, MessageBus, MessageHandler, MessageType};
pub use config::ConductorConfig;
pub use context::{AgentContext, ContextManager};
pub use error::{AgentError, AgentResult, ErrorKind, PipelineError};
pub use pipeline::{PipelineConfig, PipelineOrchestrator, PipelineResult, PipelineState};

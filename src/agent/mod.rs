//! Agent contract, registry, and retry helper
//!
//! Concrete agents implement [`Agent`]; the orchestrator executes them through
//! the [`ManagedAgent`] envelope after resolving them from an [`AgentRegistry`].

pub mod contract;
pub mod registry;
pub mod retry;

pub use contract::{
    default_input_schema, default_output_schema, Agent, AgentInput, AgentMetadata, AgentOutput,
    AgentSettings, Capability, ManagedAgent,
};
pub use registry::AgentRegistry;
pub use retry::{retry_with_backoff, RetryPolicy};

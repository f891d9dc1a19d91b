//! Message bus between agents
//!
//! Messages are validated, recorded in a bounded history, and routed to
//! subscriber handlers. Circuit breakers and round-robin instance selection
//! live alongside the bus but never gate routing on their own.

pub mod circuit_breaker;
pub mod load_balancer;
pub mod message;
pub mod message_bus;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakers, CircuitState};
pub use load_balancer::LoadBalancer;
pub use message::{AgentMessage, MessageMetadata, MessagePayload, MessageType, Priority};
pub use message_bus::{BroadcastReport, BusStats, MessageBus, MessageHandler};

//! Testing utilities
//!
//! Mock agents and bus handlers for exercising the orchestrator without real
//! agent implementations.

pub mod mocks;

pub use mocks::*;

//! Shared, versioned run-scoped state
//!
//! The [`ContextManager`] owns every [`Context`]; agents see a context through
//! an [`AgentContext`] view.

pub mod manager;
pub mod types;
pub mod view;

pub use manager::{ContextManager, StorageReport};
pub use types::{
    Context, ContextEntry, ContextMetadata, DataSchema, SchemaType, StorageHint,
};
pub use view::AgentContext;

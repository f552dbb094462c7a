//! Boundary tool surface: catalog, registry, staged loading, gating.

pub mod definitions;
pub mod registry;

pub use definitions::{default_tools, LoadStage, ToolCategory, ToolDefinition, ToolMetadata};
pub use registry::ToolRegistry;

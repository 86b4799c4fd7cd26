pub mod registry;
pub mod schema;

pub use registry::{ToolDefinition, ToolRegistry};
pub use schema::{input_schema_for, validate_arguments};

mod compiler;
pub mod graph;
mod parser;
pub mod types;
pub mod validation;

pub use compiler::{CompileError, Position, compile_schema};
pub use graph::{Graph, schema_to_graph};
pub use validation::{
    BreakingChange, SchemaLimits, ValidationError, detect_breaking_changes, validate_schema_limits,
    validate_source_size,
};

pub mod attribute;
pub mod context;
pub mod engine;
pub mod error;
pub mod rule;
pub mod schema;
pub mod tuple;

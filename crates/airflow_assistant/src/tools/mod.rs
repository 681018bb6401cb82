mod schema_bridge;

pub use schema_bridge::{build_declarations, to_provider_tool, SchemaConversionError};

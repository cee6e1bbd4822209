mod parser;
mod resolver;
mod rewrite;
pub mod types;

pub use parser::{ParseError, parse, parse_schema};
pub use resolver::{
    Members, ReferenceKind, ReferenceSite, References, RelationOrPermission, ResolvedDefinition,
    ResolvedReference, Resolution, Resolver, SchemaNode, walk_schema,
};
pub use rewrite::{check_schema, generate, rewrite_schema};

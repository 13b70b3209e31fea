use thiserror::Error;

use crate::coordinates::SchemaKind;

/// Reasons a single input row cannot become a tile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error(
        "unable to detect the coordinate schema from the header; provide a schema hint"
    )]
    UndetectedSchema,

    #[error("header declares {found} but {expected} was requested")]
    SchemaMismatch {
        expected: SchemaKind,
        found: SchemaKind,
    },

    #[error("missing required field `{field}`")]
    MissingField { field: &'static str },

    #[error("field `{field}` is not a valid number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("field `{field}` = {value} is outside {expected}")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: String,
    },
}

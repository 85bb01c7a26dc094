//! Schema overrides for fields that carry arbitrary JSON.
//!
//! The API server prunes unknown fields unless the structural schema says otherwise,
//! so opaque values (module variables, backend settings, terraform outputs) are marked
//! with `x-kubernetes-preserve-unknown-fields`.

use schemars::{json_schema, Schema, SchemaGenerator};

/// An object whose keys are not known in advance
pub(crate) fn preserve_unknown_object(_generator: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

/// Any JSON value (string, number, list, map)
pub(crate) fn preserve_unknown_value(_generator: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "x-kubernetes-preserve-unknown-fields": true
    })
}

//! Record validation against raw stream schemas.

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::error::SchemaError;

/// Checks raw records against the stream's schema document.
pub trait RecordValidator: Send + Sync {
    /// Returns every validation message when `record` does not conform.
    fn validate(&self, record: &Value) -> Result<(), Vec<String>>;
}

/// [`RecordValidator`] backed by a compiled JSON Schema.
pub struct JsonSchemaValidator {
    compiled: JSONSchema,
}

impl JsonSchemaValidator {
    /// Compiles `schema` for repeated validation.
    pub fn compile(schema: &Value) -> Result<Self, SchemaError> {
        let compiled =
            JSONSchema::compile(schema).map_err(|e| SchemaError::Validator(e.to_string()))?;
        Ok(Self { compiled })
    }
}

impl std::fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSchemaValidator").finish_non_exhaustive()
    }
}

impl RecordValidator for JsonSchemaValidator {
    fn validate(&self, record: &Value) -> Result<(), Vec<String>> {
        self.compiled.validate(record).map_err(|errors| {
            errors
                .map(|e| {
                    let pointer = e.instance_path.to_string();
                    if pointer.is_empty() {
                        e.to_string()
                    } else {
                        format!("{pointer}: {e}")
                    }
                })
                .collect()
        })
    }
}

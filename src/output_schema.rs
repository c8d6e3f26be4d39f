//! Output schema validation (spec §6 external collaborator). Extraction and
//! coercion of a final answer against `outputJsonSchema` is JSON-schema
//! business logic the core does not implement; it depends on this trait
//! abstractly, the same way it depends on [`crate::prompt::PromptBuilder`].

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct OutputValidationFailure {
    pub message: String,
}

/// `parseAndValidateJson(text, schema, {strict?}) -> value | error` (spec §6).
pub trait OutputSchemaValidator: Send + Sync {
    fn parse_and_validate_json(&self, text: &str, schema: &Value, strict: bool) -> Result<Value, OutputValidationFailure>;
}

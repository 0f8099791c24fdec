//! Request parameters attached to a model or a call.
//!
//! Parameters arrive as an opaque JSON object. Only the keys that change how the engine talks to a provider are
//! interpreted here:
//!
//! - `response_format` - OpenAI style structured output (`{"type": "json_schema", "json_schema": {...}}`)
//! - `format` - Ollama native structured output (a JSON schema, or the string `"json"`)
//!
//! Everything else (`temperature`, `top_p`, `seed`, ...) is kept in [`ModelParameters::extra`] and forwarded to
//! the provider request body untouched.

use serde_json::{Map, Value};
use std::{fmt, sync::Arc};

use crate::error::{Error, Result};

/// The caller's schema for one structured response item.
///
/// The schema is compiled once, when the parameters are parsed; clones share the compiled validator.
#[derive(Clone)]
pub struct OutputSchema {
    pub name: String,
    pub schema: Value,
    pub strict: bool,
    validator: Arc<jsonschema::JSONSchema>,
}

impl OutputSchema {
    pub fn new(name: impl Into<String>, schema: Value, strict: bool) -> Result<Self> {
        let name = name.into();
        let validator = jsonschema::JSONSchema::compile(&schema)
            .map_err(|e| Error::invalid(format!("Invalid JSON schema '{name}': {e}")))?;
        Ok(Self {
            name,
            schema,
            strict,
            validator: Arc::new(validator),
        })
    }

    /// Validate one response item against the schema, collecting every violation.
    pub fn validate(&self, item: &Value) -> Result<()> {
        self.validator.validate(item).map_err(|errors| Error::SchemaValidation {
            errors: errors.map(|err| err.to_string()).collect(),
        })
    }
}

impl fmt::Debug for OutputSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSchema")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("strict", &self.strict)
            .finish()
    }
}

impl PartialEq for OutputSchema {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.schema == other.schema && self.strict == other.strict
    }
}

/// Interpreted `response_format` value.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFormat {
    Text,
    JsonSchema(OutputSchema),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelParameters {
    pub response_format: Option<ResponseFormat>,
    /// Ollama `format` value as supplied by the caller
    pub format: Option<Value>,
    /// `format` compiled, when it is a schema object
    format_schema: Option<OutputSchema>,
    pub extra: Map<String, Value>,
}

impl ModelParameters {
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(object) => object,
            other => {
                return Err(Error::invalid(format!(
                    "model_parameters must be a JSON object, got {}",
                    json_type_name(other)
                )));
            }
        };

        let mut parameters = Self::default();
        for (key, value) in object {
            match key.as_str() {
                "response_format" => parameters.response_format = Some(parse_response_format(value)?),
                "format" => {
                    match value {
                        Value::Object(_) => {
                            parameters.format_schema = Some(OutputSchema::new("format", value.clone(), true)?);
                        }
                        Value::String(s) if s == "json" => {}
                        other => {
                            return Err(Error::invalid(format!(
                                "format must be a JSON schema object or \"json\", got {other}"
                            )));
                        }
                    }
                    parameters.format = Some(value.clone());
                }
                _ => {
                    parameters.extra.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(parameters)
    }

    /// Parse a `model_parameters` option, which callers pass as a JSON string.
    pub fn from_json_str(raw: &str) -> Result<Value> {
        if raw.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_json::from_str(raw).map_err(|e| Error::invalid(format!("model_parameters is not valid JSON: {e}")))
    }

    /// Shallow-merge call parameters over model defaults and interpret the result.
    pub fn merged(defaults: &Value, overrides: &Value) -> Result<Self> {
        let mut merged = match defaults {
            Value::Object(object) => object.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(Error::invalid(format!(
                    "default parameters must be a JSON object, got {}",
                    json_type_name(other)
                )));
            }
        };
        match overrides {
            Value::Object(object) => {
                for (key, value) in object {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Value::Null => {}
            other => {
                return Err(Error::invalid(format!(
                    "model_parameters must be a JSON object, got {}",
                    json_type_name(other)
                )));
            }
        }
        Self::from_value(&Value::Object(merged))
    }

    /// The schema each response item must satisfy, if structured output was requested.
    ///
    /// `response_format` wins over `format` when both are present.
    pub fn output_schema(&self) -> Option<OutputSchema> {
        match &self.response_format {
            Some(ResponseFormat::JsonSchema(schema)) => Some(schema.clone()),
            _ => self.format_schema.clone(),
        }
    }
}

fn parse_response_format(value: &Value) -> Result<ResponseFormat> {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or("json_schema");
    match kind {
        "text" => Ok(ResponseFormat::Text),
        "json_schema" => {
            let json_schema = value
                .get("json_schema")
                .ok_or_else(|| Error::invalid("response_format of type json_schema requires a json_schema member"))?;
            let schema = json_schema
                .get("schema")
                .filter(|schema| schema.is_object())
                .ok_or_else(|| Error::invalid("response_format.json_schema.schema must be a JSON object"))?;
            let name = json_schema
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("response")
                .to_string();
            // Accept `strict` at either level.
            let strict = json_schema
                .get("strict")
                .or_else(|| value.get("strict"))
                .and_then(Value::as_bool)
                .unwrap_or(false);

            Ok(ResponseFormat::JsonSchema(OutputSchema::new(name, schema.clone(), strict)?))
        }
        other => Err(Error::invalid(format!(
            "Unsupported response_format type '{other}', expected text or json_schema"
        ))),
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn capital_format() -> Value {
        json!({
            "type": "json_schema",
            "json_schema": {
                "name": "capital_finder",
                "schema": {
                    "type": "object",
                    "properties": { "capital": { "type": "string", "pattern": "^[A-Za-z]+$" } },
                    "required": ["capital"],
                    "additionalProperties": false
                }
            },
            "strict": true
        })
    }

    #[test]
    fn test_recognised_keys_and_passthrough() {
        let params = ModelParameters::from_value(&json!({
            "temperature": 0,
            "response_format": capital_format(),
        }))
        .unwrap();

        assert_eq!(params.extra.get("temperature"), Some(&json!(0)));
        let schema = params.output_schema().unwrap();
        assert_eq!(schema.name, "capital_finder");
        assert!(schema.strict);
    }

    #[test]
    fn test_call_parameters_override_defaults() {
        let params = ModelParameters::merged(
            &json!({"temperature": 0.7, "seed": 1}),
            &json!({"temperature": 0}),
        )
        .unwrap();
        assert_eq!(params.extra.get("temperature"), Some(&json!(0)));
        assert_eq!(params.extra.get("seed"), Some(&json!(1)));
        assert!(params.output_schema().is_none());
    }

    #[test]
    fn test_schema_validation_reports_violations() {
        let params = ModelParameters::from_value(&json!({"response_format": capital_format()})).unwrap();
        let schema = params.output_schema().unwrap();

        assert!(schema.validate(&json!({"capital": "Ottawa"})).is_ok());

        let err = schema.validate(&json!({"capital": "Ottawa 2"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaValidationFailure);

        let err = schema.validate(&json!({"city": "Ottawa"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaValidationFailure);
    }

    #[test]
    fn test_schema_is_compiled_once_per_parameters() {
        let params = ModelParameters::from_value(&json!({"response_format": capital_format()})).unwrap();
        let first = params.output_schema().unwrap();
        let second = params.clone().output_schema().unwrap();
        assert!(Arc::ptr_eq(&first.validator, &second.validator));

        let params = ModelParameters::from_value(&json!({"format": {"type": "object"}})).unwrap();
        let first = params.output_schema().unwrap();
        let second = params.output_schema().unwrap();
        assert!(Arc::ptr_eq(&first.validator, &second.validator));
        assert!(first.validate(&json!({"any": "thing"})).is_ok());
        assert_eq!(first.validate(&json!("text")).unwrap_err().kind(), ErrorKind::SchemaValidationFailure);
    }

    #[test]
    fn test_invalid_schema_is_rejected_at_parse_time() {
        let err = ModelParameters::from_value(&json!({"format": {"type": 12}})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("Invalid JSON schema 'format'"));
    }

    #[test]
    fn test_ollama_format_is_a_schema() {
        let params = ModelParameters::from_value(&json!({
            "format": {"type": "object", "properties": {"capital": {"type": "string"}}}
        }))
        .unwrap();
        assert!(params.output_schema().is_some());

        let params = ModelParameters::from_value(&json!({"format": "json"})).unwrap();
        assert!(params.output_schema().is_none());

        assert!(ModelParameters::from_value(&json!({"format": 3})).is_err());
    }

    #[test]
    fn test_invalid_response_formats() {
        assert!(ModelParameters::from_value(&json!({"response_format": {"type": "xml"}})).is_err());
        assert!(ModelParameters::from_value(&json!({"response_format": {"type": "json_schema"}})).is_err());
        assert!(ModelParameters::from_json_str("{not json").is_err());
        assert_eq!(ModelParameters::from_json_str("").unwrap(), json!({}));
    }
}

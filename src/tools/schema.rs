//! Declarative tool input contracts
//!
//! Each tool declares its parameters once. [`InputSchema::to_json_schema`]
//! renders that declaration for `tools/list`, and the same JSON Schema is
//! compiled into a [`CompiledSchema`] that checks raw arguments before a
//! handler decodes them.

use jsonschema::{Draft, Validator};
use rmcp::model::JsonObject;
use serde_json::{json, Map, Value};
use std::fmt;

use super::ToolError;

/// Semantic type of a tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Number,
    Integer,
    Boolean,
}

impl ParamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Number => "number",
            ParamKind::Integer => "integer",
            ParamKind::Boolean => "boolean",
        }
    }

    /// Folds integral floats such as `2021.0` into integers
    fn normalize(self, value: &Value) -> Value {
        if self != ParamKind::Integer || value.is_i64() || value.is_u64() {
            return value.clone();
        }
        match value.as_f64() {
            Some(n) if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 => {
                Value::from(n as i64)
            }
            _ => value.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub description: &'static str,
    pub required: bool,
    /// Inclusive numeric bounds
    pub range: Option<(f64, f64)>,
}

impl ParamSpec {
    pub fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
            required: true,
            range: None,
        }
    }

    pub fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    fn expected(&self) -> String {
        match self.range {
            Some((min, max)) => format!("{} in [{}, {}]", self.kind.as_str(), min, max),
            None => self.kind.as_str().to_string(),
        }
    }

    fn invalid(&self) -> ToolError {
        ToolError::Validation {
            field: self.name.to_string(),
            expected: self.expected(),
        }
    }

    fn json_schema(&self) -> Value {
        let mut prop = json!({
            "type": self.kind.as_str(),
            "description": self.description,
        });
        if let Some((min, max)) = self.range {
            prop["minimum"] = json!(min);
            prop["maximum"] = json!(max);
        }
        prop
    }
}

/// Parameter table for one tool
#[derive(Debug, Clone, Default)]
pub struct InputSchema {
    params: Vec<ParamSpec>,
}

impl InputSchema {
    pub fn new(params: Vec<ParamSpec>) -> Self {
        Self { params }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// JSON Schema object advertised to clients
    pub fn to_json_schema(&self) -> JsonObject {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            properties.insert(param.name.to_string(), param.json_schema());
            if param.required {
                required.push(Value::from(param.name));
            }
        }

        let mut schema = Map::new();
        schema.insert("type".into(), json!("object"));
        schema.insert("properties".into(), Value::Object(properties));
        if !required.is_empty() {
            schema.insert("required".into(), Value::Array(required));
        }
        schema
    }

    /// Compile the advertised schema, plus one validator per parameter used
    /// to name the offending field.
    pub fn compile(&self) -> Result<CompiledSchema, String> {
        let contract = compile_json_schema(&Value::Object(self.to_json_schema()))?;
        let fields = self
            .params
            .iter()
            .map(|param| compile_json_schema(&param.json_schema()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompiledSchema {
            declared: self.clone(),
            contract,
            fields,
        })
    }

    /// Declared arguments only. `null` counts as absent.
    fn normalize(&self, raw: Option<&Value>) -> Result<Map<String, Value>, ToolError> {
        let empty = Map::new();
        let args = match raw {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(ToolError::Validation {
                    field: "arguments".to_string(),
                    expected: "object".to_string(),
                })
            }
        };

        Ok(self
            .params
            .iter()
            .filter_map(|param| match args.get(param.name) {
                None | Some(Value::Null) => None,
                Some(value) => Some((param.name.to_string(), param.kind.normalize(value))),
            })
            .collect())
    }
}

fn compile_json_schema(schema: &Value) -> Result<Validator, String> {
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .map_err(|err| format!("invalid schema: {err}"))
}

/// [`InputSchema`] compiled once at registration
pub struct CompiledSchema {
    declared: InputSchema,
    contract: Validator,
    fields: Vec<Validator>,
}

impl CompiledSchema {
    pub fn declared(&self) -> &InputSchema {
        &self.declared
    }

    /// Check `raw` against the contract and return the arguments to decode.
    ///
    /// Missing arguments are treated as an empty object. Undeclared keys are
    /// dropped. The first failing parameter, in declaration order, is
    /// reported.
    pub fn validate(&self, raw: Option<&Value>) -> Result<Value, ToolError> {
        let instance = Value::Object(self.declared.normalize(raw)?);
        if self.contract.is_valid(&instance) {
            return Ok(instance);
        }

        for (param, validator) in self.declared.params.iter().zip(&self.fields) {
            match instance.get(param.name) {
                None if param.required => return Err(param.invalid()),
                Some(value) if !validator.is_valid(value) => return Err(param.invalid()),
                _ => {}
            }
        }

        let reason = self
            .contract
            .iter_errors(&instance)
            .map(|err| err.to_string())
            .next()
            .unwrap_or_else(|| "object".to_string());
        Err(ToolError::Validation {
            field: "arguments".to_string(),
            expected: reason,
        })
    }
}

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("declared", &self.declared)
            .finish_non_exhaustive()
    }
}

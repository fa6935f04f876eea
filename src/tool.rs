//! Declarative tool schemas and lenient parameter coercion.
//!
//! A [`ToolDefinition`] is shared by native tool calling (rendered as a JSON
//! schema) and by the in-band XML convention (rendered as instructions), and
//! it normalizes the loosely typed parameters models produce.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::CompletionError;

/// Declared type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
}

impl ParameterType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Number => "number",
            ParameterType::Integer => "integer",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
        }
    }

    fn accepts_enum_value(self, value: &Value) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Number => value.is_number(),
            ParameterType::Integer => value.is_i64() || value.is_u64(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Array => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterDefinition {
    name: String,
    description: String,
    #[serde(rename = "type")]
    param_type: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    required: Option<bool>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    item_type: Option<ParameterType>,
}

impl ParameterDefinition {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        param_type: ParameterType,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            param_type,
            required: None,
            enum_values: None,
            item_type: None,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = Some(true);
        self
    }

    #[must_use]
    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    #[must_use]
    pub fn with_item_type(mut self, item_type: ParameterType) -> Self {
        self.item_type = Some(item_type);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn param_type(&self) -> ParameterType {
        self.param_type
    }

    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(false)
    }

    #[must_use]
    pub fn enum_values(&self) -> Option<&[Value]> {
        self.enum_values.as_deref()
    }

    #[must_use]
    pub fn item_type(&self) -> Option<ParameterType> {
        self.item_type
    }

    fn validate(&self, tool: &str) -> Result<(), CompletionError> {
        if self.name.trim().is_empty() {
            return Err(invalid(format!("tool '{tool}' has a parameter without a name")));
        }
        if self.item_type.is_some() && self.param_type != ParameterType::Array {
            return Err(invalid(format!(
                "tool '{tool}': parameter '{}' sets item_type but is of type {}",
                self.name,
                self.param_type.as_str()
            )));
        }
        if let Some(values) = &self.enum_values {
            if let Some(bad) = values
                .iter()
                .find(|v| !self.param_type.accepts_enum_value(v))
            {
                return Err(invalid(format!(
                    "tool '{tool}': enum value {bad} of parameter '{}' is not a {}",
                    self.name,
                    self.param_type.as_str()
                )));
            }
        }
        Ok(())
    }

    fn to_h(&self) -> Value {
        let mut out = Map::new();
        out.insert("name".into(), Value::String(self.name.clone()));
        out.insert("description".into(), Value::String(self.description.clone()));
        out.insert("type".into(), Value::String(self.param_type.as_str().into()));
        if let Some(required) = self.required {
            out.insert("required".into(), Value::Bool(required));
        }
        if let Some(values) = &self.enum_values {
            out.insert("enum".into(), Value::Array(values.clone()));
        }
        if let Some(item_type) = self.item_type {
            out.insert("item_type".into(), Value::String(item_type.as_str().into()));
        }
        Value::Object(out)
    }

    fn json_schema(&self) -> Value {
        let mut prop = Map::new();
        prop.insert("type".into(), Value::String(self.param_type.as_str().into()));
        prop.insert("description".into(), Value::String(self.description.clone()));
        if let Some(values) = &self.enum_values {
            prop.insert("enum".into(), Value::Array(values.clone()));
        }
        if self.param_type == ParameterType::Array {
            let item_type = self.item_type.unwrap_or(ParameterType::String);
            prop.insert("items".into(), json!({ "type": item_type.as_str() }));
        }
        Value::Object(prop)
    }
}

fn invalid(msg: String) -> CompletionError {
    CompletionError::InvalidToolDefinition(msg)
}

/// A tool the model may call. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolDefinition {
    name: String,
    description: String,
    #[serde(default)]
    parameters: Vec<ParameterDefinition>,
}

impl ToolDefinition {
    /// # Errors
    ///
    /// Returns [`CompletionError::InvalidToolDefinition`] when the parameters
    /// are inconsistent (duplicate names, mistyped enums, misplaced `item_type`).
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ParameterDefinition>,
    ) -> Result<Self, CompletionError> {
        let tool = Self {
            name: name.into(),
            description: description.into(),
            parameters,
        };
        tool.validate()?;
        Ok(tool)
    }

    /// Build from the hash form `{name, description, parameters: [...]}`.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::InvalidToolDefinition`] for unknown or
    /// missing fields and for the conditions checked by [`ToolDefinition::new`].
    pub fn from_hash(hash: &Value) -> Result<Self, CompletionError> {
        let tool = Self::deserialize(hash).map_err(|e| invalid(e.to_string()))?;
        tool.validate()?;
        Ok(tool)
    }

    /// Canonical hash form; `from_hash(to_h())` yields an equal definition.
    #[must_use]
    pub fn to_h(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters.iter().map(ParameterDefinition::to_h).collect::<Vec<_>>(),
        })
    }

    /// JSON schema of the parameters object, for native tool calling.
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            properties.insert(param.name.clone(), param.json_schema());
            if param.is_required() {
                required.push(Value::String(param.name.clone()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn parameters(&self) -> &[ParameterDefinition] {
        &self.parameters
    }

    fn validate(&self) -> Result<(), CompletionError> {
        if self.name.trim().is_empty() {
            return Err(invalid("tool name cannot be empty".into()));
        }
        let mut seen = FxHashSet::default();
        for param in &self.parameters {
            param.validate(&self.name)?;
            if !seen.insert(param.name.as_str()) {
                return Err(invalid(format!(
                    "tool '{}' declares parameter '{}' more than once",
                    self.name, param.name
                )));
            }
        }
        Ok(())
    }

    /// Coerce raw parameters to the declared types. Never fails.
    ///
    /// Values that cannot be coerced become `null`; required parameters
    /// missing from `raw` appear as `null`, optional ones are left out, and
    /// undeclared keys are dropped.
    #[must_use]
    pub fn coerce_parameters(&self, raw: &Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::new();
        for param in &self.parameters {
            match raw.get(&param.name) {
                Some(value) => {
                    let coerced = coerce_value(value, param.param_type, param.item_type);
                    out.insert(param.name.clone(), coerced);
                }
                None if param.is_required() => {
                    out.insert(param.name.clone(), Value::Null);
                }
                None => {}
            }
        }
        out
    }
}

/// Find the definition for `name` among `tools`.
#[must_use]
pub fn find_tool<'a>(tools: &'a [ToolDefinition], name: &str) -> Option<&'a ToolDefinition> {
    tools.iter().find(|tool| tool.name == name)
}

// ---------------------------------------------------------------------------
// Coercion
// ---------------------------------------------------------------------------

fn coerce_value(value: &Value, ty: ParameterType, item_type: Option<ParameterType>) -> Value {
    match ty {
        ParameterType::String => coerce_string(value),
        ParameterType::Number => coerce_number(value),
        ParameterType::Integer => coerce_integer(value),
        ParameterType::Boolean => coerce_boolean(value),
        ParameterType::Array => coerce_array(value, item_type),
    }
}

fn coerce_string(value: &Value) -> Value {
    match value {
        Value::Null | Value::String(_) => value.clone(),
        Value::Bool(b) => Value::String(b.to_string()),
        Value::Number(n) => Value::String(n.to_string()),
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
    }
}

fn coerce_number(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Value::from(i);
            }
            s.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map_or(Value::Null, Value::Number)
        }
        _ => Value::Null,
    }
}

fn coerce_integer(value: &Value) -> Value {
    match value {
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                value.clone()
            } else {
                n.as_f64()
                    .filter(|f| f.is_finite())
                    .map_or(Value::Null, |f| Value::from(f.trunc() as i64))
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Value::from(i);
            }
            match s.parse::<f64>() {
                Ok(f) if f.is_finite() && f.fract() == 0.0 => Value::from(f as i64),
                _ => Value::Null,
            }
        }
        _ => Value::Null,
    }
}

fn coerce_boolean(value: &Value) -> Value {
    match value {
        Value::Bool(_) => value.clone(),
        Value::String(s) => {
            let s = s.trim();
            if s.eq_ignore_ascii_case("true") {
                Value::Bool(true)
            } else if s.eq_ignore_ascii_case("false") {
                Value::Bool(false)
            } else {
                Value::Null
            }
        }
        _ => Value::Null,
    }
}

fn coerce_array(value: &Value, item_type: Option<ParameterType>) -> Value {
    let items = match value {
        Value::Array(items) => items.clone(),
        Value::String(s) => match serde_json::from_str::<Value>(s.trim()) {
            Ok(Value::Array(items)) => items,
            _ => return Value::Null,
        },
        _ => return Value::Null,
    };
    match item_type {
        Some(ty) => Value::Array(
            items
                .iter()
                .map(|item| coerce_value(item, ty, None))
                .collect(),
        ),
        None => Value::Array(items),
    }
}

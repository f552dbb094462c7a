//! Protocol validation at the tool boundary.
//!
//! Inputs arrive as loose property bags. The validator checks them against
//! the tool's parameter schema, sanitizes string content, and applies
//! bounded recovery for locally recoverable shapes (stringified numbers
//! and booleans, oversized strings). Internal code only ever sees
//! fully-typed, sanitized records.

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

use crate::config::ValidatorConfig;
use crate::error::{MemoryError, Result};

/// Parameter types a tool schema can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Object => value.is_object(),
            ParamKind::Array => value.is_array(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Object => "object",
            ParamKind::Array => "array",
        }
    }
}

/// One parameter of a tool schema.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    pub const fn required(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// Parameter schema of one tool.
#[derive(Debug, Clone, Default)]
pub struct ParamSchema {
    pub params: Vec<ParamSpec>,
}

impl ParamSchema {
    pub fn new(params: Vec<ParamSpec>) -> Self {
        Self { params }
    }

    /// JSON-schema shaped rendering for the tool registry.
    pub fn to_json(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for spec in &self.params {
            properties.insert(
                spec.name.to_string(),
                serde_json::json!({ "type": spec.kind.name() }),
            );
            if spec.required {
                required.push(Value::String(spec.name.to_string()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Fully-typed record handed to internal code after validation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub tool_name: String,
    pub params: Map<String, Value>,
    pub profile: Option<String>,
    pub deadline_ms: Option<u64>,
}

/// Validator counters, exported for telemetry.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ValidatorMetrics {
    #[serde(rename = "totalMessages")]
    pub total_messages: u64,
    #[serde(rename = "validMessages")]
    pub valid_messages: u64,
    #[serde(rename = "invalidMessages")]
    pub invalid_messages: u64,
    #[serde(rename = "recoveredMessages")]
    pub recovered_messages: u64,
    #[serde(rename = "averageValidationTime")]
    pub average_validation_time_us: f64,
}

/// Boundary validator. Stateless apart from counters.
pub struct ProtocolValidator {
    config: ValidatorConfig,
    total: AtomicU64,
    valid: AtomicU64,
    invalid: AtomicU64,
    recovered: AtomicU64,
    total_time_us: AtomicU64,
}

impl ProtocolValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            config,
            total: AtomicU64::new(0),
            valid: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            total_time_us: AtomicU64::new(0),
        }
    }

    /// Validate and sanitize one parameter record against a schema.
    /// Returns the typed context; unknown parameters are dropped.
    pub fn validate(
        &self,
        tool_name: &str,
        schema: &ParamSchema,
        params: Value,
        profile: Option<String>,
        deadline_ms: Option<u64>,
    ) -> Result<ToolContext> {
        let started = Instant::now();
        let outcome = self.validate_inner(schema, params);
        let elapsed = started.elapsed().as_micros() as u64;

        self.total.fetch_add(1, Ordering::Relaxed);
        self.total_time_us.fetch_add(elapsed, Ordering::Relaxed);

        match outcome {
            Ok((sanitized, recovered)) => {
                self.valid.fetch_add(1, Ordering::Relaxed);
                if recovered {
                    self.recovered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(ToolContext {
                    tool_name: tool_name.to_string(),
                    params: sanitized,
                    profile,
                    deadline_ms,
                })
            }
            Err(message) => {
                self.invalid.fetch_add(1, Ordering::Relaxed);
                debug!(tool = tool_name, %message, "parameter record rejected");
                Err(MemoryError::Validation { message })
            }
        }
    }

    fn validate_inner(
        &self,
        schema: &ParamSchema,
        params: Value,
    ) -> std::result::Result<(Map<String, Value>, bool), String> {
        let Value::Object(supplied) = params else {
            return Err("parameter record must be an object".to_string());
        };

        let mut sanitized = Map::new();
        let mut recovered_any = false;

        for spec in &schema.params {
            let value = match supplied.get(spec.name) {
                Some(Value::Null) | None => {
                    if spec.required {
                        return Err(format!("missing required parameter '{}'", spec.name));
                    }
                    continue;
                }
                Some(value) => value.clone(),
            };

            let (value, recovered) = self.coerce(spec, value)?;
            recovered_any |= recovered;
            sanitized.insert(spec.name.to_string(), value);
        }

        Ok((sanitized, recovered_any))
    }

    /// Accept the value as-is, or recover it into the expected domain
    /// within the bounded attempt budget.
    fn coerce(
        &self,
        spec: &ParamSpec,
        mut value: Value,
    ) -> std::result::Result<(Value, bool), String> {
        let mut recovered = false;
        for attempt in 0..=self.config.max_recovery_attempts {
            if spec.kind.matches(&value) {
                let value = if spec.kind == ParamKind::String {
                    let raw = value.as_str().unwrap_or_default();
                    let clean = self.sanitize_string(raw);
                    recovered |= clean != raw;
                    Value::String(clean)
                } else {
                    value
                };
                return Ok((value, recovered));
            }
            if attempt == self.config.max_recovery_attempts {
                break;
            }
            value = match self.recover_value(spec.kind, &value) {
                Some(repaired) => {
                    recovered = true;
                    repaired
                }
                None => break,
            };
        }
        Err(format!(
            "parameter '{}' is not a {} and could not be recovered",
            spec.name,
            spec.kind.name()
        ))
    }

    /// Locally recoverable shapes only; anything else stays invalid.
    fn recover_value(&self, kind: ParamKind, value: &Value) -> Option<Value> {
        match (kind, value) {
            (ParamKind::Integer, Value::String(s)) => {
                s.trim().parse::<i64>().ok().map(Value::from)
            }
            (ParamKind::Number, Value::String(s)) => {
                s.trim().parse::<f64>().ok().and_then(|n| {
                    serde_json::Number::from_f64(n).map(Value::Number)
                })
            }
            (ParamKind::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Some(Value::Bool(true)),
                "false" | "no" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            (ParamKind::Integer, Value::Number(n)) => {
                n.as_f64().map(|f| Value::from(f.trunc() as i64))
            }
            (ParamKind::String, Value::Number(n)) => Some(Value::String(n.to_string())),
            (ParamKind::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
            _ => None,
        }
    }

    /// Trim, drop control characters, clamp length.
    fn sanitize_string(&self, raw: &str) -> String {
        let trimmed: String = raw
            .trim()
            .chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
            .collect();
        if trimmed.len() > self.config.max_string_length {
            trimmed
                .char_indices()
                .take_while(|(i, _)| *i < self.config.max_string_length)
                .map(|(_, c)| c)
                .collect()
        } else {
            trimmed
        }
    }

    pub fn metrics(&self) -> ValidatorMetrics {
        let total = self.total.load(Ordering::Relaxed);
        let total_time = self.total_time_us.load(Ordering::Relaxed);
        ValidatorMetrics {
            total_messages: total,
            valid_messages: self.valid.load(Ordering::Relaxed),
            invalid_messages: self.invalid.load(Ordering::Relaxed),
            recovered_messages: self.recovered.load(Ordering::Relaxed),
            average_validation_time_us: if total == 0 {
                0.0
            } else {
                total_time as f64 / total as f64
            },
        }
    }
}

//! Runtime expressions.
//!
//! Definition values are literals unless a string is wrapped in `${ ... }`,
//! in which case the inner text is a JEXL expression. Objects and arrays are
//! evaluated recursively. The value being transformed is bound to `data`;
//! named arguments (`context`, `input`, `output`, `workflow`, `task`, loop
//! variables) are top-level identifiers.
//!
//! **Security note:** Payloads are always passed as context objects, NEVER
//! interpolated into expression strings.

use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {expression}: {message}")]
    EvalFailed { expression: String, message: String },

    #[error("expression '{expression}' did not produce {expected}: got {result}")]
    UnexpectedResult {
        expression: String,
        expected: &'static str,
        result: Value,
    },
}

// ---------------------------------------------------------------------------
// Evaluator port
// ---------------------------------------------------------------------------

/// Evaluates one expression against `data` and named arguments.
///
/// `expression` is the bare expression, without the `${ }` wrapper.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(
        &self,
        expression: &str,
        data: &Value,
        arguments: &Map<String, Value>,
    ) -> Result<Value, ExpressionError>;
}

/// JEXL evaluator with the standard transforms registered.
///
/// A fresh `jexl_eval::Evaluator` is built per call: its transforms are not
/// `Send`, and the runtime shares one evaluator across tasks.
#[derive(Debug, Default, Clone, Copy)]
pub struct JexlEvaluator;

impl JexlEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn build() -> jexl_eval::Evaluator<'static> {
        jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!is_truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<String> = args
                    .first()
                    .and_then(|v| v.as_object())
                    .map(|o| o.keys().cloned().collect())
                    .unwrap_or_default();
                Ok(json!(keys))
            })
            .with_transform("toJson", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(val.to_string()))
            })
    }
}

impl ExpressionEvaluator for JexlEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        data: &Value,
        arguments: &Map<String, Value>,
    ) -> Result<Value, ExpressionError> {
        let mut scope = arguments.clone();
        scope.insert("data".to_string(), data.clone());
        let scope = Value::Object(scope);

        Self::build()
            .eval_in_context(expression, &scope)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: expression.to_string(),
                message: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Returns the inner expression if `value` is a `${ ... }` runtime expression.
pub fn runtime_expression(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .map(str::trim)
}

/// Evaluate a template: runtime-expression strings are evaluated, objects
/// and arrays recursively, everything else is returned unchanged.
pub fn evaluate_template(
    evaluator: &dyn ExpressionEvaluator,
    template: &Value,
    data: &Value,
    arguments: &Map<String, Value>,
) -> Result<Value, ExpressionError> {
    match template {
        Value::String(s) => match runtime_expression(s) {
            Some(expression) => evaluator.evaluate(expression, data, arguments),
            None => Ok(template.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate_template(evaluator, item, data, arguments))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (key, value) in fields {
                out.insert(key.clone(), evaluate_template(evaluator, value, data, arguments)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Evaluate a condition. Accepts both bare and `${ }`-wrapped expressions.
pub fn evaluate_condition(
    evaluator: &dyn ExpressionEvaluator,
    condition: &str,
    data: &Value,
    arguments: &Map<String, Value>,
) -> Result<bool, ExpressionError> {
    let expression = runtime_expression(condition).unwrap_or(condition);
    let result = evaluator.evaluate(expression, data, arguments)?;
    Ok(is_truthy(&result))
}

/// Evaluate an expression given either bare or `${ }`-wrapped.
pub fn evaluate_expression(
    evaluator: &dyn ExpressionEvaluator,
    expression: &str,
    data: &Value,
    arguments: &Map<String, Value>,
) -> Result<Value, ExpressionError> {
    let expression = runtime_expression(expression).unwrap_or(expression);
    evaluator.evaluate(expression, data, arguments)
}

/// Evaluate an expression that must produce a string.
pub fn evaluate_string(
    evaluator: &dyn ExpressionEvaluator,
    template: &str,
    data: &Value,
    arguments: &Map<String, Value>,
) -> Result<String, ExpressionError> {
    let Some(expression) = runtime_expression(template) else {
        return Ok(template.to_string());
    };
    match evaluator.evaluate(expression, data, arguments)? {
        Value::String(s) => Ok(s),
        Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Variables visible at one point of one scope chain, flattened. Evaluation
/// only ever sees a snapshot, never live state, which keeps every
/// evaluation a pure function of its journaled inputs.
pub type ScopeSnapshot = BTreeMap<String, Value>;

/// A value source in a process definition: either a literal fixed at
/// design time or an expression evaluated against the current scope.
#[derive(Clone, Debug, PartialEq)]
pub enum Expression {
    Literal(Value),
    Expr(String),
}

impl Expression {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expression::Literal(value.into())
    }

    pub fn expr(source: impl Into<String>) -> Self {
        Expression::Expr(source.into())
    }

    /// The textual form used in error messages.
    pub fn source(&self) -> String {
        match self {
            Expression::Literal(v) => v.to_string(),
            Expression::Expr(s) => s.clone(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct EvaluationError {
    pub expression: String,
    pub message: String,
}

/// Contract with the external expression-language collaborator. The
/// engine never interprets expression sources itself; it hands them to
/// the evaluator together with a scope snapshot and type-checks the
/// result.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &ScopeSnapshot) -> Result<Value, EvaluationError>;
}

/// Reference evaluator: resolves an expression as a JSON literal or as a
/// single variable lookup. Enough for tests and for deployments whose
/// expressions are plain variable references; anything richer plugs in
/// through [`ExpressionEvaluator`].
#[derive(Clone, Copy, Debug, Default)]
pub struct LookupEvaluator;

impl ExpressionEvaluator for LookupEvaluator {
    fn evaluate(&self, expression: &str, scope: &ScopeSnapshot) -> Result<Value, EvaluationError> {
        let source = expression.trim();
        if source.is_empty() {
            return Err(EvaluationError {
                expression: expression.to_string(),
                message: "expected an expression, but it was empty".to_string(),
            });
        }
        // Literals pass through: numbers, booleans, quoted strings.
        if let Ok(value) = serde_json::from_str::<Value>(source) {
            if !matches!(value, Value::String(_)) || source.starts_with('"') {
                return Ok(value);
            }
        }
        Ok(scope.get(source).cloned().unwrap_or(Value::Null))
    }
}

/// Evaluate a definition-level value source against a snapshot.
pub fn resolve(
    evaluator: &dyn ExpressionEvaluator,
    expression: &Expression,
    scope: &ScopeSnapshot,
) -> Result<Value, EvaluationError> {
    match expression {
        Expression::Literal(v) => Ok(v.clone()),
        Expression::Expr(source) => evaluator.evaluate(source, scope),
    }
}

/// JSON type tag used in evaluation error messages.
pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "NULL",
        Value::Bool(_) => "BOOLEAN",
        Value::Number(_) => "NUMBER",
        Value::String(_) => "STRING",
        Value::Array(_) => "ARRAY",
        Value::Object(_) => "OBJECT",
    }
}

fn type_mismatch(expression: &Expression, expected: &str, actual: &Value) -> EvaluationError {
    EvaluationError {
        expression: expression.source(),
        message: format!(
            "Expected result of the expression '{}' to be '{}', but was '{}'",
            expression.source(),
            expected,
            value_type_name(actual)
        ),
    }
}

/// Resolve an expression that must yield a non-empty string (job types).
pub fn resolve_string(
    evaluator: &dyn ExpressionEvaluator,
    expression: &Expression,
    scope: &ScopeSnapshot,
) -> Result<String, EvaluationError> {
    match resolve(evaluator, expression, scope)? {
        Value::String(s) if !s.is_empty() => Ok(s),
        other => Err(type_mismatch(expression, "STRING", &other)),
    }
}

/// Resolve an expression that must yield a non-negative integer (retries).
pub fn resolve_retries(
    evaluator: &dyn ExpressionEvaluator,
    expression: &Expression,
    scope: &ScopeSnapshot,
) -> Result<u32, EvaluationError> {
    let value = resolve(evaluator, expression, scope)?;
    match value.as_i64() {
        Some(n) if n >= 0 => Ok(n as u32),
        _ => Err(type_mismatch(expression, "NUMBER", &value)),
    }
}

/// Resolve an expression that must yield an array (multi-instance input
/// collections).
pub fn resolve_array(
    evaluator: &dyn ExpressionEvaluator,
    expression: &Expression,
    scope: &ScopeSnapshot,
) -> Result<Vec<Value>, EvaluationError> {
    match resolve(evaluator, expression, scope)? {
        Value::Array(items) => Ok(items),
        other => Err(type_mismatch(expression, "ARRAY", &other)),
    }
}

/// Hash of a serialized snapshot. Journaled on the events that record an
/// evaluation so replay can verify it saw identical inputs.
pub fn snapshot_hash(snapshot: &ScopeSnapshot) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(snapshot).expect("snapshot serializes"));
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(entries: &[(&str, Value)]) -> ScopeSnapshot {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn lookup_resolves_variables_and_literals() {
        let eval = LookupEvaluator;
        let scope = scope(&[("job_name", json!("payment_listener"))]);
        assert_eq!(
            eval.evaluate("job_name", &scope).unwrap(),
            json!("payment_listener")
        );
        assert_eq!(eval.evaluate("42", &scope).unwrap(), json!(42));
        assert_eq!(eval.evaluate("\"lit\"", &scope).unwrap(), json!("lit"));
        assert_eq!(eval.evaluate("missing", &scope).unwrap(), Value::Null);
    }

    #[test]
    fn string_resolution_reports_the_original_source_and_actual_type() {
        let eval = LookupEvaluator;
        let err = resolve_string(&eval, &Expression::expr("listener_name_var"), &scope(&[]))
            .unwrap_err();
        assert_eq!(
            err.message,
            "Expected result of the expression 'listener_name_var' to be 'STRING', but was 'NULL'"
        );
    }

    #[test]
    fn retries_resolution_rejects_negative_and_non_numeric_results() {
        let eval = LookupEvaluator;
        let scope = scope(&[("neg", json!(-1)), ("s", json!("three"))]);
        assert!(resolve_retries(&eval, &Expression::expr("neg"), &scope).is_err());
        assert!(resolve_retries(&eval, &Expression::expr("s"), &scope).is_err());
        assert_eq!(
            resolve_retries(&eval, &Expression::literal(3), &scope).unwrap(),
            3
        );
    }

    #[test]
    fn snapshot_hash_is_stable_and_input_sensitive() {
        let a = scope(&[("x", json!(1))]);
        let b = scope(&[("x", json!(2))]);
        assert_eq!(snapshot_hash(&a), snapshot_hash(&a));
        assert_ne!(snapshot_hash(&a), snapshot_hash(&b));
    }
}

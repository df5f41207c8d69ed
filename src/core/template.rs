//! `${...}` references inside step parameters.
//!
//! - `${params.location}` reads the instance parameters
//! - `${steps.step_1}` is a dependency's whole result
//! - `${steps.step_1.result.risk_score}` walks into it
//!
//! A string that is exactly one reference is replaced by the referenced
//! value (any JSON type). References embedded in longer strings are
//! rendered as text.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::domain::OrchestratorError;

/// Values a step's parameters may refer to
pub struct TemplateContext<'a> {
    pub params: &'a Value,
    /// Results of the step's declared dependencies only
    pub steps: &'a BTreeMap<String, Value>,
}

impl<'a> TemplateContext<'a> {
    pub fn new(params: &'a Value, steps: &'a BTreeMap<String, Value>) -> Self {
        Self { params, steps }
    }

    /// Resolve every reference in `value`
    pub fn resolve(&self, value: &Value) -> Result<Value, OrchestratorError> {
        match value {
            Value::String(s) => self.resolve_str(s),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve(v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve(v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_str(&self, s: &str) -> Result<Value, OrchestratorError> {
        if !s.contains("${") {
            return Ok(Value::String(s.to_string()));
        }

        // Whole-string reference keeps the referenced type
        if let Some(expr) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
            if !expr.contains("${") && !expr.contains('}') {
                return self.lookup(expr.trim());
            }
        }

        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                OrchestratorError::validation(format!("unterminated reference in '{}'", s))
            })?;
            let value = self.lookup(after[..end].trim())?;
            match value {
                Value::String(text) => out.push_str(&text),
                other => out.push_str(&other.to_string()),
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);

        Ok(Value::String(out))
    }

    fn lookup(&self, expr: &str) -> Result<Value, OrchestratorError> {
        let mut segments = expr.split('.');

        match segments.next() {
            Some("params") => {
                let path: Vec<&str> = segments.collect();
                walk(self.params, &path).cloned().ok_or_else(|| {
                    OrchestratorError::validation(format!("parameter '{}' not provided", path.join(".")))
                })
            }
            Some("steps") => {
                let step_id = segments.next().filter(|s| !s.is_empty()).ok_or_else(|| {
                    OrchestratorError::validation(format!("reference '{}' names no step", expr))
                })?;
                let result = self.steps.get(step_id).ok_or_else(|| {
                    OrchestratorError::validation(format!(
                        "reference to step '{}' which is not a dependency",
                        step_id
                    ))
                })?;
                let path: Vec<&str> = segments.collect();
                walk(result, &path).cloned().ok_or_else(|| {
                    OrchestratorError::validation(format!(
                        "step '{}' result has no field '{}'",
                        step_id,
                        path.join(".")
                    ))
                })
            }
            _ => Err(OrchestratorError::validation(format!(
                "unknown reference '${{{}}}'",
                expr
            ))),
        }
    }
}

/// Follow a dotted path; numeric segments index arrays
fn walk<'v>(root: &'v Value, path: &[&str]) -> Option<&'v Value> {
    path.iter().try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use serde_json::json;

    fn steps() -> BTreeMap<String, Value> {
        let mut steps = BTreeMap::new();
        steps.insert(
            "step_2".to_string(),
            json!({"result": {"risk_score": 0.85, "zones": ["a", "b"]}}),
        );
        steps
    }

    #[test]
    fn test_whole_string_keeps_type() {
        let params = json!({"coordinates": {"lat": 30.1, "lng": 120.2}});
        let steps = steps();
        let ctx = TemplateContext::new(&params, &steps);

        let resolved = ctx
            .resolve(&json!({
                "where": "${params.coordinates}",
                "score": "${steps.step_2.result.risk_score}",
                "zone": "${steps.step_2.result.zones.1}",
                "fixed": 3
            }))
            .unwrap();

        assert_eq!(
            resolved,
            json!({
                "where": {"lat": 30.1, "lng": 120.2},
                "score": 0.85,
                "zone": "b",
                "fixed": 3
            })
        );
    }

    #[test]
    fn test_embedded_references_render_as_text() {
        let params = json!({"location": "Hangzhou", "severity": 4});
        let steps = BTreeMap::new();
        let ctx = TemplateContext::new(&params, &steps);

        let resolved = ctx
            .resolve(&json!("fire_${params.location}_level${params.severity}"))
            .unwrap();
        assert_eq!(resolved, json!("fire_Hangzhou_level4"));
    }

    #[test]
    fn test_non_dependency_reference_fails() {
        let params = json!({});
        let steps = steps();
        let ctx = TemplateContext::new(&params, &steps);

        let err = ctx.resolve(&json!("${steps.step_9.result}")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("not a dependency"));
    }

    #[test]
    fn test_missing_parameter_fails() {
        let params = json!({"location": "x"});
        let steps = BTreeMap::new();
        let ctx = TemplateContext::new(&params, &steps);

        assert!(ctx.resolve(&json!(["${params.nope}"])).is_err());
        assert!(ctx.resolve(&json!("${oops.x}")).is_err());
        assert!(ctx.resolve(&json!("a ${params.location")).is_err());
    }
}

//! Aggregate step: combine the outputs of earlier steps.
//!
//! Inputs are gathered from the dependency results. A fan-out result
//! contributes only its successful sub-results, labelled by service; a
//! remote-call result contributes its tool output; anything else is used
//! whole, labelled by step id.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{StepContext, StepHandler};
use crate::domain::{OrchestratorError, StepType};

const DEFAULT_FIELD: &str = "risk_score";

pub struct AggregateHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    /// Shallow merge of object outputs, later sources win
    Merge,
    /// Outputs keyed by source
    Collect,
    /// Weighted mean of one numeric field
    WeightedAverage,
}

impl Method {
    fn parse(s: &str) -> Result<Self, OrchestratorError> {
        match s {
            "merge" | "simple_merge" => Ok(Self::Merge),
            "collect" => Ok(Self::Collect),
            "weighted_average" => Ok(Self::WeightedAverage),
            other => Err(OrchestratorError::validation(format!(
                "unknown aggregation method '{}'",
                other
            ))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Collect => "collect",
            Self::WeightedAverage => "weighted_average",
        }
    }
}

/// Labelled inputs, in dependency order
fn gather(dependency_results: &BTreeMap<String, Value>) -> Vec<(String, Value)> {
    let mut items = Vec::new();

    for (step_id, result) in dependency_results {
        if let Some(subs) = result.get("results").and_then(Value::as_array) {
            for sub in subs {
                if sub.get("success").and_then(Value::as_bool) != Some(true) {
                    continue;
                }
                let label = sub
                    .get("service")
                    .and_then(Value::as_str)
                    .unwrap_or(step_id)
                    .to_string();
                items.push((label, sub.get("result").cloned().unwrap_or(Value::Null)));
            }
        } else if let (Some(service), Some(output)) = (
            result.get("service").and_then(Value::as_str),
            result.get("result"),
        ) {
            items.push((service.to_string(), output.clone()));
        } else {
            items.push((step_id.clone(), result.clone()));
        }
    }

    items
}

fn merge(items: &[(String, Value)]) -> Value {
    let mut merged = Map::new();
    for (label, value) in items {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    merged.insert(k.clone(), v.clone());
                }
            }
            other => {
                merged.insert(label.clone(), other.clone());
            }
        }
    }
    Value::Object(merged)
}

fn collect(items: &[(String, Value)]) -> Value {
    Value::Object(
        items
            .iter()
            .map(|(label, value)| (label.clone(), value.clone()))
            .collect(),
    )
}

fn weighted_average(items: &[(String, Value)], field: &str, weights: Option<&Value>) -> Value {
    let mut total = 0.0;
    let mut weight_sum = 0.0;
    let mut contributions = Map::new();

    for (label, value) in items {
        let Some(x) = value.get(field).and_then(Value::as_f64) else {
            continue;
        };
        let w = weights
            .and_then(|w| w.get(label))
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        if w <= 0.0 {
            continue;
        }
        total += w * x;
        weight_sum += w;
        contributions.insert(label.clone(), json!({"value": x, "weight": w}));
    }

    let value = if weight_sum > 0.0 {
        json!(total / weight_sum)
    } else {
        Value::Null
    };

    json!({
        "field": field,
        "value": value,
        "contributions": contributions,
    })
}

#[async_trait]
impl StepHandler for AggregateHandler {
    fn step_type(&self) -> StepType {
        StepType::Aggregate
    }

    async fn handle(&self, ctx: &StepContext) -> Result<Value, OrchestratorError> {
        let method = ctx
            .str_param("method")
            .or_else(|| ctx.str_param("integration_method"))
            .map(Method::parse)
            .transpose()?
            .unwrap_or(Method::Merge);

        let items = gather(&ctx.dependency_results);
        debug!(step = %ctx.step_id, method = method.as_str(), inputs = items.len(), "Aggregating");

        let integrated = match method {
            Method::Merge => merge(&items),
            Method::Collect => collect(&items),
            Method::WeightedAverage => weighted_average(
                &items,
                ctx.str_param("field").unwrap_or(DEFAULT_FIELD),
                ctx.param("weights"),
            ),
        };

        Ok(json!({
            "success": true,
            "method": method.as_str(),
            "sources": items.iter().map(|(label, _)| label.as_str()).collect::<Vec<_>>(),
            "count": items.len(),
            "integrated_data": integrated,
        }))
    }
}

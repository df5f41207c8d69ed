//! Workflow definitions and loading.
//!
//! Definitions are YAML or JSON documents: a parameter schema plus steps
//! that declare their dependencies by id. They are immutable once
//! registered with the engine.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{OrchestratorError, StepType, WorkflowInstance, WorkflowStep};

const BUILTIN_WORKFLOWS: [(&str, &str); 4] = [
    (
        "nfdrs4_fire_risk_assessment.yaml",
        include_str!("../../workflows/nfdrs4_fire_risk_assessment.yaml"),
    ),
    (
        "lisflood_flood_risk_assessment.yaml",
        include_str!("../../workflows/lisflood_flood_risk_assessment.yaml"),
    ),
    (
        "climada_climate_risk_assessment.yaml",
        include_str!("../../workflows/climada_climate_risk_assessment.yaml"),
    ),
    (
        "comprehensive_disaster_assessment.yaml",
        include_str!("../../workflows/comprehensive_disaster_assessment.yaml"),
    ),
];

fn default_version() -> String {
    "1.0.0".to_string()
}

/// A complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name (used in CLI and `start`)
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// JSON-schema subset: `type: object`, `required`, `properties.*.type`
    #[serde(default)]
    pub parameters_schema: Value,

    /// Overall deadline for one instance
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    pub steps: Vec<StepTemplate>,
}

/// Template for one step of every instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(rename = "type", alias = "step_type")]
    pub step_type: StepType,

    #[serde(default)]
    pub parameters: Value,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl StepTemplate {
    /// Fresh Pending step
    pub fn instantiate(&self) -> WorkflowStep {
        let name = if self.name.is_empty() {
            self.id.clone()
        } else {
            self.name.clone()
        };

        let mut step = WorkflowStep::new(self.id.clone(), name, self.step_type);
        step.description = self.description.clone();
        step.parameters = match &self.parameters {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        step.dependencies = self.dependencies.clone();
        step.timeout_seconds = self.timeout_seconds;
        step
    }
}

impl WorkflowDefinition {
    /// Load a definition from a YAML or JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let parsed = if is_json {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        };
        parsed.with_context(|| format!("Invalid workflow file: {}", path.display()))
    }

    /// Parse a definition from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse workflow YAML")
    }

    /// Parse a definition from JSON content
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse workflow JSON")
    }

    /// Structural checks done once at registration.
    ///
    /// Cycles are left to the engine, which reports them as a deadlock.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::validation("workflow name cannot be empty"));
        }

        if self.steps.is_empty() {
            return Err(OrchestratorError::validation(format!(
                "workflow '{}' must have at least one step",
                self.name
            )));
        }

        let mut ids = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(OrchestratorError::validation(format!(
                    "step {} of '{}' has an empty id",
                    i, self.name
                )));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(OrchestratorError::validation(format!(
                    "duplicate step id '{}' in '{}'",
                    step.id, self.name
                )));
            }
        }

        for step in &self.steps {
            if let Some(missing) = step.dependencies.iter().find(|d| !ids.contains(d.as_str())) {
                return Err(OrchestratorError::validation(format!(
                    "step '{}' depends on non-existent step '{}'",
                    step.id, missing
                )));
            }
        }

        Ok(())
    }

    /// Check runtime parameters against `parameters_schema`
    pub fn validate_parameters(&self, params: &Value) -> Result<(), OrchestratorError> {
        let schema = match &self.parameters_schema {
            Value::Object(schema) => schema,
            _ => return Ok(()),
        };

        let expects_object = schema.get("type").and_then(Value::as_str) == Some("object")
            || schema.contains_key("required")
            || schema.contains_key("properties");
        if !expects_object {
            return Ok(());
        }

        let provided = params.as_object().ok_or_else(|| {
            OrchestratorError::validation(format!(
                "parameters for '{}' must be an object",
                self.name
            ))
        })?;

        let required = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|keys| keys.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .unwrap_or_default();

        let missing: Vec<&str> = required
            .into_iter()
            .filter(|key| provided.get(*key).map_or(true, Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(OrchestratorError::validation(format!(
                "workflow '{}' is missing required parameters: {}",
                self.name,
                missing.join(", ")
            )));
        }

        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (key, property) in properties {
                let (Some(value), Some(expected)) =
                    (provided.get(key), property.get("type").and_then(Value::as_str))
                else {
                    continue;
                };
                if !value.is_null() && !matches_type(value, expected) {
                    return Err(OrchestratorError::validation(format!(
                        "parameter '{}' of '{}' must be of type {}",
                        key, self.name, expected
                    )));
                }
            }
        }

        Ok(())
    }

    /// New Pending instance with fresh copies of every step
    pub fn instantiate(&self, params: Value) -> WorkflowInstance {
        let steps = self.steps.iter().map(StepTemplate::instantiate).collect();
        let mut instance = WorkflowInstance::new(self.name.clone(), params, steps);
        instance.timeout_seconds = self.timeout_seconds;
        instance
    }

    pub fn get_step(&self, id: &str) -> Option<&StepTemplate> {
        self.steps.iter().find(|s| s.id == id)
    }
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

/// The disaster-assessment workflows shipped with the crate
pub fn builtin_definitions() -> Result<Vec<WorkflowDefinition>> {
    BUILTIN_WORKFLOWS
        .iter()
        .map(|(file, content)| {
            WorkflowDefinition::from_yaml(content)
                .with_context(|| format!("Invalid built-in workflow {}", file))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, StepStatus};
    use serde_json::json;

    const TEST_WORKFLOW_YAML: &str = r#"
name: test
description: Test workflow
parameters_schema:
  type: object
  properties:
    location: { type: string }
    severity: { type: number }
  required: [location]
steps:
  - id: step_1
    name: fetch
    type: data_fetch
    parameters:
      data_type: fire_event
  - id: step_2
    name: assess
    type: remote_call
    timeout_seconds: 30
    parameters:
      service: nfdrs4
      tool: fire_risk
    dependencies: [step_1]
"#;

    #[test]
    fn test_definition_parsing() {
        let definition = WorkflowDefinition::from_yaml(TEST_WORKFLOW_YAML).unwrap();

        assert_eq!(definition.name, "test");
        assert_eq!(definition.version, "1.0.0");
        assert_eq!(definition.steps.len(), 2);
        assert_eq!(definition.steps[0].step_type, StepType::Fetch);
        assert_eq!(definition.steps[1].timeout_seconds, Some(30));
        assert!(definition.validate().is_ok());
    }

    #[test]
    fn test_json_definition() {
        let definition = WorkflowDefinition::from_json(
            r#"{"name": "j", "steps": [{"id": "a", "type": "aggregate"}]}"#,
        )
        .unwrap();
        assert!(definition.validate().is_ok());
        assert!(definition.parameters_schema.is_null());
    }

    #[test]
    fn test_invalid_dependency_reference() {
        let yaml = r#"
name: invalid
steps:
  - id: first
    type: fetch
    dependencies: [nonexistent]
"#;
        let definition = WorkflowDefinition::from_yaml(yaml).unwrap();
        let err = definition.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let yaml = r#"
name: dup
steps:
  - { id: a, type: fetch }
  - { id: a, type: persist }
"#;
        let definition = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert!(definition.validate().is_err());
    }

    #[test]
    fn test_cycles_pass_validation() {
        let yaml = r#"
name: cycle
steps:
  - { id: A, type: aggregate, dependencies: [B] }
  - { id: B, type: aggregate, dependencies: [A] }
"#;
        let definition = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert!(definition.validate().is_ok());
    }

    #[test]
    fn test_parameter_validation() {
        let definition = WorkflowDefinition::from_yaml(TEST_WORKFLOW_YAML).unwrap();

        assert!(definition
            .validate_parameters(&json!({"location": "Hangzhou", "severity": 3}))
            .is_ok());

        let err = definition.validate_parameters(&json!({"severity": 3})).unwrap_err();
        assert!(err.to_string().contains("location"));

        assert!(definition
            .validate_parameters(&json!({"location": "x", "severity": "high"}))
            .is_err());
        assert!(definition.validate_parameters(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_instantiate_copies_steps() {
        let definition = WorkflowDefinition::from_yaml(TEST_WORKFLOW_YAML).unwrap();
        let a = definition.instantiate(json!({"location": "x"}));
        let b = definition.instantiate(json!({"location": "y"}));

        assert_ne!(a.id, b.id);
        assert_eq!(a.steps.len(), 2);
        assert!(a.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(a.steps[1].dependencies, vec!["step_1".to_string()]);
        assert_eq!(a.steps[1].parameters["service"], "nfdrs4");
    }

    #[test]
    fn test_builtin_workflows_are_valid() {
        let definitions = builtin_definitions().unwrap();
        assert_eq!(definitions.len(), 4);
        for definition in &definitions {
            definition.validate().unwrap();
        }

        let comprehensive = definitions
            .iter()
            .find(|d| d.name == "comprehensive_disaster_assessment")
            .unwrap();
        assert_eq!(
            comprehensive.get_step("step_2").unwrap().step_type,
            StepType::FanOut
        );
    }
}

//! Turning a template plus caller-supplied values into a runnable command.
//!
//! Resolution rules for each declared parameter:
//!
//! | Supplied value | Choices | Optional | Result |
//! |---|---|---|---|
//! | non-empty | none, or contains value | any | value |
//! | non-empty | does not contain value | any | missing |
//! | empty / absent | any | yes | `""` |
//! | empty / absent | any | no | missing |
//!
//! Then a parameter that resolved to `""` is reported as an unmet dependency
//! when any of its dependencies currently holds the required value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::template::{self, content_hash};
use super::{OperationError, OperationsConfig, ParamSpec};
use crate::instance::TargetInstance;

/// Lifecycle of a registered operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Ready,
    Running,
}

/// A fully substituted command, identified by the hash of its text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilledOperation {
    pub operation: String,
    pub hash: String,
    pub status: OperationStatus,
    #[serde(default)]
    pub realtime_output: bool,
}

impl FilledOperation {
    pub fn new(operation: String, realtime_output: bool) -> Self {
        let hash = content_hash(&operation);
        Self {
            operation,
            hash,
            status: OperationStatus::Ready,
            realtime_output,
        }
    }
}

/// Resolve every parameter in `specs` against `supplied`.
///
/// Resolved values are added to `resolved`, unresolvable names to `missing`.
pub fn resolve_params(
    supplied: &BTreeMap<String, String>,
    specs: &BTreeMap<String, ParamSpec>,
    resolved: &mut BTreeMap<String, String>,
    missing: &mut Vec<String>,
) {
    for (name, spec) in specs {
        match supplied.get(name).map(String::as_str) {
            Some(value) if !value.is_empty() => {
                let allowed = spec
                    .choices
                    .as_ref()
                    .is_none_or(|choices| choices.iter().any(|c| c == value));
                if allowed {
                    resolved.insert(name.clone(), value.to_string());
                } else {
                    missing.push(name.clone());
                }
            }
            _ if spec.optional => {
                resolved.insert(name.clone(), String::new());
            }
            _ => missing.push(name.clone()),
        }
    }
}

/// Names that resolved empty although a dependency demands a value.
pub fn unmet_dependencies(
    resolved: &BTreeMap<String, String>,
    scopes: &[&BTreeMap<String, ParamSpec>],
) -> Vec<String> {
    resolved
        .iter()
        .filter(|(_, value)| value.is_empty())
        .filter(|(name, _)| {
            scopes
                .iter()
                .filter_map(|scope| scope.get(*name))
                .flat_map(|spec| spec.dependencies.iter())
                .any(|(dependency, required)| {
                    resolved
                        .get(&dependency.to_uppercase())
                        .map_or("", String::as_str)
                        == required
                })
        })
        .map(|(name, _)| name.clone())
        .collect()
}

/// Substitute values into a template bound to `instance`.
///
/// No optionality or dependencies apply: every placeholder must be resolvable
/// from the instance.
pub fn fill_instance_template(
    template: &str,
    instance: &TargetInstance,
) -> Result<String, OperationError> {
    let mut values = BTreeMap::new();
    let mut missing = Vec::new();
    for name in template::placeholders(template) {
        match instance.resolve(&name) {
            Some(value) => {
                values.insert(name, value);
            }
            None => missing.push(name),
        }
    }
    if !missing.is_empty() {
        return Err(OperationError::InstanceOperationMissingParameters(missing));
    }
    Ok(template::substitute(template, &values))
}

impl OperationsConfig {
    /// Fill the ordinary operation `name` with caller-supplied values.
    pub fn fill_operation(
        &self,
        name: &str,
        supplied: &BTreeMap<String, String>,
    ) -> Result<FilledOperation, OperationError> {
        let op = self
            .operation(name)
            .ok_or_else(|| OperationError::OperationNotFound(name.to_string()))?;

        let mut resolved = BTreeMap::new();
        let mut missing = Vec::new();
        resolve_params(supplied, &self.common_params, &mut resolved, &mut missing);
        resolve_params(supplied, &op.params, &mut resolved, &mut missing);
        if !missing.is_empty() {
            return Err(OperationError::MissingParameters(missing));
        }

        let unmet = unmet_dependencies(&resolved, &[&self.common_params, &op.params]);
        if !unmet.is_empty() {
            return Err(OperationError::UnmetDependency(unmet));
        }

        let command = template::substitute(&op.operation, &resolved);
        Ok(FilledOperation::new(command, op.realtime_output))
    }

    /// Fill a template that may only use common parameters.
    pub fn fill_common_template(
        &self,
        template: &str,
        supplied: &BTreeMap<String, String>,
    ) -> Result<String, OperationError> {
        let mut resolved = BTreeMap::new();
        let mut missing = Vec::new();
        resolve_params(supplied, &self.common_params, &mut resolved, &mut missing);
        if !missing.is_empty() {
            return Err(OperationError::MissingParameters(missing));
        }
        let unmet = unmet_dependencies(&resolved, &[&self.common_params]);
        if !unmet.is_empty() {
            return Err(OperationError::UnmetDependency(unmet));
        }
        Ok(template::substitute(template, &resolved))
    }

    /// Fill the instance-bound operation `name` from `instance`.
    pub fn fill_instance_operation(
        &self,
        name: &str,
        instance: &TargetInstance,
    ) -> Result<FilledOperation, OperationError> {
        let op = self
            .instance_operation(name)
            .ok_or_else(|| OperationError::OperationNotFound(name.to_string()))?;
        let command = fill_instance_template(&op.operation, instance)?;
        Ok(FilledOperation::new(command, op.realtime_output))
    }

    /// Fill the project discovery template, if one is configured.
    pub fn fill_project_operation(
        &self,
        supplied: &BTreeMap<String, String>,
    ) -> Option<Result<String, OperationError>> {
        self.project_operation
            .as_deref()
            .map(|template| self.fill_common_template(template, supplied))
    }

    /// Fill the project validation template, if one is configured.
    pub fn fill_validate_project_operation(
        &self,
        supplied: &BTreeMap<String, String>,
    ) -> Option<Result<String, OperationError>> {
        self.validate_project_operation
            .as_deref()
            .map(|template| self.fill_common_template(template, supplied))
    }

    /// Reduce discovery output to the project id.
    ///
    /// With `project_operation_regex` set, its first capture group wins when
    /// it matches; otherwise the whole output is used.
    pub fn extract_project(&self, output: &str) -> String {
        let captured = self
            .project_regex()
            .and_then(|re| re.captures(output))
            .and_then(|caps| caps.get(1));
        match captured {
            Some(m) => m.as_str().trim().to_string(),
            None => output.trim().to_string(),
        }
    }
}

/// Validation output confirms `project` when it mentions it.
pub fn project_confirmed(output: &str, project: &str) -> bool {
    !project.is_empty() && output.contains(project)
}

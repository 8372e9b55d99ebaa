//! Error types for loading the operations catalogue and filling operations.

use std::collections::BTreeMap;

use thiserror::Error;

/// Why an operations file was rejected. Load never partially succeeds.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read operations file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse operations file: {0}")]
    Parse(String),

    /// Every unresolved placeholder and dependency, grouped by owning scope.
    #[error("{}", describe_invalid(.missing_variables, .invalid_dependencies, .other))]
    Invalid {
        missing_variables: BTreeMap<String, Vec<String>>,
        invalid_dependencies: BTreeMap<String, Vec<String>>,
        other: Vec<String>,
    },
}

impl ConfigError {
    /// One line per finding, for reports that list them individually.
    pub fn violations(&self) -> Vec<String> {
        match self {
            Self::Invalid {
                missing_variables,
                invalid_dependencies,
                other,
            } => missing_variables
                .iter()
                .map(|(scope, names)| format!("{scope}: undefined {}", names.join(", ")))
                .chain(invalid_dependencies.iter().map(|(owner, keys)| {
                    format!("{owner}: unknown dependency {}", keys.join(", "))
                }))
                .chain(other.iter().cloned())
                .collect(),
            other => vec![other.to_string()],
        }
    }
}

/// Why a single fill request failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("No operations config is loaded")]
    ConfigNotLoaded,

    #[error("{0} operation was not found in the config")]
    OperationNotFound(String),

    #[error("Missing parameters defined in config file for this operation: {}", .0.join(", "))]
    MissingParameters(Vec<String>),

    #[error("These parameters are required due to the dependencies for this operation: {}", .0.join(", "))]
    UnmetDependency(Vec<String>),

    #[error(
        "Missing parameters in the instance needed for this operation: {}, use Admin Operations instead for this operation",
        .0.join(", ")
    )]
    InstanceOperationMissingParameters(Vec<String>),
}

fn join_findings(findings: &BTreeMap<String, Vec<String>>) -> String {
    findings
        .iter()
        .map(|(owner, names)| format!("{owner}: {}", names.join(", ")))
        .collect::<Vec<_>>()
        .join(". ")
}

fn describe_invalid(
    missing: &BTreeMap<String, Vec<String>>,
    dependencies: &BTreeMap<String, Vec<String>>,
    other: &[String],
) -> String {
    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!(
            "Config is missing variables for these operation(s): {}",
            join_findings(missing)
        ));
    }
    if !dependencies.is_empty() {
        parts.push(format!(
            "Config has invalid dependencies for these common parameter(s) and operation(s): {}",
            join_findings(dependencies)
        ));
    }
    parts.extend(other.iter().cloned());
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_lists_every_finding() {
        let mut missing = BTreeMap::new();
        missing.insert("restart".to_string(), vec!["HOST".to_string(), "PORT".to_string()]);
        missing.insert("status".to_string(), vec!["UNIT".to_string()]);
        let mut deps = BTreeMap::new();
        deps.insert("REGION".to_string(), vec!["ZONE_KIND".to_string()]);

        let err = ConfigError::Invalid {
            missing_variables: missing,
            invalid_dependencies: deps,
            other: vec![],
        };
        assert_eq!(
            err.to_string(),
            "Config is missing variables for these operation(s): restart: HOST, PORT. status: UNIT; \
             Config has invalid dependencies for these common parameter(s) and operation(s): REGION: ZONE_KIND"
        );
    }

    #[test]
    fn fill_errors_join_names() {
        let err = OperationError::MissingParameters(vec!["A".into(), "B".into()]);
        assert_eq!(
            err.to_string(),
            "Missing parameters defined in config file for this operation: A, B"
        );
        let err = OperationError::OperationNotFound("reboot".into());
        assert_eq!(err.to_string(), "reboot operation was not found in the config");
    }

    #[test]
    fn violations_one_per_line() {
        let mut missing = BTreeMap::new();
        missing.insert("instance:ssh".to_string(), vec!["USER".to_string()]);
        let err = ConfigError::Invalid {
            missing_variables: missing,
            invalid_dependencies: BTreeMap::new(),
            other: vec!["Duplicate operation name: ssh".to_string()],
        };
        assert_eq!(
            err.violations(),
            vec!["instance:ssh: undefined USER", "Duplicate operation name: ssh"]
        );
        assert_eq!(ConfigError::Parse("bad".into()).violations().len(), 1);
    }
}

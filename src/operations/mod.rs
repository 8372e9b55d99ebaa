//! Operation catalogue: model, loading and load-time validation.
//!
//! The catalogue is a YAML file describing parameterised command templates:
//!
//! ```yaml
//! common_params:
//!   project:
//!     description: GCP project id
//!     sample: my-project
//! operations:
//!   - name: list-disks
//!     description: List disks in a zone
//!     operation: gcloud compute disks list --project=${{PROJECT}} --zones=${{ZONE}}
//!     params:
//!       ZONE:
//!         optional: true
//! instance_operations:
//!   - name: serial-output
//!     operation: gcloud compute instances get-serial-port-output ${{NAME}} --zone=${{ZONE}}
//! project_operation: gcloud config get-value project
//! pre_session_operations:
//!   - name: start-vm
//!     operation: gcloud compute instances start ${{NAME}} --zone=${{ZONE}}
//!     dependencies:
//!       START_VM: "yes"
//! ```
//!
//! Loading is all-or-nothing: every unresolved placeholder and every
//! dependency pointing at an unknown parameter is collected and reported in
//! one [`ConfigError::Invalid`]. Parameter names are upper-cased on load.
//!
//! | Scope | Placeholders may use |
//! |---|---|
//! | `operations` | common params, own params |
//! | `instance_operations` | common params, own params, `NAME` `ZONE` `PROJECT` `NETWORKIP` |
//! | `pre_session_operations` | common params, `NAME` `ZONE` `PROJECT` `NETWORKIP` |
//! | `project_operation`, `validate_project_operation` | common params |

pub mod error;
pub mod fill;
pub mod template;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::RwLock;

pub use error::{ConfigError, OperationError};
pub use fill::{FilledOperation, OperationStatus};

/// Placeholder names an instance-bound template may use without declaring them.
pub const RESERVED_INSTANCE_NAMES: [&str; 4] = ["NAME", "ZONE", "PROJECT", "NETWORKIP"];

/// How a single parameter is presented to the client and resolved on fill.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(default, deserialize_with = "scalar")]
    pub default: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "scalar")]
    pub sample: String,
    /// Closed set of accepted values. `None` accepts anything.
    #[serde(
        default,
        deserialize_with = "scalar_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub choices: Option<Vec<String>>,
    /// Other parameter name mapped to the value that makes this one required.
    #[serde(default, deserialize_with = "scalar_map")]
    pub dependencies: BTreeMap<String, String>,
}

/// A named command template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub operation: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamSpec>,
    /// Stream output line by line instead of returning it in one block.
    #[serde(default)]
    pub realtime_output: bool,
}

/// A command run before a private session is provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreSessionOperation {
    pub name: String,
    pub operation: String,
    /// Instance parameter name mapped to the value required for this to run.
    #[serde(default, deserialize_with = "scalar_map")]
    pub dependencies: BTreeMap<String, String>,
}

/// A named sequence of operations offered to the client as one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub operations: Vec<String>,
}

/// The validated operation catalogue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationsConfig {
    #[serde(default)]
    pub common_params: BTreeMap<String, ParamSpec>,
    #[serde(default)]
    pub operations: Vec<OperationTemplate>,
    #[serde(default)]
    pub instance_operations: Vec<OperationTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_project_operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_operation_regex: Option<String>,
    #[serde(default, alias = "pre_rdp_operations")]
    pub pre_session_operations: Vec<PreSessionOperation>,
    #[serde(default)]
    pub workflows: Vec<Workflow>,
    #[serde(skip)]
    project_regex: Option<Regex>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Integer(i64),
    Float(f64),
    Flag(bool),
}

impl From<Scalar> for String {
    fn from(value: Scalar) -> Self {
        match value {
            Scalar::Text(s) => s,
            Scalar::Integer(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Flag(b) => b.to_string(),
        }
    }
}

fn scalar<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<Scalar>::deserialize(deserializer)?
        .map(String::from)
        .unwrap_or_default())
}

fn scalar_list<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<String>>, D::Error> {
    let list = Option::<Vec<Scalar>>::deserialize(deserializer)?;
    Ok(list.map(|items| items.into_iter().map(String::from).collect()))
}

fn scalar_map<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, String>, D::Error> {
    let map = Option::<BTreeMap<String, Scalar>>::deserialize(deserializer)?;
    Ok(map
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, String::from(v)))
        .collect())
}

/// Upper-case parameter names and their dependency keys.
///
/// Two names that collide once upper-cased are reported in `problems`.
fn normalize_params(
    owner: &str,
    params: BTreeMap<String, ParamSpec>,
    problems: &mut Vec<String>,
) -> BTreeMap<String, ParamSpec> {
    let mut normalized = BTreeMap::new();
    for (name, spec) in params {
        let upper = name.to_uppercase();
        let spec = ParamSpec {
            choices: spec.choices.filter(|c| !c.is_empty()),
            dependencies: spec
                .dependencies
                .into_iter()
                .map(|(k, v)| (k.to_uppercase(), v))
                .collect(),
            ..spec
        };
        if normalized.insert(upper.clone(), spec).is_some() {
            problems.push(format!("{owner} declares parameter {upper} more than once"));
        }
    }
    normalized
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn unresolved(template: &str, known: impl Fn(&str) -> bool) -> Vec<String> {
    template::placeholders(template)
        .into_iter()
        .filter(|name| !known(name))
        .collect()
}

fn record(findings: &mut BTreeMap<String, Vec<String>>, owner: String, names: Vec<String>) {
    if !names.is_empty() {
        findings.entry(owner).or_default().extend(names);
    }
}

impl OperationsConfig {
    /// Parse, normalise and validate a catalogue.
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        let raw: Self =
            serde_yaml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut problems = Vec::new();
        let config = raw.normalized(&mut problems);
        config.validate(problems)
    }

    /// Read and validate the catalogue at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&source)
    }

    fn normalized(self, problems: &mut Vec<String>) -> Self {
        let normalize_ops = |ops: Vec<OperationTemplate>, problems: &mut Vec<String>| {
            ops.into_iter()
                .map(|op| OperationTemplate {
                    params: normalize_params(&op.name, op.params, problems),
                    ..op
                })
                .collect::<Vec<_>>()
        };

        let project_regex = match non_empty(self.project_operation_regex.clone()) {
            Some(pattern) => match Regex::new(&pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    problems.push(format!("project_operation_regex is invalid: {e}"));
                    None
                }
            },
            None => None,
        };

        Self {
            common_params: normalize_params("common_params", self.common_params, problems),
            operations: normalize_ops(self.operations, problems),
            instance_operations: normalize_ops(self.instance_operations, problems),
            project_operation: non_empty(self.project_operation),
            validate_project_operation: non_empty(self.validate_project_operation),
            project_operation_regex: non_empty(self.project_operation_regex),
            pre_session_operations: self
                .pre_session_operations
                .into_iter()
                .map(|op| PreSessionOperation {
                    dependencies: op
                        .dependencies
                        .into_iter()
                        .map(|(k, v)| (k.to_uppercase(), v))
                        .collect(),
                    ..op
                })
                .collect(),
            workflows: self.workflows,
            project_regex,
        }
    }

    fn validate(self, mut other: Vec<String>) -> Result<Self, ConfigError> {
        let mut missing: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut dependencies: BTreeMap<String, Vec<String>> = BTreeMap::new();

        let common = &self.common_params;
        let reserved = |name: &str| RESERVED_INSTANCE_NAMES.contains(&name);

        let mut seen = BTreeSet::new();
        for op in &self.operations {
            if !seen.insert(op.name.as_str()) {
                other.push(format!("Operation {} is defined more than once", op.name));
            }
            let names = unresolved(&op.operation, |n| {
                common.contains_key(n) || op.params.contains_key(n)
            });
            record(&mut missing, op.name.clone(), names);
        }

        let mut seen = BTreeSet::new();
        for op in &self.instance_operations {
            if !seen.insert(op.name.as_str()) {
                other.push(format!("Instance operation {} is defined more than once", op.name));
            }
            let names = unresolved(&op.operation, |n| {
                common.contains_key(n) || op.params.contains_key(n) || reserved(n)
            });
            record(&mut missing, format!("instance:{}", op.name), names);
        }

        for op in &self.pre_session_operations {
            let names = unresolved(&op.operation, |n| common.contains_key(n) || reserved(n));
            record(&mut missing, format!("pre-session:{}", op.name), names);
        }

        if let Some(project) = &self.project_operation {
            let names = unresolved(project, |n| common.contains_key(n));
            record(&mut missing, "project_operation".to_string(), names);
        }
        if let Some(validate) = &self.validate_project_operation {
            let names = unresolved(validate, |n| common.contains_key(n));
            record(&mut missing, "validate_project_operation".to_string(), names);
        }

        for workflow in &self.workflows {
            let names = workflow
                .operations
                .iter()
                .filter(|name| self.operation(name).is_none() && self.instance_operation(name).is_none())
                .cloned()
                .collect();
            record(&mut missing, format!("workflow:{}", workflow.name), names);
        }

        for (name, spec) in common {
            let keys = spec
                .dependencies
                .keys()
                .filter(|k| !common.contains_key(*k))
                .cloned()
                .collect();
            record(&mut dependencies, name.clone(), keys);
        }
        let scoped = self
            .operations
            .iter()
            .map(|op| (op.name.clone(), op))
            .chain(
                self.instance_operations
                    .iter()
                    .map(|op| (format!("instance:{}", op.name), op)),
            );
        for (owner, op) in scoped {
            for spec in op.params.values() {
                let keys = spec
                    .dependencies
                    .keys()
                    .filter(|k| !common.contains_key(*k) && !op.params.contains_key(*k))
                    .cloned()
                    .collect();
                record(&mut dependencies, owner.clone(), keys);
            }
        }
        for op in &self.pre_session_operations {
            let keys = op
                .dependencies
                .keys()
                .filter(|k| !common.contains_key(*k))
                .cloned()
                .collect();
            record(&mut dependencies, format!("pre-session:{}", op.name), keys);
        }

        if missing.is_empty() && dependencies.is_empty() && other.is_empty() {
            Ok(self)
        } else {
            Err(ConfigError::Invalid {
                missing_variables: missing,
                invalid_dependencies: dependencies,
                other,
            })
        }
    }

    pub fn operation(&self, name: &str) -> Option<&OperationTemplate> {
        self.operations.iter().find(|op| op.name == name)
    }

    pub fn instance_operation(&self, name: &str) -> Option<&OperationTemplate> {
        self.instance_operations.iter().find(|op| op.name == name)
    }

    /// Compiled `project_operation_regex`, if one is configured.
    pub fn project_regex(&self) -> Option<&Regex> {
        self.project_regex.as_ref()
    }
}

/// Shared, swappable handle to the current catalogue.
///
/// Readers take a cheap `Arc` snapshot; a reload replaces the whole catalogue
/// only after the new one validated.
#[derive(Clone, Default)]
pub struct OperationsHandle {
    inner: Arc<RwLock<Option<Arc<OperationsConfig>>>>,
}

impl OperationsHandle {
    pub fn new(config: Option<OperationsConfig>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config.map(Arc::new))),
        }
    }

    pub async fn current(&self) -> Option<Arc<OperationsConfig>> {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, config: OperationsConfig) -> Arc<OperationsConfig> {
        let config = Arc::new(config);
        *self.inner.write().await = Some(Arc::clone(&config));
        config
    }

    /// Load `path` and swap it in. On failure the previous catalogue stays.
    pub async fn reload(&self, path: &Path) -> Result<Arc<OperationsConfig>, ConfigError> {
        let config = OperationsConfig::load(path)?;
        Ok(self.replace(config).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
common_params:
  test_common:
    description: lower-case key gets upper-cased
    default: 10
operations:
  - name: test
    operation: ${{TEST_COMMON}} ${{TEST_COMMAND}}
    params:
      TEST_COMMAND:
        sample: echo
        choices: [a, 2, true]
    realtime_output: true
instance_operations:
  - name: ping
    operation: ping ${{NETWORKIP}} -c ${{TEST_COMMON}}
project_operation: gcloud config get-value project
project_operation_regex: "projects/(.+)"
pre_rdp_operations:
  - name: start
    operation: gcloud compute instances start ${{NAME}} --zone=${{ZONE}}
    dependencies:
      test_common: "yes"
workflows:
  - name: all
    operations: [test, ping]
"#;

    #[test]
    fn valid_config_loads_and_normalizes() {
        let config = OperationsConfig::from_yaml_str(VALID).unwrap();
        assert!(config.common_params.contains_key("TEST_COMMON"));
        assert_eq!(config.common_params["TEST_COMMON"].default, "10");

        let op = config.operation("test").unwrap();
        assert!(op.realtime_output);
        assert_eq!(
            op.params["TEST_COMMAND"].choices.as_deref(),
            Some(&["a".to_string(), "2".to_string(), "true".to_string()][..])
        );

        assert_eq!(config.pre_session_operations.len(), 1);
        assert_eq!(
            config.pre_session_operations[0].dependencies.get("TEST_COMMON").map(String::as_str),
            Some("yes")
        );
        assert!(config.project_regex().is_some());
        assert!(config.validate_project_operation.is_none());
    }

    #[test]
    fn every_missing_placeholder_is_reported() {
        let yaml = r#"
common_params:
  REGION: {}
operations:
  - name: a
    operation: ${{REGION}} ${{HOST}} ${{PORT}}
  - name: b
    operation: ${{USER}}
instance_operations:
  - name: c
    operation: ${{NAME}} ${{DISK}}
project_operation: ${{NAME}}
"#;
        let err = OperationsConfig::from_yaml_str(yaml).unwrap_err();
        let ConfigError::Invalid {
            missing_variables, ..
        } = &err
        else {
            panic!("expected Invalid, got {err}");
        };
        assert_eq!(missing_variables["a"], vec!["HOST", "PORT"]);
        assert_eq!(missing_variables["b"], vec!["USER"]);
        assert_eq!(missing_variables["instance:c"], vec!["DISK"]);
        assert_eq!(missing_variables["project_operation"], vec!["NAME"]);
        assert!(err
            .to_string()
            .starts_with("Config is missing variables for these operation(s): "));
    }

    #[test]
    fn every_unknown_dependency_is_reported() {
        let yaml = r#"
common_params:
  MODE:
    dependencies:
      ghost: "on"
operations:
  - name: op
    operation: run ${{MODE}} ${{LEVEL}}
    params:
      LEVEL:
        dependencies:
          MODE: "fast"
          phantom: "x"
pre_session_operations:
  - name: warmup
    operation: echo ${{NAME}}
    dependencies:
      NOPE: "yes"
"#;
        let err = OperationsConfig::from_yaml_str(yaml).unwrap_err();
        let ConfigError::Invalid {
            missing_variables,
            invalid_dependencies,
            ..
        } = err
        else {
            panic!("expected Invalid");
        };
        assert!(missing_variables.is_empty());
        assert_eq!(invalid_dependencies["MODE"], vec!["GHOST"]);
        assert_eq!(invalid_dependencies["op"], vec!["PHANTOM"]);
        assert_eq!(invalid_dependencies["pre-session:warmup"], vec!["NOPE"]);
    }

    #[test]
    fn placeholder_and_dependency_findings_are_combined() {
        let yaml = r#"
common_params:
  A:
    dependencies: {B: "1"}
operations:
  - name: op
    operation: ${{A}} ${{C}}
"#;
        let err = OperationsConfig::from_yaml_str(yaml).unwrap_err().to_string();
        assert!(err.contains("op: C"));
        assert!(err.contains("A: B"));
    }

    #[test]
    fn reserved_names_only_in_instance_scopes() {
        let yaml = r#"
operations:
  - name: plain
    operation: echo ${{NAME}}
instance_operations:
  - name: bound
    operation: echo ${{NAME}} ${{ZONE}} ${{PROJECT}} ${{NETWORKIP}}
"#;
        let err = OperationsConfig::from_yaml_str(yaml).unwrap_err();
        let ConfigError::Invalid {
            missing_variables, ..
        } = err
        else {
            panic!("expected Invalid");
        };
        assert_eq!(missing_variables.len(), 1);
        assert_eq!(missing_variables["plain"], vec!["NAME"]);
    }

    #[test]
    fn colliding_names_and_bad_regex_are_rejected() {
        let yaml = r#"
common_params:
  zone: {}
  ZONE: {}
operations:
  - name: dup
    operation: echo
  - name: dup
    operation: echo
project_operation_regex: "(["
workflows:
  - name: flow
    operations: [dup, missing]
"#;
        let err = OperationsConfig::from_yaml_str(yaml).unwrap_err();
        let ConfigError::Invalid {
            missing_variables,
            other,
            ..
        } = err
        else {
            panic!("expected Invalid");
        };
        assert_eq!(missing_variables["workflow:flow"], vec!["missing"]);
        assert_eq!(other.len(), 3);
        assert!(other.iter().any(|p| p.contains("ZONE more than once")));
        assert!(other.iter().any(|p| p.contains("project_operation_regex")));
        assert!(other.iter().any(|p| p.contains("dup is defined more than once")));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = OperationsConfig::from_yaml_str("operations: [{name: x}]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_catalogue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("operations.yml");
        std::fs::write(&path, VALID).unwrap();

        let handle = OperationsHandle::default();
        assert!(handle.current().await.is_none());
        handle.reload(&path).await.unwrap();
        assert!(handle.current().await.unwrap().operation("test").is_some());

        std::fs::write(&path, "operations:\n  - name: broken\n    operation: ${{NOPE}}\n").unwrap();
        assert!(handle.reload(&path).await.is_err());
        assert!(handle.current().await.unwrap().operation("test").is_some());
    }
}

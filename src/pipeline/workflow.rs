//! Workflow definitions
//!
//! A workflow is a YAML document with a name and an ordered list of steps.
//! Step commands and prompts may reference variables as `${name}`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::{Captures, Regex};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::PipelineError;

/// What to do when a step fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Stop the run as `failed`
    #[default]
    Fail,
    /// Record the failure and move on to the next step
    Continue,
}

/// One unit of work
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Shell command run by the command runner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Prompt for an agent-backed runner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub on_failure: OnFailure,
    /// Store the step output under this variable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_var: Option<String>,
}

impl Step {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A named, ordered list of steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared variables with their defaults
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// `schema_version: 1` and `schema_version: "1.0"` are both accepted
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<serde_yaml::Value> = Option::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_yaml::Value::String(s)) => Some(s),
        Some(serde_yaml::Value::Number(n)) => Some(n.to_string()),
        Some(serde_yaml::Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

impl Workflow {
    pub fn from_yaml(text: &str) -> Result<Self, PipelineError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path).map_err(|source| PipelineError::WorkflowRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Identifier recorded in execution state
    pub fn id(&self) -> &str {
        &self.name
    }
}

fn var_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.-]*)\}").ok())
        .as_ref()
}

/// Replace `${name}` references; unknown names are left as written
pub fn substitute(template: &str, vars: &BTreeMap<String, Value>) -> String {
    let Some(re) = var_regex() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &Captures<'_>| match vars.get(&caps[1]) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) => String::new(),
        Some(other) => other.to_string(),
        None => caps[0].to_string(),
    })
    .into_owned()
}

/// Variable names referenced by a template, in order of appearance
pub fn referenced_vars(template: &str) -> Vec<String> {
    var_regex()
        .map(|re| {
            re.captures_iter(template)
                .map(|caps| caps[1].to_string())
                .collect()
        })
        .unwrap_or_default()
}

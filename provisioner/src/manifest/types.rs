//! Declarative task and profile definitions (TOML manifests).
//!
//! Definitions are read-only at runtime. Loose manifest shapes are parsed
//! into these explicit structures up front; validation happens once at load
//! time, never at use time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Shell check and/or filesystem indicator deciding whether a task's tool is
/// already present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    /// Command whose exit 0 means "installed".
    #[serde(default)]
    pub check_command: Option<String>,
    /// Path (may start with `~`) whose existence means "installed".
    #[serde(default)]
    pub installed_indicator: Option<String>,
}

/// Dependency sets referencing other task ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dependencies {
    /// Always pulled into the plan, transitively.
    pub required: Vec<String>,
    /// Exactly-one-of group; the resolver never picks for the user.
    pub one_of: Vec<String>,
    /// Suggested but never auto-added.
    pub optional: Vec<String>,
}

/// One shell step of an install sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallStep {
    pub command: String,
    #[serde(default)]
    pub description: String,
}

/// A named alternative step sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSteps {
    pub steps: Vec<InstallStep>,
}

/// Install steps, either a single plain sequence or variant-keyed
/// alternatives (key = the task id whose presence selects the variant,
/// `default` as fallback).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstallSpec {
    Plain { steps: Vec<InstallStep> },
    Variants { variants: BTreeMap<String, VariantSteps> },
}

impl InstallSpec {
    pub fn is_empty(&self) -> bool {
        match self {
            InstallSpec::Plain { steps } => steps.is_empty(),
            InstallSpec::Variants { variants } => {
                variants.is_empty() || variants.values().any(|v| v.steps.is_empty())
            }
        }
    }
}

/// A snippet to append to a shell startup file after install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellSnippet {
    /// Target startup file, e.g. `~/.zshrc`.
    pub file: String,
    pub snippet: String,
}

/// Post-install verification check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verify {
    pub command: String,
}

/// One installable/configurable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Must equal the task's map key in the manifest file.
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub detection: Option<Detection>,
    #[serde(default)]
    pub dependencies: Dependencies,
    pub install: InstallSpec,
    #[serde(default)]
    pub shell_integration: Vec<ShellSnippet>,
    /// Task ids worth suggesting once this one is installed.
    #[serde(default)]
    pub post_install: Vec<String>,
    #[serde(default)]
    pub verify: Option<Verify>,
    #[serde(default)]
    pub conflicts_with: Vec<String>,
    /// User-configurable settings, passed through to install commands.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_category() -> String {
    "general".to_string()
}

/// A lettered answer within a profile question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    /// A-E.
    pub letter: String,
    pub text: String,
    /// Semantic value recorded into the session choice.
    #[serde(default)]
    pub value: Option<String>,
    /// Task ids appended to the plan when this option is chosen.
    #[serde(default)]
    pub tasks: Vec<String>,
    /// User-data keys this option requires (e.g. git_name, git_email).
    #[serde(default)]
    pub requires_user_data: Vec<String>,
}

/// One question of a profile's fixed interview flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub question: String,
    pub options: Vec<QuestionOption>,
}

/// A pre-composed development-stack question flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub question_flow: Vec<Question>,
    /// Always included when this profile is chosen.
    #[serde(default)]
    pub required_tasks: Vec<String>,
    #[serde(default)]
    pub default_cli_tools: Vec<String>,
    #[serde(default)]
    pub post_install_suggestions: Vec<String>,
}

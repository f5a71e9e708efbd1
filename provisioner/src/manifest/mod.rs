//! Manifest store: layered loading and all-or-nothing validation of task and
//! profile definitions.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/tasks/core/*.toml      # built-in, conceptually immutable
//! <root>/tasks/profiles/*.toml
//! <root>/tasks/custom/*.toml    # user/agent-writable, shadows core by id
//! ```
//!
//! Either the whole merged set validates or the load fails, naming the file
//! and the reference that broke it. No partial loads.

pub mod types;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::core::error::ManifestError;
pub use types::{
    Dependencies, Detection, InstallSpec, InstallStep, ProfileDefinition, Question,
    QuestionOption, ShellSnippet, TaskDefinition, VariantSteps, Verify,
};

/// Optional free-form header block of a manifest file.
#[derive(Debug, Clone, Default, Deserialize)]
struct ManifestMetadata {
    #[serde(default)]
    #[allow(dead_code)]
    name: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default)]
    #[allow(dead_code)]
    metadata: ManifestMetadata,
    tasks: BTreeMap<String, TaskDefinition>,
}

#[derive(Debug, Deserialize)]
struct ProfileFile {
    metadata: ProfileMetadata,
    #[serde(default)]
    question_flow: Vec<Question>,
    #[serde(default)]
    required_tasks: Vec<String>,
    #[serde(default)]
    default_cli_tools: Vec<String>,
    #[serde(default)]
    post_install_suggestions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProfileMetadata {
    id: String,
    name: String,
    description: String,
}

/// The validated, merged id space of all loaded definitions.
#[derive(Debug, Clone, Default)]
pub struct Manifests {
    tasks: BTreeMap<String, TaskDefinition>,
    profiles: BTreeMap<String, ProfileDefinition>,
}

impl Manifests {
    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.get(id)
    }

    pub fn profile(&self, id: &str) -> Option<&ProfileDefinition> {
        self.profiles.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.values()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    /// Build a merged set directly from definitions (test seams and embedded
    /// catalogs). Runs the same referential validation as a disk load.
    pub fn from_definitions(
        tasks: Vec<TaskDefinition>,
        profiles: Vec<ProfileDefinition>,
    ) -> Result<Self, ManifestError> {
        let synthetic = PathBuf::from("<in-memory>");
        let mut manifests = Manifests::default();
        for task in tasks {
            manifests.tasks.insert(task.id.clone(), task);
        }
        for profile in profiles {
            manifests.profiles.insert(profile.id.clone(), profile);
        }
        validate_structure(&manifests, &synthetic)?;
        validate_references(&manifests, &synthetic)?;
        Ok(manifests)
    }
}

/// Handle to a manifest root directory. No ambient singleton; tests inject a
/// temporary root.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Load and validate the whole layered manifest set.
    pub fn load(&self) -> Result<Manifests, ManifestError> {
        let tasks_dir = self.root.join("tasks");
        let mut manifests = Manifests::default();

        // Core first, then custom shadows by id. Duplicates within one layer
        // are an error; shadowing across layers is the feature.
        for layer in ["core", "custom"] {
            let dir = tasks_dir.join(layer);
            let mut layer_ids = BTreeSet::new();
            for path in manifest_files(&dir)? {
                let file = parse_task_file(&path)?;
                for (key, task) in file.tasks {
                    if task.id != key {
                        return Err(ManifestError::IdMismatch {
                            path,
                            key,
                            id: task.id,
                        });
                    }
                    if !layer_ids.insert(key.clone()) {
                        return Err(ManifestError::Duplicate { path, id: key });
                    }
                    manifests.tasks.insert(key, task);
                }
            }
        }

        for path in manifest_files(&tasks_dir.join("profiles"))? {
            let file = parse_profile_file(&path)?;
            let profile = ProfileDefinition {
                id: file.metadata.id.clone(),
                name: file.metadata.name,
                description: file.metadata.description,
                question_flow: file.question_flow,
                required_tasks: file.required_tasks,
                default_cli_tools: file.default_cli_tools,
                post_install_suggestions: file.post_install_suggestions,
            };
            if manifests.profiles.contains_key(&profile.id) {
                return Err(ManifestError::Duplicate {
                    path,
                    id: profile.id,
                });
            }
            manifests.profiles.insert(profile.id.clone(), profile);
        }

        validate_structure(&manifests, &tasks_dir)?;
        validate_references(&manifests, &tasks_dir)?;
        debug!(
            tasks = manifests.task_count(),
            profiles = manifests.profile_count(),
            "manifests loaded"
        );
        Ok(manifests)
    }
}

/// Sorted `.toml` files under `dir`; a missing layer directory is empty.
fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>, ManifestError> {
    if !dir.exists() {
        debug!(dir = %dir.display(), "manifest layer missing, treating as empty");
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|source| ManifestError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ManifestError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "toml") {
            files.push(path);
        }
    }
    // Deterministic load order regardless of directory iteration order.
    files.sort();
    Ok(files)
}

fn parse_task_file(path: &Path) -> Result<TaskFile, ManifestError> {
    let contents = fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ManifestError::Parse {
        path: path.to_path_buf(),
        source: Box::new(source),
    })
}

fn parse_profile_file(path: &Path) -> Result<ProfileFile, ManifestError> {
    let contents = fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ManifestError::Parse {
        path: path.to_path_buf(),
        source: Box::new(source),
    })
}

/// Structural checks beyond what serde enforces.
fn validate_structure(manifests: &Manifests, origin: &Path) -> Result<(), ManifestError> {
    for task in manifests.tasks.values() {
        if task.install.is_empty() {
            return Err(ManifestError::EmptyInstall {
                path: origin.to_path_buf(),
                id: task.id.clone(),
            });
        }
        if let Some(detection) = &task.detection
            && detection.check_command.is_none()
            && detection.installed_indicator.is_none()
        {
            return Err(ManifestError::MissingDetection {
                path: origin.to_path_buf(),
                id: task.id.clone(),
            });
        }
    }
    for profile in manifests.profiles.values() {
        for question in &profile.question_flow {
            let count = question.options.len();
            let letters_ok = question.options.iter().all(|option| {
                matches!(option.letter.as_str(), "A" | "B" | "C" | "D" | "E")
            });
            if !(2..=5).contains(&count) || !letters_ok {
                return Err(ManifestError::BadQuestion {
                    path: origin.to_path_buf(),
                    id: profile.id.clone(),
                    question: question.id.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Every task id referenced anywhere must resolve in the merged id space.
fn validate_references(manifests: &Manifests, origin: &Path) -> Result<(), ManifestError> {
    let dangling = |owner: &str, field: &str, reference: &str| ManifestError::DanglingReference {
        path: origin.to_path_buf(),
        owner: owner.to_string(),
        field: field.to_string(),
        reference: reference.to_string(),
    };
    let check = |owner: &str, field: &str, ids: &[String]| -> Result<(), ManifestError> {
        for id in ids {
            if !manifests.tasks.contains_key(id) {
                return Err(dangling(owner, field, id));
            }
        }
        Ok(())
    };

    for task in manifests.tasks.values() {
        check(&task.id, "dependencies.required", &task.dependencies.required)?;
        check(&task.id, "dependencies.one_of", &task.dependencies.one_of)?;
        check(&task.id, "dependencies.optional", &task.dependencies.optional)?;
        check(&task.id, "conflicts_with", &task.conflicts_with)?;
        check(&task.id, "post_install", &task.post_install)?;
        if let InstallSpec::Variants { variants } = &task.install {
            for key in variants.keys() {
                if key != "default" && !manifests.tasks.contains_key(key) {
                    return Err(dangling(&task.id, "install.variants", key));
                }
            }
        }
    }

    for profile in manifests.profiles.values() {
        check(&profile.id, "required_tasks", &profile.required_tasks)?;
        check(&profile.id, "default_cli_tools", &profile.default_cli_tools)?;
        check(
            &profile.id,
            "post_install_suggestions",
            &profile.post_install_suggestions,
        )?;
        for question in &profile.question_flow {
            for option in &question.options {
                let field = format!("question '{}' option {}", question.id, option.letter);
                for id in &option.tasks {
                    if !manifests.tasks.contains_key(id) {
                        return Err(dangling(&profile.id, &field, id));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_manifest;

    const GOOD_TASKS: &str = r#"
[tasks.homebrew]
id = "homebrew"
name = "Homebrew"
description = "macOS package manager"
category = "foundation"

[tasks.homebrew.detection]
check_command = "command -v brew"

[[tasks.homebrew.install.steps]]
command = "/bin/bash -c \"$(curl -fsSL https://example.com/install.sh)\""
description = "Install Homebrew"

[tasks.git]
id = "git"
name = "Git"
description = "Version control"
category = "cli"

[tasks.git.dependencies]
required = ["homebrew"]

[[tasks.git.install.steps]]
command = "brew install git"
description = "Install git"
"#;

    const GOOD_PROFILE: &str = r#"
required_tasks = ["homebrew"]
default_cli_tools = ["git"]

[metadata]
id = "minimal"
name = "Minimal"
description = "Just the basics"

[[question_flow]]
id = "vcs"
question = "Need version control?"

[[question_flow.options]]
letter = "A"
text = "Yes, git"
value = "git"
tasks = ["git"]

[[question_flow.options]]
letter = "B"
text = "No"
value = "none"
"#;

    /// Loads the layered set and resolves lookups by id.
    #[test]
    fn load_merges_core_and_profiles() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_manifest(temp.path(), "core/base.toml", GOOD_TASKS);
        write_manifest(temp.path(), "profiles/minimal.toml", GOOD_PROFILE);

        let manifests = ManifestStore::new(temp.path()).load().expect("load");
        assert_eq!(manifests.task_count(), 2);
        assert_eq!(manifests.profile_count(), 1);
        assert_eq!(manifests.task("git").expect("git").category, "cli");
        assert_eq!(
            manifests.profile("minimal").expect("profile").required_tasks,
            vec!["homebrew".to_string()]
        );
    }

    /// A custom manifest shadows a core task with the same id.
    #[test]
    fn custom_layer_shadows_core_by_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_manifest(temp.path(), "core/base.toml", GOOD_TASKS);
        write_manifest(
            temp.path(),
            "custom/override.toml",
            r#"
[tasks.git]
id = "git"
name = "Git (custom build)"
description = "Version control"

[[tasks.git.install.steps]]
command = "brew install git --HEAD"
"#,
        );

        let manifests = ManifestStore::new(temp.path()).load().expect("load");
        assert_eq!(manifests.task("git").expect("git").name, "Git (custom build)");
    }

    /// One dangling reference fails the entire load and names the reference.
    #[test]
    fn dangling_reference_fails_whole_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_manifest(temp.path(), "core/base.toml", GOOD_TASKS);
        write_manifest(
            temp.path(),
            "core/broken.toml",
            r#"
[tasks.node-lts]
id = "node-lts"
name = "Node LTS"
description = "Node.js runtime"

[tasks.node-lts.dependencies]
one_of = ["nvm", "fnm"]

[[tasks.node-lts.install.steps]]
command = "nvm install --lts"
"#,
        );

        let err = ManifestStore::new(temp.path()).load().expect_err("must fail");
        match err {
            ManifestError::DanglingReference {
                owner,
                field,
                reference,
                ..
            } => {
                assert_eq!(owner, "node-lts");
                assert_eq!(field, "dependencies.one_of");
                assert!(reference == "nvm" || reference == "fnm");
            }
            other => panic!("expected dangling reference, got {other}"),
        }
    }

    /// A task key that disagrees with its id field is a structural error.
    #[test]
    fn key_id_mismatch_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_manifest(
            temp.path(),
            "core/bad.toml",
            r#"
[tasks.git]
id = "got"
name = "Git"
description = "Version control"

[[tasks.git.install.steps]]
command = "brew install git"
"#,
        );

        let err = ManifestStore::new(temp.path()).load().expect_err("must fail");
        assert!(matches!(err, ManifestError::IdMismatch { .. }));
    }

    /// Malformed TOML reports the offending file.
    #[test]
    fn parse_error_names_the_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_manifest(temp.path(), "core/bad.toml", "tasks = not toml");

        let err = ManifestStore::new(temp.path()).load().expect_err("must fail");
        match err {
            ManifestError::Parse { path, .. } => {
                assert!(path.ends_with("core/bad.toml"));
            }
            other => panic!("expected parse error, got {other}"),
        }
    }

    /// Duplicate ids within the core layer are rejected; two profiles with
    /// the same id as well.
    #[test]
    fn duplicates_within_a_layer_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_manifest(temp.path(), "core/a.toml", GOOD_TASKS);
        write_manifest(
            temp.path(),
            "core/b.toml",
            r#"
[tasks.git]
id = "git"
name = "Git again"
description = "dup"

[[tasks.git.install.steps]]
command = "brew install git"
"#,
        );

        let err = ManifestStore::new(temp.path()).load().expect_err("must fail");
        assert!(matches!(err, ManifestError::Duplicate { .. }));
    }

    /// Two custom files defining the same task id are a duplicate, never a
    /// silent last-file-wins; only shadowing across layers is legal.
    #[test]
    fn duplicate_within_custom_layer_is_rejected() {
        const CUSTOM_GIT: &str = r#"
[tasks.git]
id = "git"
name = "Git A"
description = "Version control"

[[tasks.git.install.steps]]
command = "brew install git"
"#;
        let temp = tempfile::tempdir().expect("tempdir");
        write_manifest(temp.path(), "custom/a.toml", CUSTOM_GIT);
        write_manifest(
            temp.path(),
            "custom/b.toml",
            &CUSTOM_GIT.replace("Git A", "Git B"),
        );

        let err = ManifestStore::new(temp.path()).load().expect_err("must fail");
        match err {
            ManifestError::Duplicate { path, id } => {
                assert!(path.ends_with("custom/b.toml"));
                assert_eq!(id, "git");
            }
            other => panic!("expected duplicate, got {other}"),
        }
    }

    /// Variant-keyed installs parse and validate their variant keys.
    #[test]
    fn variant_install_parses_and_validates_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_manifest(
            temp.path(),
            "core/node.toml",
            r#"
[tasks.nvm]
id = "nvm"
name = "nvm"
description = "Node version manager"

[[tasks.nvm.install.steps]]
command = "brew install nvm"

[tasks.node-lts]
id = "node-lts"
name = "Node LTS"
description = "Node.js"

[tasks.node-lts.dependencies]
one_of = ["nvm"]

[tasks.node-lts.install.variants.nvm]
steps = [{ command = "nvm install --lts", description = "Install via nvm" }]

[tasks.node-lts.install.variants.default]
steps = [{ command = "brew install node", description = "Install via brew" }]
"#,
        );

        let manifests = ManifestStore::new(temp.path()).load().expect("load");
        let node = manifests.task("node-lts").expect("node-lts");
        match &node.install {
            InstallSpec::Variants { variants } => {
                assert!(variants.contains_key("nvm"));
                assert!(variants.contains_key("default"));
            }
            InstallSpec::Plain { .. } => panic!("expected variants"),
        }
    }

    /// Questions must carry 2-5 options with letters A-E.
    #[test]
    fn profile_question_option_bounds_enforced() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_manifest(temp.path(), "core/base.toml", GOOD_TASKS);
        write_manifest(
            temp.path(),
            "profiles/bad.toml",
            r#"
[metadata]
id = "bad"
name = "Bad"
description = "One-option question"

[[question_flow]]
id = "only"
question = "Take it or leave it?"

[[question_flow.options]]
letter = "A"
text = "Take it"
"#,
        );

        let err = ManifestStore::new(temp.path()).load().expect_err("must fail");
        assert!(matches!(err, ManifestError::BadQuestion { .. }));
    }
}

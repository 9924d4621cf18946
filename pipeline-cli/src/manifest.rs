use std::path::Path;

use anyhow::Context;
use pipeline_core::{Action, DeclaredTask};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ManifestTask {
    pub name: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub route: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub tasks: Vec<ManifestTask>,
}

/// Loads a manifest as YAML or JSON based on its extension (`.json` is JSON, anything else is
/// tried as YAML, which is a superset of JSON anyway).
pub fn load(path: &Path) -> anyhow::Result<Manifest> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest `{}'", path.display()))?;

    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    if is_json {
        serde_json::from_str(&contents).with_context(|| format!("parsing `{}' as JSON", path.display()))
    } else {
        serde_yaml::from_str(&contents).with_context(|| format!("parsing `{}' as YAML", path.display()))
    }
}

pub fn into_declared_tasks(manifest: Manifest) -> Vec<DeclaredTask> {
    manifest
        .tasks
        .into_iter()
        .map(|t| {
            let mut decl = DeclaredTask::new(t.name);
            decl.actions = t.commands.into_iter().map(Action::Command).collect();
            decl.depends = t.depends;
            decl.targets = t.targets;
            decl.route = t.route;
            decl
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_yaml_manifest() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "tasks:\n  - name: build\n    commands: [\"cargo build\"]\n    targets: [\"target/debug/app\"]\n"
        )
        .unwrap();
        let manifest = load(file.path()).unwrap();
        assert_eq!(manifest.tasks.len(), 1);
        assert_eq!(manifest.tasks[0].name, "build");
    }

    #[test]
    fn parses_json_manifest() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(
            file,
            r#"{{"tasks": [{{"name": "build", "commands": ["cargo build"]}}]}}"#
        )
        .unwrap();
        let manifest = load(file.path()).unwrap();
        assert_eq!(manifest.tasks.len(), 1);
    }

    #[test]
    fn converts_into_declared_tasks() {
        let manifest = Manifest {
            tasks: vec![ManifestTask {
                name: "a".to_string(),
                commands: vec!["true".to_string()],
                depends: vec![],
                targets: vec!["out".to_string()],
                route: None,
            }],
        };
        let declared = into_declared_tasks(manifest);
        assert_eq!(declared.len(), 1);
        assert_eq!(declared[0].targets, vec!["out".to_string()]);
    }
}

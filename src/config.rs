//! Engine tunables and workspace file loading.

use crate::collection::{Collection, CollectionError, CollectionItem};
use crate::executor::DEFAULT_TIMEOUT_SECS;
use crate::model::Environment;
use crate::script::ScriptBudget;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub script: ScriptBudget,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            script: ScriptBudget::default(),
        }
    }
}

/// A collection as written in a workspace file: nested folders and
/// requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub items: Vec<CollectionItem>,
}

impl CollectionFile {
    /// Convert the nested items into an arena.
    ///
    /// A missing id is generated.
    pub fn to_collection(&self) -> Result<Collection, CollectionError> {
        let id = self
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Collection::from_items(id, self.name.clone(), &self.items)
    }

    fn matches(&self, key: &str) -> bool {
        self.name == key || self.id.as_deref() == Some(key)
    }
}

/// Collections, environments and engine settings read from disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(default)]
    pub collections: Vec<CollectionFile>,
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub config: EngineConfig,
}

impl Workspace {
    /// Parse a workspace document. JSON is tried for `.json` files,
    /// YAML otherwise.
    pub fn parse(content: &str, json: bool) -> Result<Self> {
        if json {
            serde_json::from_str(content).context("Failed to parse workspace JSON")
        } else {
            serde_yaml::from_str(content).context("Failed to parse workspace YAML")
        }
    }

    /// Append another workspace. Non-default settings of the later file
    /// win.
    pub fn merge(&mut self, other: Workspace) {
        self.collections.extend(other.collections);
        self.environments.extend(other.environments);
        if other.config != EngineConfig::default() {
            self.config = other.config;
        }
    }

    /// Collection whose name or id equals `key`.
    pub fn find_collection(&self, key: &str) -> Option<&CollectionFile> {
        self.collections.iter().find(|c| c.matches(key))
    }

    /// Environment whose name or id equals `key`.
    pub fn find_environment(&self, key: &str) -> Option<&Environment> {
        self.environments
            .iter()
            .find(|e| e.name == key || e.id == key)
    }
}

/// Loads workspace files from a set of paths.
#[derive(Debug, Default)]
pub struct WorkspaceLoader {
    pub paths: Vec<PathBuf>,
}

impl WorkspaceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load one workspace file.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<Workspace> {
        let path = path.as_ref();
        info!("Loading workspace from {}", path.display());

        let content = fs::read_to_string(path)
            .context(format!("Failed to read workspace file: {}", path.display()))?;
        let workspace = Workspace::parse(&content, is_json(path))
            .context(format!("Invalid workspace file: {}", path.display()))?;

        debug!(
            collections = workspace.collections.len(),
            environments = workspace.environments.len(),
            "workspace file loaded"
        );
        Ok(workspace)
    }

    /// Load and merge every workspace file directly inside `dir`, in file
    /// name order. Files that fail to parse are skipped with a warning.
    pub fn load_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Workspace> {
        let dir = dir.as_ref();
        info!("Loading workspace files from directory: {}", dir.display());

        let mut files = Vec::new();
        for entry in fs::read_dir(dir)
            .context(format!("Failed to read directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && is_workspace_file(&path) {
                files.push(path);
            }
        }
        files.sort();

        let mut workspace = Workspace::default();
        for path in files {
            match self.load_file(&path) {
                Ok(loaded) => workspace.merge(loaded),
                Err(err) => warn!("Skipping {}: {:#}", path.display(), err),
            }
        }
        Ok(workspace)
    }

    /// Load every configured path, file or directory.
    pub fn load(&self) -> Result<Workspace> {
        let mut workspace = Workspace::default();
        for path in &self.paths {
            let loaded = if path.is_dir() {
                self.load_dir(path)?
            } else {
                self.load_file(path)?
            };
            workspace.merge(loaded);
        }
        info!(
            "Loaded {} collections and {} environments",
            workspace.collections.len(),
            workspace.environments.len()
        );
        Ok(workspace)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// `.yaml`, `.yml` or `.json`.
fn is_workspace_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HttpMethod, RequestBody};

    const WORKSPACE_YAML: &str = r#"
collections:
  - id: api
    name: API
    items:
      - name: Auth
        items:
          - name: Login
            method: POST
            url: "{{base}}/login"
            body:
              contentType: json
              content: '{"user": "{{user}}"}'
      - name: List users
        url: "{{base}}/users"
        testScript: "test('ok', () => expect(response.status).to.equal(200))"
environments:
  - name: dev
    variables:
      - key: base
        value: http://localhost:8080
      - key: user
        value: alice
config:
  timeoutSecs: 5
"#;

    fn tempdir_with_files(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    #[test]
    fn test_workspace_file_extensions() {
        assert!(is_workspace_file(Path::new("ws.yaml")));
        assert!(is_workspace_file(Path::new("ws.yml")));
        assert!(is_workspace_file(Path::new("dir/ws.json")));
        assert!(!is_workspace_file(Path::new("notes.md")));
        assert!(!is_workspace_file(Path::new("no_ext")));
    }

    #[test]
    fn test_engine_config_defaults() {
        let config: EngineConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.script.max_steps, 100_000);
    }

    #[test]
    fn test_load_yaml_workspace() {
        let dir = tempdir_with_files(&[("ws.yaml", WORKSPACE_YAML)]);
        let workspace = WorkspaceLoader::new()
            .load_file(dir.path().join("ws.yaml"))
            .unwrap();

        assert_eq!(workspace.config.timeout_secs, 5);
        let env = workspace.find_environment("dev").unwrap();
        assert_eq!(env.lookup("user"), Some("alice"));

        let file = workspace.find_collection("api").unwrap();
        assert_eq!(workspace.find_collection("API"), Some(file));
        let collection = file.to_collection().unwrap();
        assert_eq!(collection.id, "api");

        let requests = collection.flatten_requests();
        let names: Vec<&str> = requests.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Login", "List users"]);
        assert_eq!(requests[0].method, HttpMethod::Post);
        assert!(matches!(requests[0].body, RequestBody::Json(_)));
        assert_eq!(requests[1].method, HttpMethod::Get);
    }

    #[test]
    fn test_load_dir_merges_and_skips_invalid() {
        let dir = tempdir_with_files(&[
            ("a.yaml", WORKSPACE_YAML),
            (
                "b.json",
                r#"{"environments": [{"id": "e2", "name": "prod", "variables": []}]}"#,
            ),
            ("c.yml", "collections: [not, valid"),
            ("d.md", "# ignored"),
        ]);

        let mut loader = WorkspaceLoader::new();
        loader.add_path(dir.path());
        let workspace = loader.load().unwrap();

        assert_eq!(workspace.collections.len(), 1);
        assert_eq!(workspace.environments.len(), 2);
        assert_eq!(workspace.config.timeout_secs, 5);
        assert!(workspace.find_environment("e2").is_some());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = WorkspaceLoader::new()
            .load_file("/definitely/not/here.yaml")
            .unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read workspace file"));
    }
}

//! Manifest discovery and parsing: walks a working copy for YAML files and
//! decodes each into zero or more `Manifest`s, tolerating individual
//! malformed documents rather than failing the whole load.

use std::path::{Path, PathBuf};

use serde::Deserialize as _;
use serde_yaml::Value;
use walkdir::WalkDir;

/// A single Kubernetes object read from a manifest file in Git.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub source_path: PathBuf,
    pub body: Value,
}

impl Manifest {
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.kind,
            self.namespace.as_deref().unwrap_or(""),
            self.name
        )
    }

    /// Fills in `namespace` (and `body.metadata.namespace`) with `default`
    /// when the manifest didn't specify one, mirroring the original
    /// engine's `m.Object.SetNamespace(e.namespace)`. Most manifests in a
    /// Git repository omit `metadata.namespace` and rely on the
    /// controller's target namespace, so this must happen before the
    /// manifest is diffed or applied.
    pub fn set_default_namespace(&mut self, default: &str) {
        if self.namespace.is_some() {
            return;
        }
        self.namespace = Some(default.to_owned());
        if let Some(metadata) = self
            .body
            .as_mapping_mut()
            .and_then(|m| m.get_mut("metadata"))
            .and_then(|m| m.as_mapping_mut())
        {
            metadata.insert(
                Value::String("namespace".to_owned()),
                Value::String(default.to_owned()),
            );
        }
    }
}

/// Recursively walks `dir` for `.yaml`/`.yml` files and returns every
/// complete manifest found. Files that fail to read or parse, and
/// individual documents missing `kind`/`apiVersion`/`metadata.name`, are
/// skipped with a warning rather than aborting the whole load.
pub fn load_dir(dir: &Path) -> Vec<Manifest> {
    let mut manifests = Vec::new();

    for entry in WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if !is_yaml {
            continue;
        }

        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(source) => {
                tracing::warn!(path = %path.display(), %source, "failed to read manifest file");
                continue;
            }
        };

        for document in serde_yaml::Deserializer::from_str(&contents) {
            let value = match Value::deserialize(document) {
                Ok(v) => v,
                Err(source) => {
                    tracing::warn!(path = %path.display(), %source, "failed to parse manifest document");
                    continue;
                }
            };
            match manifest_from_value(value, path) {
                Some(m) => manifests.push(m),
                None => {
                    tracing::warn!(path = %path.display(), "skipping document missing kind/apiVersion/metadata.name");
                }
            }
        }
    }

    manifests
}

fn manifest_from_value(value: Value, path: &Path) -> Option<Manifest> {
    if value.is_null() {
        return None;
    }
    let kind = non_empty_str(&value, &["kind"])?;
    let api_version = non_empty_str(&value, &["apiVersion"])?;
    let name = non_empty_str(&value, &["metadata", "name"])?;
    let namespace = non_empty_str(&value, &["metadata", "namespace"]);

    Some(Manifest {
        api_version,
        kind,
        name,
        namespace,
        source_path: path.to_path_buf(),
        body: value,
    })
}

fn non_empty_str(value: &Value, path: &[&str]) -> Option<String> {
    let mut cur = value;
    for segment in path {
        cur = cur.as_mapping()?.get(Value::String((*segment).to_owned()))?;
    }
    let s = cur.as_str()?;
    if s.is_empty() {
        None
    } else {
        Some(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn loads_multi_document_file() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "app.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n  namespace: demo\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: b\n",
        );
        let manifests = load_dir(dir.path());
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].kind, "ConfigMap");
        assert_eq!(manifests[0].namespace.as_deref(), Some("demo"));
        assert_eq!(manifests[1].kind, "Deployment");
        assert_eq!(manifests[1].namespace, None);
    }

    #[test]
    fn skips_incomplete_documents() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "broken.yaml",
            "apiVersion: v1\nkind: ConfigMap\n---\nfoo: bar\n",
        );
        let manifests = load_dir(dir.path());
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].kind, "ConfigMap");
    }

    #[test]
    fn ignores_non_yaml_files() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "README.md", "not yaml");
        let manifests = load_dir(dir.path());
        assert!(manifests.is_empty());
    }

    #[test]
    fn walks_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "nested/dir/app.yml",
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: svc\n",
        );
        let manifests = load_dir(dir.path());
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].kind, "Service");
    }

    #[test]
    fn key_combines_kind_namespace_name() {
        let m = Manifest {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            name: "a".into(),
            namespace: Some("demo".into()),
            source_path: PathBuf::from("a.yaml"),
            body: Value::Null,
        };
        assert_eq!(m.key(), "ConfigMap/demo/a");
    }

    #[test]
    fn set_default_namespace_fills_in_missing_namespace() {
        let mut m = Manifest {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            name: "a".into(),
            namespace: None,
            source_path: PathBuf::from("a.yaml"),
            body: serde_yaml::from_str("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n").unwrap(),
        };
        m.set_default_namespace("demo");
        assert_eq!(m.namespace.as_deref(), Some("demo"));
        assert_eq!(
            m.body["metadata"]["namespace"].as_str(),
            Some("demo")
        );
    }

    #[test]
    fn set_default_namespace_leaves_explicit_namespace_alone() {
        let mut m = Manifest {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            name: "a".into(),
            namespace: Some("explicit".into()),
            source_path: PathBuf::from("a.yaml"),
            body: serde_yaml::from_str(
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n  namespace: explicit\n",
            )
            .unwrap(),
        };
        m.set_default_namespace("demo");
        assert_eq!(m.namespace.as_deref(), Some("explicit"));
    }
}

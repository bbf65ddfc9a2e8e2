//! Artifact store: a text/byte/JSON writer jailed to one root directory.

use crate::{
    error::{Result, SpryError},
    utils,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    path::{Component, Path, PathBuf},
};

/// Options for [`ArtifactStore::write_json`].
#[derive(Clone, Copy, Default)]
pub struct JsonWriteOptions<'a> {
    /// Format with 2-space indentation.
    pub pretty: bool,
    /// Drops any field whose dotted path matches; applied before writing.
    pub omit: Option<&'a dyn Fn(&str) -> bool>,
}

impl<'a> JsonWriteOptions<'a> {
    pub fn pretty() -> Self {
        Self { pretty: true, omit: None }
    }

    pub fn with_omit(mut self, omit: &'a dyn Fn(&str) -> bool) -> Self {
        self.omit = Some(omit);
        self
    }
}

/// Writes artifacts under one absolute root. Relative input only; any
/// normalized path escaping the root is rejected. Parent directories are
/// created on demand.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `rel` against the root, rejecting absolute paths and
    /// escapes.
    fn target(&self, rel: &Path) -> Result<PathBuf> {
        if rel.is_absolute() {
            return Err(SpryError::PathEscape {
                root: self.root.clone(),
                path: rel.to_path_buf(),
            });
        }
        let normalized = utils::normalize_path(rel);
        if matches!(normalized.components().next(), Some(Component::ParentDir) | None) {
            return Err(SpryError::PathEscape { root: self.root.clone(), path: normalized });
        }
        Ok(self.root.join(normalized))
    }

    pub fn write_bytes(&self, rel: impl AsRef<Path>, bytes: &[u8]) -> Result<PathBuf> {
        let target = self.target(rel.as_ref())?;
        utils::create_parent_dir_all(&target)?;
        fs::write(&target, bytes).map_err(|err| SpryError::io(err, &target))?;
        trace!(path = %target.display(), bytes = bytes.len(), "wrote artifact");
        Ok(target)
    }

    pub fn write_text(&self, rel: impl AsRef<Path>, text: &str) -> Result<PathBuf> {
        self.write_bytes(rel, text.as_bytes())
    }

    /// Serializes `value` and writes it, honoring `opts`.
    pub fn write_json<T: Serialize>(
        &self,
        rel: impl AsRef<Path>,
        value: &T,
        opts: JsonWriteOptions<'_>,
    ) -> Result<PathBuf> {
        let mut json = serde_json::to_value(value)?;
        if let Some(omit) = opts.omit {
            drop_matching_paths(&mut json, "", omit);
        }
        let rendered = if opts.pretty {
            serde_json::to_string_pretty(&json)?
        } else {
            serde_json::to_string(&json)?
        };
        self.write_text(rel, &rendered)
    }

    /// Like [`Self::write_json`], after validating that the value conforms
    /// to the schema type `S`.
    pub fn write_json_checked<T: Serialize, S: DeserializeOwned>(
        &self,
        rel: impl AsRef<Path>,
        value: &T,
        opts: JsonWriteOptions<'_>,
    ) -> Result<PathBuf> {
        let json = serde_json::to_value(value)?;
        let _schema_checked: S = serde_json::from_value(json.clone())?;
        self.write_json(rel, &json, opts)
    }
}

/// Recursively removes object fields whose dotted path matches `omit`.
fn drop_matching_paths(value: &mut serde_json::Value, prefix: &str, omit: &dyn Fn(&str) -> bool) {
    match value {
        serde_json::Value::Object(map) => {
            let keys: Vec<String> = map.keys().cloned().collect();
            for key in keys {
                let path = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
                if omit(&path) {
                    map.remove(&key);
                } else if let Some(child) = map.get_mut(&key) {
                    drop_matching_paths(child, &path, omit);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                drop_matching_paths(item, prefix, omit);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rejects_absolute_and_escaping_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        assert!(matches!(
            store.write_text("/etc/oops", "x").unwrap_err(),
            SpryError::PathEscape { .. }
        ));
        assert!(matches!(
            store.write_text("../outside.txt", "x").unwrap_err(),
            SpryError::PathEscape { .. }
        ));
        // dot segments that stay inside are fine
        store.write_text("a/../b.txt", "x").unwrap();
        assert!(tmp.path().join("b.txt").is_file());
    }

    #[test]
    fn creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let written = store.write_text("entry/console/about.sql.auto.json", "{}").unwrap();
        assert!(written.is_file());
    }

    #[test]
    fn json_pretty_and_omission() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let value = serde_json::json!({"keep": 1, "drop": {"inner": 2}, "nested": {"drop": 3}});
        let omit = |path: &str| path == "drop" || path == "nested.drop";
        store
            .write_json("out.json", &value, JsonWriteOptions::pretty().with_omit(&omit))
            .unwrap();
        let text = std::fs::read_to_string(tmp.path().join("out.json")).unwrap();
        assert!(text.contains("  \"keep\": 1"));
        let back: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, serde_json::json!({"keep": 1, "nested": {}}));
    }

    #[test]
    fn checked_write_validates_shape() {
        #[derive(serde::Deserialize)]
        #[allow(dead_code)]
        struct Shape {
            name: String,
        }
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let good = serde_json::json!({"name": "x"});
        store
            .write_json_checked::<_, Shape>("good.json", &good, JsonWriteOptions::default())
            .unwrap();
        let bad = serde_json::json!({"name": 7});
        assert!(store
            .write_json_checked::<_, Shape>("bad.json", &bad, JsonWriteOptions::default())
            .is_err());
    }
}

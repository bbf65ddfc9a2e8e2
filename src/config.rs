//! Project paths configuration: the mapping between the module home, the
//! source root, web paths and the shared-library symlink.

use crate::{
    error::{Result, SpryError},
    utils,
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Name of the directory under `src/` owned by the build.
pub const SPRY_D: &str = "spry.d";

/// Name of the auto-distribution directory under [`SPRY_D`]; recreated on
/// each orchestration run and safe to delete.
pub const SPRY_D_AUTO: &str = "auto";

/// Where to find all files considered part of the project, and how their
/// identities are expressed.
///
/// There are four path kinds:
/// - project fs paths, rooted at the module home,
/// - project src fs paths, rooted at `<home>/src`,
/// - web paths, which are src-relative with no leading `src/`,
/// - the shared library, a symlink under `src/` pointing at a library root
///   that may live anywhere on the machine.
///
/// Paths under the resolved library target are re-expressed as
/// `src/<symlinkName>/<rest>` so identifiers stay stable across machines.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPathsConfig {
    /// Project root (the module home).
    pub root: PathBuf,
    /// Path to the source directory, `<root>/src`.
    pub src: PathBuf,
    /// Policy-controlled build outputs, `<root>/src/spry.d`.
    pub spryd: PathBuf,
    /// Auto-generated distribution artifacts, `<root>/src/spry.d/auto`.
    pub spryd_auto: PathBuf,
    /// The shared library symlink, `<root>/src/<symlinkName>`.
    pub lib_symlink: PathBuf,
    /// Basename of the shared library symlink.
    pub lib_symlink_name: String,
    /// Canonical target of the shared library symlink, if it resolves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lib_target: Option<PathBuf>,
}

impl ProjectPathsConfig {
    pub fn builder() -> ProjectPathsConfigBuilder {
        ProjectPathsConfigBuilder::default()
    }

    /// Shortcut for `ProjectPathsConfig::builder().root(root).build()`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::builder().root(root).build()
    }

    /// The shared library directory to read from: the symlink target when it
    /// resolves, the symlink path otherwise.
    pub fn lib_dir(&self) -> &Path {
        self.lib_target.as_deref().unwrap_or(&self.lib_symlink)
    }

    /// Converts `path` into its project-relative form.
    ///
    /// A path under the resolved library target is rewritten as
    /// `src/<symlinkName>/<rest>`; anything else is stripped of the project
    /// root. Paths outside the project are returned unchanged.
    pub fn relativize<'a>(&self, path: &'a Path) -> PathBuf {
        if let Some(target) = &self.lib_target {
            if let Ok(rest) = path.strip_prefix(target) {
                return Path::new("src").join(&self.lib_symlink_name).join(rest);
            }
        }
        utils::strip_prefix(path, &self.root).to_path_buf()
    }

    /// The web path of `path`: its src-relative, `/`-separated form with no
    /// leading `src/`.
    ///
    /// Returns `None` for paths outside the source root.
    pub fn web_path(&self, path: &Path) -> Option<String> {
        let rel = self.relativize(path);
        let rel = rel.strip_prefix("src").ok()?;
        Some(utils::slash_path(rel))
    }

    /// Whether `path` is inside the build-owned auto distribution directory.
    pub fn is_auto_owned(&self, path: &Path) -> bool {
        path.starts_with(&self.spryd_auto)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProjectPathsConfigBuilder {
    root: Option<PathBuf>,
    lib_symlink_name: Option<String>,
}

impl ProjectPathsConfigBuilder {
    /// The module home. Must be an existing directory.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Basename of the shared-library symlink under `src/`, `spry` by
    /// default.
    pub fn lib_symlink_name(mut self, name: impl Into<String>) -> Self {
        self.lib_symlink_name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<ProjectPathsConfig> {
        let root = self.root.unwrap_or_else(|| PathBuf::from("."));
        if !root.is_dir() {
            return Err(SpryError::InvalidRoot(root));
        }
        let root = utils::canonicalize(&root)?;
        let src = root.join("src");
        let spryd = src.join(SPRY_D);
        let spryd_auto = spryd.join(SPRY_D_AUTO);
        let lib_symlink_name = self.lib_symlink_name.unwrap_or_else(|| "spry".to_string());
        let lib_symlink = src.join(&lib_symlink_name);
        let lib_target = fs::read_link(&lib_symlink)
            .ok()
            .map(|target| if target.is_absolute() { target } else { src.join(target) })
            .and_then(|target| utils::canonicalize(target).ok());
        Ok(ProjectPathsConfig {
            root,
            src,
            spryd,
            spryd_auto,
            lib_symlink,
            lib_symlink_name,
            lib_target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_root() {
        let err = ProjectPathsConfig::new("/definitely/not/a/dir").unwrap_err();
        assert!(matches!(err, SpryError::InvalidRoot(_)));
    }

    #[test]
    fn web_path_strips_src() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("src/console")).unwrap();
        let paths = ProjectPathsConfig::new(tmp.path()).unwrap();
        let abs = paths.src.join("console/about.sql");
        assert_eq!(paths.web_path(&abs).as_deref(), Some("console/about.sql"));
        assert_eq!(paths.web_path(&paths.root.join("justfile")), None);
    }

    #[cfg(unix)]
    #[test]
    fn library_paths_rewrite_through_symlink() {
        let tmp = tempfile::tempdir().unwrap();
        let lib = tmp.path().join("lib-home");
        fs::create_dir_all(lib.join("console")).unwrap();
        let root = tmp.path().join("project");
        fs::create_dir_all(root.join("src")).unwrap();
        std::os::unix::fs::symlink(&lib, root.join("src/spry")).unwrap();

        let paths = ProjectPathsConfig::new(&root).unwrap();
        let target = paths.lib_target.clone().expect("symlink resolves");
        let rel = paths.relativize(&target.join("console/info.sql"));
        assert_eq!(rel, PathBuf::from("src/spry/console/info.sql"));
        assert_eq!(
            paths.web_path(&target.join("console/info.sql")).as_deref(),
            Some("spry/console/info.sql")
        );
    }
}

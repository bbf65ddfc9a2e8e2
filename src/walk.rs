//! Filesystem walker yielding canonicalized file encounters from one or more
//! roots, with cross-root deduplication.

use crate::{
    error::{Result, SpryError},
    utils,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// Per-root traversal options.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkOptions {
    /// Only yield files whose extension is in this set. `None` yields all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<String>>,
    pub include_files: bool,
    pub include_dirs: bool,
    pub include_symlinks: bool,
    pub follow_symlinks: bool,
    /// Canonicalize yielded entry paths.
    pub canonicalize: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            extensions: None,
            include_files: true,
            include_dirs: false,
            include_symlinks: true,
            follow_symlinks: true,
            canonicalize: false,
        }
    }
}

impl WalkOptions {
    pub fn with_extensions<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: Some(extensions.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    fn matches_extension(&self, path: &Path) -> bool {
        match &self.extensions {
            None => true,
            Some(exts) => path
                .extension()
                .map(|ext| exts.iter().any(|e| ext == e.as_str()))
                .unwrap_or_default(),
        }
    }
}

/// One traversal root together with its options.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkRoot {
    pub root: PathBuf,
    pub options: WalkOptions,
}

impl WalkRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), options: WalkOptions::default() }
    }

    pub fn with_options(root: impl Into<PathBuf>, options: WalkOptions) -> Self {
        Self { root: root.into(), options }
    }
}

/// A single directory entry observed during traversal.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkEntry {
    pub path: PathBuf,
    pub is_file: bool,
    pub is_symlink: bool,
    /// Unix permission bits; `None` elsewhere.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// An entry paired with the root that produced it. Encounters are ephemeral
/// and consumed per pass.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkEncounter {
    pub origin: WalkRoot,
    pub entry: WalkEntry,
}

/// Walks one or more roots depth-first with entries sorted by name, and
/// deduplicates entries across roots by their realized path.
///
/// Traversals are fresh on every call; nothing is cached.
#[derive(Clone, Debug)]
pub struct Walker {
    roots: Vec<WalkRoot>,
}

impl Walker {
    pub fn new(roots: Vec<WalkRoot>) -> Self {
        Self { roots }
    }

    pub fn single(root: impl Into<PathBuf>, options: WalkOptions) -> Self {
        Self::new(vec![WalkRoot::with_options(root, options)])
    }

    /// Returns a lazy, deterministic stream of encounters.
    ///
    /// Fails with an I/O error naming the path when any root is missing.
    /// Unreadable entries and dangling symlinks are skipped without error.
    pub fn encounters(&self) -> Result<impl Iterator<Item = WalkEncounter> + '_> {
        for walk_root in &self.roots {
            if !walk_root.root.exists() {
                return Err(SpryError::io(
                    io::Error::new(io::ErrorKind::NotFound, "walk root does not exist"),
                    &walk_root.root,
                ));
            }
        }
        let mut seen = HashSet::new();
        let iter = self
            .roots
            .iter()
            .flat_map(walk_one_root)
            .filter(move |enc| seen.insert(realized(&enc.entry.path)));
        Ok(iter)
    }

    /// Collects [`Self::encounters`].
    pub fn collect_encounters(&self) -> Result<Vec<WalkEncounter>> {
        Ok(self.encounters()?.collect())
    }
}

/// Dedup key: the canonical path when resolvable, the entry path otherwise.
fn realized(path: &Path) -> PathBuf {
    utils::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn walk_one_root(walk_root: &WalkRoot) -> impl Iterator<Item = WalkEncounter> + '_ {
    let opts = &walk_root.options;
    WalkDir::new(&walk_root.root)
        .follow_links(opts.follow_symlinks)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let is_symlink = entry.path_is_symlink();
            let file_type = entry.file_type();
            let included = (file_type.is_file() && opts.include_files)
                || (file_type.is_dir() && opts.include_dirs)
                || (is_symlink && opts.include_symlinks);
            if !included {
                trace!(path = %entry.path().display(), "skipping excluded entry");
                return None;
            }
            if file_type.is_file() && !opts.matches_extension(entry.path()) {
                return None;
            }
            let path = if opts.canonicalize {
                utils::canonicalize(entry.path()).ok()?
            } else {
                entry.path().to_path_buf()
            };
            let mode = entry_mode(&entry);
            Some(WalkEncounter {
                origin: walk_root.clone(),
                entry: WalkEntry { path, is_file: file_type.is_file(), is_symlink, mode },
            })
        })
}

#[cfg(unix)]
fn entry_mode(entry: &walkdir::DirEntry) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    entry.metadata().ok().map(|m| m.permissions().mode())
}

#[cfg(not(unix))]
fn entry_mode(_entry: &walkdir::DirEntry) -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn missing_root_is_fatal() {
        let walker = Walker::single("/no/such/root", WalkOptions::default());
        let err = walker.collect_encounters().unwrap_err();
        assert!(matches!(err, SpryError::Io(_)));
    }

    #[test]
    fn deterministic_name_sorted_order() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("b.sql"));
        touch(&tmp.path().join("a.sql"));
        touch(&tmp.path().join("sub/c.sql"));

        let walker = Walker::single(tmp.path(), WalkOptions::with_extensions(["sql"]));
        let names: Vec<_> = walker
            .collect_encounters()
            .unwrap()
            .into_iter()
            .map(|e| e.entry.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.sql", "b.sql", "c.sql"]);
    }

    #[test]
    fn extension_filter_applies_to_files_only() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("keep.sql"));
        touch(&tmp.path().join("drop.txt"));

        let walker = Walker::single(tmp.path(), WalkOptions::with_extensions(["sql"]));
        let encounters = walker.collect_encounters().unwrap();
        assert_eq!(encounters.len(), 1);
        assert!(encounters[0].entry.is_file);
    }

    #[test]
    fn duplicate_roots_deduplicate() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("one.sql"));

        let walker = Walker::new(vec![
            WalkRoot::with_options(tmp.path(), WalkOptions::with_extensions(["sql"])),
            WalkRoot::with_options(tmp.path(), WalkOptions::with_extensions(["sql"])),
        ]);
        assert_eq!(walker.collect_encounters().unwrap().len(), 1);
    }

    #[test]
    fn dirs_are_included_on_request() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("sub/a.sql"));

        let options = WalkOptions { include_dirs: true, ..Default::default() };
        let walker = Walker::single(tmp.path(), options);
        let encounters = walker.collect_encounters().unwrap();
        assert!(encounters.iter().any(|e| !e.entry.is_file && e.entry.path.ends_with("sub")));
    }

    #[cfg(unix)]
    #[test]
    fn canonicalize_resolves_through_symlinked_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("real/a.sql"));
        std::os::unix::fs::symlink(tmp.path().join("real"), tmp.path().join("alias")).unwrap();

        let options =
            WalkOptions { canonicalize: true, ..WalkOptions::with_extensions(["sql"]) };
        let walker = Walker::single(tmp.path().join("alias"), options);
        let encounters = walker.collect_encounters().unwrap();
        assert_eq!(encounters.len(), 1);
        // the yielded path is physical, not the alias
        assert!(!encounters[0].entry.path.to_string_lossy().contains("alias"));
    }

    #[cfg(unix)]
    #[test]
    fn encounters_carry_unix_modes() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("plain.sql"));

        let walker = Walker::single(tmp.path(), WalkOptions::default());
        let encounters = walker.collect_encounters().unwrap();
        assert!(encounters[0].entry.mode.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlinks_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("real.sql"));
        std::os::unix::fs::symlink(tmp.path().join("gone"), tmp.path().join("dangling")).unwrap();

        let walker = Walker::single(tmp.path(), WalkOptions::default());
        let encounters = walker.collect_encounters().unwrap();
        assert!(encounters.iter().all(|e| e.entry.path.file_name().unwrap() != "dangling"));
    }
}

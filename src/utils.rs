//! Utility functions

use crate::error::{SpryError, SpryIoError};
use cfg_if::cfg_if;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    path::{Component, Path, PathBuf},
};
use walkdir::WalkDir;

/// Extensions of files served as SQLPage content.
pub const SQLPAGE_EXTENSIONS: &[&str] = &["sql", "json"];

/// Extensions treated as executables on filesystems without a POSIX
/// executable bit.
pub const EXECUTABLE_EXTENSIONS: &[&str] = &["exe", "cmd", "bat", "com", "ps1"];

/// Returns an iterator that yields all files under the given root (or the
/// `root` itself, if it is a file) whose extension is in `extensions`.
///
/// This also follows symlinks.
pub fn source_files_iter<'a>(
    root: &Path,
    extensions: &'a [&'a str],
) -> impl Iterator<Item = PathBuf> + 'a {
    WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path().extension().map(|ext| extensions.iter().any(|e| ext == *e)).unwrap_or_default()
        })
        .map(|e| e.path().into())
}

/// Same as [`source_files_iter`], collected.
pub fn source_files(root: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    source_files_iter(root, extensions).collect()
}

/// Canonicalize the path, platform-agnostic.
///
/// On windows this will ensure the path only consists of `/` separators.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf, SpryIoError> {
    let path = path.as_ref();
    let res = dunce::canonicalize(path);
    #[cfg(windows)]
    let res = res.map(|p| {
        use path_slash::PathBufExt;
        PathBuf::from(p.to_slash_lossy().as_ref())
    });
    res.map_err(|err| SpryIoError::new(err, path))
}

/// Returns the path in `/`-separated form.
pub fn slash_path(path: &Path) -> String {
    use path_slash::PathExt;
    path.to_slash_lossy().into_owned()
}

/// Strips `root` from `source` and returns the relative path.
pub fn strip_prefix<'a>(source: &'a Path, root: &Path) -> &'a Path {
    source.strip_prefix(root).unwrap_or(source)
}

/// Lexically cleans the given path: resolves `.` and `..` components and
/// collapses repeated separators without touching the filesystem.
///
/// A `..` with no preceding normal component is kept, so escape attempts
/// remain visible to callers that check for a leading parent component.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(..) => {
                out.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(..)) = out.last() {
                    out.pop();
                } else {
                    out.push(component);
                }
            }
        }
    }
    out.iter().collect()
}

/// Whether the entry at `path` is executable by the conventions of the host
/// filesystem: any `x` bit on POSIX, a well-known extension elsewhere.
///
/// Symlinks are resolved before the test.
pub fn is_executable(path: &Path) -> bool {
    cfg_if! {
        if #[cfg(unix)] {
            use std::os::unix::fs::PermissionsExt;
            fs::metadata(path).map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
        } else {
            fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
                && path
                    .extension()
                    .map(|ext| EXECUTABLE_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)))
                    .unwrap_or(false)
        }
    }
}

/// Creates the parent directory of `file` and all of its ancestors.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<(), SpryError> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            SpryError::msg(format!(
                "Failed to create artifact parent folder \"{}\": {}",
                parent.display(),
                err
            ))
        })?;
    }
    Ok(())
}

/// Reads the json file and deserializes it into the provided type.
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, SpryError> {
    let path = path.as_ref();
    let file = fs::File::open(path).map_err(|err| SpryError::io(err, path))?;
    let file = std::io::BufReader::new(file);
    let val: T = serde_json::from_reader(file)?;
    Ok(val)
}

/// Writes serializes the provided value to JSON and writes it to a file.
pub fn write_json_file<T: Serialize>(
    value: &T,
    path: impl AsRef<Path>,
) -> Result<(), SpryError> {
    let path = path.as_ref();
    let file = fs::File::create(path).map_err(|err| SpryError::io(err, path))?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer(writer, value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_resolves_dots() {
        assert_eq!(normalize_path(Path::new("a/./b/../c")), PathBuf::from("a/c"));
        assert_eq!(normalize_path(Path::new("a//b///c")), PathBuf::from("a/b/c"));
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_path(Path::new("x/../../y/./z/"));
        assert_eq!(normalize_path(&once), once);
    }

    #[test]
    fn normalize_keeps_leading_parent() {
        assert_eq!(normalize_path(Path::new("../escape")), PathBuf::from("../escape"));
    }
}

//! Deploy-SQL emitter: head DDL seeds, per-file upsert statements, tail
//! seeds, as one deterministic byte stream.

use crate::error::{Result, SpryError};
use itertools::Itertools;
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// Default glob for head seed files under the shared library directory.
pub const DEFAULT_HEAD_GLOBS: &[&str] = &["head*.sql"];
/// Default glob for tail seed files under the shared library directory.
pub const DEFAULT_TAIL_GLOBS: &[&str] = &["tail*.sql"];

/// One SQLPage content row: the web path and the file providing its bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SqlPageFile {
    pub web_path: String,
    pub abs_path: PathBuf,
}

/// Doubles single quotes; the only escaping applied to emitted literals.
pub fn escape_sql_literal(text: &str) -> String {
    text.replace('\'', "''")
}

/// Emits the deployment stream for a set of content files.
#[derive(Clone, Debug)]
pub struct DeployEmitter<'a> {
    lib_dir: &'a Path,
    head_globs: Vec<String>,
    tail_globs: Vec<String>,
}

impl<'a> DeployEmitter<'a> {
    /// An emitter reading its seed files from `lib_dir`.
    pub fn new(lib_dir: &'a Path) -> Self {
        Self {
            lib_dir,
            head_globs: DEFAULT_HEAD_GLOBS.iter().map(|s| s.to_string()).collect(),
            tail_globs: DEFAULT_TAIL_GLOBS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_head_globs<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.head_globs = globs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tail_globs<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tail_globs = globs.into_iter().map(Into::into).collect();
        self
    }

    fn seed_files(&self, globs: &[String]) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for pattern in globs {
            let full = self.lib_dir.join(pattern);
            let full = full.to_string_lossy().into_owned();
            for entry in glob::glob(&full)? {
                files.push(entry?);
            }
        }
        Ok(files.into_iter().sorted().dedup().collect())
    }

    /// Head seed files, sorted by name.
    pub fn head_files(&self) -> Result<Vec<PathBuf>> {
        self.seed_files(&self.head_globs)
    }

    /// Tail seed files, sorted by name.
    pub fn tail_files(&self) -> Result<Vec<PathBuf>> {
        self.seed_files(&self.tail_globs)
    }

    /// Writes the deployment stream: head seeds, one `delete` + `insert`
    /// pair per file sorted by web path, tail seeds. Contents are embedded
    /// without newline normalization.
    pub fn emit<W: io::Write>(&self, out: &mut W, files: &[SqlPageFile]) -> Result<()> {
        let write_err = |err: io::Error| SpryError::msg(format!("deploy stream: {err}"));

        writeln!(out, "-- head SQL begin").map_err(write_err)?;
        for seed in self.head_files()? {
            let contents =
                fs::read_to_string(&seed).map_err(|err| SpryError::io(err, &seed))?;
            out.write_all(contents.as_bytes()).map_err(write_err)?;
        }
        writeln!(out, "-- head SQL end").map_err(write_err)?;

        writeln!(out, "-- sqlpage_files rows --").map_err(write_err)?;
        for file in files.iter().sorted_by(|a, b| a.web_path.cmp(&b.web_path)) {
            let contents = fs::read_to_string(&file.abs_path)
                .map_err(|err| SpryError::io(err, &file.abs_path))?;
            let web = escape_sql_literal(&file.web_path);
            writeln!(out, "delete from \"sqlpage_files\" where \"path\" = '{web}';")
                .map_err(write_err)?;
            writeln!(
                out,
                "insert into \"sqlpage_files\" (\"path\",\"contents\") values ('{web}','{}');",
                escape_sql_literal(&contents)
            )
            .map_err(write_err)?;
        }

        writeln!(out, "-- tail SQL begin").map_err(write_err)?;
        for seed in self.tail_files()? {
            let contents =
                fs::read_to_string(&seed).map_err(|err| SpryError::io(err, &seed))?;
            out.write_all(contents.as_bytes()).map_err(write_err)?;
        }
        writeln!(out, "-- tail SQL end").map_err(write_err)?;
        Ok(())
    }

    /// [`Self::emit`] into a string.
    pub fn emit_to_string(&self, files: &[SqlPageFile]) -> Result<String> {
        let mut out = Vec::new();
        self.emit(&mut out, files)?;
        String::from_utf8(out).map_err(|_| SpryError::msg("deploy stream is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn escaping_doubles_single_quotes() {
        assert_eq!(escape_sql_literal("it's 'quoted'"), "it''s ''quoted''");
    }

    #[test]
    fn emits_head_rows_tail_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let lib = tmp.path().join("lib");
        std::fs::create_dir_all(&lib).unwrap();
        std::fs::write(lib.join("head-ddl.sql"), "create table t(x);\n").unwrap();
        std::fs::write(lib.join("tail-perms.sql"), "grant all;\n").unwrap();

        let b = tmp.path().join("b.sql");
        let a = tmp.path().join("a.sql");
        std::fs::write(&b, "SELECT 'b';\n").unwrap();
        std::fs::write(&a, "SELECT 'a';\n").unwrap();

        let emitter = DeployEmitter::new(&lib);
        // intentionally unsorted input
        let files = vec![
            SqlPageFile { web_path: "/b.sql".into(), abs_path: b },
            SqlPageFile { web_path: "/a.sql".into(), abs_path: a },
        ];
        let stream = emitter.emit_to_string(&files).unwrap();
        let expected = "-- head SQL begin\n\
                        create table t(x);\n\
                        -- head SQL end\n\
                        -- sqlpage_files rows --\n\
                        delete from \"sqlpage_files\" where \"path\" = '/a.sql';\n\
                        insert into \"sqlpage_files\" (\"path\",\"contents\") values ('/a.sql','SELECT ''a'';\n');\n\
                        delete from \"sqlpage_files\" where \"path\" = '/b.sql';\n\
                        insert into \"sqlpage_files\" (\"path\",\"contents\") values ('/b.sql','SELECT ''b'';\n');\n\
                        -- tail SQL begin\n\
                        grant all;\n\
                        -- tail SQL end\n";
        assert_eq!(stream, expected);

        // deterministic across runs
        assert_eq!(stream, emitter.emit_to_string(&files).unwrap());
    }

    #[test]
    fn seed_files_sort_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("head-20-tables.sql"), "t\n").unwrap();
        std::fs::write(tmp.path().join("head-10-pragma.sql"), "p\n").unwrap();
        std::fs::write(tmp.path().join("unrelated.sql"), "x\n").unwrap();

        let emitter = DeployEmitter::new(tmp.path());
        let heads = emitter.head_files().unwrap();
        let names: Vec<_> =
            heads.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect();
        assert_eq!(names, ["head-10-pragma.sql", "head-20-tables.sql"]);
        assert!(emitter.tail_files().unwrap().is_empty());
    }

    #[test]
    fn missing_seeds_are_just_empty_sections() {
        let tmp = tempfile::tempdir().unwrap();
        let emitter = DeployEmitter::new(tmp.path());
        let stream = emitter.emit_to_string(&[]).unwrap();
        assert!(stream.contains("-- head SQL begin\n-- head SQL end\n"));
    }
}

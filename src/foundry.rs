//! Foundry executor: discovers executable sources, classifies them by
//! filename convention, and invokes them with a contractual environment.

use crate::{
    annotation::{FoundryNature, ResourceAnn},
    cancel::CancelToken,
    config::ProjectPathsConfig,
    error::Result,
    lint::{FindingInput, LintRegistry, RULE_INVALID_FOUNDRY},
    utils,
    walk::WalkEncounter,
};
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
    time::Duration,
};

/// Workflow step a foundry is invoked in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStep {
    BeforeAnnCatalog,
    AfterAnnCatalog,
    DestroyClean,
}

impl WorkflowStep {
    /// The value handed to children via `FOUNDRY_WORKFLOW_STEP`.
    pub fn as_env(&self) -> &'static str {
        match self {
            Self::BeforeAnnCatalog => "BEFORE_ANN_CATALOG",
            Self::AfterAnnCatalog => "AFTER_ANN_CATALOG",
            Self::DestroyClean => "DESTROY_CLEAN",
        }
    }
}

/// A filename without auto-materialization: fewer than two dots.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainFileName {
    pub auto: bool,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extn: Option<String>,
}

/// A `<base>.<nature>.<runner>` filename; stdout is materialized to
/// `<dir>/<base>.auto.<nature>`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoFileName {
    pub auto: bool,
    pub file_name: String,
    pub base: String,
    pub nature: String,
    pub extn: String,
    /// Basename of the materialization target, `<base>.auto.<nature>`.
    pub basename: String,
    /// Absolute materialization target.
    pub path: PathBuf,
}

/// Classification of a foundry filename.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParsedFileName {
    Auto(AutoFileName),
    Plain(PlainFileName),
}

impl ParsedFileName {
    pub fn is_auto(&self) -> bool {
        matches!(self, Self::Auto(_))
    }

    pub fn auto(&self) -> Option<&AutoFileName> {
        match self {
            Self::Auto(auto) => Some(auto),
            Self::Plain(_) => None,
        }
    }
}

/// Splits the basename of `path` on `.`: the final segment is the runner
/// extension, the one before it the produced nature, everything earlier the
/// base. Fewer than two dots turns auto-materialization off.
pub fn parse_file_name(path: &Path) -> ParsedFileName {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
    let segments: Vec<&str> = file_name.split('.').collect();
    if segments.len() < 3 {
        return ParsedFileName::Plain(PlainFileName {
            auto: false,
            extn: segments.get(1).map(|s| s.to_string()),
            file_name,
        });
    }
    let extn = segments[segments.len() - 1].to_string();
    let nature = segments[segments.len() - 2].to_string();
    let base = segments[..segments.len() - 2].join(".");
    let basename = format!("{base}.auto.{nature}");
    let target = path.parent().unwrap_or_else(|| Path::new("")).join(&basename);
    ParsedFileName::Auto(AutoFileName {
        auto: true,
        file_name,
        base,
        nature,
        extn,
        basename,
        path: target,
    })
}

/// A discovered foundry: its walk encounter, its resource annotation (with
/// `nature == foundry`) and its parsed filename.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Foundry {
    #[serde(rename = "we")]
    pub encounter: WalkEncounter,
    pub ann: ResourceAnn,
    pub pfn: ParsedFileName,
}

impl Foundry {
    pub fn flags(&self) -> FoundryNature {
        self.ann.nature.foundry().copied().unwrap_or_default()
    }

    /// The absolute path of the executable.
    pub fn exe(&self) -> &Path {
        &self.encounter.entry.path
    }

    /// Whether this foundry participates in `step`.
    pub fn runs_in(&self, step: WorkflowStep) -> bool {
        let flags = self.flags();
        match step {
            WorkflowStep::BeforeAnnCatalog => flags.run_before_ann_catalog,
            WorkflowStep::AfterAnnCatalog => flags.run_after_ann_catalog,
            WorkflowStep::DestroyClean => flags.is_cleanable,
        }
    }
}

/// One finished invocation.
#[derive(Debug)]
pub struct FoundryRunOutcome {
    /// `None` when the spawn itself failed.
    pub output: Option<Output>,
    /// Where stdout was materialized, in auto mode on success.
    pub materialized: Option<PathBuf>,
}

impl FoundryRunOutcome {
    pub fn succeeded(&self) -> bool {
        self.output.as_ref().map(|o| o.status.success()).unwrap_or(false)
    }
}

/// Invokes foundries with the contractual `FOUNDRY_*` environment. Env
/// values are byte-identical between runs given identical inputs.
#[derive(Clone, Debug)]
pub struct FoundryRunner<'a> {
    pub paths: &'a ProjectPathsConfig,
    pub project_id: &'a str,
    /// Compact JSON handed to children via `FOUNDRY_CONTEXT_JSON`.
    pub context_json: String,
    pub target_sqlite_db: Option<PathBuf>,
    /// Kills a running child when the signal fires.
    pub cancel: Option<CancelToken>,
}

impl<'a> FoundryRunner<'a> {
    pub fn new(paths: &'a ProjectPathsConfig, project_id: &'a str, context_json: String) -> Self {
        Self { paths, project_id, context_json, target_sqlite_db: None, cancel: None }
    }

    pub fn with_target_sqlite_db(mut self, db: impl Into<PathBuf>) -> Self {
        self.target_sqlite_db = Some(db.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn command(&self, foundry: &Foundry, step: WorkflowStep) -> Result<Command> {
        let source_json = serde_json::to_string(foundry)?;
        let mut cmd = Command::new(foundry.exe());
        cmd.current_dir(&self.paths.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("FOUNDRY_PROJECT_HOME", &self.paths.root)
            .env("FOUNDRY_PROJECT_ID", self.project_id)
            .env("FOUNDRY_PROJECT_SRC_HOME", &self.paths.src)
            .env("FOUNDRY_PROJECT_SPRYD_HOME", &self.paths.spryd)
            .env("FOUNDRY_PROJECT_SPRYD_AUTO", &self.paths.spryd_auto)
            .env("FOUNDRY_SOURCE_JSON", source_json)
            .env("FOUNDRY_WORKFLOW_STEP", step.as_env())
            .env("FOUNDRY_CONTEXT_JSON", &self.context_json);
        match foundry.pfn.auto() {
            Some(auto) => {
                cmd.env("FOUNDRY_AUTO_MATERIALIZE", "TRUE")
                    .env("FOUNDRY_MATERIALIZE_BASENAME", &auto.basename)
                    .env("FOUNDRY_MATERIALIZE_PATH", &auto.path);
            }
            None => {
                cmd.env("FOUNDRY_AUTO_MATERIALIZE", "FALSE")
                    .env("FOUNDRY_MATERIALIZE_BASENAME", "")
                    .env("FOUNDRY_MATERIALIZE_PATH", "");
            }
        }
        if let Some(db) = &self.target_sqlite_db {
            cmd.env("FOUNDRY_TARGET_SQLITEDB", db);
        }
        Ok(cmd)
    }

    /// Spawns the foundry for `step` and captures its output. Failures are
    /// non-fatal: they are recorded in `lints` and the run proceeds. In auto
    /// mode, a successful run's stdout is written to the materialization
    /// target; otherwise the foundry is trusted to write its own outputs.
    pub fn run(
        &self,
        foundry: &Foundry,
        step: WorkflowStep,
        lints: &mut LintRegistry,
    ) -> Result<FoundryRunOutcome> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            trace!(exe = %foundry.exe().display(), "skipping foundry, run cancelled");
            return Ok(FoundryRunOutcome { output: None, materialized: None });
        }
        let cmd = self.command(foundry, step)?;
        debug!(?cmd, step = step.as_env(), "invoking foundry");
        let output = match capture(cmd, self.cancel.as_ref()) {
            Ok(output) => output,
            Err(err) => {
                lints.report(FindingInput {
                    rule: RULE_INVALID_FOUNDRY.into(),
                    code: "execution-failed".into(),
                    content: foundry.ann.rel_fs_path.clone(),
                    message: format!("failed to spawn: {err}"),
                    ..Default::default()
                });
                return Ok(FoundryRunOutcome { output: None, materialized: None });
            }
        };
        trace!(status = ?output.status, stdout = output.stdout.len(), "foundry finished");

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim();
            lints.report(FindingInput {
                rule: RULE_INVALID_FOUNDRY.into(),
                code: "execution-failed".into(),
                content: foundry.ann.rel_fs_path.clone(),
                message: if detail.is_empty() {
                    format!("exited with {}", output.status)
                } else {
                    format!("exited with {}: {detail}", output.status)
                },
                ..Default::default()
            });
            return Ok(FoundryRunOutcome { output: Some(output), materialized: None });
        }

        let mut materialized = None;
        if step != WorkflowStep::DestroyClean {
            if let Some(auto) = foundry.pfn.auto() {
                match utils::create_parent_dir_all(&auto.path)
                    .and_then(|_| {
                        fs::write(&auto.path, &output.stdout)
                            .map_err(|err| crate::error::SpryError::io(err, &auto.path))
                    }) {
                    Ok(()) => materialized = Some(auto.path.clone()),
                    Err(err) => {
                        lints.report(FindingInput {
                            rule: RULE_INVALID_FOUNDRY.into(),
                            code: "unable-to-materialize".into(),
                            content: foundry.ann.rel_fs_path.clone(),
                            message: err.to_string(),
                            ..Default::default()
                        });
                    }
                }
            }
        }
        Ok(FoundryRunOutcome { output: Some(output), materialized })
    }

    /// Removes what a foundry produced: auto-materialized outputs are
    /// deleted; a cleanable non-auto foundry is invoked once more in the
    /// `DESTROY_CLEAN` step with its output ignored.
    pub fn clean(&self, foundry: &Foundry, lints: &mut LintRegistry) -> Result<()> {
        if !foundry.flags().is_cleanable {
            return Ok(());
        }
        match foundry.pfn.auto() {
            Some(auto) => {
                if auto.path.exists() {
                    fs::remove_file(&auto.path)
                        .map_err(|err| crate::error::SpryError::io(err, &auto.path))?;
                    debug!(path = %auto.path.display(), "removed auto-materialized output");
                }
            }
            None => {
                let _ = self.run(foundry, WorkflowStep::DestroyClean, lints)?;
            }
        }
        Ok(())
    }
}

/// Captures the child's output. Without a cancel signal this is a plain
/// blocking wait; with one, the child is polled and killed when the signal
/// fires, while capture threads drain the pipes.
fn capture(mut cmd: Command, cancel: Option<&CancelToken>) -> io::Result<Output> {
    let Some(token) = cancel else { return cmd.output() };

    let mut child = cmd.spawn()?;
    // children reading stdin see EOF rather than a tty
    drop(child.stdin.take());
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || drain(stdout));
    let stderr_reader = std::thread::spawn(move || drain(stderr));

    let status = loop {
        if token.is_cancelled() {
            let _ = child.kill();
        }
        match child.try_wait()? {
            Some(status) => break status,
            None => std::thread::sleep(Duration::from_millis(20)),
        }
    };
    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();
    Ok(Output { status, stdout, stderr })
}

fn drain<R: Read>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn single_dot_filenames_are_not_auto() {
        let pfn = parse_file_name(Path::new("/p/src/foo.sh"));
        let ParsedFileName::Plain(plain) = pfn else { panic!("expected plain") };
        assert!(!plain.auto);
        assert_eq!(plain.file_name, "foo.sh");
        assert_eq!(plain.extn.as_deref(), Some("sh"));
    }

    #[test]
    fn dotless_filenames_are_not_auto() {
        let pfn = parse_file_name(Path::new("/p/src/generate"));
        assert!(!pfn.is_auto());
    }

    #[test]
    fn auto_target_is_base_auto_nature() {
        let pfn = parse_file_name(Path::new("/p/src/report.sql.py"));
        let auto = pfn.auto().expect("auto mode");
        assert_eq!(auto.base, "report");
        assert_eq!(auto.nature, "sql");
        assert_eq!(auto.extn, "py");
        assert_eq!(auto.basename, "report.auto.sql");
        assert_eq!(auto.path, PathBuf::from("/p/src/report.auto.sql"));
    }

    #[test]
    fn dotted_base_joins_back() {
        let pfn = parse_file_name(Path::new("/p/src/daily.report.sql.py"));
        let auto = pfn.auto().unwrap();
        assert_eq!(auto.base, "daily.report");
        assert_eq!(auto.path, PathBuf::from("/p/src/daily.report.auto.sql"));
    }

    #[test]
    fn workflow_step_env_values() {
        assert_eq!(WorkflowStep::BeforeAnnCatalog.as_env(), "BEFORE_ANN_CATALOG");
        assert_eq!(WorkflowStep::AfterAnnCatalog.as_env(), "AFTER_ANN_CATALOG");
        assert_eq!(WorkflowStep::DestroyClean.as_env(), "DESTROY_CLEAN");
    }
}

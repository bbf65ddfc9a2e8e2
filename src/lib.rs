#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{Result, SpryError, SpryIoError};

pub mod cancel;
pub use cancel::CancelToken;

pub mod utils;

mod config;
pub use config::{ProjectPathsConfig, ProjectPathsConfigBuilder, SPRY_D, SPRY_D_AUTO};

pub mod walk;
pub use walk::{WalkEncounter, WalkEntry, WalkOptions, WalkRoot, Walker};

pub mod annotation;
pub use annotation::{AnnotationItem, ResourceAnn, ResourceNature, RouteAnn};

pub mod tree;
pub use tree::{ForestOptions, PathForest};

pub mod directive;

pub mod lint;
pub use lint::{LintFinding, LintRegistry, Severity};

pub mod store;
pub use store::ArtifactStore;

pub mod foundry;
pub use foundry::{Foundry, WorkflowStep};

pub mod deploy;
pub use deploy::{DeployEmitter, SqlPageFile};

pub mod report;

mod orchestrate;
pub use orchestrate::{
    AnnotationCatalog, CatalogEntry, OrchestrateOptions, OrchestrationOutput, RunContext,
};

use std::{io, path::PathBuf};

/// A SQLPage project workspace; handles cataloging, foundry execution and
/// deploy SQL emission for everything under its source tree.
#[derive(Clone, Debug)]
pub struct Project {
    /// The layout of the project.
    pub paths: ProjectPathsConfig,
    /// Stable identifier handed to foundries.
    pub project_id: String,
    /// Extensions of files deployed as SQLPage content.
    pub sqlpage_extensions: Vec<String>,
    /// Globs selecting head deploy seeds under the shared library.
    pub head_globs: Vec<String>,
    /// Globs selecting tail deploy seeds under the shared library.
    pub tail_globs: Vec<String>,
    /// Database handed to foundries via `FOUNDRY_TARGET_SQLITEDB`.
    pub target_sqlite_db: Option<PathBuf>,
}

impl Project {
    /// Convenience function to call `ProjectBuilder::default()`.
    pub fn builder() -> ProjectBuilder {
        ProjectBuilder::default()
    }

    /// Runs the full workflow with default options.
    pub fn orchestrate(&self) -> Result<OrchestrationOutput> {
        self.orchestrate_with(&OrchestrateOptions::default())
    }

    pub fn orchestrate_with(&self, opts: &OrchestrateOptions) -> Result<OrchestrationOutput> {
        orchestrate::run(self, opts)
    }

    /// One catalog pass, without running foundries or writing artifacts.
    pub fn catalog(&self, lints: &mut LintRegistry) -> Result<AnnotationCatalog> {
        AnnotationCatalog::scan(&self.paths, lints)
    }

    /// Removes the auto distribution directory and asks cleanable foundries
    /// to undo their outputs.
    pub fn clean(&self) -> Result<LintRegistry> {
        let mut lints = LintRegistry::with_standard_rules();
        let catalog = AnnotationCatalog::scan(&self.paths, &mut lints)?;
        let runner = foundry::FoundryRunner::new(
            &self.paths,
            &self.project_id,
            serde_json::to_string(&RunContext {
                project_id: &self.project_id,
                workflow_step: WorkflowStep::DestroyClean.as_env(),
                auto_root: utils::slash_path(&self.paths.relativize(&self.paths.spryd_auto)),
            })?,
        );
        for foundry in catalog.foundries(&mut lints) {
            runner.clean(&foundry, &mut lints)?;
        }
        if self.paths.spryd_auto.exists() {
            std::fs::remove_dir_all(&self.paths.spryd_auto)
                .map_err(|err| SpryError::io(err, &self.paths.spryd_auto))?;
            if std::fs::read_dir(&self.paths.spryd)
                .map(|mut d| d.next().is_none())
                .unwrap_or(false)
            {
                let _ = std::fs::remove_dir(&self.paths.spryd);
            }
        }
        Ok(lints)
    }

    /// Emits the deployment stream for the current catalog into `out`.
    pub fn deploy_sql<W: io::Write>(&self, out: &mut W) -> Result<LintRegistry> {
        let mut lints = LintRegistry::with_standard_rules();
        let catalog = AnnotationCatalog::scan(&self.paths, &mut lints)?;
        let files = catalog.sqlpage_files(&self.sqlpage_extensions);
        self.deploy_emitter().emit(out, &files)?;
        Ok(lints)
    }

    /// The emitter configured with this project's seed globs.
    pub fn deploy_emitter(&self) -> DeployEmitter<'_> {
        DeployEmitter::new(self.paths.lib_dir())
            .with_head_globs(self.head_globs.iter().cloned())
            .with_tail_globs(self.tail_globs.iter().cloned())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProjectBuilder {
    root: Option<PathBuf>,
    project_id: Option<String>,
    lib_symlink_name: Option<String>,
    sqlpage_extensions: Option<Vec<String>>,
    head_globs: Option<Vec<String>>,
    tail_globs: Option<Vec<String>>,
    target_sqlite_db: Option<PathBuf>,
}

impl ProjectBuilder {
    /// The module home. Must be an existing directory.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn project_id(mut self, id: impl Into<String>) -> Self {
        self.project_id = Some(id.into());
        self
    }

    pub fn lib_symlink_name(mut self, name: impl Into<String>) -> Self {
        self.lib_symlink_name = Some(name.into());
        self
    }

    pub fn sqlpage_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sqlpage_extensions = Some(extensions.into_iter().map(Into::into).collect());
        self
    }

    pub fn head_globs<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.head_globs = Some(globs.into_iter().map(Into::into).collect());
        self
    }

    pub fn tail_globs<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tail_globs = Some(globs.into_iter().map(Into::into).collect());
        self
    }

    pub fn target_sqlite_db(mut self, db: impl Into<PathBuf>) -> Self {
        self.target_sqlite_db = Some(db.into());
        self
    }

    pub fn build(self) -> Result<Project> {
        let mut paths = ProjectPathsConfig::builder();
        if let Some(root) = self.root {
            paths = paths.root(root);
        }
        if let Some(name) = self.lib_symlink_name {
            paths = paths.lib_symlink_name(name);
        }
        let paths = paths.build()?;
        let project_id = self.project_id.unwrap_or_else(|| {
            paths
                .root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "project".to_string())
        });
        Ok(Project {
            paths,
            project_id,
            sqlpage_extensions: self
                .sqlpage_extensions
                .unwrap_or_else(|| utils::SQLPAGE_EXTENSIONS.iter().map(|s| s.to_string()).collect()),
            head_globs: self
                .head_globs
                .unwrap_or_else(|| deploy::DEFAULT_HEAD_GLOBS.iter().map(|s| s.to_string()).collect()),
            tail_globs: self
                .tail_globs
                .unwrap_or_else(|| deploy::DEFAULT_TAIL_GLOBS.iter().map(|s| s.to_string()).collect()),
            target_sqlite_db: self.target_sqlite_db,
        })
    }
}

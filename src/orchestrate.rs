//! Workflow orchestrator: one catalog pass over the project tree bracketed
//! by foundry workflow steps, annotation drop-in, and the run report.

use crate::{
    annotation::{
        extract, schema::{Grouped, SchemaGrouper}, AnnotationItem, ExtractOptions, ResourceAnn,
        ResourceNature, RouteAnn, SourceLanguage,
    },
    config::ProjectPathsConfig,
    deploy::SqlPageFile,
    directive::IncludeDirectives,
    error::Result,
    foundry::{parse_file_name, Foundry, FoundryRunner, WorkflowStep},
    lint::{
        FindingInput, LintRegistry, RULE_CONFLICT, RULE_DIRECTIVE, RULE_INVALID_ANNOTATION,
    },
    report,
    store::{ArtifactStore, JsonWriteOptions},
    tree::{ForestOptions, PathForest},
    utils,
    walk::{WalkOptions, Walker},
    Project,
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::PathBuf,
};

/// Toggles for one orchestration run.
#[derive(Clone, Debug)]
pub struct OrchestrateOptions {
    /// Remove the auto distribution directory before running.
    pub clean_auto: bool,
    /// Expand include directives in-place between passes.
    pub apply_directives: bool,
    /// Cooperative stop signal; checked between operations and propagated
    /// to running foundries.
    pub cancel: Option<crate::cancel::CancelToken>,
}

impl Default for OrchestrateOptions {
    fn default() -> Self {
        Self { clean_auto: true, apply_directives: true, cancel: None }
    }
}

impl OrchestrateOptions {
    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|token| token.is_cancelled())
    }
}

/// One cataloged source file: its encounter, extracted items, and the typed
/// annotations that grouped out of them.
#[derive(Clone, Debug)]
pub struct CatalogEntry {
    pub encounter: crate::walk::WalkEncounter,
    pub items: Vec<AnnotationItem>,
    pub resource: Option<ResourceAnn>,
    pub route: Option<RouteAnn>,
    /// Src-relative web identity; present for every cataloged file.
    pub web_path: String,
}

/// The annotation catalog produced by one pass over the project tree.
#[derive(Clone, Debug, Default)]
pub struct AnnotationCatalog {
    pub entries: Vec<CatalogEntry>,
}

impl AnnotationCatalog {
    /// Walks the source tree and builds the catalog. Parse and validation
    /// faults are recorded in `lints`; only walk errors are fatal.
    pub fn scan(paths: &ProjectPathsConfig, lints: &mut LintRegistry) -> Result<Self> {
        let walker = Walker::single(&paths.src, WalkOptions::default());
        let mut entries = Vec::new();
        let mut seen_web: HashMap<String, PathBuf> = HashMap::new();

        for encounter in walker.encounters()? {
            if !encounter.entry.is_file || paths.is_auto_owned(&encounter.entry.path) {
                continue;
            }
            if encounter.entry.path.starts_with(&paths.spryd) {
                continue;
            }
            let Some(web_path) = paths.web_path(&encounter.entry.path) else { continue };
            let Ok(text) = fs::read_to_string(&encounter.entry.path) else {
                trace!(path = %encounter.entry.path.display(), "skipping unreadable entry");
                continue;
            };

            let lang = SourceLanguage::from_path(&encounter.entry.path);
            let items = extract(&text, lang, &ExtractOptions::default()).items;
            let rel_fs_path = utils::slash_path(&paths.relativize(&encounter.entry.path));

            let (resource, resource_absent) =
                group_resource(&items, paths, &encounter.entry.path, &web_path, &rel_fs_path, lints);
            let route = group_route(&items, &rel_fs_path, lints);

            // synthesize a page resource only when a route exists without
            // any resource annotation
            let resource = match (resource, &route, resource_absent) {
                (None, Some(_), true) => Some(ResourceAnn {
                    nature: ResourceNature::Page,
                    abs_fs_path: encounter.entry.path.clone(),
                    rel_fs_path: rel_fs_path.clone(),
                    web_path: web_path.clone(),
                    is_system_generated: true,
                }),
                (resource, _, _) => resource,
            };

            if let Some(previous) = seen_web.insert(web_path.clone(), encounter.entry.path.clone())
            {
                lints.report(FindingInput {
                    rule: RULE_CONFLICT.into(),
                    code: "duplicate-web-path".into(),
                    content: web_path.clone(),
                    message: format!(
                        "claimed by both {} and {}",
                        previous.display(),
                        encounter.entry.path.display()
                    ),
                    ..Default::default()
                });
            }

            entries.push(CatalogEntry { encounter, items, resource, route, web_path });
        }
        Ok(Self { entries })
    }

    /// Files servable as SQLPage content, by extension.
    pub fn sqlpage_candidates(&self, extensions: &[String]) -> Vec<&CatalogEntry> {
        self.entries
            .iter()
            .filter(|entry| {
                entry
                    .encounter
                    .entry
                    .path
                    .extension()
                    .map(|ext| extensions.iter().any(|e| ext == e.as_str()))
                    .unwrap_or_default()
            })
            .filter(|entry| !entry.resource.as_ref().is_some_and(|r| r.nature.is_foundry()))
            .collect()
    }

    /// The candidates as deploy rows.
    pub fn sqlpage_files(&self, extensions: &[String]) -> Vec<SqlPageFile> {
        self.sqlpage_candidates(extensions)
            .into_iter()
            .map(|entry| SqlPageFile {
                web_path: entry.web_path.clone(),
                abs_path: entry.encounter.entry.path.clone(),
            })
            .collect()
    }

    pub fn routes(&self) -> impl Iterator<Item = &RouteAnn> {
        self.entries.iter().filter_map(|entry| entry.route.as_ref())
    }

    /// Executable entries whose resource nature is `foundry`, in discovery
    /// order (alphabetic by canonical path). Two foundries claiming the
    /// same materialization target conflict; the later one is dropped.
    pub fn foundries(&self, lints: &mut LintRegistry) -> Vec<Foundry> {
        let mut foundries: Vec<Foundry> = Vec::new();
        let mut targets: BTreeMap<PathBuf, String> = BTreeMap::new();
        for entry in &self.entries {
            let Some(ann) = &entry.resource else { continue };
            if !ann.nature.is_foundry() || !utils::is_executable(&entry.encounter.entry.path) {
                continue;
            }
            let pfn = parse_file_name(&entry.encounter.entry.path);
            if let Some(auto) = pfn.auto() {
                if let Some(claimant) = targets.get(&auto.path) {
                    lints.report(FindingInput {
                        rule: RULE_CONFLICT.into(),
                        code: "duplicate-foundry-target".into(),
                        content: ann.rel_fs_path.clone(),
                        message: format!(
                            "target {} already claimed by {claimant}",
                            auto.path.display()
                        ),
                        ..Default::default()
                    });
                    continue;
                }
                targets.insert(auto.path.clone(), ann.rel_fs_path.clone());
            }
            foundries.push(Foundry {
                encounter: entry.encounter.clone(),
                ann: ann.clone(),
                pfn,
            });
        }
        foundries.sort_by(|a, b| a.encounter.entry.path.cmp(&b.encounter.entry.path));
        foundries
    }

    /// The navigation forest over all route annotations.
    pub fn route_forest(&self) -> PathForest<RouteAnn> {
        PathForest::build(
            self.routes().cloned().collect::<Vec<_>>(),
            |route| route.path.clone(),
            ForestOptions::default(),
        )
    }
}

/// Everything one orchestration run produced.
#[derive(Debug)]
pub struct OrchestrationOutput {
    pub catalog: AnnotationCatalog,
    pub forest: PathForest<RouteAnn>,
    pub lints: LintRegistry,
    pub report_path: PathBuf,
}

/// The compact JSON handed to foundries via `FOUNDRY_CONTEXT_JSON`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext<'a> {
    pub project_id: &'a str,
    pub workflow_step: &'static str,
    /// Project-relative auto distribution root.
    pub auto_root: String,
}

pub(crate) fn run(project: &Project, opts: &OrchestrateOptions) -> Result<OrchestrationOutput> {
    let mut lints = LintRegistry::with_standard_rules();
    let state = Prepared { project, opts };
    let state = state.clean()?;
    let state = state.run_before(&mut lints)?;
    let state = state.apply_directives(&mut lints)?;
    let state = state.catalog(&mut lints)?;
    let state = state.drop_in()?;
    let state = state.run_after(&mut lints)?;
    state.finish(lints)
}

fn context_json(project: &Project, step: WorkflowStep) -> Result<String> {
    let auto_root =
        utils::slash_path(&project.paths.relativize(&project.paths.spryd_auto));
    Ok(serde_json::to_string(&RunContext {
        project_id: &project.project_id,
        workflow_step: step.as_env(),
        auto_root,
    })?)
}

fn make_runner<'p>(
    project: &'p Project,
    step: WorkflowStep,
    opts: &OrchestrateOptions,
) -> Result<FoundryRunner<'p>> {
    let mut runner =
        FoundryRunner::new(&project.paths, &project.project_id, context_json(project, step)?);
    if let Some(db) = &project.target_sqlite_db {
        runner = runner.with_target_sqlite_db(db);
    }
    if let Some(cancel) = &opts.cancel {
        runner = runner.with_cancel(cancel.clone());
    }
    Ok(runner)
}

struct Prepared<'p> {
    project: &'p Project,
    opts: &'p OrchestrateOptions,
}

impl<'p> Prepared<'p> {
    /// Removes the auto distribution directory, and its parent when that
    /// leaves it empty.
    fn clean(self) -> Result<Cleaned<'p>> {
        let paths = &self.project.paths;
        if self.opts.clean_auto && paths.spryd_auto.exists() {
            debug!(path = %paths.spryd_auto.display(), "removing auto distribution");
            fs::remove_dir_all(&paths.spryd_auto)
                .map_err(|err| crate::error::SpryError::io(err, &paths.spryd_auto))?;
            if fs::read_dir(&paths.spryd).map(|mut d| d.next().is_none()).unwrap_or(false) {
                let _ = fs::remove_dir(&paths.spryd);
            }
        }
        Ok(Cleaned { project: self.project, opts: self.opts })
    }
}

struct Cleaned<'p> {
    project: &'p Project,
    opts: &'p OrchestrateOptions,
}

impl<'p> Cleaned<'p> {
    /// Runs `BEFORE_ANN_CATALOG` foundries off a preliminary discovery
    /// scan, so their outputs are visible to the catalog pass.
    fn run_before(self, lints: &mut LintRegistry) -> Result<BeforeRan<'p>> {
        let step = WorkflowStep::BeforeAnnCatalog;
        let discovery = AnnotationCatalog::scan(&self.project.paths, lints)?;
        let runner = make_runner(self.project, step, self.opts)?;
        for foundry in discovery.foundries(lints) {
            if self.opts.cancelled() {
                break;
            }
            if foundry.runs_in(step) {
                runner.run(&foundry, step, lints)?;
            }
        }
        Ok(BeforeRan { project: self.project, opts: self.opts })
    }
}

struct BeforeRan<'p> {
    project: &'p Project,
    opts: &'p OrchestrateOptions,
}

impl<'p> BeforeRan<'p> {
    /// Expands include directives in project-owned `.sql` sources in place.
    /// Shared-library sources reached through the symlink are left alone.
    fn apply_directives(self, lints: &mut LintRegistry) -> Result<DirectivesApplied<'p>> {
        if !self.opts.apply_directives {
            return Ok(DirectivesApplied { project: self.project, opts: self.opts });
        }
        let paths = &self.project.paths;
        let includes = IncludeDirectives::new();
        for file in utils::source_files_iter(&paths.src, &["sql"]) {
            if self.opts.cancelled() {
                break;
            }
            if paths.is_auto_owned(&file)
                || file.starts_with(&paths.spryd)
                || file.starts_with(&paths.lib_symlink)
            {
                continue;
            }
            let Ok(text) = fs::read_to_string(&file) else { continue };
            let outcome = includes.rewrite(&text, &file);
            if outcome.changed && !outcome.aborted && outcome.text != text {
                fs::write(&file, &outcome.text)
                    .map_err(|err| crate::error::SpryError::io(err, &file))?;
                debug!(path = %file.display(), "expanded directives");
            }
        }
        for cycle in includes.cycles() {
            lints.report(FindingInput {
                rule: RULE_DIRECTIVE.into(),
                code: "cycle".into(),
                content: utils::slash_path(&paths.relativize(&cycle)),
                message: "include cycle skipped".into(),
                ..Default::default()
            });
        }
        Ok(DirectivesApplied { project: self.project, opts: self.opts })
    }
}

struct DirectivesApplied<'p> {
    project: &'p Project,
    opts: &'p OrchestrateOptions,
}

impl<'p> DirectivesApplied<'p> {
    /// The catalog pass proper: a fresh walk including everything the
    /// `BEFORE` foundries materialized.
    fn catalog(self, lints: &mut LintRegistry) -> Result<Cataloged<'p>> {
        let catalog = AnnotationCatalog::scan(&self.project.paths, lints)?;
        let forest = catalog.route_forest();
        Ok(Cataloged { project: self.project, opts: self.opts, catalog, forest })
    }
}

struct Cataloged<'p> {
    project: &'p Project,
    opts: &'p OrchestrateOptions,
    catalog: AnnotationCatalog,
    forest: PathForest<RouteAnn>,
}

impl<'p> Cataloged<'p> {
    /// Writes the annotation artifacts under the auto distribution root.
    /// `absFsPath` never reaches disk so artifacts diff cleanly across
    /// machines.
    fn drop_in(self) -> Result<DroppedIn<'p>> {
        let store = ArtifactStore::new(&self.project.paths.spryd_auto);
        let pretty = JsonWriteOptions::pretty();

        for entry in &self.catalog.entries {
            if let Some(resource) = &entry.resource {
                let value = with_source(serde_json::to_value(resource)?, &entry.items)?;
                store.write_json(
                    format!("entry/{}.auto.json", entry.web_path),
                    &value,
                    pretty,
                )?;
            }
            if let Some(route) = &entry.route {
                let value = with_source(serde_json::to_value(route)?, &entry.items)?;
                store.write_json(
                    format!("route/{}.auto.json", route.path.trim_start_matches('/')),
                    &value,
                    pretty,
                )?;
            }
        }

        store.write_json("route/forest.auto.json", &self.forest.to_json(), pretty)?;
        store.write_json("route/edges.auto.json", &self.forest.edges(), pretty)?;

        let captions: HashMap<&str, &str> = self
            .catalog
            .routes()
            .map(|route| (route.path.as_str(), route.caption.as_str()))
            .collect();
        for route in self.catalog.routes() {
            let crumbs: Vec<Crumb<'_>> = self
                .forest
                .ancestry(&route.path)
                .into_iter()
                .map(|path| Crumb {
                    caption: captions.get(path.as_str()).copied(),
                    path,
                })
                .collect();
            store.write_json(
                format!("breadcrumbs/{}.auto.json", route.path.trim_start_matches('/')),
                &crumbs,
                pretty,
            )?;
        }

        Ok(DroppedIn {
            project: self.project,
            opts: self.opts,
            catalog: self.catalog,
            forest: self.forest,
            store,
        })
    }
}

/// Appends the contributing annotation items as a `source` field.
fn with_source(
    mut value: serde_json::Value,
    items: &[AnnotationItem],
) -> Result<serde_json::Value> {
    if let serde_json::Value::Object(map) = &mut value {
        map.insert("source".into(), serde_json::to_value(items)?);
    }
    Ok(value)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Crumb<'a> {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
}

struct DroppedIn<'p> {
    project: &'p Project,
    opts: &'p OrchestrateOptions,
    catalog: AnnotationCatalog,
    forest: PathForest<RouteAnn>,
    store: ArtifactStore,
}

impl<'p> DroppedIn<'p> {
    fn run_after(self, lints: &mut LintRegistry) -> Result<AfterRan<'p>> {
        let step = WorkflowStep::AfterAnnCatalog;
        let runner = make_runner(self.project, step, self.opts)?;
        for foundry in self.catalog.foundries(lints) {
            if self.opts.cancelled() {
                break;
            }
            if foundry.runs_in(step) {
                runner.run(&foundry, step, lints)?;
            }
        }
        Ok(AfterRan {
            project: self.project,
            catalog: self.catalog,
            forest: self.forest,
            store: self.store,
        })
    }
}

struct AfterRan<'p> {
    project: &'p Project,
    catalog: AnnotationCatalog,
    forest: PathForest<RouteAnn>,
    store: ArtifactStore,
}

impl AfterRan<'_> {
    fn finish(self, lints: LintRegistry) -> Result<OrchestrationOutput> {
        let rendered = report::render(
            &self.catalog,
            &self.forest,
            &lints,
            &self.project.sqlpage_extensions,
        );
        let report_path = self.store.write_text("orchestrated.auto.md", &rendered)?;
        info!(
            entries = self.catalog.entries.len(),
            findings = lints.len(),
            "orchestration finished"
        );
        Ok(OrchestrationOutput { catalog: self.catalog, forest: self.forest, lints, report_path })
    }
}

fn group_resource(
    items: &[AnnotationItem],
    paths: &ProjectPathsConfig,
    abs: &std::path::Path,
    web_path: &str,
    rel_fs_path: &str,
    lints: &mut LintRegistry,
) -> (Option<ResourceAnn>, bool) {
    let grouper = SchemaGrouper::new("spry.").default_entry("nature", serde_json::json!("page"));
    let grouped: Grouped<ResourceAnn> = grouper.group(items, |map, _| {
        map.insert("relFsPath".into(), serde_json::json!(rel_fs_path));
        map.insert("webPath".into(), serde_json::json!(web_path));
    });
    match grouped {
        Grouped::Valid { mut parsed, .. } => {
            parsed.abs_fs_path = abs.to_path_buf();
            (Some(parsed), false)
        }
        Grouped::Invalid { error, anns, .. } => {
            let loc = anns.first().map(|a| a.loc);
            lints.report(FindingInput {
                rule: RULE_INVALID_ANNOTATION.into(),
                code: "schema".into(),
                content: utils::slash_path(&paths.relativize(abs)),
                message: format!("resource annotation rejected: {error}"),
                data: loc.map(|l| serde_json::json!({"line": l.line, "col": l.col})),
                ..Default::default()
            });
            (None, false)
        }
        Grouped::Absent => (None, true),
    }
}

fn group_route(
    items: &[AnnotationItem],
    rel_fs_path: &str,
    lints: &mut LintRegistry,
) -> Option<RouteAnn> {
    let grouped: Grouped<RouteAnn> = SchemaGrouper::new("route.").group(items, |_, _| {});
    match grouped {
        Grouped::Valid { mut parsed, .. } => {
            parsed.apply_path_defaults();
            Some(parsed)
        }
        Grouped::Invalid { error, anns, .. } => {
            let loc = anns.first().map(|a| a.loc);
            lints.report(FindingInput {
                rule: RULE_INVALID_ANNOTATION.into(),
                code: "schema".into(),
                content: rel_fs_path.to_string(),
                message: format!("route annotation rejected: {error}"),
                data: loc.map(|l| serde_json::json!({"line": l.line, "col": l.col})),
                ..Default::default()
            });
            None
        }
        Grouped::Absent => None,
    }
}

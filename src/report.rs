//! The human-readable orchestration report, written as
//! `orchestrated.auto.md` under the auto distribution root.

use crate::{
    annotation::RouteAnn,
    lint::LintRegistry,
    orchestrate::AnnotationCatalog,
    tree::PathForest,
};
use std::fmt::Write;

/// Renders the run summary: SQLPage candidates, the routes tree,
/// breadcrumbs, and lint findings.
pub fn render(
    catalog: &AnnotationCatalog,
    forest: &PathForest<RouteAnn>,
    lints: &LintRegistry,
    sqlpage_extensions: &[String],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Orchestration report\n");

    let candidates = catalog.sqlpage_candidates(sqlpage_extensions);
    let _ = writeln!(out, "## SQLPage file candidates\n");
    if candidates.is_empty() {
        let _ = writeln!(out, "None.\n");
    } else {
        let _ = writeln!(out, "| Web path | Nature | Route |");
        let _ = writeln!(out, "| --- | --- | --- |");
        for entry in &candidates {
            let nature = entry
                .resource
                .as_ref()
                .map(|r| r.nature.name())
                .unwrap_or("-");
            let route = entry
                .route
                .as_ref()
                .map(|r| r.path.as_str())
                .unwrap_or("-");
            let _ = writeln!(out, "| `{}` | {nature} | {route} |", entry.web_path);
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "## Routes\n");
    if forest.is_empty() {
        let _ = writeln!(out, "No routes declared.\n");
    } else {
        let _ = writeln!(out, "```text");
        out.push_str(&forest.to_ascii());
        let _ = writeln!(out, "```\n");
    }

    let _ = writeln!(out, "## Breadcrumbs\n");
    let mut wrote_crumb = false;
    for route in catalog.routes() {
        let trail = forest.ancestry(&route.path);
        if trail.len() > 1 {
            let _ = writeln!(out, "- `{}`: {}", route.path, trail.join(" > "));
            wrote_crumb = true;
        }
    }
    if !wrote_crumb {
        let _ = writeln!(out, "None.");
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Lint findings\n");
    if lints.is_empty() {
        let _ = writeln!(out, "None.");
    } else {
        for finding in lints.findings() {
            let _ = writeln!(out, "- {finding}");
        }
    }
    out
}

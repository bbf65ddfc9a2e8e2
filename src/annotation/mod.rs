//! Annotation extraction: comment-embedded `@dotted.key value` tags and
//! `key: value` pairs, recognized per source language.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod schema;
mod types;
pub use types::{
    FoundryDependency, FoundryNature, ResourceAnn, ResourceFileNature, ResourceImpact,
    ResourceNature, RouteAnn, RouteChild, SqlImpact, SqlNature,
};

/// A regex that matches a dotted annotation tag key, e.g. `@route.path`.
static RE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([A-Za-z_][A-Za-z0-9_-]*(?:\.[A-Za-z0-9_-]+)*)").unwrap());

/// A regex that matches a `key: value` pair inside a comment.
static RE_KV: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_.-]*)\s*:\s*(.+)$").unwrap());

/// A regex that matches a trailing `key=value` token in a tag remainder.
static RE_ASSIGN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)=(.+)$").unwrap());

/// Source language of a scanned file; selects the comment syntax.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceLanguage {
    Sql,
    Shell,
    Python,
    JavaScript,
    TypeScript,
    Rust,
    Css,
    Html,
    Markdown,
    Json,
    Other,
}

impl SourceLanguage {
    /// Determines the language from the terminal file extension.
    ///
    /// Extensionless files default to [`SourceLanguage::Other`], which scans
    /// `#` line comments; this covers shebang scripts.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()).unwrap_or_default() {
            "sql" => Self::Sql,
            "sh" | "bash" | "zsh" => Self::Shell,
            "py" => Self::Python,
            "js" | "mjs" | "cjs" => Self::JavaScript,
            "ts" | "mts" => Self::TypeScript,
            "rs" => Self::Rust,
            "css" => Self::Css,
            "html" | "htm" => Self::Html,
            "md" => Self::Markdown,
            "json" => Self::Json,
            _ => Self::Other,
        }
    }

    /// Markers that start a line comment.
    pub fn line_markers(&self) -> &'static [&'static str] {
        match self {
            Self::Sql => &["--"],
            Self::Shell | Self::Python | Self::Other => &["#"],
            Self::JavaScript | Self::TypeScript | Self::Rust => &["//"],
            Self::Css | Self::Html | Self::Markdown | Self::Json => &[],
        }
    }

    /// Block comment delimiters, if the language has them.
    pub fn block_delims(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Sql | Self::JavaScript | Self::TypeScript | Self::Rust | Self::Css => {
                Some(("/*", "*/"))
            }
            Self::Html | Self::Markdown => Some(("<!--", "-->")),
            Self::Shell | Self::Python | Self::Json | Self::Other => None,
        }
    }
}

/// How tag values are interpreted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueMode {
    /// Parse the remainder as JSON, falling back to the raw remainder when
    /// parsing fails.
    #[default]
    Json,
    /// Keep the raw remainder as a string.
    Raw,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagOptions {
    /// Allow more than one tag per comment line.
    pub multi: bool,
    pub value_mode: ValueMode,
}

impl Default for TagOptions {
    fn default() -> Self {
        Self { multi: true, value_mode: ValueMode::Json }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractOptions {
    pub tags: TagOptions,
    /// Recognize `key: value` pairs on comment lines without tags.
    pub kv: bool,
    /// Recognize a YAML front-matter block at the head of the file.
    pub yaml: bool,
    /// Recognize JSON object blobs inside block comments.
    pub json: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnnotationKind {
    Tag,
    Kv,
}

/// 1-based source position.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub col: usize,
}

/// One tag or key/value pair extracted from a comment, in source order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationItem {
    pub kind: AnnotationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    pub raw: String,
    pub loc: Location,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Extracted {
    pub items: Vec<AnnotationItem>,
}

/// One comment line, with the 1-based position of its first character.
struct CommentLine<'a> {
    text: &'a str,
    line: usize,
    col: usize,
}

/// Extracts all annotation items from `text`.
///
/// Scans line-comment and block-comment spans per `lang`, then recognizes
/// `@dotted.key value?` tags, optional `key: value` pairs, YAML
/// front-matter and JSON blobs within them. Item order reflects source
/// order; locations are 1-based.
pub fn extract(text: &str, lang: SourceLanguage, opts: &ExtractOptions) -> Extracted {
    let mut items = Vec::new();

    if opts.yaml {
        extract_front_matter(text, &mut items);
    }

    let (comment_lines, block_bodies) = comment_spans(text, lang);

    if opts.json {
        for (body, line) in &block_bodies {
            extract_json_blob(body, *line, &mut items);
        }
    }

    for cl in &comment_lines {
        let before = items.len();
        extract_tags(cl, &opts.tags, &mut items);
        if opts.kv && items.len() == before {
            extract_kv(cl, &mut items);
        }
    }

    items.sort_by_key(|item| (item.loc.line, item.loc.col));
    Extracted { items }
}

/// Splits `text` into comment lines plus aggregated block-comment bodies.
fn comment_spans(text: &str, lang: SourceLanguage) -> (Vec<CommentLine<'_>>, Vec<(String, usize)>) {
    let markers = lang.line_markers();
    let block = lang.block_delims();
    let mut lines = Vec::new();
    let mut bodies = Vec::new();

    let mut in_block: Option<(&'static str, usize, String)> = None;
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if let Some((close, start_line, mut body)) = in_block.take() {
            if let Some(end) = line.find(close) {
                let inner = &line[..end];
                if !body.is_empty() {
                    body.push('\n');
                }
                body.push_str(inner);
                lines.push(CommentLine { text: inner, line: line_no, col: 1 });
                bodies.push((body, start_line));
            } else {
                if !body.is_empty() {
                    body.push('\n');
                }
                body.push_str(line);
                lines.push(CommentLine { text: line, line: line_no, col: 1 });
                in_block = Some((close, start_line, body));
            }
            continue;
        }

        match first_comment_start(line, markers, block) {
            Some(CommentStart::Line { text_at }) => {
                lines.push(CommentLine { text: &line[text_at..], line: line_no, col: text_at + 1 });
            }
            Some(CommentStart::Block { text_at, close }) => {
                if let Some(end) = line[text_at..].find(close) {
                    let inner = &line[text_at..text_at + end];
                    lines.push(CommentLine { text: inner, line: line_no, col: text_at + 1 });
                    bodies.push((inner.to_string(), line_no));
                } else {
                    let inner = &line[text_at..];
                    lines.push(CommentLine { text: inner, line: line_no, col: text_at + 1 });
                    in_block = Some((close, line_no, inner.to_string()));
                }
            }
            None => {}
        }
    }
    // an unterminated block comment still yields its lines
    if let Some((_, start_line, body)) = in_block {
        bodies.push((body, start_line));
    }
    (lines, bodies)
}

enum CommentStart {
    Line { text_at: usize },
    Block { text_at: usize, close: &'static str },
}

/// Finds the earliest comment opener on `line` that is not inside a quoted
/// string. Quote tracking is per-line and recognizes `'…'` and `"…"`.
fn first_comment_start(
    line: &str,
    markers: &[&'static str],
    block: Option<(&'static str, &'static str)>,
) -> Option<CommentStart> {
    let bytes = line.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        if b == b'\'' || b == b'"' {
            quote = Some(b);
            i += 1;
            continue;
        }
        for marker in markers {
            if bytes[i..].starts_with(marker.as_bytes()) {
                return Some(CommentStart::Line { text_at: i + marker.len() });
            }
        }
        if let Some((open, close)) = block {
            if bytes[i..].starts_with(open.as_bytes()) {
                return Some(CommentStart::Block { text_at: i + open.len(), close });
            }
        }
        i += 1;
    }
    None
}

fn extract_tags(cl: &CommentLine<'_>, opts: &TagOptions, items: &mut Vec<AnnotationItem>) {
    let matches: Vec<_> = RE_TAG.captures_iter(cl.text).collect();
    let take = if opts.multi { matches.len() } else { matches.len().min(1) };
    for (i, cap) in matches.iter().take(take).enumerate() {
        let whole = cap.get(0).unwrap();
        let key = cap.get(1).unwrap().as_str();
        let value_end = if opts.multi && i + 1 < matches.len() {
            matches[i + 1].get(0).unwrap().start()
        } else {
            cl.text.len()
        };
        let remainder = cl.text[whole.end()..value_end].trim();
        let raw = cl.text[whole.start()..value_end].trim_end();
        let loc = Location { line: cl.line, col: cl.col + whole.start() };
        push_tag(key, remainder, raw, loc, opts.value_mode, items);
    }
}

/// Emits the tag item, plus sibling items for trailing `k=v` tokens in the
/// remainder. Siblings inherit the tag's dotted parent namespace, so
/// `@spry.nature foundry isCleanable=false` yields `spry.nature` and
/// `spry.isCleanable`.
fn push_tag(
    key: &str,
    remainder: &str,
    raw: &str,
    loc: Location,
    mode: ValueMode,
    items: &mut Vec<AnnotationItem>,
) {
    let mut siblings: Vec<(String, serde_json::Value)> = Vec::new();
    let value = if remainder.is_empty() {
        // a bare tag is a presence flag
        Some(serde_json::Value::Bool(true))
    } else {
        match mode {
            ValueMode::Raw => Some(serde_json::Value::String(remainder.to_string())),
            ValueMode::Json => match serde_json::from_str(remainder) {
                Ok(v) => Some(v),
                Err(_) => {
                    let namespace = key.rfind('.').map(|i| &key[..=i]).unwrap_or_default();
                    let mut head: Vec<&str> = Vec::new();
                    for token in remainder.split_whitespace() {
                        match RE_ASSIGN.captures(token) {
                            Some(cap) if !namespace.is_empty() => {
                                let k = format!("{namespace}{}", &cap[1]);
                                siblings.push((k, parse_scalar(&cap[2])));
                            }
                            _ => head.push(token),
                        }
                    }
                    if siblings.is_empty() {
                        Some(serde_json::Value::String(remainder.to_string()))
                    } else {
                        Some(parse_scalar(&head.join(" ")))
                    }
                }
            },
        }
    };
    items.push(AnnotationItem {
        kind: AnnotationKind::Tag,
        key: Some(key.to_string()),
        value,
        raw: raw.to_string(),
        loc,
    });
    for (k, v) in siblings {
        items.push(AnnotationItem {
            kind: AnnotationKind::Tag,
            key: Some(k),
            value: Some(v),
            raw: raw.to_string(),
            loc,
        });
    }
}

/// JSON scalar when the token parses as one, a plain string otherwise.
fn parse_scalar(token: &str) -> serde_json::Value {
    serde_json::from_str(token).unwrap_or_else(|_| serde_json::Value::String(token.to_string()))
}

fn extract_kv(cl: &CommentLine<'_>, items: &mut Vec<AnnotationItem>) {
    if let Some(cap) = RE_KV.captures(cl.text) {
        let key = cap.get(1).unwrap();
        let value = cap.get(2).unwrap().as_str().trim();
        items.push(AnnotationItem {
            kind: AnnotationKind::Kv,
            key: Some(key.as_str().to_string()),
            value: Some(parse_scalar(value)),
            raw: cl.text.trim().to_string(),
            loc: Location { line: cl.line, col: cl.col + key.start() },
        });
    }
}

/// Parses a `--- … ---` front-matter block at the head of the file into kv
/// items, one per top-level mapping key.
fn extract_front_matter(text: &str, items: &mut Vec<AnnotationItem>) {
    let mut lines = text.lines().enumerate();
    match lines.next() {
        Some((_, first)) if first.trim_end() == "---" => {}
        _ => return,
    }
    let mut body = String::new();
    let mut body_lines: Vec<(usize, &str)> = Vec::new();
    let mut closed = false;
    for (idx, line) in lines {
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed == "..." {
            closed = true;
            break;
        }
        body.push_str(line);
        body.push('\n');
        body_lines.push((idx + 1, line));
    }
    if !closed {
        return;
    }
    let Ok(serde_yaml::Value::Mapping(mapping)) = serde_yaml::from_str(&body) else { return };
    for (k, v) in mapping {
        let Some(key) = k.as_str().map(str::to_string) else { continue };
        let value = serde_json::to_value(&v).unwrap_or(serde_json::Value::Null);
        let line = body_lines
            .iter()
            .find(|(_, l)| l.trim_start().starts_with(&key))
            .map(|(n, _)| *n)
            .unwrap_or(2);
        let raw = body_lines
            .iter()
            .find(|(n, _)| *n == line)
            .map(|(_, l)| l.trim().to_string())
            .unwrap_or_default();
        items.push(AnnotationItem {
            kind: AnnotationKind::Kv,
            key: Some(key),
            value: Some(value),
            raw,
            loc: Location { line, col: 1 },
        });
    }
}

/// Parses a block-comment body that is a JSON object into kv items, one per
/// top-level key.
fn extract_json_blob(body: &str, line: usize, items: &mut Vec<AnnotationItem>) {
    let trimmed = body.trim();
    if !trimmed.starts_with('{') {
        return;
    }
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str(trimmed) else { return };
    for (key, value) in map {
        items.push(AnnotationItem {
            kind: AnnotationKind::Kv,
            key: Some(key),
            value: Some(value),
            raw: trimmed.to_string(),
            loc: Location { line, col: 1 },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tags(text: &str, lang: SourceLanguage) -> Vec<(String, serde_json::Value)> {
        extract(text, lang, &ExtractOptions::default())
            .items
            .into_iter()
            .map(|i| (i.key.unwrap(), i.value.unwrap()))
            .collect()
    }

    #[test]
    fn empty_file_yields_no_items() {
        let out = extract("", SourceLanguage::Sql, &ExtractOptions::default());
        assert_eq!(out.items, vec![]);
    }

    #[test]
    fn sql_line_comment_tags() {
        let text = "-- @spry.nature page\n-- @route.path /about.sql\nSELECT 1;\n";
        assert_eq!(
            tags(text, SourceLanguage::Sql),
            vec![
                ("spry.nature".into(), serde_json::json!("page")),
                ("route.path".into(), serde_json::json!("/about.sql")),
            ]
        );
    }

    #[test]
    fn locations_are_one_based() {
        let text = "SELECT 1;\n-- @route.caption \"About\"\n";
        let out = extract(text, SourceLanguage::Sql, &ExtractOptions::default());
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.items[0].loc, Location { line: 2, col: 4 });
        assert_eq!(out.items[0].value, Some(serde_json::json!("About")));
    }

    #[test]
    fn json_values_fall_back_to_raw() {
        let text = "-- @route.siblingOrder 3\n-- @route.caption not json at all\n";
        assert_eq!(
            tags(text, SourceLanguage::Sql),
            vec![
                ("route.siblingOrder".into(), serde_json::json!(3)),
                ("route.caption".into(), serde_json::json!("not json at all")),
            ]
        );
    }

    #[test]
    fn trailing_assignments_become_sibling_tags() {
        let text = "# @spry.nature foundry runAfterAnnCatalog=true isCleanable=false\n";
        assert_eq!(
            tags(text, SourceLanguage::Python),
            vec![
                ("spry.nature".into(), serde_json::json!("foundry")),
                ("spry.runAfterAnnCatalog".into(), serde_json::json!(true)),
                ("spry.isCleanable".into(), serde_json::json!(false)),
            ]
        );
    }

    #[test]
    fn raw_value_mode_keeps_remainders_verbatim() {
        let opts = ExtractOptions {
            tags: TagOptions { multi: true, value_mode: ValueMode::Raw },
            ..Default::default()
        };
        let out = extract("-- @route.siblingOrder 3\n", SourceLanguage::Sql, &opts);
        assert_eq!(out.items[0].value, Some(serde_json::json!("3")));
    }

    #[test]
    fn single_tag_mode_ignores_trailing_tags() {
        let opts = ExtractOptions {
            tags: TagOptions { multi: false, value_mode: ValueMode::Json },
            ..Default::default()
        };
        let out = extract("-- @spry.nature page @route.path /x\n", SourceLanguage::Sql, &opts);
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.items[0].key.as_deref(), Some("spry.nature"));
    }

    #[test]
    fn bare_tags_are_presence_flags() {
        let out = extract(
            "-- @spry.nature foundry\n-- @spry.runBeforeAnnCatalog\n",
            SourceLanguage::Sql,
            &ExtractOptions::default(),
        );
        assert_eq!(out.items[1].value, Some(serde_json::json!(true)));
    }

    #[test]
    fn marker_inside_string_literal_is_ignored() {
        let text = "SELECT '-- @spry.nature page' AS t;\n";
        assert_eq!(tags(text, SourceLanguage::Sql), vec![]);
    }

    #[test]
    fn block_comment_tags() {
        let text = "/*\n @spry.nature partial\n*/\nSELECT 1;\n";
        let out = extract(text, SourceLanguage::Sql, &ExtractOptions::default());
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.items[0].key.as_deref(), Some("spry.nature"));
        assert_eq!(out.items[0].loc.line, 2);
    }

    #[test]
    fn kv_pairs_when_enabled() {
        let opts = ExtractOptions { kv: true, ..Default::default() };
        let out = extract("-- owner: console-team\n", SourceLanguage::Sql, &opts);
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.items[0].kind, AnnotationKind::Kv);
        assert_eq!(out.items[0].value, Some(serde_json::json!("console-team")));
    }

    #[test]
    fn yaml_front_matter() {
        let opts = ExtractOptions { yaml: true, ..Default::default() };
        let out = extract("---\ntitle: Info\norder: 2\n---\nbody\n", SourceLanguage::Markdown, &opts);
        let keys: Vec<_> = out.items.iter().map(|i| i.key.clone().unwrap()).collect();
        assert_eq!(keys, ["title", "order"]);
        assert_eq!(out.items[1].value, Some(serde_json::json!(2)));
    }

    #[test]
    fn json_blob_in_block_comment() {
        let opts = ExtractOptions { json: true, ..Default::default() };
        let out = extract("/* {\"a\": 1, \"b\": [2]} */\n", SourceLanguage::Sql, &opts);
        let kv: Vec<_> =
            out.items.iter().filter(|i| i.kind == AnnotationKind::Kv).collect();
        assert_eq!(kv.len(), 2);
        assert_eq!(kv[1].value, Some(serde_json::json!([2])));
    }
}

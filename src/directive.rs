//! Directive stream engine: a line-oriented text replacer supporting inline
//! and block substitutions with EOL fidelity.

use std::{
    cell::RefCell,
    fs,
    marker::PhantomData,
    path::{Path, PathBuf},
};

/// Rendered replacement content.
#[derive(Clone, Debug, PartialEq)]
pub enum Rendered {
    /// Inserted as-is, followed by one terminator in the observed EOL style.
    Text(String),
    /// Each line terminated in the observed EOL style.
    Lines(Vec<String>),
}

/// A directive occurrence recognized by the detector. Without `block_end`
/// the candidate is inline and replaces its own line; with `block_end` it
/// opens a block whose inner lines are replaced.
pub struct Candidate<'a, P> {
    pub directive: String,
    pub args_text: String,
    /// Probe deciding whether a subsequent line ends the block.
    pub block_end: Option<Box<dyn Fn(&str) -> Result<bool, String> + 'a>>,
    pub render: Box<dyn Fn(&P) -> Result<Rendered, String> + 'a>,
}

/// Which engine operation produced an error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorPhase {
    Candidate,
    Render,
    BlockEnd,
    UnterminatedBlock,
}

/// Context handed to the caller's error policy.
#[derive(Debug)]
pub struct ErrorContext<'a> {
    pub phase: ErrorPhase,
    pub line: &'a str,
    pub line_no: usize,
    /// The directive keyword, when one was recognized.
    pub directive: Option<&'a str>,
    pub message: String,
}

/// What to do after an error: close the output stream immediately, or keep
/// the original text for the failed occurrence and proceed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ErrorDisposition {
    #[default]
    Abandon,
    Continue,
}

/// Optional observer of engine events; every hook defaults to a no-op.
#[allow(unused_variables)]
pub trait DirectiveObserver {
    fn on_line(&mut self, line: &str, line_no: usize) {}
    fn on_candidate(&mut self, directive: &str, line_no: usize) {}
    fn on_unknown_directive(&mut self, line: &str, line_no: usize) {}
    fn on_block_start(&mut self, directive: &str, line_no: usize) {}
    fn on_block_render(&mut self, directive: &str, lines: usize) {}
    fn on_block_end(&mut self, directive: &str, line_no: usize) {}
    fn on_inline_render(&mut self, directive: &str, line_no: usize) {}
    fn on_emit_chunk(&mut self, chunk: &str) {}
    fn on_error(&mut self, ctx: &ErrorContext<'_>) {}
}

/// The default silent observer.
pub struct NullObserver;

impl DirectiveObserver for NullObserver {}

/// Result of one rewrite pass.
#[derive(Clone, Debug, PartialEq)]
pub struct RewriteOutcome {
    pub text: String,
    /// Whether the error policy abandoned the stream before the input was
    /// drained.
    pub aborted: bool,
    /// Whether any occurrence was replaced.
    pub changed: bool,
}

/// Line-streaming replacer.
///
/// The EOL style is inferred from the first observed line terminator and all
/// inserted content is written in that style; sources without terminators
/// get `\n`. Line numbers are 1-based and offset by `start_line`.
pub struct DirectiveEngine<'a, P, D, E>
where
    D: FnMut(&str, usize, &P) -> Result<Option<Candidate<'a, P>>, String>,
    E: FnMut(&ErrorContext<'_>) -> ErrorDisposition,
{
    detect: D,
    on_error: E,
    start_line: usize,
    _payload: PhantomData<(&'a (), fn(&P))>,
}

impl<'a, P, D, E> DirectiveEngine<'a, P, D, E>
where
    D: FnMut(&str, usize, &P) -> Result<Option<Candidate<'a, P>>, String>,
    E: FnMut(&ErrorContext<'_>) -> ErrorDisposition,
{
    pub fn new(detect: D, on_error: E) -> Self {
        Self { detect, on_error, start_line: 1, _payload: PhantomData }
    }

    pub fn with_start_line(mut self, start_line: usize) -> Self {
        self.start_line = start_line;
        self
    }

    pub fn rewrite(&mut self, input: &str, payload: &P) -> RewriteOutcome {
        self.rewrite_observed(input, payload, &mut NullObserver)
    }

    pub fn rewrite_observed(
        &mut self,
        input: &str,
        payload: &P,
        obs: &mut dyn DirectiveObserver,
    ) -> RewriteOutcome {
        let lines = split_lines_keep_eol(input);
        let eol =
            lines.iter().map(|(_, eol)| *eol).find(|eol| !eol.is_empty()).unwrap_or("\n");

        let mut out = String::with_capacity(input.len());
        let mut changed = false;
        let mut i = 0;
        while i < lines.len() {
            let (content, line_eol) = lines[i];
            let line_no = self.start_line + i;
            obs.on_line(content, line_no);

            let candidate = match (self.detect)(content, line_no, payload) {
                Ok(c) => c,
                Err(message) => {
                    let ctx = ErrorContext {
                        phase: ErrorPhase::Candidate,
                        line: content,
                        line_no,
                        directive: None,
                        message,
                    };
                    obs.on_error(&ctx);
                    match (self.on_error)(&ctx) {
                        ErrorDisposition::Abandon => {
                            return RewriteOutcome { text: out, aborted: true, changed };
                        }
                        ErrorDisposition::Continue => {
                            emit(&mut out, content, line_eol, obs);
                            i += 1;
                            continue;
                        }
                    }
                }
            };

            let Some(cand) = candidate else {
                emit(&mut out, content, line_eol, obs);
                i += 1;
                continue;
            };
            obs.on_candidate(&cand.directive, line_no);

            if cand.block_end.is_some() {
                match self.rewrite_block(&lines, i, eol, payload, &cand, &mut out, obs) {
                    BlockResult::Consumed { next, replaced } => {
                        changed |= replaced;
                        i = next;
                    }
                    BlockResult::Aborted => {
                        return RewriteOutcome { text: out, aborted: true, changed };
                    }
                }
            } else {
                match (cand.render)(payload) {
                    Ok(rendered) => {
                        emit_rendered(&mut out, &rendered, eol, obs);
                        obs.on_inline_render(&cand.directive, line_no);
                        changed = true;
                    }
                    Err(message) => {
                        let ctx = ErrorContext {
                            phase: ErrorPhase::Render,
                            line: content,
                            line_no,
                            directive: Some(&cand.directive),
                            message,
                        };
                        obs.on_error(&ctx);
                        match (self.on_error)(&ctx) {
                            ErrorDisposition::Abandon => {
                                return RewriteOutcome { text: out, aborted: true, changed };
                            }
                            ErrorDisposition::Continue => emit(&mut out, content, line_eol, obs),
                        }
                    }
                }
                i += 1;
            }
        }
        RewriteOutcome { text: out, aborted: false, changed }
    }

    /// Replaces the inner buffer of a block whose begin line is `lines[at]`.
    /// Begin and end lines are retained verbatim.
    #[allow(clippy::too_many_arguments)]
    fn rewrite_block(
        &mut self,
        lines: &[(&str, &str)],
        at: usize,
        eol: &str,
        payload: &P,
        cand: &Candidate<'a, P>,
        out: &mut String,
        obs: &mut dyn DirectiveObserver,
    ) -> BlockResult {
        let (begin, begin_eol) = lines[at];
        let begin_no = self.start_line + at;
        obs.on_block_start(&cand.directive, begin_no);
        let block_end = cand.block_end.as_ref().expect("block candidate");

        // locate the end line before emitting anything
        let mut end_idx = None;
        for (j, &(probe, _)) in lines.iter().enumerate().skip(at + 1) {
            match block_end(probe) {
                Ok(true) => {
                    end_idx = Some(j);
                    break;
                }
                Ok(false) => {}
                Err(message) => {
                    let ctx = ErrorContext {
                        phase: ErrorPhase::BlockEnd,
                        line: probe,
                        line_no: self.start_line + j,
                        directive: Some(&cand.directive),
                        message,
                    };
                    obs.on_error(&ctx);
                    match (self.on_error)(&ctx) {
                        ErrorDisposition::Abandon => return BlockResult::Aborted,
                        ErrorDisposition::Continue => {}
                    }
                }
            }
        }

        let Some(end) = end_idx else {
            let ctx = ErrorContext {
                phase: ErrorPhase::UnterminatedBlock,
                line: begin,
                line_no: begin_no,
                directive: Some(&cand.directive),
                message: format!("block directive `{}` has no end line", cand.directive),
            };
            obs.on_error(&ctx);
            return match (self.on_error)(&ctx) {
                ErrorDisposition::Abandon => BlockResult::Aborted,
                ErrorDisposition::Continue => {
                    // keep the begin line; its inner lines are rescanned
                    emit(out, begin, begin_eol, obs);
                    BlockResult::Consumed { next: at + 1, replaced: false }
                }
            };
        };

        emit(out, begin, begin_eol, obs);
        match (cand.render)(payload) {
            Ok(rendered) => {
                let count = match &rendered {
                    Rendered::Text(_) => 1,
                    Rendered::Lines(lines) => lines.len(),
                };
                emit_rendered(out, &rendered, eol, obs);
                obs.on_block_render(&cand.directive, count);
            }
            Err(message) => {
                let ctx = ErrorContext {
                    phase: ErrorPhase::Render,
                    line: begin,
                    line_no: begin_no,
                    directive: Some(&cand.directive),
                    message,
                };
                obs.on_error(&ctx);
                match (self.on_error)(&ctx) {
                    ErrorDisposition::Abandon => return BlockResult::Aborted,
                    ErrorDisposition::Continue => {
                        for &(content, line_eol) in &lines[at + 1..end] {
                            emit(out, content, line_eol, obs);
                        }
                        let (end_line, end_eol) = lines[end];
                        emit(out, end_line, end_eol, obs);
                        obs.on_block_end(&cand.directive, self.start_line + end);
                        return BlockResult::Consumed { next: end + 1, replaced: false };
                    }
                }
            }
        }
        let (end_line, end_eol) = lines[end];
        emit(out, end_line, end_eol, obs);
        obs.on_block_end(&cand.directive, self.start_line + end);
        BlockResult::Consumed { next: end + 1, replaced: true }
    }
}

enum BlockResult {
    Consumed { next: usize, replaced: bool },
    Aborted,
}

fn emit(out: &mut String, content: &str, eol: &str, obs: &mut dyn DirectiveObserver) {
    out.push_str(content);
    out.push_str(eol);
    obs.on_emit_chunk(content);
}

fn emit_rendered(out: &mut String, rendered: &Rendered, eol: &str, obs: &mut dyn DirectiveObserver) {
    match rendered {
        Rendered::Text(text) => {
            out.push_str(text);
            out.push_str(eol);
            obs.on_emit_chunk(text);
        }
        Rendered::Lines(lines) => {
            for line in lines {
                out.push_str(line);
                out.push_str(eol);
                obs.on_emit_chunk(line);
            }
        }
    }
}

/// Splits into `(content, terminator)` pairs; the terminator is `""`,
/// `"\n"` or `"\r\n"`.
fn split_lines_keep_eol(input: &str) -> Vec<(&str, &str)> {
    let mut out = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        match rest.find('\n') {
            Some(idx) => {
                let (content, eol) = if idx > 0 && rest.as_bytes()[idx - 1] == b'\r' {
                    (&rest[..idx - 1], &rest[idx - 1..=idx])
                } else {
                    (&rest[..idx], &rest[idx..=idx])
                };
                out.push((content, eol));
                rest = &rest[idx + 1..];
            }
            None => {
                out.push((rest, ""));
                break;
            }
        }
    }
    out
}

/// Shell-style argument tokenizer error.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("unclosed quote opened at byte {0}")]
    UnclosedQuote(usize),
}

/// Splits `input` on whitespace into tokens. Single-quoted spans are
/// literal; double-quoted spans honor `\"`, `\\`, `\$` and `` \` ``
/// escapes; an unclosed quote fails.
pub fn tokenize_args(input: &str) -> Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut has_token = false;
    let mut chars = input.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            '\'' => {
                has_token = true;
                let mut closed = false;
                for (_, q) in chars.by_ref() {
                    if q == '\'' {
                        closed = true;
                        break;
                    }
                    current.push(q);
                }
                if !closed {
                    return Err(ParseError::UnclosedQuote(idx));
                }
            }
            '"' => {
                has_token = true;
                let mut closed = false;
                while let Some((_, q)) = chars.next() {
                    match q {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.peek().map(|(_, n)| *n) {
                            Some(n @ ('"' | '\\' | '$' | '`')) => {
                                current.push(n);
                                chars.next();
                            }
                            _ => current.push('\\'),
                        },
                        _ => current.push(q),
                    }
                }
                if !closed {
                    return Err(ParseError::UnclosedQuote(idx));
                }
            }
            _ => {
                has_token = true;
                current.push(c);
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// A parsed line-comment directive: `(token, remainder, prefix-seen)`.
pub type ParsedDirective<'a> = (String, &'a str, Option<String>);

/// Builds a parser recognizing
/// `<comment-marker><ws?><directive-prefix?><token><ws><remainder>`.
pub fn line_comment_directive_parser(
    comment_marker: &str,
    directive_prefix: Option<&str>,
) -> impl Fn(&str) -> Option<ParsedDirective<'_>> {
    let marker = comment_marker.to_string();
    let prefix = directive_prefix.map(str::to_string);
    move |line: &str| {
        let rest = line.trim_start().strip_prefix(marker.as_str())?;
        let rest = rest.trim_start();
        let (seen_prefix, rest) = match &prefix {
            Some(p) => match rest.strip_prefix(p.as_str()) {
                Some(stripped) => (Some(p.clone()), stripped),
                None => (None, rest),
            },
            None => (None, rest),
        };
        let token_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let token = &rest[..token_end];
        if token.is_empty() {
            return None;
        }
        let remainder = rest[token_end..].trim_start();
        Some((token.to_string(), remainder, seen_prefix))
    }
}

/// The default `#include` block directive over `--` comments:
///
/// ```sql
/// -- #include nav --file partials/nav.sql
/// -- #includeEnd nav
/// ```
///
/// The inner buffer is replaced with the named file's contents, resolved
/// relative to the including file's directory. Nested includes are expanded
/// recursively; cycles are detected with a visited set plus a depth limit,
/// and each offending chain is recorded once.
pub struct IncludeDirectives {
    comment_marker: String,
    directive_prefix: String,
    max_depth: usize,
    state: RefCell<IncludeState>,
}

#[derive(Default)]
struct IncludeState {
    visiting: Vec<PathBuf>,
    cycles: Vec<PathBuf>,
}

/// Payload of an include rewrite: the file whose text is being processed.
#[derive(Clone, Debug)]
pub struct IncludeSource {
    pub path: PathBuf,
}

impl Default for IncludeDirectives {
    fn default() -> Self {
        Self {
            comment_marker: "--".to_string(),
            directive_prefix: "#".to_string(),
            max_depth: 16,
            state: RefCell::new(IncludeState::default()),
        }
    }
}

impl IncludeDirectives {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include chains that were skipped as cyclic, each recorded once.
    pub fn cycles(&self) -> Vec<PathBuf> {
        self.state.borrow().cycles.clone()
    }

    /// Rewrites `text` of the file at `source`, expanding include blocks.
    /// Failed occurrences keep their original text.
    pub fn rewrite(&self, text: &str, source: &Path) -> RewriteOutcome {
        self.rewrite_observed(text, source, &mut NullObserver)
    }

    pub fn rewrite_observed(
        &self,
        text: &str,
        source: &Path,
        obs: &mut dyn DirectiveObserver,
    ) -> RewriteOutcome {
        let payload = IncludeSource { path: source.to_path_buf() };
        let mut engine = DirectiveEngine::new(
            |line: &str, line_no: usize, payload: &IncludeSource| {
                self.detect(line, line_no, payload)
            },
            |_ctx: &ErrorContext<'_>| ErrorDisposition::Continue,
        );
        engine.rewrite_observed(text, &payload, obs)
    }

    fn detect(
        &self,
        line: &str,
        _line_no: usize,
        payload: &IncludeSource,
    ) -> Result<Option<Candidate<'_, IncludeSource>>, String> {
        let parse =
            line_comment_directive_parser(&self.comment_marker, Some(&self.directive_prefix));
        let Some((token, remainder, prefix)) = parse(line) else { return Ok(None) };
        if prefix.is_none() || token != "include" {
            return Ok(None);
        }
        let args = tokenize_args(remainder).map_err(|e| e.to_string())?;
        let mut name = None;
        let mut file = None;
        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            if arg == "--file" {
                file = iter.next();
            } else if name.is_none() {
                name = Some(arg);
            }
        }
        let name = name.ok_or_else(|| "include directive without a name".to_string())?;
        let file = file
            .ok_or_else(|| format!("include directive `{name}` without a --file argument"))?;

        let end_parse =
            line_comment_directive_parser(&self.comment_marker, Some(&self.directive_prefix));
        let end_name = name.clone();
        let block_end = move |probe: &str| -> Result<bool, String> {
            let Some((token, remainder, prefix)) = end_parse(probe) else { return Ok(false) };
            if prefix.is_none() || token != "includeEnd" {
                return Ok(false);
            }
            let args = tokenize_args(remainder).map_err(|e| e.to_string())?;
            match args.first() {
                Some(n) if *n == end_name => Ok(true),
                other => Err(format!(
                    "includeEnd name {:?} does not match include `{end_name}`",
                    other.map(String::as_str).unwrap_or("")
                )),
            }
        };

        let target = payload.path.parent().unwrap_or_else(|| Path::new(".")).join(&file);
        Ok(Some(Candidate {
            directive: "include".to_string(),
            args_text: remainder.to_string(),
            block_end: Some(Box::new(block_end)),
            render: Box::new(move |_payload| self.render_file(&target)),
        }))
    }

    fn render_file(&self, target: &Path) -> Result<Rendered, String> {
        let realized =
            crate::utils::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
        {
            let mut state = self.state.borrow_mut();
            if state.visiting.contains(&realized) || state.visiting.len() >= self.max_depth {
                if !state.cycles.contains(&realized) {
                    state.cycles.push(realized.clone());
                }
                let chain = state
                    .visiting
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(" -> ");
                return Err(format!("include cycle: {chain} -> {}", realized.display()));
            }
            state.visiting.push(realized);
        }
        let result = fs::read_to_string(target)
            .map_err(|err| format!("unable to read include {}: {err}", target.display()))
            .map(|text| {
                let expanded = self.rewrite(&text, target);
                Rendered::Lines(expanded.text.lines().map(str::to_string).collect())
            });
        self.state.borrow_mut().visiting.pop();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run_inline(matched: &str, replacement: &str, input: &str) -> RewriteOutcome {
        let mut engine = DirectiveEngine::new(
            |line: &str, _no: usize, _p: &()| {
                if line == matched {
                    Ok(Some(Candidate {
                        directive: "subst".to_string(),
                        args_text: String::new(),
                        block_end: None,
                        render: Box::new(move |_| Ok(Rendered::Text(replacement.to_string()))),
                    }))
                } else {
                    Ok(None)
                }
            },
            |_: &ErrorContext<'_>| ErrorDisposition::Abandon,
        );
        engine.rewrite(input, &())
    }

    fn run_block(input: &str, obs: &mut dyn DirectiveObserver) -> RewriteOutcome {
        let mut engine = DirectiveEngine::new(
            |line: &str, _no: usize, _p: &()| {
                if line == "BEGIN" {
                    Ok(Some(Candidate {
                        directive: "block".to_string(),
                        args_text: String::new(),
                        block_end: Some(Box::new(|probe: &str| Ok(probe == "END"))),
                        render: Box::new(|_| {
                            Ok(Rendered::Lines(vec!["a".to_string(), "b".to_string()]))
                        }),
                    }))
                } else {
                    Ok(None)
                }
            },
            |_: &ErrorContext<'_>| ErrorDisposition::Abandon,
        );
        engine.rewrite_observed(input, &(), obs)
    }

    #[test]
    fn inline_replacement_preserves_lf() {
        let out = run_inline("B", "Z", "A\nB\n");
        assert_eq!(out.text, "A\nZ\n");
        assert!(out.changed);
        assert!(!out.aborted);
    }

    #[test]
    fn untouched_input_round_trips() {
        let out = run_inline("nope", "Z", "A\r\nB");
        assert_eq!(out.text, "A\r\nB");
        assert!(!out.changed);
    }

    #[test]
    fn block_replacement_preserves_crlf() {
        let out = run_block("X\r\nBEGIN\r\nOLD\r\nEND\r\nY\r\n", &mut NullObserver);
        assert_eq!(out.text, "X\r\nBEGIN\r\na\r\nb\r\nEND\r\nY\r\n");
    }

    #[test]
    fn unterminated_block_reports_once_and_abandons() {
        struct Counter(usize);
        impl DirectiveObserver for Counter {
            fn on_error(&mut self, ctx: &ErrorContext<'_>) {
                assert_eq!(ctx.phase, ErrorPhase::UnterminatedBlock);
                self.0 += 1;
            }
        }
        let mut obs = Counter(0);
        let out = run_block("BEGIN\nOLD\n", &mut obs);
        assert!(out.aborted);
        assert_eq!(obs.0, 1);
    }

    #[test]
    fn continue_policy_preserves_original_on_render_error() {
        let mut engine = DirectiveEngine::new(
            |line: &str, _no: usize, _p: &()| {
                if line == "B" {
                    Ok(Some(Candidate {
                        directive: "boom".to_string(),
                        args_text: String::new(),
                        block_end: None,
                        render: Box::new(|_| Err("nope".to_string())),
                    }))
                } else {
                    Ok(None)
                }
            },
            |_: &ErrorContext<'_>| ErrorDisposition::Continue,
        );
        let out = engine.rewrite("A\nB\nC\n", &());
        assert_eq!(out.text, "A\nB\nC\n");
        assert!(!out.aborted);
    }

    #[test]
    fn tokenizer_quoting_rules() {
        assert_eq!(
            tokenize_args(r#"one 'two three' "four \"five\"" six"#).unwrap(),
            vec!["one", "two three", r#"four "five""#, "six"]
        );
        assert_eq!(tokenize_args(r#""a\$b""#).unwrap(), vec!["a$b"]);
        // a backslash before an unspecial character is literal
        assert_eq!(tokenize_args(r#""a\nb""#).unwrap(), vec![r"a\nb"]);
        assert_eq!(tokenize_args("'unclosed"), Err(ParseError::UnclosedQuote(0)));
    }

    #[test]
    fn comment_directive_parser() {
        let parse = line_comment_directive_parser("--", Some("#"));
        let (token, remainder, prefix) =
            parse("-- #include nav --file partials/nav.sql").unwrap();
        assert_eq!(token, "include");
        assert_eq!(remainder, "nav --file partials/nav.sql");
        assert_eq!(prefix.as_deref(), Some("#"));

        let (token, _, prefix) = parse("--vanilla words").unwrap();
        assert_eq!(token, "vanilla");
        assert_eq!(prefix, None);
        assert!(parse("SELECT 1;").is_none());
    }

    #[test]
    fn start_line_offsets_reported_numbers() {
        struct Numbers(Vec<usize>);
        impl DirectiveObserver for Numbers {
            fn on_line(&mut self, _line: &str, line_no: usize) {
                self.0.push(line_no);
            }
        }
        let mut obs = Numbers(Vec::new());
        let mut engine = DirectiveEngine::new(
            |_line: &str, _no: usize, _p: &()| Ok(None::<Candidate<'_, ()>>),
            |_: &ErrorContext<'_>| ErrorDisposition::Abandon,
        )
        .with_start_line(10);
        engine.rewrite_observed("A\nB\n", &(), &mut obs);
        assert_eq!(obs.0, vec![10, 11]);
    }

    #[test]
    fn block_render_text_gets_one_terminator() {
        let mut engine = DirectiveEngine::new(
            |line: &str, _no: usize, _p: &()| {
                if line == "BEGIN" {
                    Ok(Some(Candidate {
                        directive: "block".to_string(),
                        args_text: String::new(),
                        block_end: Some(Box::new(|probe: &str| Ok(probe == "END"))),
                        render: Box::new(|_| Ok(Rendered::Text("only".to_string()))),
                    }))
                } else {
                    Ok(None)
                }
            },
            |_: &ErrorContext<'_>| ErrorDisposition::Abandon,
        );
        let out = engine.rewrite("BEGIN\none\ntwo\nEND\n", &());
        assert_eq!(out.text, "BEGIN\nonly\nEND\n");
    }

    #[test]
    fn mismatched_include_end_is_a_block_end_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("nav.sql"), "SELECT 'nav';\n").unwrap();
        let source = tmp.path().join("page.sql");
        // the end line names a different block; the proper end follows
        let text = "-- #include nav --file nav.sql\n-- #includeEnd other\n-- #includeEnd nav\n";
        std::fs::write(&source, text).unwrap();

        struct Phases(Vec<ErrorPhase>);
        impl DirectiveObserver for Phases {
            fn on_error(&mut self, ctx: &ErrorContext<'_>) {
                self.0.push(ctx.phase);
            }
        }
        let mut obs = Phases(Vec::new());
        let includes = IncludeDirectives::new();
        let out = includes.rewrite_observed(text, &source, &mut obs);
        assert_eq!(obs.0, vec![ErrorPhase::BlockEnd]);
        // the matching end still closes the block
        assert!(out.text.ends_with("-- #includeEnd nav\n"));
        assert!(out.changed);
    }

    #[test]
    fn include_block_replaces_inner_buffer() {
        let tmp = tempfile::tempdir().unwrap();
        let partial = tmp.path().join("nav.sql");
        std::fs::write(&partial, "SELECT 'nav';\n").unwrap();
        let source = tmp.path().join("page.sql");
        let text = "-- #include nav --file nav.sql\nstale\n-- #includeEnd nav\n";
        std::fs::write(&source, text).unwrap();

        let includes = IncludeDirectives::new();
        let out = includes.rewrite(text, &source);
        assert_eq!(
            out.text,
            "-- #include nav --file nav.sql\nSELECT 'nav';\n-- #includeEnd nav\n"
        );
        assert!(out.changed);
    }

    #[test]
    fn include_cycle_is_skipped_and_recorded_once() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.sql");
        let b = tmp.path().join("b.sql");
        std::fs::write(&a, "-- #include b --file b.sql\nx\n-- #includeEnd b\n").unwrap();
        std::fs::write(&b, "-- #include a --file a.sql\ny\n-- #includeEnd a\n").unwrap();

        let includes = IncludeDirectives::new();
        let text = std::fs::read_to_string(&a).unwrap();
        let out = includes.rewrite(&text, &a);
        assert!(!out.aborted);
        assert!(out.text.contains("#include b"));
        assert_eq!(includes.cycles().len(), 1);
    }
}

//! Type inference through an external type checker.
//!
//! The source of a unit is rewritten so that every target call's receiver is
//! passed to `reveal_type`, the checker runs once over the rewritten text, and
//! the `Revealed type is "..."` notes it prints are mapped back to the
//! targets. Directives never add or remove a newline, so a note's line number
//! is always the line of the directive that produced it.

use ruff_python_ast::{self as ast, Expr};
use ruff_source_file::{LineIndex, SourceCode};
use ruff_text_size::{Ranged, TextSize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::process::Command;
use tracing::{debug, warn};

use crate::error::OracleError;
use crate::tree::{ExprId, Placement, Target};

const REVEAL: &str = "reveal_type";
const NOTE_MARKER: &str = ": note: Revealed type is ";

pub const DEFAULT_MYPY: &str = "mypy";
pub const DEFAULT_MYPY_ARGS: &[&str] = &["--check-untyped-defs", "--ignore-missing-imports"];

/// Type wrappers peeled off a revealed type to reach the concrete type.
const WRAPPERS: &[&str] = &[
    "Optional",
    "typing.Optional",
    "Type",
    "typing.Type",
    "type",
    "builtins.type",
    "Union",
    "typing.Union",
];

/// An external static type checker.
pub trait TypeOracle: Send + Sync {
    /// Type-check `source` and return the checker's diagnostic output.
    ///
    /// An `Err` means the checker could not run; type errors in `source`
    /// are ordinary output.
    fn run(&self, source: &str) -> Result<String, OracleError>;
}

/// Runs mypy as a subprocess on a temporary copy of the rewritten source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MypyOracle {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for MypyOracle {
    fn default() -> Self {
        Self {
            program: DEFAULT_MYPY.to_string(),
            args: DEFAULT_MYPY_ARGS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl MypyOracle {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl TypeOracle for MypyOracle {
    fn run(&self, source: &str) -> Result<String, OracleError> {
        let mut file = tempfile::Builder::new()
            .prefix("dslinter_")
            .suffix(".py")
            .tempfile()
            .map_err(OracleError::TempFile)?;
        file.write_all(source.as_bytes())
            .map_err(OracleError::TempFile)?;
        file.flush().map_err(OracleError::TempFile)?;

        debug!(program = %self.program, path = %file.path().display(), "invoking type checker");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("--show-column-numbers")
            .arg(file.path())
            .output()
            .map_err(|source| OracleError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // mypy: 0 = clean, 1 = type errors reported, 2 = crash or bad usage
        match output.status.code() {
            Some(0) | Some(1) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let detail = if stderr.is_empty() {
                    String::from_utf8_lossy(&output.stdout).trim().to_string()
                } else {
                    stderr
                };
                Err(OracleError::Failed {
                    status: code.unwrap_or(-1),
                    stderr: detail,
                })
            }
        }
    }
}

/// Inferred receiver types, keyed by the call expression they belong to.
///
/// A call missing from the map has an unknown type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeMap {
    types: HashMap<ExprId, String>,
}

impl TypeMap {
    pub fn get(&self, expr: &Expr) -> Option<&str> {
        self.types.get(&ExprId::of(expr)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    fn insert(&mut self, id: ExprId, type_name: String) {
        self.types.insert(id, type_name);
    }
}

/// One `reveal_type` directive inserted into the rewritten source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub line: usize,
    pub target: ExprId,
    pub receiver: String,
}

/// Rewritten source plus its directives, ordered as they appear in the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub text: String,
    pub directives: Vec<Directive>,
}

/// Insert a `reveal_type` directive for the receiver of every target.
///
/// Targets whose receiver cannot be extracted get no directive.
pub fn add_reveal_type_calls<'a, F>(source: &str, targets: &[Target<'a>], receiver: F) -> Rewrite
where
    F: Fn(&'a Expr) -> Option<&'a ast::ExprName>,
{
    let line_index = LineIndex::from_source_text(source);
    let source_code = SourceCode::new(source, &line_index);

    let mut ordered = targets.to_vec();
    ordered.sort_by_key(|t| (t.expr.start(), t.expr.end()));

    let mut edits: Vec<(TextSize, String)> = Vec::new();
    let mut placed: Vec<(TextSize, usize, Directive)> = Vec::new();
    for (seq, target) in ordered.iter().enumerate() {
        let Some(name) = receiver(target.expr) else {
            continue;
        };
        let id = name.id.as_str();
        let anchor = match target.placement {
            Placement::AfterStatement(end) => {
                edits.push((end, format!("; {REVEAL}({id})")));
                end
            }
            Placement::Inline => {
                edits.push((name.start(), format!("{REVEAL}(")));
                edits.push((name.end(), ")".to_string()));
                name.start()
            }
        };
        let line = source_code.line_column(anchor).line.get();
        placed.push((
            anchor,
            seq,
            Directive {
                line,
                target: ExprId::of(target.expr),
                receiver: id.to_string(),
            },
        ));
    }

    // Stable: appended directives sharing a statement end keep source order.
    edits.sort_by_key(|(offset, _)| *offset);
    placed.sort_by_key(|(anchor, seq, _)| (*anchor, *seq));

    let mut text = String::with_capacity(source.len() + edits.len() * 20);
    let mut last = 0;
    for (offset, insert) in &edits {
        let at = usize::from(*offset);
        text.push_str(&source[last..at]);
        text.push_str(insert);
        last = at;
    }
    text.push_str(&source[last..]);

    Rewrite {
        text,
        directives: placed.into_iter().map(|(_, _, d)| d).collect(),
    }
}

/// How the checker summarized its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Summary {
    Clean,
    Errors(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealNote {
    pub line: usize,
    pub column: Option<usize>,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleReport {
    pub notes: Vec<RevealNote>,
    pub summary: Summary,
}

/// Parse checker output into reveal notes.
///
/// Lines other than reveal notes and the summary line are ignored. Output
/// without a summary line is not trusted.
pub fn parse_oracle_output(output: &str) -> Result<OracleReport, OracleError> {
    let mut notes = Vec::new();
    let mut summary = None;
    for line in output.lines() {
        if let Some(note) = parse_reveal_note(line) {
            notes.push(note);
        } else if let Some(s) = parse_summary(line) {
            summary = Some(s);
        }
    }
    let Some(summary) = summary else {
        let head: String = output.lines().take(3).collect::<Vec<_>>().join("\n");
        return Err(OracleError::UnparseableOutput(head));
    };
    Ok(OracleReport { notes, summary })
}

fn parse_reveal_note(line: &str) -> Option<RevealNote> {
    let (location, rest) = line.split_once(NOTE_MARKER)?;
    let rest = rest.trim_end();
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let literal = rest[1..].strip_suffix(quote)?;
    let (line, column) = parse_location(location)?;
    Some(RevealNote {
        line,
        column,
        type_name: bare_type_name(literal),
    })
}

/// `path:line` or `path:line:column`; the path itself may contain colons.
fn parse_location(location: &str) -> Option<(usize, Option<usize>)> {
    let mut parts = location.rsplitn(3, ':');
    let last = parts.next()?;
    let second = parts.next()?;
    match (second.parse::<usize>(), last.parse::<usize>()) {
        (Ok(line), Ok(column)) if parts.next().is_some() => Some((line, Some(column))),
        (_, Ok(line)) => Some((line, None)),
        _ => None,
    }
}

fn parse_summary(line: &str) -> Option<Summary> {
    if line.starts_with("Success: no issues found") {
        return Some(Summary::Clean);
    }
    let rest = line.strip_prefix("Found ")?;
    let (count, tail) = rest.split_once(' ')?;
    if !tail.starts_with("error") {
        return None;
    }
    count.parse().ok().map(Summary::Errors)
}

/// Reduce a revealed type string to its concrete dotted type name.
///
/// `Union[pandas.core.frame.DataFrame, None]` and `Type[...]` unwrap to the
/// inner type, generic arguments are dropped, and a union of several
/// non-None members is returned as-is.
pub fn bare_type_name(raw: &str) -> String {
    let mut current = raw.trim();
    loop {
        current = current.trim_end_matches(['*', '?']);
        let members: Vec<&str> = split_top_level(current, '|')
            .into_iter()
            .filter(|m| *m != "None")
            .collect();
        match members.as_slice() {
            [only] => current = only.trim_end_matches(['*', '?']),
            _ => return current.to_string(),
        }

        let Some((head, args)) = generic_parts(current) else {
            return current.to_string();
        };
        if !WRAPPERS.contains(&head) {
            return head.to_string();
        }
        let inner: Vec<&str> = split_top_level(args, ',')
            .into_iter()
            .filter(|m| m.trim_end_matches(['*', '?']) != "None")
            .collect();
        match inner.as_slice() {
            [only] => current = *only,
            _ => return current.to_string(),
        }
    }
}

fn generic_parts(s: &str) -> Option<(&str, &str)> {
    let open = s.find('[')?;
    let args = s[open + 1..].strip_suffix(']')?;
    Some((s[..open].trim(), args))
}

fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}

/// Classify the receiver type of every target with one checker run.
///
/// When no target has an extractable receiver the checker is not run.
pub fn classify<'a, O, F>(
    oracle: &O,
    source: &str,
    targets: &[Target<'a>],
    receiver: F,
) -> Result<TypeMap, OracleError>
where
    O: TypeOracle + ?Sized,
    F: Fn(&'a Expr) -> Option<&'a ast::ExprName>,
{
    let rewrite = add_reveal_type_calls(source, targets, receiver);
    if rewrite.directives.is_empty() {
        debug!("no reveal targets, type checker not invoked");
        return Ok(TypeMap::default());
    }
    debug!(directives = rewrite.directives.len(), "classifying call receivers");
    let output = oracle.run(&rewrite.text)?;
    let report = parse_oracle_output(&output)?;
    if let Summary::Errors(count) = report.summary {
        debug!(errors = count, "type checker reported errors in unit");
    }
    Ok(associate(&rewrite.directives, report.notes))
}

fn associate(directives: &[Directive], notes: Vec<RevealNote>) -> TypeMap {
    let mut expected: BTreeMap<usize, Vec<&Directive>> = BTreeMap::new();
    for directive in directives {
        expected.entry(directive.line).or_default().push(directive);
    }
    let mut revealed: BTreeMap<usize, Vec<RevealNote>> = BTreeMap::new();
    for note in notes {
        revealed.entry(note.line).or_default().push(note);
    }

    let mut types = TypeMap::default();
    for (line, wanted) in expected {
        let mut found = revealed.remove(&line).unwrap_or_default();
        if found.len() != wanted.len() {
            if found.is_empty() {
                debug!(line, "no reveal notes for line");
            } else {
                let receivers: Vec<&str> = wanted.iter().map(|d| d.receiver.as_str()).collect();
                warn!(
                    line,
                    receivers = ?receivers,
                    found = found.len(),
                    "reveal notes do not match directives, dropping line"
                );
            }
            continue;
        }
        found.sort_by_key(|n| n.column.unwrap_or(0));
        for (directive, note) in wanted.into_iter().zip(found) {
            types.insert(directive.target, note.type_name);
        }
    }
    types
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers every `reveal_type(name)` in the source from a fixed table,
    /// the way mypy would print it.
    #[derive(Default)]
    pub(crate) struct FakeOracle {
        types: HashMap<String, String>,
        pub(crate) runs: AtomicUsize,
        pub(crate) last_source: Mutex<Option<String>>,
    }

    impl FakeOracle {
        pub(crate) fn new(types: &[(&str, &str)]) -> Self {
            Self {
                types: types
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Self::default()
            }
        }
    }

    impl TypeOracle for FakeOracle {
        fn run(&self, source: &str) -> Result<String, OracleError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            *self.last_source.lock().unwrap() = Some(source.to_string());
            let mut out = String::new();
            for (idx, line) in source.lines().enumerate() {
                for (pos, _) in line.match_indices("reveal_type(") {
                    let rest = &line[pos + "reveal_type(".len()..];
                    let name = rest.split(')').next().unwrap_or_default();
                    let ty = self.types.get(name).map(String::as_str).unwrap_or("Any");
                    out.push_str(&format!(
                        "/tmp/dslinter_unit.py:{}:{}: note: Revealed type is \"{}\"\n",
                        idx + 1,
                        pos + 1,
                        ty
                    ));
                }
            }
            out.push_str("Success: no issues found in 1 source file\n");
            Ok(out)
        }
    }

    /// Always fails to run.
    pub(crate) struct BrokenOracle;

    impl TypeOracle for BrokenOracle {
        fn run(&self, _source: &str) -> Result<String, OracleError> {
            Err(OracleError::Failed {
                status: 2,
                stderr: "mypy: error: unrecognized arguments".to_string(),
            })
        }
    }
}

//! Static checks for misuse of pandas DataFrames in Python source.
//!
//! Which calls are made on a DataFrame is decided by mypy: every call
//! receiver in a module is revealed through [`oracle::classify`] before the
//! detectors run over the module's statements.

pub mod error;
pub mod oracle;
#[cfg(feature = "python")]
mod python;
pub mod tree;

use ruff_python_ast::visitor::{walk_stmt, Visitor};
use ruff_python_ast::{self as ast, Expr, ModModule, Stmt};
use ruff_python_parser::parse_module;
use ruff_source_file::{LineIndex, SourceCode};
use ruff_text_size::{Ranged, TextSize};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub use error::{exit_code, CheckError, OracleError};
pub use oracle::{MypyOracle, TypeMap, TypeOracle};

// ──────────────────────────────────────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_VALUE_TYPE: &str = "pandas.core.frame.DataFrame";

#[derive(Deserialize)]
struct Config {
    tool: Option<ToolConfig>,
}

#[derive(Deserialize)]
struct ToolConfig {
    dslinter: Option<LinterConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct LinterConfig {
    enabled: Option<bool>,
    value_type: Option<String>,
    disable: Option<Vec<String>>,
    mypy: Option<String>,
    mypy_args: Option<Vec<String>>,
}

/// Resolved `[tool.dslinter]` settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub enabled: bool,
    /// Dotted type name all three rules are about.
    pub value_type: String,
    /// Rule codes that are never reported.
    pub disabled: Vec<String>,
    pub mypy: String,
    pub mypy_args: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let oracle = MypyOracle::default();
        Self {
            enabled: true,
            value_type: DEFAULT_VALUE_TYPE.to_string(),
            disabled: Vec::new(),
            mypy: oracle.program,
            mypy_args: oracle.args,
        }
    }
}

/// Command-line values that take precedence over `pyproject.toml`.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub value_type: Option<String>,
    pub mypy: Option<String>,
}

impl Settings {
    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(value_type) = &overrides.value_type {
            self.value_type = value_type.clone();
        }
        if let Some(mypy) = &overrides.mypy {
            self.mypy = mypy.clone();
        }
    }

    pub fn oracle(&self) -> MypyOracle {
        MypyOracle::new(self.mypy.clone(), self.mypy_args.clone())
    }
}

fn load_linter_config(project_root: &Path) -> LinterConfig {
    let config_path = project_root.join("pyproject.toml");
    let Ok(content) = fs::read_to_string(config_path) else {
        return LinterConfig::default();
    };
    let Ok(config) = toml::from_str::<Config>(&content) else {
        debug!(root = %project_root.display(), "ignoring malformed pyproject.toml");
        return LinterConfig::default();
    };
    config
        .tool
        .and_then(|t| t.dslinter)
        .unwrap_or_default()
}

/// Settings from `pyproject.toml` under `project_root`, defaults where unset.
pub fn load_settings(project_root: &Path) -> Settings {
    let config = load_linter_config(project_root);
    let defaults = Settings::default();
    for code in config.disable.iter().flatten() {
        if !ALL_CODES.contains(&code.as_str()) {
            warn!(code = %code, "unknown rule code in [tool.dslinter] disable");
        }
    }
    Settings {
        enabled: config.enabled.unwrap_or(defaults.enabled),
        value_type: config.value_type.unwrap_or(defaults.value_type),
        disabled: config.disable.unwrap_or(defaults.disabled),
        mypy: config.mypy.unwrap_or(defaults.mypy),
        mypy_args: config.mypy_args.unwrap_or(defaults.mypy_args),
    }
}

pub fn find_project_root(start_path: &Path) -> PathBuf {
    let mut current = start_path.to_path_buf();
    if current.is_file() {
        current.pop();
    }
    loop {
        if current.join("pyproject.toml").exists() {
            return current;
        }
        if !current.pop() {
            return start_path.to_path_buf();
        }
    }
}

/// All `.py` files under `dir`, skipping hidden entries, in path order.
pub fn collect_py_files(dir: &Path) -> Vec<PathBuf> {
    let mut result = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("py") {
                result.push(path);
            }
        }
    }
    result.sort();
    result
}

// ──────────────────────────────────────────────────────────────────────────────
// Diagnostic codes
// ──────────────────────────────────────────────────────────────────────────────

pub const CODE_VALUE_LOST: &str = "value-lost";
pub const CODE_VALUE_ITERATION: &str = "value-iteration";
pub const CODE_VALUE_ITERATION_MUTATION: &str = "value-iteration-mutation";

pub const ALL_CODES: &[&str] = &[
    CODE_VALUE_LOST,
    CODE_VALUE_ITERATION,
    CODE_VALUE_ITERATION_MUTATION,
];

/// Return true if the source line at `line` (1-indexed) carries a
/// `# dslinter: ignore` or `# dslinter: ignore[code, ...]` comment covering `code`.
fn is_line_ignored(source: &str, line: usize, code: &str) -> bool {
    let Some(line_text) = line.checked_sub(1).and_then(|idx| source.lines().nth(idx)) else {
        return false;
    };
    let marker = "# dslinter: ignore";
    let Some(pos) = line_text.find(marker) else {
        return false;
    };
    let after = &line_text[pos + marker.len()..];
    if after.trim_start().is_empty() || after.starts_with(char::is_whitespace) {
        return true;
    }
    if let Some(codes) = after.strip_prefix('[').and_then(|rest| rest.split_once(']')) {
        return codes.0.split(',').map(str::trim).any(|c| c == code);
    }
    false
}

// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Violation {
    pub line: usize,
    pub col: usize,
    pub code: String,
    pub message: String,
    pub severity: String,
}

/// Outcome of checking one analysis unit.
///
/// `errors` holds detections that could not complete. Findings from every
/// other detection in the unit are still in `violations`.
#[derive(Debug, Default)]
pub struct UnitReport {
    pub violations: Vec<Violation>,
    pub errors: Vec<CheckError>,
}

/// Check one file with the settings of its project.
pub fn check_path(path: &Path, settings: &Settings) -> Result<UnitReport, CheckError> {
    if !settings.enabled {
        return Ok(UnitReport::default());
    }
    let source = fs::read_to_string(path).map_err(|source| CheckError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Linter::new(settings.clone()).check_source(&source, path)
}

pub struct Linter {
    settings: Settings,
    oracle: Arc<dyn TypeOracle>,
    call_types: TypeMap, // call expression -> inferred type of its receiver
    line_index: LineIndex,
    source: String,
}

impl Linter {
    pub fn new(settings: Settings) -> Self {
        let oracle = Arc::new(settings.oracle());
        Self::with_oracle(settings, oracle)
    }

    pub fn with_oracle(settings: Settings, oracle: Arc<dyn TypeOracle>) -> Self {
        Self {
            settings,
            oracle,
            call_types: TypeMap::default(),
            line_index: LineIndex::from_source_text(""),
            source: String::new(),
        }
    }

    fn source_location(&self, offset: TextSize) -> (usize, usize) {
        let loc = SourceCode::new(&self.source, &self.line_index).line_column(offset);
        (loc.line.get(), loc.column.get())
    }

    /// Check one analysis unit.
    ///
    /// The type checker runs at most once. Its failure fails this unit only.
    /// A detection that cannot complete is reported in the returned
    /// `errors` without discarding the other findings.
    pub fn check_source(&mut self, source: &str, path: &Path) -> Result<UnitReport, CheckError> {
        self.source = source.to_string();
        self.line_index = LineIndex::from_source_text(source);
        let parsed = parse_module(source).map_err(|e| CheckError::Parse(e.to_string()))?;
        let module = parsed.syntax();

        self.visit_module(module)?;

        let (mut violations, errors) = {
            let mut pass = DetectorPass {
                linter: self,
                violations: Vec::new(),
                errors: Vec::new(),
            };
            pass.visit_body(&module.body);
            (pass.violations, pass.errors)
        };
        self.call_types = TypeMap::default();

        violations.retain(|v| {
            !self.settings.disabled.contains(&v.code) && !is_line_ignored(source, v.line, &v.code)
        });
        debug!(
            path = %path.display(),
            findings = violations.len(),
            errors = errors.len(),
            "checked unit"
        );
        Ok(UnitReport { violations, errors })
    }

    /// Classify every call receiver in the module before any statement is visited.
    fn visit_module(&mut self, module: &ModModule) -> Result<(), OracleError> {
        let targets = tree::collect_call_targets(module);
        let call_types = oracle::classify(
            self.oracle.as_ref(),
            &self.source,
            &targets,
            tree::call_receiver,
        )?;
        debug!(
            targets = targets.len(),
            classified = call_types.len(),
            "classified call receivers"
        );
        self.call_types = call_types;
        Ok(())
    }

    fn is_tracked(&self, expr: &Expr) -> bool {
        self.call_types.get(expr) == Some(self.settings.value_type.as_str())
    }

    /// Last segment of the tracked type, for messages.
    fn value_kind(&self) -> &str {
        let value_type = self.settings.value_type.as_str();
        value_type.rsplit('.').next().unwrap_or(value_type)
    }

    fn violation(&self, offset: TextSize, code: &str, message: String) -> Violation {
        let (line, col) = self.source_location(offset);
        Violation {
            line,
            col,
            code: code.to_string(),
            message,
            severity: "warning".to_string(),
        }
    }

    /// `df.method(...)` standing alone as a statement, not in-place.
    ///
    /// Chained calls such as `df.abs().sum()` are not simple calls and are
    /// never reported.
    fn check_lost_result(&self, stmt: &ast::StmtExpr, violations: &mut Vec<Violation>) {
        let Expr::Call(call) = &*stmt.value else {
            return;
        };
        let Some(receiver) = tree::call_receiver(&stmt.value) else {
            return;
        };
        if tree::is_inplace(call) || !self.is_tracked(&stmt.value) {
            return;
        }
        let kind = self.value_kind();
        let method = tree::call_method(call).unwrap_or_default();
        violations.push(self.violation(
            call.start(),
            CODE_VALUE_LOST,
            format!(
                "Result of `{}.{}()` on a {kind} is not assigned; most {kind} operations return a new object",
                receiver.id.as_str(),
                method
            ),
        ));
    }

    /// `for ... in df.method(...)`, plus writes to the loop variables inside the body.
    ///
    /// The iteration finding is pushed before the body is inspected, so it
    /// survives a mutation check that fails.
    fn check_loop(
        &self,
        for_stmt: &ast::StmtFor,
        violations: &mut Vec<Violation>,
    ) -> Result<(), CheckError> {
        let Expr::Call(call) = &*for_stmt.iter else {
            return Ok(());
        };
        if !self.is_tracked(&for_stmt.iter) {
            return Ok(());
        }
        let kind = self.value_kind();
        let method = tree::call_method(call).unwrap_or_default();
        violations.push(self.violation(
            call.start(),
            CODE_VALUE_ITERATION,
            format!(
                "Iterating over a {kind} row by row with `.{method}()` is slow; prefer vectorized operations"
            ),
        ));

        let bound = tree::bound_names(&for_stmt.target);
        let assigned = tree::assigned_names(&for_stmt.body).map_err(|target| {
            let (line, column) = self.source_location(target.start());
            CheckError::UnresolvedTarget { line, column }
        })?;
        if let Some(name) = bound.iter().find(|name| assigned.contains(*name)) {
            violations.push(self.violation(
                for_stmt.start(),
                CODE_VALUE_ITERATION_MUTATION,
                format!("Loop variable `{name}` from iterating over a {kind} is modified inside the loop"),
            ));
        }
        Ok(())
    }
}

struct DetectorPass<'l> {
    linter: &'l Linter,
    violations: Vec<Violation>,
    errors: Vec<CheckError>,
}

impl<'a> Visitor<'a> for DetectorPass<'_> {
    fn visit_stmt(&mut self, stmt: &'a Stmt) {
        match stmt {
            Stmt::Expr(expr_stmt) => {
                self.linter
                    .check_lost_result(expr_stmt, &mut self.violations);
            }
            Stmt::For(for_stmt) => {
                if let Err(err) = self.linter.check_loop(for_stmt, &mut self.violations) {
                    self.errors.push(err);
                }
            }
            _ => {}
        }
        walk_stmt(self, stmt);
    }

    // Detectors only match a statement and its direct children.
    fn visit_expr(&mut self, _expr: &'a Expr) {}
}

//! Error types for the checker and the type oracle.

use std::path::PathBuf;

use thiserror::Error;

/// Process exit codes for the `dslinter` binary.
pub mod exit_code {
    /// No findings.
    pub const CLEAN: i32 = 0;
    /// At least one finding was reported.
    pub const FINDINGS: i32 = 1;
    /// A unit could not be checked (parse error, oracle failure, internal error).
    pub const TOOL_ERROR: i32 = 2;
}

/// The type checker could not be run, or its output could not be understood.
///
/// A run that completes and simply reveals nothing is not an error.
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("failed to run type checker `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("failed to stage source for type checker: {0}")]
    TempFile(#[source] std::io::Error),

    #[error("type checker exited with status {status}: {stderr}")]
    Failed { status: i32, stderr: String },

    #[error("type checker output has no summary line: {0:?}")]
    UnparseableOutput(String),
}

/// Errors that abort the check of a single analysis unit.
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    /// An assignment target inside a loop body has no underlying name.
    #[error("assignment target at line {line}, column {column} has no named root")]
    UnresolvedTarget { line: usize, column: usize },
}

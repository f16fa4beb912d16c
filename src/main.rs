use clap::Parser;
use rayon::prelude::*;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, Level};

use _dslinter::{
    check_path, collect_py_files, exit_code, find_project_root, load_settings, CheckError,
    Overrides, UnitReport, Violation,
};

#[derive(Parser, Debug)]
#[command(
    name = "dslinter",
    version,
    about = "Flag misuse of pandas DataFrames, using mypy to find them"
)]
struct Cli {
    /// Python files or directories to check.
    #[arg(required = true)]
    paths: Vec<PathBuf>,
    #[arg(long, help = "Output machine-readable JSON")]
    json: bool,
    #[arg(long, value_name = "EXE", help = "mypy executable to run")]
    mypy: Option<String>,
    #[arg(
        long,
        value_name = "TYPE",
        help = "Dotted type name to treat as the DataFrame type"
    )]
    value_type: Option<String>,
    #[arg(short, long, conflicts_with = "quiet", help = "Log debug output")]
    verbose: bool,
    #[arg(short, long, help = "Only log errors")]
    quiet: bool,
}

#[derive(Serialize)]
struct Finding<'a> {
    path: String,
    #[serde(flatten)]
    violation: &'a Violation,
}

fn expand_paths(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            files.extend(collect_py_files(path));
        } else if path.exists() {
            files.push(path.clone());
        } else {
            anyhow::bail!("no such file or directory: {}", path.display());
        }
    }
    Ok(files)
}

fn run(cli: &Cli) -> anyhow::Result<i32> {
    let files = expand_paths(&cli.paths)?;
    let overrides = Overrides {
        value_type: cli.value_type.clone(),
        mypy: cli.mypy.clone(),
    };

    // Each file is its own unit with its own type map.
    let results: Vec<(PathBuf, Result<UnitReport, CheckError>)> = files
        .into_par_iter()
        .map(|path| {
            let mut settings = load_settings(&find_project_root(&path));
            settings.apply(&overrides);
            let result = check_path(&path, &settings);
            (path, result)
        })
        .collect();

    let mut findings = Vec::new();
    let mut failed = false;
    for (path, result) in &results {
        match result {
            Ok(report) => {
                for err in &report.errors {
                    failed = true;
                    error!(path = %path.display(), "{err}");
                }
                findings.extend(report.violations.iter().map(|violation| Finding {
                    path: path.display().to_string(),
                    violation,
                }));
            }
            Err(err) => {
                failed = true;
                error!(path = %path.display(), "{err}");
            }
        }
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&findings)?);
    } else {
        for finding in &findings {
            let v = finding.violation;
            println!(
                "{}:{}:{}: {} {}",
                finding.path, v.line, v.col, v.code, v.message
            );
        }
    }

    Ok(if failed {
        exit_code::TOOL_ERROR
    } else if findings.is_empty() {
        exit_code::CLEAN
    } else {
        exit_code::FINDINGS
    })
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(exit_code::TOOL_ERROR);
        }
    }
}

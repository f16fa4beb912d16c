use pyo3::prelude::*;
use std::path::Path;

use crate::{check_path, find_project_root, load_settings, CheckError};

/// Check one file and return `{"violations": [...], "errors": [...]}` as JSON.
///
/// `errors` lists detections that could not complete.
#[pyfunction]
fn check_file(file_path: String) -> PyResult<String> {
    let path = Path::new(&file_path);
    let settings = load_settings(&find_project_root(path));

    let report = check_path(path, &settings).map_err(|e| match e {
        CheckError::Read { .. } => {
            PyErr::new::<pyo3::exceptions::PyIOError, _>(format!("{}", e))
        }
        _ => PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e)),
    })?;

    let errors: Vec<String> = report.errors.iter().map(ToString::to_string).collect();
    serde_json::to_string(&serde_json::json!({
        "violations": report.violations,
        "errors": errors,
    }))
    .map_err(|e| PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e)))
}

#[pymodule]
fn _dslinter(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(check_file, m)?)?;
    Ok(())
}

//! ONNX Runtime plumbing shared by the detector and the recognizer.

use std::path::{Path, PathBuf};

use ndarray::Array4;
use ort::session::Session;
use ort::value::{DynValue, TensorRef};
use thiserror::Error;

const INTRA_OP_THREADS: usize = 2;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {} (fetch it from the insightface buffalo_l pack)", .0.display())]
    Missing(PathBuf),
    #[error("unexpected model output: {0}")]
    BadOutput(String),
    #[error("onnx runtime: {0}")]
    Runtime(#[from] ort::Error),
}

/// Build a CPU session for the model at `path`.
pub(crate) fn open_session(path: &Path) -> Result<Session, ModelError> {
    if !path.is_file() {
        return Err(ModelError::Missing(path.to_path_buf()));
    }
    let session = Session::builder()?
        .with_intra_threads(INTRA_OP_THREADS)?
        .commit_from_file(path)?;
    Ok(session)
}

pub(crate) fn output_names(session: &Session) -> Vec<String> {
    session.outputs().iter().map(|o| o.name().to_string()).collect()
}

/// Run one NCHW tensor through the session and hand the outputs to `read`.
pub(crate) fn infer<T>(
    session: &mut Session,
    input: &Array4<f32>,
    read: impl FnOnce(&[&DynValue]) -> Result<T, ModelError>,
) -> Result<T, ModelError> {
    let count = session.outputs().len();
    let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
    let values: Vec<&DynValue> = (0..count).map(|i| &outputs[i]).collect();
    read(&values)
}

/// Flat f32 view of output `idx`, labelled `what` in errors.
pub(crate) fn f32_output<'a>(outputs: &[&'a DynValue], idx: usize, what: &str) -> Result<&'a [f32], ModelError> {
    let value = outputs
        .get(idx)
        .ok_or_else(|| ModelError::BadOutput(format!("{what}: no output at index {idx}")))?;
    value
        .try_extract_tensor::<f32>()
        .map(|(_, data)| data)
        .map_err(|e| ModelError::BadOutput(format!("{what}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_reported_with_path() {
        let err = open_session(Path::new("/nonexistent/det_10g.onnx")).unwrap_err();
        match err {
            ModelError::Missing(path) => assert!(path.ends_with("det_10g.onnx")),
            other => panic!("unexpected error: {other}"),
        }
    }
}

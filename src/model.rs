use std::path::Path;
use std::time::Instant;

use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::errors::{HarnessError, Result};
use crate::metadata::{ModelMetadata, Names};
use crate::postprocess::postprocess;
use crate::predictor::{prepare_input, ImageSource, PredictOptions};
use crate::results::{Results, Speed};
use crate::task::Task;
use crate::traits::DetectionModel;

fn artifact_error<E>(path: &Path, reason: &str, err: E) -> HarnessError
where
    E: std::error::Error + Send + Sync + 'static,
{
    HarnessError::ArtifactLoad {
        path: path.to_path_buf(),
        reason: reason.to_string(),
        source: Some(Box::new(err)),
    }
}

/// A YOLO checkpoint exported to ONNX, running on ONNX Runtime.
pub struct YoloModel {
    session: Mutex<Session>,
    metadata: ModelMetadata,
    input_name: String,
    output_names: Vec<String>,
}

impl YoloModel {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_on_device(path, 0)
    }

    /// Loads the artifact, preferring TensorRT then CUDA on `device_id` and falling back to CPU.
    pub fn load_on_device<P: AsRef<Path>>(path: P, device_id: i32) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(HarnessError::artifact_load(path, "file not found"));
        }

        info!("loading model {}", path.display());
        let session = Session::builder()
            .map_err(|e| artifact_error(path, "session builder initialization", e))?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(|e| artifact_error(path, "execution provider setup", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| artifact_error(path, "graph optimization setup", e))?
            .with_memory_pattern(true)
            .map_err(|e| artifact_error(path, "memory pattern setup", e))?
            .commit_from_file(path)
            .map_err(|e| artifact_error(path, "reading model file", e))?;

        let metadata = {
            let model_metadata = session
                .metadata()
                .map_err(|e| artifact_error(path, "reading model metadata", e))?;
            ModelMetadata::from_lookup(|key| model_metadata.custom(key).ok().flatten())
        };

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| HarnessError::artifact_load(path, "model declares no inputs"))?;
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        if output_names.is_empty() {
            return Err(HarnessError::artifact_load(path, "model declares no outputs"));
        }
        debug!("model input `{input_name}`, outputs {output_names:?}");

        let model = Self {
            session: Mutex::new(session),
            metadata,
            input_name,
            output_names,
        };

        // warm-up run, also rejects graphs whose input does not match the metadata
        let (h, w) = model.metadata.imgsz;
        let dummy = Array4::<f32>::zeros((1, 3, h, w));
        model.run(dummy.view()).map_err(|e| HarnessError::ArtifactLoad {
            path: path.to_path_buf(),
            reason: "warm-up inference".to_string(),
            source: Some(Box::new(e)),
        })?;

        info!(
            "model ready: task={}, classes={}, imgsz={:?}",
            model.metadata.task,
            model.metadata.num_classes(),
            model.metadata.imgsz
        );
        Ok(model)
    }

    pub const fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// (height, width) the model was exported with.
    pub fn imgsz(&self) -> (u32, u32) {
        let (h, w) = self.metadata.imgsz;
        (h as u32, w as u32)
    }

    /// Forward pass, returning every output in declaration order.
    pub fn run(&self, tensor: ArrayView4<f32>) -> Result<Vec<ArrayD<f32>>> {
        let input = tensor.as_standard_layout();
        let mut binding = self.session.lock();
        let outputs = binding.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&input)?
        ])?;

        let mut arrays = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let array = outputs[name.as_str()].try_extract_array::<f32>()?.to_owned();
            debug!("output `{name}` shape {:?}", array.shape());
            arrays.push(array);
        }
        Ok(arrays)
    }
}

impl DetectionModel for YoloModel {
    fn task(&self) -> Task {
        self.metadata.task
    }

    fn names(&self) -> &Names {
        &self.metadata.names
    }

    fn predict(&self, source: &ImageSource, options: &PredictOptions) -> Result<Vec<Results>> {
        options.validate()?;
        let task = self.metadata.task;
        let imgsz = options.imgsz.unwrap_or_else(|| self.imgsz());

        let prepared = prepare_input(source, task, imgsz, options.workers)?;

        let start = Instant::now();
        let outputs = self.run(prepared.preprocessed.tensor.view())?;
        let inference = start.elapsed().as_secs_f64() * 1000.0;

        let start = Instant::now();
        let mut result = postprocess(
            task,
            &outputs,
            &self.metadata,
            &prepared.preprocessed.letterbox,
            options,
            prepared.orig_img,
            source.describe(),
        )?;
        result.speed = Speed {
            preprocess: prepared.elapsed_ms,
            inference,
            postprocess: start.elapsed().as_secs_f64() * 1000.0,
        };

        let (h, w) = result.orig_shape();
        info!(
            "{}: {}x{} {}, {:.1}ms",
            result.path,
            h,
            w,
            result.verbose(),
            result.speed.inference
        );
        Ok(vec![result])
    }
}

impl std::fmt::Debug for YoloModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YoloModel")
            .field("task", &self.metadata.task)
            .field("num_classes", &self.metadata.num_classes())
            .field("imgsz", &self.metadata.imgsz)
            .field("input", &self.input_name)
            .field("outputs", &self.output_names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_artifact() {
        let err = YoloModel::load("nonexistent.onnx").unwrap_err();
        assert!(matches!(err, HarnessError::ArtifactLoad { .. }));
    }

    #[test]
    fn test_directory_is_not_an_artifact() {
        let dir = TempDir::new().unwrap();
        let err = YoloModel::load(dir.path()).unwrap_err();
        assert!(matches!(err, HarnessError::ArtifactLoad { .. }));
    }

    #[test]
    fn test_corrupt_artifact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("best.onnx");
        std::fs::write(&path, b"checkpoint").unwrap();

        let err = YoloModel::load(&path).unwrap_err();
        match err {
            HarnessError::ArtifactLoad { path: failed, source, .. } => {
                assert_eq!(failed, path);
                assert!(source.is_some());
            }
            other => panic!("expected ArtifactLoad, got {other:?}"),
        }
    }
}

pub mod config;
pub mod display;
pub mod errors;
pub mod metadata;
pub mod model;
pub mod plotting;
pub mod postprocess;
pub mod predictor;
pub mod preprocess;
pub mod results;
pub mod task;
pub mod traits;

pub mod mocks;

use std::path::Path;

use tracing::{debug, info};

pub use config::Config;
pub use display::SystemViewer;
pub use errors::{HarnessError, Result};
pub use metadata::{ModelMetadata, Names};
pub use model::YoloModel;
pub use predictor::{ImageSource, PredictOptions};
pub use results::{Boxes, Keypoints, Masks, Obb, Probs, Results, Speed};
pub use task::Task;
pub use traits::*;

#[cfg(test)]
pub use mocks::*;

/// Loads a checkpoint from disk onto the default device.
pub fn load_model<P: AsRef<Path>>(path: P) -> Result<YoloModel> {
    YoloModel::load(path)
}

/// Drives one model through predict, unpack and display.
pub struct InferenceHarness<M: DetectionModel, D: ResultDisplay> {
    model: M,
    display: D,
    options: PredictOptions,
}

impl<M: DetectionModel, D: ResultDisplay> InferenceHarness<M, D> {
    pub fn new(model: M, display: D) -> Self {
        Self::with_options(model, display, PredictOptions::default())
    }

    pub const fn with_options(model: M, display: D, options: PredictOptions) -> Self {
        Self {
            model,
            display,
            options,
        }
    }

    pub const fn model(&self) -> &M {
        &self.model
    }

    pub const fn options(&self) -> &PredictOptions {
        &self.options
    }

    /// Runs the model on `source`. `workers` of 0 loads and preprocesses on the calling thread.
    pub fn predict(&self, source: &ImageSource, workers: usize) -> Result<Vec<Results>> {
        let options = self.options.clone().with_workers(workers);
        debug!("predicting on {} with {workers} worker(s)", source.describe());
        self.model.predict(source, &options)
    }

    /// Logs every prediction field, then hands the rendered image to the display.
    ///
    /// Fields the task does not produce are `None` and are reported as absent. A result
    /// without any field still shows the original image.
    pub fn unpack_and_display(&self, result: &Results) -> Result<()> {
        let Results {
            boxes,
            masks,
            keypoints,
            probs,
            obb,
            ..
        } = result;

        debug!("boxes: {}", count(boxes.as_ref().map(Boxes::len)));
        debug!("masks: {}", count(masks.as_ref().map(Masks::len)));
        debug!("keypoints: {}", count(keypoints.as_ref().map(Keypoints::len)));
        match probs {
            Some(probs) => {
                let top5 = probs
                    .top5()
                    .into_iter()
                    .zip(probs.top5conf())
                    .map(|(id, conf)| format!("{} {conf:.2}", result.label(id)))
                    .collect::<Vec<_>>();
                info!("probs: top5 [{}]", top5.join(", "));
            }
            None => debug!("probs: none"),
        }
        debug!("obb: {}", count(obb.as_ref().map(Obb::len)));

        let annotated = plotting::plot(result);
        let title = if result.is_empty() {
            result.path.clone()
        } else {
            format!("{}: {}", result.path, result.verbose())
        };
        self.display.show(&annotated, &title)
    }

    /// Predicts on `source` with the configured options and displays every result.
    /// Returns how many results were shown.
    pub fn run(&self, source: &ImageSource) -> Result<usize> {
        let results = self.predict(source, self.options.workers)?;
        for result in &results {
            self.unpack_and_display(result)?;
        }
        Ok(results.len())
    }
}

fn count(len: Option<usize>) -> String {
    len.map_or_else(|| "none".to_string(), |n| n.to_string())
}

impl InferenceHarness<YoloModel, SystemViewer> {
    pub fn with_yolo_model(config: &Config) -> Result<Self> {
        let model = YoloModel::load_on_device(&config.model_path, config.device_id)?;
        Ok(Self::with_options(
            model,
            SystemViewer::new(),
            config.predict_options()?,
        ))
    }
}

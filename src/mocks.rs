use std::path::Path;

use image::RgbImage;
use ndarray::{array, Array1, Array3};
use parking_lot::Mutex;

use crate::errors::{HarnessError, Result};
use crate::metadata::Names;
use crate::predictor::{ImageSource, PredictOptions};
use crate::results::{Boxes, Keypoints, Masks, Obb, Probs, Results};
use crate::task::Task;
use crate::traits::{DetectionModel, ResultDisplay};

/// Stub model that fabricates one instance per prediction, filling exactly the fields
/// matching its task.
#[derive(Debug, Clone)]
pub struct MockDetectionModel {
    pub task: Task,
    pub names: Names,
}

impl MockDetectionModel {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            names: Names::from([(0, "car".to_string()), (1, "person".to_string())]),
        }
    }

    /// Mirrors artifact loading: the file must exist.
    pub fn load<P: AsRef<Path>>(path: P, task: Task) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(HarnessError::artifact_load(path, "file not found"));
        }
        Ok(Self::new(task))
    }

    fn fabricate(&self, image: RgbImage, path: String) -> Results {
        let (w, h) = (image.width() as f32, image.height() as f32);
        let orig_shape = (image.height(), image.width());
        let mut result = Results::new(image, path, self.names.clone());
        let bbox = array![[w * 0.25, h * 0.25, w * 0.75, h * 0.75, 0.9, 0.0]];

        match self.task {
            Task::Detect => result.boxes = Some(Boxes::new(bbox, orig_shape)),
            Task::Segment => {
                let mut masks = Array3::zeros((1, orig_shape.0 as usize, orig_shape.1 as usize));
                masks[[0, orig_shape.0 as usize / 2, orig_shape.1 as usize / 2]] = 1;
                result.masks = Some(Masks::new(masks));
                result.boxes = Some(Boxes::new(bbox, orig_shape));
            }
            Task::Pose => {
                let keypoints = Array3::from_shape_fn((1, 17, 3), |(_, j, k)| match k {
                    0 => w * 0.25 + j as f32,
                    1 => h * 0.25 + j as f32,
                    _ => 0.9,
                });
                result.keypoints = Some(Keypoints::new(keypoints, true));
                result.boxes = Some(Boxes::new(bbox, orig_shape));
            }
            Task::Classify => {
                let n = self.names.len().max(1);
                let mut probs = Array1::from_elem(n, 0.1 / n as f32);
                probs[0] += 0.9;
                result.probs = Some(Probs::new(probs));
            }
            Task::Obb => {
                result.obb = Some(Obb::new(
                    array![[w * 0.5, h * 0.5, w * 0.4, h * 0.2, 0.3, 0.8, 1.0]],
                    orig_shape,
                ));
            }
        }
        result
    }
}

impl DetectionModel for MockDetectionModel {
    fn task(&self) -> Task {
        self.task
    }

    fn names(&self) -> &Names {
        &self.names
    }

    fn predict(&self, source: &ImageSource, options: &PredictOptions) -> Result<Vec<Results>> {
        options.validate()?;
        let image = source.load()?;
        Ok(vec![self.fabricate(image, source.describe())])
    }
}

/// Display stub recording every frame shown.
#[derive(Debug, Default)]
pub struct MockDisplay {
    shown: Mutex<Vec<(String, (u32, u32))>>,
}

impl MockDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Titles and dimensions of the frames shown so far.
    pub fn shown(&self) -> Vec<(String, (u32, u32))> {
        self.shown.lock().clone()
    }
}

impl ResultDisplay for MockDisplay {
    fn show(&self, image: &RgbImage, title: &str) -> Result<()> {
        self.shown
            .lock()
            .push((title.to_string(), image.dimensions()));
        Ok(())
    }
}

/// Display stub for hosts without a screen.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessDisplay;

impl ResultDisplay for HeadlessDisplay {
    fn show(&self, _image: &RgbImage, _title: &str) -> Result<()> {
        Err(HarnessError::DisplayUnavailable {
            reason: "headless host".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;

    #[test]
    fn test_mock_fields_follow_task() -> Result<()> {
        let source = ImageSource::Image(DynamicImage::new_rgb8(40, 20));
        let options = PredictOptions::default();

        for task in [Task::Detect, Task::Segment, Task::Pose, Task::Classify, Task::Obb] {
            let results = MockDetectionModel::new(task).predict(&source, &options)?;
            let r = &results[0];
            let populated = [
                r.boxes.is_some(),
                r.masks.is_some(),
                r.keypoints.is_some(),
                r.probs.is_some(),
                r.obb.is_some(),
            ];
            let expected = match task {
                Task::Detect => [true, false, false, false, false],
                Task::Segment => [true, true, false, false, false],
                Task::Pose => [true, false, true, false, false],
                Task::Classify => [false, false, false, true, false],
                Task::Obb => [false, false, false, false, true],
            };
            assert_eq!(populated, expected, "{task}");
        }
        Ok(())
    }

    #[test]
    fn test_mock_display_records() -> Result<()> {
        let display = MockDisplay::new();
        display.show(&RgbImage::new(3, 2), "frame")?;
        assert_eq!(display.shown(), vec![("frame".to_string(), (3, 2))]);
        Ok(())
    }
}

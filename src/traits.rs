use image::RgbImage;

use crate::errors::Result;
use crate::metadata::Names;
use crate::predictor::{ImageSource, PredictOptions};
use crate::results::Results;
use crate::task::Task;

/// A loaded checkpoint able to predict on images.
///
/// The harness only talks to models through this trait, so the ONNX backed model and test
/// stubs are interchangeable.
pub trait DetectionModel: Send + Sync {
    /// Task the checkpoint was trained for.
    fn task(&self) -> Task;

    /// Class labels.
    fn names(&self) -> &Names;

    /// Runs one prediction. Returns one [`Results`] per input image.
    fn predict(&self, source: &ImageSource, options: &PredictOptions) -> Result<Vec<Results>>;
}

/// A surface able to show a rendered result.
pub trait ResultDisplay {
    fn show(&self, image: &RgbImage, title: &str) -> Result<()>;
}

impl<D: ResultDisplay + ?Sized> ResultDisplay for &D {
    fn show(&self, image: &RgbImage, title: &str) -> Result<()> {
        (**self).show(image, title)
    }
}

impl<D: ResultDisplay + ?Sized> ResultDisplay for Box<D> {
    fn show(&self, image: &RgbImage, title: &str) -> Result<()> {
        (**self).show(image, title)
    }
}

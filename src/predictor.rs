use std::path::{Path, PathBuf};
use std::time::Instant;

use image::{DynamicImage, ImageReader, RgbImage};
use rayon::ThreadPoolBuilder;
use tracing::debug;
use url::Url;

use crate::errors::{HarnessError, Result};
use crate::preprocess::{preprocess_classify, preprocess_dense, Preprocessed};
use crate::task::Task;

/// Where the image to predict on comes from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Path(PathBuf),
    Url(Url),
    /// Encoded image bytes (png, jpeg, ...).
    Buffer(Vec<u8>),
    Image(DynamicImage),
}

impl ImageSource {
    /// Label used in logs and result titles.
    pub fn describe(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Url(url) => url.to_string(),
            Self::Buffer(bytes) => format!("<buffer {} bytes>", bytes.len()),
            Self::Image(image) => format!("<image {}x{}>", image.width(), image.height()),
        }
    }

    /// Reads and decodes the source, failing with [`HarnessError::InputNotFound`].
    pub fn load(&self) -> Result<RgbImage> {
        let not_found = |e: Box<dyn std::error::Error + Send + Sync>| HarnessError::InputNotFound {
            source_name: self.describe(),
            source: Some(e),
        };

        match self {
            Self::Path(path) => {
                if !path.is_file() {
                    return Err(HarnessError::input_not_found(self.describe()));
                }
                let reader = ImageReader::open(path)
                    .and_then(ImageReader::with_guessed_format)
                    .map_err(|e| not_found(Box::new(e)))?;
                Ok(reader.decode().map_err(|e| not_found(Box::new(e)))?.into_rgb8())
            }
            Self::Url(url) => {
                debug!("downloading {url}");
                let mut response = ureq::get(url.as_str())
                    .call()
                    .map_err(|e| not_found(Box::new(e)))?;
                let bytes = response
                    .body_mut()
                    .read_to_vec()
                    .map_err(|e| not_found(Box::new(e)))?;
                Ok(image::load_from_memory(&bytes)
                    .map_err(|e| not_found(Box::new(e)))?
                    .into_rgb8())
            }
            Self::Buffer(bytes) => Ok(image::load_from_memory(bytes)
                .map_err(|e| not_found(Box::new(e)))?
                .into_rgb8()),
            Self::Image(image) => Ok(image.to_rgb8()),
        }
    }
}

impl From<&str> for ImageSource {
    fn from(s: &str) -> Self {
        match Url::parse(s) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Self::Url(url),
            _ => Self::Path(PathBuf::from(s)),
        }
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for ImageSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Buffer(bytes)
    }
}

impl From<DynamicImage> for ImageSource {
    fn from(image: DynamicImage) -> Self {
        Self::Image(image)
    }
}

/// Knobs of a single prediction call.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictOptions {
    /// Threads used to load and preprocess the input; 0 keeps everything on the caller.
    pub workers: usize,
    pub conf: f32,
    pub iou: f32,
    pub max_det: usize,
    /// Overrides the (height, width) the model was exported with.
    pub imgsz: Option<(u32, u32)>,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            conf: 0.25,
            iou: 0.7,
            max_det: 300,
            imgsz: None,
        }
    }
}

impl PredictOptions {
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.conf) {
            return Err(HarnessError::configuration(format!(
                "conf must be within [0, 1], got {}",
                self.conf
            )));
        }
        if !(0.0..=1.0).contains(&self.iou) {
            return Err(HarnessError::configuration(format!(
                "iou must be within [0, 1], got {}",
                self.iou
            )));
        }
        if self.max_det == 0 {
            return Err(HarnessError::configuration("max_det must be at least 1"));
        }
        if matches!(self.imgsz, Some((0, _)) | Some((_, 0))) {
            return Err(HarnessError::configuration("imgsz must be positive"));
        }
        Ok(())
    }
}

/// Decoded input plus the network tensor built from it.
#[derive(Debug, Clone)]
pub struct PreparedInput {
    pub orig_img: RgbImage,
    pub preprocessed: Preprocessed,
    pub elapsed_ms: f64,
}

fn prepare_inline(source: &ImageSource, task: Task, imgsz: (u32, u32)) -> Result<PreparedInput> {
    let start = Instant::now();
    let orig_img = source.load()?;
    let preprocessed = if task.is_dense() {
        preprocess_dense(&orig_img, imgsz)
    } else {
        preprocess_classify(&orig_img, imgsz)
    };
    Ok(PreparedInput {
        orig_img,
        preprocessed,
        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
    })
}

/// Loads and preprocesses `source`, on the calling thread when `workers` is 0 and on a
/// dedicated pool of `workers` threads otherwise. Always returns after the work is done.
pub fn prepare_input(
    source: &ImageSource,
    task: Task,
    imgsz: (u32, u32),
    workers: usize,
) -> Result<PreparedInput> {
    if workers == 0 {
        return prepare_inline(source, task, imgsz);
    }

    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("preprocess-{i}"))
        .build()
        .map_err(|e| {
            HarnessError::configuration(format!("failed to start {workers} workers: {e}"))
        })?;
    debug!("preprocessing on {} worker threads", pool.current_num_threads());
    pool.install(|| prepare_inline(source, task, imgsz))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use tempfile::TempDir;

    fn write_image(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        RgbImage::from_pixel(64, 32, Rgb([10, 20, 30]))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn test_source_parsing() {
        assert!(matches!(
            ImageSource::from("https://example.com/bus.jpg"),
            ImageSource::Url(_)
        ));
        assert!(matches!(
            ImageSource::from("./static/uploads/carPark.png"),
            ImageSource::Path(_)
        ));
        assert!(matches!(
            ImageSource::from("C:/images/car.png"),
            ImageSource::Path(_)
        ));
    }

    #[test]
    fn test_missing_path_is_input_not_found() {
        let err = ImageSource::from("does/not/exist.png").load().unwrap_err();
        assert!(matches!(err, HarnessError::InputNotFound { .. }));
    }

    #[test]
    fn test_path_format_detected_from_contents() -> Result<()> {
        let dir = TempDir::new().unwrap();
        for name in ["frame.jpg", "frame"] {
            let path = dir.path().join(name);
            RgbImage::from_pixel(8, 6, Rgb([200, 10, 10]))
                .save_with_format(&path, ImageFormat::Png)
                .unwrap();

            let image = ImageSource::Path(path).load()?;
            assert_eq!(image.dimensions(), (8, 6), "{name}");
            assert_eq!(image.get_pixel(0, 0), &Rgb([200, 10, 10]), "{name}");
        }
        Ok(())
    }

    #[test]
    fn test_undecodable_buffer_is_input_not_found() {
        let err = ImageSource::Buffer(b"not an image".to_vec())
            .load()
            .unwrap_err();
        assert!(matches!(err, HarnessError::InputNotFound { .. }));
    }

    #[test]
    fn test_prepare_inline_and_pooled_agree() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let source = ImageSource::Path(write_image(&dir, "input.png"));

        let inline = prepare_input(&source, Task::Detect, (64, 64), 0)?;
        let pooled = prepare_input(&source, Task::Detect, (64, 64), 2)?;

        assert_eq!(inline.orig_img.dimensions(), (64, 32));
        assert_eq!(inline.preprocessed.tensor.shape(), &[1, 3, 64, 64]);
        assert_eq!(inline.preprocessed.tensor, pooled.preprocessed.tensor);
        assert_eq!(inline.preprocessed.letterbox, pooled.preprocessed.letterbox);
        Ok(())
    }

    #[test]
    fn test_options_validation() {
        assert!(PredictOptions::default().validate().is_ok());
        assert_eq!(PredictOptions::default().workers, 0);

        let options = PredictOptions {
            conf: 1.5,
            ..PredictOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(HarnessError::Configuration { .. })
        ));

        let options = PredictOptions {
            max_det: 0,
            ..PredictOptions::default()
        };
        assert!(options.validate().is_err());
    }
}

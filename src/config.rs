use clap::Parser;
use std::path::PathBuf;

use crate::errors::Result;
use crate::predictor::PredictOptions;

pub const DEFAULT_MODEL: &str = "best.onnx";
pub const DEFAULT_SOURCE: &str = "./static/uploads/carPark.mp4_000031375.png";

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Exported ONNX checkpoint.
    #[arg(short, long = "model", default_value = DEFAULT_MODEL)]
    pub model_path: PathBuf,

    /// Image path or http(s) URL.
    #[arg(short, long, default_value = DEFAULT_SOURCE)]
    pub source: String,

    /// Threads for loading and preprocessing; 0 runs inline.
    #[arg(short, long, default_value_t = 0)]
    pub workers: usize,

    #[arg(long, default_value_t = 0.25)]
    pub conf: f32,

    #[arg(long, default_value_t = 0.7)]
    pub iou: f32,

    #[arg(long, default_value_t = 300)]
    pub max_det: usize,

    /// Inference size as `N` or `HxW`; defaults to the size the model was exported with.
    #[arg(long, value_parser = parse_imgsz)]
    pub imgsz: Option<(u32, u32)>,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from([env!("CARGO_PKG_NAME")])
    }
}

impl Config {
    pub fn new() -> Self {
        Self::parse()
    }

    pub fn predict_options(&self) -> Result<PredictOptions> {
        let options = PredictOptions {
            workers: self.workers,
            conf: self.conf,
            iou: self.iou,
            max_det: self.max_det,
            imgsz: self.imgsz,
        };
        options.validate()?;
        Ok(options)
    }
}

fn parse_imgsz(s: &str) -> std::result::Result<(u32, u32), String> {
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| format!("`{s}` is not a valid size, expected `640` or `480x640`"))
    };
    match s.split_once(|c: char| matches!(c, 'x' | 'X' | ',')) {
        Some((h, w)) => Ok((parse(h)?, parse(w)?)),
        None => parse(s).map(|n| (n, n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HarnessError;

    #[test]
    fn test_defaults() -> Result<()> {
        let config = Config::default();
        assert_eq!(config.model_path, PathBuf::from(DEFAULT_MODEL));
        assert_eq!(config.source, DEFAULT_SOURCE);
        assert_eq!(config.predict_options()?, PredictOptions::default());
        assert_eq!(config.device_id, 0);
        Ok(())
    }

    #[test]
    fn test_flags() -> Result<()> {
        let config = Config::parse_from([
            "yolo-harness",
            "-m",
            "yolo11n-seg.onnx",
            "--source",
            "https://ultralytics.com/images/bus.jpg",
            "-w",
            "4",
            "--imgsz",
            "480x640",
        ]);
        assert_eq!(config.model_path, PathBuf::from("yolo11n-seg.onnx"));
        let options = config.predict_options()?;
        assert_eq!(options.workers, 4);
        assert_eq!(options.imgsz, Some((480, 640)));
        Ok(())
    }

    #[test]
    fn test_imgsz_parsing() {
        assert_eq!(parse_imgsz("320"), Ok((320, 320)));
        assert_eq!(parse_imgsz("256,512"), Ok((256, 512)));
        assert!(parse_imgsz("0").is_err());
        assert!(parse_imgsz("big").is_err());
    }

    #[test]
    fn test_out_of_range_thresholds() {
        let config = Config::parse_from(["yolo-harness", "--conf", "1.5"]);
        let err = config.predict_options().unwrap_err();
        assert!(matches!(err, HarnessError::Configuration { .. }));
    }
}

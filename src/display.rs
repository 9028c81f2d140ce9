use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use image::{ImageFormat, RgbImage};
use tracing::{debug, info};

use crate::errors::{HarnessError, Result};
use crate::traits::ResultDisplay;

/// Hands rendered results to the platform image viewer.
///
/// The frame is written to a temporary PNG that outlives the process, since the viewer opens it
/// asynchronously. The harness does not wait for the viewer to exit. Display availability is
/// checked when a frame is shown, not at construction.
#[derive(Debug, Clone)]
pub struct SystemViewer {
    program: OsString,
    args: Vec<OsString>,
}

impl Default for SystemViewer {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemViewer {
    /// Viewer command of the current platform.
    pub fn new() -> Self {
        if cfg!(target_os = "macos") {
            Self::with_command("open", Vec::new())
        } else if cfg!(target_os = "windows") {
            Self::with_command("cmd", vec!["/C".into(), "start".into(), "".into()])
        } else {
            Self::with_command("xdg-open", Vec::new())
        }
    }

    /// Uses `program` with `args` followed by the image path.
    pub fn with_command(program: impl Into<OsString>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn write_temp(image: &RgbImage) -> Result<PathBuf> {
        let file = tempfile::Builder::new()
            .prefix("yolo-harness-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| HarnessError::Display {
                operation: "temporary file creation".to_string(),
                source: Box::new(e),
            })?;
        image.save_with_format(file.path(), ImageFormat::Png)?;
        let (_, path) = file.keep().map_err(|e| HarnessError::Display {
            operation: "temporary file persistence".to_string(),
            source: Box::new(e),
        })?;
        Ok(path)
    }

    fn launch(&self, path: &Path) -> Result<()> {
        debug!("launching {:?} for {}", self.program, path.display());
        Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(drop)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => HarnessError::DisplayUnavailable {
                    reason: format!("image viewer {:?} not found", self.program),
                },
                _ => HarnessError::Display {
                    operation: "image viewer launch".to_string(),
                    source: Box::new(e),
                },
            })
    }
}

impl ResultDisplay for SystemViewer {
    fn show(&self, image: &RgbImage, title: &str) -> Result<()> {
        ensure_display(|key| std::env::var_os(key))?;
        let path = Self::write_temp(image)?;
        info!("showing {title} ({})", path.display());
        self.launch(&path)
    }
}

/// Fails with [`HarnessError::DisplayUnavailable`] on hosts without a display server.
pub fn ensure_display<F>(env: F) -> Result<()>
where
    F: Fn(&str) -> Option<OsString>,
{
    if cfg!(any(target_os = "macos", target_os = "windows")) {
        return Ok(());
    }
    let available = ["DISPLAY", "WAYLAND_DISPLAY"]
        .iter()
        .any(|key| env(key).is_some_and(|v| !v.is_empty()));
    if available {
        Ok(())
    } else {
        Err(HarnessError::DisplayUnavailable {
            reason: "neither DISPLAY nor WAYLAND_DISPLAY is set".to_string(),
        })
    }
}

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::errors::{HarnessError, Result};
use crate::task::Task;

/// Class id to human readable label.
pub type Names = BTreeMap<usize, String>;

pub const DEFAULT_IMGSZ: (usize, usize) = (640, 640);
pub const DEFAULT_STRIDE: u32 = 32;
pub const DEFAULT_KPT_SHAPE: (usize, usize) = (17, 3);

/// Metadata stored as custom properties by Ultralytics ONNX exports.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMetadata {
    pub task: Task,
    pub names: Names,
    /// (height, width)
    pub imgsz: (usize, usize),
    pub stride: u32,
    /// (keypoints per instance, values per keypoint)
    pub kpt_shape: (usize, usize),
    /// The graph already applies NMS and emits `x1 y1 x2 y2 conf cls` rows.
    pub end2end: bool,
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self {
            task: Task::Detect,
            names: Names::new(),
            imgsz: DEFAULT_IMGSZ,
            stride: DEFAULT_STRIDE,
            kpt_shape: DEFAULT_KPT_SHAPE,
            end2end: false,
        }
    }
}

impl ModelMetadata {
    /// Builds metadata from a key lookup, keeping defaults for missing or malformed keys.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut metadata = Self::default();

        if let Some(task) = lookup("task") {
            match task.parse() {
                Ok(task) => metadata.task = task,
                Err(e) => warn!("ignoring model task metadata: {e}"),
            }
        }
        if let Some(names) = lookup("names") {
            match parse_names(&names) {
                Ok(names) => metadata.names = names,
                Err(e) => warn!("ignoring class names metadata: {e}"),
            }
        }
        if let Some(imgsz) = lookup("imgsz") {
            match parse_usize_list(&imgsz).as_deref() {
                Some([size]) => metadata.imgsz = (*size, *size),
                Some([h, w]) => metadata.imgsz = (*h, *w),
                _ => warn!("ignoring imgsz metadata `{imgsz}`"),
            }
        }
        if let Some(stride) = lookup("stride") {
            match stride.trim().parse() {
                Ok(stride) => metadata.stride = stride,
                Err(_) => warn!("ignoring stride metadata `{stride}`"),
            }
        }
        if let Some(kpt_shape) = lookup("kpt_shape") {
            match parse_usize_list(&kpt_shape).as_deref() {
                Some([k, d]) => metadata.kpt_shape = (*k, *d),
                _ => warn!("ignoring kpt_shape metadata `{kpt_shape}`"),
            }
        }
        if let Some(end2end) = lookup("end2end") {
            metadata.end2end = end2end.trim().eq_ignore_ascii_case("true");
        }

        debug!(
            "model metadata: task={}, classes={}, imgsz={:?}, stride={}",
            metadata.task,
            metadata.names.len(),
            metadata.imgsz,
            metadata.stride
        );
        metadata
    }

    pub fn num_classes(&self) -> usize {
        self.names.len()
    }
}

/// Parses a Python dict literal such as `{0: 'person', 1: "traffic light"}`.
pub fn parse_names(raw: &str) -> Result<Names> {
    let invalid = |reason: &str| HarnessError::configuration(format!("names {reason}: {raw}"));

    let body = raw
        .trim()
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| invalid("must be a dict literal"))?;

    let mut names = Names::new();
    let mut chars = body.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != ':') {
            key.push(c);
        }
        if chars.next() != Some(':') {
            return Err(invalid("entry is missing `:`"));
        }
        let id = key
            .trim()
            .parse::<usize>()
            .map_err(|_| invalid("key is not an integer"))?;

        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let quote = chars
            .next()
            .filter(|c| *c == '\'' || *c == '"')
            .ok_or_else(|| invalid("value is not quoted"))?;

        let mut label = String::new();
        loop {
            match chars.next() {
                Some('\\') => {
                    if let Some(escaped) = chars.next() {
                        label.push(escaped);
                    }
                }
                Some(c) if c == quote => break,
                Some(c) => label.push(c),
                None => return Err(invalid("has an unterminated string")),
            }
        }
        names.insert(id, label);
    }

    Ok(names)
}

/// Parses `640`, `[640, 640]` or `(17, 3)`.
fn parse_usize_list(raw: &str) -> Option<Vec<usize>> {
    raw.trim()
        .trim_matches(|c: char| matches!(c, '[' | ']' | '(' | ')'))
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect::<Option<Vec<_>>>()
        .filter(|v| !v.is_empty())
}

//! Structured output of one inference over one image.
//!
//! A [`Results`] carries five optional fields. Which of them are populated depends on the task
//! the checkpoint was trained for; the rest stay `None`.

use std::collections::BTreeMap;
use std::f32::consts::FRAC_PI_2;

use image::RgbImage;
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2};

use crate::metadata::Names;

/// Per-stage wall-clock timings in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Speed {
    pub preprocess: f64,
    pub inference: f64,
    pub postprocess: f64,
}

impl Speed {
    pub fn total(&self) -> f64 {
        self.preprocess + self.inference + self.postprocess
    }
}

/// Axis-aligned boxes, one row `x1 y1 x2 y2 conf cls` per instance, in original pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Boxes {
    pub data: Array2<f32>,
    /// (height, width)
    pub orig_shape: (u32, u32),
}

impl Boxes {
    pub fn new(data: Array2<f32>, orig_shape: (u32, u32)) -> Self {
        debug_assert_eq!(data.ncols(), 6);
        Self { data, orig_shape }
    }

    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn xyxy(&self) -> ArrayView2<'_, f32> {
        self.data.slice(s![.., 0..4])
    }

    pub fn conf(&self) -> ArrayView1<'_, f32> {
        self.data.column(4)
    }

    pub fn cls(&self) -> ArrayView1<'_, f32> {
        self.data.column(5)
    }

    /// Center x, center y, width, height.
    pub fn xywh(&self) -> Array2<f32> {
        let mut out = Array2::zeros((self.len(), 4));
        for (mut dst, src) in out.rows_mut().into_iter().zip(self.data.rows()) {
            dst[0] = (src[0] + src[2]) / 2.0;
            dst[1] = (src[1] + src[3]) / 2.0;
            dst[2] = src[2] - src[0];
            dst[3] = src[3] - src[1];
        }
        out
    }

    /// Corners normalized by the original image size.
    pub fn xyxyn(&self) -> Array2<f32> {
        let (h, w) = (self.orig_shape.0 as f32, self.orig_shape.1 as f32);
        let mut out = self.xyxy().to_owned();
        for mut row in out.rows_mut() {
            row[0] /= w;
            row[1] /= h;
            row[2] /= w;
            row[3] /= h;
        }
        out
    }
}

/// Binary instance masks `(n, height, width)` at original resolution, 1 for foreground.
#[derive(Debug, Clone, PartialEq)]
pub struct Masks {
    pub data: Array3<u8>,
}

impl Masks {
    pub fn new(data: Array3<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mask(&self, index: usize) -> ArrayView2<'_, u8> {
        self.data.slice(s![index, .., ..])
    }

    /// Number of foreground pixels per instance.
    pub fn areas(&self) -> Vec<usize> {
        self.data
            .outer_iter()
            .map(|m| m.iter().filter(|v| **v > 0).count())
            .collect()
    }
}

/// Keypoints `(n, k, 3)` with rows `x y conf` in original pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Keypoints {
    pub data: Array3<f32>,
    /// Whether the model predicted a visibility score for each point.
    pub has_visible: bool,
}

impl Keypoints {
    pub fn new(data: Array3<f32>, has_visible: bool) -> Self {
        Self { data, has_visible }
    }

    pub fn len(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn xy(&self) -> Array3<f32> {
        self.data.slice(s![.., .., 0..2]).to_owned()
    }

    pub fn conf(&self) -> Array2<f32> {
        self.data.slice(s![.., .., 2]).to_owned()
    }
}

/// Classification probabilities, one per class.
#[derive(Debug, Clone, PartialEq)]
pub struct Probs {
    pub data: Array1<f32>,
}

impl Probs {
    pub fn new(data: Array1<f32>) -> Self {
        Self { data }
    }

    /// Class ids sorted by descending probability, at most `k`.
    pub fn top_k(&self, k: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.data.len()).collect();
        order.sort_by(|&a, &b| self.data[b].total_cmp(&self.data[a]));
        order.truncate(k);
        order
    }

    pub fn top1(&self) -> Option<usize> {
        self.top_k(1).first().copied()
    }

    pub fn top5(&self) -> Vec<usize> {
        self.top_k(5)
    }

    pub fn top1conf(&self) -> Option<f32> {
        self.top1().map(|i| self.data[i])
    }

    pub fn top5conf(&self) -> Vec<f32> {
        self.top5().into_iter().map(|i| self.data[i]).collect()
    }
}

/// Oriented boxes, one row `cx cy w h angle conf cls` per instance, angle in radians.
#[derive(Debug, Clone, PartialEq)]
pub struct Obb {
    pub data: Array2<f32>,
    /// (height, width)
    pub orig_shape: (u32, u32),
}

impl Obb {
    pub fn new(data: Array2<f32>, orig_shape: (u32, u32)) -> Self {
        debug_assert_eq!(data.ncols(), 7);
        Self { data, orig_shape }
    }

    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn xywhr(&self) -> ArrayView2<'_, f32> {
        self.data.slice(s![.., 0..5])
    }

    pub fn conf(&self) -> ArrayView1<'_, f32> {
        self.data.column(5)
    }

    pub fn cls(&self) -> ArrayView1<'_, f32> {
        self.data.column(6)
    }

    /// Four corners per box, `(n, 4, 2)`.
    pub fn xyxyxyxy(&self) -> Array3<f32> {
        let mut out = Array3::zeros((self.len(), 4, 2));
        for (i, row) in self.data.rows().into_iter().enumerate() {
            let corners = rotated_corners(row[0], row[1], row[2], row[3], row[4]);
            for (j, (x, y)) in corners.into_iter().enumerate() {
                out[[i, j, 0]] = x;
                out[[i, j, 1]] = y;
            }
        }
        out
    }
}

pub(crate) fn rotated_corners(cx: f32, cy: f32, w: f32, h: f32, angle: f32) -> [(f32, f32); 4] {
    let (sin, cos) = angle.sin_cos();
    let v1 = (w / 2.0 * cos, w / 2.0 * sin);
    let v2 = (-h / 2.0 * sin, h / 2.0 * cos);
    [
        (cx + v1.0 + v2.0, cy + v1.1 + v2.1),
        (cx + v1.0 - v2.0, cy + v1.1 - v2.1),
        (cx - v1.0 - v2.0, cy - v1.1 - v2.1),
        (cx - v1.0 + v2.0, cy - v1.1 + v2.1),
    ]
}

/// Keeps `w >= h` and folds the angle into `[0, pi)`.
pub(crate) fn regularize_rbox(w: f32, h: f32, angle: f32) -> (f32, f32, f32) {
    let (w, h, angle) = if w >= h {
        (w, h, angle)
    } else {
        (h, w, angle + FRAC_PI_2)
    };
    (w, h, angle.rem_euclid(std::f32::consts::PI))
}

/// Output of one prediction over one image.
#[derive(Debug, Clone)]
pub struct Results {
    pub orig_img: RgbImage,
    pub path: String,
    pub names: Names,
    pub speed: Speed,
    pub boxes: Option<Boxes>,
    pub masks: Option<Masks>,
    pub keypoints: Option<Keypoints>,
    pub probs: Option<Probs>,
    pub obb: Option<Obb>,
}

impl Results {
    pub fn new(orig_img: RgbImage, path: impl Into<String>, names: Names) -> Self {
        Self {
            orig_img,
            path: path.into(),
            names,
            speed: Speed::default(),
            boxes: None,
            masks: None,
            keypoints: None,
            probs: None,
            obb: None,
        }
    }

    /// (height, width)
    pub fn orig_shape(&self) -> (u32, u32) {
        (self.orig_img.height(), self.orig_img.width())
    }

    pub fn label(&self, class_id: usize) -> String {
        self.names
            .get(&class_id)
            .cloned()
            .unwrap_or_else(|| format!("class{class_id}"))
    }

    /// Number of detected instances across boxes and oriented boxes.
    pub fn len(&self) -> usize {
        self.boxes.as_ref().map_or(0, Boxes::len) + self.obb.as_ref().map_or(0, Obb::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.probs.is_none()
    }

    /// Short human readable summary, e.g. `2 cars, 1 person` or `car 0.91, truck 0.05`.
    pub fn verbose(&self) -> String {
        if let Some(probs) = &self.probs {
            return probs
                .top5()
                .into_iter()
                .map(|i| format!("{} {:.2}", self.label(i), probs.data[i]))
                .collect::<Vec<_>>()
                .join(", ");
        }

        let classes = match (&self.boxes, &self.obb) {
            (Some(boxes), _) => boxes.cls().to_vec(),
            (None, Some(obb)) => obb.cls().to_vec(),
            (None, None) => Vec::new(),
        };
        if classes.is_empty() {
            return "(no detections)".to_string();
        }

        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for cls in classes {
            *counts.entry(cls as usize).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|(cls, n)| {
                let plural = if n > 1 { "s" } else { "" };
                format!("{n} {}{plural}", self.label(cls))
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn names() -> Names {
        Names::from([(0, "person".to_string()), (1, "car".to_string())])
    }

    #[test]
    fn test_boxes_accessors() {
        let boxes = Boxes::new(
            array![[10.0, 20.0, 30.0, 60.0, 0.9, 1.0]],
            (100, 200),
        );

        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes.xywh(), array![[20.0, 40.0, 20.0, 40.0]]);
        assert_eq!(boxes.xyxyn(), array![[0.05, 0.2, 0.15, 0.6]]);
        assert_eq!(boxes.conf()[0], 0.9);
        assert_eq!(boxes.cls()[0], 1.0);
    }

    #[test]
    fn test_probs_top_k() {
        let probs = Probs::new(array![0.1, 0.6, 0.05, 0.2, 0.03, 0.02]);

        assert_eq!(probs.top1(), Some(1));
        assert_eq!(probs.top5(), vec![1, 3, 0, 2, 4]);
        assert_eq!(probs.top1conf(), Some(0.6));
        assert_eq!(Probs::new(Array1::zeros(0)).top1(), None);
    }

    #[test]
    fn test_obb_corners_axis_aligned() {
        let obb = Obb::new(array![[50.0, 50.0, 20.0, 10.0, 0.0, 0.8, 0.0]], (100, 100));
        let corners = obb.xyxyxyxy();

        assert_eq!(corners.shape(), &[1, 4, 2]);
        let xs: Vec<f32> = (0..4).map(|j| corners[[0, j, 0]]).collect();
        let ys: Vec<f32> = (0..4).map(|j| corners[[0, j, 1]]).collect();
        assert!(xs.iter().all(|x| (*x - 40.0).abs() < 1e-4 || (*x - 60.0).abs() < 1e-4));
        assert!(ys.iter().all(|y| (*y - 45.0).abs() < 1e-4 || (*y - 55.0).abs() < 1e-4));
    }

    #[test]
    fn test_regularize_rbox() {
        let (w, h, angle) = regularize_rbox(10.0, 30.0, 0.0);
        assert_eq!((w, h), (30.0, 10.0));
        assert!((angle - FRAC_PI_2).abs() < 1e-6);

        let (_, _, angle) = regularize_rbox(30.0, 10.0, -0.5);
        assert!((0.0..std::f32::consts::PI).contains(&angle));
    }

    #[test]
    fn test_verbose_summaries() {
        let mut result = Results::new(RgbImage::new(4, 4), "a.png", names());
        assert_eq!(result.verbose(), "(no detections)");
        assert!(result.is_empty());

        result.boxes = Some(Boxes::new(
            array![
                [0.0, 0.0, 1.0, 1.0, 0.9, 1.0],
                [1.0, 1.0, 2.0, 2.0, 0.8, 1.0],
                [2.0, 2.0, 3.0, 3.0, 0.7, 0.0],
            ],
            (4, 4),
        ));
        assert_eq!(result.verbose(), "1 person, 2 cars");
        assert_eq!(result.len(), 3);

        let mut classified = Results::new(RgbImage::new(4, 4), "a.png", names());
        classified.probs = Some(Probs::new(array![0.25, 0.75]));
        assert_eq!(classified.verbose(), "car 0.75, person 0.25");
    }
}

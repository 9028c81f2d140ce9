//! Decoding of raw YOLO output tensors into [`Results`].
//!
//! Dense heads emit `[1, 4 + nc + extra, anchors]`: box center and size, one score per class,
//! then task specific extras (mask coefficients, keypoints, or a rotation angle). End-to-end
//! exports emit `[1, n, 6 + extra]` rows that are already suppressed.

use image::RgbImage;
use ndarray::arr1;
use ndarray::prelude::*;
use tracing::debug;

use crate::errors::{HarnessError, Result};
use crate::metadata::ModelMetadata;
use crate::predictor::PredictOptions;
use crate::preprocess::Letterbox;
use crate::results::{regularize_rbox, Boxes, Keypoints, Masks, Obb, Probs, Results};
use crate::task::Task;

/// Upper bound on boxes entering NMS.
const MAX_NMS: usize = 30_000;
const MASK_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// `x1 y1 x2 y2` for axis-aligned tasks, `cx cy w h` for oriented boxes.
    pub bbox: [f32; 4],
    pub conf: f32,
    pub cls: usize,
    pub extra: Vec<f32>,
}

pub fn postprocess(
    task: Task,
    outputs: &[ArrayD<f32>],
    metadata: &ModelMetadata,
    letterbox: &Letterbox,
    options: &PredictOptions,
    orig_img: RgbImage,
    path: String,
) -> Result<Results> {
    let mut results = Results::new(orig_img, path, metadata.names.clone());

    if task == Task::Classify {
        let output = outputs.first().ok_or_else(|| {
            HarnessError::inference("classification decode", "model produced no outputs")
        })?;
        results.probs = Some(Probs::new(to_probabilities(output.iter().copied().collect())));
        return Ok(results);
    }

    let preds = outputs
        .iter()
        .find(|o| o.ndim() == 3)
        .ok_or_else(|| HarnessError::inference("detection decode", "no 3-d prediction tensor"))?
        .index_axis(Axis(0), 0);
    let preds = preds.into_dimensionality::<Ix2>()?;

    let protos = if task == Task::Segment {
        let protos = outputs
            .iter()
            .find(|o| o.ndim() == 4)
            .ok_or_else(|| HarnessError::inference("mask decode", "no prototype mask tensor"))?;
        Some(protos.index_axis(Axis(0), 0).into_dimensionality::<Ix3>()?)
    } else {
        None
    };

    let extra = match task {
        Task::Segment => protos.as_ref().map_or(0, |p| p.shape()[0]),
        Task::Pose => metadata.kpt_shape.0 * metadata.kpt_shape.1,
        Task::Obb => 1,
        Task::Detect | Task::Classify => 0,
    };

    let mut candidates = if metadata.end2end {
        end2end_candidates(preds, extra, options.conf)?
    } else {
        let nc = num_classes(preds.nrows(), extra, metadata)?;
        let mut candidates = dense_candidates(preds, nc, extra, options.conf);
        if task != Task::Obb {
            candidates.iter_mut().for_each(|c| c.bbox = xywh_to_xyxy(c.bbox));
        }
        candidates
    };
    debug!("{} candidates above conf {}", candidates.len(), options.conf);

    if !metadata.end2end {
        candidates = if task == Task::Obb {
            nms(candidates, options.iou, options.max_det, |a, b| {
                probiou(rbox(a), rbox(b))
            })
        } else {
            nms(candidates, options.iou, options.max_det, |a, b| {
                box_iou(a.bbox, b.bbox)
            })
        };
    } else {
        candidates.truncate(options.max_det);
    }
    debug!("{} detections after NMS", candidates.len());

    let orig_shape = results.orig_shape();
    match task {
        Task::Obb => {
            results.obb = Some(scale_obb(&candidates, letterbox, orig_shape));
        }
        _ => {
            let boxes = scale_boxes(&candidates, letterbox);
            if let Some(protos) = protos {
                results.masks = Some(process_masks(protos, &candidates, &boxes, letterbox)?);
            }
            if task == Task::Pose {
                results.keypoints = Some(scale_keypoints(
                    &candidates,
                    metadata.kpt_shape,
                    letterbox,
                ));
            }
            results.boxes = Some(Boxes::new(boxes, orig_shape));
        }
    }

    Ok(results)
}

fn num_classes(channels: usize, extra: usize, metadata: &ModelMetadata) -> Result<usize> {
    if channels < 4 + extra {
        return Err(HarnessError::inference(
            "detection decode",
            format!("{channels} output channels cannot hold 4 box values and {extra} extras"),
        ));
    }
    let nc = channels - 4 - extra;
    if metadata.num_classes() > 0 && metadata.num_classes() != nc {
        return Err(HarnessError::inference(
            "detection decode",
            format!(
                "model names {} classes but the output carries {nc}",
                metadata.num_classes()
            ),
        ));
    }
    Ok(nc)
}

/// Candidates from a `(4 + nc + extra, anchors)` prediction matrix, boxes left as `cx cy w h`.
pub fn dense_candidates(
    preds: ArrayView2<f32>,
    nc: usize,
    extra: usize,
    conf: f32,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for anchor in preds.columns() {
        let (cls, score) = anchor
            .slice(s![4..4 + nc])
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, s)| if s > best.1 { (i, s) } else { best });
        if nc == 0 || score <= conf {
            continue;
        }
        candidates.push(Candidate {
            bbox: [anchor[0], anchor[1], anchor[2], anchor[3]],
            conf: score,
            cls,
            extra: anchor.slice(s![4 + nc..4 + nc + extra]).to_vec(),
        });
    }
    candidates
}

fn end2end_candidates(preds: ArrayView2<f32>, extra: usize, conf: f32) -> Result<Vec<Candidate>> {
    if preds.ncols() < 6 + extra {
        return Err(HarnessError::inference(
            "end-to-end decode",
            format!("rows of {} values cannot hold 6 + {extra}", preds.ncols()),
        ));
    }
    let mut candidates: Vec<Candidate> = preds
        .rows()
        .into_iter()
        .filter(|row| row[4] > conf)
        .map(|row| Candidate {
            bbox: [row[0], row[1], row[2], row[3]],
            conf: row[4],
            cls: row[5].max(0.0) as usize,
            extra: row.slice(s![6..6 + extra]).to_vec(),
        })
        .collect();
    candidates.sort_by(|a, b| b.conf.total_cmp(&a.conf));
    Ok(candidates)
}

pub fn xywh_to_xyxy([cx, cy, w, h]: [f32; 4]) -> [f32; 4] {
    [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
}

pub fn box_iou(a: [f32; 4], b: [f32; 4]) -> f32 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = iw * ih;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

fn rbox(c: &Candidate) -> [f32; 5] {
    [
        c.bbox[0],
        c.bbox[1],
        c.bbox[2],
        c.bbox[3],
        c.extra.first().copied().unwrap_or(0.0),
    ]
}

fn covariance([_, _, w, h, angle]: [f32; 5]) -> (f32, f32, f32) {
    let a = w * w / 12.0;
    let b = h * h / 12.0;
    let (sin, cos) = angle.sin_cos();
    (
        a * cos * cos + b * sin * sin,
        a * sin * sin + b * cos * cos,
        (a - b) * cos * sin,
    )
}

/// Overlap of two rotated boxes `cx cy w h angle`, modelled as 2-d Gaussians.
pub fn probiou(r1: [f32; 5], r2: [f32; 5]) -> f32 {
    const EPS: f32 = 1e-7;
    let (x1, y1) = (r1[0], r1[1]);
    let (x2, y2) = (r2[0], r2[1]);
    let (a1, b1, c1) = covariance(r1);
    let (a2, b2, c2) = covariance(r2);

    let denom = (a1 + a2) * (b1 + b2) - (c1 + c2).powi(2) + EPS;
    let t1 = ((a1 + a2) * (y1 - y2).powi(2) + (b1 + b2) * (x1 - x2).powi(2)) / denom * 0.25;
    let t2 = ((c1 + c2) * (x2 - x1) * (y1 - y2)) / denom * 0.5;
    let det1 = (a1 * b1 - c1 * c1).max(0.0);
    let det2 = (a2 * b2 - c2 * c2).max(0.0);
    let t3 = (((a1 + a2) * (b1 + b2) - (c1 + c2).powi(2)) / (4.0 * (det1 * det2).sqrt() + EPS)
        + EPS)
        .ln()
        * 0.5;

    let bd = (t1 + t2 + t3).clamp(EPS, 100.0);
    let hd = (1.0 - (-bd).exp() + EPS).sqrt();
    1.0 - hd
}

/// Class-aware greedy suppression, highest confidence first.
pub fn nms<F>(
    mut candidates: Vec<Candidate>,
    iou: f32,
    max_det: usize,
    overlap: F,
) -> Vec<Candidate>
where
    F: Fn(&Candidate, &Candidate) -> f32,
{
    candidates.sort_by(|a, b| b.conf.total_cmp(&a.conf));
    candidates.truncate(MAX_NMS);

    let mut keep: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if keep.len() >= max_det {
            break;
        }
        let suppressed = keep
            .iter()
            .any(|k| k.cls == candidate.cls && overlap(k, &candidate) > iou);
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}

fn scale_boxes(candidates: &[Candidate], letterbox: &Letterbox) -> Array2<f32> {
    let mut boxes = Array2::zeros((candidates.len(), 6));
    for (mut row, c) in boxes.rows_mut().into_iter().zip(candidates) {
        let (x1, y1) = letterbox.clip_original(c.bbox[0], c.bbox[1]);
        let (x2, y2) = letterbox.clip_original(c.bbox[2], c.bbox[3]);
        row.assign(&arr1(&[x1, y1, x2, y2, c.conf, c.cls as f32]));
    }
    boxes
}

fn scale_obb(candidates: &[Candidate], letterbox: &Letterbox, orig_shape: (u32, u32)) -> Obb {
    let mut data = Array2::zeros((candidates.len(), 7));
    for (mut row, c) in data.rows_mut().into_iter().zip(candidates) {
        let [cx, cy, w, h, angle] = rbox(c);
        let (cx, cy) = letterbox.to_original(cx, cy);
        let (w, h, angle) = regularize_rbox(w / letterbox.ratio, h / letterbox.ratio, angle);
        row.assign(&arr1(&[cx, cy, w, h, angle, c.conf, c.cls as f32]));
    }
    Obb::new(data, orig_shape)
}

fn scale_keypoints(
    candidates: &[Candidate],
    (nk, ndim): (usize, usize),
    letterbox: &Letterbox,
) -> Keypoints {
    let mut data = Array3::zeros((candidates.len(), nk, 3));
    for (i, c) in candidates.iter().enumerate() {
        for j in 0..nk {
            let base = j * ndim;
            let (Some(&x), Some(&y)) = (c.extra.get(base), c.extra.get(base + 1)) else {
                continue;
            };
            let (x, y) = letterbox.clip_original(x, y);
            data[[i, j, 0]] = x;
            data[[i, j, 1]] = y;
            data[[i, j, 2]] = if ndim >= 3 {
                c.extra.get(base + 2).copied().unwrap_or(1.0)
            } else {
                1.0
            };
        }
    }
    Keypoints::new(data, ndim >= 3)
}

/// Masks from prototype planes, sampled through the letterbox into original resolution and
/// cropped to each instance box.
fn process_masks(
    protos: ArrayView3<f32>,
    candidates: &[Candidate],
    boxes: &Array2<f32>,
    letterbox: &Letterbox,
) -> Result<Masks> {
    let (nm, mh, mw) = protos.dim();
    let (height, width) = letterbox.orig_shape;
    let (input_h, input_w) = letterbox.input_shape;
    let scale_x = mw as f32 / input_w as f32;
    let scale_y = mh as f32 / input_h as f32;

    let flat = protos.to_shape((nm, mh * mw))?;

    let mut masks = Array3::<u8>::zeros((candidates.len(), height as usize, width as usize));
    for (i, (c, bbox)) in candidates.iter().zip(boxes.rows()).enumerate() {
        if c.extra.len() < nm {
            continue;
        }
        let coeffs = ArrayView1::from(&c.extra[..nm]);
        let logits = coeffs.dot(&flat);

        let x_start = bbox[0].floor().max(0.0) as u32;
        let y_start = bbox[1].floor().max(0.0) as u32;
        let x_end = (bbox[2].ceil() as u32).min(width);
        let y_end = (bbox[3].ceil() as u32).min(height);

        for y in y_start..y_end {
            for x in x_start..x_end {
                let (fx, fy) = (x as f32 + 0.5, y as f32 + 0.5);
                if fx < bbox[0] || fx > bbox[2] || fy < bbox[1] || fy > bbox[3] {
                    continue;
                }
                let (nx, ny) = letterbox.to_network(fx, fy);
                let px = ((nx * scale_x) as usize).min(mw - 1);
                let py = ((ny * scale_y) as usize).min(mh - 1);
                if sigmoid(logits[py * mw + px]) > MASK_THRESHOLD {
                    masks[[i, y as usize, x as usize]] = 1;
                }
            }
        }
    }
    Ok(Masks::new(masks))
}

/// Keeps outputs that already form a distribution, softmaxes raw logits.
pub fn to_probabilities(values: Vec<f32>) -> Array1<f32> {
    let values = Array1::from(values);
    let sum: f32 = values.sum();
    let bounded = values.iter().all(|v| (0.0..=1.0).contains(v));
    if values.is_empty() || (bounded && (sum - 1.0).abs() < 1e-3) {
        return values;
    }
    let max = values.fold(f32::MIN, |m, v| m.max(*v));
    let exp = values.mapv(|v| (v - max).exp());
    let total = exp.sum();
    exp / total
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

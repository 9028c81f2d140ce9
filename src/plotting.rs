//! Annotates the original image with whatever fields a result carries.

use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut,
    draw_text_mut, text_size,
};
use imageproc::rect::Rect;
use tracing::warn;

use crate::results::{rotated_corners, Boxes, Keypoints, Masks, Obb, Probs, Results};

const FONT_DATA: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

/// Ultralytics default palette.
const PALETTE: [[u8; 3]; 20] = [
    [0xFF, 0x38, 0x38],
    [0xFF, 0x9D, 0x97],
    [0xFF, 0x70, 0x1F],
    [0xFF, 0xB2, 0x1D],
    [0xCF, 0xD2, 0x31],
    [0x48, 0xF9, 0x0A],
    [0x92, 0xCC, 0x17],
    [0x3D, 0xDB, 0x86],
    [0x1A, 0x93, 0x34],
    [0x00, 0xD4, 0xBB],
    [0x2C, 0x99, 0xA8],
    [0x00, 0xC2, 0xFF],
    [0x34, 0x45, 0x93],
    [0x64, 0x73, 0xFF],
    [0x00, 0x18, 0xEC],
    [0x84, 0x38, 0xFF],
    [0x52, 0x00, 0x85],
    [0xCB, 0x38, 0xFF],
    [0xFF, 0x95, 0xC8],
    [0xFF, 0x37, 0xC7],
];

/// COCO keypoint pairs, 0-based.
const SKELETON: [(usize, usize); 19] = [
    (15, 13),
    (13, 11),
    (16, 14),
    (14, 12),
    (11, 12),
    (5, 11),
    (6, 12),
    (5, 6),
    (5, 7),
    (6, 8),
    (7, 9),
    (8, 10),
    (1, 2),
    (0, 1),
    (0, 2),
    (1, 3),
    (2, 4),
    (3, 5),
    (4, 6),
];

const MASK_ALPHA: f32 = 0.5;
const KEYPOINT_CONF: f32 = 0.5;
const LABEL_PAD: u32 = 2;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const PROBS_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);

pub fn color(index: usize) -> Rgb<u8> {
    Rgb(PALETTE[index % PALETTE.len()])
}

fn line_width(image: &RgbImage) -> u32 {
    let (w, h) = image.dimensions();
    (((w + h) as f32 / 2.0 * 0.003).round() as u32).max(2)
}

/// Renders `name conf` tags onto a canvas.
struct Labeler {
    font: FontRef<'static>,
    scale: PxScale,
}

impl Labeler {
    fn new(image: &RgbImage) -> Option<Self> {
        let font = FontRef::try_from_slice(FONT_DATA)
            .map_err(|e| warn!("label font unusable, drawing without text: {e}"))
            .ok()?;
        let (w, h) = image.dimensions();
        let size = ((w + h) as f32 / 2.0 * 0.035).round().max(12.0);
        Some(Self {
            font,
            scale: PxScale::from(size),
        })
    }

    /// Size of the filled tag around `text`.
    fn tag_size(&self, text: &str) -> (u32, u32) {
        let (tw, th) = text_size(self.scale, &self.font, text);
        (tw + 2 * LABEL_PAD, th.max(1) + 2 * LABEL_PAD)
    }

    /// Draws a tag whose bottom-left corner sits at `(x, y)`, moved inside when it would
    /// leave the top of the image.
    fn draw_above(
        &self,
        canvas: &mut RgbImage,
        text: &str,
        (x, y): (i32, i32),
        background: Rgb<u8>,
    ) {
        let (_, h) = self.tag_size(text);
        let top = if y >= h as i32 { y - h as i32 } else { y.max(0) };
        self.draw_at(canvas, text, (x, top), background);
    }

    fn draw_at(&self, canvas: &mut RgbImage, text: &str, (x, y): (i32, i32), background: Rgb<u8>) {
        let (w, h) = self.tag_size(text);
        let left = x.clamp(0, canvas.width().saturating_sub(1) as i32);
        draw_filled_rect_mut(canvas, Rect::at(left, y).of_size(w, h), background);
        draw_text_mut(
            canvas,
            TEXT_COLOR,
            left + LABEL_PAD as i32,
            y + LABEL_PAD as i32,
            self.scale,
            &self.font,
            text,
        );
    }
}

/// Draws on a copy of `result.orig_img`. A result without any field yields the plain image.
pub fn plot(result: &Results) -> RgbImage {
    let mut canvas = result.orig_img.clone();
    let lw = line_width(&canvas);
    let labeler = Labeler::new(&canvas);

    if let Some(masks) = &result.masks {
        let classes: Vec<usize> = result
            .boxes
            .as_ref()
            .map(|b| b.cls().iter().map(|c| *c as usize).collect())
            .unwrap_or_default();
        draw_masks(&mut canvas, masks, &classes);
    }
    if let Some(boxes) = &result.boxes {
        draw_boxes(&mut canvas, boxes, lw);
    }
    if let Some(obb) = &result.obb {
        draw_obb(&mut canvas, obb);
    }
    if let Some(keypoints) = &result.keypoints {
        draw_keypoints(&mut canvas, keypoints, lw);
    }

    if let Some(labeler) = &labeler {
        if let Some(boxes) = &result.boxes {
            label_boxes(&mut canvas, labeler, result, boxes);
        }
        if let Some(obb) = &result.obb {
            label_obb(&mut canvas, labeler, result, obb);
        }
        if let Some(probs) = &result.probs {
            label_probs(&mut canvas, labeler, result, probs, lw);
        }
    }
    canvas
}

fn label_boxes(canvas: &mut RgbImage, labeler: &Labeler, result: &Results, boxes: &Boxes) {
    for row in boxes.data.rows() {
        let cls = row[5] as usize;
        let text = format!("{} {:.2}", result.label(cls), row[4]);
        let anchor = (row[0].round() as i32, row[1].round() as i32);
        labeler.draw_above(canvas, &text, anchor, color(cls));
    }
}

fn label_obb(canvas: &mut RgbImage, labeler: &Labeler, result: &Results, obb: &Obb) {
    for row in obb.data.rows() {
        let cls = row[6] as usize;
        let corners = rotated_corners(row[0], row[1], row[2], row[3], row[4]);
        // topmost corner
        let (x, y) = corners
            .into_iter()
            .fold(corners[0], |top, c| if c.1 < top.1 { c } else { top });
        let text = format!("{} {:.2}", result.label(cls), row[5]);
        labeler.draw_above(canvas, &text, (x.round() as i32, y.round() as i32), color(cls));
    }
}

/// Top-5 classes, one line each, in the top-left corner.
fn label_probs(
    canvas: &mut RgbImage,
    labeler: &Labeler,
    result: &Results,
    probs: &Probs,
    lw: u32,
) {
    let mut y = lw as i32;
    for (id, conf) in probs.top5().into_iter().zip(probs.top5conf()) {
        let text = format!("{} {conf:.2}", result.label(id));
        labeler.draw_at(canvas, &text, (lw as i32, y), PROBS_BACKGROUND);
        y += labeler.tag_size(&text).1 as i32;
    }
}

fn draw_boxes(canvas: &mut RgbImage, boxes: &Boxes, lw: u32) {
    for row in boxes.data.rows() {
        let c = color(row[5] as usize);
        let (x1, y1) = (row[0].round() as i32, row[1].round() as i32);
        let (x2, y2) = (row[2].round() as i32, row[3].round() as i32);
        for t in 0..lw as i32 {
            let (w, h) = (x2 - x1 - 2 * t, y2 - y1 - 2 * t);
            if w <= 0 || h <= 0 {
                break;
            }
            draw_hollow_rect_mut(canvas, Rect::at(x1 + t, y1 + t).of_size(w as u32, h as u32), c);
        }
    }
}

fn draw_masks(canvas: &mut RgbImage, masks: &Masks, classes: &[usize]) {
    let (width, height) = canvas.dimensions();
    for (i, mask) in masks.data.outer_iter().enumerate() {
        let Rgb(tint) = color(classes.get(i).copied().unwrap_or(i));
        let (mh, mw) = mask.dim();
        for y in 0..height.min(mh as u32) {
            for x in 0..width.min(mw as u32) {
                if mask[[y as usize, x as usize]] == 0 {
                    continue;
                }
                let Rgb(px) = canvas.get_pixel_mut(x, y);
                for (p, t) in px.iter_mut().zip(tint) {
                    *p = (*p as f32 * (1.0 - MASK_ALPHA) + t as f32 * MASK_ALPHA).round() as u8;
                }
            }
        }
    }
}

fn draw_obb(canvas: &mut RgbImage, obb: &Obb) {
    for row in obb.data.rows() {
        let c = color(row[6] as usize);
        let corners = rotated_corners(row[0], row[1], row[2], row[3], row[4]);
        for k in 0..corners.len() {
            let next = corners[(k + 1) % corners.len()];
            draw_line_segment_mut(canvas, corners[k], next, c);
        }
    }
}

fn draw_keypoints(canvas: &mut RgbImage, keypoints: &Keypoints, lw: u32) {
    let radius = lw.max(2) as i32;
    for person in keypoints.data.outer_iter() {
        let nk = person.nrows();
        let visible = |j: usize| person[[j, 2]] >= KEYPOINT_CONF;

        if nk == 17 {
            for (k, &(a, b)) in SKELETON.iter().enumerate() {
                if visible(a) && visible(b) {
                    draw_line_segment_mut(
                        canvas,
                        (person[[a, 0]], person[[a, 1]]),
                        (person[[b, 0]], person[[b, 1]]),
                        color(k),
                    );
                }
            }
        }
        for j in 0..nk {
            if visible(j) {
                let center = (person[[j, 0]].round() as i32, person[[j, 1]].round() as i32);
                draw_filled_circle_mut(canvas, center, radius, color(j));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Names;
    use ndarray::{array, Array3};

    fn blank() -> Results {
        Results::new(RgbImage::from_pixel(64, 64, Rgb([0, 0, 0])), "blank", Names::new())
    }

    #[test]
    fn test_plot_without_fields_is_the_original() {
        let result = blank();
        assert_eq!(plot(&result), result.orig_img);
    }

    #[test]
    fn test_plot_probs_draws_top5_text() {
        let mut classified = blank();
        classified.names = Names::from([(0, "car".to_string()), (1, "person".to_string())]);
        classified.probs = Some(Probs::new(array![0.8, 0.2]));
        let canvas = plot(&classified);

        let lit = canvas.pixels().filter(|p| p.0[0] > 128).count();
        assert!(lit > 0);
        // bottom-right corner stays untouched
        assert_eq!(canvas.get_pixel(63, 63), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_plot_boxes() {
        let mut result = blank();
        result.boxes = Some(Boxes::new(array![[10.0, 30.0, 40.0, 60.0, 0.9, 0.0]], (64, 64)));
        let canvas = plot(&result);

        assert_eq!(canvas.get_pixel(10, 45), &color(0));
        assert_eq!(canvas.get_pixel(25, 45), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_box_label_above_box() {
        let mut result = blank();
        result.names = Names::from([(0, "car".to_string())]);
        result.boxes = Some(Boxes::new(array![[10.0, 40.0, 60.0, 60.0, 0.9, 0.0]], (64, 64)));
        let canvas = plot(&result);

        // tag background touches the top edge of the box
        assert_eq!(canvas.get_pixel(10, 39), &color(0));
        // white text brightens the green channel of the red tag
        let Rgb(tag) = color(0);
        let text_pixels = (0..40)
            .flat_map(|y| (10..64).map(move |x| (x, y)))
            .filter(|&(x, y)| canvas.get_pixel(x, y).0[1] > tag[1])
            .count();
        assert!(text_pixels > 0);
        // nothing above the tag
        assert_eq!(canvas.get_pixel(62, 1), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_plot_masks_blend() {
        let mut result = blank();
        let mut data = Array3::zeros((1, 64, 64));
        data[[0, 5, 5]] = 1;
        result.masks = Some(Masks::new(data));
        let canvas = plot(&result);

        let Rgb(expected) = color(0);
        let blended = expected.map(|c| (c as f32 * MASK_ALPHA).round() as u8);
        assert_eq!(canvas.get_pixel(5, 5), &Rgb(blended));
        assert_eq!(canvas.get_pixel(6, 6), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_plot_keypoints_skip_hidden() {
        let mut result = blank();
        result.keypoints = Some(Keypoints::new(
            array![[[20.0, 20.0, 0.9], [50.0, 50.0, 0.1]]],
            true,
        ));
        let canvas = plot(&result);

        assert_eq!(canvas.get_pixel(20, 20), &color(0));
        assert_eq!(canvas.get_pixel(50, 50), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_plot_obb_outline() {
        let mut result = blank();
        result.obb = Some(Obb::new(
            array![[32.0, 32.0, 20.0, 10.0, 0.0, 0.9, 3.0]],
            (64, 64),
        ));
        let canvas = plot(&result);

        assert_eq!(canvas.get_pixel(32, 27), &color(3));
        assert_eq!(canvas.get_pixel(32, 32), &Rgb([0, 0, 0]));
    }
}

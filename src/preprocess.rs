use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;

pub const LETTERBOX_FILL: u8 = 114;

/// Geometry of the transform applied to an image before it reached the network.
///
/// Postprocessing uses it to map network coordinates back onto the original image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    /// Scale factor from original to network pixels.
    pub ratio: f32,
    /// (left, top) padding in network pixels.
    pub pad: (f32, f32),
    /// (height, width) of the network input.
    pub input_shape: (u32, u32),
    /// (height, width) of the original image.
    pub orig_shape: (u32, u32),
}

impl Letterbox {
    /// Network coordinates to original image coordinates.
    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad.0) / self.ratio,
            (y - self.pad.1) / self.ratio,
        )
    }

    /// Original image coordinates to network coordinates.
    pub fn to_network(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.ratio + self.pad.0, y * self.ratio + self.pad.1)
    }

    pub fn clip(&self, x: f32, y: f32) -> (f32, f32) {
        (
            x.clamp(0.0, self.orig_shape.1 as f32),
            y.clamp(0.0, self.orig_shape.0 as f32),
        )
    }

    pub fn clip_original(&self, x: f32, y: f32) -> (f32, f32) {
        let (x, y) = self.to_original(x, y);
        self.clip(x, y)
    }
}

#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub tensor: Array4<f32>,
    pub letterbox: Letterbox,
}

/// Aspect preserving resize into `target` (height, width), padded with grey around the center.
pub fn letterbox(image: &RgbImage, target: (u32, u32)) -> (RgbImage, Letterbox) {
    let (width, height) = image.dimensions();
    let (target_h, target_w) = target;

    let ratio = (target_h as f32 / height as f32).min(target_w as f32 / width as f32);
    let new_w = ((width as f32 * ratio).round() as u32).clamp(1, target_w);
    let new_h = ((height as f32 * ratio).round() as u32).clamp(1, target_h);

    let dw = (target_w - new_w) as f32 / 2.0;
    let dh = (target_h - new_h) as f32 / 2.0;
    let left = (dw - 0.1).round().max(0.0);
    let top = (dh - 0.1).round().max(0.0);

    let resized = if (new_w, new_h) == (width, height) {
        image.clone()
    } else {
        imageops::resize(image, new_w, new_h, FilterType::Triangle)
    };

    let fill = Rgb([LETTERBOX_FILL; 3]);
    let mut canvas = RgbImage::from_pixel(target_w, target_h, fill);
    imageops::overlay(&mut canvas, &resized, left as i64, top as i64);

    let letterbox = Letterbox {
        ratio,
        pad: (left, top),
        input_shape: target,
        orig_shape: (height, width),
    };
    (canvas, letterbox)
}

/// Shortest-side resize followed by a center crop, as classification heads expect.
pub fn center_crop(image: &RgbImage, target: (u32, u32)) -> RgbImage {
    let (width, height) = image.dimensions();
    let (target_h, target_w) = target;

    let ratio = (target_h as f32 / height as f32).max(target_w as f32 / width as f32);
    let new_w = ((width as f32 * ratio).round() as u32).max(target_w);
    let new_h = ((height as f32 * ratio).round() as u32).max(target_h);

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let x = (new_w - target_w) / 2;
    let y = (new_h - target_h) / 2;
    imageops::crop_imm(&resized, x, y, target_w, target_h).to_image()
}

/// HWC u8 image to NCHW f32 tensor in `[0, 1]`.
pub fn to_tensor(image: &RgbImage) -> Array4<f32> {
    image
        .as_ndarray3()
        .mapv(|v| f32::from(v) / 255.0)
        .insert_axis(Axis(0))
}

pub fn preprocess_dense(image: &RgbImage, target: (u32, u32)) -> Preprocessed {
    let (canvas, letterbox) = letterbox(image, target);
    Preprocessed {
        tensor: to_tensor(&canvas),
        letterbox,
    }
}

pub fn preprocess_classify(image: &RgbImage, target: (u32, u32)) -> Preprocessed {
    let cropped = center_crop(image, target);
    let (width, height) = image.dimensions();
    Preprocessed {
        tensor: to_tensor(&cropped),
        letterbox: Letterbox {
            ratio: 1.0,
            pad: (0.0, 0.0),
            input_shape: target,
            orig_shape: (height, width),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letterbox_wide_image() {
        let image = RgbImage::from_pixel(200, 100, Rgb([255, 0, 0]));
        let (canvas, letterbox) = letterbox(&image, (640, 640));

        assert_eq!(canvas.dimensions(), (640, 640));
        assert!((letterbox.ratio - 3.2).abs() < 1e-6);
        assert_eq!(letterbox.pad, (0.0, 160.0));
        assert_eq!(canvas.get_pixel(320, 10), &Rgb([LETTERBOX_FILL; 3]));
        assert_eq!(canvas.get_pixel(320, 320), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_letterbox_round_trip() {
        let image = RgbImage::new(300, 500);
        let (_, letterbox) = letterbox(&image, (640, 640));

        let (nx, ny) = letterbox.to_network(150.0, 250.0);
        let (x, y) = letterbox.to_original(nx, ny);
        assert!((x - 150.0).abs() < 1e-3);
        assert!((y - 250.0).abs() < 1e-3);
        assert_eq!(letterbox.clip(-5.0, 900.0), (0.0, 500.0));
    }

    #[test]
    fn test_tensor_layout() {
        let mut image = RgbImage::new(4, 2);
        image.put_pixel(3, 1, Rgb([255, 0, 51]));
        let tensor = to_tensor(&image);

        assert_eq!(tensor.shape(), &[1, 3, 2, 4]);
        assert_eq!(tensor[[0, 0, 1, 3]], 1.0);
        assert_eq!(tensor[[0, 1, 1, 3]], 0.0);
        assert!((tensor[[0, 2, 1, 3]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_center_crop_shape() {
        let image = RgbImage::new(320, 240);
        let cropped = center_crop(&image, (224, 224));
        assert_eq!(cropped.dimensions(), (224, 224));

        let pre = preprocess_classify(&image, (224, 224));
        assert_eq!(pre.tensor.shape(), &[1, 3, 224, 224]);
        assert_eq!(pre.letterbox.orig_shape, (240, 320));
    }
}

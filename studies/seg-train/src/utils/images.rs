use image::{ Rgb, RgbImage };

use crate::data::SegSample;
use crate::error::{ SegError, SegResult };

/// Maps Hounsfield units to `[0, 1]` grey.
pub fn hu_to_grey(hu: f32) -> f32 {
    (hu + 1000.0) / 2000.0
}

/// Center slice of a sample and its masks, ready to be drawn.
pub struct SlicePreview<'a> {
    ct: &'a [f32],
    label: &'a [f32],
    benign: &'a [f32],
    malignant: &'a [f32],
    height: usize,
    width: usize,
}

impl<'a> SlicePreview<'a> {
    pub fn from_sample(sample: &'a SegSample) -> Self {
        SlicePreview {
            ct: sample.center_slice(),
            label: &sample.nodule,
            benign: &sample.benign,
            malignant: &sample.malignant,
            height: sample.height,
            width: sample.width,
        }
    }

    /// Grey CT with the prediction painted over it: red where nothing was
    /// labelled, green on malignant and blue on benign nodules.
    pub fn prediction_image(&self, prediction: &[f32]) -> SegResult<RgbImage> {
        if prediction.len() != self.height * self.width {
            return Err(SegError::ShapeMismatch {
                what: "preview prediction",
                expected: vec![self.height, self.width],
                actual: vec![prediction.len()],
            });
        }

        Ok(
            self.render(|i| {
                let p = prediction[i];
                [p * (1.0 - self.label[i]), p * self.malignant[i], p * self.benign[i]]
            })
        )
    }

    /// Grey CT with the ground truth: green malignant, blue benign.
    pub fn label_image(&self) -> RgbImage {
        self.render(|i| [0.0, self.malignant[i], self.benign[i]])
    }

    fn render<F: Fn(usize) -> [f32; 3]>(&self, overlay: F) -> RgbImage {
        let width = self.width;
        RgbImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            let i = (y as usize) * width + (x as usize);
            let grey = hu_to_grey(self.ct[i]);
            let [r, g, b] = overlay(i);
            Rgb([to_u8(grey + r), to_u8(grey + g), to_u8(grey + b)])
        })
    }
}

fn to_u8(value: f32) -> u8 {
    ((value * 0.5).clamp(0.0, 1.0) * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::label_code;

    fn sample() -> SegSample {
        // 1x2 slice: a malignant nodule on the right pixel.
        SegSample {
            ct: vec![-1000.0, 1000.0],
            channels: 1,
            height: 1,
            width: 2,
            nodule: vec![0.0, 1.0],
            benign: vec![0.0, 0.0],
            malignant: vec![0.0, 1.0],
            label: label_code(true, true),
            series_uid: "uid".to_string(),
            slice_ndx: 0,
        }
    }

    #[test]
    fn false_positives_are_red_and_hits_are_green() {
        let sample = sample();
        let image = SlicePreview::from_sample(&sample).prediction_image(&[1.0, 1.0]).unwrap();

        assert_eq!(image.dimensions(), (2, 1));
        assert_eq!(image.get_pixel(0, 0), &Rgb([128, 0, 0]));
        assert_eq!(image.get_pixel(1, 0), &Rgb([128, 255, 128]));
    }

    #[test]
    fn label_image_ignores_the_prediction() {
        let sample = sample();
        let image = SlicePreview::from_sample(&sample).label_image();

        assert_eq!(image.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(1, 0), &Rgb([128, 255, 128]));
    }

    #[test]
    fn wrong_prediction_size_is_rejected() {
        let sample = sample();
        let result = SlicePreview::from_sample(&sample).prediction_image(&[1.0]);

        assert!(matches!(result, Err(SegError::ShapeMismatch { .. })));
    }
}

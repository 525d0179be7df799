use std::fmt;

use image::RgbImage;
use image::imageops::{self, FilterType};
use ndarray::Array3;

use crate::{Error, Result};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpolationMode {
    Nearest,
    Bilinear,
    Bicubic,
}

impl InterpolationMode {
    fn filter(self) -> FilterType {
        match self {
            InterpolationMode::Nearest => FilterType::Nearest,
            InterpolationMode::Bilinear => FilterType::Triangle,
            InterpolationMode::Bicubic => FilterType::CatmullRom,
        }
    }
}

impl fmt::Display for InterpolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterpolationMode::Nearest => "NEAREST",
            InterpolationMode::Bilinear => "BILINEAR",
            InterpolationMode::Bicubic => "BICUBIC",
        };
        write!(f, "InterpolationMode.{}", name)
    }
}

/// Evaluation transform of an image classifier: resize, center crop, normalize
#[derive(Debug, Clone, PartialEq)]
pub struct ImageClassification {
    pub crop_size: Vec<usize>,
    pub resize_size: Vec<usize>,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub interpolation: InterpolationMode,
    /// Informational; the resampling filters always antialias when downscaling
    pub antialias: bool,
}

impl ImageClassification {
    /// Transform shipped with the ImageNet-1K checkpoints
    pub fn imagenet(crop_size: usize, resize_size: usize) -> Self {
        ImageClassification {
            crop_size: vec![crop_size],
            resize_size: vec![resize_size],
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            interpolation: InterpolationMode::Bilinear,
            antialias: true,
        }
    }

    /// `[h, w]` of the crop; a single value means a square
    fn crop_hw(&self) -> Result<(u32, u32)> {
        match self.crop_size.as_slice() {
            [s] => Ok((u32::try_from(*s)?, u32::try_from(*s)?)),
            [h, w] => Ok((u32::try_from(*h)?, u32::try_from(*w)?)),
            other => Err(Error::Shape(format!("crop size {:?}", other))),
        }
    }

    /// Preprocess an RGB image into a normalized `[3, crop_h, crop_w]` tensor
    pub fn apply(&self, image: &RgbImage) -> Result<Array3<f32>> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Err(Error::Shape("empty image".to_string()));
        }

        // the shorter side is scaled to the resize size, keeping aspect ratio
        let (new_w, new_h) = match self.resize_size.as_slice() {
            [s] => {
                let s = u32::try_from(*s)?;
                if w <= h {
                    (s, u32::try_from(u64::from(s) * u64::from(h) / u64::from(w))?)
                } else {
                    (u32::try_from(u64::from(s) * u64::from(w) / u64::from(h))?, s)
                }
            }
            [rh, rw] => (u32::try_from(*rw)?, u32::try_from(*rh)?),
            other => return Err(Error::Shape(format!("resize size {:?}", other))),
        };
        let resized = imageops::resize(image, new_w, new_h, self.interpolation.filter());

        let (crop_h, crop_w) = self.crop_hw()?;
        if crop_h > new_h || crop_w > new_w {
            return Err(Error::Shape(format!(
                "crop {}x{} larger than resized image {}x{}",
                crop_h, crop_w, new_h, new_w
            )));
        }
        let top = ((new_h - crop_h) as f32 / 2.0).round() as u32;
        let left = ((new_w - crop_w) as f32 / 2.0).round() as u32;
        let cropped = imageops::crop_imm(&resized, left, top, crop_w, crop_h).to_image();

        Ok(Array3::from_shape_fn(
            (3, crop_h as usize, crop_w as usize),
            |(c, y, x)| {
                let value = f32::from(cropped.get_pixel(x as u32, y as u32)[c]) / 255.0;
                (value - self.mean[c]) / self.std[c]
            },
        ))
    }
}

impl fmt::Display for ImageClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ImageClassification(")?;
        writeln!(f, "    crop_size={:?}", self.crop_size)?;
        writeln!(f, "    resize_size={:?}", self.resize_size)?;
        writeln!(f, "    mean={:?}", self.mean)?;
        writeln!(f, "    std={:?}", self.std)?;
        writeln!(f, "    interpolation={}", self.interpolation)?;
        writeln!(f, "    antialias={}", if self.antialias { "True" } else { "False" })?;
        write!(f, ")")
    }
}

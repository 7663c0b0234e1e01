use std::{fmt, str::FromStr};

use image::RgbImage;
use serde::Serialize;

use crate::error::WatermarkError;

/// Attack applied to watermarked images before they are stored.
///
/// Every method is accepted. Only `None` has defined behavior: the other
/// methods hand images back untouched, and the pre-attack copy is still kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum AugmentationMethod {
    #[default]
    None,
    Crop,
    Noise,
    Blur,
    Jpeg,
    Combination,
}

impl AugmentationMethod {
    pub const ALL: [AugmentationMethod; 6] = [
        AugmentationMethod::None,
        AugmentationMethod::Crop,
        AugmentationMethod::Noise,
        AugmentationMethod::Blur,
        AugmentationMethod::Jpeg,
        AugmentationMethod::Combination,
    ];

    pub fn is_none(&self) -> bool {
        matches!(self, AugmentationMethod::None)
    }

    pub fn name(&self) -> &'static str {
        match self {
            AugmentationMethod::None => "None",
            AugmentationMethod::Crop => "Crop",
            AugmentationMethod::Noise => "Noise",
            AugmentationMethod::Blur => "Blur",
            AugmentationMethod::Jpeg => "Jpeg",
            AugmentationMethod::Combination => "Combination",
        }
    }

    pub fn augment(&self, images: Vec<RgbImage>) -> Vec<RgbImage> {
        images
    }
}

impl fmt::Display for AugmentationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AugmentationMethod {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AugmentationMethod::ALL
            .into_iter()
            .find(|method| method.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                WatermarkError::InvalidParameter(format!(
                    "unknown augmentation '{s}' (expected None, Crop, Noise, Blur, Jpeg or Combination)"
                ))
            })
    }
}

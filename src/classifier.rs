//! Per-region colour classification of annotated frames.

use std::sync::Arc;

use image::{GenericImageView, RgbImage};
use log::trace;

use crate::config::{Calibration, ClassifierConfig};
use crate::model::{AnnotatedFrame, LedRegion, Observation};
use crate::palette::{ObservedColor, PaletteColor};

/// Largest possible Euclidean distance between two RGB colours.
const MAX_DISTANCE: f32 = 441.672_96; // 255 * sqrt(3)

/// Maps LED regions of a frame to palette colours.
#[derive(Debug, Clone)]
pub struct RegionClassifier {
    calibration: Arc<Calibration>,
    trim_fraction: f32,
    confidence_floor: f32,
    references: Vec<(PaletteColor, [f32; 3])>,
}

impl RegionClassifier {
    pub fn new(calibration: Arc<Calibration>, config: &ClassifierConfig) -> Self {
        let references = PaletteColor::ALL
            .into_iter()
            .filter_map(|color| {
                calibration
                    .reference(color)
                    .map(|rgb| (color, rgb.0.map(f32::from)))
            })
            .collect();
        Self {
            calibration,
            trim_fraction: config.trim_fraction,
            confidence_floor: config.confidence_floor,
            references,
        }
    }

    /// One observation per calibrated region, in region order.
    pub fn classify(&self, annotated: &AnnotatedFrame) -> Vec<Observation> {
        self.classify_image(&annotated.frame.image, annotated.frame.seq)
    }

    pub fn classify_image(&self, image: &RgbImage, frame_seq: u64) -> Vec<Observation> {
        self.calibration
            .regions()
            .iter()
            .map(|region| {
                let (color, confidence) = match self.estimate(image, region) {
                    Some(estimate) => self.nearest(estimate),
                    None => (ObservedColor::Uncertain, 0.0),
                };
                trace!("frame {frame_seq} {}: {color} ({confidence:.2})", region.id);
                Observation {
                    region: region.id,
                    color,
                    confidence,
                    frame_seq,
                }
            })
            .collect()
    }

    /// Trimmed per-channel mean over the region, `None` if it lies outside the image.
    pub fn estimate(&self, image: &RgbImage, region: &LedRegion) -> Option<[f32; 3]> {
        if !region.fits_within(image.width(), image.height()) {
            return None;
        }
        let view = image.view(region.x, region.y, region.width, region.height);
        let mut channels: [Vec<u8>; 3] = Default::default();
        for (_, _, pixel) in view.pixels() {
            for (channel, value) in channels.iter_mut().zip(pixel.0) {
                channel.push(value);
            }
        }
        Some(channels.map(|mut values| trimmed_mean(&mut values, self.trim_fraction)))
    }

    /// Nearest reference colour and its confidence, or `Uncertain` below the floor.
    pub fn nearest(&self, estimate: [f32; 3]) -> (ObservedColor, f32) {
        let Some((color, distance)) = self
            .references
            .iter()
            .map(|(color, reference)| (*color, distance(estimate, *reference)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
        else {
            return (ObservedColor::Uncertain, 0.0);
        };
        let confidence = (1.0 - distance / MAX_DISTANCE).clamp(0.0, 1.0);
        if confidence < self.confidence_floor {
            (ObservedColor::Uncertain, confidence)
        } else {
            (ObservedColor::Palette(color), confidence)
        }
    }
}

fn distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Mean after dropping `trim` of the samples from each end.
fn trimmed_mean(values: &mut [u8], trim: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable();
    let cut = (values.len() as f32 * trim).floor() as usize;
    let kept = if cut * 2 < values.len() {
        &values[cut..values.len() - cut]
    } else {
        &values[..]
    };
    kept.iter().map(|&v| f32::from(v)).sum::<f32>() / kept.len() as f32
}

use std::fmt;
use std::time::{Duration, Instant};

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::palette::{ObservedColor, PaletteColor};

/// Number of LEDs on the board under test.
pub const REGION_COUNT: usize = 9;

/// Index of one calibrated LED region (0-8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct RegionId(u8);

impl RegionId {
    /// Creates a region id if the index is valid (0-8).
    pub const fn new(idx: u8) -> Option<Self> {
        if (idx as usize) < REGION_COUNT {
            Some(Self(idx))
        } else {
            None
        }
    }

    #[inline]
    pub const fn value(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// All region ids in ascending order.
    pub fn all() -> impl Iterator<Item = RegionId> {
        (0..REGION_COUNT as u8).map(RegionId)
    }
}

impl TryFrom<u8> for RegionId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        RegionId::new(value).ok_or_else(|| format!("region index {value} out of range 0-8"))
    }
}

impl From<RegionId> for u8 {
    fn from(id: RegionId) -> Self {
        id.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LED{}", self.0)
    }
}

/// A captured camera frame.
///
/// Frames are moved down the pipeline, never shared or cloned.
#[derive(Debug)]
pub struct Frame {
    pub seq: u64,
    pub captured_at: Instant,
    pub image: RgbImage,
}

/// One step of the LED program as it actually ran on the hardware.
///
/// `start` is the moment the hardware acknowledged the change; `end` is set
/// when the driver began requesting the next change (or stopped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorCommand {
    pub step: usize,
    pub color: PaletteColor,
    pub start: Instant,
    pub end: Option<Instant>,
}

impl ColorCommand {
    #[inline]
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Whether `at` falls inside `[start, end)`; an open window extends forever.
    pub fn contains(&self, at: Instant) -> bool {
        at >= self.start && self.end.is_none_or(|end| at < end)
    }

    /// Duration of a closed window.
    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end.saturating_duration_since(self.start))
    }

    pub fn overlaps(&self, other: &ColorCommand) -> bool {
        let a_before_b = self.end.is_some_and(|end| end <= other.start);
        let b_before_a = other.end.is_some_and(|end| end <= self.start);
        !(a_before_b || b_before_a)
    }
}

/// A frame paired with the command that was active while it was captured.
#[derive(Debug)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub command: ColorCommand,
}

/// Calibrated pixel rectangle for one physical LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedRegion {
    pub id: RegionId,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl LedRegion {
    /// Whether the rectangle lies fully inside a `width` x `height` frame.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.checked_add(self.width).is_some_and(|r| r <= width)
            && self.y.checked_add(self.height).is_some_and(|b| b <= height)
    }

    pub fn contains_pixel(&self, px: u32, py: u32) -> bool {
        px >= self.x && px < self.x + self.width && py >= self.y && py < self.y + self.height
    }
}

/// Per-region classification of one annotated frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub region: RegionId,
    pub color: ObservedColor,
    pub confidence: f32,
    pub frame_seq: u64,
}

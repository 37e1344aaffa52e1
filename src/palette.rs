use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 8-bit RGB triple, as driven onto an LED or read back from a frame.
pub type Rgb = image::Rgb<u8>;

/// The closed set of colours an LED can be commanded to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaletteColor {
    Off,
    Red,
    Green,
    Blue,
    Purple,
    Orange,
}

impl PaletteColor {
    /// Every palette entry, in declaration order.
    pub const ALL: [PaletteColor; 6] = [
        PaletteColor::Off,
        PaletteColor::Red,
        PaletteColor::Green,
        PaletteColor::Blue,
        PaletteColor::Purple,
        PaletteColor::Orange,
    ];

    /// Lower-case name, used for logs and artifact directory names.
    pub const fn name(self) -> &'static str {
        match self {
            PaletteColor::Off => "off",
            PaletteColor::Red => "red",
            PaletteColor::Green => "green",
            PaletteColor::Blue => "blue",
            PaletteColor::Purple => "purple",
            PaletteColor::Orange => "orange",
        }
    }

    /// Single-character code used by observation scripts.
    pub const fn code(self) -> char {
        match self {
            PaletteColor::Off => '-',
            PaletteColor::Red => 'R',
            PaletteColor::Green => 'G',
            PaletteColor::Blue => 'B',
            PaletteColor::Purple => 'P',
            PaletteColor::Orange => 'O',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// Drive value written to the LED strip for this colour.
    pub const fn drive_rgb(self) -> Rgb {
        match self {
            PaletteColor::Off => image::Rgb([0, 0, 0]),
            PaletteColor::Red => image::Rgb([255, 0, 0]),
            PaletteColor::Green => image::Rgb([0, 255, 0]),
            PaletteColor::Blue => image::Rgb([0, 0, 255]),
            PaletteColor::Purple => image::Rgb([255, 0, 255]),
            PaletteColor::Orange => image::Rgb([255, 99, 71]),
        }
    }
}

impl fmt::Display for PaletteColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error when parsing a palette colour name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown palette colour: '{0}'")]
pub struct UnknownColor(String);

impl FromStr for PaletteColor {
    type Err = UnknownColor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownColor(s.to_string()))
    }
}

/// Colour label assigned to one region of one frame.
///
/// `Uncertain` is an explicit outcome: the classifier could not place the
/// region close enough to any palette reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservedColor {
    Palette(PaletteColor),
    Uncertain,
}

impl ObservedColor {
    /// The palette colour, if the observation was confident.
    #[inline]
    pub fn confident(self) -> Option<PaletteColor> {
        match self {
            ObservedColor::Palette(color) => Some(color),
            ObservedColor::Uncertain => None,
        }
    }

    pub const fn code(self) -> char {
        match self {
            ObservedColor::Palette(color) => color.code(),
            ObservedColor::Uncertain => '?',
        }
    }
}

impl fmt::Display for ObservedColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservedColor::Palette(color) => color.fmt(f),
            ObservedColor::Uncertain => f.write_str("uncertain"),
        }
    }
}

impl From<PaletteColor> for ObservedColor {
    fn from(color: PaletteColor) -> Self {
        ObservedColor::Palette(color)
    }
}

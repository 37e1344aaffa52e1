use std::sync::{Arc, Mutex};

use super::lock;
use crate::model::{REGION_COUNT, RegionId};
use crate::palette::{PaletteColor, Rgb};

/// Manufacturing defect injected into one LED of the simulated board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Defect {
    /// Never lights up.
    Dead,
    /// Shows the same colour whatever it is driven with.
    Stuck(PaletteColor),
    /// Covered by something, the camera sees a dull grey blob.
    Obscured,
}

/// What the camera sees at one LED position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appearance {
    Palette(PaletteColor),
    /// Driven with a value outside the palette.
    Raw(Rgb),
    Obscured,
}

#[derive(Debug)]
struct BoardState {
    driven: [Rgb; REGION_COUNT],
    defects: [Option<Defect>; REGION_COUNT],
}

/// The board under test: LED values written by the strip, read by the camera.
#[derive(Debug, Clone)]
pub struct SimBoard {
    state: Arc<Mutex<BoardState>>,
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBoard {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BoardState {
                driven: [PaletteColor::Off.drive_rgb(); REGION_COUNT],
                defects: [None; REGION_COUNT],
            })),
        }
    }

    /// Latch new LED values.
    pub fn drive(&self, colors: &[Rgb; REGION_COUNT]) {
        lock(&self.state).driven = *colors;
    }

    pub fn driven(&self) -> [Rgb; REGION_COUNT] {
        lock(&self.state).driven
    }

    pub fn inject(&self, region: RegionId, defect: Defect) {
        lock(&self.state).defects[region.index()] = Some(defect);
    }

    pub fn repair(&self) {
        lock(&self.state).defects = [None; REGION_COUNT];
    }

    /// Per-LED appearance with defects applied.
    pub fn appearance(&self) -> [Appearance; REGION_COUNT] {
        let state = lock(&self.state);
        std::array::from_fn(|idx| match state.defects[idx] {
            Some(Defect::Dead) => Appearance::Palette(PaletteColor::Off),
            Some(Defect::Stuck(color)) => Appearance::Palette(color),
            Some(Defect::Obscured) => Appearance::Obscured,
            None => {
                let driven = state.driven[idx];
                PaletteColor::ALL
                    .iter()
                    .copied()
                    .find(|c| c.drive_rgb() == driven)
                    .map_or(Appearance::Raw(driven), Appearance::Palette)
            }
        })
    }
}

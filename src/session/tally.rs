use std::collections::BTreeMap;

use crate::model::RegionId;
use crate::palette::{ObservedColor, PaletteColor};

/// Observation counts for one region during one program step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepCounts {
    by_color: BTreeMap<PaletteColor, u32>,
    uncertain: u32,
}

/// What the counts for one region and step add up to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepReading {
    /// A single colour holds the plurality of confident observations.
    Confirmed(PaletteColor),
    /// Two or more colours share the highest count.
    Ambiguous,
    /// No confident observation was recorded.
    NoEvidence,
}

impl StepCounts {
    #[inline]
    pub fn count(&self, color: PaletteColor) -> u32 {
        self.by_color.get(&color).copied().unwrap_or(0)
    }

    #[inline]
    pub fn uncertain(&self) -> u32 {
        self.uncertain
    }

    pub fn confident_total(&self) -> u32 {
        self.by_color.values().sum()
    }

    /// Plurality winner among confident observations. Ties never produce a winner.
    pub fn reading(&self) -> StepReading {
        let Some(best) = self.by_color.values().copied().max().filter(|&n| n > 0) else {
            return StepReading::NoEvidence;
        };
        let mut leaders = self.by_color.iter().filter(|&(_, &n)| n == best);
        match (leaders.next(), leaders.next()) {
            (Some((&color, _)), None) => StepReading::Confirmed(color),
            _ => StepReading::Ambiguous,
        }
    }
}

/// Per-region, per-step observation counts for one test session.
///
/// Counts only ever grow; a new session starts from an empty tally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    counts: BTreeMap<(RegionId, usize), StepCounts>,
}

impl Tally {
    pub const fn new() -> Self {
        Self {
            counts: BTreeMap::new(),
        }
    }

    /// Add one observation for `region` during program step `step`.
    pub fn add(&mut self, region: RegionId, step: usize, color: ObservedColor) {
        let entry = self.counts.entry((region, step)).or_default();
        match color {
            ObservedColor::Palette(color) => *entry.by_color.entry(color).or_insert(0) += 1,
            ObservedColor::Uncertain => entry.uncertain += 1,
        }
    }

    pub fn get(&self, region: RegionId, step: usize) -> Option<&StepCounts> {
        self.counts.get(&(region, step))
    }

    pub fn reading(&self, region: RegionId, step: usize) -> StepReading {
        self.get(region, step)
            .map_or(StepReading::NoEvidence, StepCounts::reading)
    }

    /// Confident observations recorded for a region over the whole session.
    pub fn confident_for(&self, region: RegionId) -> u32 {
        self.counts
            .iter()
            .filter(|((r, _), _)| *r == region)
            .map(|(_, counts)| counts.confident_total())
            .sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(idx: u8) -> RegionId {
        RegionId::new(idx).unwrap()
    }

    #[test]
    fn test_empty_tally_has_no_evidence() {
        let tally = Tally::new();
        assert!(tally.is_empty());
        assert_eq!(tally.reading(region(0), 0), StepReading::NoEvidence);
    }

    #[test]
    fn test_plurality_wins() {
        let mut tally = Tally::new();
        for color in [PaletteColor::Red, PaletteColor::Red, PaletteColor::Orange] {
            tally.add(region(2), 1, color.into());
        }

        assert_eq!(
            tally.reading(region(2), 1),
            StepReading::Confirmed(PaletteColor::Red)
        );
        assert_eq!(tally.get(region(2), 1).unwrap().count(PaletteColor::Orange), 1);
    }

    #[test]
    fn test_tie_is_ambiguous() {
        let mut tally = Tally::new();
        tally.add(region(0), 0, PaletteColor::Red.into());
        tally.add(region(0), 0, PaletteColor::Green.into());

        assert_eq!(tally.reading(region(0), 0), StepReading::Ambiguous);
    }

    #[test]
    fn test_uncertain_observations_never_win() {
        let mut tally = Tally::new();
        for _ in 0..10 {
            tally.add(region(7), 0, ObservedColor::Uncertain);
        }
        tally.add(region(7), 0, PaletteColor::Blue.into());

        let counts = tally.get(region(7), 0).unwrap();
        assert_eq!(counts.uncertain(), 10);
        assert_eq!(counts.confident_total(), 1);
        assert_eq!(
            tally.reading(region(7), 0),
            StepReading::Confirmed(PaletteColor::Blue)
        );
    }

    #[test]
    fn test_only_uncertain_is_no_evidence() {
        let mut tally = Tally::new();
        tally.add(region(7), 3, ObservedColor::Uncertain);

        assert_eq!(tally.reading(region(7), 3), StepReading::NoEvidence);
        assert_eq!(tally.confident_for(region(7)), 0);
    }

    #[test]
    fn test_steps_are_counted_separately() {
        let mut tally = Tally::new();
        tally.add(region(1), 0, PaletteColor::Red.into());
        tally.add(region(1), 1, PaletteColor::Green.into());
        tally.add(region(1), 1, PaletteColor::Green.into());

        assert_eq!(
            tally.reading(region(1), 0),
            StepReading::Confirmed(PaletteColor::Red)
        );
        assert_eq!(tally.confident_for(region(1)), 3);
    }
}

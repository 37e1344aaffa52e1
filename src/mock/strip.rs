use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use log::trace;

use super::SimError;
use super::board::SimBoard;
use crate::model::REGION_COUNT;
use crate::palette::Rgb;
use crate::LedStrip;

#[derive(Debug, Default)]
struct StripControls {
    open: AtomicBool,
    deny: AtomicBool,
    broken: AtomicBool,
    failing_writes: AtomicU32,
    latency_us: AtomicU64,
    writes: AtomicU64,
    reinitializations: AtomicU32,
}

/// LED strip soldered to a [`SimBoard`].
#[derive(Debug, Clone)]
pub struct SimLedStrip {
    board: SimBoard,
    controls: Arc<StripControls>,
}

impl SimLedStrip {
    pub fn new(board: SimBoard) -> Self {
        Self {
            board,
            controls: Arc::default(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.controls.open.load(Ordering::SeqCst)
    }

    /// Time between a write request and the LEDs latching.
    pub fn set_latency(&self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.controls.latency_us.store(us, Ordering::SeqCst);
    }

    pub fn deny_permission(&self, deny: bool) {
        self.controls.deny.store(deny, Ordering::SeqCst);
    }

    /// Reject the next `count` writes.
    pub fn fail_next_writes(&self, count: u32) {
        self.controls.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Reject every write until cleared.
    pub fn break_writes(&self, broken: bool) {
        self.controls.broken.store(broken, Ordering::SeqCst);
    }

    /// Writes that reached the board.
    pub fn writes(&self) -> u64 {
        self.controls.writes.load(Ordering::SeqCst)
    }

    pub fn reinitializations(&self) -> u32 {
        self.controls.reinitializations.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        if self.controls.broken.load(Ordering::SeqCst) {
            return true;
        }
        self.controls
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl LedStrip for SimLedStrip {
    type Error = SimError;

    fn open(&mut self) -> Result<(), Self::Error> {
        if self.controls.deny.load(Ordering::SeqCst) {
            return Err(SimError::PermissionDenied("led strip"));
        }
        self.controls.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn show(&mut self, colors: &[Rgb; REGION_COUNT]) -> Result<(), Self::Error> {
        if !self.is_open() {
            return Err(SimError::NotOpen("led strip"));
        }
        let latency = self.controls.latency_us.load(Ordering::SeqCst);
        if latency > 0 {
            thread::sleep(Duration::from_micros(latency));
        }
        if self.take_failure() {
            return Err(SimError::WriteFailed("led strip"));
        }
        self.board.drive(colors);
        self.controls.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reinitialize(&mut self) -> Result<(), Self::Error> {
        trace!("reinitializing simulated strip");
        self.controls.reinitializations.fetch_add(1, Ordering::SeqCst);
        self.close();
        self.open()
    }

    fn close(&mut self) {
        self.controls.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::Appearance;
    use crate::palette::PaletteColor;

    #[test]
    fn test_show_reaches_board() {
        let board = SimBoard::new();
        let mut strip = SimLedStrip::new(board.clone());
        strip.open().unwrap();

        strip
            .show(&[PaletteColor::Orange.drive_rgb(); REGION_COUNT])
            .unwrap();

        assert_eq!(board.appearance()[8], Appearance::Palette(PaletteColor::Orange));
        assert_eq!(strip.writes(), 1);
    }

    #[test]
    fn test_failing_writes_are_consumed() {
        let mut strip = SimLedStrip::new(SimBoard::new());
        strip.open().unwrap();
        strip.fail_next_writes(2);
        let colors = [PaletteColor::Red.drive_rgb(); REGION_COUNT];

        assert!(strip.show(&colors).is_err());
        assert!(strip.show(&colors).is_err());
        assert!(strip.show(&colors).is_ok());
    }

    #[test]
    fn test_permission_denied() {
        let mut strip = SimLedStrip::new(SimBoard::new());
        strip.deny_permission(true);

        assert_eq!(strip.open(), Err(SimError::PermissionDenied("led strip")));
        assert!(!strip.is_open());
    }
}

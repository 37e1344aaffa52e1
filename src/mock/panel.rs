use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{SimError, lock};
use crate::palette::{PaletteColor, Rgb};
use crate::{StatusLight, TriggerButton};

/// Changes remembered by [`SimStatusLight`].
const HISTORY: usize = 256;

#[derive(Debug)]
struct LightState {
    current: Rgb,
    history: VecDeque<Rgb>,
}

/// Status lamp that remembers the colours it was set to.
#[derive(Debug, Clone)]
pub struct SimStatusLight {
    state: Arc<Mutex<LightState>>,
}

impl Default for SimStatusLight {
    fn default() -> Self {
        Self::new()
    }
}

impl SimStatusLight {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LightState {
                current: PaletteColor::Off.drive_rgb(),
                history: VecDeque::new(),
            })),
        }
    }

    pub fn current(&self) -> Rgb {
        lock(&self.state).current
    }

    /// Distinct colours shown, oldest first.
    pub fn history(&self) -> Vec<Rgb> {
        lock(&self.state).history.iter().copied().collect()
    }
}

impl StatusLight for SimStatusLight {
    type Error = SimError;

    fn set(&mut self, color: Rgb) -> Result<(), Self::Error> {
        let mut state = lock(&self.state);
        if state.current != color || state.history.is_empty() {
            if state.history.len() == HISTORY {
                state.history.pop_front();
            }
            state.history.push_back(color);
        }
        state.current = color;
        Ok(())
    }
}

/// Momentary button pressed from a test or the terminal.
#[derive(Debug, Clone, Default)]
pub struct SimButton {
    pressed: Arc<AtomicBool>,
}

impl SimButton {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press(&self) {
        self.pressed.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.pressed.store(false, Ordering::SeqCst);
    }
}

impl TriggerButton for SimButton {
    type Error = SimError;

    fn is_pressed(&mut self) -> Result<bool, Self::Error> {
        Ok(self.pressed.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_light_history_skips_repeats() {
        let probe = SimStatusLight::new();
        let mut light = probe.clone();
        let red = PaletteColor::Red.drive_rgb();
        let off = PaletteColor::Off.drive_rgb();

        light.set(red).unwrap();
        light.set(red).unwrap();
        light.set(off).unwrap();

        assert_eq!(probe.history(), vec![red, off]);
        assert_eq!(probe.current(), off);
    }

    #[test]
    fn test_button_level() {
        let probe = SimButton::new();
        let mut button = probe.clone();

        assert!(!button.is_pressed().unwrap());
        probe.press();
        assert!(button.is_pressed().unwrap());
        probe.release();
        assert!(!button.is_pressed().unwrap());
    }
}

//! Simulated rig hardware for host runs and tests.
//!
//! Every device shares state through clones: keep one clone as a probe to
//! inject failures and inspect what the pipeline did with the other.

mod board;
mod camera;
mod display;
mod panel;
mod script;
mod strip;
mod terminal;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::config::Calibration;
use crate::error::{HardwareError, HardwareErrorKind};

pub use board::{Appearance, Defect, SimBoard};
pub use camera::SimCamera;
pub use display::TerminalIndicator;
pub use panel::{SimButton, SimStatusLight};
pub use script::{ParseError, ScriptedObservations};
pub use strip::SimLedStrip;
pub use terminal::run_trigger_terminal;

/// Errors raised by the simulated devices.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("{0} is not open")]
    NotOpen(&'static str),

    #[error("permission denied opening {0}")]
    PermissionDenied(&'static str),

    #[error("{0} disconnected")]
    Disconnected(&'static str),

    #[error("capture timed out")]
    Timeout,

    #[error("{0} rejected the write")]
    WriteFailed(&'static str),
}

impl HardwareError for SimError {
    fn kind(&self) -> HardwareErrorKind {
        match self {
            SimError::PermissionDenied(_) => HardwareErrorKind::PermissionDenied,
            SimError::NotOpen(_) | SimError::Disconnected(_) => HardwareErrorKind::Unavailable,
            SimError::Timeout | SimError::WriteFailed(_) => HardwareErrorKind::Transient,
        }
    }
}

/// One of each simulated device, wired to the same board.
#[derive(Debug, Clone)]
pub struct SimRig {
    pub board: SimBoard,
    pub camera: SimCamera,
    pub strip: SimLedStrip,
    pub light: SimStatusLight,
    pub button: SimButton,
}

impl SimRig {
    pub fn new(calibration: Arc<Calibration>, seed: u64) -> Self {
        let board = SimBoard::new();
        Self {
            camera: SimCamera::new(board.clone(), calibration, seed),
            strip: SimLedStrip::new(board.clone()),
            light: SimStatusLight::new(),
            button: SimButton::new(),
            board,
        }
    }
}

/// Lock a shared device state, recovering it if a holder panicked.
fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

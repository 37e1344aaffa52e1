//! Camera-driven pass/fail inspection of a 9-LED board.
//!
//! The LED driver walks the board through a colour program while the frame
//! source captures the board; frames are matched to the command that was
//! active when they were taken, classified per LED region, and tallied by a
//! test session into one verdict per cycle.

use image::RgbImage;

pub mod annotator;
pub mod artifacts;
pub mod classifier;
pub mod config;
pub mod error;
pub mod frame_source;
pub mod led_driver;
pub mod model;
pub mod orchestrator;
pub mod palette;
pub mod session;
pub mod sink;
pub mod status;

pub mod mock;

pub use error::{Fault, HardwareError, HardwareErrorKind, RigError};
pub use model::REGION_COUNT;
pub use palette::{ObservedColor, PaletteColor, Rgb};

/// Camera hardware capable of grabbing single RGB frames.
///
/// Abstracts over a real sensor and the simulated camera, giving the
/// [`frame_source::FrameSource`] a uniform interface.
pub trait Camera: Send + 'static {
    /// Error type for camera failures.
    type Error: HardwareError;

    /// Acquire the device. Called once before a capture run.
    fn open(&mut self) -> Result<(), Self::Error>;

    /// Capture one frame. May block for up to one frame period.
    fn capture(&mut self) -> Result<RgbImage, Self::Error>;

    /// Release the device. Must be safe to call on an unopened camera.
    fn close(&mut self);
}

/// Addressable LED strip driving the board under test.
///
/// Mirrors [`Camera`] on the output side.
pub trait LedStrip: Send + 'static {
    /// Error type for strip failures.
    type Error: HardwareError;

    fn open(&mut self) -> Result<(), Self::Error>;

    /// Write one colour per LED and return once the hardware has latched them.
    fn show(&mut self, colors: &[Rgb; REGION_COUNT]) -> Result<(), Self::Error>;

    /// Tear down and re-acquire the strip after a failed write.
    fn reinitialize(&mut self) -> Result<(), Self::Error> {
        self.close();
        self.open()
    }

    fn close(&mut self);
}

/// Single RGB lamp used as the operator-facing status indicator.
pub trait StatusLight: Send + 'static {
    type Error: HardwareError;

    fn set(&mut self, color: Rgb) -> Result<(), Self::Error>;
}

/// Momentary push button that starts a test cycle.
pub trait TriggerButton: Send + 'static {
    type Error: HardwareError;

    /// Sample the current button level.
    fn is_pressed(&mut self) -> Result<bool, Self::Error>;
}

/// Receives verdicts, faults and status changes on behalf of the operator.
///
/// Implementations map [`status::RigStatus`] to whatever the operator sees
/// (an animated lamp, a terminal line, a test recorder).
pub trait ResultSink {
    /// Error type for sink update failures.
    type Error: std::fmt::Debug + std::fmt::Display;

    fn show_status(&mut self, status: status::RigStatus) -> Result<(), Self::Error>;

    fn report_fault(&mut self, fault: &Fault) -> Result<(), Self::Error>;

    fn report_verdict(&mut self, verdict: &session::Verdict) -> Result<(), Self::Error>;
}

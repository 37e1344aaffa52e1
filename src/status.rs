//! Operator status indicator: which pattern each rig status shows, and the
//! thread that animates it on a [`StatusLight`].

use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::StatusLight;
use crate::error::Fault;
use crate::palette::{PaletteColor, Rgb};
use crate::session::{FailureReason, Verdict};

/// Half period of the blink pattern.
pub const BLINK_HALF_PERIOD: Duration = Duration::from_millis(200);
/// Full ramp up and down of the breathe pattern.
pub const BREATHE_PERIOD: Duration = Duration::from_millis(512);

const WHITE: Rgb = image::Rgb([255, 255, 255]);

/// What the operator should be told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigStatus {
    /// Not ready or shut down.
    Off,
    /// Idle and waiting for a button press.
    Ready,
    Running,
    Passed,
    Failed,
    CameraUnreachable,
    ConfigUnreadable,
    PermissionDenied,
}

impl RigStatus {
    pub const fn label(self) -> &'static str {
        match self {
            RigStatus::Off => "off",
            RigStatus::Ready => "ready",
            RigStatus::Running => "running",
            RigStatus::Passed => "passed",
            RigStatus::Failed => "failed",
            RigStatus::CameraUnreachable => "camera unreachable",
            RigStatus::ConfigUnreadable => "configuration unreadable",
            RigStatus::PermissionDenied => "permission denied",
        }
    }

    pub fn for_fault(fault: &Fault) -> Self {
        match fault {
            Fault::CameraUnreachable(_) => RigStatus::CameraUnreachable,
            Fault::ConfigUnreadable(_) => RigStatus::ConfigUnreadable,
            Fault::PermissionDenied(_) => RigStatus::PermissionDenied,
            Fault::LedHardwareFault(_) => RigStatus::Failed,
        }
    }

    /// A cycle cut short by a camera, permission or config fault keeps that
    /// fault's pattern; every other failure is solid red.
    pub fn for_verdict(verdict: &Verdict) -> Self {
        match verdict.reason() {
            None => RigStatus::Passed,
            Some(FailureReason::CameraUnreachable) => RigStatus::CameraUnreachable,
            Some(FailureReason::PermissionDenied) => RigStatus::PermissionDenied,
            Some(FailureReason::ConfigUnreadable) => RigStatus::ConfigUnreadable,
            Some(_) => RigStatus::Failed,
        }
    }
}

impl fmt::Display for RigStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Solid,
    Blink,
    Breathe,
}

/// A colour played with a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Indicator {
    pub pattern: Pattern,
    pub color: Rgb,
}

impl Indicator {
    const fn new(pattern: Pattern, color: Rgb) -> Self {
        Self { pattern, color }
    }
}

pub const fn indicator_for(status: RigStatus) -> Indicator {
    match status {
        RigStatus::Off => Indicator::new(Pattern::Solid, PaletteColor::Off.drive_rgb()),
        RigStatus::Ready => Indicator::new(Pattern::Solid, WHITE),
        RigStatus::Running => Indicator::new(Pattern::Breathe, PaletteColor::Blue.drive_rgb()),
        RigStatus::Passed => Indicator::new(Pattern::Solid, PaletteColor::Green.drive_rgb()),
        RigStatus::Failed => Indicator::new(Pattern::Solid, PaletteColor::Red.drive_rgb()),
        RigStatus::CameraUnreachable => {
            Indicator::new(Pattern::Breathe, PaletteColor::Purple.drive_rgb())
        }
        RigStatus::ConfigUnreadable => Indicator::new(Pattern::Blink, PaletteColor::Red.drive_rgb()),
        RigStatus::PermissionDenied => {
            Indicator::new(Pattern::Blink, PaletteColor::Orange.drive_rgb())
        }
    }
}

/// Colour the lamp shows `elapsed` after the indicator was selected.
pub fn level_at(indicator: Indicator, elapsed: Duration) -> Rgb {
    let brightness: u32 = match indicator.pattern {
        Pattern::Solid => 255,
        Pattern::Blink => {
            let half = elapsed.as_millis() / BLINK_HALF_PERIOD.as_millis();
            if half % 2 == 0 { 255 } else { 0 }
        }
        Pattern::Breathe => {
            let period = BREATHE_PERIOD.as_millis();
            let phase = (elapsed.as_millis() % period) as u32;
            let half = (period / 2) as u32;
            let ramp = if phase < half { phase } else { period as u32 - 1 - phase };
            ramp * 255 / (half - 1)
        }
    };
    image::Rgb(indicator.color.0.map(|c| (u32::from(c) * brightness / 255) as u8))
}

#[derive(Debug)]
enum PlayerMsg {
    Show(RigStatus),
}

/// Thread owning the status lamp and animating the current indicator.
#[derive(Debug)]
pub struct StatusPlayer {
    tx: Option<Sender<PlayerMsg>>,
    handle: Option<JoinHandle<()>>,
}

impl StatusPlayer {
    /// Spawn the player. `tick` is the animation step.
    pub fn spawn<L: StatusLight>(mut light: L, tick: Duration) -> std::io::Result<Self> {
        let (tx, rx) = channel::bounded::<PlayerMsg>(16);
        let handle = thread::Builder::new()
            .name("status-light".into())
            .spawn(move || {
                let mut indicator = indicator_for(RigStatus::Off);
                let mut since = Instant::now();
                let mut warned = false;
                loop {
                    match rx.recv_timeout(tick) {
                        Ok(PlayerMsg::Show(status)) => {
                            debug!("status light: {status}");
                            indicator = indicator_for(status);
                            since = Instant::now();
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let color = level_at(indicator, since.elapsed());
                    if let Err(err) = light.set(color)
                        && !warned
                    {
                        warn!("status light write failed: {err}");
                        warned = true;
                    }
                }
                if let Err(err) = light.set(PaletteColor::Off.drive_rgb()) {
                    warn!("could not turn status light off: {err}");
                }
                debug!("status light released");
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Switch the indicator. Returns `false` once the player has stopped.
    pub fn show(&self, status: RigStatus) -> bool {
        self.tx
            .as_ref()
            .is_some_and(|tx| tx.send(PlayerMsg::Show(status)).is_ok())
    }

    /// Turn the lamp off and join the thread.
    pub fn stop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("status light thread panicked");
        }
    }
}

impl Drop for StatusPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

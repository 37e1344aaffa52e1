//! Walks the LED strip through a colour program on its own thread.
//!
//! Each step's window opens when the strip acknowledges the write and closes
//! the moment the next write (or shutdown) is requested, so windows never
//! overlap and never include the hardware's settling time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};

use crate::config::{LedConfig, ProgramStep};
use crate::error::{Fault, HardwareError, HardwareErrorKind, RigError};
use crate::model::{ColorCommand, REGION_COUNT};
use crate::palette::{PaletteColor, Rgb};
use crate::LedStrip;

const EVENT_CAPACITY: usize = 64;

/// Notifications about the program as it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    /// The strip acknowledged a step; its window is open.
    Started(ColorCommand),
    /// A step's window closed.
    Ended(ColorCommand),
    /// Every step ran.
    Completed { at: Instant },
}

/// How a program run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Faulted,
}

#[derive(Debug)]
struct ProgramRun<L> {
    cancel: Sender<()>,
    handle: JoinHandle<(L, RunOutcome)>,
}

/// Shared with the program thread.
#[derive(Debug, Clone)]
struct RunContext {
    config: LedConfig,
    active: Arc<Mutex<Option<ColorCommand>>>,
    events: Sender<DriverEvent>,
    faults: Sender<Fault>,
    cancel: Receiver<()>,
}

impl RunContext {
    fn emit(&self, event: DriverEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => {
                crossbeam::select! {
                    send(self.events, event) -> _ => {}
                    recv(self.cancel) -> _ => debug!("driver event dropped on cancel"),
                }
            }
        }
    }

    fn begin(&self, command: ColorCommand) {
        *lock(&self.active) = Some(command);
        self.emit(DriverEvent::Started(command));
    }

    fn end(&self, mut command: ColorCommand, at: Instant) {
        command.end = Some(at);
        *lock(&self.active) = None;
        self.emit(DriverEvent::Ended(command));
    }

    /// Sleep until `deadline`; `true` if cancelled first.
    fn hold_until(&self, deadline: Instant) -> bool {
        let remaining = deadline.saturating_duration_since(Instant::now());
        !matches!(
            self.cancel.recv_timeout(remaining),
            Err(RecvTimeoutError::Timeout)
        )
    }

    fn cancelled(&self) -> bool {
        !matches!(
            self.cancel.try_recv(),
            Err(channel::TryRecvError::Empty)
        )
    }
}

/// Owns the strip for one program run; turns the LEDs off and closes on drop.
struct StripSession<'a, L: LedStrip> {
    strip: &'a mut L,
}

impl<'a, L: LedStrip> StripSession<'a, L> {
    fn open(strip: &'a mut L) -> Result<Self, L::Error> {
        strip.open()?;
        debug!("led strip acquired");
        Ok(Self { strip })
    }

    /// Write with bounded retries, re-initialising the strip before each retry.
    fn show(&mut self, colors: &[Rgb; REGION_COUNT], config: &LedConfig) -> Result<(), String> {
        let mut attempt = 0;
        loop {
            match self.strip.show(colors) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < config.write_retries => {
                    attempt += 1;
                    warn!(
                        "led write failed ({err}), retry {attempt}/{}",
                        config.write_retries
                    );
                    thread::sleep(config.retry_backoff());
                    if let Err(err) = self.strip.reinitialize() {
                        warn!("led strip reinitialize failed: {err}");
                    }
                }
                Err(err) => {
                    return Err(format!(
                        "write failed after {} retries: {err}",
                        config.write_retries
                    ));
                }
            }
        }
    }
}

impl<L: LedStrip> Drop for StripSession<'_, L> {
    fn drop(&mut self) {
        if let Err(err) = self.strip.show(&frame_of(PaletteColor::Off)) {
            debug!("could not blank strip on release: {err}");
        }
        self.strip.close();
        debug!("led strip released");
    }
}

/// Drives programs on an [`LedStrip`] and reports each step's active window.
#[derive(Debug)]
pub struct LedDriver<L: LedStrip> {
    config: LedConfig,
    strip: Option<L>,
    run: Option<ProgramRun<L>>,
    active: Arc<Mutex<Option<ColorCommand>>>,
    events_tx: Sender<DriverEvent>,
    events_rx: Receiver<DriverEvent>,
    faults: Sender<Fault>,
}

impl<L: LedStrip> LedDriver<L> {
    pub fn new(strip: L, config: LedConfig, faults: Sender<Fault>) -> Self {
        let (events_tx, events_rx) = channel::bounded(EVENT_CAPACITY);
        Self {
            config,
            strip: Some(strip),
            run: None,
            active: Arc::default(),
            events_tx,
            events_rx,
            faults,
        }
    }

    /// Open and release the strip once to surface permission problems at startup.
    pub fn probe(&mut self) -> Result<(), Fault> {
        self.reap();
        let Some(strip) = self.strip.as_mut() else {
            return Err(Fault::LedHardwareFault("strip busy with a program".into()));
        };
        match StripSession::open(strip) {
            Ok(_session) => Ok(()),
            Err(err) => Err(open_fault(&err)),
        }
    }

    /// Start driving `steps` in order. Fails if a program is still running.
    pub fn run_program(&mut self, steps: &[ProgramStep]) -> Result<(), RigError> {
        self.reap();
        let Some(mut strip) = self.strip.take() else {
            return Err(RigError::InvalidTransition {
                action: "run a program",
                state: "running a program",
            });
        };
        while self.events_rx.try_recv().is_ok() {}
        *lock(&self.active) = None;

        let (cancel_tx, cancel_rx) = channel::bounded(1);
        let ctx = RunContext {
            config: self.config.clone(),
            active: Arc::clone(&self.active),
            events: self.events_tx.clone(),
            faults: self.faults.clone(),
            cancel: cancel_rx,
        };
        let steps = steps.to_vec();
        info!("running led program of {} steps", steps.len());
        let handle = thread::Builder::new()
            .name("led-driver".into())
            .spawn(move || {
                let outcome = play(&mut strip, &steps, &ctx);
                (strip, outcome)
            })
            .map_err(|err| RigError::LedHardwareFault(format!("spawn failed: {err}")))?;
        self.run = Some(ProgramRun {
            cancel: cancel_tx,
            handle,
        });
        Ok(())
    }

    /// Command whose window is open right now.
    pub fn active(&self) -> Option<ColorCommand> {
        *lock(&self.active)
    }

    pub fn events(&self) -> &Receiver<DriverEvent> {
        &self.events_rx
    }

    pub fn is_running(&mut self) -> bool {
        self.reap();
        self.run.is_some()
    }

    /// Cancel the running program, if any, and wait for the strip to be released.
    pub fn stop(&mut self) -> Option<RunOutcome> {
        let run = self.run.take()?;
        drop(run.cancel);
        self.join(run.handle)
    }

    fn reap(&mut self) {
        if let Some(run) = self.run.take() {
            if run.handle.is_finished() {
                self.join(run.handle);
            } else {
                self.run = Some(run);
            }
        }
    }

    fn join(&mut self, handle: JoinHandle<(L, RunOutcome)>) -> Option<RunOutcome> {
        match handle.join() {
            Ok((strip, outcome)) => {
                debug!("led program finished: {outcome:?}");
                self.strip = Some(strip);
                Some(outcome)
            }
            Err(_) => {
                error!("led driver thread panicked; strip lost");
                None
            }
        }
    }
}

impl<L: LedStrip> Drop for LedDriver<L> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn play<L: LedStrip>(strip: &mut L, steps: &[ProgramStep], ctx: &RunContext) -> RunOutcome {
    let mut session = match StripSession::open(strip) {
        Ok(session) => session,
        Err(err) => {
            let fault = open_fault(&err);
            error!("{fault}");
            let _ = ctx.faults.send(fault);
            return RunOutcome::Faulted;
        }
    };

    let mut current: Option<ColorCommand> = None;
    for (step, program_step) in steps.iter().enumerate() {
        if ctx.cancelled() {
            break;
        }
        let requested = Instant::now();
        if let Some(command) = current.take() {
            ctx.end(command, requested);
        }
        if let Err(reason) = session.show(&frame_of(program_step.color), &ctx.config) {
            error!("led program aborted at step {step}: {reason}");
            let _ = ctx.faults.send(Fault::LedHardwareFault(reason));
            return RunOutcome::Faulted;
        }
        let command = ColorCommand {
            step,
            color: program_step.color,
            start: Instant::now(),
            end: None,
        };
        debug!(
            "step {step} {} acknowledged after {:?}",
            command.color,
            command.start - requested
        );
        ctx.begin(command);
        current = Some(command);
        if ctx.hold_until(command.start + program_step.duration()) {
            break;
        }
    }

    let finished = Instant::now();
    if let Some(command) = current.take() {
        ctx.end(command, finished);
    }
    drop(session);

    if ctx.cancelled() {
        info!("led program cancelled");
        RunOutcome::Cancelled
    } else {
        ctx.emit(DriverEvent::Completed { at: finished });
        RunOutcome::Completed
    }
}

fn open_fault<E: HardwareError>(err: &E) -> Fault {
    match err.kind() {
        HardwareErrorKind::PermissionDenied => Fault::PermissionDenied(format!("led strip: {err}")),
        _ => Fault::LedHardwareFault(format!("cannot open led strip: {err}")),
    }
}

fn frame_of(color: PaletteColor) -> [Rgb; REGION_COUNT] {
    [color.drive_rgb(); REGION_COUNT]
}

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Duration of a program, ignoring hardware latency.
pub fn program_duration(steps: &[ProgramStep]) -> Duration {
    steps.iter().map(ProgramStep::duration).sum()
}

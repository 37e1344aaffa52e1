//! Wires the pipeline stages together and runs one test cycle per trigger.
//!
//! The orchestrating thread owns the session, the annotator and the
//! classifier. Capture and the LED program run on their own threads and are
//! only reached through channels.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::annotator::FrameAnnotator;
use crate::artifacts::ArtifactWriter;
use crate::classifier::RegionClassifier;
use crate::config::{Calibration, ProgramStep, RigConfig};
use crate::error::{Fault, HardwareError};
use crate::frame_source::{FrameSource, SourceStatus};
use crate::led_driver::{DriverEvent, LedDriver, program_duration};
use crate::model::{AnnotatedFrame, Frame};
use crate::session::{SessionStatus, TestSession, Verdict};
use crate::status::RigStatus;
use crate::{Camera, LedStrip, ResultSink, TriggerButton};

/// Longest the cycle loop sleeps without checking the deadline.
const DEADLINE_TICK: Duration = Duration::from_millis(50);
const FAULT_CAPACITY: usize = 16;

/// Operator requests delivered to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Button press: start a cycle when idle.
    Trigger,
    /// Stop the cycle in flight as `Failed(Aborted)`.
    Abort,
    /// Release all hardware and exit.
    Shutdown,
}

/// How a call to [`Orchestrator::run_cycle`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// `None` when no cycle could start.
    pub verdict: Option<Verdict>,
    /// A shutdown request arrived during the cycle.
    pub shutdown: bool,
}

enum Step {
    Continue,
    Evaluate,
    Stopped { shutdown: bool },
}

pub struct Orchestrator<C: Camera, L: LedStrip, S: ResultSink> {
    program: Vec<ProgramStep>,
    frames: FrameSource<C>,
    leds: LedDriver<L>,
    annotator: FrameAnnotator,
    classifier: RegionClassifier,
    session: TestSession,
    artifacts: ArtifactWriter,
    sink: S,
    faults: Receiver<Fault>,
    startup_fault: Option<Fault>,
}

impl<C: Camera, L: LedStrip, S: ResultSink> Orchestrator<C, L, S> {
    pub fn new(
        config: &RigConfig,
        calibration: Arc<Calibration>,
        camera: C,
        strip: L,
        sink: S,
    ) -> Self {
        let (fault_tx, fault_rx) = channel::bounded(FAULT_CAPACITY);
        Self {
            program: config.program.expanded(),
            frames: FrameSource::new(camera, config.camera.clone(), fault_tx.clone()),
            leds: LedDriver::new(strip, config.leds.clone(), fault_tx),
            annotator: FrameAnnotator::new(&config.annotator),
            classifier: RegionClassifier::new(calibration, &config.classifier),
            session: TestSession::new(
                config.session.clone(),
                config.program.max_test_duration(),
            ),
            artifacts: ArtifactWriter::new(config.artifacts.clone()),
            sink,
            faults: fault_rx,
            startup_fault: None,
        }
    }

    pub fn session(&self) -> &TestSession {
        &self.session
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The fault blocking every cycle, if startup found one.
    pub fn startup_fault(&self) -> Option<&Fault> {
        self.startup_fault.as_ref()
    }

    /// Check the hardware once and show the operator whether the rig is ready.
    pub fn startup(&mut self) -> Result<(), Fault> {
        info!(
            "program: {} steps, {:.1}s",
            self.program.len(),
            program_duration(&self.program).as_secs_f32()
        );
        if let Err(fault) = self.leds.probe() {
            error!("startup check failed: {fault}");
            self.report_fault(&fault);
            self.startup_fault = Some(fault.clone());
            return Err(fault);
        }
        self.show_status(RigStatus::Ready);
        Ok(())
    }

    /// Serve triggers until shutdown or the control channel closes.
    pub fn run(&mut self, controls: &Receiver<Control>) {
        loop {
            match controls.recv() {
                Ok(Control::Trigger) => {
                    if self.run_cycle(controls).shutdown {
                        break;
                    }
                }
                Ok(Control::Abort) => debug!("abort ignored, no test in progress"),
                Ok(Control::Shutdown) | Err(_) => break,
            }
        }
        self.shutdown();
    }

    /// Run one full test cycle, reacting to `controls` while it runs.
    pub fn run_cycle(&mut self, controls: &Receiver<Control>) -> CycleReport {
        if let Some(fault) = &self.startup_fault {
            warn!("trigger ignored until restart: {fault}");
            return CycleReport {
                verdict: None,
                shutdown: false,
            };
        }
        let now = Instant::now();
        let test_id = match self.session.arm(now) {
            Ok(id) => id,
            Err(err) => {
                warn!("trigger ignored: {err}");
                return CycleReport {
                    verdict: None,
                    shutdown: false,
                };
            }
        };
        for stale in self.faults.try_iter() {
            debug!("discarding fault from an earlier cycle: {stale}");
        }
        self.annotator.reset();
        if let Err(err) = self.artifacts.begin(test_id) {
            warn!("artifacts disabled for test #{test_id}: {err}");
        }
        self.show_status(RigStatus::Running);

        let mut shutdown = false;
        if let Some(fault) = self.start_hardware() {
            self.stop_hardware();
            self.fail(&fault);
        } else {
            match self.collect(controls) {
                Step::Evaluate => {
                    self.stop_hardware();
                    if let Err(err) = self.session.evaluate() {
                        error!("evaluation failed: {err}");
                    }
                }
                Step::Stopped { shutdown: requested } => shutdown = requested,
                Step::Continue => {}
            }
        }

        let verdict = self.session.verdict().cloned();
        if let Some(verdict) = &verdict {
            self.report_verdict(verdict);
        }
        if let Err(err) = self.artifacts.finish() {
            warn!("could not write animations: {err}");
        }
        if self.session.status().is_terminal()
            && let Err(err) = self.session.reset()
        {
            error!("session reset failed: {err}");
        }
        CycleReport { verdict, shutdown }
    }

    /// Release every device and turn the indicator off.
    pub fn shutdown(&mut self) {
        self.stop_hardware();
        if self.session.status().in_progress()
            && let Some(verdict) = self.session.cancel(Instant::now()).cloned()
        {
            self.report_verdict(&verdict);
        }
        self.show_status(RigStatus::Off);
        info!("rig shut down");
    }

    fn start_hardware(&mut self) -> Option<Fault> {
        let started = if self.frames.status() == SourceStatus::Faulted {
            self.frames.restart()
        } else {
            self.frames.start()
        };
        if let Err(err) = started {
            return Some(Fault::CameraUnreachable(err.to_string()));
        }
        if let Err(err) = self.leds.run_program(&self.program) {
            return Some(Fault::LedHardwareFault(err.to_string()));
        }
        None
    }

    /// LED driver and frame source first, so hardware is free before the session moves on.
    fn stop_hardware(&mut self) {
        self.leds.stop();
        if let Err(err) = self.frames.stop() {
            error!("frame source stop failed: {err}");
        }
    }

    /// Feed frames and commands into the session until the cycle ends.
    fn collect(&mut self, controls: &Receiver<Control>) -> Step {
        let frames = self.frames.frames().clone();
        let events = self.leds.events().clone();
        let faults = self.faults.clone();
        loop {
            let tick = self
                .session
                .deadline()
                .map_or(DEADLINE_TICK, |d| {
                    d.saturating_duration_since(Instant::now()).min(DEADLINE_TICK)
                });
            let step = crossbeam::select! {
                recv(frames) -> frame => match frame {
                    Ok(frame) => self.on_frame(frame),
                    Err(_) => Step::Continue,
                },
                recv(events) -> event => match event {
                    Ok(event) => self.on_driver_event(event),
                    Err(_) => Step::Continue,
                },
                recv(faults) -> fault => match fault {
                    Ok(fault) => {
                        self.stop_hardware();
                        self.fail(&fault);
                        Step::Stopped { shutdown: false }
                    }
                    Err(_) => Step::Continue,
                },
                recv(controls) -> control => self.on_control(control.ok()),
                default(tick) => Step::Continue,
            };
            match step {
                Step::Continue => {}
                done => return done,
            }
            // A stalled capture surfaces on the fault channel next iteration.
            self.frames.watchdog();
            if self.session.check_deadline(Instant::now()) {
                return Step::Evaluate;
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Step {
        self.annotator.push_frame(frame);
        self.tally_ready();
        Step::Continue
    }

    fn on_driver_event(&mut self, event: DriverEvent) -> Step {
        match event {
            DriverEvent::Started(command) => {
                if let Err(err) = self.session.command_started(&command) {
                    warn!("step {} not recorded: {err}", command.step);
                }
                self.annotator.command_started(command);
            }
            DriverEvent::Ended(command) => self.annotator.command_ended(command),
            DriverEvent::Completed { at } => {
                // Frames captured before the program ended may still be queued.
                let queued: Vec<Frame> = self.frames.frames().try_iter().collect();
                for frame in queued.into_iter().filter(|f| f.captured_at < at) {
                    self.annotator.push_frame(frame);
                }
                self.annotator.program_completed();
                self.tally_ready();
                let stats = self.annotator.stats();
                debug!("annotator: {stats:?}");
                if let Err(err) = self.session.program_completed(at) {
                    warn!("program completion ignored: {err}");
                    return Step::Continue;
                }
                return Step::Evaluate;
            }
        }
        self.tally_ready();
        Step::Continue
    }

    fn on_control(&mut self, control: Option<Control>) -> Step {
        match control {
            Some(Control::Trigger) => {
                info!(
                    "trigger ignored, test #{} is {}",
                    self.session.test_id().unwrap_or_default(),
                    self.session.status().name()
                );
                Step::Continue
            }
            Some(Control::Abort) => {
                self.stop_hardware();
                self.session.abort(Instant::now());
                Step::Stopped { shutdown: false }
            }
            Some(Control::Shutdown) | None => {
                info!("shutdown requested mid-test");
                self.stop_hardware();
                self.session.cancel(Instant::now());
                Step::Stopped { shutdown: true }
            }
        }
    }

    fn tally_ready(&mut self) {
        let ready: Vec<AnnotatedFrame> = self.annotator.drain().collect();
        for annotated in ready {
            if self.session.status() != SessionStatus::Running {
                break;
            }
            if let Err(err) = self.artifacts.store(&annotated) {
                warn!("could not store frame {}: {err}", annotated.frame.seq);
            }
            for observation in self.classifier.classify(&annotated) {
                if let Err(err) = self.session.record(&annotated.command, &observation) {
                    debug!("observation dropped: {err}");
                }
            }
        }
    }

    fn fail(&mut self, fault: &Fault) {
        self.report_fault(fault);
        self.session.fault(fault, Instant::now());
    }

    fn show_status(&mut self, status: RigStatus) {
        if let Err(err) = self.sink.show_status(status) {
            warn!("status update failed: {err}");
        }
    }

    fn report_fault(&mut self, fault: &Fault) {
        if let Err(err) = self.sink.report_fault(fault) {
            warn!("fault report failed: {err}");
        }
    }

    fn report_verdict(&mut self, verdict: &Verdict) {
        if let Err(err) = self.sink.report_verdict(verdict) {
            warn!("verdict report failed: {err}");
        }
    }
}

/// Turns a level-sampled button into one [`Control::Trigger`] per press.
#[derive(Debug, Default, Clone, Copy)]
pub struct EdgeDetector {
    pressed: bool,
}

impl EdgeDetector {
    /// Feed one sample; `true` on a released-to-pressed edge.
    pub fn update(&mut self, pressed: bool) -> bool {
        let rising = pressed && !self.pressed;
        self.pressed = pressed;
        rising
    }
}

/// Thread sampling a [`TriggerButton`].
#[derive(Debug)]
pub struct ButtonPoller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ButtonPoller {
    pub fn spawn<B: TriggerButton>(
        mut button: B,
        controls: Sender<Control>,
        period: Duration,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("button".into())
            .spawn(move || {
                let mut edges = EdgeDetector::default();
                let mut failing = false;
                while !flag.load(Ordering::Acquire) {
                    match button.is_pressed() {
                        Ok(pressed) => {
                            failing = false;
                            if edges.update(pressed) && controls.send(Control::Trigger).is_err() {
                                break;
                            }
                        }
                        Err(err) if !failing => {
                            warn!("button read failed ({:?}): {err}", err.kind());
                            failing = true;
                        }
                        Err(_) => {}
                    }
                    thread::sleep(period);
                }
                debug!("button poller stopped");
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("button thread panicked");
        }
    }
}

impl Drop for ButtonPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Defect, SimButton, SimCamera, SimLedStrip, SimRig};
    use crate::model::RegionId;
    use crate::palette::PaletteColor;
    use crate::session::FailureReason;
    use crate::sink::RecordingSink;

    type TestRig = Orchestrator<SimCamera, SimLedStrip, RecordingSink>;

    fn fast_config() -> RigConfig {
        let mut config = RigConfig::sample();
        config.camera.width = 120;
        config.camera.height = 68;
        config.camera.frame_rate = 60.0;
        config.calibration = Calibration::grid(120, 68, 8);
        for step in &mut config.program.steps {
            step.duration_ms = 250;
        }
        config.program.max_test_duration_ms = 5_000;
        config
    }

    fn rig(config: &RigConfig) -> (TestRig, SimRig, RecordingSink) {
        let calibration = Arc::new(config.calibration.clone());
        let sim = SimRig::new(Arc::clone(&calibration), 11);
        let sink = RecordingSink::new();
        let orchestrator = Orchestrator::new(
            config,
            calibration,
            sim.camera.clone(),
            sim.strip.clone(),
            sink.clone(),
        );
        (orchestrator, sim, sink)
    }

    #[test]
    fn test_good_board_passes() {
        let (mut rig, sim, sink) = rig(&fast_config());
        rig.startup().unwrap();
        let (_tx, rx) = channel::unbounded();

        let report = rig.run_cycle(&rx);

        let verdict = report.verdict.unwrap();
        assert!(verdict.passed(), "{verdict}");
        assert_eq!(rig.session().status(), SessionStatus::Idle);
        assert!(!sim.camera.is_open());
        assert!(!sim.strip.is_open());
        assert_eq!(
            sink.snapshot().statuses,
            vec![RigStatus::Ready, RigStatus::Running, RigStatus::Passed]
        );
    }

    #[test]
    fn test_stuck_led_fails() {
        let (mut rig, sim, _) = rig(&fast_config());
        sim.board
            .inject(RegionId::new(4).unwrap(), Defect::Stuck(PaletteColor::Orange));
        rig.startup().unwrap();
        let (_tx, rx) = channel::unbounded();

        let verdict = rig.run_cycle(&rx).verdict.unwrap();

        assert_eq!(verdict.reason(), Some(FailureReason::Mismatch));
        assert_eq!(verdict.mismatched_regions(), vec![RegionId::new(4).unwrap()]);
    }

    #[test]
    fn test_permission_denied_blocks_cycles() {
        let (mut rig, sim, sink) = rig(&fast_config());
        sim.strip.deny_permission(true);

        assert!(matches!(rig.startup(), Err(Fault::PermissionDenied(_))));
        let (_tx, rx) = channel::unbounded();
        let report = rig.run_cycle(&rx);

        assert_eq!(report.verdict, None);
        assert_eq!(sink.last_status(), Some(RigStatus::PermissionDenied));
        assert_eq!(rig.session().status(), SessionStatus::Idle);
    }

    #[test]
    fn test_repeated_triggers_during_startup_fault_report_once() {
        let (mut rig, sim, sink) = rig(&fast_config());
        sim.strip.deny_permission(true);
        assert!(rig.startup().is_err());
        let (_tx, rx) = channel::unbounded();

        for _ in 0..3 {
            assert_eq!(rig.run_cycle(&rx).verdict, None);
        }

        assert_eq!(sink.faults().len(), 1);
        assert_eq!(sink.last_status(), Some(RigStatus::PermissionDenied));
    }

    #[test]
    fn test_blocked_camera_fails_cycle_as_unreachable() {
        let mut config = fast_config();
        config.camera.stall_grace_ms = 150;
        let (mut rig, sim, sink) = rig(&config);
        rig.startup().unwrap();
        sim.camera.set_latency(Duration::from_millis(1_500));
        let (_tx, rx) = channel::unbounded();
        let started = Instant::now();

        let verdict = rig.run_cycle(&rx).verdict.unwrap();

        assert_eq!(verdict.reason(), Some(FailureReason::CameraUnreachable));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!sim.strip.is_open());
        assert_eq!(sink.faults().len(), 1);
        assert_eq!(sink.last_status(), Some(RigStatus::CameraUnreachable));
    }

    #[test]
    fn test_camera_fault_fails_cycle_and_recovers() {
        let (mut rig, sim, sink) = rig(&fast_config());
        rig.startup().unwrap();
        let (_tx, rx) = channel::unbounded();

        sim.camera.fail_open(true);
        let verdict = rig.run_cycle(&rx).verdict.unwrap();
        assert_eq!(verdict.reason(), Some(FailureReason::CameraUnreachable));
        assert!(!sim.strip.is_open());
        assert_eq!(sink.faults().len(), 1);
        assert_eq!(sink.last_status(), Some(RigStatus::CameraUnreachable));

        sim.camera.fail_open(false);
        let verdict = rig.run_cycle(&rx).verdict.unwrap();
        assert!(verdict.passed(), "{verdict}");
        assert_eq!(verdict.test_id, 2);
    }

    #[test]
    fn test_shutdown_mid_cycle_cancels() {
        let (mut rig, sim, sink) = rig(&fast_config());
        rig.startup().unwrap();
        let (tx, rx) = channel::unbounded();
        tx.send(Control::Trigger).unwrap();
        tx.send(Control::Shutdown).unwrap();

        rig.run(&rx);

        let verdicts = sink.verdicts();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].reason(), Some(FailureReason::Cancelled));
        assert!(!sim.camera.is_open());
        assert!(!sim.strip.is_open());
        assert_eq!(sink.last_status(), Some(RigStatus::Off));
    }

    #[test]
    fn test_abort_mid_cycle() {
        let (mut rig, _, _) = rig(&fast_config());
        rig.startup().unwrap();
        let (tx, rx) = channel::unbounded();
        tx.send(Control::Trigger).unwrap();
        tx.send(Control::Abort).unwrap();

        let report = rig.run_cycle(&rx);

        assert!(!report.shutdown);
        assert_eq!(
            report.verdict.unwrap().reason(),
            Some(FailureReason::Aborted)
        );
    }

    #[test]
    fn test_hung_strip_times_out() {
        let mut config = fast_config();
        config.program.max_test_duration_ms = 400;
        let (mut rig, sim, _) = rig(&config);
        rig.startup().unwrap();
        sim.strip.set_latency(Duration::from_millis(300));
        let (_tx, rx) = channel::unbounded();

        let verdict = rig.run_cycle(&rx).verdict.unwrap();

        assert_eq!(verdict.reason(), Some(FailureReason::TestTimeout));
        assert_eq!(verdict.regions.len(), 9);
    }

    #[test]
    fn test_edge_detector_fires_once_per_press() {
        let mut edges = EdgeDetector::default();
        let samples = [false, true, true, true, false, true, false];
        let fired: Vec<bool> = samples.iter().map(|&s| edges.update(s)).collect();
        assert_eq!(fired, vec![false, true, false, false, false, true, false]);
    }

    #[test]
    fn test_button_poller_sends_trigger() {
        let button = SimButton::new();
        let (tx, rx) = channel::unbounded();
        let mut poller = ButtonPoller::spawn(button.clone(), tx, Duration::from_millis(1)).unwrap();

        button.press();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(Control::Trigger));
        thread::sleep(Duration::from_millis(20));
        assert!(rx.try_recv().is_err(), "holding the button must not repeat");

        poller.stop();
    }
}

//! Paced camera capture on a dedicated thread.
//!
//! Frames are published into a bounded channel. When the consumer falls
//! behind, the oldest unconsumed frame is dropped so capture never blocks.
//! A capture that hangs is caught by [`FrameSource::watchdog`] on the
//! consumer side, since the capture thread cannot notice its own stall.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};

use crate::Camera;
use crate::config::CameraConfig;
use crate::error::{Fault, HardwareError, HardwareErrorKind, RigError};
use crate::model::Frame;

/// Externally visible lifecycle of a [`FrameSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Stopped,
    Running,
    /// The camera failed; only [`FrameSource::restart`] leaves this state.
    Faulted,
}

enum SourceState<C> {
    Stopped(C),
    Running(Worker<C>),
    Faulted(C),
    /// Asked to stop while a capture is still blocked in the camera.
    Stopping(Worker<C>),
    /// The capture thread panicked and took the camera with it.
    Lost,
}

struct Worker<C> {
    stop: Arc<AtomicBool>,
    /// Set by whichever side reports the fault first.
    reported: Arc<AtomicBool>,
    handle: JoinHandle<(C, CaptureOutcome)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureOutcome {
    Stopped,
    Faulted,
}

/// Closes the camera when dropped, whichever way the capture loop exits.
struct CameraSession<'a, C: Camera> {
    camera: &'a mut C,
}

impl<'a, C: Camera> CameraSession<'a, C> {
    fn open(camera: &'a mut C) -> Result<Self, C::Error> {
        camera.open()?;
        info!("camera opened");
        Ok(Self { camera })
    }
}

impl<C: Camera> Drop for CameraSession<'_, C> {
    fn drop(&mut self) {
        self.camera.close();
        info!("camera released");
    }
}

/// Owns the camera and the capture thread that feeds the frame channel.
pub struct FrameSource<C: Camera> {
    config: CameraConfig,
    faults: Sender<Fault>,
    next_seq: Arc<AtomicU64>,
    epoch: Instant,
    /// Milliseconds since `epoch` at which the last frame was published.
    last_frame_ms: Arc<AtomicU64>,
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    state: SourceState<C>,
}

impl<C: Camera> FrameSource<C> {
    pub fn new(camera: C, config: CameraConfig, faults: Sender<Fault>) -> Self {
        let (tx, rx) = channel::bounded(config.channel_capacity.max(1));
        Self {
            config,
            faults,
            next_seq: Arc::new(AtomicU64::new(0)),
            epoch: Instant::now(),
            last_frame_ms: Arc::new(AtomicU64::new(0)),
            tx,
            rx,
            state: SourceState::Stopped(camera),
        }
    }

    /// Begin continuous capture. Stale frames from a previous run are discarded.
    ///
    /// Failing to open the camera is reported on the fault channel by the
    /// capture thread, after which the source is [`SourceStatus::Faulted`].
    pub fn start(&mut self) -> Result<(), RigError> {
        self.reap();
        let camera = match self.take_state() {
            SourceState::Stopped(camera) => camera,
            SourceState::Faulted(camera) => {
                self.state = SourceState::Faulted(camera);
                return Err(RigError::CameraUnreachable(
                    "frame source is faulted; restart required".into(),
                ));
            }
            running @ SourceState::Running(_) => {
                self.state = running;
                return Err(RigError::InvalidTransition {
                    action: "start capture",
                    state: "running",
                });
            }
            SourceState::Stopping(worker) => {
                self.state = SourceState::Stopping(worker);
                return Err(RigError::CameraUnreachable(
                    "camera is still blocked in a stalled capture".into(),
                ));
            }
            SourceState::Lost => {
                return Err(RigError::CameraUnreachable(
                    "camera handle lost after a capture thread panic".into(),
                ));
            }
        };

        self.flush();
        let stop = Arc::new(AtomicBool::new(false));
        let reported = Arc::new(AtomicBool::new(false));
        self.last_frame_ms
            .store(millis_since(self.epoch), Ordering::Release);
        let ctx = CaptureContext {
            period: self.config.frame_period(),
            grace: self.config.stall_grace(),
            stop: Arc::clone(&stop),
            reported: Arc::clone(&reported),
            epoch: self.epoch,
            last_frame_ms: Arc::clone(&self.last_frame_ms),
            next_seq: Arc::clone(&self.next_seq),
            tx: self.tx.clone(),
            drop_rx: self.rx.clone(),
            faults: self.faults.clone(),
        };
        let spawned = thread::Builder::new()
            .name("frame-source".into())
            .spawn(move || capture_loop(camera, ctx));
        match spawned {
            Ok(handle) => {
                self.state = SourceState::Running(Worker {
                    stop,
                    reported,
                    handle,
                });
                Ok(())
            }
            Err(err) => Err(RigError::CameraUnreachable(format!(
                "failed to spawn capture thread: {err}"
            ))),
        }
    }

    /// Stop capture and wait for the camera to be released.
    ///
    /// Waits at most one stall grace period. A capture still blocked after
    /// that leaves the source [`SourceStatus::Faulted`]; the camera is
    /// closed as soon as the capture returns.
    pub fn stop(&mut self) -> Result<(), RigError> {
        self.state = match self.take_state() {
            SourceState::Running(worker) => {
                worker.stop.store(true, Ordering::Release);
                if wait_finished(&worker, self.config.stall_grace()) {
                    join_worker(worker)?
                } else {
                    warn!("capture still blocked, camera will be released when it returns");
                    worker.reported.store(true, Ordering::Release);
                    SourceState::Stopping(worker)
                }
            }
            other => other,
        };
        Ok(())
    }

    /// Raise `CameraUnreachable` if no frame was published within the stall grace.
    ///
    /// Call periodically while capturing. Returns whether a stall was reported.
    pub fn watchdog(&self) -> bool {
        let SourceState::Running(worker) = &self.state else {
            return false;
        };
        let silent = millis_since(self.epoch)
            .saturating_sub(self.last_frame_ms.load(Ordering::Acquire));
        if Duration::from_millis(silent) < self.config.stall_grace()
            || worker.reported.swap(true, Ordering::AcqRel)
        {
            return false;
        }
        error!("camera unreachable: no frame for {silent} ms");
        worker.stop.store(true, Ordering::Release);
        let _ = self.faults.send(Fault::CameraUnreachable(format!(
            "capture stalled, no frame for {silent} ms"
        )));
        true
    }

    /// Leave the faulted state and start capturing again.
    pub fn restart(&mut self) -> Result<(), RigError> {
        self.reap();
        self.state = match self.take_state() {
            SourceState::Faulted(camera) => {
                info!("restarting frame source after fault");
                SourceState::Stopped(camera)
            }
            other => other,
        };
        self.start()
    }

    pub fn status(&mut self) -> SourceStatus {
        self.reap();
        match self.state {
            SourceState::Stopped(_) => SourceStatus::Stopped,
            SourceState::Running(_) => SourceStatus::Running,
            SourceState::Faulted(_) | SourceState::Stopping(_) | SourceState::Lost => {
                SourceStatus::Faulted
            }
        }
    }

    /// Receiving end of the frame channel, for use in `select!`.
    #[inline]
    pub fn frames(&self) -> &Receiver<Frame> {
        &self.rx
    }

    /// Block for the next frame, up to `timeout`.
    pub fn next(&self, timeout: Duration) -> Option<Frame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Discard every frame waiting in the channel.
    pub fn flush(&self) -> usize {
        self.rx.try_iter().count()
    }

    /// Join a capture thread that exited on its own (after a fault).
    fn reap(&mut self) {
        let finished = matches!(
            &self.state,
            SourceState::Running(w) | SourceState::Stopping(w) if w.handle.is_finished()
        );
        if finished
            && let SourceState::Running(worker) | SourceState::Stopping(worker) = self.take_state()
        {
            self.state = join_worker(worker).unwrap_or(SourceState::Lost);
        }
    }

    fn take_state(&mut self) -> SourceState<C> {
        std::mem::replace(&mut self.state, SourceState::Lost)
    }
}

impl<C: Camera> Drop for FrameSource<C> {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!("frame source did not shut down cleanly: {err}");
        }
    }
}

fn millis_since(epoch: Instant) -> u64 {
    u64::try_from(epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Poll until the capture thread exits or `limit` passes.
fn wait_finished<C>(worker: &Worker<C>, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while !worker.handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
    true
}

fn join_worker<C>(worker: Worker<C>) -> Result<SourceState<C>, RigError> {
    match worker.handle.join() {
        Ok((camera, CaptureOutcome::Stopped)) => Ok(SourceState::Stopped(camera)),
        Ok((camera, CaptureOutcome::Faulted)) => Ok(SourceState::Faulted(camera)),
        Err(_) => Err(RigError::CameraUnreachable(
            "capture thread panicked".into(),
        )),
    }
}

struct CaptureContext {
    period: Duration,
    grace: Duration,
    stop: Arc<AtomicBool>,
    reported: Arc<AtomicBool>,
    epoch: Instant,
    last_frame_ms: Arc<AtomicU64>,
    next_seq: Arc<AtomicU64>,
    tx: Sender<Frame>,
    drop_rx: Receiver<Frame>,
    faults: Sender<Fault>,
}

impl CaptureContext {
    fn fault(&self, message: String) -> CaptureOutcome {
        self.report(Fault::CameraUnreachable(message))
    }

    /// Send `fault` unless the watchdog already reported this run.
    fn report(&self, fault: Fault) -> CaptureOutcome {
        if !self.reported.swap(true, Ordering::AcqRel) {
            error!("{fault}");
            let _ = self.faults.send(fault);
        }
        CaptureOutcome::Faulted
    }

    /// Push a frame, evicting the oldest queued frame while the channel is full.
    fn publish(&self, mut frame: Frame) {
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if let Ok(oldest) = self.drop_rx.try_recv() {
                        debug!("frame channel full, dropped frame {}", oldest.seq);
                    }
                    frame = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

fn capture_loop<C: Camera>(mut camera: C, ctx: CaptureContext) -> (C, CaptureOutcome) {
    let outcome = match CameraSession::open(&mut camera) {
        Ok(mut session) => run_capture(&mut session, &ctx),
        Err(err) if err.kind() == HardwareErrorKind::PermissionDenied => {
            ctx.report(Fault::PermissionDenied(format!("camera: {err}")))
        }
        Err(err) => ctx.fault(format!("failed to open camera: {err}")),
    };
    info!("stopped collecting frames");
    (camera, outcome)
}

fn run_capture<C: Camera>(session: &mut CameraSession<'_, C>, ctx: &CaptureContext) -> CaptureOutcome {
    let mut last_good = Instant::now();
    let mut next_tick = Instant::now();

    while !ctx.stop.load(Ordering::Acquire) {
        let requested = Instant::now();
        match session.camera.capture() {
            Ok(image) => {
                let returned = Instant::now();
                if ctx.stop.load(Ordering::Acquire) {
                    break;
                }
                let silent = returned - last_good;
                if silent >= ctx.grace {
                    return ctx.fault(format!("frame took {} ms", silent.as_millis()));
                }
                last_good = returned;
                let frame = Frame {
                    seq: ctx.next_seq.fetch_add(1, Ordering::Relaxed),
                    captured_at: requested + (returned - requested) / 2,
                    image,
                };
                ctx.publish(frame);
                ctx.last_frame_ms
                    .store(millis_since(ctx.epoch), Ordering::Release);
            }
            Err(err) if err.kind() == HardwareErrorKind::Transient => {
                if last_good.elapsed() >= ctx.grace {
                    return ctx.fault(format!(
                        "no frame for {} ms: {err}",
                        last_good.elapsed().as_millis()
                    ));
                }
                warn!("capture failed, retrying: {err}");
            }
            Err(err) => return ctx.fault(err.to_string()),
        }

        next_tick += ctx.period;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }
    if ctx.reported.load(Ordering::Acquire) {
        CaptureOutcome::Faulted
    } else {
        CaptureOutcome::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{SimBoard, SimCamera};
    use crate::config::Calibration;

    fn fast_config() -> CameraConfig {
        CameraConfig {
            frame_rate: 200.0,
            width: 120,
            height: 68,
            stall_grace_ms: 50,
            channel_capacity: 4,
        }
    }

    fn source() -> (FrameSource<SimCamera>, SimCamera, Receiver<Fault>) {
        let board = SimBoard::new();
        let camera = SimCamera::new(board, Arc::new(Calibration::grid(120, 68, 8)), 1);
        let probe = camera.clone();
        let (fault_tx, fault_rx) = channel::unbounded();
        (FrameSource::new(camera, fast_config(), fault_tx), probe, fault_rx)
    }

    fn wait_for(source: &mut FrameSource<SimCamera>, want: SourceStatus) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if source.status() == want {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_sequence_ids_strictly_increase_across_restarts() {
        let (mut source, _probe, _faults) = source();
        let mut last = None;

        for _ in 0..2 {
            source.start().expect("start");
            for _ in 0..10 {
                let frame = source.next(Duration::from_secs(1)).expect("frame");
                if let Some(prev) = last {
                    assert!(frame.seq > prev, "{} must follow {}", frame.seq, prev);
                }
                last = Some(frame.seq);
            }
            source.stop().expect("stop");
        }
    }

    #[test]
    fn test_stop_releases_camera() {
        let (mut source, probe, _faults) = source();

        source.start().expect("start");
        source.next(Duration::from_secs(1)).expect("frame");
        assert!(probe.is_open());

        source.stop().expect("stop");

        assert!(!probe.is_open());
        assert_eq!(source.status(), SourceStatus::Stopped);
    }

    #[test]
    fn test_slow_consumer_drops_oldest_frames() {
        let (mut source, _probe, _faults) = source();

        source.start().expect("start");
        thread::sleep(Duration::from_millis(100));
        let first = source.next(Duration::from_secs(1)).expect("frame");
        source.stop().expect("stop");

        assert!(first.seq > 0, "oldest frames should have been evicted");
        let rest: Vec<u64> = source.frames().try_iter().map(|f| f.seq).collect();
        assert!(rest.len() <= 4);
        assert!(rest.iter().all(|&seq| seq > first.seq));
        assert!(rest.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_open_failure_faults_until_restart() {
        let (mut source, probe, faults) = source();
        probe.fail_open(true);

        source.start().expect("thread spawns");
        let fault = faults.recv_timeout(Duration::from_secs(1)).expect("fault");

        assert!(matches!(fault, Fault::CameraUnreachable(_)));
        assert!(wait_for(&mut source, SourceStatus::Faulted));
        assert!(matches!(source.start(), Err(RigError::CameraUnreachable(_))));

        probe.fail_open(false);
        source.restart().expect("restart");
        assert!(source.next(Duration::from_secs(1)).is_some());
        assert_eq!(source.status(), SourceStatus::Running);
    }

    #[test]
    fn test_stall_beyond_grace_faults() {
        let (mut source, probe, faults) = source();

        source.start().expect("start");
        source.next(Duration::from_secs(1)).expect("frame");
        probe.stall(true);

        let fault = faults.recv_timeout(Duration::from_secs(2)).expect("fault");

        assert!(matches!(fault, Fault::CameraUnreachable(_)));
        assert!(wait_for(&mut source, SourceStatus::Faulted));
        assert!(!probe.is_open(), "faulted source must release the camera");
    }

    #[test]
    fn test_frames_slower_than_grace_fault() {
        let (mut source, probe, faults) = source();
        probe.set_latency(Duration::from_millis(120));

        source.start().expect("start");
        let fault = faults.recv_timeout(Duration::from_secs(2)).expect("fault");

        assert!(matches!(fault, Fault::CameraUnreachable(_)));
        assert!(wait_for(&mut source, SourceStatus::Faulted));
        assert!(source.next(Duration::from_millis(10)).is_none());
        assert!(!probe.is_open());
    }

    #[test]
    fn test_watchdog_reports_blocked_capture() {
        let (mut source, probe, faults) = source();
        probe.set_latency(Duration::from_millis(800));
        source.start().expect("start");

        let deadline = Instant::now() + Duration::from_secs(1);
        while !source.watchdog() {
            assert!(Instant::now() < deadline, "blocked capture went unnoticed");
            thread::sleep(Duration::from_millis(5));
        }
        let fault = faults.recv_timeout(Duration::from_millis(100)).expect("fault");
        assert!(matches!(fault, Fault::CameraUnreachable(_)));
        assert!(!source.watchdog(), "a stall is reported once");

        let stopping = Instant::now();
        source.stop().expect("stop");
        assert!(stopping.elapsed() < Duration::from_millis(400));
        assert_eq!(source.status(), SourceStatus::Faulted);
        assert!(matches!(source.start(), Err(RigError::CameraUnreachable(_))));

        // The camera is let go once the blocked capture returns.
        assert!(wait_for(&mut source, SourceStatus::Faulted));
        let deadline = Instant::now() + Duration::from_secs(2);
        while probe.is_open() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!probe.is_open());
        assert!(faults.try_recv().is_err(), "no second fault for the same stall");
    }

    #[test]
    fn test_watchdog_quiet_while_frames_flow() {
        let (mut source, _probe, faults) = source();
        source.start().expect("start");

        for _ in 0..20 {
            source.next(Duration::from_secs(1)).expect("frame");
            assert!(!source.watchdog());
        }
        source.stop().expect("stop");
        assert!(faults.try_recv().is_err());
    }

    #[test]
    fn test_double_start_is_rejected() {
        let (mut source, _probe, _faults) = source();
        source.start().expect("start");

        assert!(matches!(
            source.start(),
            Err(RigError::InvalidTransition { .. })
        ));
        assert_eq!(source.status(), SourceStatus::Running);
    }
}

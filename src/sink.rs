//! [`ResultSink`] implementations.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{error, info};
use thiserror::Error;

use crate::ResultSink;
use crate::error::Fault;
use crate::session::Verdict;
use crate::status::{RigStatus, StatusPlayer};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("status light player has stopped")]
    PlayerStopped,
}

/// Drives the operator lamp through a [`StatusPlayer`] and logs every report.
#[derive(Debug)]
pub struct IndicatorSink {
    player: StatusPlayer,
}

impl IndicatorSink {
    pub fn new(player: StatusPlayer) -> Self {
        Self { player }
    }

    fn show(&self, status: RigStatus) -> Result<(), SinkError> {
        if self.player.show(status) {
            Ok(())
        } else {
            Err(SinkError::PlayerStopped)
        }
    }
}

impl ResultSink for IndicatorSink {
    type Error = SinkError;

    fn show_status(&mut self, status: RigStatus) -> Result<(), Self::Error> {
        self.show(status)
    }

    fn report_fault(&mut self, fault: &Fault) -> Result<(), Self::Error> {
        error!("fault: {fault}");
        self.show(RigStatus::for_fault(fault))
    }

    fn report_verdict(&mut self, verdict: &Verdict) -> Result<(), Self::Error> {
        info!("verdict: {verdict}");
        self.show(RigStatus::for_verdict(verdict))
    }
}

/// Everything a [`RecordingSink`] was told, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recorded {
    pub statuses: Vec<RigStatus>,
    pub faults: Vec<Fault>,
    pub verdicts: Vec<Verdict>,
}

/// Sink that keeps every report for later inspection. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    recorded: Arc<Mutex<Recorded>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Recorded {
        self.lock().clone()
    }

    pub fn last_status(&self) -> Option<RigStatus> {
        self.lock().statuses.last().copied()
    }

    pub fn verdicts(&self) -> Vec<Verdict> {
        self.lock().verdicts.clone()
    }

    pub fn faults(&self) -> Vec<Fault> {
        self.lock().faults.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResultSink for RecordingSink {
    type Error = std::convert::Infallible;

    fn show_status(&mut self, status: RigStatus) -> Result<(), Self::Error> {
        self.lock().statuses.push(status);
        Ok(())
    }

    fn report_fault(&mut self, fault: &Fault) -> Result<(), Self::Error> {
        let mut recorded = self.lock();
        recorded.faults.push(fault.clone());
        recorded.statuses.push(RigStatus::for_fault(fault));
        Ok(())
    }

    fn report_verdict(&mut self, verdict: &Verdict) -> Result<(), Self::Error> {
        let mut recorded = self.lock();
        recorded.verdicts.push(verdict.clone());
        recorded.statuses.push(RigStatus::for_verdict(verdict));
        Ok(())
    }
}

/// Error from either half of a [`Tee`].
#[derive(Debug)]
pub enum TeeError<A, B> {
    First(A),
    Second(B),
}

impl<A: fmt::Display, B: fmt::Display> fmt::Display for TeeError<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeeError::First(err) => err.fmt(f),
            TeeError::Second(err) => err.fmt(f),
        }
    }
}

/// Forwards every report to two sinks. The second is still told if the first fails.
#[derive(Debug)]
pub struct Tee<A, B>(pub A, pub B);

impl<A: ResultSink, B: ResultSink> Tee<A, B> {
    fn both(
        &mut self,
        first: impl FnOnce(&mut A) -> Result<(), A::Error>,
        second: impl FnOnce(&mut B) -> Result<(), B::Error>,
    ) -> Result<(), TeeError<A::Error, B::Error>> {
        let a = first(&mut self.0);
        let b = second(&mut self.1);
        a.map_err(TeeError::First)?;
        b.map_err(TeeError::Second)
    }
}

impl<A: ResultSink, B: ResultSink> ResultSink for Tee<A, B> {
    type Error = TeeError<A::Error, B::Error>;

    fn show_status(&mut self, status: RigStatus) -> Result<(), Self::Error> {
        self.both(|a| a.show_status(status), |b| b.show_status(status))
    }

    fn report_fault(&mut self, fault: &Fault) -> Result<(), Self::Error> {
        self.both(|a| a.report_fault(fault), |b| b.report_fault(fault))
    }

    fn report_verdict(&mut self, verdict: &Verdict) -> Result<(), Self::Error> {
        self.both(|a| a.report_verdict(verdict), |b| b.report_verdict(verdict))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::SimStatusLight;
    use crate::session::{FailureReason, Outcome};

    fn verdict(outcome: Outcome) -> Verdict {
        Verdict {
            test_id: 1,
            outcome,
            regions: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn test_recording_sink_maps_reports_to_statuses() {
        let probe = RecordingSink::new();
        let mut sink = probe.clone();

        sink.show_status(RigStatus::Ready).unwrap();
        sink.report_verdict(&verdict(Outcome::Passed)).unwrap();
        sink.report_fault(&Fault::CameraUnreachable("gone".into()))
            .unwrap();
        sink.report_verdict(&verdict(Outcome::Failed(FailureReason::Cancelled)))
            .unwrap();

        let recorded = probe.snapshot();
        assert_eq!(
            recorded.statuses,
            vec![
                RigStatus::Ready,
                RigStatus::Passed,
                RigStatus::CameraUnreachable,
                RigStatus::Failed
            ]
        );
        assert_eq!(recorded.verdicts.len(), 2);
        assert_eq!(recorded.faults.len(), 1);
    }

    #[test]
    fn test_indicator_sink_fails_after_player_stops() {
        let mut player = StatusPlayer::spawn(SimStatusLight::new(), Duration::from_millis(5))
            .unwrap();
        assert!(player.show(RigStatus::Ready));
        player.stop();

        let mut sink = IndicatorSink::new(player);
        assert!(matches!(
            sink.show_status(RigStatus::Running),
            Err(SinkError::PlayerStopped)
        ));
    }

    #[test]
    fn test_tee_reaches_both_sinks() {
        let left = RecordingSink::new();
        let right = RecordingSink::new();
        let mut tee = Tee(left.clone(), right.clone());

        tee.show_status(RigStatus::Running).unwrap();

        assert_eq!(left.last_status(), Some(RigStatus::Running));
        assert_eq!(right.last_status(), Some(RigStatus::Running));
    }
}

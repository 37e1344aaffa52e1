//! Per-cycle test state machine.
//!
//! `Idle -> Armed -> Running -> Evaluating -> {Passed, Failed} -> Idle`

mod tally;
mod verdict;

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Fault, RigError};
use crate::model::{ColorCommand, Observation, RegionId};
use crate::palette::PaletteColor;

pub use tally::{StepCounts, StepReading, Tally};
pub use verdict::{FailureReason, Outcome, RegionReport, RegionResult, StepMismatch, Verdict};

/// Externally visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Armed,
    Running,
    Evaluating,
    Passed,
    Failed,
}

impl SessionStatus {
    pub const fn name(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Armed => "armed",
            SessionStatus::Running => "running",
            SessionStatus::Evaluating => "evaluating",
            SessionStatus::Passed => "passed",
            SessionStatus::Failed => "failed",
        }
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Passed | SessionStatus::Failed)
    }

    /// Armed, Running or Evaluating.
    #[inline]
    pub fn in_progress(self) -> bool {
        matches!(
            self,
            SessionStatus::Armed | SessionStatus::Running | SessionStatus::Evaluating
        )
    }
}

/// Book-keeping for the cycle currently in flight.
#[derive(Debug)]
struct ActiveTest {
    id: u64,
    started: Instant,
    deadline: Instant,
    /// Commanded colour per program step, in the order the steps went active.
    commands: Vec<(usize, PaletteColor)>,
    tally: Tally,
}

impl ActiveTest {
    fn note_command(&mut self, command: &ColorCommand) {
        if !self.commands.iter().any(|&(step, _)| step == command.step) {
            self.commands.push((command.step, command.color));
        }
    }

    fn stopped(self, now: Instant, outcome: Outcome) -> Verdict {
        Verdict {
            test_id: self.id,
            outcome,
            regions: Vec::new(),
            elapsed: now.saturating_duration_since(self.started),
        }
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Armed(ActiveTest),
    Running(ActiveTest),
    Evaluating {
        test: ActiveTest,
        ended: Instant,
        timed_out: bool,
    },
    Passed(Verdict),
    Failed(Verdict),
}

impl State {
    fn status(&self) -> SessionStatus {
        match self {
            State::Idle => SessionStatus::Idle,
            State::Armed(_) => SessionStatus::Armed,
            State::Running(_) => SessionStatus::Running,
            State::Evaluating { .. } => SessionStatus::Evaluating,
            State::Passed(_) => SessionStatus::Passed,
            State::Failed(_) => SessionStatus::Failed,
        }
    }

    fn active(&self) -> Option<&ActiveTest> {
        match self {
            State::Armed(test) | State::Running(test) | State::Evaluating { test, .. } => {
                Some(test)
            }
            _ => None,
        }
    }
}

/// Accumulates observations for one cycle at a time and turns them into a verdict.
///
/// Built once; [`TestSession::reset`] makes it ready for the next unit.
#[derive(Debug)]
pub struct TestSession {
    config: SessionConfig,
    max_duration: Duration,
    next_id: u64,
    state: State,
}

impl TestSession {
    pub fn new(config: SessionConfig, max_duration: Duration) -> Self {
        Self {
            config,
            max_duration,
            next_id: 1,
            state: State::Idle,
        }
    }

    #[inline]
    pub fn status(&self) -> SessionStatus {
        self.state.status()
    }

    /// Id of the cycle in flight or the one that last finished.
    pub fn test_id(&self) -> Option<u64> {
        match &self.state {
            State::Idle => None,
            State::Passed(v) | State::Failed(v) => Some(v.test_id),
            other => other.active().map(|t| t.id),
        }
    }

    pub fn verdict(&self) -> Option<&Verdict> {
        match &self.state {
            State::Passed(v) | State::Failed(v) => Some(v),
            _ => None,
        }
    }

    /// Read-only view of the tally of the cycle in flight.
    pub fn tally(&self) -> Option<&Tally> {
        self.state.active().map(|t| &t.tally)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.state.active().map(|t| t.deadline)
    }

    /// Start a new cycle. Only valid from `Idle`.
    pub fn arm(&mut self, now: Instant) -> Result<u64, RigError> {
        if !matches!(self.state, State::Idle) {
            return Err(self.invalid("arm"));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.state = State::Armed(ActiveTest {
            id,
            started: now,
            deadline: now + self.max_duration,
            commands: Vec::new(),
            tally: Tally::new(),
        });
        info!("test #{id} armed");
        Ok(id)
    }

    /// A program step went active on the hardware.
    pub fn command_started(&mut self, command: &ColorCommand) -> Result<(), RigError> {
        self.state = match std::mem::replace(&mut self.state, State::Idle) {
            State::Armed(mut test) => {
                test.note_command(command);
                info!(
                    "test #{} running, step {} {}",
                    test.id, command.step, command.color
                );
                State::Running(test)
            }
            State::Running(mut test) => {
                test.note_command(command);
                debug!("test #{} step {} {}", test.id, command.step, command.color);
                State::Running(test)
            }
            other => {
                self.state = other;
                return Err(self.invalid("start a command"));
            }
        };
        Ok(())
    }

    /// Tally one observation taken while `command` was active.
    pub fn record(
        &mut self,
        command: &ColorCommand,
        observation: &Observation,
    ) -> Result<(), RigError> {
        match &mut self.state {
            State::Running(test) => {
                test.note_command(command);
                test.tally
                    .add(observation.region, command.step, observation.color);
                Ok(())
            }
            _ => Err(self.invalid("record")),
        }
    }

    /// The LED program finished; stop collecting.
    pub fn program_completed(&mut self, now: Instant) -> Result<(), RigError> {
        self.conclude(now, false, "complete the program")
    }

    /// Move to `Evaluating` if the cycle ran past its deadline. Returns whether it did.
    pub fn check_deadline(&mut self, now: Instant) -> bool {
        let expired = match &self.state {
            State::Armed(test) | State::Running(test) if now >= test.deadline => Some(test.id),
            _ => None,
        };
        let Some(id) = expired else {
            return false;
        };
        warn!("test #{id} hit its deadline");
        self.conclude(now, true, "time out").is_ok()
    }

    /// Compute the verdict. Only valid from `Evaluating`.
    pub fn evaluate(&mut self) -> Result<&Verdict, RigError> {
        if !matches!(self.state, State::Evaluating { .. }) {
            return Err(self.invalid("evaluate"));
        }
        let State::Evaluating {
            test,
            ended,
            timed_out,
        } = std::mem::replace(&mut self.state, State::Idle)
        else {
            return Err(self.invalid("evaluate"));
        };

        let regions = evaluate_regions(&test);
        let outcome = self.outcome_for(&regions, timed_out);
        let verdict = Verdict {
            test_id: test.id,
            outcome,
            regions,
            elapsed: ended.saturating_duration_since(test.started),
        };
        info!("{verdict}");
        self.state = match outcome {
            Outcome::Passed => State::Passed(verdict),
            Outcome::Failed(_) => State::Failed(verdict),
        };
        self.verdict().ok_or(RigError::InvalidTransition {
            action: "evaluate",
            state: "evaluating",
        })
    }

    /// Hardware fault during a cycle: fail it immediately without tallying.
    pub fn fault(&mut self, fault: &Fault, now: Instant) -> Option<&Verdict> {
        let reason = FailureReason::from_fault(fault);
        self.stop(now, reason)
    }

    /// Shut down the cycle in flight as `Failed(Cancelled)`.
    pub fn cancel(&mut self, now: Instant) -> Option<&Verdict> {
        self.stop(now, FailureReason::Cancelled)
    }

    /// Operator abort of the cycle in flight.
    pub fn abort(&mut self, now: Instant) -> Option<&Verdict> {
        self.stop(now, FailureReason::Aborted)
    }

    /// Return to `Idle` with the tally cleared. A no-op when already idle.
    pub fn reset(&mut self) -> Result<(), RigError> {
        match self.state {
            State::Idle => Ok(()),
            State::Passed(_) | State::Failed(_) => {
                debug!("session reset");
                self.state = State::Idle;
                Ok(())
            }
            _ => Err(self.invalid("reset")),
        }
    }

    fn conclude(
        &mut self,
        now: Instant,
        timed_out: bool,
        action: &'static str,
    ) -> Result<(), RigError> {
        self.state = match std::mem::replace(&mut self.state, State::Idle) {
            State::Armed(test) | State::Running(test) => State::Evaluating {
                test,
                ended: now,
                timed_out,
            },
            other => {
                self.state = other;
                return Err(self.invalid(action));
            }
        };
        Ok(())
    }

    fn stop(&mut self, now: Instant, reason: FailureReason) -> Option<&Verdict> {
        let test = match std::mem::replace(&mut self.state, State::Idle) {
            State::Armed(test) | State::Running(test) | State::Evaluating { test, .. } => test,
            other => {
                self.state = other;
                return None;
            }
        };
        warn!("test #{} stopped: {reason}", test.id);
        self.state = State::Failed(test.stopped(now, Outcome::Failed(reason)));
        self.verdict()
    }

    fn outcome_for(&self, regions: &[RegionReport], timed_out: bool) -> Outcome {
        let count = |pred: fn(&RegionResult) -> bool| {
            regions.iter().filter(|r| pred(&r.result)).count()
        };
        let mismatched = count(|r| matches!(r, RegionResult::Mismatched(_)));
        let matched = count(|r| matches!(r, RegionResult::Matched));
        let uncertain = count(|r| matches!(r, RegionResult::Uncertain { .. }));

        let reason = if timed_out {
            FailureReason::TestTimeout
        } else if mismatched > 0 {
            FailureReason::Mismatch
        } else if matched == 0 {
            FailureReason::InsufficientEvidence
        } else if uncertain > self.config.max_uncertain_regions {
            FailureReason::TooManyUncertain
        } else {
            return Outcome::Passed;
        };
        Outcome::Failed(reason)
    }

    fn invalid(&self, action: &'static str) -> RigError {
        RigError::InvalidTransition {
            action,
            state: self.status().name(),
        }
    }
}

/// Judge every region against every commanded step.
fn evaluate_regions(test: &ActiveTest) -> Vec<RegionReport> {
    RegionId::all()
        .map(|region| {
            let mut mismatches = Vec::new();
            let mut unsure = Vec::new();
            for &(step, expected) in &test.commands {
                match test.tally.reading(region, step) {
                    StepReading::Confirmed(observed) if observed == expected => {}
                    StepReading::Confirmed(observed) => mismatches.push(StepMismatch {
                        step,
                        expected,
                        observed,
                    }),
                    StepReading::Ambiguous | StepReading::NoEvidence => unsure.push(step),
                }
            }
            let result = if !mismatches.is_empty() {
                RegionResult::Mismatched(mismatches)
            } else if !unsure.is_empty() || test.commands.is_empty() {
                RegionResult::Uncertain { steps: unsure }
            } else {
                RegionResult::Matched
            };
            RegionReport { region, result }
        })
        .collect()
}

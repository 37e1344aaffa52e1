use std::fmt;
use std::time::Duration;

use crate::error::Fault;
use crate::model::RegionId;
use crate::palette::PaletteColor;

/// Why a cycle ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// At least one region tracked a colour other than the commanded one.
    Mismatch,
    /// No region produced confident evidence for every step.
    InsufficientEvidence,
    /// More regions than allowed ended without confident evidence.
    TooManyUncertain,
    TestTimeout,
    Cancelled,
    Aborted,
    CameraUnreachable,
    LedHardwareFault,
    PermissionDenied,
    ConfigUnreadable,
}

impl FailureReason {
    pub const fn code(self) -> &'static str {
        match self {
            FailureReason::Mismatch => "mismatch",
            FailureReason::InsufficientEvidence => "insufficient-evidence",
            FailureReason::TooManyUncertain => "too-many-uncertain",
            FailureReason::TestTimeout => "test-timeout",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Aborted => "aborted",
            FailureReason::CameraUnreachable => "camera-unreachable",
            FailureReason::LedHardwareFault => "led-hardware-fault",
            FailureReason::PermissionDenied => "permission-denied",
            FailureReason::ConfigUnreadable => "config-unreadable",
        }
    }

    /// Reason recorded when a hardware fault cuts a cycle short.
    pub fn from_fault(fault: &Fault) -> Self {
        match fault {
            Fault::CameraUnreachable(_) => FailureReason::CameraUnreachable,
            Fault::LedHardwareFault(_) => FailureReason::LedHardwareFault,
            Fault::PermissionDenied(_) => FailureReason::PermissionDenied,
            Fault::ConfigUnreadable(_) => FailureReason::ConfigUnreadable,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed(FailureReason),
}

/// A step where a region's plurality colour disagreed with the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepMismatch {
    pub step: usize,
    pub expected: PaletteColor,
    pub observed: PaletteColor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionResult {
    /// Every commanded step was confirmed.
    Matched,
    Mismatched(Vec<StepMismatch>),
    /// No mismatch, but these steps lacked a confident plurality.
    Uncertain { steps: Vec<usize> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionReport {
    pub region: RegionId,
    pub result: RegionResult,
}

/// Terminal outcome of one test cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub test_id: u64,
    pub outcome: Outcome,
    /// Per-region breakdown; empty when a fault or cancellation bypassed evaluation.
    pub regions: Vec<RegionReport>,
    pub elapsed: Duration,
}

impl Verdict {
    #[inline]
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }

    pub fn reason(&self) -> Option<FailureReason> {
        match self.outcome {
            Outcome::Passed => None,
            Outcome::Failed(reason) => Some(reason),
        }
    }

    pub fn region(&self, region: RegionId) -> Option<&RegionResult> {
        self.regions
            .iter()
            .find(|r| r.region == region)
            .map(|r| &r.result)
    }

    pub fn mismatched_regions(&self) -> Vec<RegionId> {
        self.regions_where(|r| matches!(r, RegionResult::Mismatched(_)))
    }

    pub fn uncertain_regions(&self) -> Vec<RegionId> {
        self.regions_where(|r| matches!(r, RegionResult::Uncertain { .. }))
    }

    fn regions_where(&self, pred: impl Fn(&RegionResult) -> bool) -> Vec<RegionId> {
        self.regions
            .iter()
            .filter(|r| pred(&r.result))
            .map(|r| r.region)
            .collect()
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome {
            Outcome::Passed => write!(f, "test #{} passed", self.test_id)?,
            Outcome::Failed(reason) => write!(f, "test #{} failed ({reason})", self.test_id)?,
        }
        write!(f, " after {:.1}s", self.elapsed.as_secs_f32())?;
        let mismatched = self.mismatched_regions();
        if !mismatched.is_empty() {
            write!(f, "; mismatched: {}", join_regions(&mismatched))?;
        }
        let uncertain = self.uncertain_regions();
        if !uncertain.is_empty() {
            write!(f, "; uncertain: {}", join_regions(&uncertain))?;
        }
        Ok(())
    }
}

fn join_regions(regions: &[RegionId]) -> String {
    regions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

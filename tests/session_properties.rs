use std::time::{Duration, Instant};

use test_case::test_case;

use led_qa_rig::RigError;
use led_qa_rig::config::SessionConfig;
use led_qa_rig::mock::ScriptedObservations;
use led_qa_rig::model::RegionId;
use led_qa_rig::palette::PaletteColor;
use led_qa_rig::session::{FailureReason, RegionResult, SessionStatus, TestSession, Verdict};

const PROGRAM: [PaletteColor; 4] = [
    PaletteColor::Red,
    PaletteColor::Green,
    PaletteColor::Blue,
    PaletteColor::Purple,
];

fn session() -> TestSession {
    TestSession::new(SessionConfig::default(), Duration::from_secs(15))
}

/// Arm, replay `script` over [`PROGRAM`], complete and evaluate.
fn run(session: &mut TestSession, script: &str) -> Verdict {
    let script = ScriptedObservations::parse(script).expect("valid script");
    let base = Instant::now();
    session.arm(base).expect("session is idle");
    script
        .replay(session, &PROGRAM, base)
        .expect("session accepts observations");
    session
        .program_completed(base + Duration::from_millis(400))
        .expect("session is running");
    session.evaluate().expect("session is evaluating").clone()
}

fn region(idx: u8) -> RegionId {
    RegionId::new(idx).unwrap()
}

const ALL_GOOD: &str = "RRRRRRRRR RRRRRRRRR / GGGGGGGGG GGGGGGGGG / BBBBBBBBB BBBBBBBBB / PPPPPPPPP PPPPPPPPP";

// ---------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------

#[test]
fn every_region_matching_passes() {
    let verdict = run(&mut session(), ALL_GOOD);

    assert!(verdict.passed(), "{verdict}");
    assert!(
        verdict
            .regions
            .iter()
            .all(|r| r.result == RegionResult::Matched)
    );
}

#[test_case("RRRRORRRR" ; "orange")]
#[test_case("RRRR-RRRR" ; "dark")]
fn region_four_off_colour_fails(red_frame: &str) {
    let wrong = red_frame.chars().nth(4).unwrap();
    let frame = |c: char| {
        let mut codes: Vec<char> = std::iter::repeat_n(c, 9).collect();
        codes[4] = wrong;
        codes.into_iter().collect::<String>()
    };
    let script = ["R", "G", "B", "P"]
        .iter()
        .map(|c| frame(c.chars().next().unwrap()))
        .collect::<Vec<_>>()
        .join(" / ");

    let verdict = run(&mut session(), &script);

    assert_eq!(verdict.reason(), Some(FailureReason::Mismatch));
    assert_eq!(verdict.mismatched_regions(), vec![region(4)]);
    match verdict.region(region(4)) {
        Some(RegionResult::Mismatched(steps)) => assert_eq!(steps.len(), 4),
        other => panic!("expected region 4 to mismatch, got {other:?}"),
    }
}

#[test]
fn unreadable_region_is_flagged_not_passed() {
    let script = "RRRRRRR?R / GGGGGGG?G / BBBBBBB?B / PPPPPPP?P";

    let verdict = run(&mut session(), script);

    assert!(verdict.passed(), "other regions decide: {verdict}");
    assert_eq!(verdict.uncertain_regions(), vec![region(7)]);
    assert_eq!(
        verdict.region(region(7)),
        Some(&RegionResult::Uncertain {
            steps: vec![0, 1, 2, 3]
        })
    );
}

#[test]
fn unreadable_region_does_not_hide_a_mismatch() {
    let script = "RRRRRRR?R / GGGGGGG?G / BBBBBBB?B / PPPPPPP?O";

    let verdict = run(&mut session(), script);

    assert_eq!(verdict.reason(), Some(FailureReason::Mismatch));
    assert_eq!(verdict.mismatched_regions(), vec![region(8)]);
    assert_eq!(verdict.uncertain_regions(), vec![region(7)]);
}

#[test]
fn two_unreadable_regions_fail() {
    let script = "RRRRRR??R / GGGGGG??G / BBBBBB??B / PPPPPP??P";

    let verdict = run(&mut session(), script);

    assert_eq!(verdict.reason(), Some(FailureReason::TooManyUncertain));
}

#[test]
fn missing_step_leaves_every_region_uncertain() {
    let script = "RRRRRRRRR / GGGGGGGGG / / PPPPPPPPP";

    let verdict = run(&mut session(), script);

    assert!(!verdict.passed());
    assert_eq!(verdict.uncertain_regions().len(), 9);
    assert_eq!(
        verdict.region(region(0)),
        Some(&RegionResult::Uncertain { steps: vec![2] })
    );
}

// ---------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------

#[test]
fn back_to_back_sessions_agree() {
    let mut session = session();
    let script = "RRRRRRRRR RRRROORRR / GGGGGGGGG / BBBBBBBBB / PPPPPPPP?";

    let first = run(&mut session, script);
    session.reset().expect("terminal session resets");
    assert_eq!(session.status(), SessionStatus::Idle);
    assert!(session.tally().is_none());
    let second = run(&mut session, script);

    assert_eq!(first.outcome, second.outcome);
    assert_eq!(first.regions, second.regions);
    assert_eq!(second.test_id, first.test_id + 1);
}

#[test]
fn observations_outside_a_cycle_are_rejected() {
    let mut session = session();
    let script = ScriptedObservations::parse("RRRRRRRRR").unwrap();

    let err = script
        .replay(&mut session, &PROGRAM, Instant::now())
        .unwrap_err();

    assert!(matches!(err, RigError::InvalidTransition { .. }));
    assert_eq!(session.status(), SessionStatus::Idle);
}

#[test]
fn deadline_forces_evaluation_with_breakdown() {
    let mut session = session();
    let base = Instant::now();
    session.arm(base).unwrap();
    ScriptedObservations::parse("RRRRRRRRR / GGGGGGGGG")
        .unwrap()
        .replay(&mut session, &PROGRAM[..3], base)
        .unwrap();

    assert!(!session.check_deadline(base + Duration::from_secs(14)));
    assert!(session.check_deadline(base + Duration::from_secs(15)));
    let verdict = session.evaluate().unwrap();

    assert_eq!(verdict.reason(), Some(FailureReason::TestTimeout));
    assert_eq!(verdict.regions.len(), 9);
    assert_eq!(verdict.elapsed, Duration::from_secs(15));
}

#[test]
fn cancel_mid_run_fails_as_cancelled() {
    let mut session = session();
    let base = Instant::now();
    session.arm(base).unwrap();
    ScriptedObservations::parse("RRRRRRRRR")
        .unwrap()
        .replay(&mut session, &PROGRAM[..1], base)
        .unwrap();

    let verdict = session.cancel(base).cloned().expect("cycle was running");

    assert_eq!(verdict.reason(), Some(FailureReason::Cancelled));
    assert!(verdict.regions.is_empty());
    assert_eq!(session.status(), SessionStatus::Failed);
    assert!(session.cancel(base).is_none(), "nothing left to cancel");
}

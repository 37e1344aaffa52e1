//! Runs a batch of test cycles against the simulated rig and prints every verdict.
//!
//! Usage: `diagnostics [cycles] [stuck-led]`. With a stuck LED index every
//! cycle is expected to fail on that LED.

use std::process::ExitCode;
use std::sync::Arc;

use crossbeam::channel;
use log::{error, info};

use led_qa_rig::config::RigConfig;
use led_qa_rig::mock::{Defect, SimRig};
use led_qa_rig::model::RegionId;
use led_qa_rig::orchestrator::Orchestrator;
use led_qa_rig::palette::PaletteColor;
use led_qa_rig::sink::RecordingSink;

const DEFAULT_CYCLES: u32 = 3;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let cycles = match args.next().map(|arg| arg.parse::<u32>()) {
        None => DEFAULT_CYCLES,
        Some(Ok(n)) => n,
        Some(Err(err)) => {
            error!("invalid cycle count: {err}");
            return ExitCode::FAILURE;
        }
    };
    let stuck = match args.next().map(|arg| arg.parse::<u8>().ok().and_then(RegionId::new)) {
        None => None,
        Some(Some(region)) => Some(region),
        Some(None) => {
            error!("LED index must be 0-8");
            return ExitCode::FAILURE;
        }
    };

    let config = RigConfig::sample();
    let calibration = Arc::new(config.calibration.clone());
    let rig = SimRig::new(Arc::clone(&calibration), 7);
    if let Some(region) = stuck {
        info!("{region} stuck on orange");
        rig.board.inject(region, Defect::Stuck(PaletteColor::Orange));
    }

    let sink = RecordingSink::new();
    let mut orchestrator = Orchestrator::new(
        &config,
        calibration,
        rig.camera.clone(),
        rig.strip.clone(),
        sink.clone(),
    );
    if let Err(fault) = orchestrator.startup() {
        error!("startup failed: {fault}");
        return ExitCode::FAILURE;
    }

    let (_controls, rx) = channel::unbounded();
    let mut unexpected = 0;
    for _ in 0..cycles {
        let Some(verdict) = orchestrator.run_cycle(&rx).verdict else {
            unexpected += 1;
            continue;
        };
        println!("{verdict}");
        let expected = match stuck {
            Some(region) => verdict.mismatched_regions() == vec![region],
            None => verdict.passed(),
        };
        if !expected {
            unexpected += 1;
        }
    }
    orchestrator.shutdown();

    println!(
        "{cycles} cycles, {} camera frames, {} LED writes, {unexpected} unexpected",
        rig.camera.captures(),
        rig.strip.writes()
    );
    if unexpected == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use log::{error, info, warn};

use led_qa_rig::ResultSink;
use led_qa_rig::config::RigConfig;
use led_qa_rig::mock::{self, SimRig, SimStatusLight, TerminalIndicator};
use led_qa_rig::orchestrator::{ButtonPoller, Control, Orchestrator};
use led_qa_rig::sink::{IndicatorSink, Tee};
use led_qa_rig::status::{RigStatus, StatusPlayer};

const DEFAULT_CONFIG: &str = "qa_config.json";
const LIGHT_TICK: Duration = Duration::from_millis(20);
const BUTTON_PERIOD: Duration = Duration::from_millis(10);

type OperatorSink = Tee<IndicatorSink, TerminalIndicator>;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("LED board QA rig");

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let (control_tx, control_rx) = channel::unbounded();
    install_shutdown_handler(control_tx.clone());

    let config = match RigConfig::load(&path) {
        Ok(config) => config,
        Err(err) => {
            error!("cannot start from {path}: {err}");
            hold_fault(err.fault(), control_tx, &control_rx);
            return;
        }
    };

    let calibration = Arc::new(config.calibration.clone());
    let rig = SimRig::new(Arc::clone(&calibration), rand::random());
    let Some(sink) = operator_sink(rig.light.clone()) else {
        return;
    };

    let mut button = match ButtonPoller::spawn(rig.button.clone(), control_tx.clone(), BUTTON_PERIOD) {
        Ok(poller) => Some(poller),
        Err(err) => {
            warn!("trigger button unavailable: {err}");
            None
        }
    };
    spawn_terminal(control_tx);

    let mut orchestrator = Orchestrator::new(&config, calibration, rig.camera, rig.strip, sink);
    if let Err(fault) = orchestrator.startup() {
        error!("rig is blocked until restart: {fault}");
    }
    orchestrator.run(&control_rx);

    if let Some(button) = button.as_mut() {
        button.stop();
    }
}

fn operator_sink(light: SimStatusLight) -> Option<OperatorSink> {
    match StatusPlayer::spawn(light, LIGHT_TICK) {
        Ok(player) => Some(Tee(IndicatorSink::new(player), TerminalIndicator::new())),
        Err(err) => {
            error!("could not start the status light: {err}");
            None
        }
    }
}

fn install_shutdown_handler(controls: Sender<Control>) {
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = controls.send(Control::Shutdown);
    }) {
        warn!("Ctrl-C handler not installed: {err}");
    }
}

fn spawn_terminal(controls: Sender<Control>) {
    if let Err(err) = thread::Builder::new()
        .name("terminal".into())
        .spawn(move || mock::run_trigger_terminal(controls))
    {
        warn!("terminal input unavailable: {err}");
    }
}

/// Show a startup fault until the operator shuts the rig down.
fn hold_fault(fault: led_qa_rig::Fault, controls: Sender<Control>, rx: &Receiver<Control>) {
    let Some(mut sink) = operator_sink(SimStatusLight::new()) else {
        return;
    };
    if let Err(err) = sink.report_fault(&fault) {
        warn!("fault report failed: {err}");
    }
    spawn_terminal(controls);
    while let Ok(control) = rx.recv() {
        if control == Control::Shutdown {
            break;
        }
        warn!("{control:?} ignored: {fault}");
    }
    if let Err(err) = sink.show_status(RigStatus::Off) {
        warn!("status update failed: {err}");
    }
}

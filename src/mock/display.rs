use std::io::{self, Write};

use crate::ResultSink;
use crate::error::Fault;
use crate::model::{REGION_COUNT, RegionId};
use crate::session::{RegionResult, Verdict};
use crate::status::RigStatus;

/// Terminal stand-in for the status lamp.
///
/// Prints one ANSI-coloured status line per change and a 3x3 grid of the
/// board after each verdict.
#[derive(Debug, Default)]
pub struct TerminalIndicator;

impl TerminalIndicator {
    pub fn new() -> Self {
        Self
    }
}

/// Error type for terminal indicator output.
#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    #[error("failed to write to terminal: {0}")]
    Io(#[from] io::Error),
}

impl ResultSink for TerminalIndicator {
    type Error = DisplayError;

    fn show_status(&mut self, status: RigStatus) -> Result<(), Self::Error> {
        render_status(&mut io::stdout(), status)
    }

    fn report_fault(&mut self, fault: &Fault) -> Result<(), Self::Error> {
        let mut out = io::stdout();
        render_status(&mut out, RigStatus::for_fault(fault))?;
        writeln!(out, "   {fault}")?;
        Ok(())
    }

    fn report_verdict(&mut self, verdict: &Verdict) -> Result<(), Self::Error> {
        render_verdict(&mut io::stdout(), verdict)
    }
}

/// Render a status line to any writer. Extracted for testability.
fn render_status(w: &mut impl Write, status: RigStatus) -> Result<(), DisplayError> {
    writeln!(w, "{} {}", status_lamp(status), status.label())?;
    w.flush()?;
    Ok(())
}

fn render_verdict(w: &mut impl Write, verdict: &Verdict) -> Result<(), DisplayError> {
    render_status(w, RigStatus::for_verdict(verdict))?;
    writeln!(w, "   {verdict}")?;
    if verdict.regions.len() == REGION_COUNT {
        for row in 0..3u8 {
            write!(w, "   ")?;
            for col in 0..3u8 {
                let result = RegionId::new(row * 3 + col).and_then(|id| verdict.region(id));
                write!(w, "{}", format_region(result))?;
            }
            writeln!(w)?;
        }
    }
    w.flush()?;
    Ok(())
}

fn status_lamp(status: RigStatus) -> &'static str {
    match status {
        RigStatus::Off => "( )",
        RigStatus::Ready => "\x1b[47m   \x1b[0m",
        RigStatus::Running => "\x1b[44m   \x1b[0m",
        RigStatus::Passed => "\x1b[42m   \x1b[0m",
        RigStatus::Failed => "\x1b[41m   \x1b[0m",
        RigStatus::CameraUnreachable => "\x1b[45m ~ \x1b[0m",
        RigStatus::ConfigUnreadable => "\x1b[41m ! \x1b[0m",
        RigStatus::PermissionDenied => "\x1b[43m ! \x1b[0m",
    }
}

fn format_region(result: Option<&RegionResult>) -> &'static str {
    match result {
        Some(RegionResult::Matched) => "\x1b[42m ✓ \x1b[0m",
        Some(RegionResult::Mismatched(_)) => "\x1b[41m ✗ \x1b[0m",
        Some(RegionResult::Uncertain { .. }) => "\x1b[43m ? \x1b[0m",
        None => " · ",
    }
}

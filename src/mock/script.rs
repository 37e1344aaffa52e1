use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error::RigError;
use crate::model::{ColorCommand, Observation, REGION_COUNT, RegionId};
use crate::palette::{ObservedColor, PaletteColor};
use crate::session::TestSession;

/// Confidence given to scripted palette readings.
const CONFIDENT: f32 = 0.95;
/// Confidence given to scripted `?` readings.
const UNSURE: f32 = 0.40;
/// Window length of each replayed step.
const STEP_SPAN: Duration = Duration::from_millis(100);

/// Error when parsing an observation script.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown colour code '{0}'")]
    UnknownCode(char),

    #[error("frame '{0}' must have exactly 9 readings")]
    FrameLength(String),
}

/// Per-frame classifier output written as text, for driving a [`TestSession`]
/// without a camera.
///
/// Format:
/// - A frame is 9 colour codes, one per LED in region order
///   (`-` off, `R`, `G`, `B`, `P`, `O`, and `?` for an uncertain reading)
/// - Whitespace separates frames within a step
/// - `/` moves on to the next program step
///
/// Examples:
/// - `"RRRRRRRRR RRRRRRRRR / GGGGGGGGG"` - two red frames, then one green frame
/// - `"RRRRORRRR / GGGGOGGGG"` - LED4 shows orange throughout
/// - `"RRRRRRR?R"` - LED7 cannot be read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptedObservations {
    steps: Vec<Vec<[ObservedColor; REGION_COUNT]>>,
}

impl ScriptedObservations {
    pub fn parse(script: &str) -> Result<Self, ParseError> {
        let steps = script
            .split('/')
            .map(|step| step.split_whitespace().map(parse_frame).collect())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { steps })
    }

    /// Append more steps from another script.
    pub fn push_script(&mut self, script: &str) -> Result<(), ParseError> {
        let more = Self::parse(script)?;
        self.steps.extend(more.steps);
        Ok(())
    }

    pub fn steps(&self) -> usize {
        self.steps.len()
    }

    /// Frames scripted for `step`.
    pub fn frames(&self, step: usize) -> &[[ObservedColor; REGION_COUNT]] {
        self.steps.get(step).map_or(&[], Vec::as_slice)
    }

    /// Announce every step of `program` to the session and record its frames.
    ///
    /// Steps without scripted frames are still announced, so they count as
    /// commanded but unobserved.
    pub fn replay(
        &self,
        session: &mut TestSession,
        program: &[PaletteColor],
        base: Instant,
    ) -> Result<(), RigError> {
        let mut seq = 0;
        for (step, &color) in program.iter().enumerate() {
            let start = base + STEP_SPAN * step as u32;
            let command = ColorCommand {
                step,
                color,
                start,
                end: Some(start + STEP_SPAN),
            };
            session.command_started(&command)?;
            for frame in self.frames(step) {
                for (region, &reading) in RegionId::all().zip(frame) {
                    let observation = Observation {
                        region,
                        color: reading,
                        confidence: if reading.confident().is_some() {
                            CONFIDENT
                        } else {
                            UNSURE
                        },
                        frame_seq: seq,
                    };
                    session.record(&command, &observation)?;
                }
                seq += 1;
            }
        }
        Ok(())
    }
}

fn parse_frame(token: &str) -> Result<[ObservedColor; REGION_COUNT], ParseError> {
    let readings = token
        .chars()
        .map(|code| match code {
            '?' => Ok(ObservedColor::Uncertain),
            c => PaletteColor::from_code(c)
                .map(ObservedColor::Palette)
                .ok_or(ParseError::UnknownCode(c)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    readings
        .try_into()
        .map_err(|_| ParseError::FrameLength(token.to_string()))
}

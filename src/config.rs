//! Rig configuration and static calibration, loaded once at startup.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Fault, RigError};
use crate::model::{LedRegion, REGION_COUNT, RegionId};
use crate::palette::{PaletteColor, Rgb};

/// Errors raised while reading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// The startup fault shown to the operator for this error.
    pub fn fault(&self) -> Fault {
        match self {
            ConfigError::Io { source, .. } if source.kind() == io::ErrorKind::PermissionDenied => {
                Fault::PermissionDenied(self.to_string())
            }
            _ => Fault::ConfigUnreadable(self.to_string()),
        }
    }
}

impl From<ConfigError> for RigError {
    fn from(err: ConfigError) -> Self {
        err.fault().into()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RigConfig {
    pub program: ProgramConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub leds: LedConfig,
    #[serde(default)]
    pub annotator: AnnotatorConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub artifacts: ArtifactConfig,
    pub calibration: Calibration,
}

/// One step of the LED colour program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProgramStep {
    pub color: PaletteColor,
    pub duration_ms: u64,
}

impl ProgramStep {
    pub const fn new(color: PaletteColor, duration_ms: u64) -> Self {
        Self { color, duration_ms }
    }

    #[inline]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProgramConfig {
    pub steps: Vec<ProgramStep>,
    /// How many times the step list is played back to back.
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    #[serde(default = "default_max_test_duration_ms")]
    pub max_test_duration_ms: u64,
}

impl ProgramConfig {
    /// The full program with repetitions unrolled.
    pub fn expanded(&self) -> Vec<ProgramStep> {
        (0..self.repeat.max(1))
            .flat_map(|_| self.steps.iter().copied())
            .collect()
    }

    #[inline]
    pub fn max_test_duration(&self) -> Duration {
        Duration::from_millis(self.max_test_duration_ms)
    }
}

fn default_repeat() -> u32 {
    1
}

fn default_max_test_duration_ms() -> u64 {
    15_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct CameraConfig {
    pub frame_rate: f32,
    pub width: u32,
    pub height: u32,
    /// How long capture may keep failing before the camera is declared unreachable.
    pub stall_grace_ms: u64,
    pub channel_capacity: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            frame_rate: 15.0,
            width: 480,
            height: 272,
            stall_grace_ms: 2_000,
            channel_capacity: 8,
        }
    }
}

impl CameraConfig {
    #[inline]
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.frame_rate)
    }

    #[inline]
    pub fn stall_grace(&self) -> Duration {
        Duration::from_millis(self.stall_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct LedConfig {
    pub write_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            write_retries: 3,
            retry_backoff_ms: 20,
        }
    }
}

impl LedConfig {
    #[inline]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct AnnotatorConfig {
    /// Frames closer than this to a command transition are discarded.
    pub guard_ms: u64,
    /// Upper bound on frames waiting for their command window to close.
    pub max_pending: usize,
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            guard_ms: 40,
            max_pending: 64,
        }
    }
}

impl AnnotatorConfig {
    #[inline]
    pub fn guard(&self) -> Duration {
        Duration::from_millis(self.guard_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ClassifierConfig {
    /// Fraction of samples dropped from each end of every channel before averaging.
    pub trim_fraction: f32,
    pub confidence_floor: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            trim_fraction: 0.10,
            confidence_floor: 0.80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct SessionConfig {
    /// Regions allowed to end a cycle without enough confident evidence.
    pub max_uncertain_regions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_uncertain_regions: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ArtifactConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    /// Also assemble one GIF per colour after each test.
    pub animations: bool,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("data/frames"),
            animations: true,
        }
    }
}

/// Static LED geometry and the pixel colour each palette entry produces on camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Calibration {
    pub frame_width: u32,
    pub frame_height: u32,
    pub regions: Vec<LedRegion>,
    pub references: BTreeMap<PaletteColor, [u8; 3]>,
}

impl Calibration {
    /// A 3x3 grid of square regions centred in the frame.
    pub fn grid(frame_width: u32, frame_height: u32, region_size: u32) -> Self {
        let step_x = frame_width / 4;
        let step_y = frame_height / 4;
        let regions = RegionId::all()
            .map(|id| {
                let col = id.value() as u32 % 3;
                let row = id.value() as u32 / 3;
                LedRegion {
                    id,
                    x: step_x * (col + 1) - region_size / 2,
                    y: step_y * (row + 1) - region_size / 2,
                    width: region_size,
                    height: region_size,
                }
            })
            .collect();

        let references = BTreeMap::from([
            (PaletteColor::Off, [20, 20, 24]),
            (PaletteColor::Red, [230, 40, 40]),
            (PaletteColor::Green, [40, 220, 60]),
            (PaletteColor::Blue, [40, 60, 230]),
            (PaletteColor::Purple, [200, 50, 210]),
            (PaletteColor::Orange, [240, 120, 70]),
        ]);

        Self {
            frame_width,
            frame_height,
            regions,
            references,
        }
    }

    /// Region geometry by id. Validation guarantees every id is present.
    pub fn region(&self, id: RegionId) -> Option<&LedRegion> {
        self.regions.iter().find(|r| r.id == id)
    }

    #[inline]
    pub fn regions(&self) -> &[LedRegion] {
        &self.regions
    }

    /// Reference pixel colour for a palette entry.
    pub fn reference(&self, color: PaletteColor) -> Option<Rgb> {
        self.references.get(&color).map(|rgb| image::Rgb(*rgb))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.regions.len() != REGION_COUNT {
            return Err(ConfigError::Invalid(format!(
                "expected {REGION_COUNT} regions, found {}",
                self.regions.len()
            )));
        }
        for id in RegionId::all() {
            if self.regions.iter().filter(|r| r.id == id).count() != 1 {
                return Err(ConfigError::Invalid(format!(
                    "{id} must be calibrated exactly once"
                )));
            }
        }
        if let Some(region) = self
            .regions
            .iter()
            .find(|r| !r.fits_within(self.frame_width, self.frame_height))
        {
            return Err(ConfigError::Invalid(format!(
                "{} lies outside the {}x{} frame",
                region.id, self.frame_width, self.frame_height
            )));
        }
        if let Some(missing) = PaletteColor::ALL
            .into_iter()
            .find(|c| !self.references.contains_key(c))
        {
            return Err(ConfigError::Invalid(format!(
                "no reference pixel colour for {missing}"
            )));
        }
        Ok(())
    }
}

impl RigConfig {
    /// Read and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: RigConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reference configuration matching the simulated rig.
    pub fn sample() -> Self {
        let camera = CameraConfig::default();
        Self {
            program: ProgramConfig {
                steps: vec![
                    ProgramStep::new(PaletteColor::Red, 600),
                    ProgramStep::new(PaletteColor::Green, 600),
                    ProgramStep::new(PaletteColor::Blue, 600),
                    ProgramStep::new(PaletteColor::Purple, 600),
                ],
                repeat: 1,
                max_test_duration_ms: default_max_test_duration_ms(),
            },
            calibration: Calibration::grid(camera.width, camera.height, 24),
            camera,
            leds: LedConfig::default(),
            annotator: AnnotatorConfig::default(),
            classifier: ClassifierConfig::default(),
            session: SessionConfig::default(),
            artifacts: ArtifactConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.calibration.validate()?;

        let program = self.program.expanded();
        let shortest = program
            .iter()
            .map(|step| step.duration_ms)
            .min()
            .ok_or_else(|| ConfigError::Invalid("the LED program has no steps".into()))?;
        if shortest == 0 {
            return Err(ConfigError::Invalid("step durations must be positive".into()));
        }
        if self.annotator.guard_ms * 2 >= shortest {
            return Err(ConfigError::Invalid(format!(
                "guard interval of {} ms leaves no usable frames in a {shortest} ms step",
                self.annotator.guard_ms
            )));
        }
        if !(self.camera.frame_rate.is_finite() && self.camera.frame_rate > 0.0) {
            return Err(ConfigError::Invalid("frame rate must be positive".into()));
        }
        let longest = program.iter().map(|step| step.duration_ms).max().unwrap_or(shortest);
        let frames_per_step = (longest as f64 * f64::from(self.camera.frame_rate) / 1_000.0).ceil();
        if frames_per_step > self.annotator.max_pending as f64 {
            return Err(ConfigError::Invalid(format!(
                "a {longest} ms step yields {frames_per_step} frames at {} fps, \
                 more than the {} the annotator holds",
                self.camera.frame_rate, self.annotator.max_pending
            )));
        }
        if self.camera.channel_capacity == 0 {
            return Err(ConfigError::Invalid("frame channel needs capacity".into()));
        }
        if (self.camera.width, self.camera.height)
            != (self.calibration.frame_width, self.calibration.frame_height)
        {
            return Err(ConfigError::Invalid(format!(
                "camera resolution {}x{} does not match calibration {}x{}",
                self.camera.width,
                self.camera.height,
                self.calibration.frame_width,
                self.calibration.frame_height
            )));
        }
        if !(0.0..0.5).contains(&self.classifier.trim_fraction) {
            return Err(ConfigError::Invalid("trim fraction must be in [0, 0.5)".into()));
        }
        if !(self.classifier.confidence_floor > 0.0 && self.classifier.confidence_floor <= 1.0)
        {
            return Err(ConfigError::Invalid("confidence floor must be in (0, 1]".into()));
        }
        if self.program.max_test_duration_ms == 0 {
            return Err(ConfigError::Invalid("test duration must be positive".into()));
        }
        Ok(())
    }
}

//! Optional on-disk record of what the camera saw during a test.
//!
//! Layout: `<dir>/<colour>/<seq>.jpeg` per annotated frame and, with
//! animations on, `<dir>/gifs/<colour>.gif` once the verdict is in.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage, ImageFormat};
use log::{debug, info};
use thiserror::Error;

use crate::config::ArtifactConfig;
use crate::model::AnnotatedFrame;
use crate::palette::PaletteColor;

/// Frames per animation; later frames are still stored as stills.
const MAX_ANIMATION_FRAMES: usize = 48;
const FRAME_DELAY_MS: u32 = 100;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("artifact encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Debug)]
pub struct ArtifactWriter {
    config: ArtifactConfig,
    stored: BTreeMap<PaletteColor, Vec<PathBuf>>,
}

impl ArtifactWriter {
    pub fn new(config: ArtifactConfig) -> Self {
        Self {
            config,
            stored: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Clear the previous test's artifacts.
    pub fn begin(&mut self, test_id: u64) -> Result<(), ArtifactError> {
        self.stored.clear();
        if !self.enabled() {
            return Ok(());
        }
        match fs::remove_dir_all(&self.config.dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(&self.config.dir)?;
        debug!("artifacts for test #{test_id} go to {}", self.config.dir.display());
        Ok(())
    }

    /// Save one annotated frame as a JPEG still.
    pub fn store(&mut self, annotated: &AnnotatedFrame) -> Result<Option<PathBuf>, ArtifactError> {
        if !self.enabled() {
            return Ok(None);
        }
        let color = annotated.command.color;
        let dir = self.config.dir.join(color.name());
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.jpeg", annotated.frame.seq));
        annotated
            .frame
            .image
            .save_with_format(&path, ImageFormat::Jpeg)?;
        self.stored.entry(color).or_default().push(path.clone());
        Ok(Some(path))
    }

    /// Assemble one GIF per colour from the stills. Returns the files written.
    pub fn finish(&mut self) -> Result<Vec<PathBuf>, ArtifactError> {
        let stored = std::mem::take(&mut self.stored);
        if !self.enabled() || !self.config.animations {
            return Ok(Vec::new());
        }
        let gif_dir = self.config.dir.join("gifs");
        fs::create_dir_all(&gif_dir)?;

        let mut written = Vec::new();
        for (color, stills) in stored {
            if stills.is_empty() {
                continue;
            }
            let path = gif_dir.join(format!("{}.gif", color.name()));
            write_animation(&path, &stills)?;
            written.push(path);
        }
        info!(
            "wrote {} animations to {}",
            written.len(),
            gif_dir.display()
        );
        Ok(written)
    }
}

fn write_animation(path: &Path, stills: &[PathBuf]) -> Result<(), ArtifactError> {
    let mut encoder = GifEncoder::new(BufWriter::new(File::create(path)?));
    encoder.set_repeat(Repeat::Infinite)?;
    for still in stills.iter().take(MAX_ANIMATION_FRAMES) {
        let rgba = image::open(still).map(DynamicImage::into_rgba8)?;
        let delay = Delay::from_numer_denom_ms(FRAME_DELAY_MS, 1);
        encoder.encode_frame(image::Frame::from_parts(rgba, 0, 0, delay))?;
    }
    Ok(())
}

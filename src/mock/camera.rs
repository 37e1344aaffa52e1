use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::board::{Appearance, SimBoard};
use super::{SimError, lock};
use crate::Camera;
use crate::config::Calibration;
use crate::palette::{PaletteColor, Rgb};

const BACKGROUND: [u8; 3] = [28, 30, 32];
const OBSCURED: [u8; 3] = [128, 128, 128];
/// How long a stalled capture blocks before giving up.
const STALL_DELAY: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct CameraControls {
    open: AtomicBool,
    fail_open: AtomicBool,
    deny: AtomicBool,
    stall: AtomicBool,
    stall_on: Mutex<Option<PaletteColor>>,
    latency: Mutex<Duration>,
    captures: AtomicU64,
}

/// Camera looking at a [`SimBoard`].
///
/// Renders each LED region with the calibrated reference colour of whatever
/// the board shows, plus seeded sensor noise and one hot pixel per region.
#[derive(Debug, Clone)]
pub struct SimCamera {
    board: SimBoard,
    calibration: Arc<Calibration>,
    rng: StdRng,
    noise: u8,
    controls: Arc<CameraControls>,
}

impl SimCamera {
    pub fn new(board: SimBoard, calibration: Arc<Calibration>, seed: u64) -> Self {
        Self {
            board,
            calibration,
            rng: StdRng::seed_from_u64(seed),
            noise: 12,
            controls: Arc::default(),
        }
    }

    /// Per-channel noise amplitude.
    pub fn with_noise(mut self, noise: u8) -> Self {
        self.noise = noise;
        self
    }

    pub fn is_open(&self) -> bool {
        self.controls.open.load(Ordering::SeqCst)
    }

    /// Make every `open` fail as if the camera were unplugged.
    pub fn fail_open(&self, fail: bool) {
        self.controls.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Block every capture for `latency` before it returns a frame.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.controls.latency) = latency;
    }

    /// Make every `open` fail with a permission error.
    pub fn deny_permission(&self, deny: bool) {
        self.controls.deny.store(deny, Ordering::SeqCst);
    }

    /// Time out every capture.
    pub fn stall(&self, stall: bool) {
        self.controls.stall.store(stall, Ordering::SeqCst);
    }

    /// Time out captures while the first LED shows `color`.
    pub fn stall_on(&self, color: Option<PaletteColor>) {
        *lock(&self.controls.stall_on) = color;
    }

    /// Frames delivered so far.
    pub fn captures(&self) -> u64 {
        self.controls.captures.load(Ordering::SeqCst)
    }

    fn stalled(&self, seen: &[Appearance]) -> bool {
        if self.controls.stall.load(Ordering::SeqCst) {
            return true;
        }
        let stall_on = *lock(&self.controls.stall_on);
        stall_on.is_some_and(|color| seen.first() == Some(&Appearance::Palette(color)))
    }

    fn pixel_for(&self, appearance: Appearance) -> [u8; 3] {
        match appearance {
            Appearance::Palette(color) => self
                .calibration
                .reference(color)
                .unwrap_or_else(|| color.drive_rgb())
                .0,
            Appearance::Raw(rgb) => rgb.0,
            Appearance::Obscured => OBSCURED,
        }
    }

    fn render(&mut self, seen: &[Appearance]) -> RgbImage {
        let calibration = Arc::clone(&self.calibration);
        let mut image = RgbImage::from_pixel(
            calibration.frame_width,
            calibration.frame_height,
            Rgb::from(BACKGROUND),
        );
        let noise = i16::from(self.noise);

        for region in calibration.regions() {
            let base = self.pixel_for(seen[region.id.index()]);
            for y in region.y..region.y + region.height {
                for x in region.x..region.x + region.width {
                    let px = base.map(|c| {
                        let jitter = if noise > 0 {
                            self.rng.gen_range(-noise..=noise)
                        } else {
                            0
                        };
                        (i16::from(c) + jitter).clamp(0, 255) as u8
                    });
                    image.put_pixel(x, y, Rgb::from(px));
                }
            }
            image.put_pixel(region.x, region.y, Rgb::from([255, 255, 255]));
        }
        image
    }
}

impl Camera for SimCamera {
    type Error = SimError;

    fn open(&mut self) -> Result<(), Self::Error> {
        if self.controls.deny.load(Ordering::SeqCst) {
            return Err(SimError::PermissionDenied("camera"));
        }
        if self.controls.fail_open.load(Ordering::SeqCst) {
            return Err(SimError::Disconnected("camera"));
        }
        self.controls.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn capture(&mut self) -> Result<RgbImage, Self::Error> {
        if !self.is_open() {
            return Err(SimError::NotOpen("camera"));
        }
        let latency = *lock(&self.controls.latency);
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        let seen = self.board.appearance();
        if self.stalled(&seen) {
            thread::sleep(STALL_DELAY);
            return Err(SimError::Timeout);
        }
        let image = self.render(&seen);
        self.controls.captures.fetch_add(1, Ordering::SeqCst);
        Ok(image)
    }

    fn close(&mut self) {
        self.controls.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{REGION_COUNT, RegionId};

    fn camera() -> (SimBoard, SimCamera) {
        let board = SimBoard::new();
        let calibration = Arc::new(Calibration::grid(120, 68, 8));
        let camera = SimCamera::new(board.clone(), calibration, 7);
        (board, camera)
    }

    #[test]
    fn test_capture_requires_open() {
        let (_, mut camera) = camera();
        assert_eq!(camera.capture(), Err(SimError::NotOpen("camera")));

        camera.open().unwrap();
        assert!(camera.is_open());
        assert!(camera.capture().is_ok());

        camera.close();
        assert!(!camera.is_open());
    }

    #[test]
    fn test_renders_reference_colour_in_regions() {
        let (board, camera) = camera();
        let mut camera = camera.with_noise(0);
        board.drive(&[PaletteColor::Green.drive_rgb(); REGION_COUNT]);
        camera.open().unwrap();

        let image = camera.capture().unwrap();
        let calibration = Calibration::grid(120, 68, 8);
        let region = calibration.region(RegionId::new(4).unwrap()).unwrap();

        assert_eq!(image.dimensions(), (120, 68));
        assert_eq!(
            *image.get_pixel(region.x + 1, region.y + 1),
            calibration.reference(PaletteColor::Green).unwrap()
        );
        assert_eq!(*image.get_pixel(0, 0), Rgb::from(BACKGROUND));
    }

    #[test]
    fn test_stall_on_colour() {
        let (board, mut camera) = camera();
        camera.open().unwrap();
        camera.stall_on(Some(PaletteColor::Blue));

        board.drive(&[PaletteColor::Red.drive_rgb(); REGION_COUNT]);
        assert!(camera.capture().is_ok());

        board.drive(&[PaletteColor::Blue.drive_rgb(); REGION_COUNT]);
        assert_eq!(camera.capture(), Err(SimError::Timeout));
        assert_eq!(camera.captures(), 1);
    }

    #[test]
    fn test_open_failures() {
        let (_, mut camera) = camera();
        camera.deny_permission(true);
        assert_eq!(camera.open(), Err(SimError::PermissionDenied("camera")));

        camera.deny_permission(false);
        camera.fail_open(true);
        assert_eq!(camera.open(), Err(SimError::Disconnected("camera")));
        assert!(!camera.is_open());
    }
}

//! Joins frames to the colour command that was active when they were captured.
//!
//! Frames wait while their command is still open: whether they are far enough
//! from the window's end is only known once it closes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::config::AnnotatorConfig;
use crate::model::{AnnotatedFrame, ColorCommand, Frame};

/// Counters for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnotatorStats {
    pub annotated: u64,
    /// Too close to a transition.
    pub in_guard: u64,
    /// No command covered the capture time.
    pub uncovered: u64,
    /// Pushed out by newer frames while waiting.
    pub evicted: u64,
}

enum Decision {
    Emit(ColorCommand),
    Discard(&'static str),
    Wait,
}

#[derive(Debug)]
pub struct FrameAnnotator {
    guard: Duration,
    max_pending: usize,
    windows: Vec<ColorCommand>,
    pending: VecDeque<Frame>,
    ready: VecDeque<AnnotatedFrame>,
    completed: bool,
    last_seq: Option<u64>,
    stats: AnnotatorStats,
}

impl FrameAnnotator {
    pub fn new(config: &AnnotatorConfig) -> Self {
        Self {
            guard: config.guard(),
            max_pending: config.max_pending.max(1),
            windows: Vec::new(),
            pending: VecDeque::new(),
            ready: VecDeque::new(),
            completed: false,
            last_seq: None,
            stats: AnnotatorStats::default(),
        }
    }

    /// Forget every window and frame from the previous cycle.
    pub fn reset(&mut self) {
        self.windows.clear();
        self.pending.clear();
        self.ready.clear();
        self.completed = false;
        self.last_seq = None;
        self.stats = AnnotatorStats::default();
    }

    #[inline]
    pub fn stats(&self) -> AnnotatorStats {
        self.stats
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn command_started(&mut self, command: ColorCommand) {
        if let Some(last) = self.windows.last()
            && command.start < last.end.unwrap_or(last.start)
        {
            warn!(
                "ignoring step {} starting inside step {}",
                command.step, last.step
            );
            return;
        }
        self.windows.push(command);
        self.settle();
    }

    pub fn command_ended(&mut self, command: ColorCommand) {
        match self.windows.iter_mut().rev().find(|w| w.step == command.step) {
            Some(window) => window.end = command.end,
            None => self.windows.push(command),
        }
        self.settle();
    }

    /// No further commands will arrive this cycle.
    pub fn program_completed(&mut self) {
        self.completed = true;
        self.settle();
    }

    pub fn push_frame(&mut self, frame: Frame) {
        if self.last_seq.is_some_and(|last| frame.seq <= last) {
            warn!("frame {} arrived out of order, dropped", frame.seq);
            return;
        }
        self.last_seq = Some(frame.seq);
        self.pending.push_back(frame);
        while self.pending.len() > self.max_pending {
            if let Some(old) = self.pending.pop_front() {
                debug!("frame {} evicted while waiting for its command", old.seq);
                self.stats.evicted += 1;
            }
        }
        self.settle();
    }

    /// Annotated frames in sequence order.
    pub fn drain(&mut self) -> impl Iterator<Item = AnnotatedFrame> + '_ {
        self.ready.drain(..)
    }

    fn settle(&mut self) {
        while let Some(front) = self.pending.front() {
            match self.decide(front.captured_at) {
                Decision::Wait => break,
                Decision::Emit(command) => {
                    if let Some(frame) = self.pending.pop_front() {
                        self.stats.annotated += 1;
                        self.ready.push_back(AnnotatedFrame { frame, command });
                    }
                }
                Decision::Discard(why) => {
                    if let Some(frame) = self.pending.pop_front() {
                        trace!("frame {} discarded: {why}", frame.seq);
                        if why == "no command" {
                            self.stats.uncovered += 1;
                        } else {
                            self.stats.in_guard += 1;
                        }
                    }
                }
            }
        }
    }

    fn decide(&self, at: Instant) -> Decision {
        if let Some(window) = self.windows.iter().find(|w| w.contains(at)) {
            if at < window.start + self.guard {
                return Decision::Discard("after transition");
            }
            return match window.end {
                Some(end) if at + self.guard > end => Decision::Discard("before transition"),
                Some(_) => Decision::Emit(*window),
                None if self.completed => Decision::Discard("no command"),
                None => Decision::Wait,
            };
        }
        // Uncovered: a later window may still claim it unless one already starts after it.
        let frontier = self.windows.last().map(|w| w.end.unwrap_or(w.start));
        match frontier {
            Some(frontier) if at < frontier => Decision::Discard("no command"),
            _ if self.completed => Decision::Discard("no command"),
            _ => Decision::Wait,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::palette::PaletteColor;
    use image::RgbImage;

    struct Clock(Instant);

    impl Clock {
        fn at(&self, ms: u64) -> Instant {
            self.0 + Duration::from_millis(ms)
        }

        fn frame(&self, seq: u64, ms: u64) -> Frame {
            Frame {
                seq,
                captured_at: self.at(ms),
                image: RgbImage::new(1, 1),
            }
        }

        fn command(&self, step: usize, start: u64, end: Option<u64>) -> ColorCommand {
            ColorCommand {
                step,
                color: PaletteColor::ALL[step % PaletteColor::ALL.len()],
                start: self.at(start),
                end: end.map(|ms| self.at(ms)),
            }
        }
    }

    fn annotator() -> FrameAnnotator {
        FrameAnnotator::new(&AnnotatorConfig {
            guard_ms: 40,
            max_pending: 8,
        })
    }

    fn drained(annotator: &mut FrameAnnotator) -> Vec<(u64, usize)> {
        annotator
            .drain()
            .map(|a| (a.frame.seq, a.command.step))
            .collect()
    }

    #[test]
    fn test_frames_wait_for_window_to_close() {
        let clock = Clock(Instant::now());
        let mut annotator = annotator();
        annotator.command_started(clock.command(0, 100, None));
        annotator.push_frame(clock.frame(0, 200));

        assert!(drained(&mut annotator).is_empty());
        assert_eq!(annotator.pending(), 1);

        annotator.command_ended(clock.command(0, 100, Some(400)));
        assert_eq!(drained(&mut annotator), vec![(0, 0)]);
    }

    #[test]
    fn test_guard_band_discards_transition_frames() {
        let clock = Clock(Instant::now());
        let mut annotator = annotator();
        annotator.command_started(clock.command(0, 100, None));
        for (seq, ms) in [(0, 120), (1, 139), (2, 140), (3, 300), (4, 360), (5, 361)] {
            annotator.push_frame(clock.frame(seq, ms));
        }
        annotator.command_ended(clock.command(0, 100, Some(400)));

        assert_eq!(drained(&mut annotator), vec![(2, 0), (3, 0), (4, 0)]);
        let stats = annotator.stats();
        assert_eq!(stats.in_guard, 3);
        assert_eq!(stats.annotated, 3);
    }

    #[test]
    fn test_frames_before_program_are_discarded() {
        let clock = Clock(Instant::now());
        let mut annotator = annotator();
        annotator.push_frame(clock.frame(0, 10));
        annotator.push_frame(clock.frame(1, 50));
        annotator.command_started(clock.command(0, 100, None));

        assert!(drained(&mut annotator).is_empty());
        assert_eq!(annotator.pending(), 0);
        assert_eq!(annotator.stats().uncovered, 2);
    }

    #[test]
    fn test_gap_between_steps_is_discarded() {
        let clock = Clock(Instant::now());
        let mut annotator = annotator();
        annotator.command_started(clock.command(0, 0, None));
        annotator.push_frame(clock.frame(0, 100));
        annotator.command_ended(clock.command(0, 0, Some(200)));
        // Hardware latency: next window opens 30 ms after the request.
        annotator.push_frame(clock.frame(1, 215));
        annotator.command_started(clock.command(1, 230, None));
        annotator.push_frame(clock.frame(2, 300));
        annotator.command_ended(clock.command(1, 230, Some(500)));

        assert_eq!(drained(&mut annotator), vec![(0, 0), (2, 1)]);
        assert_eq!(annotator.stats().uncovered, 1);
    }

    #[test]
    fn test_frame_ahead_of_started_event_waits() {
        let clock = Clock(Instant::now());
        let mut annotator = annotator();
        annotator.command_started(clock.command(0, 0, None));
        annotator.command_ended(clock.command(0, 0, Some(200)));
        annotator.push_frame(clock.frame(0, 300));
        assert_eq!(annotator.pending(), 1);

        annotator.command_started(clock.command(1, 210, None));
        annotator.command_ended(clock.command(1, 210, Some(500)));

        assert_eq!(drained(&mut annotator), vec![(0, 1)]);
    }

    #[test]
    fn test_completion_flushes_leftovers() {
        let clock = Clock(Instant::now());
        let mut annotator = annotator();
        annotator.command_started(clock.command(0, 0, None));
        annotator.command_ended(clock.command(0, 0, Some(200)));
        annotator.push_frame(clock.frame(0, 250));
        annotator.program_completed();

        assert!(drained(&mut annotator).is_empty());
        assert_eq!(annotator.pending(), 0);
    }

    #[test]
    fn test_pending_is_bounded() {
        let clock = Clock(Instant::now());
        let mut annotator = annotator();
        annotator.command_started(clock.command(0, 0, None));
        for seq in 0..12 {
            annotator.push_frame(clock.frame(seq, 50 + seq * 10));
        }
        annotator.command_ended(clock.command(0, 0, Some(1000)));

        let seqs: Vec<u64> = drained(&mut annotator).into_iter().map(|(s, _)| s).collect();
        assert_eq!(seqs, (4..12).collect::<Vec<_>>());
        assert_eq!(annotator.stats().evicted, 4);
    }

    #[test]
    fn test_annotated_windows_never_overlap() {
        let clock = Clock(Instant::now());
        let mut annotator = annotator();
        let mut seq = 0;
        for step in 0..4u64 {
            let start = step * 200 + 5;
            annotator.command_started(clock.command(step as usize, start, None));
            for ms in (start..start + 195).step_by(20) {
                annotator.push_frame(clock.frame(seq, ms));
                seq += 1;
            }
            annotator.command_ended(clock.command(step as usize, start, Some(start + 195)));
        }
        annotator.program_completed();

        let annotated: Vec<AnnotatedFrame> = annotator.drain().collect();
        assert!(!annotated.is_empty());
        for pair in annotated.windows(2) {
            assert!(pair[0].frame.seq < pair[1].frame.seq);
            let (a, b) = (&pair[0].command, &pair[1].command);
            assert!(a.step == b.step || !a.overlaps(b));
        }
        for frame in &annotated {
            assert!(frame.command.contains(frame.frame.captured_at));
        }
    }

    #[test]
    fn test_out_of_order_frame_is_dropped() {
        let clock = Clock(Instant::now());
        let mut annotator = annotator();
        annotator.command_started(clock.command(0, 0, None));
        annotator.push_frame(clock.frame(5, 100));
        annotator.push_frame(clock.frame(3, 110));

        assert_eq!(annotator.pending(), 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let clock = Clock(Instant::now());
        let mut annotator = annotator();
        annotator.command_started(clock.command(0, 0, None));
        annotator.push_frame(clock.frame(0, 100));
        annotator.reset();

        assert_eq!(annotator.pending(), 0);
        assert_eq!(annotator.stats(), AnnotatorStats::default());
        annotator.push_frame(clock.frame(0, 100));
        assert_eq!(annotator.pending(), 1);
    }
}

// SPDX-License-Identifier: MPL-2.0

//! Playback clock.
//!
//! Wall-clock time since start maps to a target frame index. Each tick
//! decodes toward that target, skipping at most [`MAX_SKIP`] frames; when it
//! is still far behind afterwards the clock is moved instead.

use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::ring::FrameRing;
use crate::video::{DecodeError, Decoder};

/// Frames decoded per tick at most.
pub const MAX_SKIP: u32 = 5;
/// Shortfall beyond which the clock is reset instead of catching up.
pub const RESET_THRESHOLD: i64 = MAX_SKIP as i64 * 2;

const STARTUP_POLL: Duration = Duration::from_millis(16);
const MAX_POLL: Duration = Duration::from_millis(100);

/// Produces decoded frames in presentation order.
pub trait FrameSource {
    /// Decode the next frame into `frame`. `Ok(false)` at end of stream.
    fn next_frame(
        &mut self,
        frame: &mut Frame,
        ring: &mut FrameRing,
        want_cpu_copy: bool,
    ) -> Result<bool, DecodeError>;

    fn seek_to_start(&mut self) -> Result<(), DecodeError>;

    /// Surfaces exported so far must not be reused.
    fn invalidate_surfaces(&mut self);

    /// Whether exported surfaces could be drawn.
    fn set_export_result(&mut self, works: bool);
}

impl FrameSource for Decoder {
    fn next_frame(
        &mut self,
        frame: &mut Frame,
        ring: &mut FrameRing,
        want_cpu_copy: bool,
    ) -> Result<bool, DecodeError> {
        self.next(frame, ring, want_cpu_copy)
    }

    fn seek_to_start(&mut self) -> Result<(), DecodeError> {
        Decoder::seek_to_start(self)
    }

    fn invalidate_surfaces(&mut self) {
        Decoder::invalidate_surfaces(self);
    }

    fn set_export_result(&mut self, works: bool) {
        Decoder::set_export_result(self, works);
    }
}

/// Outcome of one [`Scheduler::advance`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    /// Frames decoded, the displayed one included.
    pub decoded: u32,
    pub skipped: u32,
    /// The stream wrapped around; cached images are stale.
    pub looped: bool,
    pub clock_reset: bool,
    /// End of stream without looping.
    pub finished: bool,
}

impl Advance {
    /// A new frame is ready for display.
    pub fn has_new_frame(&self) -> bool {
        self.decoded > 0
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub decoded: u64,
    pub skipped: u64,
    pub loops: u64,
    pub clock_resets: u64,
}

#[derive(Debug)]
pub struct Scheduler {
    start: Option<Instant>,
    frame_duration: Duration,
    displayed: i64,
    looping: bool,
    stats: Stats,
}

impl Scheduler {
    pub fn new(frame_duration: Duration, looping: bool) -> Self {
        Self {
            start: None,
            frame_duration,
            displayed: -1,
            looping,
            stats: Stats::default(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.start.is_some()
    }

    /// Start the clock. Does nothing once running.
    pub fn start(&mut self, now: Instant) {
        if self.start.is_none() {
            self.start = Some(now);
            self.displayed = -1;
        }
    }

    pub fn displayed(&self) -> i64 {
        self.displayed
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Frame index due at `now`.
    pub fn target(&self, now: Instant) -> i64 {
        let Some(start) = self.start else {
            return -1;
        };
        let elapsed = now.saturating_duration_since(start).as_nanos();
        let frames = elapsed / self.frame_duration.as_nanos().max(1);
        i64::try_from(frames).unwrap_or(i64::MAX)
    }

    /// Time from the clock start until frame `index` is due.
    fn offset(&self, index: i64) -> Duration {
        let index = u128::try_from(index).unwrap_or(0);
        let nanos = self.frame_duration.as_nanos().saturating_mul(index);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Decode toward the frame due at `now`.
    ///
    /// `frame` is released before the first decode and after every skipped
    /// one, so at most one surface is held when this returns.
    pub fn advance<S: FrameSource>(
        &mut self,
        source: &mut S,
        frame: &mut Frame,
        ring: &mut FrameRing,
        want_cpu_copy: bool,
        now: Instant,
    ) -> Result<Advance, DecodeError> {
        let mut outcome = Advance::default();
        if self.start.is_none() {
            return Ok(outcome);
        }

        let mut target = self.target(now);
        if target <= self.displayed {
            return Ok(outcome);
        }

        frame.release();

        let mut since_seek = None;
        while self.displayed < target && outcome.decoded < MAX_SKIP {
            if !source.next_frame(frame, ring, want_cpu_copy)? {
                if !self.looping || since_seek == Some(0) {
                    if since_seek == Some(0) {
                        tracing::warn!("Stream has no frames after seeking to start");
                    }
                    outcome.finished = true;
                    break;
                }

                source.seek_to_start()?;
                since_seek = Some(0);
                outcome.looped = true;
                self.stats.loops += 1;
                self.start = Some(now);
                self.displayed = -1;
                target = 0;
                tracing::debug!(loops = self.stats.loops, "Looped");
                continue;
            }

            self.displayed += 1;
            outcome.decoded += 1;
            self.stats.decoded += 1;
            if let Some(count) = since_seek.as_mut() {
                *count += 1;
            }

            if self.displayed >= target {
                break;
            }

            frame.release();
            outcome.skipped += 1;
            self.stats.skipped += 1;
        }

        if target - self.displayed > RESET_THRESHOLD {
            tracing::warn!(
                target,
                displayed = self.displayed,
                "Decode too slow, resetting clock"
            );
            let behind = self.offset(self.displayed);
            self.start = now.checked_sub(behind).or(self.start);
            outcome.clock_reset = true;
            self.stats.clock_resets += 1;
        }

        Ok(outcome)
    }

    /// How long the loop may sleep waiting for events.
    pub fn poll_timeout(&self, now: Instant, any_ready: bool) -> Duration {
        let Some(start) = self.start else {
            return STARTUP_POLL;
        };
        if !any_ready {
            return MAX_POLL;
        }

        let deadline = start + self.offset(self.displayed + 1);
        deadline.saturating_duration_since(now).min(MAX_POLL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmabuf::{DmaBufFormat, DmaBufPlane};
    use crate::frame::{GpuSurface, Payload};
    use drm_fourcc::DrmFourcc;
    use std::os::fd::OwnedFd;

    const FRAME: Duration = Duration::from_micros(31_250);

    /// Hands out surface frames and checks nothing is still held on entry.
    struct Script {
        frames: u64,
        position: u64,
        seeks: u32,
        fail_seek: bool,
        held_on_entry: u32,
    }

    impl Script {
        fn new(frames: u64) -> Self {
            Self {
                frames,
                position: 0,
                seeks: 0,
                fail_seek: false,
                held_on_entry: 0,
            }
        }
    }

    impl FrameSource for Script {
        fn next_frame(
            &mut self,
            frame: &mut Frame,
            _: &mut FrameRing,
            _: bool,
        ) -> Result<bool, DecodeError> {
            if frame.surface().is_some() {
                self.held_on_entry += 1;
            }
            if self.position >= self.frames {
                return Ok(false);
            }

            frame.pts = self.position as f64 * FRAME.as_secs_f64();
            frame.payload = Payload::Surface {
                surface: GpuSurface {
                    identity: self.position % 4,
                    generation: u64::from(self.seeks),
                    format: DmaBufFormat::linear(DrmFourcc::Nv12),
                    planes: vec![DmaBufPlane {
                        fd: OwnedFd::from(std::fs::File::open("/dev/null").unwrap()),
                        offset: 0,
                        stride: 64,
                        modifier: 0,
                    }],
                    keepalive: None,
                },
                cpu: None,
            };
            self.position += 1;
            Ok(true)
        }

        fn seek_to_start(&mut self) -> Result<(), DecodeError> {
            if self.fail_seek {
                return Err(DecodeError::Sample("seek"));
            }
            self.seeks += 1;
            self.position = 0;
            Ok(())
        }

        fn invalidate_surfaces(&mut self) {}

        fn set_export_result(&mut self, _: bool) {}
    }

    struct Rig {
        scheduler: Scheduler,
        source: Script,
        frame: Frame,
        ring: FrameRing,
        t0: Instant,
    }

    impl Rig {
        fn new(frames: u64, looping: bool) -> Self {
            Self::with_frame_duration(frames, looping, FRAME)
        }

        fn with_frame_duration(frames: u64, looping: bool, frame_duration: Duration) -> Self {
            let t0 = Instant::now();
            let mut scheduler = Scheduler::new(frame_duration, looping);
            scheduler.start(t0);
            Self {
                scheduler,
                source: Script::new(frames),
                frame: Frame::default(),
                ring: FrameRing::new(16, 16),
                t0,
            }
        }

        fn tick(&mut self, at: Duration) -> Result<Advance, DecodeError> {
            self.scheduler.advance(
                &mut self.source,
                &mut self.frame,
                &mut self.ring,
                true,
                self.t0 + at,
            )
        }
    }

    #[test]
    fn test_nothing_happens_before_start() {
        let mut scheduler = Scheduler::new(FRAME, true);
        let mut source = Script::new(10);
        let mut frame = Frame::default();
        let mut ring = FrameRing::new(16, 16);

        let outcome = scheduler
            .advance(&mut source, &mut frame, &mut ring, true, Instant::now())
            .unwrap();
        assert_eq!(outcome, Advance::default());
        assert_eq!(source.position, 0);
    }

    #[test]
    fn test_first_tick_shows_frame_zero() {
        let mut rig = Rig::new(10, true);
        let outcome = rig.tick(Duration::ZERO).unwrap();
        assert_eq!(outcome.decoded, 1);
        assert_eq!(rig.scheduler.displayed(), 0);
        assert!(rig.frame.surface().is_some());

        // same frame still due
        let outcome = rig.tick(Duration::from_millis(20)).unwrap();
        assert!(!outcome.has_new_frame());
        assert_eq!(rig.source.position, 1);
    }

    #[test]
    fn test_stall_skips_at_most_five() {
        let mut rig = Rig::new(100, true);
        rig.tick(Duration::ZERO).unwrap();

        // 300ms stall: target 9
        let outcome = rig.tick(Duration::from_millis(300)).unwrap();
        assert_eq!(outcome.decoded, MAX_SKIP);
        assert_eq!(outcome.skipped, MAX_SKIP - 1);
        assert!(!outcome.clock_reset);
        assert_eq!(rig.scheduler.displayed(), 5);
        assert_eq!(rig.source.held_on_entry, 0);
    }

    #[test]
    fn test_far_behind_resets_clock() {
        let mut rig = Rig::new(1000, true);
        rig.tick(Duration::ZERO).unwrap();

        let at = Duration::from_secs(2);
        let outcome = rig.tick(at).unwrap();
        assert!(outcome.clock_reset);
        assert_eq!(rig.scheduler.displayed(), 5);
        // target now equals what is displayed
        assert_eq!(rig.scheduler.target(rig.t0 + at), 5);
    }

    #[test]
    fn test_clock_reset_lands_on_displayed_frame() {
        // 30, 30000/1001, 60 and 24000/1001 fps
        let durations = [
            Duration::from_nanos(33_333_333),
            Duration::from_nanos(33_366_667),
            Duration::from_nanos(16_666_667),
            Duration::from_nanos(41_708_333),
        ];

        for frame_duration in durations {
            let mut rig = Rig::with_frame_duration(100_000, true, frame_duration);
            rig.tick(Duration::ZERO).unwrap();

            let mut resets = 0;
            for i in 1..=200u32 {
                let at = Duration::from_secs(1) * i + Duration::from_micros(137) * i;
                let outcome = rig.tick(at).unwrap();
                if !outcome.clock_reset {
                    continue;
                }
                resets += 1;

                let now = rig.t0 + at;
                let displayed = rig.scheduler.displayed();
                assert_eq!(
                    rig.scheduler.target(now),
                    displayed,
                    "{frame_duration:?} at {at:?}"
                );
                assert_eq!(rig.scheduler.target(now + frame_duration), displayed + 1);
            }
            // every tick falls far behind
            assert_eq!(resets, 200, "{frame_duration:?}");
        }
    }

    #[test]
    fn test_target_counts_whole_frames() {
        let t0 = Instant::now();
        let frame_duration = Duration::from_nanos(33_333_333);
        let mut scheduler = Scheduler::new(frame_duration, true);
        assert_eq!(scheduler.target(t0), -1);

        scheduler.start(t0);
        assert_eq!(scheduler.target(t0), 0);
        assert_eq!(scheduler.target(t0 + frame_duration * 30 - Duration::from_nanos(1)), 29);
        assert_eq!(scheduler.target(t0 + frame_duration * 30), 30);
        assert_eq!(scheduler.offset(30), frame_duration * 30);
        assert_eq!(scheduler.offset(-1), Duration::ZERO);
    }

    #[test]
    fn test_displayed_index_never_goes_back() {
        let mut rig = Rig::new(1000, true);
        let mut last = -1;
        for ms in (0..3000).step_by(7) {
            rig.tick(Duration::from_millis(ms)).unwrap();
            assert!(rig.scheduler.displayed() >= last);
            last = rig.scheduler.displayed();
        }
        assert_eq!(rig.source.held_on_entry, 0);
    }

    #[test]
    fn test_end_of_stream_loops() {
        let mut rig = Rig::new(3, true);
        for i in 0..3 {
            rig.tick(FRAME * i).unwrap();
        }
        assert_eq!(rig.scheduler.displayed(), 2);

        let at = FRAME * 3;
        let outcome = rig.tick(at).unwrap();
        assert!(outcome.looped);
        assert_eq!(rig.source.seeks, 1);
        assert_eq!(rig.scheduler.displayed(), 0);
        assert_eq!(rig.scheduler.target(rig.t0 + at), 0);
        assert_eq!(rig.scheduler.stats().loops, 1);
    }

    #[test]
    fn test_end_of_stream_without_loop_finishes() {
        let mut rig = Rig::new(1, false);
        rig.tick(Duration::ZERO).unwrap();
        let outcome = rig.tick(FRAME).unwrap();
        assert!(outcome.finished);
        assert_eq!(rig.source.seeks, 0);
        assert!(rig.frame.surface().is_none());
    }

    #[test]
    fn test_empty_stream_does_not_spin() {
        let mut rig = Rig::new(0, true);
        let outcome = rig.tick(Duration::ZERO).unwrap();
        assert!(outcome.finished);
        assert_eq!(rig.source.seeks, 1);
    }

    #[test]
    fn test_seek_failure_is_an_error() {
        let mut rig = Rig::new(1, true);
        rig.source.fail_seek = true;
        rig.tick(Duration::ZERO).unwrap();
        assert!(rig.tick(FRAME).is_err());
    }

    #[test]
    fn test_poll_timeout() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new(FRAME, true);
        assert_eq!(scheduler.poll_timeout(t0, true), STARTUP_POLL);

        scheduler.start(t0);
        assert_eq!(scheduler.poll_timeout(t0, false), MAX_POLL);
        // frame 0 is due right away
        assert_eq!(scheduler.poll_timeout(t0, true), Duration::ZERO);

        let slow = Scheduler {
            start: Some(t0),
            frame_duration: Duration::from_secs(1),
            displayed: 0,
            looping: true,
            stats: Stats::default(),
        };
        assert_eq!(slow.poll_timeout(t0, true), MAX_POLL);
    }
}

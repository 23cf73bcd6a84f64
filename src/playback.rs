// SPDX-License-Identifier: MPL-2.0

//! One turn of the main loop, after compositor events were dispatched.
//!
//! The loop owns the Wayland objects. [`Playback`] owns the clock, the
//! displayed frame and the render path, and decides which screens get drawn.
//! Graphics sit behind [`Painter`], the decoder behind [`FrameSource`].

use std::time::{Duration, Instant};

use cosmic_bg_video_config::ScaleMode;
use tracing::{error, info, trace, warn};

use crate::frame::Frame;
use crate::output::Screen;
use crate::render::{DrawPath, PathLock, RenderError};
use crate::ring::FrameRing;
use crate::scheduler::{FrameSource, Scheduler, Stats};
use crate::video::{DecodeError, GpuVendor};

/// Draws frames onto per-output targets.
pub trait Painter {
    type Target;

    /// Ask for a frame callback on `target`. Comes before the draw that
    /// commits it.
    fn request_frame(&mut self, target: &Self::Target);

    fn paint(
        &mut self,
        target: &Self::Target,
        frame: &Frame,
        ring: &FrameRing,
        scale: ScaleMode,
        try_zero_copy: bool,
    ) -> Result<DrawPath, RenderError>;

    /// Destroy every imported image.
    fn clear_cache(&mut self);
}

/// Outcome of one [`Playback::tick`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Screens a frame went to.
    pub drawn: u32,
    pub looped: bool,
    /// End of stream without looping.
    pub finished: bool,
    /// The graphics context is gone and [`Playback::reset`] has to run.
    pub context_lost: bool,
}

pub struct Playback {
    scheduler: Scheduler,
    frame: Frame,
    ring: FrameRing,
    path: PathLock,
    decode_vendor: GpuVendor,
    /// Bumped whenever what belongs on screen changes.
    serial: u64,
}

impl Playback {
    pub fn new(scheduler: Scheduler, ring: FrameRing, decode_vendor: GpuVendor) -> Self {
        Self {
            scheduler,
            frame: Frame::default(),
            ring,
            path: PathLock::default(),
            decode_vendor,
            serial: 0,
        }
    }

    pub fn stats(&self) -> Stats {
        self.scheduler.stats()
    }

    pub fn path(&self) -> PathLock {
        self.path
    }

    /// Draw every screen again, e.g. after the scale mode changed.
    pub fn redraw(&mut self) {
        self.serial += 1;
    }

    pub fn poll_timeout(&self, now: Instant, any_drawable: bool) -> Duration {
        self.scheduler.poll_timeout(now, any_drawable)
    }

    /// Close the displayed frame's surface descriptors.
    pub fn release_frame(&mut self) {
        self.frame.release();
    }

    /// Advance the clock and draw the due frame on every ready screen that
    /// doesn't show it yet.
    ///
    /// Nothing is decoded until some screen can be drawn on. A screen whose
    /// draw fails is sent to be recreated; the others carry on.
    pub fn tick<'a, S, P>(
        &mut self,
        source: &mut S,
        painter: &mut P,
        screens: impl IntoIterator<Item = &'a mut Screen<P::Target>>,
        scale: ScaleMode,
        now: Instant,
    ) -> Result<Tick, DecodeError>
    where
        S: FrameSource,
        P: Painter,
        P::Target: 'a,
    {
        let mut screens: Vec<_> = screens.into_iter().collect();
        let mut outcome = Tick::default();

        if !screens.iter().any(|screen| screen.is_drawable()) {
            return Ok(outcome);
        }
        if !self.scheduler.is_started() {
            info!("Playback started");
            self.scheduler.start(now);
        }

        let want_cpu_copy = self.path.wants_cpu_copy(self.decode_vendor);
        let advance = self.scheduler.advance(
            source,
            &mut self.frame,
            &mut self.ring,
            want_cpu_copy,
            now,
        )?;

        if advance.looped {
            painter.clear_cache();
            outcome.looped = true;
        }
        if advance.finished {
            outcome.finished = true;
            return Ok(outcome);
        }
        if advance.has_new_frame() {
            self.serial += 1;
        }
        if self.frame.is_empty() {
            return Ok(outcome);
        }

        for screen in &mut screens {
            if !screen.lifecycle.is_ready() || screen.shown == Some(self.serial) {
                continue;
            }
            let Some(gfx) = screen.gfx.as_ref() else {
                continue;
            };

            painter.request_frame(gfx);
            let try_zero_copy = self.path.try_zero_copy();
            match painter.paint(gfx, &self.frame, &self.ring, scale, try_zero_copy) {
                Ok(drawn) => {
                    // only a committed frame gets its callback
                    screen.lifecycle.frame_requested();
                    screen.shown = Some(self.serial);
                    screen.frames_rendered += 1;
                    outcome.drawn += 1;
                    trace!(output = %screen.name, ?drawn, pts = self.frame.pts, "Drew frame");

                    let had_surface = self.frame.surface().is_some();
                    if let Some(works) = self.path.record(had_surface, try_zero_copy, drawn) {
                        source.set_export_result(works);
                    }
                }
                Err(why) if why.is_context_lost() => {
                    error!(output = %screen.name, %why, "Graphics context lost");
                    outcome.context_lost = true;
                    break;
                }
                Err(why) => {
                    warn!(output = %screen.name, %why, "Render failed, recreating surface");
                    screen.drop_gfx();
                    screen.lifecycle.surface_failed();
                }
            }
        }

        Ok(outcome)
    }

    /// Throw away everything tied to the graphics context and build a new
    /// one with `rebuild`.
    ///
    /// Imported images go with the old painter, the render path is decided
    /// again and the source's exported surfaces turn stale. Screens lose
    /// their graphics surface and wait for the loop to attach a new one.
    pub fn reset<'a, S, P, T, E>(
        &mut self,
        source: &mut S,
        painter: &mut Option<P>,
        screens: impl IntoIterator<Item = &'a mut Screen<T>>,
        rebuild: impl FnOnce() -> Result<P, E>,
    ) -> Result<(), E>
    where
        S: FrameSource,
        T: 'a,
    {
        info!("Resetting renderer");
        self.frame.release();
        for screen in screens {
            screen.drop_gfx();
            screen.lifecycle.reset_pending_callback();
            screen.redraw();
        }

        *painter = None;
        *painter = Some(rebuild()?);

        source.invalidate_surfaces();
        self.path = PathLock::default();
        self.serial += 1;
        Ok(())
    }
}

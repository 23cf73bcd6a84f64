// SPDX-License-Identifier: MPL-2.0

//! Per-output surface lifecycle.
//!
//! ```text
//! UNCONFIGURED --configure--> READY <--presented-- WAITING_CALLBACK
//!                               |  \--frame requested--^
//!                             closed
//!                               v
//!                        PENDING_DESTROY --layer dropped--> PENDING_RECREATE
//!                                                              |
//!                          UNCONFIGURED <--new layer surface---+--too many failures--> DEFUNCT
//! ```
//!
//! The compositor's callbacks only move the state; resources are created and
//! dropped from the main loop.

use std::fmt;
use std::time::{Duration, Instant};

use cosmic_bg_video_config as config;
use sctk::output::OutputInfo;
use sctk::reexports::client::protocol::wl_output::WlOutput;
use sctk::shell::wlr_layer::LayerSurface;

use crate::render::OutputSurface;

/// Consecutive failed recreations before an output is given up on.
pub const MAX_RECREATE_FAILURES: u32 = 10;

const RETRY_STEP: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputState {
    #[default]
    Unconfigured,
    Ready,
    WaitingCallback,
    PendingDestroy,
    PendingRecreate,
    Defunct,
}

impl OutputState {
    pub fn name(self) -> &'static str {
        match self {
            OutputState::Unconfigured => "UNCONFIGURED",
            OutputState::Ready => "READY",
            OutputState::WaitingCallback => "WAITING_CALLBACK",
            OutputState::PendingDestroy => "PENDING_DESTROY",
            OutputState::PendingRecreate => "PENDING_RECREATE",
            OutputState::Defunct => "DEFUNCT",
        }
    }

    /// Being torn down, rebuilt, or abandoned.
    fn is_going_away(self) -> bool {
        matches!(
            self,
            OutputState::PendingDestroy | OutputState::PendingRecreate | OutputState::Defunct
        )
    }
}

impl fmt::Display for OutputState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a configure event amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Configured {
    /// The surface just became drawable.
    First,
    Resized,
    Unchanged,
    Ignored,
}

#[derive(Debug, Default)]
pub struct Lifecycle {
    state: OutputState,
    size: Option<(u32, u32)>,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Lifecycle {
    pub fn state(&self) -> OutputState {
        self.state
    }

    /// Last configured logical size.
    pub fn size(&self) -> Option<(u32, u32)> {
        self.size
    }

    pub fn is_ready(&self) -> bool {
        self.state == OutputState::Ready
    }

    /// Configured and not being torn down.
    pub fn is_live(&self) -> bool {
        matches!(self.state, OutputState::Ready | OutputState::WaitingCallback)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn configure(&mut self, width: u32, height: u32) -> Configured {
        if self.state.is_going_away() || width == 0 || height == 0 {
            return Configured::Ignored;
        }

        let size = Some((width, height));
        if self.state == OutputState::Unconfigured {
            self.size = size;
            self.state = OutputState::Ready;
            self.failures = 0;
            self.retry_at = None;
            return Configured::First;
        }

        if self.size == size {
            return Configured::Unchanged;
        }
        self.size = size;
        Configured::Resized
    }

    /// The compositor revoked the surface. Returns whether this changed
    /// anything; repeated revokes are no-ops.
    pub fn closed(&mut self) -> bool {
        if self.state.is_going_away() {
            return false;
        }
        self.state = OutputState::PendingDestroy;
        true
    }

    /// Drawing to the graphics surface failed.
    pub fn surface_failed(&mut self) {
        if !self.state.is_going_away() {
            self.state = OutputState::PendingDestroy;
        }
    }

    pub fn frame_requested(&mut self) {
        if self.state == OutputState::Ready {
            self.state = OutputState::WaitingCallback;
        }
    }

    /// Forget an outstanding frame callback. Its commit never reached the
    /// compositor, e.g. because the graphics context was lost mid-draw.
    pub fn reset_pending_callback(&mut self) {
        if self.state == OutputState::WaitingCallback {
            self.state = OutputState::Ready;
        }
    }

    /// A frame callback fired. Callbacks outliving their surface are ignored.
    pub fn presented(&mut self) -> bool {
        if self.state == OutputState::WaitingCallback {
            self.state = OutputState::Ready;
            true
        } else {
            false
        }
    }

    /// The layer surface is gone.
    pub fn platform_destroyed(&mut self) {
        if self.state != OutputState::Defunct {
            self.state = OutputState::PendingRecreate;
        }
    }

    /// Waiting to be rebuilt and the backoff has passed.
    pub fn recreate_due(&self, now: Instant) -> bool {
        self.state == OutputState::PendingRecreate && self.retry_at.is_none_or(|at| now >= at)
    }

    /// A new layer surface exists and awaits its first configure.
    pub fn recreated(&mut self) {
        if self.state != OutputState::Defunct {
            self.state = OutputState::Unconfigured;
            self.size = None;
        }
    }

    /// Record a failed (re)creation. Returns `true` when the output is now
    /// defunct.
    pub fn recreate_failed(&mut self, now: Instant, alive: bool) -> bool {
        if self.state == OutputState::Defunct {
            return true;
        }

        self.failures += 1;
        if !alive || self.failures >= MAX_RECREATE_FAILURES {
            self.state = OutputState::Defunct;
            self.retry_at = None;
            return true;
        }

        self.state = OutputState::PendingRecreate;
        self.retry_at = Some(now + backoff(self.failures));
        false
    }
}

/// Wait before the next attempt after `failures` failures.
pub fn backoff(failures: u32) -> Duration {
    RETRY_STEP.saturating_mul(failures).min(RETRY_CAP)
}

/// What playback needs to know about an output: where it stands in the
/// lifecycle, its graphics surface, and what was last shown on it.
#[derive(Debug)]
pub struct Screen<T> {
    pub name: String,
    pub lifecycle: Lifecycle,
    pub gfx: Option<T>,
    /// Serial of the frame last presented here.
    pub shown: Option<u64>,
    pub frames_rendered: u64,
}

impl<T> Default for Screen<T> {
    fn default() -> Self {
        Self {
            name: String::new(),
            lifecycle: Lifecycle::default(),
            gfx: None,
            shown: None,
            frames_rendered: 0,
        }
    }
}

impl<T> Screen<T> {
    /// Ready for a frame and backed by a graphics surface.
    pub fn is_drawable(&self) -> bool {
        self.lifecycle.is_ready() && self.gfx.is_some()
    }

    pub fn drop_gfx(&mut self) {
        self.gfx = None;
    }

    /// Draw again even if the frame didn't change.
    pub fn redraw(&mut self) {
        self.shown = None;
    }
}

/// A display announced by the compositor.
pub struct Output {
    pub wl_output: WlOutput,
    /// Current mode in pixels.
    pub mode_size: Option<(u32, u32)>,
    pub scale: i32,
    // the EGL surface must drop before the layer surface it renders to
    pub screen: Screen<OutputSurface>,
    pub layer: Option<LayerSurface>,
}

impl Output {
    pub fn new(wl_output: WlOutput) -> Self {
        Self {
            wl_output,
            mode_size: None,
            scale: 1,
            screen: Screen::default(),
            layer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.screen.name
    }

    pub fn update(&mut self, info: &OutputInfo) {
        self.screen.name = info.name.clone().unwrap_or_default();
        self.mode_size = info
            .modes
            .iter()
            .find(|mode| mode.current)
            .map(|mode| (mode.dimensions.0.max(0) as u32, mode.dimensions.1.max(0) as u32));
        self.scale = info.scale_factor.max(1);
    }

    pub fn matches(&self, filter: &config::Output) -> bool {
        !self.screen.name.is_empty() && filter.matches(&self.screen.name)
    }

    /// Whether the output can carry a layer surface at all.
    pub fn can_host(&self, filter: &config::Output) -> bool {
        self.matches(filter) && self.mode_size.is_some_and(|(w, h)| w > 0 && h > 0)
    }

    /// Needs a layer surface created: never had one, or is due a rebuild.
    pub fn wants_layer(&self, now: Instant) -> bool {
        let lifecycle = &self.screen.lifecycle;
        match lifecycle.state() {
            OutputState::Unconfigured => self.layer.is_none(),
            OutputState::PendingRecreate => lifecycle.recreate_due(now),
            _ => false,
        }
    }

    /// Buffer size in pixels for the configured logical size.
    pub fn buffer_size(&self) -> Option<(u32, u32)> {
        let scale = self.scale.max(1) as u32;
        self.screen
            .lifecycle
            .size()
            .map(|(w, h)| (w.saturating_mul(scale), h.saturating_mul(scale)))
    }

    /// Drop both surfaces, graphics first.
    pub fn drop_surfaces(&mut self) {
        self.screen.drop_gfx();
        self.layer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> Lifecycle {
        let mut lifecycle = Lifecycle::default();
        assert_eq!(lifecycle.configure(1920, 1080), Configured::First);
        lifecycle
    }

    #[test]
    fn test_first_configure_makes_ready() {
        let lifecycle = ready();
        assert!(lifecycle.is_ready());
        assert_eq!(lifecycle.size(), Some((1920, 1080)));
    }

    #[test]
    fn test_duplicate_configure_is_a_no_op() {
        let mut lifecycle = ready();
        assert_eq!(lifecycle.configure(1920, 1080), Configured::Unchanged);
        assert_eq!(lifecycle.state(), OutputState::Ready);

        lifecycle.frame_requested();
        assert_eq!(lifecycle.configure(1920, 1080), Configured::Unchanged);
        assert_eq!(lifecycle.state(), OutputState::WaitingCallback);
    }

    #[test]
    fn test_resize_keeps_state() {
        let mut lifecycle = ready();
        lifecycle.frame_requested();
        assert_eq!(lifecycle.configure(2560, 1440), Configured::Resized);
        assert_eq!(lifecycle.state(), OutputState::WaitingCallback);
        assert_eq!(lifecycle.size(), Some((2560, 1440)));
    }

    #[test]
    fn test_zero_size_configure_ignored() {
        let mut lifecycle = Lifecycle::default();
        assert_eq!(lifecycle.configure(0, 1080), Configured::Ignored);
        assert_eq!(lifecycle.state(), OutputState::Unconfigured);
    }

    #[test]
    fn test_frame_callback_round_trip() {
        let mut lifecycle = ready();
        lifecycle.frame_requested();
        assert!(!lifecycle.is_ready());
        assert!(lifecycle.is_live());
        assert!(lifecycle.presented());
        assert!(lifecycle.is_ready());
    }

    #[test]
    fn test_orphan_callback_ignored() {
        let mut lifecycle = ready();
        lifecycle.frame_requested();
        assert!(lifecycle.closed());
        assert!(!lifecycle.presented());
        assert_eq!(lifecycle.state(), OutputState::PendingDestroy);
    }

    #[test]
    fn test_revoke_is_idempotent() {
        let mut lifecycle = ready();
        assert!(lifecycle.closed());
        assert!(!lifecycle.closed());

        lifecycle.platform_destroyed();
        assert!(!lifecycle.closed());
        assert_eq!(lifecycle.state(), OutputState::PendingRecreate);
        assert_eq!(lifecycle.configure(1920, 1080), Configured::Ignored);
    }

    #[test]
    fn test_revoke_and_recreate() {
        let now = Instant::now();
        let mut lifecycle = ready();

        lifecycle.closed();
        assert!(!lifecycle.recreate_due(now));
        lifecycle.platform_destroyed();
        assert!(lifecycle.recreate_due(now));

        lifecycle.recreated();
        assert_eq!(lifecycle.state(), OutputState::Unconfigured);
        assert_eq!(lifecycle.size(), None);
        assert_eq!(lifecycle.configure(1920, 1080), Configured::First);
    }

    #[test]
    fn test_failed_recreation_backs_off() {
        let now = Instant::now();
        let mut lifecycle = ready();
        lifecycle.closed();
        lifecycle.platform_destroyed();

        assert!(!lifecycle.recreate_failed(now, true));
        assert!(!lifecycle.recreate_due(now));
        assert!(lifecycle.recreate_due(now + Duration::from_millis(500)));

        assert!(!lifecycle.recreate_failed(now, true));
        assert!(!lifecycle.recreate_due(now + Duration::from_millis(999)));
        assert!(lifecycle.recreate_due(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff(1), Duration::from_millis(500));
        assert_eq!(backoff(4), Duration::from_secs(2));
        assert_eq!(backoff(9), RETRY_CAP);
        assert_eq!(backoff(u32::MAX), RETRY_CAP);
    }

    #[test]
    fn test_defunct_after_repeated_failures() {
        let now = Instant::now();
        let mut lifecycle = ready();
        lifecycle.closed();
        lifecycle.platform_destroyed();

        for _ in 1..MAX_RECREATE_FAILURES {
            assert!(!lifecycle.recreate_failed(now, true));
        }
        assert!(lifecycle.recreate_failed(now, true));
        assert_eq!(lifecycle.state(), OutputState::Defunct);

        // terminal
        lifecycle.recreated();
        lifecycle.platform_destroyed();
        assert_eq!(lifecycle.configure(1920, 1080), Configured::Ignored);
        assert_eq!(lifecycle.state(), OutputState::Defunct);
    }

    #[test]
    fn test_dead_output_is_defunct_at_once() {
        let mut lifecycle = ready();
        lifecycle.closed();
        lifecycle.platform_destroyed();
        assert!(lifecycle.recreate_failed(Instant::now(), false));
        assert_eq!(lifecycle.state(), OutputState::Defunct);
    }

    #[test]
    fn test_successful_configure_resets_failures() {
        let now = Instant::now();
        let mut lifecycle = ready();
        lifecycle.closed();
        lifecycle.platform_destroyed();
        lifecycle.recreate_failed(now, true);
        assert_eq!(lifecycle.failures(), 1);

        lifecycle.recreated();
        lifecycle.configure(1920, 1080);
        assert_eq!(lifecycle.failures(), 0);
    }

    #[test]
    fn test_lost_callback_returns_to_ready() {
        let mut lifecycle = ready();
        lifecycle.frame_requested();
        lifecycle.reset_pending_callback();
        assert!(lifecycle.is_ready());
        // the stale callback may still fire later
        assert!(!lifecycle.presented());
        assert!(lifecycle.is_ready());

        lifecycle.closed();
        lifecycle.reset_pending_callback();
        assert_eq!(lifecycle.state(), OutputState::PendingDestroy);
    }

    #[test]
    fn test_screen_needs_ready_state_and_surface() {
        let mut screen = Screen::<()>::default();
        assert!(!screen.is_drawable());

        screen.lifecycle.configure(1920, 1080);
        assert!(!screen.is_drawable());
        screen.gfx = Some(());
        assert!(screen.is_drawable());

        screen.lifecycle.frame_requested();
        assert!(!screen.is_drawable());
        screen.lifecycle.presented();
        screen.drop_gfx();
        assert!(!screen.is_drawable());
    }

    #[test]
    fn test_surface_failure_goes_to_pending_destroy() {
        let mut lifecycle = ready();
        lifecycle.surface_failed();
        assert_eq!(lifecycle.state(), OutputState::PendingDestroy);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(OutputState::WaitingCallback.to_string(), "WAITING_CALLBACK");
        assert_eq!(OutputState::default().name(), "UNCONFIGURED");
    }
}

// SPDX-License-Identifier: MPL-2.0

mod cli;
mod dmabuf;
mod frame;
mod output;
mod playback;
mod render;
mod ring;
mod scheduler;
mod video;

use std::time::Instant;

use calloop::EventLoop;
use calloop::signals::{Signal, Signals};
use clap::Parser;
use cosmic_bg_video_config::{self as config, Config};
use cosmic_config::calloop::ConfigWatchSource;
use eyre::{WrapErr, bail};
use sctk::{
    compositor::{CompositorHandler, CompositorState},
    delegate_compositor, delegate_layer, delegate_output, delegate_registry,
    output::{OutputHandler, OutputState},
    reexports::{
        calloop_wayland_source::WaylandSource,
        client::{
            Connection, QueueHandle,
            globals::registry_queue_init,
            protocol::{wl_output, wl_surface},
        },
    },
    registry::{ProvidesRegistryState, RegistryState},
    registry_handlers,
    shell::{
        WaylandSurface,
        wlr_layer::{
            Anchor, KeyboardInteractivity, Layer, LayerShell, LayerShellHandler, LayerSurface,
            LayerSurfaceConfigure,
        },
    },
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::frame::Frame;
use crate::output::{Configured, Output};
use crate::playback::{Painter, Playback};
use crate::render::{DrawPath, OutputSurface, RenderError, Renderer};
use crate::ring::FrameRing;
use crate::scheduler::Scheduler;
use crate::video::{Decoder, DecoderOptions, GpuVendor, probe};

const NAMESPACE: &str = "cosmic-bg-video";

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);
    color_eyre::install()?;

    let config_helper = Config::helper()
        .inspect_err(|why| warn!(?why, "Settings unavailable, using defaults"))
        .ok();
    let mut config = cli.apply(config_helper.as_ref().map(Config::load).unwrap_or_default());
    info!(video = %cli.video.display(), output = %config.output, scale = %config.scale_mode, "cosmic-bg-video");

    let connection = Connection::connect_to_env().wrap_err("no Wayland compositor")?;
    let (globals, mut event_queue) = registry_queue_init(&connection)?;
    let qh = event_queue.handle();

    let renderer = Renderer::new(&connection).wrap_err("graphics initialization failed")?;
    check_device(&mut config, renderer.vendor());

    let decoder = Decoder::open(
        &cli.video,
        DecoderOptions {
            hw_accel: config.hw_accel,
            device: config.device.as_deref(),
            restricted: &config.restricted_decode,
        },
    )
    .wrap_err_with(|| format!("cannot play {}", cli.video.display()))?;

    let stream = decoder.info();
    info!(
        width = stream.width,
        height = stream.height,
        codec = %stream.codec,
        bit_depth = stream.bit_depth,
        fps = 1.0 / stream.frame_duration.as_secs_f64(),
        hardware = decoder.is_hardware(),
        "Stream opened"
    );
    let playback = Playback::new(
        Scheduler::new(stream.frame_duration, config.looping),
        FrameRing::new(stream.width, stream.height),
        decoder.vendor(),
    );

    let mut state = CosmicBgVideo {
        registry_state: RegistryState::new(&globals),
        output_state: OutputState::new(&globals, &qh),
        compositor_state: CompositorState::bind(&globals, &qh)?,
        layer_state: LayerShell::bind(&globals, &qh).wrap_err("layer shell unsupported")?,
        qh,
        connection: connection.clone(),
        outputs: Vec::new(),
        renderer: Some(renderer),
        decoder,
        playback,
        needs_reset: false,
        config,
        exit: false,
    };

    // outputs, then their names and modes
    event_queue.roundtrip(&mut state)?;
    event_queue.roundtrip(&mut state)?;

    if !state.outputs.iter().any(|output| output.can_host(&state.config.output)) {
        bail!("no output matches `{}`", state.config.output);
    }

    state.process_outputs(Instant::now());
    event_queue.roundtrip(&mut state)?;
    state.process_outputs(Instant::now());

    if !state.outputs.iter().any(|output| output.screen.gfx.is_some()) {
        bail!("no output could be rendered to");
    }

    let mut event_loop: EventLoop<CosmicBgVideo> = EventLoop::try_new()?;
    let handle = event_loop.handle();

    WaylandSource::new(connection, event_queue)
        .insert(handle.clone())
        .map_err(|why| eyre::Report::new(why.error))?;

    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])?;
    handle
        .insert_source(signals, |event, _, state| {
            info!(signal = ?event.signal(), "Shutting down");
            state.exit = true;
        })
        .map_err(|why| eyre::Report::new(why.error))?;

    if let Some(helper) = config_helper.as_ref() {
        match ConfigWatchSource::new(helper) {
            Ok(source) => {
                if let Err(why) = handle.insert_source(source, |(context, keys), _, state| {
                    if keys.iter().any(|key| key == config::SCALE_MODE_KEY) {
                        state.set_scale_mode(Config::load_scale_mode(&context));
                    }
                }) {
                    warn!(why = %why.error, "Settings changes won't be followed");
                }
            }
            Err(why) => warn!(?why, "Settings changes won't be followed"),
        }
    }

    let result = loop {
        let timeout = state.playback.poll_timeout(Instant::now(), state.any_ready());
        if let Err(why) = event_loop.dispatch(Some(timeout), &mut state) {
            break Err(eyre::Report::new(why).wrap_err("event loop failed"));
        }
        if state.exit {
            break Ok(());
        }
        if let Err(why) = state.tick(Instant::now()) {
            break Err(why);
        }
        if state.exit {
            break Ok(());
        }
    };

    state.log_stats();
    state.shutdown();
    result
}

fn init_logger(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

/// Drop a requested decode node that sits on another GPU than the renderer,
/// unless the environment insists.
fn check_device(config: &mut Config, render_vendor: GpuVendor) {
    let Some(device) = config.device.as_deref() else {
        return;
    };
    let decode_vendor = GpuVendor::from_render_node(device);
    if !probe::vendors_conflict(decode_vendor, render_vendor) {
        return;
    }

    if std::env::var_os(probe::ALLOW_GPU_MISMATCH_ENV).is_some() {
        warn!(
            device = %device.display(),
            %decode_vendor,
            %render_vendor,
            "Decoding on a different GPU than rendering"
        );
        return;
    }

    warn!(
        device = %device.display(),
        %decode_vendor,
        %render_vendor,
        "Requested decode device is not the render GPU, detecting one instead (set {} to keep it)",
        probe::ALLOW_GPU_MISMATCH_ENV
    );
    config.device = None;
}

pub struct CosmicBgVideo {
    registry_state: RegistryState,
    output_state: OutputState,
    compositor_state: CompositorState,
    layer_state: LayerShell,
    qh: QueueHandle<CosmicBgVideo>,
    connection: Connection,

    outputs: Vec<Output>,
    renderer: Option<Renderer>,
    decoder: Decoder,
    playback: Playback,
    /// The graphics context was lost; rebuild it on the next tick.
    needs_reset: bool,
    config: Config,
    exit: bool,
}

impl CosmicBgVideo {
    fn any_ready(&self) -> bool {
        self.outputs
            .iter()
            .any(|output| output.screen.is_drawable())
    }

    fn output_for_surface(&mut self, surface: &wl_surface::WlSurface) -> Option<&mut Output> {
        self.outputs.iter_mut().find(|output| {
            output
                .layer
                .as_ref()
                .is_some_and(|layer| layer.wl_surface() == surface)
        })
    }

    fn set_scale_mode(&mut self, scale_mode: config::ScaleMode) {
        if scale_mode == self.config.scale_mode {
            return;
        }
        info!(%scale_mode, "Scale mode changed");
        self.config.scale_mode = scale_mode;
        self.playback.redraw();
    }

    /// One pass of the main loop after events were dispatched.
    fn tick(&mut self, now: Instant) -> eyre::Result<()> {
        if self.needs_reset {
            self.reset_renderer()?;
        }

        self.process_outputs(now);

        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(());
        };
        let mut gpu = Gpu {
            renderer,
            qh: &self.qh,
        };
        let tick = self.playback.tick(
            &mut self.decoder,
            &mut gpu,
            self.outputs.iter_mut().map(|output| &mut output.screen),
            self.config.scale_mode,
            now,
        )?;

        if tick.finished {
            info!("End of stream");
            self.exit = true;
        }
        if tick.context_lost {
            self.needs_reset = true;
        }
        Ok(())
    }

    /// Carry out the surface work the compositor callbacks deferred.
    fn process_outputs(&mut self, now: Instant) {
        for output in &mut self.outputs {
            match output.screen.lifecycle.state() {
                crate::output::OutputState::PendingDestroy => {
                    debug!(output = output.name(), "Destroying layer surface");
                    output.drop_surfaces();
                    output.screen.lifecycle.platform_destroyed();
                }
                crate::output::OutputState::Defunct => {
                    output.drop_surfaces();
                    continue;
                }
                _ => {}
            }

            if output.wants_layer(now) && output.can_host(&self.config.output) {
                info!(output = output.name(), "Creating layer surface");
                output.layer = Some(create_layer(
                    &self.compositor_state,
                    &self.layer_state,
                    &self.qh,
                    &output.wl_output,
                ));
                output.screen.lifecycle.recreated();
            }

            if !output.screen.lifecycle.is_live() || output.screen.gfx.is_some() {
                continue;
            }
            let (Some(renderer), Some(layer), Some((width, height))) = (
                self.renderer.as_ref(),
                output.layer.as_ref(),
                output.buffer_size(),
            ) else {
                continue;
            };

            match renderer.create_surface(layer.wl_surface(), width, height) {
                Ok(gfx) => {
                    info!(output = output.name(), width, height, "Graphics surface attached");
                    output.screen.gfx = Some(gfx);
                    output.screen.redraw();
                }
                Err(why) => {
                    let alive = self.output_state.info(&output.wl_output).is_some();
                    output.drop_surfaces();
                    if output.screen.lifecycle.recreate_failed(now, alive) {
                        error!(output = output.name(), %why, "Giving up on output");
                    } else {
                        warn!(
                            output = output.name(),
                            %why,
                            failures = output.screen.lifecycle.failures(),
                            "Graphics surface failed, will recreate"
                        );
                    }
                }
            }
        }
    }

    /// Rebuild the graphics context. Cached images, the import verdict and
    /// the decoder's exported surfaces all go with it.
    fn reset_renderer(&mut self) -> eyre::Result<()> {
        self.needs_reset = false;

        let connection = &self.connection;
        self.playback
            .reset(
                &mut self.decoder,
                &mut self.renderer,
                self.outputs.iter_mut().map(|output| &mut output.screen),
                || Renderer::new(connection),
            )
            .wrap_err("renderer reset failed")?;
        debug!(generation = self.decoder.generation(), "Decoder surfaces invalidated");
        Ok(())
    }

    fn log_stats(&self) {
        let stats = self.playback.stats();
        let path = self.playback.path();
        if let Some(renderer) = self.renderer.as_ref() {
            info!(
                renderer = renderer.description(),
                import = ?renderer.import_status(),
                locked = path.is_determined(),
                zero_copy = path.try_zero_copy(),
                "Render path"
            );
        }
        info!(
            decoded = self.decoder.frames_decoded(),
            skipped = stats.skipped,
            loops = stats.loops,
            clock_resets = stats.clock_resets,
            imported = self.renderer.as_ref().map_or(0, Renderer::images_imported),
            drawn = self.renderer.as_ref().map_or(0, Renderer::frames_drawn),
            "Playback stopped"
        );
        for output in self.outputs.iter().filter(|output| output.screen.frames_rendered > 0) {
            info!(output = output.name(), frames = output.screen.frames_rendered, "Frames rendered");
        }
    }

    fn shutdown(&mut self) {
        self.playback.release_frame();
        for output in &mut self.outputs {
            output.drop_surfaces();
        }
        self.renderer = None;
    }
}

fn create_layer(
    compositor: &CompositorState,
    layer_shell: &LayerShell,
    qh: &QueueHandle<CosmicBgVideo>,
    wl_output: &wl_output::WlOutput,
) -> LayerSurface {
    let surface = compositor.create_surface(qh);
    let layer = layer_shell.create_layer_surface(
        qh,
        surface,
        Layer::Background,
        Some(NAMESPACE),
        Some(wl_output),
    );
    layer.set_anchor(Anchor::all());
    layer.set_keyboard_interactivity(KeyboardInteractivity::None);
    layer.set_exclusive_zone(-1);
    layer.set_size(0, 0);
    layer.commit();
    layer
}

/// Follow a new buffer size, or drop the graphics surface so it is rebuilt.
fn resize_gfx(renderer: Option<&Renderer>, output: &mut Output) {
    let size = output.buffer_size();
    let (Some(renderer), Some(gfx), Some((width, height))) =
        (renderer, output.screen.gfx.as_mut(), size)
    else {
        return;
    };
    if let Err(why) = renderer.resize_surface(gfx, width, height) {
        warn!(output = %output.screen.name, %why, "Resize failed");
        output.screen.drop_gfx();
    }
}

/// The renderer, plus the queue frame callbacks are requested on.
struct Gpu<'a> {
    renderer: &'a mut Renderer,
    qh: &'a QueueHandle<CosmicBgVideo>,
}

impl Painter for Gpu<'_> {
    type Target = OutputSurface;

    fn request_frame(&mut self, target: &OutputSurface) {
        let wl_surface = target.wl_surface();
        wl_surface.frame(self.qh, wl_surface.clone());
    }

    fn paint(
        &mut self,
        target: &OutputSurface,
        frame: &Frame,
        ring: &FrameRing,
        scale: config::ScaleMode,
        try_zero_copy: bool,
    ) -> Result<DrawPath, RenderError> {
        self.renderer.draw(target, frame, ring, scale, try_zero_copy)
    }

    fn clear_cache(&mut self) {
        self.renderer.clear_cache();
    }
}

impl CompositorHandler for CosmicBgVideo {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        surface: &wl_surface::WlSurface,
        new_factor: i32,
    ) {
        let renderer = self.renderer.as_ref();
        let Some(output) = self.outputs.iter_mut().find(|output| {
            output
                .layer
                .as_ref()
                .is_some_and(|layer| layer.wl_surface() == surface)
        }) else {
            return;
        };
        if output.scale == new_factor.max(1) {
            return;
        }

        output.scale = new_factor.max(1);
        surface.set_buffer_scale(output.scale);
        output.screen.redraw();
        debug!(output = output.name(), scale = output.scale, "Scale changed");
        resize_gfx(renderer, output);
    }

    fn transform_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_transform: wl_output::Transform,
    ) {
    }

    fn frame(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        surface: &wl_surface::WlSurface,
        _time: u32,
    ) {
        if let Some(output) = self.output_for_surface(surface) {
            output.screen.lifecycle.presented();
        }
    }

    fn surface_enter(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }

    fn surface_leave(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }
}

impl OutputHandler for CosmicBgVideo {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.output_state
    }

    fn new_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        wl_output: wl_output::WlOutput,
    ) {
        let mut output = Output::new(wl_output);
        if let Some(info) = self.output_state.info(&output.wl_output) {
            output.update(&info);
        }
        info!(output = output.name(), size = ?output.mode_size, "Output announced");
        self.outputs.push(output);
    }

    fn update_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        wl_output: wl_output::WlOutput,
    ) {
        let Some(info) = self.output_state.info(&wl_output) else {
            return;
        };
        if let Some(output) = self.outputs.iter_mut().find(|o| o.wl_output == wl_output) {
            output.update(&info);
        }
    }

    fn output_destroyed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        wl_output: wl_output::WlOutput,
    ) {
        let Some(index) = self.outputs.iter().position(|o| o.wl_output == wl_output) else {
            return;
        };
        let mut output = self.outputs.remove(index);
        output.drop_surfaces();
        info!(output = output.name(), frames = output.screen.frames_rendered, "Output withdrawn");
    }
}

impl LayerShellHandler for CosmicBgVideo {
    fn closed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, layer: &LayerSurface) {
        let Some(output) = self
            .outputs
            .iter_mut()
            .find(|output| output.layer.as_ref() == Some(layer))
        else {
            return;
        };

        let previous = output.screen.lifecycle.state();
        if !output.screen.lifecycle.closed() {
            debug!(output = output.name(), state = %previous, "Surface already closing");
            return;
        }

        info!(output = output.name(), state = %previous, "Layer surface closed by compositor");
        // the layer itself goes on the next tick, outside this callback
        output.screen.drop_gfx();
    }

    fn configure(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        layer: &LayerSurface,
        configure: LayerSurfaceConfigure,
        _serial: u32,
    ) {
        let renderer = self.renderer.as_ref();
        let Some(output) = self
            .outputs
            .iter_mut()
            .find(|output| output.layer.as_ref() == Some(layer))
        else {
            return;
        };

        let (width, height) = configure.new_size;
        match output.screen.lifecycle.configure(width, height) {
            Configured::First => {
                debug!(output = output.name(), width, height, "Configured");
                layer.wl_surface().set_buffer_scale(output.scale);
                output.screen.redraw();
            }
            Configured::Resized => {
                debug!(output = output.name(), width, height, "Resized");
                layer.wl_surface().set_buffer_scale(output.scale);
                output.screen.redraw();
                resize_gfx(renderer, output);
            }
            Configured::Unchanged | Configured::Ignored => {}
        }
    }
}

delegate_compositor!(CosmicBgVideo);
delegate_output!(CosmicBgVideo);
delegate_layer!(CosmicBgVideo);

delegate_registry!(CosmicBgVideo);

impl ProvidesRegistryState for CosmicBgVideo {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.registry_state
    }
    registry_handlers![OutputState];
}

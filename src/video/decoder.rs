// SPDX-License-Identifier: MPL-2.0

//! GStreamer decode pipeline.
//!
//! ```text
//! filesrc ! parsebin ! <decoder> ! [videoconvert] ! capsfilter ! appsink
//! ```
//!
//! The appsink holds at most two buffers and isn't synchronized to the
//! clock: the playback scheduler pulls frames when it wants them and the
//! bounded sink provides back-pressure.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::time::{Duration, Instant};

use cosmic_bg_video_config::RestrictedDecode;
use gstreamer::prelude::*;
use gstreamer_video::{VideoFormat, VideoFrameExt};
use tracing::{debug, info, warn};

use super::probe::{self, Accelerator, GpuVendor};
use super::stream::{self, StreamInfo};
use super::DecodeError;
use crate::dmabuf::{self, DmaBufFormat, PlaneLayout};
use crate::frame::{Frame, GpuSurface, Payload};
use crate::ring::{FrameRing, Plane, SlotIndex};

const CAPS_FEATURE_MEMORY_DMABUF: &str = "memory:DMABuf";
const PREROLL_TIMEOUT_SECS: u64 = 5;
const PULL_WAIT_MS: u64 = 50;
/// Give up on a pipeline that stays silent this long.
const STALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct DecoderOptions<'a> {
    pub hw_accel: bool,
    pub device: Option<&'a Path>,
    pub restricted: &'a RestrictedDecode,
}

#[derive(Debug, Clone)]
enum Backend {
    Hardware(Accelerator),
    Software(String),
}

impl Backend {
    fn factory(&self) -> &str {
        match self {
            Backend::Hardware(accelerator) => &accelerator.factory,
            Backend::Software(factory) => factory,
        }
    }
}

/// Whether exported surfaces are usable. A failure is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Export {
    Untested,
    Works,
    Failed,
}

impl Export {
    pub(super) fn allows_attempt(self) -> bool {
        self != Export::Failed
    }

    /// Returns whether anything changed.
    pub(super) fn settle(&mut self, works: bool) -> bool {
        let next = match (*self, works) {
            (Export::Failed, _) => return false,
            (_, true) => Export::Works,
            (_, false) => Export::Failed,
        };
        let changed = next != *self;
        *self = next;
        changed
    }
}

pub struct Decoder {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    filter: gstreamer::Element,
    info: StreamInfo,
    backend: Backend,
    export: Export,
    generation: u64,
    frames_decoded: u64,
}

impl Decoder {
    /// Probe `path` and start a decode pipeline for its first video stream.
    ///
    /// A hardware pipeline that fails to start is replaced by a software one
    /// once before giving up.
    pub fn open(path: &Path, options: DecoderOptions<'_>) -> Result<Self, DecodeError> {
        gstreamer::init()?;

        if !probe::node_readable(path) {
            return Err(DecodeError::Unreadable(path.to_owned()));
        }

        let info = stream::probe(path)?;

        if let Some(accelerator) = options
            .hw_accel
            .then(|| select_accelerator(&info, options))
            .flatten()
        {
            match Self::start(path, &info, Backend::Hardware(accelerator)) {
                Ok(decoder) => return Ok(decoder),
                Err(why) => warn!(?why, "Hardware decode failed to start, using software"),
            }
        }

        let software = probe::software_decoder(&info.caps)
            .ok_or_else(|| DecodeError::NoDecoder(info.codec.clone()))?;
        Self::start(path, &info, Backend::Software(software))
    }

    fn start(path: &Path, info: &StreamInfo, backend: Backend) -> Result<Self, DecodeError> {
        let hardware = matches!(backend, Backend::Hardware(_));
        let convert = if hardware { "" } else { "videoconvert ! " };
        let description = format!(
            "filesrc name=src ! parsebin ! {} ! {convert}capsfilter name=filter ! \
             appsink name=sink sync=false max-buffers=2 enable-last-sample=false",
            backend.factory()
        );
        debug!(pipeline = %description, "Building decode pipeline");

        let pipeline = gstreamer::parse::launch(&description)?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| DecodeError::Pipeline("not a pipeline".into()))?;

        let element = |name: &str| {
            pipeline
                .by_name(name)
                .ok_or_else(|| DecodeError::Pipeline(format!("missing element {name}")))
        };

        element("src")?.set_property("location", &*path.to_string_lossy());
        let filter = element("filter")?;
        filter.set_property("caps", output_caps(hardware));
        let appsink = element("sink")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| DecodeError::Pipeline("sink is not an appsink".into()))?;

        preroll(&pipeline)?;
        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|why| DecodeError::Preroll(why.to_string()))?;

        match &backend {
            Backend::Hardware(accelerator) => info!(
                decoder = %accelerator.factory,
                long_name = %accelerator.long_name,
                vendor = %accelerator.vendor,
                device = ?accelerator.node,
                "Hardware decode active"
            ),
            Backend::Software(factory) => info!(decoder = %factory, "Software decode active"),
        }

        Ok(Self {
            pipeline,
            appsink,
            filter,
            info: info.clone(),
            backend,
            export: Export::Untested,
            generation: 0,
            frames_decoded: 0,
        })
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self.backend, Backend::Hardware(_))
    }

    /// Vendor of the decoding accelerator, `Unknown` for software decode.
    pub fn vendor(&self) -> GpuVendor {
        match &self.backend {
            Backend::Hardware(accelerator) => accelerator.vendor,
            Backend::Software(_) => GpuVendor::Unknown,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Mark every surface exported so far as stale, e.g. after the graphics
    /// context was lost.
    pub fn invalidate_surfaces(&mut self) {
        self.generation += 1;
        debug!(generation = self.generation, "Exported surfaces invalidated");
    }

    /// Report whether the renderer could use exported surfaces. On failure the
    /// decoder renegotiates to system memory.
    pub fn set_export_result(&mut self, works: bool) {
        if !self.export.settle(works) {
            return;
        }

        if !works && self.is_hardware() {
            self.filter.set_property("caps", output_caps(false));
            info!("Zero-copy unavailable, decoder output moved to system memory");
        }
    }

    /// Decode the next frame into `frame`, releasing what it held before.
    ///
    /// Returns `Ok(false)` at end of stream.
    pub fn next(
        &mut self,
        frame: &mut Frame,
        ring: &mut FrameRing,
        want_cpu_copy: bool,
    ) -> Result<bool, DecodeError> {
        frame.release();

        let Some(sample) = self.pull()? else {
            return Ok(false);
        };
        self.fill_frame(&sample, frame, ring, want_cpu_copy)?;
        self.frames_decoded += 1;

        Ok(true)
    }

    pub fn seek_to_start(&mut self) -> Result<(), DecodeError> {
        self.pipeline
            .seek_simple(
                gstreamer::SeekFlags::FLUSH | gstreamer::SeekFlags::KEY_UNIT,
                gstreamer::ClockTime::ZERO,
            )
            .map_err(DecodeError::Seek)?;
        self.generation += 1;
        debug!(generation = self.generation, "Seeked to start");
        Ok(())
    }

    fn pull(&mut self) -> Result<Option<gstreamer::Sample>, DecodeError> {
        let started = Instant::now();
        loop {
            self.drain_bus()?;

            if let Some(sample) = self.appsink
                .try_pull_sample(gstreamer::ClockTime::from_mseconds(PULL_WAIT_MS)) {
                return Ok(Some(sample));
            }
            if self.appsink.is_eos() {
                return Ok(None);
            }
            if started.elapsed() > STALL_TIMEOUT {
                return Err(DecodeError::Stalled(STALL_TIMEOUT));
            }
        }
    }

    fn drain_bus(&self) -> Result<(), DecodeError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };

        while let Some(msg) = bus.pop() {
            use gstreamer::MessageView;

            match msg.view() {
                MessageView::Error(err) => {
                    return Err(DecodeError::Stream {
                        element: err
                            .src()
                            .map(|s| s.path_string().to_string())
                            .unwrap_or_default(),
                        source: err.error(),
                    });
                }
                MessageView::Warning(warning) => {
                    warn!(
                        src = ?warning.src().map(|s| s.path_string()),
                        error = %warning.error(),
                        "GStreamer pipeline warning"
                    );
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn fill_frame(
        &mut self,
        sample: &gstreamer::Sample,
        frame: &mut Frame,
        ring: &mut FrameRing,
        want_cpu_copy: bool,
    ) -> Result<(), DecodeError> {
        let buffer = sample
            .buffer_owned()
            .ok_or(DecodeError::Sample("missing buffer"))?;
        let caps = sample.caps().ok_or(DecodeError::Sample("missing caps"))?;
        let structure = caps
            .structure(0)
            .ok_or(DecodeError::Sample("empty caps"))?;
        let width = structure
            .get::<i32>("width")
            .map_err(|_| DecodeError::Sample("missing width"))?;
        let height = structure
            .get::<i32>("height")
            .map_err(|_| DecodeError::Sample("missing height"))?;

        frame.pts = buffer
            .pts()
            .map_or(0.0, |pts| pts.nseconds() as f64 / 1_000_000_000.0);
        frame.width = width.max(1) as u32;
        frame.height = height.max(1) as u32;
        (frame.matrix, frame.range) = match structure.get::<&str>("colorimetry") {
            Ok(colorimetry) => stream::classify_color(Some(colorimetry), frame.width),
            Err(_) => (self.info.matrix, self.info.range),
        };

        let on_gpu = buffer.n_memory() > 0
            && buffer
                .peek_memory(0)
                .downcast_memory_ref::<gstreamer_allocators::DmaBufMemory>()
                .is_some();
        let format = surface_format(structure);

        let surface = if on_gpu && self.export.allows_attempt() {
            match self.export_surface(&buffer, caps, format) {
                Ok(surface) => Some(surface),
                Err(why) => {
                    warn!(?why, "Surface export failed, falling back to CPU copy");
                    self.set_export_result(false);
                    None
                }
            }
        } else {
            None
        };

        let cpu = if want_cpu_copy || surface.is_none() {
            let mappable = !on_gpu || format.is_some_and(|format| format.is_linear());
            if mappable {
                copy_to_ring(&buffer, caps, ring)
            } else {
                None
            }
        } else {
            None
        };

        frame.payload = match (surface, cpu) {
            (Some(surface), cpu) => Payload::Surface { surface, cpu },
            (None, Some(slot)) => Payload::Ring(slot),
            (None, None) => Payload::Empty,
        };

        Ok(())
    }

    fn export_surface(
        &self,
        buffer: &gstreamer::Buffer,
        caps: &gstreamer::CapsRef,
        format: Option<DmaBufFormat>,
    ) -> io::Result<GpuSurface> {
        let format = format.ok_or_else(|| io::Error::other("unknown surface format"))?;

        let mut objects = Vec::with_capacity(buffer.n_memory());
        let mut spans = Vec::with_capacity(buffer.n_memory());
        let mut cursor = 0usize;
        for index in 0..buffer.n_memory() {
            let memory = buffer.peek_memory(index);
            let dmabuf = memory
                .downcast_memory_ref::<gstreamer_allocators::DmaBufMemory>()
                .ok_or_else(|| io::Error::other("memory is not a dmabuf"))?;

            let dup_fd = nix::unistd::dup(dmabuf.fd())?;
            // SAFETY: dup returned a fresh descriptor nothing else owns
            objects.push(unsafe { OwnedFd::from_raw_fd(dup_fd) });
            spans.push(MemorySpan {
                start: cursor,
                size: memory.size(),
                offset: memory.offset(),
            });
            cursor += memory.size();
        }

        let layout = plane_layout(buffer, caps, &spans)?;
        let identity = nix::sys::stat::fstat(
            objects
                .first()
                .ok_or_else(|| io::Error::other("buffer has no memory"))?
                .as_raw_fd(),
        )
        .map(|stat| u64::from(stat.st_ino))?;
        let planes = dmabuf::assign_planes(objects, &layout, format.modifier)?;

        Ok(GpuSurface {
            identity,
            generation: self.generation,
            format,
            planes,
            keepalive: Some(buffer.clone()),
        })
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        if let Err(why) = self.pipeline.set_state(gstreamer::State::Null) {
            warn!(?why, "Failed to stop decode pipeline");
        }
        debug!(frames = self.frames_decoded, "Decoder stopped");
    }
}

fn select_accelerator(info: &StreamInfo, options: DecoderOptions<'_>) -> Option<Accelerator> {
    let candidates = probe::hardware_decoders(&info.caps);
    let chosen = probe::choose_accelerator(
        &candidates,
        options.device,
        probe::nvidia_requested(),
        probe::node_readable,
    )?;

    if !chosen.vendor.imports_reliably()
        && !options.restricted.allows(&info.codec, info.bit_depth)
    {
        warn!(
            vendor = %chosen.vendor,
            codec = %info.codec,
            bit_depth = info.bit_depth,
            "Stream not supported by the accelerator, using software decode"
        );
        return None;
    }

    Some(chosen.clone())
}

/// Caps the decoder may produce. Hardware pipelines also offer DMA-BUF
/// output until zero-copy is known not to work.
fn output_caps(allow_dmabuf: bool) -> gstreamer::Caps {
    let system = gstreamer::Structure::builder("video/x-raw")
        .field("format", gstreamer::List::new(["NV12", "I420"]))
        .build();

    let mut builder = gstreamer::Caps::builder_full();
    if allow_dmabuf {
        builder = builder.structure_with_features(
            gstreamer::Structure::new_empty("video/x-raw"),
            gstreamer::CapsFeatures::new([CAPS_FEATURE_MEMORY_DMABUF]),
        );
    }
    builder.structure(system).build()
}

fn preroll(pipeline: &gstreamer::Pipeline) -> Result<(), DecodeError> {
    let fail = |reason: String| {
        let _ = pipeline.set_state(gstreamer::State::Null);
        DecodeError::Preroll(reason)
    };

    pipeline
        .set_state(gstreamer::State::Paused)
        .map_err(|why| fail(why.to_string()))?;

    match pipeline.state(gstreamer::ClockTime::from_seconds(PREROLL_TIMEOUT_SECS)) {
        (Ok(gstreamer::StateChangeSuccess::Success | gstreamer::StateChangeSuccess::NoPreroll), ..) => {
            Ok(())
        }
        (Ok(_), ..) => Err(fail("timed out".into())),
        (Err(_), ..) => {
            let reason = pipeline
                .bus()
                .and_then(|bus| bus.pop_filtered(&[gstreamer::MessageType::Error]))
                .and_then(|msg| match msg.view() {
                    gstreamer::MessageView::Error(err) => Some(err.error().to_string()),
                    _ => None,
                })
                .unwrap_or_else(|| "state change failed".into());
            Err(fail(reason))
        }
    }
}

fn is_dma_drm(caps: &gstreamer::CapsRef) -> bool {
    caps.structure(0)
        .is_some_and(|s| s.get::<&str>("format").is_ok_and(|format| format == "DMA_DRM"))
}

/// DRM format of decoded caps: `drm-format` for DMA_DRM caps, the format
/// name otherwise.
fn surface_format(structure: &gstreamer::StructureRef) -> Option<DmaBufFormat> {
    match structure.get::<&str>("drm-format") {
        Ok(drm_format) => DmaBufFormat::from_drm_format(drm_format),
        Err(_) => structure
            .get::<&str>("format")
            .ok()
            .and_then(DmaBufFormat::from_video_format),
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) struct MemorySpan {
    /// Offset of the memory within the buffer.
    pub start: usize,
    pub size: usize,
    /// Offset of the memory's data within its dmabuf.
    pub offset: usize,
}

/// Map a buffer-relative plane offset to (memory object, dmabuf offset).
pub(super) fn locate_plane(spans: &[MemorySpan], offset: usize) -> Option<(usize, u32)> {
    spans
        .iter()
        .position(|span| offset >= span.start && offset < span.start + span.size)
        .and_then(|object| {
            let span = spans[object];
            u32::try_from(offset - span.start + span.offset)
                .ok()
                .map(|offset| (object, offset))
        })
}

fn plane_layout(
    buffer: &gstreamer::BufferRef,
    caps: &gstreamer::CapsRef,
    spans: &[MemorySpan],
) -> io::Result<Vec<PlaneLayout>> {
    let (offsets, strides): (Vec<usize>, Vec<i32>) =
        if let Some(meta) = buffer.meta::<gstreamer_video::VideoMeta>() {
            let planes = meta.n_planes() as usize;
            (
                meta.offset()[..planes].to_vec(),
                meta.stride()[..planes].to_vec(),
            )
        } else if is_dma_drm(caps) {
            return Err(io::Error::other("DMA_DRM buffer without video meta"));
        } else {
            let info = gstreamer_video::VideoInfo::from_caps(caps)
                .map_err(|why| io::Error::other(why.to_string()))?;
            (info.offset().to_vec(), info.stride().to_vec())
        };

    offsets
        .iter()
        .zip(&strides)
        .take(dmabuf::MAX_PLANES)
        .map(|(&offset, &stride)| {
            let (object, offset) = locate_plane(spans, offset)
                .ok_or_else(|| io::Error::other("plane outside buffer memory"))?;
            Ok(PlaneLayout {
                object,
                offset,
                stride: u32::try_from(stride).map_err(|_| io::Error::other("negative stride"))?,
            })
        })
        .collect()
}

/// Map the buffer and copy it into the next ring slot.
fn copy_to_ring(
    buffer: &gstreamer::BufferRef,
    caps: &gstreamer::CapsRef,
    ring: &mut FrameRing,
) -> Option<SlotIndex> {
    let info = if is_dma_drm(caps) {
        gstreamer_video::VideoInfoDmaDrm::from_caps(caps)
            .ok()?
            .to_video_info()
            .ok()?
    } else {
        gstreamer_video::VideoInfo::from_caps(caps).ok()?
    };

    let mapped = match gstreamer_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info) {
        Ok(mapped) => mapped,
        Err(why) => {
            debug!(?why, "Decoded buffer is not CPU-mappable");
            return None;
        }
    };
    let plane = |index: u32| {
        let stride = *mapped.plane_stride().get(index as usize)?;
        Some(Plane {
            data: mapped.plane_data(index).ok()?,
            stride: usize::try_from(stride).ok()?,
        })
    };

    match mapped.format() {
        VideoFormat::Nv12 => Some(ring.write_nv12(plane(0)?, plane(1)?)),
        VideoFormat::I420 => Some(ring.write_i420(plane(0)?, plane(1)?, plane(2)?)),
        other => {
            debug!(format = ?other, "No CPU copy for format");
            None
        }
    }
}

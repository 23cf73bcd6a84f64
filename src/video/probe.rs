// SPDX-License-Identifier: MPL-2.0

//! Accelerator discovery.
//!
//! Hardware decoders are found in the GStreamer registry and bound to the
//! render node they drive. Selection walks the user's device first, then
//! the fixed render node list, then decoders that aren't tied to a node.

use std::path::{Path, PathBuf};
use std::{fmt, fs};

use gstreamer::glib::translate::IntoGlib;
use gstreamer::prelude::*;
use tracing::{debug, info, warn};

/// Render nodes probed in order when no device is requested.
pub static RENDER_NODES: [&str; 4] = [
    "/dev/dri/renderD128",
    "/dev/dri/renderD129",
    "/dev/dri/renderD130",
    "/dev/dri/renderD131",
];

/// Naming the NVIDIA driver here selects NVIDIA devices during probing.
pub const PREFERRED_DRIVER_ENV: &str = "LIBVA_DRIVER_NAME";
/// Keep a requested decode node even when it isn't the render GPU.
pub const ALLOW_GPU_MISMATCH_ENV: &str = "COSMIC_BG_VIDEO_ALLOW_GPU_MISMATCH";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GpuVendor {
    #[default]
    Unknown,
    Intel,
    Amd,
    Nvidia,
}

impl GpuVendor {
    /// Classify a free-form driver or renderer string.
    pub fn from_description(description: &str) -> Self {
        let lower = description.to_lowercase();
        if lower.contains("nvidia") || lower.contains("nvdec") || lower.contains("geforce") {
            GpuVendor::Nvidia
        } else if lower.contains("intel") {
            GpuVendor::Intel
        } else if lower.contains("amd") || lower.contains("radeon") {
            GpuVendor::Amd
        } else {
            GpuVendor::Unknown
        }
    }

    pub fn from_pci_id(id: u32) -> Self {
        match id {
            0x8086 => GpuVendor::Intel,
            0x1002 => GpuVendor::Amd,
            0x10de => GpuVendor::Nvidia,
            _ => GpuVendor::Unknown,
        }
    }

    /// Read the PCI vendor of a render node from sysfs.
    pub fn from_render_node(node: &Path) -> Self {
        let Some(name) = node.file_name() else {
            return GpuVendor::Unknown;
        };
        let vendor = Path::new("/sys/class/drm").join(name).join("device/vendor");

        fs::read_to_string(&vendor)
            .ok()
            .and_then(|id| parse_pci_id(&id))
            .map_or(GpuVendor::Unknown, Self::from_pci_id)
    }

    /// NVIDIA surfaces export, but importing them into EGL is unreliable.
    pub fn imports_reliably(self) -> bool {
        self != GpuVendor::Nvidia
    }
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GpuVendor::Unknown => "unknown",
            GpuVendor::Intel => "Intel",
            GpuVendor::Amd => "AMD",
            GpuVendor::Nvidia => "NVIDIA",
        })
    }
}

fn parse_pci_id(value: &str) -> Option<u32> {
    let value = value.trim();
    let hex = value.strip_prefix("0x").unwrap_or(value);
    u32::from_str_radix(hex, 16).ok()
}

/// A hardware decoder that can handle the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accelerator {
    /// GStreamer element factory name.
    pub factory: String,
    pub long_name: String,
    /// Render node the decoder runs on, when the plugin exposes one.
    pub node: Option<PathBuf>,
    pub vendor: GpuVendor,
}

/// Render node driven by a VA plugin decoder.
///
/// The plugin registers `va<codec>dec` for the first node and
/// `varenderD<N><codec>dec` for the others.
pub fn render_node_for_factory(factory: &str) -> Option<PathBuf> {
    if let Some(rest) = factory.strip_prefix("varenderD") {
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return None;
        }
        return Some(PathBuf::from(format!("/dev/dri/renderD{digits}")));
    }

    if factory.starts_with("va") && !factory.starts_with("vaapi") && factory.ends_with("dec") {
        return Some(PathBuf::from(RENDER_NODES[0]));
    }

    None
}

pub fn node_readable(path: &Path) -> bool {
    nix::unistd::access(path, nix::unistd::AccessFlags::R_OK).is_ok()
}

/// Whether the environment asks for the NVIDIA driver explicitly.
pub fn nvidia_requested() -> bool {
    std::env::var(PREFERRED_DRIVER_ENV).is_ok_and(|driver| driver == "nvidia")
}

/// Decode and render on different, known GPUs: surfaces would have to
/// cross devices.
pub fn vendors_conflict(decode: GpuVendor, render: GpuVendor) -> bool {
    decode != GpuVendor::Unknown && render != GpuVendor::Unknown && decode != render
}

fn video_decoders(caps: &gstreamer::Caps) -> Vec<gstreamer::ElementFactory> {
    let mut factories: Vec<_> = gstreamer::ElementFactory::factories_with_type(
        gstreamer::ElementFactoryType::DECODER | gstreamer::ElementFactoryType::MEDIA_VIDEO,
        gstreamer::Rank::MARGINAL,
    )
    .into_iter()
    .filter(|factory| factory.can_sink_any_caps(caps))
    .collect();

    factories.sort_by_key(|factory| std::cmp::Reverse(factory.rank().into_glib()));
    factories
}

fn is_hardware(factory: &gstreamer::ElementFactory) -> bool {
    factory.klass().contains("Hardware")
}

/// Hardware decoders accepting `caps`, best ranked first.
pub fn hardware_decoders(caps: &gstreamer::Caps) -> Vec<Accelerator> {
    let accelerators: Vec<_> = video_decoders(caps)
        .into_iter()
        .filter(is_hardware)
        .map(|factory| {
            let factory_name = factory.name().to_string();
            let long_name = factory.longname().to_string();
            let node = render_node_for_factory(&factory_name);
            let vendor = match GpuVendor::from_description(&long_name) {
                GpuVendor::Unknown => node
                    .as_deref()
                    .map_or(GpuVendor::Unknown, GpuVendor::from_render_node),
                vendor => vendor,
            };

            Accelerator {
                factory: factory_name,
                long_name,
                node,
                vendor,
            }
        })
        .collect();

    info!(
        decoders = ?accelerators.iter().map(|a| a.factory.as_str()).collect::<Vec<_>>(),
        "Hardware decoders for stream"
    );
    accelerators
}

/// Best software decoder accepting `caps`.
pub fn software_decoder(caps: &gstreamer::Caps) -> Option<String> {
    video_decoders(caps)
        .into_iter()
        .find(|factory| !is_hardware(factory))
        .map(|factory| factory.name().to_string())
}

/// Pick the accelerator to decode with.
///
/// A readable, matching `requested` node wins. Otherwise render nodes are
/// walked in order, skipping unreadable ones, then node-less decoders.
/// NVIDIA candidates are only taken right away when `want_nvidia` is set;
/// otherwise the first one seen is kept as a last resort.
pub fn choose_accelerator<'a>(
    candidates: &'a [Accelerator],
    requested: Option<&Path>,
    want_nvidia: bool,
    readable: impl Fn(&Path) -> bool,
) -> Option<&'a Accelerator> {
    if let Some(requested) = requested {
        if readable(requested) {
            if let Some(found) = candidates
                .iter()
                .find(|a| a.node.as_deref() == Some(requested))
            {
                return Some(found);
            }
            warn!(device = %requested.display(), "No decoder drives the requested device, probing");
        } else {
            warn!(device = %requested.display(), "Requested device is not readable, probing");
        }
    }

    let by_node = RENDER_NODES.iter().map(|node| Path::new(*node)).filter(|node| {
        let ok = readable(node);
        if !ok {
            debug!(node = %node.display(), "Skipping unreadable render node");
        }
        ok
    });

    let on_nodes = by_node.flat_map(|node| {
        candidates
            .iter()
            .filter(move |a| a.node.as_deref() == Some(node))
    });
    let nodeless = candidates.iter().filter(|a| a.node.is_none());

    let mut fallback = None;
    for candidate in on_nodes.chain(nodeless) {
        if candidate.vendor.imports_reliably() || want_nvidia {
            return Some(candidate);
        }
        fallback.get_or_insert(candidate);
    }

    fallback
}

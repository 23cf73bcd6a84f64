// SPDX-License-Identifier: MPL-2.0-only

use cosmic_config::{Config as CosmicConfig, ConfigGet};
use derive_setters::Setters;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};

pub const NAME: &str = "com.system76.CosmicBackgroundVideo";

pub const SCALE_MODE_KEY: &str = "scale_mode";
pub const LOOPING_KEY: &str = "looping";
pub const HW_ACCEL_KEY: &str = "hw_accel";
pub const OUTPUT_KEY: &str = "output";
pub const DEVICE_KEY: &str = "device";
pub const RESTRICTED_DECODE_KEY: &str = "restricted_decode";

/// Which outputs receive the video.
#[derive(Debug, Deserialize, Serialize, Clone, Default, Hash, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[must_use]
pub enum Output {
    /// a single output, matched by its announced name
    Name(String),
    /// every output
    #[default]
    All,
}

impl Output {
    /// Whether an output with this name is selected.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Output::All => true,
            Output::Name(wanted) => wanted == name,
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::All => f.write_str("*"),
            Output::Name(name) => f.write_str(name),
        }
    }
}

impl FromStr for Output {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "" | "*" | "all" => Output::All,
            name => Output::Name(name.to_owned()),
        })
    }
}

/// How the video frame maps onto the output.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScaleMode {
    /// Letterbox, the whole frame stays visible
    Fit,
    /// Crop so the frame covers the whole output
    #[default]
    Fill,
    /// Ignore the aspect ratio
    Stretch,
}

impl fmt::Display for ScaleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScaleMode::Fit => "fit",
            ScaleMode::Fill => "fill",
            ScaleMode::Stretch => "stretch",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownScaleMode(pub String);

impl fmt::Display for UnknownScaleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown scale mode `{}` (expected fit, fill or stretch)", self.0)
    }
}

impl std::error::Error for UnknownScaleMode {}

impl FromStr for ScaleMode {
    type Err = UnknownScaleMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fit" => Ok(ScaleMode::Fit),
            "fill" => Ok(ScaleMode::Fill),
            "stretch" => Ok(ScaleMode::Stretch),
            _ => Err(UnknownScaleMode(s.to_owned())),
        }
    }
}

/// Decode capabilities of the accelerator class whose surfaces import
/// unreliably. Streams outside this list are decoded in software there.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Setters)]
#[serde(deny_unknown_fields)]
#[must_use]
pub struct RestrictedDecode {
    /// codec names as reported by the stream probe (`h264`, `hevc`, ...)
    pub codecs: Vec<String>,
    /// deepest luma bit depth still decoded in hardware
    pub max_bit_depth: u32,
}

impl Default for RestrictedDecode {
    fn default() -> Self {
        Self {
            codecs: ["h264", "hevc", "vp8", "vp9", "av1", "mpeg2", "vc1", "wmv3"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_bit_depth: 8,
        }
    }
}

impl RestrictedDecode {
    #[must_use]
    pub fn allows(&self, codec: &str, bit_depth: u32) -> bool {
        bit_depth <= self.max_bit_depth && self.codecs.iter().any(|c| c == codec)
    }
}

#[must_use]
#[derive(Debug, Clone, PartialEq, Setters)]
pub struct Config {
    pub scale_mode: ScaleMode,
    pub looping: bool,
    pub hw_accel: bool,
    #[setters(skip)]
    pub output: Output,
    #[setters(strip_option)]
    pub device: Option<PathBuf>,
    #[setters(skip)]
    pub restricted_decode: RestrictedDecode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scale_mode: ScaleMode::default(),
            looping: true,
            hw_accel: true,
            output: Output::All,
            device: None,
            restricted_decode: RestrictedDecode::default(),
        }
    }
}

impl Config {
    /// Convenience function for cosmic-config
    ///
    /// # Errors
    ///
    /// Fails if cosmic-config paths are missing or cannot be created.
    pub fn helper() -> Result<CosmicConfig, cosmic_config::Error> {
        CosmicConfig::new(NAME, 1)
    }

    /// Load every key from cosmic-config, keeping defaults for keys that are
    /// absent or fail to parse.
    pub fn load(context: &CosmicConfig) -> Self {
        let defaults = Self::default();

        Self {
            scale_mode: get_or(context, SCALE_MODE_KEY, defaults.scale_mode),
            looping: get_or(context, LOOPING_KEY, defaults.looping),
            hw_accel: get_or(context, HW_ACCEL_KEY, defaults.hw_accel),
            output: get_or(context, OUTPUT_KEY, defaults.output),
            device: get_or(context, DEVICE_KEY, defaults.device),
            restricted_decode: get_or(context, RESTRICTED_DECODE_KEY, defaults.restricted_decode),
        }
    }

    /// Re-read only the scale mode, used when the key changes at runtime.
    pub fn load_scale_mode(context: &CosmicConfig) -> ScaleMode {
        get_or(context, SCALE_MODE_KEY, ScaleMode::default())
    }

    /// Replace the output filter.
    pub fn output(mut self, output: Output) -> Self {
        self.output = output;
        self
    }
}

fn get_or<T: DeserializeOwned>(context: &CosmicConfig, key: &str, default: T) -> T {
    match context.get::<T>(key) {
        Ok(value) => value,
        Err(cosmic_config::Error::GetKey(_, why)) if why.kind() == std::io::ErrorKind::NotFound => {
            default
        }
        Err(why) => {
            tracing::warn!(key, ?why, "invalid config value, using default");
            default
        }
    }
}

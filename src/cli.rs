// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use clap::Parser;
use cosmic_bg_video_config::{Config, Output, ScaleMode};

#[derive(Debug, Parser)]
#[command(name = "cosmic-bg-video")]
#[command(about = "Play a looping video as the desktop background")]
#[command(version)]
pub struct Cli {
    /// Video file to play
    pub video: PathBuf,

    /// Output name, or `*` for every output
    #[arg(short, long)]
    pub output: Option<Output>,

    /// Render node to decode on, e.g. /dev/dri/renderD129
    #[arg(short, long)]
    pub gpu: Option<PathBuf>,

    /// fit, fill or stretch
    #[arg(short, long)]
    pub scale: Option<ScaleMode>,

    /// Stop at the end instead of looping
    #[arg(short = 'l', long)]
    pub no_loop: bool,

    /// Decode in software
    #[arg(short = 'n', long)]
    pub no_hwaccel: bool,

    /// Debug logging unless RUST_LOG is set
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Stored settings with command line flags on top.
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(output) = self.output.clone() {
            config = config.output(output);
        }
        if let Some(gpu) = self.gpu.clone() {
            config = config.device(gpu);
        }
        if let Some(scale) = self.scale {
            config = config.scale_mode(scale);
        }
        if self.no_loop {
            config = config.looping(false);
        }
        if self.no_hwaccel {
            config = config.hw_accel(false);
        }
        config
    }
}

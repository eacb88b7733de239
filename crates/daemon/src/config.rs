//! Daemon configuration: one TOML file describing a transfer.

use std::path::PathBuf;

use netio::NetParms;
use serde::Deserialize;
use vlbi_types::{FrameFormat, FrameLayout};

/// The transfer this daemon instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Pattern generator to the network (load and acceptance testing).
    Fill2net,
    /// Network in, payload verification out.
    Net2check,
    /// Network in, striped recording across the mountpoints.
    Net2vbs,
    /// Negotiate with a remote responder, then ship missing chunks.
    Vbs2net,
    /// Serve incoming chunk transfers and rsync queries.
    Vbsserver,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub mode: Mode,
    /// Scan label naming the recording.
    pub scan: String,
    #[serde(default)]
    pub net: NetConfig,
    #[serde(default)]
    pub format: FormatConfig,
    #[serde(default)]
    pub record: RecordConfig,
    #[serde(default)]
    pub generate: GenerateConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Local bind address for receiving modes.
    pub bind: String,
    /// Destination spec for sending modes (`proto://host:port`).
    pub remote: String,
    #[serde(flatten)]
    pub parms: NetParms,
    pub allow_variable_block_size: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            bind: "0.0.0.0:2630".to_string(),
            remote: String::new(),
            parms: NetParms::default(),
            allow_variable_block_size: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FormatConfig {
    pub format: FrameFormat,
    pub ntrack: u32,
    pub frame_size: usize,
}

impl Default for FormatConfig {
    fn default() -> Self {
        FormatConfig {
            format: FrameFormat::Mark5b,
            ntrack: 32,
            frame_size: 10016,
        }
    }
}

impl FormatConfig {
    pub fn layout(&self) -> FrameLayout {
        match self.format {
            FrameFormat::Vdif | FrameFormat::VdifLegacy => {
                FrameLayout::vdif(self.ntrack, self.frame_size)
            }
            _ => FrameLayout::mark5b(self.ntrack),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordConfig {
    pub mountpoints: Vec<PathBuf>,
    pub mk6: bool,
    pub workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerateConfig {
    pub nframes: u64,
    pub frames_per_block: usize,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        GenerateConfig {
            nframes: 10_000,
            frames_per_block: 32,
        }
    }
}

impl Config {
    pub fn from_str(text: &str) -> anyhow::Result<Config> {
        let cfg: Config = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &std::path::Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.scan.is_empty() {
            anyhow::bail!("scan label must not be empty");
        }
        self.net
            .parms
            .validate()
            .map_err(|e| anyhow::anyhow!("net parameters: {e}"))?;
        match self.mode {
            Mode::Fill2net | Mode::Vbs2net => {
                if self.net.remote.is_empty() {
                    anyhow::bail!("mode {:?} needs net.remote", self.mode);
                }
            }
            Mode::Net2vbs | Mode::Vbsserver => {
                if self.record.mountpoints.is_empty() {
                    anyhow::bail!("mode {:?} needs record.mountpoints", self.mode);
                }
            }
            Mode::Net2check => {}
        }
        Ok(())
    }
}

//! Command implementations for meshfw

pub mod extract;
pub mod fetch;
pub mod probe;
pub mod purge;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use meshfw_update::{CancelToken, FileStore, UpdateConfig};
use tracing::{debug, warn};

/// Transport whose artifact flavour to fetch
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// DFU package (`-ota.zip`) for the radio link
    Wireless,
    /// UF2 image for the mass-storage bootloader
    MassStorage,
    /// Application image for HTTP OTA
    Wifi,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// PlatformIO target of the device (e.g. rak4631)
    #[arg(short, long)]
    pub target: String,

    /// Release version or tag (e.g. 2.6.8 or v2.6.8.ef9d0d7)
    #[arg(long = "release")]
    pub version: String,

    /// Chip architecture, substituted into the release bundle URL
    #[arg(long)]
    pub arch: Option<String>,

    /// Generic release bundle URL used when the direct asset is missing
    #[arg(long, requires = "arch")]
    pub zip_url: Option<String>,

    /// Artifact flavour to fetch
    #[arg(short, long, value_enum)]
    pub method: Method,

    /// Try the unified WiFi image before the board-specific one
    #[arg(long)]
    pub unified: bool,

    /// Output file, or an existing directory to save into
    #[arg(short, long)]
    pub out: PathBuf,
}

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Release bundle to search
    #[arg(short, long)]
    pub archive: PathBuf,

    /// PlatformIO target of the device
    #[arg(short, long)]
    pub target: String,

    /// Extension of the entry to extract
    #[arg(short, long, default_value = ".bin")]
    pub ext: String,

    /// Output file, or an existing directory to save into
    #[arg(short, long)]
    pub out: PathBuf,
}

/// Load configuration and apply command-line overrides
pub fn load_config(
    path: Option<&Path>,
    base_url: Option<&str>,
    scratch_dir: Option<&Path>,
) -> Result<UpdateConfig> {
    let mut config = match path {
        Some(path) => UpdateConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => UpdateConfig::default(),
    };
    if let Some(url) = base_url {
        config = config.with_firmware_base_url(url);
    }
    if let Some(dir) = scratch_dir {
        config = config.with_scratch_dir(dir);
    }
    config.validate()?;
    debug!(?config, "Loaded configuration");
    Ok(config)
}

pub fn file_store(config: &UpdateConfig) -> Result<FileStore> {
    FileStore::new(config).context("Failed to create HTTP client")
}

/// Token that trips on Ctrl-C
pub fn cancel_on_interrupt() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            token.cancel();
        }
    });
    cancel
}

/// Resolve `out` to a file path, placing `filename` inside it when it is a directory
pub fn output_path(out: &Path, source: &Path) -> PathBuf {
    if out.is_dir() {
        match source.file_name() {
            Some(name) => out.join(name),
            None => out.to_path_buf(),
        }
    } else {
        out.to_path_buf()
    }
}

//! Firmware retrieval
//!
//! Guesses the conventional direct-asset URL for a release and target, and
//! falls back to the full release bundle when the guess misses. The naming
//! convention is a heuristic with no server-side manifest: a miss degrades to
//! the slower archive path instead of failing.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::error::{FirmwareUpdateError, Result};
use crate::file_store::{FileStore, ProgressFn};
use crate::model::{DeviceHardware, FirmwareRelease};

/// Architecture tokens recognised inside generic release bundle URLs.
/// Longer tokens come first so `esp32-s3` is not mistaken for `esp32`.
const KNOWN_ARCHITECTURES: [&str; 7] = [
    "esp32-s3", "esp32-c3", "esp32-c6", "nrf52840", "rp2040", "stm32", "esp32",
];

/// Scratch filename of the downloaded release bundle
const RELEASE_ARCHIVE_NAME: &str = "firmware_release.zip";

/// Artifact flavour a transport expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareFormat {
    /// DFU package for wireless updates (`*-ota.zip`)
    WirelessArchive,
    /// UF2 image for mass-storage updates
    MassStorageImage,
    /// Raw application image for HTTP OTA
    WifiImage,
}

impl FirmwareFormat {
    /// Suffix appended to `firmware-<target>-<version>`
    pub fn file_suffix(self) -> &'static str {
        match self {
            FirmwareFormat::WirelessArchive => "-ota.zip",
            FirmwareFormat::MassStorageImage => ".uf2",
            FirmwareFormat::WifiImage => ".bin",
        }
    }

    /// Extension of the entry to pull out of a release bundle
    pub fn entry_extension(self) -> &'static str {
        match self {
            FirmwareFormat::WirelessArchive => ".zip",
            FirmwareFormat::MassStorageImage => ".uf2",
            FirmwareFormat::WifiImage => ".bin",
        }
    }
}

/// Conventional filename of a per-target asset
pub fn conventional_filename(hardware: &DeviceHardware, version: &str, format: FirmwareFormat) -> String {
    format!("firmware-{}-{}{}", hardware.target(), version, format.file_suffix())
}

/// Substitute the first recognised architecture token in a bundle URL
pub fn device_firmware_url(url: &str, target_arch: &str) -> String {
    let lower = url.to_ascii_lowercase();
    let replacement = target_arch.to_ascii_lowercase();
    for arch in KNOWN_ARCHITECTURES {
        if lower.contains(arch) {
            return replace_ignore_ascii_case(url, &lower, arch, &replacement);
        }
    }
    url.to_string()
}

fn replace_ignore_ascii_case(original: &str, lower: &str, needle: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(original.len());
    let mut last = 0;
    for (start, _) in lower.match_indices(needle) {
        out.push_str(original.get(last..start).unwrap_or_default());
        out.push_str(replacement);
        last = start + needle.len();
    }
    out.push_str(original.get(last..).unwrap_or_default());
    out
}

/// Resolves a local firmware file for a release and target
#[derive(Debug, Clone)]
pub struct FirmwareRetriever {
    store: FileStore,
    base_url: String,
}

impl FirmwareRetriever {
    /// Create a retriever over `store` using `base_url` for direct assets
    pub fn new(store: FileStore, base_url: impl Into<String>) -> Self {
        Self {
            store,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Underlying file store
    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Direct asset URL for `filename` in the release directory of `version`
    pub fn direct_url(&self, version: &str, filename: &str) -> String {
        format!("{}/firmware-{version}/{filename}", self.base_url)
    }

    /// DFU package for a wireless update
    pub async fn retrieve_ota_firmware(
        &self,
        release: &FirmwareRelease,
        hardware: &DeviceHardware,
        cancel: &CancelToken,
        on_progress: ProgressFn<'_>,
    ) -> Result<Option<PathBuf>> {
        let filename = conventional_filename(hardware, release.version(), FirmwareFormat::WirelessArchive);
        self.retrieve(release, hardware, &filename, FirmwareFormat::WirelessArchive, cancel, on_progress)
            .await
    }

    /// UF2 image for a mass-storage update
    pub async fn retrieve_usb_firmware(
        &self,
        release: &FirmwareRelease,
        hardware: &DeviceHardware,
        cancel: &CancelToken,
        on_progress: ProgressFn<'_>,
    ) -> Result<Option<PathBuf>> {
        let filename = conventional_filename(hardware, release.version(), FirmwareFormat::MassStorageImage);
        self.retrieve(release, hardware, &filename, FirmwareFormat::MassStorageImage, cancel, on_progress)
            .await
    }

    /// Application image for a WiFi OTA update
    ///
    /// The unified image is tried first (direct asset only) when the hardware
    /// supports it; a miss falls back to the per-board convention.
    pub async fn retrieve_esp32_firmware(
        &self,
        release: &FirmwareRelease,
        hardware: &DeviceHardware,
        cancel: &CancelToken,
        on_progress: ProgressFn<'_>,
    ) -> Result<Option<PathBuf>> {
        let version = release.version();
        if let Some(unified) = hardware.unified_image_name() {
            if let Some(file) = self
                .try_direct(version, &unified, cancel, on_progress)
                .await?
            {
                return Ok(Some(file));
            }
            info!(filename = %unified, "Unified image unavailable, using board-specific image");
        }

        let filename = conventional_filename(hardware, version, FirmwareFormat::WifiImage);
        self.retrieve(release, hardware, &filename, FirmwareFormat::WifiImage, cancel, on_progress)
            .await
    }

    async fn retrieve(
        &self,
        release: &FirmwareRelease,
        hardware: &DeviceHardware,
        filename: &str,
        format: FirmwareFormat,
        cancel: &CancelToken,
        on_progress: ProgressFn<'_>,
    ) -> Result<Option<PathBuf>> {
        if let Some(file) = self
            .try_direct(release.version(), filename, cancel, on_progress)
            .await?
        {
            return Ok(Some(file));
        }

        if release.zip_url.is_empty() {
            warn!(release = %release.id, "Release has no bundle URL, nothing to fall back to");
            return Ok(None);
        }

        let zip_url = device_firmware_url(&release.zip_url, &hardware.architecture);
        info!(url = %zip_url, pio_target = hardware.target(), "Falling back to release bundle");

        let archive = match self
            .store
            .download(&zip_url, RELEASE_ARCHIVE_NAME, cancel, on_progress)
            .await
        {
            Ok(path) => path,
            Err(FirmwareUpdateError::DownloadFailed(reason)) => {
                warn!(url = %zip_url, reason = %reason, "Release bundle download failed");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        cancel.check()?;
        let extracted = self
            .store
            .extract_firmware(
                &archive,
                hardware,
                format.entry_extension(),
                Some(filename),
                cancel,
            )
            .await;
        self.store.remove(&archive).await;
        extracted
    }

    /// Probe and download the direct asset; every failure except cancellation is non-fatal
    async fn try_direct(
        &self,
        version: &str,
        filename: &str,
        cancel: &CancelToken,
        on_progress: ProgressFn<'_>,
    ) -> Result<Option<PathBuf>> {
        let url = self.direct_url(version, filename);
        if !self.store.check_url_exists(&url).await {
            return Ok(None);
        }
        match self.store.download(&url, filename, cancel, on_progress).await {
            Ok(path) => Ok(Some(path)),
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                warn!(url = %url, error = %e, "Direct download failed, falling back to release zip");
                Ok(None)
            }
        }
    }
}

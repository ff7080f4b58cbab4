//! ESP32 OTA
//!
//! The device is asked to reboot into its OTA loader with the image hash, then
//! the image goes over one of two routes.
//!
//! WiFi, against `http://<ip>:<port>`:
//! 1. `GET /ota/version` until the OTA listener answers
//! 2. `POST /ota/update` with the image streamed in chunks and its SHA-256 in
//!    `X-Firmware-Sha256`
//! 3. `POST /ota/reboot`
//!
//! Radio, through a host-provided [`RadioOtaLink`]: connect with retries,
//! version, start, chunked writes, finish, reboot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{StateSink, UpdateHandler, UpdateRequest, download_progress};
use crate::cancel::CancelToken;
use crate::collaborators::{DeviceConnection, OtaMode, OtaVersionInfo, RadioOtaLink};
use crate::config::{RadioOtaSettings, WifiOtaSettings};
use crate::error::{FirmwareUpdateError, Result};
use crate::model::ConnectionKind;
use crate::retriever::FirmwareRetriever;
use crate::state::UpdateState;

/// Header carrying the hex SHA-256 of the uploaded image
pub const FIRMWARE_HASH_HEADER: &str = "X-Firmware-Sha256";

/// Flashes an ESP32 application image over WiFi or the radio link
pub struct WifiOtaUpdateHandler {
    retriever: Arc<FirmwareRetriever>,
    connection: Arc<dyn DeviceConnection>,
    settings: WifiOtaSettings,
    radio: Option<Arc<dyn RadioOtaLink>>,
    radio_settings: RadioOtaSettings,
}

/// Closes the radio OTA session on every exit path
struct LinkGuard<'a>(&'a dyn RadioOtaLink);

impl Drop for LinkGuard<'_> {
    fn drop(&mut self) {
        self.0.close();
        debug!("Closed radio OTA session");
    }
}

impl WifiOtaUpdateHandler {
    /// Create a WiFi OTA handler
    pub fn new(
        retriever: Arc<FirmwareRetriever>,
        connection: Arc<dyn DeviceConnection>,
        settings: WifiOtaSettings,
    ) -> Self {
        Self {
            retriever,
            connection,
            settings,
            radio: None,
            radio_settings: RadioOtaSettings::default(),
        }
    }

    /// Enable the radio route through `link`
    pub fn with_radio_link(mut self, link: Arc<dyn RadioOtaLink>, settings: RadioOtaSettings) -> Self {
        self.radio = Some(link);
        self.radio_settings = settings;
        self
    }

    /// Whether the radio route is available
    pub fn has_radio_link(&self) -> bool {
        self.radio.is_some()
    }

    fn base_url(&self, target: &str) -> String {
        if target.contains(':') {
            format!("http://{target}")
        } else {
            format!("http://{target}:{}", self.settings.port)
        }
    }

    fn client(&self) -> &reqwest::Client {
        self.retriever.store().client()
    }

    /// Poll `/ota/version` until the listener answers or attempts run out
    async fn wait_for_listener(&self, base: &str, cancel: &CancelToken) -> Result<OtaVersionInfo> {
        let url = format!("{base}/ota/version");
        let attempts = self.settings.connect_attempts.max(1);
        for attempt in 1..=attempts {
            cancel.check()?;
            match self.client().get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    let info = response.json::<OtaVersionInfo>().await.unwrap_or_default();
                    info!(
                        attempt,
                        hw_version = info.hw_version.as_deref().unwrap_or("unknown"),
                        fw_version = info.fw_version.as_deref().unwrap_or("unknown"),
                        "OTA listener ready"
                    );
                    return Ok(info);
                }
                Ok(response) => {
                    debug!(attempt, status = %response.status(), "OTA listener not ready");
                }
                Err(e) => {
                    debug!(attempt, error = %e, "OTA listener unreachable");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }
        Err(FirmwareUpdateError::TransportError(format!(
            "OTA listener at {base} did not answer after {attempts} attempts"
        )))
    }

    /// Stream the image to `/ota/update`, reporting `Updating` progress
    async fn upload(
        &self,
        base: &str,
        data: Vec<u8>,
        hash_hex: &str,
        on_state: StateSink<'_>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let total = data.len() as u64;
        let chunks: Vec<Vec<u8>> = data
            .chunks(self.settings.chunk_size.max(1))
            .map(<[u8]>::to_vec)
            .collect();

        let (progress_tx, mut progress_rx) = watch::channel(0u64);
        let body_cancel = cancel.clone();
        let mut sent = 0u64;
        let body = futures::stream::iter(chunks.into_iter().map(move |chunk| {
            if body_cancel.is_cancelled() {
                return Err(std::io::Error::other("upload cancelled"));
            }
            sent += chunk.len() as u64;
            let _ = progress_tx.send(sent);
            Ok::<_, std::io::Error>(chunk)
        }));

        on_state(UpdateState::updating(0.0, "Uploading firmware"));
        let request = self
            .client()
            .post(format!("{base}/ota/update"))
            .header(FIRMWARE_HASH_HEADER, hash_hex)
            .header(reqwest::header::CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(body))
            .send();
        tokio::pin!(request);

        let outcome = loop {
            tokio::select! {
                outcome = &mut request => break outcome,
                changed = progress_rx.changed() => {
                    if changed.is_err() {
                        break (&mut request).await;
                    }
                    let sent = *progress_rx.borrow_and_update();
                    if total > 0 {
                        on_state(UpdateState::updating(sent as f32 / total as f32, "Uploading firmware"));
                    }
                }
            }
        };
        cancel.check()?;

        let response = outcome
            .map_err(|e| FirmwareUpdateError::TransportError(format!("OTA upload failed: {e}")))?;
        let status = response.status();
        if status.is_success() {
            on_state(UpdateState::updating(1.0, "Uploading firmware"));
            info!(bytes = total, "OTA upload accepted");
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        if text.contains("Hash Rejected") || text.contains("Hash Mismatch") {
            return Err(FirmwareUpdateError::TransportError(
                "Device rejected the firmware hash".to_string(),
            ));
        }
        Err(FirmwareUpdateError::TransportError(format!(
            "OTA upload rejected with {status}: {}",
            text.trim()
        )))
    }

    async fn reboot(&self, base: &str) {
        match self.client().post(format!("{base}/ota/reboot")).send().await {
            Ok(response) if response.status().is_success() => info!("Device rebooting into new firmware"),
            Ok(response) => warn!(status = %response.status(), "Reboot request not acknowledged"),
            // The device often drops the socket as it reboots
            Err(e) => warn!(error = %e, "Reboot request failed"),
        }
    }

    async fn obtain_image(
        &self,
        request: &UpdateRequest<'_>,
        on_state: StateSink<'_>,
        cancel: &CancelToken,
    ) -> Result<PathBuf> {
        if let Some(source) = request.local_file {
            on_state(UpdateState::processing("Preparing firmware"));
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "firmware.bin".to_string());
            return self.retriever.store().import(source, &name, cancel).await;
        }

        on_state(UpdateState::downloading(0.0));
        let progress = download_progress(on_state);
        self.retriever
            .retrieve_esp32_firmware(request.release, request.hardware, cancel, &progress)
            .await?
            .ok_or_else(|| FirmwareUpdateError::AssetNotFound {
                target: request.hardware.target().to_string(),
            })
    }
}

impl WifiOtaUpdateHandler {
    async fn connect_radio(
        &self,
        link: &dyn RadioOtaLink,
        address: &str,
        on_state: StateSink<'_>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let attempts = self.radio_settings.connect_attempts.max(1);
        for attempt in 1..=attempts {
            cancel.check()?;
            on_state(UpdateState::processing(format!(
                "Connecting to device (attempt {attempt}/{attempts})"
            )));
            match link.connect(address).await {
                Ok(()) => {
                    info!(attempt, address, "Radio OTA session open");
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    debug!(attempt, error = %e, "Radio OTA connect failed, retrying");
                    tokio::time::sleep(self.radio_settings.retry_delay).await;
                }
                Err(e) => {
                    return Err(FirmwareUpdateError::TransportError(format!(
                        "could not reach the OTA loader at {address} after {attempts} attempts: {e}"
                    )));
                }
            }
        }
        Err(FirmwareUpdateError::TransportError(format!(
            "could not reach the OTA loader at {address}"
        )))
    }

    /// Reboot-to-OTA, then stream the image through the radio link
    async fn update_over_radio(
        &self,
        address: &str,
        data: &[u8],
        hash: &[u8; 32],
        on_state: StateSink<'_>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let link = self.radio.as_deref().ok_or_else(|| {
            FirmwareUpdateError::TransportError(
                "no radio OTA link is available; connect over WiFi to update".to_string(),
            )
        })?;

        on_state(UpdateState::processing("Rebooting device into OTA mode"));
        self.connection.request_ota_reboot(OtaMode::Radio, hash).await?;

        let _guard = LinkGuard(link);
        self.connect_radio(link, address, on_state, cancel).await?;

        on_state(UpdateState::processing("Checking device version"));
        let version = link.version().await?;
        info!(
            hw_version = version.hw_version.as_deref().unwrap_or("unknown"),
            fw_version = version.fw_version.as_deref().unwrap_or("unknown"),
            "OTA loader ready"
        );

        on_state(UpdateState::processing("Starting OTA update"));
        let total = data.len() as u64;
        link.start_ota(total, &hex::encode(hash)).await?;

        on_state(UpdateState::updating(0.0, "Uploading firmware"));
        let mut sent = 0u64;
        for chunk in data.chunks(self.radio_settings.chunk_size.max(1)) {
            cancel.check()?;
            link.write_chunk(chunk).await?;
            sent += chunk.len() as u64;
            on_state(UpdateState::updating(sent as f32 / total as f32, "Uploading firmware"));
        }
        link.finish().await?;
        info!(bytes = total, "Radio OTA transfer verified");

        on_state(UpdateState::processing("Rebooting device"));
        if let Err(e) = link.reboot().await {
            // The loader often drops the link as it reboots
            warn!(error = %e, "Reboot request failed");
        }
        Ok(())
    }

    async fn update_over_wifi(
        &self,
        target: &str,
        data: Vec<u8>,
        hash: &[u8; 32],
        on_state: StateSink<'_>,
        cancel: &CancelToken,
    ) -> Result<()> {
        on_state(UpdateState::processing("Rebooting device into OTA mode"));
        self.connection.request_ota_reboot(OtaMode::Wifi, hash).await?;

        on_state(UpdateState::processing("Waiting for device"));
        let base = self.base_url(target);
        self.wait_for_listener(&base, cancel).await?;

        self.upload(&base, data, &hex::encode(hash), on_state, cancel)
            .await?;
        self.reboot(&base).await;
        Ok(())
    }
}

/// SHA-256 of a firmware image
pub fn firmware_sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

async fn read_image(path: &Path) -> Result<Vec<u8>> {
    let data = tokio::fs::read(path).await?;
    if data.is_empty() {
        return Err(FirmwareUpdateError::TransportError(format!(
            "firmware image {} is empty",
            path.display()
        )));
    }
    Ok(data)
}

#[async_trait]
impl UpdateHandler for WifiOtaUpdateHandler {
    async fn start_update(
        &self,
        request: UpdateRequest<'_>,
        on_state: StateSink<'_>,
        cancel: &CancelToken,
    ) -> Result<Option<PathBuf>> {
        if request.target.is_empty() {
            return Err(FirmwareUpdateError::NoDevice);
        }
        let file = self.obtain_image(&request, on_state, cancel).await?;
        cancel.check()?;

        on_state(UpdateState::processing("Verifying firmware image"));
        let data = read_image(&file).await?;
        let hash = firmware_sha256(&data);
        debug!(sha256 = %hex::encode(hash), bytes = data.len(), link = ?request.link, "Hashed firmware image");

        match request.link {
            ConnectionKind::Radio => {
                self.update_over_radio(request.target, &data, &hash, on_state, cancel)
                    .await?;
            }
            ConnectionKind::Network | ConnectionKind::Serial | ConnectionKind::Disconnected => {
                self.update_over_wifi(request.target, data, &hash, on_state, cancel)
                    .await?;
            }
        }
        Ok(Some(file))
    }
}

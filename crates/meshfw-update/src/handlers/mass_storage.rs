//! UF2 drop onto the mass-storage bootloader

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{StateSink, UpdateHandler, UpdateRequest, download_progress};
use crate::cancel::CancelToken;
use crate::collaborators::DeviceConnection;
use crate::error::{FirmwareUpdateError, Result};
use crate::retriever::FirmwareRetriever;
use crate::state::UpdateState;

/// Default filename suggested for a user-supplied image
pub const DEFAULT_UF2_FILENAME: &str = "firmware.uf2";

/// Reboots the device into its UF2 bootloader and asks for the image to be saved
///
/// The handler stops at [`UpdateState::AwaitingFileSave`]; writing the file
/// onto the volume happens outside, through the orchestrator's save step.
pub struct MassStorageUpdateHandler {
    retriever: Arc<FirmwareRetriever>,
    connection: Arc<dyn DeviceConnection>,
    reboot_delay: Duration,
}

impl MassStorageUpdateHandler {
    /// Create a mass-storage handler
    pub fn new(
        retriever: Arc<FirmwareRetriever>,
        connection: Arc<dyn DeviceConnection>,
        reboot_delay: Duration,
    ) -> Self {
        Self {
            retriever,
            connection,
            reboot_delay,
        }
    }

    async fn reboot_and_settle(&self, on_state: StateSink<'_>, cancel: &CancelToken) -> Result<()> {
        on_state(UpdateState::processing("Rebooting device into update mode"));
        self.connection.reboot_into_update_mode().await?;
        tokio::time::sleep(self.reboot_delay).await;
        cancel.check()
    }
}

#[async_trait]
impl UpdateHandler for MassStorageUpdateHandler {
    async fn start_update(
        &self,
        request: UpdateRequest<'_>,
        on_state: StateSink<'_>,
        cancel: &CancelToken,
    ) -> Result<Option<PathBuf>> {
        if let Some(source) = request.local_file {
            self.reboot_and_settle(on_state, cancel).await?;
            info!(source = %source.display(), "Awaiting save of user-supplied image");
            on_state(UpdateState::AwaitingFileSave {
                file: None,
                filename: DEFAULT_UF2_FILENAME.to_string(),
                source: Some(source.to_path_buf()),
            });
            return Ok(None);
        }

        on_state(UpdateState::downloading(0.0));
        let progress = download_progress(on_state);
        let file = self
            .retriever
            .retrieve_usb_firmware(request.release, request.hardware, cancel, &progress)
            .await?
            .ok_or_else(|| FirmwareUpdateError::AssetNotFound {
                target: request.hardware.target().to_string(),
            })?;

        self.reboot_and_settle(on_state, cancel).await?;

        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_UF2_FILENAME.to_string());
        info!(file = %file.display(), %filename, "Awaiting save of retrieved image");
        on_state(UpdateState::AwaitingFileSave {
            file: Some(file.clone()),
            filename,
            source: None,
        });
        Ok(Some(file))
    }
}

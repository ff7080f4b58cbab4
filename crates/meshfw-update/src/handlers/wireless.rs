//! Wireless DFU over the radio link

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{StateSink, UpdateHandler, UpdateRequest, download_progress};
use crate::cancel::CancelToken;
use crate::collaborators::DeviceConnection;
use crate::config::DfuSettings;
use crate::dfu::{DfuInitiator, DfuRequest};
use crate::error::{FirmwareUpdateError, Result};
use crate::model::NO_DEVICE_SELECTED;
use crate::retriever::FirmwareRetriever;
use crate::state::UpdateState;

/// Hands a DFU package to the platform DFU library
///
/// Progress after the hand-off arrives through the DFU listener bridge, not
/// through this handler.
pub struct WirelessUpdateHandler {
    retriever: Arc<FirmwareRetriever>,
    connection: Arc<dyn DeviceConnection>,
    dfu: Arc<dyn DfuInitiator>,
    settings: DfuSettings,
}

impl WirelessUpdateHandler {
    /// Create a wireless handler
    pub fn new(
        retriever: Arc<FirmwareRetriever>,
        connection: Arc<dyn DeviceConnection>,
        dfu: Arc<dyn DfuInitiator>,
        settings: DfuSettings,
    ) -> Self {
        Self {
            retriever,
            connection,
            dfu,
            settings,
        }
    }
}

#[async_trait]
impl UpdateHandler for WirelessUpdateHandler {
    async fn start_update(
        &self,
        request: UpdateRequest<'_>,
        on_state: StateSink<'_>,
        cancel: &CancelToken,
    ) -> Result<Option<PathBuf>> {
        let (archive, retained) = match request.local_file {
            Some(path) => (path.to_path_buf(), None),
            None => {
                on_state(UpdateState::downloading(0.0));
                let progress = download_progress(on_state);
                let file = self
                    .retriever
                    .retrieve_ota_firmware(request.release, request.hardware, cancel, &progress)
                    .await?
                    .ok_or_else(|| FirmwareUpdateError::AssetNotFound {
                        target: request.hardware.target().to_string(),
                    })?;
                (file.clone(), Some(file))
            }
        };
        cancel.check()?;

        on_state(UpdateState::processing("Releasing device connection"));

        // Release the mesh link so reconnect logic does not race the bootloader
        self.connection.set_device_address(NO_DEVICE_SELECTED).await?;

        let device_name = if request.hardware.display_name.is_empty() {
            request.hardware.target().to_string()
        } else {
            request.hardware.display_name.clone()
        };
        info!(
            address = request.target,
            archive = %archive.display(),
            device = %device_name,
            "Starting DFU"
        );
        self.dfu
            .start(DfuRequest {
                address: request.target.to_string(),
                device_name,
                archive,
                settings: self.settings.clone(),
            })
            .await
            .map_err(|e| match e {
                FirmwareUpdateError::TransportError(_) | FirmwareUpdateError::Cancelled => e,
                other => FirmwareUpdateError::TransportError(other.to_string()),
            })?;

        Ok(retained)
    }
}

//! Transport handlers
//!
//! Each handler drives one transport from "firmware ready" to "device
//! flashed" and reports progress through a [`StateSink`]. The orchestrator
//! owns the returned scratch file and deletes it on terminal states.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::model::{ConnectionKind, DeviceHardware, FirmwareRelease};
use crate::state::UpdateState;

pub mod mass_storage;
pub mod wifi;
pub mod wireless;

pub use mass_storage::MassStorageUpdateHandler;
pub use wifi::WifiOtaUpdateHandler;
pub use wireless::WirelessUpdateHandler;

/// State callback handed to handlers; last write wins
pub type StateSink<'a> = &'a (dyn Fn(UpdateState) + Send + Sync);

/// Inputs shared by every transport
#[derive(Debug, Clone, Copy)]
pub struct UpdateRequest<'a> {
    /// Release to install (the local-file sentinel when `local_file` is set)
    pub release: &'a FirmwareRelease,
    /// Target hardware
    pub hardware: &'a DeviceHardware,
    /// Transport-specific target: radio address, IP address, or empty
    pub target: &'a str,
    /// Link `target` is reached over
    pub link: ConnectionKind,
    /// User-supplied firmware file that bypasses retrieval
    pub local_file: Option<&'a Path>,
}

/// One update transport
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    /// Drive the transport until the device has been handed the image
    ///
    /// Returns the scratch file that must be cleaned up later, or `None` when
    /// nothing was written to scratch storage.
    async fn start_update(
        &self,
        request: UpdateRequest<'_>,
        on_state: StateSink<'_>,
        cancel: &CancelToken,
    ) -> Result<Option<PathBuf>>;
}

/// Forward retriever download progress as `Downloading` states
pub(crate) fn download_progress(on_state: StateSink<'_>) -> impl Fn(f32) + Send + Sync + '_ {
    move |fraction| on_state(UpdateState::downloading(fraction))
}

//! Firmware update orchestration for mesh radio devices
//!
//! This crate installs new firmware onto a connected device over one of three
//! transports:
//! - Wireless DFU over the short-range radio link
//! - UF2 drop onto the mass-storage bootloader over USB
//! - ESP32 OTA against the device's WiFi address or over the radio link
//!
//! # Architecture
//!
//! - [`file_store`]: scratch directory, downloads, archive extraction, copies
//! - [`retriever`]: direct-asset URL convention with release-bundle fallback
//! - [`handlers`]: one [`handlers::UpdateHandler`] per transport
//! - [`dfu`]: bridge from the DFU library's listener callbacks to an ordered stream
//! - [`orchestrator`]: state machine, single task slot, post-flash verification
//! - [`collaborators`]: traits the host application implements
//! - [`config`], [`model`], [`state`], [`error`]
//!
//! # Cancellation
//!
//! Exactly one check or update runs at a time. Starting another one cancels
//! it; byte-copy loops observe a [`cancel::CancelToken`] between chunks and
//! surface [`FirmwareUpdateError::Cancelled`], which returns the orchestrator
//! to `Idle` instead of `Error`.
//!
//! # Example
//!
//! ```ignore
//! use meshfw_update::prelude::*;
//!
//! # async fn example(collaborators: Collaborators) -> Result<(), FirmwareUpdateError> {
//! let orchestrator = UpdateOrchestrator::new(UpdateConfig::default(), collaborators)?;
//! let mut states = orchestrator.subscribe();
//!
//! orchestrator.check_for_updates().await;
//! while let Ok(state) = states.recv().await {
//!     if let UpdateState::Ready { .. } = state {
//!         orchestrator.start_update().await?;
//!     }
//!     if state.is_terminal() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod cancel;
pub mod collaborators;
pub mod config;
pub mod dfu;
pub mod error;
pub mod file_store;
pub mod handlers;
pub mod model;
pub mod orchestrator;
pub mod prelude;
pub mod retriever;
pub mod state;

pub use cancel::CancelToken;
pub use collaborators::{
    BootloaderWarningStore, ConnectionState, DeviceConnection, HardwareCatalog,
    MemoryWarningStore, OtaMode, OtaVersionInfo, RadioOtaLink, ReleaseCatalog,
};
pub use config::{
    DEFAULT_FIRMWARE_BASE_URL, DfuSettings, RadioOtaSettings, UpdateConfig, WifiOtaSettings,
};
pub use dfu::{
    DfuEvent, DfuEventStream, DfuInitiator, DfuListenerId, DfuProgressListener, DfuRequest,
    dfu_event_to_state,
};
pub use error::{FirmwareUpdateError, Result};
pub use file_store::{FileStore, ProgressFn, is_firmware_entry, select_entry};
pub use handlers::{
    MassStorageUpdateHandler, StateSink, UpdateHandler, UpdateRequest, WifiOtaUpdateHandler,
    WirelessUpdateHandler,
};
pub use model::{
    ConnectionKind, DeviceAddress, DeviceHardware, DeviceIdentity, FirmwareRelease,
    LOCAL_RELEASE_ID, NO_DEVICE_SELECTED, RECONNECT_PREFIX, ReleaseChannel, UpdateMethod,
    parse_firmware_version,
};
pub use orchestrator::{Collaborators, UpdateOrchestrator, battery_blocks_update};
pub use retriever::{FirmwareFormat, FirmwareRetriever, conventional_filename, device_firmware_url};
pub use state::{ProgressState, UpdateState};

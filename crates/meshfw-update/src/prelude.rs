//! Convenience re-exports for common firmware update types

pub use crate::cancel::CancelToken;
pub use crate::collaborators::{
    BootloaderWarningStore, ConnectionState, DeviceConnection, HardwareCatalog,
    MemoryWarningStore, OtaMode, OtaVersionInfo, RadioOtaLink, ReleaseCatalog,
};
pub use crate::config::{DfuSettings, RadioOtaSettings, UpdateConfig, WifiOtaSettings};
pub use crate::dfu::{
    DfuEvent, DfuEventStream, DfuInitiator, DfuListenerId, DfuProgressListener, DfuRequest,
    dfu_event_to_state,
};
pub use crate::error::FirmwareUpdateError;
pub use crate::file_store::FileStore;
pub use crate::handlers::{UpdateHandler, UpdateRequest};
pub use crate::model::{
    ConnectionKind, DeviceAddress, DeviceHardware, DeviceIdentity, FirmwareRelease,
    ReleaseChannel, UpdateMethod,
};
pub use crate::orchestrator::{Collaborators, UpdateOrchestrator, battery_blocks_update};
pub use crate::retriever::{FirmwareFormat, FirmwareRetriever};
pub use crate::state::{ProgressState, UpdateState};

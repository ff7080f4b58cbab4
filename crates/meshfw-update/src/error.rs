//! Error types for firmware update operations

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while checking for, retrieving or installing firmware
#[derive(Error, Debug)]
pub enum FirmwareUpdateError {
    /// No device is connected or no address is selected
    #[error("No device connected")]
    NoDevice,

    /// Connected hardware could not be resolved against the hardware catalog
    #[error("Unable to resolve device hardware: {0}")]
    HardwareUnresolved(String),

    /// Neither the direct asset nor the release archive produced a firmware file
    #[error("Firmware for {target} was not found in this release")]
    AssetNotFound {
        /// Build target that was searched for
        target: String,
    },

    /// Battery too low to start an update safely
    #[error("Battery level {level}% is too low to update; charge the device first")]
    BatteryTooLow {
        /// Reported battery level in percent
        level: u8,
    },

    /// HTTP download failed
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    /// Stream ended before the advertised content length was received
    #[error("Incomplete download: expected {expected} bytes, got {received}")]
    IncompleteDownload {
        /// Advertised content length
        expected: u64,
        /// Bytes actually written
        received: u64,
    },

    /// Archive could not be read or the matching entry could not be extracted
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    /// Transport-level failure (DFU library error/abort, OTA HTTP rejection)
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Device did not reconnect with fresh identity in time
    #[error("Device did not reconnect within {0:?}")]
    VerificationTimeout(Duration),

    /// Operation cancelled by the user; never shown as an error
    #[error("Operation cancelled")]
    Cancelled,

    /// No update path exists for the connection/hardware combination
    #[error("Unsupported update method: {0}")]
    UnsupportedMethod(String),

    /// Operation invoked from the wrong orchestrator state
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Zip archive error
    #[error("Archive error: {0}")]
    Archive(String),
}

impl FirmwareUpdateError {
    /// Whether this is the cooperative cancellation signal rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, FirmwareUpdateError::Cancelled)
    }

    /// Whether retrying without a change on the device side can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FirmwareUpdateError::BatteryTooLow { .. } | FirmwareUpdateError::UnsupportedMethod(_)
        )
    }
}

impl From<reqwest::Error> for FirmwareUpdateError {
    fn from(e: reqwest::Error) -> Self {
        FirmwareUpdateError::Http(e.to_string())
    }
}

impl From<zip::result::ZipError> for FirmwareUpdateError {
    fn from(e: zip::result::ZipError) -> Self {
        FirmwareUpdateError::Archive(e.to_string())
    }
}

impl From<serde_json::Error> for FirmwareUpdateError {
    fn from(e: serde_json::Error) -> Self {
        FirmwareUpdateError::Config(e.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, FirmwareUpdateError>;

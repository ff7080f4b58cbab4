//! Orchestration state machine
//!
//! `Idle → Checking → Ready → Downloading → Processing → Updating → Verifying`
//! and then one of the terminal states. The mass-storage path detours through
//! [`UpdateState::AwaitingFileSave`] before verification.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::{DeviceAddress, DeviceHardware, FirmwareRelease, UpdateMethod};

/// Snapshot of a progress-bearing step; rebuilt on every tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    /// What is happening
    pub message: String,
    /// Completion fraction in `0.0..=1.0`
    pub progress: f32,
    /// Optional secondary line (speed, part counter, ...)
    pub details: Option<String>,
}

impl ProgressState {
    /// Create a snapshot; the fraction is clamped into range
    pub fn new(message: impl Into<String>, progress: f32) -> Self {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        Self {
            message: message.into(),
            progress,
            details: None,
        }
    }

    /// Indeterminate step with only a message
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(message, 0.0)
    }

    /// Attach a details line
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Whole-number percentage for display
    pub fn percent(&self) -> u8 {
        (self.progress * 100.0).round() as u8
    }
}

/// Firmware update state machine states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum UpdateState {
    /// Nothing running
    #[default]
    Idle,

    /// Resolving hardware and release
    Checking,

    /// Update can be started
    Ready {
        /// Release to install; `None` when the channel has nothing published
        release: Option<FirmwareRelease>,
        /// Resolved hardware of the connected device
        hardware: DeviceHardware,
        /// Connected device address
        address: DeviceAddress,
        /// Show the one-time bootloader upgrade warning
        show_bootloader_warning: bool,
        /// Update path that `start_update` will take
        method: UpdateMethod,
        /// Firmware version the device currently runs
        current_version: Option<String>,
    },

    /// Fetching firmware from the network
    Downloading {
        /// Download progress
        progress: ProgressState,
    },

    /// Preparing: extraction, reboot, DFU service start, file copy
    Processing {
        /// Step description
        progress: ProgressState,
    },

    /// Transferring firmware to the device
    Updating {
        /// Transfer progress
        progress: ProgressState,
    },

    /// Waiting for the device to come back after flashing
    Verifying,

    /// Device rebooted into mass-storage mode; the image must be saved onto it
    AwaitingFileSave {
        /// Retrieved image in scratch storage
        file: Option<PathBuf>,
        /// Suggested filename for the save dialog
        filename: String,
        /// User-supplied source when no image was retrieved
        source: Option<PathBuf>,
    },

    /// Update installed and device verified
    Success,

    /// Device did not reconnect in time; the user may retry or accept
    VerificationFailed,

    /// Update failed; retry re-runs the check
    Error {
        /// User-facing message
        message: String,
    },
}

impl UpdateState {
    /// Download step
    pub fn downloading(progress: f32) -> Self {
        UpdateState::Downloading {
            progress: ProgressState::new("Downloading firmware", progress),
        }
    }

    /// Indeterminate processing step
    pub fn processing(message: impl Into<String>) -> Self {
        UpdateState::Processing {
            progress: ProgressState::message(message),
        }
    }

    /// Transfer step
    pub fn updating(progress: f32, message: impl Into<String>) -> Self {
        UpdateState::Updating {
            progress: ProgressState::new(message, progress),
        }
    }

    /// Failure with a message
    pub fn error(message: impl Into<String>) -> Self {
        UpdateState::Error {
            message: message.into(),
        }
    }

    /// Progress snapshot for progress-bearing states
    pub fn progress_state(&self) -> Option<&ProgressState> {
        match self {
            UpdateState::Downloading { progress }
            | UpdateState::Processing { progress }
            | UpdateState::Updating { progress } => Some(progress),
            UpdateState::Idle
            | UpdateState::Checking
            | UpdateState::Ready { .. }
            | UpdateState::Verifying
            | UpdateState::AwaitingFileSave { .. }
            | UpdateState::Success
            | UpdateState::VerificationFailed
            | UpdateState::Error { .. } => None,
        }
    }

    /// Terminal states end an update attempt and release scratch files
    pub fn is_terminal(&self) -> bool {
        match self {
            UpdateState::Success | UpdateState::VerificationFailed | UpdateState::Error { .. } => {
                true
            }
            UpdateState::Idle
            | UpdateState::Checking
            | UpdateState::Ready { .. }
            | UpdateState::Downloading { .. }
            | UpdateState::Processing { .. }
            | UpdateState::Updating { .. }
            | UpdateState::Verifying
            | UpdateState::AwaitingFileSave { .. } => false,
        }
    }

    /// Check if an update is currently in progress
    pub fn is_in_progress(&self) -> bool {
        match self {
            UpdateState::Downloading { .. }
            | UpdateState::Processing { .. }
            | UpdateState::Updating { .. }
            | UpdateState::Verifying
            | UpdateState::AwaitingFileSave { .. } => true,
            UpdateState::Idle
            | UpdateState::Checking
            | UpdateState::Ready { .. }
            | UpdateState::Success
            | UpdateState::VerificationFailed
            | UpdateState::Error { .. } => false,
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::Checking => "checking",
            UpdateState::Ready { .. } => "ready",
            UpdateState::Downloading { .. } => "downloading",
            UpdateState::Processing { .. } => "processing",
            UpdateState::Updating { .. } => "updating",
            UpdateState::Verifying => "verifying",
            UpdateState::AwaitingFileSave { .. } => "awaiting-file-save",
            UpdateState::Success => "success",
            UpdateState::VerificationFailed => "verification-failed",
            UpdateState::Error { .. } => "error",
        }
    }
}

//! Seams to the rest of the application
//!
//! The orchestrator never talks to the radio stack, the hardware database or
//! the release feed directly. Hosts implement these traits; tests use
//! in-memory mocks.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{FirmwareUpdateError, Result};
use crate::model::{DeviceHardware, DeviceIdentity, FirmwareRelease, ReleaseChannel};

/// Link state as reported by the connection layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Link is up and the device answered its config handshake
    Connected,
    /// Link is being established
    Connecting,
    /// No link
    Disconnected,
    /// Device asleep; the link will come back without user action
    DeviceSleep,
}

impl ConnectionState {
    /// Whether the device is reachable
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// Link the ESP32 OTA loader listens on after the reboot request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OtaMode {
    /// OTA service on the short-range radio link
    Radio,
    /// HTTP listener on the WiFi network
    Wifi,
}

impl OtaMode {
    /// Value carried in the reboot-to-OTA admin message
    pub fn wire_value(self) -> u32 {
        match self {
            OtaMode::Radio => 1,
            OtaMode::Wifi => 2,
        }
    }
}

/// Version report from an ESP32 OTA loader
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OtaVersionInfo {
    /// Hardware revision
    #[serde(default)]
    pub hw_version: Option<String>,
    /// Running firmware version
    #[serde(default)]
    pub fw_version: Option<String>,
}

/// Access to the currently selected device and its link
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    /// Prefixed address of the selected device, if any
    fn device_address(&self) -> Option<String>;

    /// Identity last reported by the connected device
    fn current_identity(&self) -> Option<DeviceIdentity>;

    /// Select a new device address; `"n"` releases the link
    async fn set_device_address(&self, address: &str) -> Result<()>;

    /// Ask the device to reboot into its mass-storage bootloader
    async fn reboot_into_update_mode(&self) -> Result<()>;

    /// Ask the device to reboot into its OTA loader, announcing the image hash
    async fn request_ota_reboot(&self, mode: OtaMode, sha256: &[u8]) -> Result<()>;

    /// Stream of link state changes
    fn subscribe_connection_state(&self) -> broadcast::Receiver<ConnectionState>;

    /// Stream of identity reports; `None` when the device goes away
    fn subscribe_identity(&self) -> broadcast::Receiver<Option<DeviceIdentity>>;

    /// Resolve once the mass-storage volume has been detached after a save
    ///
    /// Hosts that cannot observe the volume keep the default, which never
    /// resolves and lets the detach timeout decide.
    async fn wait_for_detach(&self) -> Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Session with the ESP32 OTA loader over the short-range radio link
///
/// Hosts wrap their platform radio stack; the handler drives the sequence
/// connect, version, start, chunks, finish, reboot and always calls
/// [`RadioOtaLink::close`] afterwards.
#[async_trait]
pub trait RadioOtaLink: Send + Sync {
    /// Open a session with the loader at `address` (no connection prefix)
    async fn connect(&self, address: &str) -> Result<()>;

    /// Ask the loader for its hardware and firmware version
    async fn version(&self) -> Result<OtaVersionInfo>;

    /// Announce the image; the loader rejects a hash that differs from the
    /// one sent with the reboot request
    async fn start_ota(&self, size: u64, sha256_hex: &str) -> Result<()>;

    /// Write the next chunk of the image
    async fn write_chunk(&self, chunk: &[u8]) -> Result<()>;

    /// Wait for the loader to verify the received image
    async fn finish(&self) -> Result<()>;

    /// Reboot into the new image
    async fn reboot(&self) -> Result<()>;

    /// Tear down the session
    fn close(&self);
}

/// Hardware database lookup
#[async_trait]
pub trait HardwareCatalog: Send + Sync {
    /// Resolve a hardware model, optionally disambiguated by the PlatformIO env
    async fn lookup_hardware(
        &self,
        hw_model: u32,
        pio_env: Option<&str>,
    ) -> Result<Option<DeviceHardware>>;
}

/// Firmware release feed
#[async_trait]
pub trait ReleaseCatalog: Send + Sync {
    /// Newest release on `channel`; `None` when nothing is published
    async fn latest_release(&self, channel: ReleaseChannel) -> Result<Option<FirmwareRelease>>;
}

/// Persistent record of dismissed bootloader warnings, keyed by device address
pub trait BootloaderWarningStore: Send + Sync {
    /// Whether the warning was dismissed for `address`
    fn is_dismissed(&self, address: &str) -> bool;

    /// Remember the dismissal for `address`
    fn dismiss(&self, address: &str) -> Result<()>;
}

/// In-memory dismissal store for hosts without persistence
#[derive(Debug, Default)]
pub struct MemoryWarningStore {
    dismissed: Mutex<HashSet<String>>,
}

impl MemoryWarningStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl BootloaderWarningStore for MemoryWarningStore {
    fn is_dismissed(&self, address: &str) -> bool {
        self.dismissed
            .lock()
            .map(|set| set.contains(address))
            .unwrap_or(false)
    }

    fn dismiss(&self, address: &str) -> Result<()> {
        let mut set = self
            .dismissed
            .lock()
            .map_err(|_| FirmwareUpdateError::Config("warning store poisoned".to_string()))?;
        set.insert(address.to_string());
        Ok(())
    }
}

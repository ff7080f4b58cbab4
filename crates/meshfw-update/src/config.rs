//! Update configuration
//!
//! Every tunable of the update pipeline lives here so tests can shrink
//! timeouts and point the retriever at a local HTTP server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FirmwareUpdateError, Result};

/// Base path that hosts per-version firmware directories
pub const DEFAULT_FIRMWARE_BASE_URL: &str =
    "https://raw.githubusercontent.com/meshtastic/meshtastic.github.io/master";

/// Settings handed to the wireless DFU initiator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DfuSettings {
    /// Keep the secure-mode bond across the bootloader switch
    pub keep_bond: bool,
    /// Run the DFU service at foreground priority
    pub foreground: bool,
    /// Always restart transfers from scratch
    pub disable_resume: bool,
    /// Packets sent between receipt notifications
    pub packets_receipt_notification: u16,
    /// Rescan window for the bootloader advertisement
    #[serde(with = "millis_serde")]
    pub scan_timeout: Duration,
    /// Legacy bootloaders may advertise under a new address
    pub force_scanning_legacy: bool,
    /// Delay before creating each data object
    #[serde(with = "millis_serde")]
    pub prepare_data_object_delay: Duration,
    /// Permissive buttonless service switch for legacy bootloaders
    pub unsafe_buttonless_in_secure_dfu: bool,
}

impl Default for DfuSettings {
    fn default() -> Self {
        Self {
            keep_bond: true,
            foreground: true,
            disable_resume: true,
            packets_receipt_notification: 8,
            scan_timeout: Duration::from_millis(2000),
            force_scanning_legacy: true,
            prepare_data_object_delay: Duration::from_millis(400),
            unsafe_buttonless_in_secure_dfu: true,
        }
    }
}

/// Settings for the HTTP OTA sequence used by WiFi-capable devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiOtaSettings {
    /// Port of the on-device OTA listener
    pub port: u16,
    /// Upload chunk size in bytes
    pub chunk_size: usize,
    /// Attempts to reach the OTA listener after the reboot request
    pub connect_attempts: u32,
    /// Delay between connection attempts
    #[serde(with = "millis_serde")]
    pub retry_delay: Duration,
}

impl Default for WifiOtaSettings {
    fn default() -> Self {
        Self {
            port: 3232,
            chunk_size: 1024,
            connect_attempts: 10,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Settings for the ESP32 OTA sequence carried over the radio link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioOtaSettings {
    /// Bytes written per chunk
    pub chunk_size: usize,
    /// Attempts to reach the OTA service after the reboot request
    pub connect_attempts: u32,
    /// Delay between connection attempts
    #[serde(with = "millis_serde")]
    pub retry_delay: Duration,
}

impl Default for RadioOtaSettings {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            connect_attempts: 5,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Top-level configuration for the update core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Base URL of the conventional direct-asset layout
    pub firmware_base_url: String,
    /// Scratch directory owned by the update core
    pub scratch_dir: PathBuf,
    /// Download buffer size in bytes
    pub download_chunk_size: usize,
    /// Timeout applied to every HTTP request
    #[serde(with = "secs_serde")]
    pub http_timeout: Duration,
    /// Settle delay after rebooting into mass-storage mode
    #[serde(with = "secs_serde")]
    pub reboot_delay: Duration,
    /// Upper bound on waiting for the mass-storage volume to detach
    #[serde(with = "secs_serde")]
    pub detach_timeout: Duration,
    /// Upper bound on reconnect-and-resync after flashing
    #[serde(with = "secs_serde")]
    pub verification_timeout: Duration,
    /// Extra settle time after the reconnect is observed
    #[serde(with = "secs_serde")]
    pub verification_settle_delay: Duration,
    /// Longest gap between DFU callbacks before the session counts as stalled
    #[serde(with = "secs_serde")]
    pub dfu_stall_timeout: Duration,
    /// Battery levels in `1..=threshold` block an update
    pub battery_threshold_percent: u8,
    /// Wireless DFU settings
    pub dfu: DfuSettings,
    /// WiFi OTA settings
    pub wifi_ota: WifiOtaSettings,
    /// ESP32 OTA over the radio link
    pub radio_ota: RadioOtaSettings,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            firmware_base_url: DEFAULT_FIRMWARE_BASE_URL.to_string(),
            scratch_dir: std::env::temp_dir().join("firmware_update"),
            download_chunk_size: 8192,
            http_timeout: Duration::from_secs(60),
            reboot_delay: Duration::from_secs(5),
            detach_timeout: Duration::from_secs(30),
            verification_timeout: Duration::from_secs(60),
            verification_settle_delay: Duration::from_secs(2),
            dfu_stall_timeout: Duration::from_secs(120),
            battery_threshold_percent: 10,
            dfu: DfuSettings::default(),
            wifi_ota: WifiOtaSettings::default(),
            radio_ota: RadioOtaSettings::default(),
        }
    }
}

impl UpdateConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: UpdateConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the pipeline misbehave
    pub fn validate(&self) -> Result<()> {
        if self.firmware_base_url.trim().is_empty() {
            return Err(FirmwareUpdateError::Config(
                "firmware_base_url must not be empty".to_string(),
            ));
        }
        if self.download_chunk_size == 0
            || self.wifi_ota.chunk_size == 0
            || self.radio_ota.chunk_size == 0
        {
            return Err(FirmwareUpdateError::Config(
                "chunk sizes must be greater than zero".to_string(),
            ));
        }
        if self.verification_timeout.is_zero() {
            return Err(FirmwareUpdateError::Config(
                "verification_timeout must be greater than zero".to_string(),
            ));
        }
        if self.dfu_stall_timeout.is_zero() {
            return Err(FirmwareUpdateError::Config(
                "dfu_stall_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the direct-asset base URL
    pub fn with_firmware_base_url(mut self, url: impl Into<String>) -> Self {
        self.firmware_base_url = url.into();
        self
    }

    /// Set the scratch directory
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Set the mass-storage reboot settle delay
    pub fn with_reboot_delay(mut self, delay: Duration) -> Self {
        self.reboot_delay = delay;
        self
    }

    /// Set the detach wait bound
    pub fn with_detach_timeout(mut self, timeout: Duration) -> Self {
        self.detach_timeout = timeout;
        self
    }

    /// Set the verification bound and settle delay
    pub fn with_verification(mut self, timeout: Duration, settle: Duration) -> Self {
        self.verification_timeout = timeout;
        self.verification_settle_delay = settle;
        self
    }

    /// Set the DFU stall bound
    pub fn with_dfu_stall_timeout(mut self, timeout: Duration) -> Self {
        self.dfu_stall_timeout = timeout;
        self
    }

    /// Set the WiFi OTA settings
    pub fn with_wifi_ota(mut self, settings: WifiOtaSettings) -> Self {
        self.wifi_ota = settings;
        self
    }

    /// Set the radio OTA settings
    pub fn with_radio_ota(mut self, settings: RadioOtaSettings) -> Self {
        self.radio_ota = settings;
        self
    }
}

mod secs_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod millis_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

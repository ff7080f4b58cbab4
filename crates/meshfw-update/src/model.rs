//! Release, hardware and connection descriptors

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FirmwareUpdateError;

/// Release id of the sentinel used for user-selected local files
pub const LOCAL_RELEASE_ID: &str = "local";

/// A published firmware release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareRelease {
    /// Release identity, usually a tag such as `v2.6.8.ef9d0d7`
    pub id: String,
    /// Display title
    pub title: String,
    /// Release notes (markdown)
    pub release_notes: String,
    /// Generic release bundle URL
    pub zip_url: String,
}

impl FirmwareRelease {
    /// Create a release with the given id and bundle URL
    pub fn new(id: impl Into<String>, zip_url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            release_notes: String::new(),
            zip_url: zip_url.into(),
        }
    }

    /// Sentinel release standing in for a user-selected local file
    pub fn local_file() -> Self {
        Self {
            id: LOCAL_RELEASE_ID.to_string(),
            title: "Local file".to_string(),
            release_notes: String::new(),
            zip_url: String::new(),
        }
    }

    /// Whether this is the local-file sentinel
    pub fn is_local(&self) -> bool {
        self.id == LOCAL_RELEASE_ID
    }

    /// Version string used by the asset naming convention (leading `v` removed)
    pub fn version(&self) -> &str {
        self.id.strip_prefix('v').unwrap_or(&self.id)
    }

    /// Semantic version of the release, ignoring any build suffix
    pub fn semver(&self) -> Option<semver::Version> {
        parse_firmware_version(self.version())
    }
}

/// Parse `2.6.8` or `2.6.8.ef9d0d7` into a semantic version
pub fn parse_firmware_version(raw: &str) -> Option<semver::Version> {
    let raw = raw.trim().trim_start_matches('v');
    let mut parts = raw.splitn(4, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    Some(semver::Version::new(major, minor, patch))
}

/// Static description of a hardware model from the hardware catalog
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceHardware {
    /// Chip architecture (`nrf52840`, `esp32-s3`, `rp2040`, ...)
    pub architecture: String,
    /// PlatformIO build environment name
    pub platformio_target: String,
    /// Catalog slug (`RAK4631`, `HELTEC_V3`, ...)
    pub hw_model_slug: String,
    /// Human display name
    pub display_name: String,
    /// Numeric hardware model id
    pub hw_model: u32,
    /// Product images
    #[serde(default)]
    pub images: Vec<String>,
    /// Whether the device ships a DFU-capable bootloader
    #[serde(default)]
    pub requires_dfu: Option<bool>,
    /// Whether the unified OTA image is published for this device
    #[serde(default)]
    pub supports_unified_ota: bool,
    /// Device runs the MUI screen build
    #[serde(default)]
    pub has_mui: bool,
    /// Device runs the InkHUD screen build
    #[serde(default)]
    pub has_ink_hud: bool,
    /// Shipped bootloader must be upgraded over a wire before wireless updates work
    #[serde(default)]
    pub requires_bootloader_upgrade_for_ota: Option<bool>,
    /// Where to read about the bootloader upgrade
    #[serde(default)]
    pub bootloader_info_url: Option<String>,
}

impl DeviceHardware {
    /// Asset naming token: PlatformIO target, falling back to the slug
    pub fn target(&self) -> &str {
        if self.platformio_target.is_empty() {
            &self.hw_model_slug
        } else {
            &self.platformio_target
        }
    }

    /// ESP32 family devices update over HTTP OTA rather than DFU
    pub fn is_esp32(&self) -> bool {
        self.architecture.to_ascii_lowercase().starts_with("esp32")
    }

    /// Whether the one-time bootloader warning applies to this model
    pub fn requires_bootloader_upgrade(&self) -> bool {
        self.requires_bootloader_upgrade_for_ota == Some(true)
    }

    /// Unified image filename (`mt-esp32s3-ota.bin`) when this device can use it
    pub fn unified_image_name(&self) -> Option<String> {
        if !self.supports_unified_ota || self.has_mui || self.has_ink_hud {
            return None;
        }
        let arch: String = self
            .architecture
            .to_ascii_lowercase()
            .chars()
            .filter(|c| *c != '-')
            .collect();
        if arch.is_empty() {
            return None;
        }
        Some(format!("mt-{arch}-ota.bin"))
    }
}

/// Which release stream the user follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseChannel {
    /// Latest stable release
    #[default]
    Stable,
    /// Latest alpha (pre-release)
    Alpha,
    /// User-supplied file; never queries the network
    LocalFile,
}

impl fmt::Display for ReleaseChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseChannel::Stable => write!(f, "stable"),
            ReleaseChannel::Alpha => write!(f, "alpha"),
            ReleaseChannel::LocalFile => write!(f, "local-file"),
        }
    }
}

impl FromStr for ReleaseChannel {
    type Err = FirmwareUpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Ok(ReleaseChannel::Stable),
            "alpha" => Ok(ReleaseChannel::Alpha),
            "local" | "local-file" => Ok(ReleaseChannel::LocalFile),
            other => Err(FirmwareUpdateError::Config(format!(
                "unknown release channel '{other}'"
            ))),
        }
    }
}

/// Physical link the device is currently attached over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// Short-range radio link
    Radio,
    /// Wired serial/USB link
    Serial,
    /// TCP over WiFi/Ethernet
    Network,
    /// Nothing selected
    Disconnected,
}

impl ConnectionKind {
    /// Single-character address prefix for this link
    pub fn prefix(self) -> char {
        match self {
            ConnectionKind::Radio => 'x',
            ConnectionKind::Serial => 's',
            ConnectionKind::Network => 't',
            ConnectionKind::Disconnected => 'n',
        }
    }

    fn from_prefix(prefix: char) -> Option<Self> {
        match prefix {
            'x' => Some(ConnectionKind::Radio),
            's' => Some(ConnectionKind::Serial),
            't' => Some(ConnectionKind::Network),
            'n' => Some(ConnectionKind::Disconnected),
            _ => None,
        }
    }
}

/// Prefix telling the connection layer to reconnect after a wireless update
pub const RECONNECT_PREFIX: char = 'x';

/// Address the connection layer uses to release the link for a DFU hand-off
pub const NO_DEVICE_SELECTED: &str = "n";

/// A device address in the prefix convention (`x` + MAC, `t` + IP, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    /// Link kind from the prefix
    pub kind: ConnectionKind,
    /// Address without the prefix
    pub target: String,
}

impl DeviceAddress {
    /// Parse a prefixed address; `None` when empty or the prefix is unknown
    pub fn parse(raw: &str) -> Option<Self> {
        let mut chars = raw.chars();
        let kind = ConnectionKind::from_prefix(chars.next()?)?;
        Some(Self {
            kind,
            target: chars.as_str().to_string(),
        })
    }

    /// Whether a usable device is selected
    pub fn is_connected_target(&self) -> bool {
        self.kind != ConnectionKind::Disconnected && !self.target.is_empty()
    }

    /// Address to hand back to the connection layer after flashing
    pub fn reconnect_hint(&self) -> String {
        match self.kind {
            ConnectionKind::Radio => format!("{RECONNECT_PREFIX}{}", self.target),
            ConnectionKind::Serial | ConnectionKind::Network | ConnectionKind::Disconnected => {
                self.to_string()
            }
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.target)
    }
}

/// Identity the connected device reports about itself
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Node number on the mesh
    pub node_num: u32,
    /// Hardware model id
    pub hw_model: Option<u32>,
    /// PlatformIO environment the firmware was built for
    pub pio_env: Option<String>,
    /// Running firmware version
    pub firmware_version: Option<String>,
    /// Battery level in percent; 0 or `None` when unknown/powered
    pub battery_level: Option<u8>,
    /// Network address reported by WiFi-capable firmware
    #[serde(default)]
    pub ip_address: Option<String>,
}

/// Update path selected for a connection and hardware combination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateMethod {
    /// Vendor DFU over the radio link
    Wireless,
    /// UF2 drop onto the mass-storage bootloader
    MassStorage,
    /// HTTP OTA against the device IP
    WifiOta,
    /// No supported path
    Unknown,
}

impl UpdateMethod {
    /// Pick the update path for a link and hardware
    pub fn select(kind: ConnectionKind, hardware: &DeviceHardware) -> Self {
        match (kind, hardware.is_esp32()) {
            (ConnectionKind::Serial, true) => UpdateMethod::Unknown,
            (ConnectionKind::Serial, false) => UpdateMethod::MassStorage,
            (ConnectionKind::Radio, true) => UpdateMethod::WifiOta,
            (ConnectionKind::Radio, false) => UpdateMethod::Wireless,
            (ConnectionKind::Network, true) => UpdateMethod::WifiOta,
            (ConnectionKind::Network, false) => UpdateMethod::Unknown,
            (ConnectionKind::Disconnected, _) => UpdateMethod::Unknown,
        }
    }
}

impl fmt::Display for UpdateMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateMethod::Wireless => write!(f, "wireless"),
            UpdateMethod::MassStorage => write!(f, "mass-storage"),
            UpdateMethod::WifiOta => write!(f, "wifi"),
            UpdateMethod::Unknown => write!(f, "unknown"),
        }
    }
}

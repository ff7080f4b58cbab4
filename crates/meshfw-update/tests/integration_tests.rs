//! End-to-end orchestrator tests against in-memory collaborators and a local HTTP server

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use meshfw_update::handlers::wifi::{FIRMWARE_HASH_HEADER, firmware_sha256};
use meshfw_update::prelude::*;
use tempfile::TempDir;
use tokio::sync::broadcast;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RADIO_ADDRESS: &str = "xAA:BB:CC:DD:EE:FF";
const SERIAL_ADDRESS: &str = "s/dev/ttyACM0";

struct MockConnection {
    address: Mutex<Option<String>>,
    identity: Mutex<Option<DeviceIdentity>>,
    reconnects: AtomicBool,
    addresses_set: Mutex<Vec<String>>,
    reboots: AtomicUsize,
    ota_requests: Mutex<Vec<(OtaMode, Vec<u8>)>>,
    connection_tx: broadcast::Sender<ConnectionState>,
    identity_tx: broadcast::Sender<Option<DeviceIdentity>>,
}

impl MockConnection {
    fn new(address: Option<&str>, identity: DeviceIdentity) -> Self {
        let (connection_tx, _) = broadcast::channel(16);
        let (identity_tx, _) = broadcast::channel(16);
        Self {
            address: Mutex::new(address.map(str::to_string)),
            identity: Mutex::new(Some(identity)),
            reconnects: AtomicBool::new(true),
            addresses_set: Mutex::new(Vec::new()),
            reboots: AtomicUsize::new(0),
            ota_requests: Mutex::new(Vec::new()),
            connection_tx,
            identity_tx,
        }
    }

    fn select(&self, address: &str) {
        *self.address.lock().unwrap_or_else(PoisonError::into_inner) = Some(address.to_string());
    }

    fn set_battery(&self, level: u8) {
        if let Some(identity) = self
            .identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            identity.battery_level = Some(level);
        }
    }

    fn addresses_set(&self) -> Vec<String> {
        self.addresses_set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ota_requests(&self) -> Vec<(OtaMode, Vec<u8>)> {
        self.ota_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DeviceConnection for MockConnection {
    fn device_address(&self) -> Option<String> {
        self.address.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn current_identity(&self) -> Option<DeviceIdentity> {
        self.identity.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn set_device_address(&self, address: &str) -> meshfw_update::Result<()> {
        self.addresses_set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(address.to_string());
        if address != "n" && self.reconnects.load(Ordering::SeqCst) {
            let _ = self.connection_tx.send(ConnectionState::Connecting);
            let _ = self.connection_tx.send(ConnectionState::Connected);
            let _ = self.identity_tx.send(self.current_identity());
        }
        Ok(())
    }

    async fn reboot_into_update_mode(&self) -> meshfw_update::Result<()> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn request_ota_reboot(&self, mode: OtaMode, sha256: &[u8]) -> meshfw_update::Result<()> {
        self.ota_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((mode, sha256.to_vec()));
        Ok(())
    }

    fn subscribe_connection_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.connection_tx.subscribe()
    }

    fn subscribe_identity(&self) -> broadcast::Receiver<Option<DeviceIdentity>> {
        self.identity_tx.subscribe()
    }

    async fn wait_for_detach(&self) -> meshfw_update::Result<()> {
        Ok(())
    }
}

struct MockHardwareCatalog {
    models: HashMap<u32, DeviceHardware>,
}

#[async_trait]
impl HardwareCatalog for MockHardwareCatalog {
    async fn lookup_hardware(
        &self,
        hw_model: u32,
        _pio_env: Option<&str>,
    ) -> meshfw_update::Result<Option<DeviceHardware>> {
        Ok(self.models.get(&hw_model).cloned())
    }
}

struct MockReleaseCatalog {
    stable: FirmwareRelease,
    alpha: FirmwareRelease,
    calls: AtomicUsize,
}

#[async_trait]
impl ReleaseCatalog for MockReleaseCatalog {
    async fn latest_release(
        &self,
        channel: ReleaseChannel,
    ) -> meshfw_update::Result<Option<FirmwareRelease>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(match channel {
            ReleaseChannel::Stable => Some(self.stable.clone()),
            ReleaseChannel::Alpha => Some(self.alpha.clone()),
            ReleaseChannel::LocalFile => None,
        })
    }
}

#[derive(Default)]
struct MockDfu {
    listeners: Mutex<Vec<(DfuListenerId, Arc<dyn DfuProgressListener>)>>,
    next_id: AtomicU64,
    script: Mutex<Vec<DfuEvent>>,
    requests: Mutex<Vec<DfuRequest>>,
    aborts: AtomicUsize,
}

impl MockDfu {
    fn script(&self, events: Vec<DfuEvent>) {
        *self.script.lock().unwrap_or_else(PoisonError::into_inner) = events;
    }

    fn requests(&self) -> Vec<DfuRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DfuInitiator for MockDfu {
    async fn start(&self, request: DfuRequest) -> meshfw_update::Result<()> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        let events = self.script.lock().unwrap_or_else(PoisonError::into_inner).clone();
        for event in events {
            for listener in &listeners {
                listener.on_event(event.clone());
            }
        }
        Ok(())
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }

    fn register_listener(&self, listener: Arc<dyn DfuProgressListener>) -> DfuListenerId {
        let id = DfuListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    fn unregister_listener(&self, id: DfuListenerId) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }
}

/// Radio OTA loader that accepts everything and records the transfer
#[derive(Default)]
struct MockRadioOta {
    connect_failures: AtomicUsize,
    connects: Mutex<Vec<String>>,
    started: Mutex<Option<(u64, String)>>,
    received: Mutex<Vec<u8>>,
    chunks: AtomicUsize,
    finished: AtomicBool,
    rebooted: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl RadioOtaLink for MockRadioOta {
    async fn connect(&self, address: &str) -> meshfw_update::Result<()> {
        self.connects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(address.to_string());
        let failures_left = self.connect_failures.load(Ordering::SeqCst);
        if failures_left > 0 {
            self.connect_failures.store(failures_left - 1, Ordering::SeqCst);
            return Err(FirmwareUpdateError::TransportError("loader not advertising".into()));
        }
        Ok(())
    }

    async fn version(&self) -> meshfw_update::Result<OtaVersionInfo> {
        Ok(OtaVersionInfo {
            hw_version: Some("heltec-v3".into()),
            fw_version: Some("2.5.0".into()),
        })
    }

    async fn start_ota(&self, size: u64, sha256_hex: &str) -> meshfw_update::Result<()> {
        *self.started.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((size, sha256_hex.to_string()));
        Ok(())
    }

    async fn write_chunk(&self, chunk: &[u8]) -> meshfw_update::Result<()> {
        self.chunks.fetch_add(1, Ordering::SeqCst);
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(chunk);
        Ok(())
    }

    async fn finish(&self) -> meshfw_update::Result<()> {
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reboot(&self) -> meshfw_update::Result<()> {
        self.rebooted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn rak4631() -> DeviceHardware {
    DeviceHardware {
        architecture: "nrf52840".to_string(),
        platformio_target: "rak4631".to_string(),
        hw_model_slug: "RAK4631".to_string(),
        display_name: "RAK WisBlock 4631".to_string(),
        hw_model: 9,
        ..Default::default()
    }
}

fn heltec_v3() -> DeviceHardware {
    DeviceHardware {
        architecture: "esp32-s3".to_string(),
        platformio_target: "heltec-v3".to_string(),
        hw_model_slug: "HELTEC_V3".to_string(),
        display_name: "Heltec V3".to_string(),
        hw_model: 43,
        ..Default::default()
    }
}

fn identity_for(hardware: &DeviceHardware) -> DeviceIdentity {
    DeviceIdentity {
        node_num: 0x1234_5678,
        hw_model: Some(hardware.hw_model),
        pio_env: Some(hardware.platformio_target.clone()),
        firmware_version: Some("2.5.0.abcdef0".to_string()),
        battery_level: Some(80),
        ip_address: None,
    }
}

struct Harness {
    orchestrator: UpdateOrchestrator,
    connection: Arc<MockConnection>,
    releases: Arc<MockReleaseCatalog>,
    dfu: Arc<MockDfu>,
    server: MockServer,
    scratch: PathBuf,
    dir: TempDir,
}

impl Harness {
    async fn new(address: Option<&str>, hardware: DeviceHardware) -> Result<Self> {
        Self::build(address, hardware, |config| config, None).await
    }

    async fn build(
        address: Option<&str>,
        hardware: DeviceHardware,
        tweak: impl FnOnce(UpdateConfig) -> UpdateConfig,
        radio_ota: Option<Arc<dyn RadioOtaLink>>,
    ) -> Result<Self> {
        let server = MockServer::start().await;
        let dir = TempDir::new()?;
        let scratch = dir.path().join("scratch");

        let config = UpdateConfig::default()
            .with_firmware_base_url(server.uri())
            .with_scratch_dir(&scratch)
            .with_reboot_delay(Duration::from_millis(10))
            .with_detach_timeout(Duration::from_millis(200))
            .with_verification(Duration::from_secs(3), Duration::from_millis(10))
            .with_wifi_ota(WifiOtaSettings {
                connect_attempts: 3,
                retry_delay: Duration::from_millis(20),
                ..Default::default()
            });
        let config = tweak(config);

        let connection = Arc::new(MockConnection::new(address, identity_for(&hardware)));
        let releases = Arc::new(MockReleaseCatalog {
            stable: FirmwareRelease::new(
                "v2.6.8",
                format!("{}/releases/firmware-esp32-2.6.8.zip", server.uri()),
            ),
            alpha: FirmwareRelease::new(
                "v2.7.1",
                format!("{}/releases/firmware-esp32-2.7.1.zip", server.uri()),
            ),
            calls: AtomicUsize::new(0),
        });
        let dfu = Arc::new(MockDfu::default());
        let catalog = Arc::new(MockHardwareCatalog {
            models: HashMap::from([(hardware.hw_model, hardware)]),
        });

        let orchestrator = UpdateOrchestrator::new(
            config,
            Collaborators {
                connection: connection.clone(),
                hardware_catalog: catalog,
                release_catalog: releases.clone(),
                warning_store: Arc::new(MemoryWarningStore::new()),
                dfu: dfu.clone(),
                radio_ota,
            },
        )?;

        Ok(Self {
            orchestrator,
            connection,
            releases,
            dfu,
            server,
            scratch,
            dir,
        })
    }

    async fn mount_asset(&self, asset_path: &str, body: &[u8]) {
        Mock::given(method("HEAD"))
            .and(path(asset_path))
            .respond_with(ResponseTemplate::new(200))
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path(asset_path))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(&self.server)
            .await;
    }

    async fn ready(&self) -> Result<UpdateState> {
        let mut rx = self.orchestrator.subscribe();
        self.orchestrator.check_for_updates().await;
        let seen = wait_for(&mut rx, |s| {
            matches!(s, UpdateState::Ready { .. } | UpdateState::Error { .. })
        })
        .await?;
        seen.last().cloned().ok_or_else(|| anyhow!("no state observed"))
    }

    fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(&self.scratch)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }
}

/// Collect states until one matches; the match is the last element
async fn wait_for(
    rx: &mut broadcast::Receiver<UpdateState>,
    predicate: impl Fn(&UpdateState) -> bool,
) -> Result<Vec<UpdateState>> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(state) => {
                    let done = predicate(&state);
                    seen.push(state);
                    if done {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(anyhow!("state channel closed"));
                }
            }
        }
    })
    .await
    .map_err(|_| anyhow!("timed out; states seen: {seen:?}"))??;
    Ok(seen)
}

fn dfu_script(address: &str, last: DfuEvent) -> Vec<DfuEvent> {
    vec![
        DfuEvent::Starting {
            address: address.to_string(),
        },
        DfuEvent::Progress {
            address: address.to_string(),
            percent: 10,
        },
        DfuEvent::Progress {
            address: address.to_string(),
            percent: 55,
        },
        last,
    ]
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

mod check_tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_carries_release_hardware_and_method() -> Result<()> {
        let harness = Harness::new(Some(RADIO_ADDRESS), rak4631()).await?;
        let UpdateState::Ready {
            release,
            hardware,
            address,
            show_bootloader_warning,
            method,
            current_version,
        } = harness.ready().await?
        else {
            anyhow::bail!("expected Ready, got {:?}", harness.orchestrator.state());
        };

        assert_eq!(release.map(|r| r.id), Some("v2.6.8".to_string()));
        assert_eq!(hardware.platformio_target, "rak4631");
        assert_eq!(address.to_string(), RADIO_ADDRESS);
        assert!(!show_bootloader_warning);
        assert_eq!(method, UpdateMethod::Wireless);
        assert_eq!(current_version.as_deref(), Some("2.5.0.abcdef0"));
        Ok(())
    }

    #[tokio::test]
    async fn test_bootloader_warning_dismissal_persists() -> Result<()> {
        let hardware = DeviceHardware {
            requires_bootloader_upgrade_for_ota: Some(true),
            ..rak4631()
        };
        let harness = Harness::new(Some(RADIO_ADDRESS), hardware).await?;

        assert!(matches!(
            harness.ready().await?,
            UpdateState::Ready {
                show_bootloader_warning: true,
                ..
            }
        ));
        harness.orchestrator.dismiss_bootloader_warning()?;
        assert!(matches!(
            harness.orchestrator.state(),
            UpdateState::Ready {
                show_bootloader_warning: false,
                ..
            }
        ));

        assert!(matches!(
            harness.ready().await?,
            UpdateState::Ready {
                show_bootloader_warning: false,
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_repeated_check_gives_same_ready() -> Result<()> {
        let harness = Harness::new(Some(RADIO_ADDRESS), rak4631()).await?;
        let first = harness.ready().await?;
        let second = harness.ready().await?;
        assert_eq!(first, second);
        assert_eq!(harness.releases.calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_no_device_is_error() -> Result<()> {
        let harness = Harness::new(None, rak4631()).await?;
        assert_eq!(harness.ready().await?, UpdateState::error("No device connected"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_hardware_is_error() -> Result<()> {
        let harness = Harness::new(Some(RADIO_ADDRESS), rak4631()).await?;
        if let Some(identity) = harness
            .connection
            .identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            identity.hw_model = Some(999);
        }

        let UpdateState::Error { message } = harness.ready().await? else {
            anyhow::bail!("expected Error");
        };
        assert!(message.contains("unknown hardware model 999"), "{message}");
        Ok(())
    }

    #[tokio::test]
    async fn test_release_channel_switch() -> Result<()> {
        let harness = Harness::new(Some(RADIO_ADDRESS), rak4631()).await?;
        harness.ready().await?;

        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.set_release_channel(ReleaseChannel::Alpha).await;
        let seen = wait_for(&mut rx, |s| matches!(s, UpdateState::Ready { .. })).await?;
        assert!(matches!(
            seen.last(),
            Some(UpdateState::Ready { release: Some(release), .. }) if release.id == "v2.7.1"
        ));
        assert_eq!(harness.orchestrator.release_channel(), ReleaseChannel::Alpha);

        let calls = harness.releases.calls.load(Ordering::SeqCst);
        harness.orchestrator.set_release_channel(ReleaseChannel::LocalFile).await;
        let seen = wait_for(&mut rx, |s| matches!(s, UpdateState::Ready { .. })).await?;
        assert!(matches!(
            seen.last(),
            Some(UpdateState::Ready { release: Some(release), .. }) if release.is_local()
        ));
        assert_eq!(harness.releases.calls.load(Ordering::SeqCst), calls);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_after_error_rechecks() -> Result<()> {
        let harness = Harness::new(None, rak4631()).await?;
        assert!(matches!(harness.ready().await?, UpdateState::Error { .. }));

        harness.connection.select(RADIO_ADDRESS);
        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.retry().await?;
        wait_for(&mut rx, |s| matches!(s, UpdateState::Ready { .. })).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_requires_failure() -> Result<()> {
        let harness = Harness::new(Some(RADIO_ADDRESS), rak4631()).await?;
        harness.ready().await?;
        assert!(matches!(
            harness.orchestrator.retry().await,
            Err(FirmwareUpdateError::InvalidState(_))
        ));
        Ok(())
    }
}

mod start_gate_tests {
    use super::*;

    #[tokio::test]
    async fn test_low_battery_blocks_start() -> Result<()> {
        let harness = Harness::new(Some(RADIO_ADDRESS), rak4631()).await?;
        harness.ready().await?;
        harness.connection.set_battery(5);

        let result = harness.orchestrator.start_update().await;
        assert!(matches!(
            result,
            Err(FirmwareUpdateError::BatteryTooLow { level: 5 })
        ));
        assert!(matches!(harness.orchestrator.state(), UpdateState::Ready { .. }));
        assert!(harness.dfu.requests().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_unreported_battery_does_not_block() -> Result<()> {
        let harness = Harness::new(Some(RADIO_ADDRESS), rak4631()).await?;
        harness
            .mount_asset("/firmware-2.6.8/firmware-rak4631-2.6.8-ota.zip", b"dfu")
            .await;
        harness.dfu.script(dfu_script(
            "AA:BB:CC:DD:EE:FF",
            DfuEvent::Completed {
                address: "AA:BB:CC:DD:EE:FF".to_string(),
            },
        ));
        harness.ready().await?;
        harness.connection.set_battery(0);

        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.start_update().await?;
        wait_for(&mut rx, UpdateState::is_terminal).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_start_without_check_is_invalid() -> Result<()> {
        let harness = Harness::new(Some(RADIO_ADDRESS), rak4631()).await?;
        assert!(matches!(
            harness.orchestrator.start_update().await,
            Err(FirmwareUpdateError::InvalidState(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_esp32_over_serial_is_unsupported() -> Result<()> {
        let harness = Harness::new(Some(SERIAL_ADDRESS), heltec_v3()).await?;
        assert!(matches!(
            harness.ready().await?,
            UpdateState::Ready {
                method: UpdateMethod::Unknown,
                ..
            }
        ));

        let result = harness.orchestrator.start_update().await;
        assert!(matches!(result, Err(FirmwareUpdateError::UnsupportedMethod(_))));
        assert!(matches!(harness.orchestrator.state(), UpdateState::Error { .. }));
        Ok(())
    }
}

mod wireless_tests {
    use super::*;

    const DFU_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    #[tokio::test]
    async fn test_wireless_update_reaches_success() -> Result<()> {
        let harness = Harness::new(Some(RADIO_ADDRESS), rak4631()).await?;
        harness
            .mount_asset("/firmware-2.6.8/firmware-rak4631-2.6.8-ota.zip", b"dfu package")
            .await;
        harness.dfu.script(dfu_script(
            DFU_ADDRESS,
            DfuEvent::Completed {
                address: DFU_ADDRESS.to_string(),
            },
        ));
        harness.ready().await?;

        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.start_update().await?;
        let seen = wait_for(&mut rx, UpdateState::is_terminal).await?;

        let tail = seen.get(seen.len().saturating_sub(5)..).unwrap_or_default();
        assert_eq!(
            tail,
            [
                UpdateState::processing("Starting DFU"),
                UpdateState::updating(0.10, "Updating firmware"),
                UpdateState::updating(0.55, "Updating firmware"),
                UpdateState::Verifying,
                UpdateState::Success,
            ]
        );
        assert!(seen.iter().any(|s| matches!(s, UpdateState::Downloading { .. })));

        let requests = harness.dfu.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].address, DFU_ADDRESS);
        assert_eq!(file_name(&requests[0].archive), Some("firmware-rak4631-2.6.8-ota.zip"));
        assert_eq!(
            harness.connection.addresses_set(),
            vec!["n".to_string(), RADIO_ADDRESS.to_string()]
        );
        assert!(harness.scratch_is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_full_session_burst_reaches_success() -> Result<()> {
        let harness = Harness::new(Some(RADIO_ADDRESS), rak4631()).await?;
        harness
            .mount_asset("/firmware-2.6.8/firmware-rak4631-2.6.8-ota.zip", b"dfu package")
            .await;
        // Every callback fires from start() before the orchestrator drains one
        let address = DFU_ADDRESS.to_string();
        let mut script = vec![DfuEvent::Starting {
            address: address.clone(),
        }];
        script.extend((1..=100).map(|percent| DfuEvent::Progress {
            address: address.clone(),
            percent,
        }));
        script.push(DfuEvent::Validating {
            address: address.clone(),
        });
        script.push(DfuEvent::Completed { address });
        harness.dfu.script(script);
        harness.ready().await?;

        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.start_update().await?;
        let seen = wait_for(&mut rx, UpdateState::is_terminal).await?;

        assert_eq!(seen.last(), Some(&UpdateState::Success), "{seen:?}");
        assert!(seen.contains(&UpdateState::processing("Validating firmware")));
        assert!(seen.contains(&UpdateState::Verifying));
        assert_eq!(harness.dfu.aborts.load(Ordering::SeqCst), 0);
        assert!(harness.scratch_is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_stalled_dfu_is_aborted() -> Result<()> {
        let harness = Harness::build(
            Some(RADIO_ADDRESS),
            rak4631(),
            |config| config.with_dfu_stall_timeout(Duration::from_millis(200)),
            None,
        )
        .await?;
        harness
            .mount_asset("/firmware-2.6.8/firmware-rak4631-2.6.8-ota.zip", b"dfu package")
            .await;
        harness.dfu.script(vec![
            DfuEvent::Starting {
                address: DFU_ADDRESS.to_string(),
            },
            DfuEvent::Progress {
                address: DFU_ADDRESS.to_string(),
                percent: 40,
            },
        ]);
        harness.ready().await?;

        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.start_update().await?;
        let seen = wait_for(&mut rx, UpdateState::is_terminal).await?;

        let Some(UpdateState::Error { message }) = seen.last() else {
            anyhow::bail!("expected Error, saw {seen:?}");
        };
        assert!(message.contains("DFU stalled"), "{message}");
        assert_eq!(harness.dfu.aborts.load(Ordering::SeqCst), 1);
        assert!(harness.scratch_is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_dfu_abort_is_error() -> Result<()> {
        let harness = Harness::new(Some(RADIO_ADDRESS), rak4631()).await?;
        harness
            .mount_asset("/firmware-2.6.8/firmware-rak4631-2.6.8-ota.zip", b"dfu package")
            .await;
        harness.dfu.script(dfu_script(
            DFU_ADDRESS,
            DfuEvent::Aborted {
                address: DFU_ADDRESS.to_string(),
            },
        ));
        harness.ready().await?;

        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.start_update().await?;
        let seen = wait_for(&mut rx, UpdateState::is_terminal).await?;

        assert_eq!(seen.last(), Some(&UpdateState::error("DFU Aborted")));
        assert!(harness.scratch_is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_asset_is_error() -> Result<()> {
        let harness = Harness::new(Some(RADIO_ADDRESS), rak4631()).await?;
        harness.ready().await?;

        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.start_update().await?;
        let seen = wait_for(&mut rx, UpdateState::is_terminal).await?;

        let Some(UpdateState::Error { message }) = seen.last() else {
            anyhow::bail!("expected Error, saw {seen:?}");
        };
        assert!(message.contains("rak4631"), "{message}");
        assert!(harness.dfu.requests().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_verification_timeout_then_accept() -> Result<()> {
        let harness = Harness::build(
            Some(RADIO_ADDRESS),
            rak4631(),
            |config| config.with_verification(Duration::from_millis(200), Duration::from_millis(10)),
            None,
        )
        .await?;
        harness
            .mount_asset("/firmware-2.6.8/firmware-rak4631-2.6.8-ota.zip", b"dfu package")
            .await;
        harness.dfu.script(dfu_script(
            DFU_ADDRESS,
            DfuEvent::Completed {
                address: DFU_ADDRESS.to_string(),
            },
        ));
        harness.connection.reconnects.store(false, Ordering::SeqCst);
        harness.ready().await?;

        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.start_update().await?;
        let seen = wait_for(&mut rx, UpdateState::is_terminal).await?;
        assert_eq!(seen.last(), Some(&UpdateState::VerificationFailed));

        harness.orchestrator.accept_unverified()?;
        assert_eq!(harness.orchestrator.state(), UpdateState::Success);
        assert!(harness.orchestrator.accept_unverified().is_err());
        Ok(())
    }
}

mod mass_storage_tests {
    use super::*;

    #[tokio::test]
    async fn test_uf2_update_through_save() -> Result<()> {
        let harness = Harness::new(Some(SERIAL_ADDRESS), rak4631()).await?;
        harness
            .mount_asset("/firmware-2.6.8/firmware-rak4631-2.6.8.uf2", b"UF2 image bytes")
            .await;
        harness.ready().await?;

        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.start_update().await?;
        let seen = wait_for(&mut rx, |s| {
            matches!(s, UpdateState::AwaitingFileSave { .. }) || s.is_terminal()
        })
        .await?;

        let Some(UpdateState::AwaitingFileSave {
            file: Some(file),
            filename,
            source: None,
        }) = seen.last()
        else {
            anyhow::bail!("expected AwaitingFileSave, saw {seen:?}");
        };
        assert_eq!(filename, "firmware-rak4631-2.6.8.uf2");
        assert!(file.exists());
        assert_eq!(harness.connection.reboots.load(Ordering::SeqCst), 1);

        let destination = harness.dir.path().join("volume").join(filename);
        std::fs::create_dir_all(harness.dir.path().join("volume"))?;
        harness.orchestrator.save_firmware_file(&destination).await?;
        let seen = wait_for(&mut rx, UpdateState::is_terminal).await?;

        assert_eq!(
            seen,
            vec![
                UpdateState::processing("Flashing"),
                UpdateState::Verifying,
                UpdateState::Success,
            ]
        );
        assert_eq!(std::fs::read(&destination)?, b"UF2 image bytes");
        assert_eq!(
            harness.connection.addresses_set(),
            vec![SERIAL_ADDRESS.to_string()]
        );
        assert!(harness.scratch_is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_check_discards_parked_save_and_scratch() -> Result<()> {
        let harness = Harness::new(Some(SERIAL_ADDRESS), rak4631()).await?;
        harness
            .mount_asset("/firmware-2.6.8/firmware-rak4631-2.6.8.uf2", b"UF2 image bytes")
            .await;
        harness.ready().await?;

        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.start_update().await?;
        let seen = wait_for(&mut rx, |s| {
            matches!(s, UpdateState::AwaitingFileSave { .. }) || s.is_terminal()
        })
        .await?;
        let Some(UpdateState::AwaitingFileSave { file: Some(file), .. }) = seen.last() else {
            anyhow::bail!("expected AwaitingFileSave, saw {seen:?}");
        };
        assert!(file.exists());

        assert!(matches!(harness.ready().await?, UpdateState::Ready { .. }));
        assert!(!file.exists());
        assert!(harness.scratch_is_empty());

        let result = harness
            .orchestrator
            .save_firmware_file(harness.dir.path().join("late.uf2"))
            .await;
        assert!(matches!(result, Err(FirmwareUpdateError::InvalidState(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_local_file_skips_retrieval() -> Result<()> {
        let harness = Harness::new(Some(SERIAL_ADDRESS), rak4631()).await?;
        harness.ready().await?;
        let source = harness.dir.path().join("custom.uf2");
        std::fs::write(&source, b"custom build")?;

        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.start_update_from_file(&source).await?;
        let seen = wait_for(&mut rx, |s| {
            matches!(s, UpdateState::AwaitingFileSave { .. }) || s.is_terminal()
        })
        .await?;

        assert!(!seen.iter().any(|s| matches!(s, UpdateState::Downloading { .. })));
        assert_eq!(
            seen.last(),
            Some(&UpdateState::AwaitingFileSave {
                file: None,
                filename: "firmware.uf2".to_string(),
                source: Some(source.clone()),
            })
        );

        let destination = harness.dir.path().join("firmware.uf2");
        harness.orchestrator.save_firmware_file(&destination).await?;
        wait_for(&mut rx, |s| *s == UpdateState::Success).await?;
        assert_eq!(std::fs::read(&destination)?, b"custom build");
        assert!(source.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_save_outside_awaiting_is_invalid() -> Result<()> {
        let harness = Harness::new(Some(SERIAL_ADDRESS), rak4631()).await?;
        harness.ready().await?;
        let result = harness
            .orchestrator
            .save_firmware_file(harness.dir.path().join("x.uf2"))
            .await;
        assert!(matches!(result, Err(FirmwareUpdateError::InvalidState(_))));
        Ok(())
    }
}

mod cancellation_tests {
    use super::*;

    async fn mount_slow_asset(harness: &Harness) {
        let asset = "/firmware-2.6.8/firmware-rak4631-2.6.8-ota.zip";
        Mock::given(method("HEAD"))
            .and(path(asset))
            .respond_with(ResponseTemplate::new(200))
            .mount(&harness.server)
            .await;
        Mock::given(method("GET"))
            .and(path(asset))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"dfu package".to_vec())
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&harness.server)
            .await;
    }

    #[tokio::test]
    async fn test_cancel_during_download_returns_to_ready() -> Result<()> {
        let harness = Harness::new(Some(RADIO_ADDRESS), rak4631()).await?;
        mount_slow_asset(&harness).await;
        harness.ready().await?;

        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.start_update().await?;
        wait_for(&mut rx, |s| matches!(s, UpdateState::Downloading { .. })).await?;

        harness.orchestrator.cancel_update().await;
        let seen = wait_for(&mut rx, |s| matches!(s, UpdateState::Ready { .. })).await?;

        let names: Vec<_> = seen.iter().map(UpdateState::name).collect();
        assert_eq!(names, ["idle", "checking", "ready"]);
        assert!(harness.scratch_is_empty());
        assert!(harness.dfu.requests().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_second_start_cancels_first() -> Result<()> {
        let harness = Harness::new(Some(RADIO_ADDRESS), rak4631()).await?;
        mount_slow_asset(&harness).await;
        harness.ready().await?;

        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.start_update().await?;
        wait_for(&mut rx, |s| matches!(s, UpdateState::Downloading { .. })).await?;

        harness.orchestrator.start_update().await?;
        let seen = wait_for(&mut rx, |s| matches!(s, UpdateState::Downloading { .. })).await?;
        assert_eq!(seen.first(), Some(&UpdateState::Idle));

        harness.orchestrator.shutdown().await;
        assert_eq!(harness.orchestrator.state(), UpdateState::Idle);
        assert!(harness.dfu.requests().is_empty());
        Ok(())
    }
}

mod wifi_tests {
    use super::*;

    const IMAGE: &[u8] = b"esp32 application image";

    async fn wifi_harness() -> Result<Harness> {
        let harness = Harness::new(None, heltec_v3()).await?;
        // The OTA listener shares the firmware server
        harness.connection.select(&format!("t{}", harness.server.address()));
        harness
            .mount_asset("/firmware-2.6.8/firmware-heltec-v3-2.6.8.bin", IMAGE)
            .await;
        Mock::given(method("GET"))
            .and(path("/ota/version"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"hw_version": "heltec-v3", "fw_version": "2.5.0"})),
            )
            .mount(&harness.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ota/reboot"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&harness.server)
            .await;
        Ok(harness)
    }

    #[tokio::test]
    async fn test_wifi_ota_uploads_hashed_image() -> Result<()> {
        let harness = wifi_harness().await?;
        let hash_hex = hex::encode(firmware_sha256(IMAGE));
        Mock::given(method("POST"))
            .and(path("/ota/update"))
            .and(header(FIRMWARE_HASH_HEADER, hash_hex.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&harness.server)
            .await;

        assert!(matches!(
            harness.ready().await?,
            UpdateState::Ready {
                method: UpdateMethod::WifiOta,
                ..
            }
        ));
        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.start_update().await?;
        let seen = wait_for(&mut rx, UpdateState::is_terminal).await?;

        assert_eq!(seen.last(), Some(&UpdateState::Success), "{seen:?}");
        assert!(seen.contains(&UpdateState::updating(1.0, "Uploading firmware")));
        assert_eq!(
            harness.connection.ota_requests(),
            vec![(OtaMode::Wifi, firmware_sha256(IMAGE).to_vec())]
        );
        assert!(harness.scratch_is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_wifi_ota_hash_rejection() -> Result<()> {
        let harness = wifi_harness().await?;
        Mock::given(method("POST"))
            .and(path("/ota/update"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Hash Rejected"))
            .mount(&harness.server)
            .await;

        harness.ready().await?;
        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.start_update().await?;
        let seen = wait_for(&mut rx, UpdateState::is_terminal).await?;

        let Some(UpdateState::Error { message }) = seen.last() else {
            anyhow::bail!("expected Error, saw {seen:?}");
        };
        assert!(message.contains("Device rejected the firmware hash"), "{message}");
        Ok(())
    }

    async fn radio_harness(link: Arc<MockRadioOta>) -> Result<Harness> {
        let harness = Harness::build(
            Some(RADIO_ADDRESS),
            heltec_v3(),
            |config| {
                config.with_radio_ota(RadioOtaSettings {
                    chunk_size: 8,
                    connect_attempts: 3,
                    retry_delay: Duration::from_millis(20),
                })
            },
            Some(link as Arc<dyn RadioOtaLink>),
        )
        .await?;
        harness
            .mount_asset("/firmware-2.6.8/firmware-heltec-v3-2.6.8.bin", IMAGE)
            .await;
        Ok(harness)
    }

    #[tokio::test]
    async fn test_radio_ota_without_wifi_address() -> Result<()> {
        let link = Arc::new(MockRadioOta::default());
        link.connect_failures.store(1, Ordering::SeqCst);
        let harness = radio_harness(link.clone()).await?;

        assert!(matches!(
            harness.ready().await?,
            UpdateState::Ready {
                method: UpdateMethod::WifiOta,
                ..
            }
        ));
        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.start_update().await?;
        let seen = wait_for(&mut rx, UpdateState::is_terminal).await?;

        assert_eq!(seen.last(), Some(&UpdateState::Success), "{seen:?}");
        assert!(seen.contains(&UpdateState::processing("Connecting to device (attempt 2/3)")));
        assert!(seen.contains(&UpdateState::updating(1.0, "Uploading firmware")));

        let hash = firmware_sha256(IMAGE);
        assert_eq!(harness.connection.ota_requests(), vec![(OtaMode::Radio, hash.to_vec())]);
        assert_eq!(
            *link.connects.lock().unwrap_or_else(PoisonError::into_inner),
            vec!["AA:BB:CC:DD:EE:FF".to_string(); 2]
        );
        assert_eq!(
            *link.started.lock().unwrap_or_else(PoisonError::into_inner),
            Some((IMAGE.len() as u64, hex::encode(hash)))
        );
        assert_eq!(*link.received.lock().unwrap_or_else(PoisonError::into_inner), IMAGE);
        assert_eq!(link.chunks.load(Ordering::SeqCst), IMAGE.len().div_ceil(8));
        assert!(link.finished.load(Ordering::SeqCst));
        assert!(link.rebooted.load(Ordering::SeqCst));
        assert!(link.closed.load(Ordering::SeqCst));
        assert!(harness.scratch_is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_radio_ota_unreachable_loader_closes_link() -> Result<()> {
        let link = Arc::new(MockRadioOta::default());
        link.connect_failures.store(usize::MAX, Ordering::SeqCst);
        let harness = radio_harness(link.clone()).await?;
        harness.ready().await?;

        let mut rx = harness.orchestrator.subscribe();
        harness.orchestrator.start_update().await?;
        let seen = wait_for(&mut rx, UpdateState::is_terminal).await?;

        let Some(UpdateState::Error { message }) = seen.last() else {
            anyhow::bail!("expected Error, saw {seen:?}");
        };
        assert!(message.contains("after 3 attempts"), "{message}");
        assert_eq!(link.chunks.load(Ordering::SeqCst), 0);
        assert!(link.closed.load(Ordering::SeqCst));
        assert!(harness.scratch_is_empty());
        Ok(())
    }
}

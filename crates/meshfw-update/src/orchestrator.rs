//! Update orchestrator
//!
//! Owns the state machine and the single task slot. Every check, update and
//! save runs as the one task in that slot; starting a new task stops the
//! previous one first. State is held as a snapshot and broadcast on every
//! transition.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::collaborators::{
    BootloaderWarningStore, ConnectionState, DeviceConnection, HardwareCatalog, RadioOtaLink,
    ReleaseCatalog,
};
use crate::config::UpdateConfig;
use crate::dfu::{DfuEvent, DfuEventStream, DfuInitiator, dfu_event_to_state};
use crate::error::{FirmwareUpdateError, Result};
use crate::file_store::FileStore;
use crate::handlers::{
    MassStorageUpdateHandler, StateSink, UpdateHandler, UpdateRequest, WifiOtaUpdateHandler,
    WirelessUpdateHandler,
};
use crate::model::{
    ConnectionKind, DeviceAddress, DeviceHardware, DeviceIdentity, FirmwareRelease,
    ReleaseChannel, UpdateMethod,
};
use crate::retriever::FirmwareRetriever;
use crate::state::UpdateState;

const STATE_CHANNEL_CAPACITY: usize = 256;
const DFU_EVENT_CAPACITY: usize = 64;

/// Whether a reported battery level blocks an update
///
/// Levels in `1..=threshold` block; `0` and unknown mean "powered or not
/// reported" and never block.
pub fn battery_blocks_update(level: Option<u8>, threshold: u8) -> bool {
    level.is_some_and(|level| (1..=threshold).contains(&level))
}

/// External services the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    /// Live device connection
    pub connection: Arc<dyn DeviceConnection>,
    /// Hardware database
    pub hardware_catalog: Arc<dyn HardwareCatalog>,
    /// Release feed
    pub release_catalog: Arc<dyn ReleaseCatalog>,
    /// Bootloader warning dismissals
    pub warning_store: Arc<dyn BootloaderWarningStore>,
    /// Platform DFU library
    pub dfu: Arc<dyn DfuInitiator>,
    /// ESP32 OTA over the radio link; without it radio-attached ESP32 devices
    /// need a reported WiFi address
    pub radio_ota: Option<Arc<dyn RadioOtaLink>>,
}

/// Everything resolved by the last successful check
#[derive(Debug, Clone)]
struct ReadyContext {
    release: Option<FirmwareRelease>,
    hardware: DeviceHardware,
    address: DeviceAddress,
    method: UpdateMethod,
    identity: DeviceIdentity,
}

/// Mass-storage update parked at `AwaitingFileSave`
#[derive(Debug, Clone)]
struct PendingSave {
    file: Option<PathBuf>,
    source: Option<PathBuf>,
    address: DeviceAddress,
}

struct TaskSlot {
    handle: JoinHandle<()>,
    cancel: CancelToken,
}

impl TaskSlot {
    /// Stop the task; returns whether it was still running
    async fn stop(self) -> bool {
        let running = !self.handle.is_finished();
        self.cancel.cancel();
        self.handle.abort();
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            error!(error = %e, "Update task panicked");
        }
        running
    }

    /// Wait for the task to finish on its own
    async fn join(self) {
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            error!(error = %e, "Update task panicked");
        }
    }
}

/// Calls [`DfuInitiator::abort`] if the wireless flow is torn down mid-session
struct DfuAbortGuard {
    dfu: Arc<dyn DfuInitiator>,
    armed: bool,
}

impl DfuAbortGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DfuAbortGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!("Aborting DFU session");
            self.dfu.abort();
        }
    }
}

struct Inner {
    config: UpdateConfig,
    store: FileStore,
    connection: Arc<dyn DeviceConnection>,
    hardware_catalog: Arc<dyn HardwareCatalog>,
    release_catalog: Arc<dyn ReleaseCatalog>,
    warning_store: Arc<dyn BootloaderWarningStore>,
    dfu: Arc<dyn DfuInitiator>,
    wireless: WirelessUpdateHandler,
    mass_storage: MassStorageUpdateHandler,
    wifi: WifiOtaUpdateHandler,
    state: RwLock<UpdateState>,
    state_tx: broadcast::Sender<UpdateState>,
    channel: Mutex<ReleaseChannel>,
    ready: Mutex<Option<ReadyContext>>,
    pending_save: Mutex<Option<PendingSave>>,
    task: tokio::sync::Mutex<Option<TaskSlot>>,
}

/// Drives firmware checks and updates for the connected device
#[derive(Clone)]
pub struct UpdateOrchestrator {
    inner: Arc<Inner>,
}

impl UpdateOrchestrator {
    /// Create an orchestrator with an HTTP client built from `config`
    pub fn new(config: UpdateConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let store = FileStore::new(&config)?;
        Ok(Self::with_file_store(config, store, collaborators))
    }

    /// Create an orchestrator around an existing file store
    pub fn with_file_store(
        config: UpdateConfig,
        store: FileStore,
        collaborators: Collaborators,
    ) -> Self {
        let Collaborators {
            connection,
            hardware_catalog,
            release_catalog,
            warning_store,
            dfu,
            radio_ota,
        } = collaborators;

        let retriever = Arc::new(FirmwareRetriever::new(
            store.clone(),
            config.firmware_base_url.clone(),
        ));
        let wireless = WirelessUpdateHandler::new(
            retriever.clone(),
            connection.clone(),
            dfu.clone(),
            config.dfu.clone(),
        );
        let mass_storage =
            MassStorageUpdateHandler::new(retriever.clone(), connection.clone(), config.reboot_delay);
        let mut wifi =
            WifiOtaUpdateHandler::new(retriever, connection.clone(), config.wifi_ota.clone());
        if let Some(link) = radio_ota {
            wifi = wifi.with_radio_link(link, config.radio_ota.clone());
        }
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                config,
                store,
                connection,
                hardware_catalog,
                release_catalog,
                warning_store,
                dfu,
                wireless,
                mass_storage,
                wifi,
                state: RwLock::new(UpdateState::Idle),
                state_tx,
                channel: Mutex::new(ReleaseChannel::default()),
                ready: Mutex::new(None),
                pending_save: Mutex::new(None),
                task: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Current state snapshot
    pub fn state(&self) -> UpdateState {
        self.inner.current_state()
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateState> {
        self.inner.state_tx.subscribe()
    }

    /// Active release channel
    pub fn release_channel(&self) -> ReleaseChannel {
        self.inner.channel()
    }

    /// Scratch file store
    pub fn file_store(&self) -> &FileStore {
        &self.inner.store
    }

    /// Resolve hardware and release for the connected device and emit `Ready`
    ///
    /// Cancels whatever task is in flight.
    pub async fn check_for_updates(&self) {
        self.replace_task(|inner, cancel| async move { inner.run_check(&cancel).await })
            .await;
    }

    /// Switch release channel and re-run the check
    pub async fn set_release_channel(&self, channel: ReleaseChannel) {
        *self.inner.channel.lock().unwrap_or_else(PoisonError::into_inner) = channel;
        info!(%channel, "Release channel changed");
        self.check_for_updates().await;
    }

    /// Start updating to the release from the last check
    ///
    /// Fails without changing state when the battery is too low. Starting
    /// while another update is running cancels that update first.
    pub async fn start_update(&self) -> Result<()> {
        self.start(None).await
    }

    /// Start updating from a user-supplied firmware file
    pub async fn start_update_from_file(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.start(Some(path.into())).await
    }

    /// Cancel the running task, clear scratch storage and check again
    pub async fn cancel_update(&self) {
        self.stop_task().await;
        self.inner.take_pending_save();
        self.inner.store.purge_all().await;
        self.inner.set_state(UpdateState::Idle);
        info!("Update cancelled");
        self.check_for_updates().await;
    }

    /// Persist the bootloader warning dismissal and hide the warning
    pub fn dismiss_bootloader_warning(&self) -> Result<()> {
        let UpdateState::Ready {
            release,
            hardware,
            address,
            method,
            current_version,
            ..
        } = self.state()
        else {
            return Err(FirmwareUpdateError::InvalidState(
                "bootloader warning can only be dismissed while ready".to_string(),
            ));
        };

        if let Err(e) = self.inner.warning_store.dismiss(&address.to_string()) {
            warn!(%address, error = %e, "Failed to persist bootloader warning dismissal");
        }
        self.inner.set_state(UpdateState::Ready {
            release,
            hardware,
            address,
            show_bootloader_warning: false,
            method,
            current_version,
        });
        Ok(())
    }

    /// Save the pending UF2 image onto the mass-storage volume at `destination`
    ///
    /// Then waits for the device to detach and verifies the update.
    pub async fn save_firmware_file(&self, destination: impl Into<PathBuf>) -> Result<()> {
        let current = self.state();
        if !matches!(current, UpdateState::AwaitingFileSave { .. }) {
            return Err(FirmwareUpdateError::InvalidState(format!(
                "no firmware is awaiting save (state: {})",
                current.name()
            )));
        }
        let pending = self.inner.take_pending_save().ok_or_else(|| {
            FirmwareUpdateError::InvalidState("no firmware is awaiting save".to_string())
        })?;
        let destination = destination.into();
        self.chain_task(move |inner, cancel| async move {
            let outcome = inner.run_save(&pending, &destination, &cancel).await;
            inner.finish(outcome).await;
        })
        .await;
        Ok(())
    }

    /// Reconnect to `address` and wait for fresh identity; emits and returns the outcome
    pub async fn verify_update_result(&self, address: &DeviceAddress) -> UpdateState {
        self.inner.set_state(UpdateState::Verifying);
        let outcome = self.inner.verify(address).await;
        self.inner.set_state(outcome.clone());
        outcome
    }

    /// Accept an unverified update as done
    pub fn accept_unverified(&self) -> Result<()> {
        let current = self.state();
        if current != UpdateState::VerificationFailed {
            return Err(FirmwareUpdateError::InvalidState(format!(
                "nothing to accept (state: {})",
                current.name()
            )));
        }
        info!("Unverified update accepted");
        self.inner.set_state(UpdateState::Success);
        Ok(())
    }

    /// Re-run the check after a failure
    pub async fn retry(&self) -> Result<()> {
        let current = self.state();
        if !matches!(
            current,
            UpdateState::Error { .. } | UpdateState::VerificationFailed
        ) {
            return Err(FirmwareUpdateError::InvalidState(format!(
                "nothing to retry (state: {})",
                current.name()
            )));
        }
        self.check_for_updates().await;
        Ok(())
    }

    /// Stop the task slot and clear scratch storage
    pub async fn shutdown(&self) {
        self.stop_task().await;
        self.inner.take_pending_save();
        self.inner.store.purge_all().await;
        self.inner.set_state(UpdateState::Idle);
        info!("Update orchestrator shut down");
    }

    async fn start(&self, local_file: Option<PathBuf>) -> Result<()> {
        let ctx = self.inner.ready_context().ok_or_else(|| {
            FirmwareUpdateError::InvalidState("no update is ready; check for updates first".to_string())
        })?;
        let current = self.state();
        if !(matches!(current, UpdateState::Ready { .. }) || current.is_in_progress()) {
            return Err(FirmwareUpdateError::InvalidState(format!(
                "cannot start an update from state {}",
                current.name()
            )));
        }

        let identity = self
            .inner
            .connection
            .current_identity()
            .unwrap_or_else(|| ctx.identity.clone());
        if battery_blocks_update(identity.battery_level, self.inner.config.battery_threshold_percent) {
            let level = identity.battery_level.unwrap_or_default();
            warn!(level, "Battery too low to update");
            return Err(FirmwareUpdateError::BatteryTooLow { level });
        }

        let route = transport_target(&ctx, &identity, self.inner.wifi.has_radio_link());
        let (target, link) = match route {
            Ok(route) => route,
            Err(e) => {
                self.inner.set_state(UpdateState::error(e.to_string()));
                return Err(e);
            }
        };

        let release = match (&local_file, &ctx.release) {
            (Some(_), release) => release.clone().unwrap_or_else(FirmwareRelease::local_file),
            (None, Some(release)) if !release.is_local() => release.clone(),
            (None, _) => {
                return Err(FirmwareUpdateError::InvalidState(
                    "no firmware release is available on this channel".to_string(),
                ));
            }
        };

        info!(
            method = %ctx.method,
            release = %release.id,
            pio_target = ctx.hardware.target(),
            local = local_file.is_some(),
            "Starting firmware update"
        );
        self.replace_task(move |inner, cancel| async move {
            inner.store.purge_all().await;
            let outcome = inner
                .run_update(&ctx, &release, (&target, link), local_file.as_deref(), &cancel)
                .await;
            inner.finish(outcome).await;
        })
        .await;
        Ok(())
    }

    /// Stop the slot's task and spawn a new one in its place
    async fn replace_task<F, Fut>(&self, make: F)
    where
        F: FnOnce(Arc<Inner>, CancelToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.inner.task.lock().await;
        if let Some(previous) = slot.take()
            && previous.stop().await
        {
            info!("Cancelled in-flight task");
            self.inner.store.purge_all().await;
            self.inner.set_state(UpdateState::Idle);
        }
        *slot = Some(self.spawn(make));
    }

    /// Let the slot's task run to completion, then spawn the follow-up
    async fn chain_task<F, Fut>(&self, make: F)
    where
        F: FnOnce(Arc<Inner>, CancelToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.inner.task.lock().await;
        if let Some(previous) = slot.take() {
            previous.join().await;
        }
        *slot = Some(self.spawn(make));
    }

    fn spawn<F, Fut>(&self, make: F) -> TaskSlot
    where
        F: FnOnce(Arc<Inner>, CancelToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancelToken::new();
        let handle = tokio::spawn(make(self.inner.clone(), cancel.clone()));
        TaskSlot { handle, cancel }
    }

    async fn stop_task(&self) {
        let previous = self.inner.task.lock().await.take();
        if let Some(previous) = previous {
            previous.stop().await;
        }
    }
}

/// Transport target for the selected method
/// Target and link the selected transport reaches the device through
///
/// Radio-attached ESP32 devices use the radio OTA route when the host
/// provides one and fall back to a reported WiFi address otherwise.
fn transport_target(
    ctx: &ReadyContext,
    identity: &DeviceIdentity,
    radio_ota: bool,
) -> Result<(String, ConnectionKind)> {
    match ctx.method {
        UpdateMethod::Wireless => Ok((ctx.address.target.clone(), ConnectionKind::Radio)),
        UpdateMethod::MassStorage => Ok((String::new(), ConnectionKind::Serial)),
        UpdateMethod::WifiOta => match ctx.address.kind {
            ConnectionKind::Network => Ok((ctx.address.target.clone(), ConnectionKind::Network)),
            ConnectionKind::Radio if radio_ota => {
                Ok((ctx.address.target.clone(), ConnectionKind::Radio))
            }
            ConnectionKind::Radio | ConnectionKind::Serial | ConnectionKind::Disconnected => identity
                .ip_address
                .clone()
                .or_else(|| ctx.identity.ip_address.clone())
                .filter(|ip| !ip.is_empty())
                .map(|ip| (ip, ConnectionKind::Network))
                .ok_or_else(|| {
                    FirmwareUpdateError::TransportError(
                        "device has not reported a WiFi address; connect over WiFi to update"
                            .to_string(),
                    )
                }),
        },
        UpdateMethod::Unknown => Err(unsupported(ctx)),
    }
}

fn unsupported(ctx: &ReadyContext) -> FirmwareUpdateError {
    FirmwareUpdateError::UnsupportedMethod(format!(
        "{} devices cannot be updated over a {:?} connection",
        ctx.hardware.architecture, ctx.address.kind
    ))
}

impl Inner {
    fn current_state(&self) -> UpdateState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: UpdateState) {
        debug!(state = state.name(), "State transition");
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state.clone();
        // No subscribers is fine
        let _ = self.state_tx.send(state);
    }

    fn ready_context(&self) -> Option<ReadyContext> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_ready_context(&self, ctx: Option<ReadyContext>) {
        *self.ready.lock().unwrap_or_else(PoisonError::into_inner) = ctx;
    }

    fn take_pending_save(&self) -> Option<PendingSave> {
        self.pending_save
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn channel(&self) -> ReleaseChannel {
        *self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_check(&self, cancel: &CancelToken) {
        self.set_ready_context(None);
        if let Some(pending) = self.take_pending_save() {
            info!(file = ?pending.file, "Discarding unsaved firmware");
            self.store.purge_all().await;
        }
        self.set_state(UpdateState::Checking);

        match self.resolve_ready().await {
            Ok((ctx, ready)) => {
                if cancel.is_cancelled() {
                    return;
                }
                info!(
                    pio_target = ctx.hardware.target(),
                    method = %ctx.method,
                    release = ctx.release.as_ref().map(|r| r.id.as_str()).unwrap_or("none"),
                    "Update check complete"
                );
                self.set_ready_context(Some(ctx));
                self.set_state(ready);
            }
            Err(e) if e.is_cancellation() => {}
            Err(e) => {
                warn!(error = %e, "Update check failed");
                self.set_state(UpdateState::error(e.to_string()));
            }
        }
    }

    async fn resolve_ready(&self) -> Result<(ReadyContext, UpdateState)> {
        let address = self
            .connection
            .device_address()
            .and_then(|raw| DeviceAddress::parse(&raw))
            .filter(DeviceAddress::is_connected_target)
            .ok_or(FirmwareUpdateError::NoDevice)?;
        let identity = self
            .connection
            .current_identity()
            .ok_or(FirmwareUpdateError::NoDevice)?;
        let hw_model = identity.hw_model.ok_or_else(|| {
            FirmwareUpdateError::HardwareUnresolved("device did not report a hardware model".into())
        })?;

        let hardware = self
            .hardware_catalog
            .lookup_hardware(hw_model, identity.pio_env.as_deref())
            .await
            .map_err(|e| match e {
                FirmwareUpdateError::HardwareUnresolved(_) | FirmwareUpdateError::Cancelled => e,
                other => FirmwareUpdateError::HardwareUnresolved(other.to_string()),
            })?
            .ok_or_else(|| {
                FirmwareUpdateError::HardwareUnresolved(format!("unknown hardware model {hw_model}"))
            })?;

        let channel = self.channel();
        let release = match channel {
            ReleaseChannel::LocalFile => Some(FirmwareRelease::local_file()),
            ReleaseChannel::Stable | ReleaseChannel::Alpha => {
                self.release_catalog.latest_release(channel).await?
            }
        };

        let method = UpdateMethod::select(address.kind, &hardware);
        let show_bootloader_warning = method == UpdateMethod::Wireless
            && hardware.requires_bootloader_upgrade()
            && !self.warning_store.is_dismissed(&address.to_string());

        let ready = UpdateState::Ready {
            release: release.clone(),
            hardware: hardware.clone(),
            address: address.clone(),
            show_bootloader_warning,
            method,
            current_version: identity.firmware_version.clone(),
        };
        let ctx = ReadyContext {
            release,
            hardware,
            address,
            method,
            identity,
        };
        Ok((ctx, ready))
    }

    /// Run the selected transport; `Ok(None)` parks the flow at `AwaitingFileSave`
    async fn run_update(
        &self,
        ctx: &ReadyContext,
        release: &FirmwareRelease,
        (target, link): (&str, ConnectionKind),
        local_file: Option<&std::path::Path>,
        cancel: &CancelToken,
    ) -> Result<Option<UpdateState>> {
        let sink = |state: UpdateState| self.set_state(state);
        let request = UpdateRequest {
            release,
            hardware: &ctx.hardware,
            target,
            link,
            local_file,
        };

        match ctx.method {
            UpdateMethod::Wireless => self.run_wireless(ctx, request, &sink, cancel).await,
            UpdateMethod::MassStorage => {
                // Park the save before the state becomes observable
                let parking_sink = |state: UpdateState| {
                    if let UpdateState::AwaitingFileSave { file, source, .. } = &state {
                        *self.pending_save.lock().unwrap_or_else(PoisonError::into_inner) =
                            Some(PendingSave {
                                file: file.clone(),
                                source: source.clone(),
                                address: ctx.address.clone(),
                            });
                    }
                    self.set_state(state);
                };
                self.mass_storage
                    .start_update(request, &parking_sink, cancel)
                    .await?;
                Ok(None)
            }
            UpdateMethod::WifiOta => {
                self.wifi.start_update(request, &sink, cancel).await?;
                self.set_state(UpdateState::Verifying);
                Ok(Some(self.verify(&ctx.address).await))
            }
            UpdateMethod::Unknown => Err(unsupported(ctx)),
        }
    }

    async fn run_wireless(
        &self,
        ctx: &ReadyContext,
        request: UpdateRequest<'_>,
        sink: StateSink<'_>,
        cancel: &CancelToken,
    ) -> Result<Option<UpdateState>> {
        // Register before starting so no early callback is lost
        let mut events = DfuEventStream::register(self.dfu.clone(), request.target, DFU_EVENT_CAPACITY);
        let mut abort_guard = DfuAbortGuard {
            dfu: self.dfu.clone(),
            armed: true,
        };

        self.wireless.start_update(request, sink, cancel).await?;

        let stall_timeout = self.config.dfu_stall_timeout;
        loop {
            let event = match tokio::time::timeout(stall_timeout, events.next_event()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    return Err(FirmwareUpdateError::TransportError(
                        "DFU listener closed before the update finished".to_string(),
                    ));
                }
                Err(_) => {
                    warn!(timeout = ?stall_timeout, "DFU stalled, aborting");
                    return Err(FirmwareUpdateError::TransportError(format!(
                        "DFU stalled: no callback for {stall_timeout:?}"
                    )));
                }
            };
            if event.is_final() {
                abort_guard.disarm();
            }
            let state = dfu_event_to_state(&event);
            match event {
                DfuEvent::Completed { .. } => {
                    drop(events);
                    info!(address = %ctx.address, "DFU completed");
                    self.set_state(state);
                    self.store.purge_all().await;
                    return Ok(Some(self.verify(&ctx.address).await));
                }
                DfuEvent::Aborted { .. } | DfuEvent::Error { .. } => {
                    warn!(?event, "DFU did not complete");
                    return Ok(Some(state));
                }
                DfuEvent::Connecting { .. }
                | DfuEvent::Starting { .. }
                | DfuEvent::EnablingDfuMode { .. }
                | DfuEvent::Progress { .. }
                | DfuEvent::Validating { .. }
                | DfuEvent::Disconnecting { .. } => self.set_state(state),
            }
        }
    }

    async fn run_save(
        &self,
        pending: &PendingSave,
        destination: &std::path::Path,
        cancel: &CancelToken,
    ) -> Result<Option<UpdateState>> {
        let source = pending
            .file
            .as_ref()
            .or(pending.source.as_ref())
            .ok_or_else(|| FirmwareUpdateError::InvalidState("nothing to save".to_string()))?;
        cancel.check()?;

        self.store.copy(source, destination, cancel).await?;
        self.set_state(UpdateState::processing("Flashing"));

        match tokio::time::timeout(self.config.detach_timeout, self.connection.wait_for_detach())
            .await
        {
            Ok(Ok(())) => info!("Device detached"),
            Ok(Err(e)) => warn!(error = %e, "Detach wait failed, proceeding"),
            Err(_) => warn!(
                timeout = ?self.config.detach_timeout,
                "Device did not detach in time, proceeding"
            ),
        }
        cancel.check()?;

        self.set_state(UpdateState::Verifying);
        Ok(Some(self.verify(&pending.address).await))
    }

    /// Fold a task outcome into a terminal state and clear scratch storage
    async fn finish(&self, outcome: Result<Option<UpdateState>>) {
        match outcome {
            Ok(Some(terminal)) => {
                self.store.purge_all().await;
                self.set_state(terminal);
            }
            Ok(None) => {}
            Err(e) if e.is_cancellation() => {
                self.store.purge_all().await;
                self.set_state(UpdateState::Idle);
            }
            Err(e) => {
                error!(error = %e, "Firmware update failed");
                self.store.purge_all().await;
                self.set_state(UpdateState::error(e.to_string()));
            }
        }
    }

    /// Reconnect with the just-updated hint and wait for link plus fresh identity
    async fn verify(&self, address: &DeviceAddress) -> UpdateState {
        let mut connection_rx = self.connection.subscribe_connection_state();
        let mut identity_rx = self.connection.subscribe_identity();

        let hint = address.reconnect_hint();
        info!(address = %hint, "Reconnecting to verify update");
        if let Err(e) = self.connection.set_device_address(&hint).await {
            warn!(error = %e, "Failed to request reconnect");
        }

        let timeout = self.config.verification_timeout;
        match tokio::time::timeout(timeout, wait_for_reconnect(&mut connection_rx, &mut identity_rx))
            .await
        {
            Ok(true) => {
                tokio::time::sleep(self.config.verification_settle_delay).await;
                info!(address = %address, "Update verified");
                UpdateState::Success
            }
            Ok(false) => {
                warn!("Connection streams closed before the device reconnected");
                UpdateState::VerificationFailed
            }
            Err(_) => {
                warn!(error = %FirmwareUpdateError::VerificationTimeout(timeout), "Verification failed");
                UpdateState::VerificationFailed
            }
        }
    }
}

/// Resolve once the link is up and identity arrived after subscribing
async fn wait_for_reconnect(
    connection_rx: &mut broadcast::Receiver<ConnectionState>,
    identity_rx: &mut broadcast::Receiver<Option<DeviceIdentity>>,
) -> bool {
    let mut connected = false;
    let mut identified = false;
    let mut connection_open = true;
    let mut identity_open = true;

    while !(connected && identified) {
        if !connection_open && !identity_open {
            return false;
        }
        tokio::select! {
            state = connection_rx.recv(), if connection_open => match state {
                Ok(state) => {
                    debug!(?state, "Connection state during verification");
                    connected = state.is_connected();
                    if !connected {
                        identified = false;
                    }
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Connection stream lagged"),
                Err(RecvError::Closed) => connection_open = false,
            },
            identity = identity_rx.recv(), if identity_open => match identity {
                Ok(identity) => identified = identity.is_some(),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Identity stream lagged"),
                Err(RecvError::Closed) => identity_open = false,
            },
        }
    }
    true
}

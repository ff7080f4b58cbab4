//! Wireless DFU bridge
//!
//! The vendor DFU library pushes progress into a registered listener from its
//! own callback thread. [`DfuEventStream`] funnels those callbacks through one
//! queue so the orchestrator folds them into state in arrival order, and
//! unregisters the listener when the stream is dropped.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::config::DfuSettings;
use crate::error::Result;
use crate::state::UpdateState;

/// Callback from the DFU library, tagged with the device address it concerns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DfuEvent {
    /// Connecting to the device
    Connecting {
        /// Device address
        address: String,
    },
    /// DFU process is starting
    Starting {
        /// Device address
        address: String,
    },
    /// Switching the device into its bootloader
    EnablingDfuMode {
        /// Device address
        address: String,
    },
    /// Transfer progress
    Progress {
        /// Device address
        address: String,
        /// Percent complete, `0..=100`
        percent: u8,
    },
    /// Device is validating the received image
    Validating {
        /// Device address
        address: String,
    },
    /// Device is disconnecting to boot the new image
    Disconnecting {
        /// Device address
        address: String,
    },
    /// Transfer finished and the device rebooted
    Completed {
        /// Device address
        address: String,
    },
    /// Transfer was aborted
    Aborted {
        /// Device address
        address: String,
    },
    /// Library reported an error
    Error {
        /// Device address
        address: String,
        /// Library error message
        message: String,
    },
}

impl DfuEvent {
    /// Device address the event concerns
    pub fn address(&self) -> &str {
        match self {
            DfuEvent::Connecting { address }
            | DfuEvent::Starting { address }
            | DfuEvent::EnablingDfuMode { address }
            | DfuEvent::Progress { address, .. }
            | DfuEvent::Validating { address }
            | DfuEvent::Disconnecting { address }
            | DfuEvent::Completed { address }
            | DfuEvent::Aborted { address }
            | DfuEvent::Error { address, .. } => address,
        }
    }

    /// Whether the event ends the DFU session
    pub fn is_final(&self) -> bool {
        match self {
            DfuEvent::Completed { .. } | DfuEvent::Aborted { .. } | DfuEvent::Error { .. } => true,
            DfuEvent::Connecting { .. }
            | DfuEvent::Starting { .. }
            | DfuEvent::EnablingDfuMode { .. }
            | DfuEvent::Progress { .. }
            | DfuEvent::Validating { .. }
            | DfuEvent::Disconnecting { .. } => false,
        }
    }
}

/// Map a DFU callback onto the orchestration state it stands for
pub fn dfu_event_to_state(event: &DfuEvent) -> UpdateState {
    match event {
        DfuEvent::Connecting { .. } => UpdateState::processing("Connecting to device"),
        DfuEvent::Starting { .. } => UpdateState::processing("Starting DFU"),
        DfuEvent::EnablingDfuMode { .. } => UpdateState::processing("Enabling DFU mode"),
        DfuEvent::Progress { percent, .. } => {
            UpdateState::updating(f32::from(*percent) / 100.0, "Updating firmware")
        }
        DfuEvent::Validating { .. } => UpdateState::processing("Validating firmware"),
        DfuEvent::Disconnecting { .. } => UpdateState::processing("Disconnecting"),
        DfuEvent::Completed { .. } => UpdateState::Verifying,
        DfuEvent::Aborted { .. } => UpdateState::error("DFU Aborted"),
        DfuEvent::Error { message, .. } => UpdateState::error(format!("DFU Error: {message}")),
    }
}

/// Everything the DFU library needs to flash one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuRequest {
    /// Radio address without the connection prefix
    pub address: String,
    /// Name shown in the library's notification
    pub device_name: String,
    /// DFU package on local storage
    pub archive: PathBuf,
    /// Library settings
    pub settings: DfuSettings,
}

/// Push-style listener the DFU library calls from its own thread
pub trait DfuProgressListener: Send + Sync {
    /// Deliver one callback
    fn on_event(&self, event: DfuEvent);
}

/// Registration handle returned by [`DfuInitiator::register_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DfuListenerId(pub u64);

/// Narrow contract over the platform DFU library
#[async_trait]
pub trait DfuInitiator: Send + Sync {
    /// Start a DFU session; progress arrives through registered listeners
    async fn start(&self, request: DfuRequest) -> Result<()>;

    /// Abort the running session, if any
    fn abort(&self) {}

    /// Register a listener
    fn register_listener(&self, listener: Arc<dyn DfuProgressListener>) -> DfuListenerId;

    /// Remove a previously registered listener
    fn unregister_listener(&self, id: DfuListenerId);
}

/// Per-device callback queue shared by the listener and the stream
///
/// Bounded for progress ticks only. When full, an incoming tick is dropped and
/// any other event displaces the oldest queued tick, so lifecycle and final
/// events always arrive, in order.
struct EventQueue {
    events: Mutex<VecDeque<DfuEvent>>,
    capacity: usize,
    closed: AtomicBool,
    notify: Notify,
}

impl EventQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn push(&self, event: DfuEvent) {
        {
            let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            if events.len() >= self.capacity {
                if let DfuEvent::Progress { percent, .. } = event {
                    debug!(percent, "DFU queue full, dropping progress tick");
                    return;
                }
                match events
                    .iter()
                    .position(|queued| matches!(queued, DfuEvent::Progress { .. }))
                {
                    Some(index) => {
                        events.remove(index);
                    }
                    None => debug!(?event, "DFU queue full of lifecycle events, growing"),
                }
            }
            if event.is_final() {
                debug!(?event, "Queued final DFU event");
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<DfuEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Listener that forwards callbacks for one device into its queue
struct QueueListener {
    address: String,
    queue: Arc<EventQueue>,
}

impl DfuProgressListener for QueueListener {
    fn on_event(&self, event: DfuEvent) {
        if !event.address().eq_ignore_ascii_case(&self.address) {
            return;
        }
        self.queue.push(event);
    }
}

impl Drop for QueueListener {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// Unregisters the listener when dropped
struct ListenerGuard {
    initiator: Arc<dyn DfuInitiator>,
    id: DfuListenerId,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.initiator.unregister_listener(self.id);
        debug!(id = self.id.0, "Unregistered DFU listener");
    }
}

/// Ordered stream of DFU callbacks for one device
pub struct DfuEventStream {
    queue: Arc<EventQueue>,
    guard: ListenerGuard,
}

impl DfuEventStream {
    /// Register a listener for `address` and return the stream it feeds
    ///
    /// `capacity` bounds queued progress ticks; lifecycle events are never
    /// dropped.
    pub fn register(initiator: Arc<dyn DfuInitiator>, address: &str, capacity: usize) -> Self {
        let queue = Arc::new(EventQueue::new(capacity.max(1)));
        let listener = Arc::new(QueueListener {
            address: address.to_string(),
            queue: queue.clone(),
        });
        let id = initiator.register_listener(listener);
        debug!(id = id.0, address, "Registered DFU listener");
        Self {
            queue,
            guard: ListenerGuard { initiator, id },
        }
    }

    /// Next callback; `None` once the library drops the listener and the
    /// queue is drained
    pub async fn next_event(&mut self) -> Option<DfuEvent> {
        loop {
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return self.queue.pop();
            }
            // Single consumer: a notify_one issued before this await leaves a permit
            self.queue.notify.notified().await;
        }
    }
}

impl std::fmt::Debug for DfuEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DfuEventStream")
            .field("id", &self.guard.id)
            .finish_non_exhaustive()
    }
}

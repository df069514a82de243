//! Device manager.
//!
//! The `DeviceManager` owns the single active transport driver. It selects a
//! transport from probing results, claims it, and spawns one acquisition task
//! that is the only thread of control ever calling the driver. The task talks
//! to the manager through an internal event channel only.
//!
//! # Architecture
//!
//! ```text
//!              probe ──► select_transport ──► open
//!                                              │
//! ┌──────────────────────── acquisition task ──▼─────────────────────────┐
//! │ scanning? ──► acquire ──► Read ─────────────────────┐                │
//! │    ▲            │ err × N                            │                │
//! │    │            ▼                                    ▼                │
//! │    └── Reconnected ◄── backoff reopen ◄── Lost   mpsc ──► DeviceManager::next_event
//! │                          │ attempts exhausted                          │
//! │                          ▼                                             │
//! │                      Unavailable (task ends)                           │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Polled transports are only polled while the owner has scanning enabled;
//! the event-driven transport is always drained so stale pushes never queue
//! up behind a stopped scan.
//!
//! Every scan window gets a new generation. A read is stamped with the
//! generation it was acquired under and [`DeviceManager::next_event`] only
//! hands out reads of the window that is open right now, so a slow poll
//! started before a stop never lands in the next scan.
//!
//! # Examples
//!
//! ```no_run
//! use tagbridge_hardware::drivers::ProximityFeed;
//! use tagbridge_hardware::manager::{DeviceEvent, DeviceManager, ManagerConfig, TransportSet};
//!
//! #[tokio::main]
//! async fn main() -> tagbridge_hardware::Result<()> {
//!     let transports = TransportSet::new(ProximityFeed::new());
//!     let mut manager = DeviceManager::new(ManagerConfig::default(), transports);
//!
//!     let handle = manager.connect().await?;
//!     println!("Reader: {}", handle.name());
//!
//!     manager.set_scanning(true);
//!     while let Some(event) = manager.next_event().await {
//!         if let DeviceEvent::Read(read) = event {
//!             println!("Raw read from {}", read.raw.transport);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use crate::devices::AnyTransport;
use crate::drivers::daemon::{self, DaemonConfig, DaemonDriver, DaemonProbe};
use crate::drivers::proximity::{ProximityConfig, ProximityDriver, ProximityFeed};
use crate::drivers::usb::{self, UsbBackend, UsbConfig, UsbDriver};
use crate::error::{HardwareError, Result};
use crate::traits::Transport;
use crate::types::{DeviceHandle, UsbReaderId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tagbridge_core::{
    RawReadEvent, TransportKind,
    constants::{DEFAULT_POLL_INTERVAL_MS, MAX_CONSECUTIVE_POLL_FAILURES},
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tagbridge_protocol::DaemonOutput;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Exponential backoff applied after an unexpected handle loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub factor: u32,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            factor: 2,
            max_delay_ms: 8_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// ```
    /// use std::time::Duration;
    /// use tagbridge_hardware::manager::ReconnectPolicy;
    ///
    /// let policy = ReconnectPolicy::default();
    /// assert_eq!(policy.delay_for(1), Duration::from_millis(500));
    /// assert_eq!(policy.delay_for(2), Duration::from_millis(1_000));
    /// assert_eq!(policy.delay_for(10), Duration::from_millis(8_000));
    /// ```
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(u64::from(multiplier));
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Device manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Interval between two polls of a polled transport.
    pub poll_interval_ms: u64,

    /// Consecutive failed polls after which the handle is considered lost.
    pub max_consecutive_failures: u32,

    pub reconnect: ReconnectPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_consecutive_failures: MAX_CONSECUTIVE_POLL_FAILURES,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ManagerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// What probing the environment found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    /// Browser proximity forwarding is enabled for at least one trusted origin.
    pub proximity_secure: bool,
    /// First known USB reader on the bus.
    pub usb_reader: Option<UsbReaderId>,
    /// Detected daemon stack.
    pub daemon: Option<DaemonProbe>,
}

/// Pick the transport to use for a probe report.
///
/// Preference: secure proximity, then an attached USB reader, then a daemon.
///
/// ```
/// use tagbridge_core::TransportKind;
/// use tagbridge_hardware::manager::{ProbeReport, select_transport};
/// use tagbridge_hardware::types::UsbReaderId;
///
/// let report = ProbeReport {
///     proximity_secure: false,
///     usb_reader: Some(UsbReaderId::new(0x072F, 0x2200)),
///     daemon: None,
/// };
/// assert_eq!(select_transport(&report), Some(TransportKind::Usb));
/// assert_eq!(select_transport(&ProbeReport::default()), None);
/// ```
pub fn select_transport(report: &ProbeReport) -> Option<TransportKind> {
    if report.proximity_secure {
        Some(TransportKind::Proximity)
    } else if report.usb_reader.is_some() {
        Some(TransportKind::Usb)
    } else if report.daemon.is_some() {
        Some(TransportKind::Daemon)
    } else {
        None
    }
}

/// Everything needed to build any of the three drivers.
#[derive(Clone)]
pub struct TransportSet {
    proximity: ProximityConfig,
    feed: ProximityFeed,
    usb: UsbConfig,
    usb_backend: Option<Arc<dyn UsbBackend>>,
    daemon: Option<DaemonConfig>,
}

impl fmt::Debug for TransportSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSet")
            .field("proximity", &self.proximity)
            .field("usb", &self.usb)
            .field("usb_backend", &self.usb_backend.is_some())
            .field("daemon", &self.daemon)
            .finish()
    }
}

impl TransportSet {
    /// Default settings, no USB backend, daemon detection enabled.
    pub fn new(feed: ProximityFeed) -> Self {
        Self {
            proximity: ProximityConfig::default(),
            feed,
            usb: UsbConfig::default(),
            usb_backend: None,
            daemon: Some(DaemonConfig::default()),
        }
    }

    pub fn with_proximity(mut self, config: ProximityConfig) -> Self {
        self.proximity = config;
        self
    }

    pub fn with_usb(mut self, config: UsbConfig, backend: Arc<dyn UsbBackend>) -> Self {
        self.usb = config;
        self.usb_backend = Some(backend);
        self
    }

    pub fn with_daemon(mut self, config: DaemonConfig) -> Self {
        self.daemon = Some(config);
        self
    }

    pub fn without_daemon(mut self) -> Self {
        self.daemon = None;
        self
    }

    pub fn feed(&self) -> &ProximityFeed {
        &self.feed
    }

    pub fn proximity(&self) -> &ProximityConfig {
        &self.proximity
    }

    /// Probe every configured transport.
    pub async fn probe(&self) -> ProbeReport {
        let usb_reader = match &self.usb_backend {
            Some(backend) => {
                match usb::list_readers(Arc::clone(backend), self.usb.vendor_ids.clone()).await {
                    Ok(readers) => readers.into_iter().next(),
                    Err(e) => {
                        debug!(error = %e, "USB probe failed");
                        None
                    }
                }
            }
            None => None,
        };

        let daemon = match (&self.daemon, usb_reader.is_some() || self.proximity.is_secure()) {
            (Some(config), false) => daemon::detect(config).await,
            _ => None,
        };

        ProbeReport {
            proximity_secure: self.proximity.is_secure(),
            usb_reader,
            daemon,
        }
    }

    /// Build the driver for `kind`, reusing probe results where possible.
    pub fn build(&self, kind: TransportKind, report: &ProbeReport) -> Result<AnyTransport> {
        match kind {
            TransportKind::Proximity => Ok(AnyTransport::Proximity(ProximityDriver::new(
                self.proximity.clone(),
                self.feed.clone(),
            ))),
            TransportKind::Usb => {
                let backend = self
                    .usb_backend
                    .as_ref()
                    .ok_or_else(|| HardwareError::unsupported("USB backend not available"))?;
                Ok(AnyTransport::Usb(UsbDriver::new(
                    self.usb.clone(),
                    Arc::clone(backend),
                )))
            }
            TransportKind::Daemon => {
                let config = self
                    .daemon
                    .clone()
                    .ok_or_else(|| HardwareError::unsupported("daemon transport disabled"))?;
                let driver = DaemonDriver::new(config);
                Ok(AnyTransport::Daemon(match report.daemon.clone() {
                    Some(probe) => driver.with_probe(probe),
                    None => driver,
                }))
            }
        }
    }
}

/// A raw read together with what its consumer needs to decode it.
#[derive(Debug, Clone)]
pub struct AcquiredRead {
    pub raw: RawReadEvent,
    /// Decoder for daemon output, taken from the handle the read came from.
    pub output: DaemonOutput,
    /// Scan window the read was acquired in.
    pub generation: u64,
}

/// Events produced by the acquisition task.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A raw read of the open scan window; decoding is up to the consumer.
    Read(AcquiredRead),

    /// The handle was invalidated; reconnection is under way.
    Lost {
        transport: TransportKind,
        reason: String,
    },

    /// Reconnection succeeded with a fresh handle.
    Reconnected(DeviceHandle),

    /// Reconnection gave up. Nothing is retried until the next `connect`.
    Unavailable {
        transport: TransportKind,
        reason: String,
    },

    /// The event-driven source reported a failed scan and its subscription
    /// was dropped. Nothing is retried until the next `connect`.
    Failed {
        transport: TransportKind,
        reason: String,
    },
}

/// Scan window shared with the acquisition task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ScanWindow {
    generation: u64,
    open: bool,
}

impl ScanWindow {
    fn admits(&self, generation: u64) -> bool {
        self.open && self.generation == generation
    }
}

struct ActiveDevice {
    id: u64,
    transport: TransportKind,
    handle: Option<DeviceHandle>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owner of the active transport.
pub struct DeviceManager {
    config: ManagerConfig,
    transports: TransportSet,
    events_tx: mpsc::Sender<(u64, DeviceEvent)>,
    events_rx: mpsc::Receiver<(u64, DeviceEvent)>,
    scanning: watch::Sender<ScanWindow>,
    active: Option<ActiveDevice>,
    next_id: u64,
}

impl DeviceManager {
    pub fn new(config: ManagerConfig, transports: TransportSet) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (scanning, _) = watch::channel(ScanWindow::default());

        Self {
            config,
            transports,
            events_tx,
            events_rx,
            scanning,
            active: None,
            next_id: 0,
        }
    }

    pub fn transports(&self) -> &TransportSet {
        &self.transports
    }

    /// Handle of the connected reader, `None` while disconnected or reconnecting.
    pub fn current(&self) -> Option<&DeviceHandle> {
        self.active.as_ref().and_then(|active| active.handle.as_ref())
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    /// Probe, select and claim the best available transport.
    ///
    /// Any previously attached transport is disconnected first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no transport is usable, or the driver's error if
    /// the selected transport cannot be claimed.
    pub async fn connect(&mut self) -> Result<DeviceHandle> {
        self.disconnect().await;

        let report = self.transports.probe().await;
        let kind = select_transport(&report)
            .ok_or_else(|| HardwareError::not_found("no reader available"))?;
        debug!(transport = %kind, ?report, "Transport selected");

        let driver = self.transports.build(kind, &report)?;
        self.attach(driver).await
    }

    /// Claim a specific driver and start acquiring from it.
    pub async fn attach(&mut self, mut driver: AnyTransport) -> Result<DeviceHandle> {
        self.disconnect().await;

        let handle = driver.open().await?;
        let transport = driver.kind();
        info!(transport = %transport, reader = handle.name(), "Reader connected");

        self.next_id += 1;
        let cancel = CancellationToken::new();
        let ctx = TaskContext {
            id: self.next_id,
            config: self.config.clone(),
            tx: self.events_tx.clone(),
            scanning: self.scanning.subscribe(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(acquisition_task(driver, handle.clone(), ctx));

        self.active = Some(ActiveDevice {
            id: self.next_id,
            transport,
            handle: Some(handle.clone()),
            cancel,
            task,
        });
        Ok(handle)
    }

    /// Release the active transport, if any.
    ///
    /// Returns the transport that was attached.
    pub async fn disconnect(&mut self) -> Option<TransportKind> {
        let active = self.active.take()?;
        active.cancel.cancel();
        if let Err(e) = active.task.await
            && e.is_panic()
        {
            error!(transport = %active.transport, "Acquisition task panicked");
        }
        info!(transport = %active.transport, "Reader disconnected");
        Some(active.transport)
    }

    /// Open or close the scan window.
    ///
    /// Polled transports are only polled while it is open. Opening a closed
    /// window starts a new generation; an in-flight poll of an earlier one is
    /// abandoned where the transport allows it and its read is discarded.
    pub fn set_scanning(&self, scanning: bool) {
        self.scanning.send_if_modified(|window| {
            if window.open == scanning {
                return false;
            }
            if scanning {
                window.generation += 1;
            }
            window.open = scanning;
            true
        });
    }

    /// Returns `true` while the scan window is open.
    pub fn is_scanning(&self) -> bool {
        self.scanning.borrow().open
    }

    /// Next event from the active acquisition task.
    ///
    /// Events still queued from a task that was replaced or disconnected are
    /// skipped, as are reads that do not belong to the open scan window.
    /// Cancel-safe.
    pub async fn next_event(&mut self) -> Option<DeviceEvent> {
        loop {
            let (id, event) = self.events_rx.recv().await?;
            let Some(active) = self.active.as_mut().filter(|active| active.id == id) else {
                debug!(task = id, "Dropping event from a retired acquisition task");
                continue;
            };

            match &event {
                DeviceEvent::Read(read) => {
                    let window = *self.scanning.borrow();
                    if !window.admits(read.generation) {
                        trace!(
                            transport = %read.raw.transport,
                            generation = read.generation,
                            current = window.generation,
                            "Dropping read outside the open scan window"
                        );
                        continue;
                    }
                }
                DeviceEvent::Lost { .. } => active.handle = None,
                DeviceEvent::Reconnected(handle) => active.handle = Some(handle.clone()),
                DeviceEvent::Unavailable { .. } | DeviceEvent::Failed { .. } => self.active = None,
            }
            return Some(event);
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }
}

struct TaskContext {
    id: u64,
    config: ManagerConfig,
    tx: mpsc::Sender<(u64, DeviceEvent)>,
    scanning: watch::Receiver<ScanWindow>,
    cancel: CancellationToken,
}

impl TaskContext {
    async fn send(&self, event: DeviceEvent) -> bool {
        self.tx.send((self.id, event)).await.is_ok()
    }
}

enum Reconnect {
    Handle(DeviceHandle),
    GaveUp,
    Cancelled,
}

/// Why acquisition from a handle ended.
enum Interruption {
    /// The handle stopped working; worth reconnecting.
    Lost(String),
    /// The source reported a failure and dropped its subscription.
    Failed(String),
}

async fn acquisition_task(mut driver: AnyTransport, mut handle: DeviceHandle, mut ctx: TaskContext) {
    let transport = driver.kind();

    loop {
        let cancel = ctx.cancel.clone();
        let interrupted = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            why = acquire_until_interrupted(&mut driver, &handle, &mut ctx) => Some(why),
        };

        let reason = match interrupted {
            None => {
                if let Err(e) = driver.close(handle).await {
                    debug!(transport = %transport, error = %e, "Close failed");
                }
                return;
            }
            Some(Interruption::Failed(reason)) => {
                warn!(transport = %transport, %reason, "Reader reported a failure, not retrying");
                if let Err(e) = driver.close(handle).await {
                    debug!(transport = %transport, error = %e, "Close after failure failed");
                }
                ctx.send(DeviceEvent::Failed { transport, reason }).await;
                return;
            }
            Some(Interruption::Lost(reason)) => reason,
        };

        warn!(transport = %transport, %reason, "Reader lost, reconnecting");
        if let Err(e) = driver.close(handle).await {
            debug!(transport = %transport, error = %e, "Close after loss failed");
        }
        if !ctx
            .send(DeviceEvent::Lost {
                transport,
                reason: reason.clone(),
            })
            .await
        {
            return;
        }

        match reconnect(&mut driver, &ctx).await {
            Reconnect::Handle(fresh) => {
                info!(transport = %transport, reader = fresh.name(), "Reader reconnected");
                handle = fresh;
                if !ctx.send(DeviceEvent::Reconnected(handle.clone())).await {
                    return;
                }
            }
            Reconnect::GaveUp => {
                error!(transport = %transport, "Reader unavailable, giving up");
                ctx.send(DeviceEvent::Unavailable { transport, reason }).await;
                return;
            }
            Reconnect::Cancelled => return,
        }
    }
}

/// Acquire reads until the handle is lost or its source fails.
async fn acquire_until_interrupted(
    driver: &mut AnyTransport,
    handle: &DeviceHandle,
    ctx: &mut TaskContext,
) -> Interruption {
    let transport = driver.kind();
    let event_driven = transport.is_event_driven();
    let mut failures = 0u32;

    loop {
        // Polls belong to the window open when they start; pushed reads to
        // the window current when they arrive.
        let started = if event_driven {
            None
        } else {
            match ctx.scanning.wait_for(|window| window.open).await {
                Ok(window) => Some(window.generation),
                Err(_) => return Interruption::Lost("device manager dropped".to_string()),
            }
        };

        let result = match started {
            Some(generation) if driver.is_cancel_safe() => {
                let mut scanning = ctx.scanning.clone();
                tokio::select! {
                    result = driver.acquire(handle) => Some(result),
                    _ = scanning.wait_for(|window| !window.admits(generation)) => None,
                }
            }
            _ => Some(driver.acquire(handle).await),
        };

        match result {
            None => debug!(transport = %transport, "Poll abandoned, scan window closed"),
            Some(Ok(Some(raw))) => {
                failures = 0;
                let read = AcquiredRead {
                    raw,
                    output: handle.output,
                    generation: started.unwrap_or_else(|| ctx.scanning.borrow().generation),
                };
                if !ctx.send(DeviceEvent::Read(read)).await {
                    return Interruption::Lost("device manager dropped".to_string());
                }
            }
            Some(Ok(None)) => failures = 0,
            Some(Err(e)) if event_driven => return Interruption::Failed(e.to_string()),
            Some(Err(e)) => {
                failures += 1;
                if e.is_device_lost() {
                    info!(transport = %transport, failures, error = %e, "Reader not responding");
                } else {
                    debug!(transport = %transport, failures, error = %e, "Transient transport fault");
                }
                if failures >= ctx.config.max_consecutive_failures {
                    return Interruption::Lost(format!("{failures} consecutive failures, last: {e}"));
                }
            }
        }

        if !event_driven {
            tokio::time::sleep(ctx.config.poll_interval()).await;
        }
    }
}

async fn reconnect(driver: &mut AnyTransport, ctx: &TaskContext) -> Reconnect {
    let policy = &ctx.config.reconnect;

    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_for(attempt);
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Reconnect::Cancelled,
            _ = tokio::time::sleep(delay) => {}
        }

        match driver.open().await {
            Ok(handle) => return Reconnect::Handle(handle),
            Err(e) => debug!(
                transport = %driver.kind(),
                attempt,
                max_attempts = policy.max_attempts,
                error = %e,
                "Reconnect attempt failed"
            ),
        }
    }

    Reconnect::GaveUp
}

//! The session owner.
//!
//! [`ScanService`] is an actor that exclusively owns the [`DeviceManager`],
//! the [`ScanSession`] and the [`Debouncer`]. Everything else talks to it
//! through a cloneable [`ServiceHandle`] and listens to the ordered
//! [`ReaderEvent`] stream it emits. No state is shared; the select loop is
//! the sole arbiter of concurrent control requests.
//!
//! ```text
//! ServiceHandle ──commands──┐
//!                           ▼
//! DeviceManager ──events──► ScanService ──decode──► debounce ──► ReaderEvent stream
//!                           ▲                                     └─► resolver / audit (spawned)
//!            scan deadline ─┘
//! ```

use crate::collaborators::{self, AuditSink, LogAudit, TagResolver, Unassociated};
use crate::config::ScanConfig;
use crate::debounce::Debouncer;
use crate::error::{ControlError, Result};
use crate::state::{ScanSession, TagOutcome};
use chrono::Utc;
use std::sync::Arc;
use tagbridge_core::{ReaderEvent, TagReadEvent};
use tagbridge_hardware::drivers::{ProximityConfig, ProximityFeed};
use tagbridge_hardware::{AcquiredRead, DeviceEvent, DeviceHandle, DeviceManager};
use tagbridge_protocol::{StatusReport, decode};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Message of the terminal reader state.
pub const READER_UNAVAILABLE: &str = "reader unavailable";

enum Command {
    Status(oneshot::Sender<StatusReport>),
    StartScan(oneshot::Sender<Result<u64>>),
    StopScan(oneshot::Sender<bool>),
    ConnectReader(oneshot::Sender<Result<DeviceHandle>>),
}

/// Session owner actor.
pub struct ScanService {
    manager: DeviceManager,
    session: ScanSession,
    debouncer: Debouncer,
    resolver: Arc<dyn TagResolver>,
    audit: Arc<dyn AuditSink>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ReaderEvent>,
}

impl ScanService {
    /// Create the service, its handle and the receiving end of its event
    /// stream.
    pub fn new(
        config: ScanConfig,
        manager: DeviceManager,
    ) -> (Self, ServiceHandle, mpsc::Receiver<ReaderEvent>) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let handle = ServiceHandle {
            commands: commands_tx,
            feed: manager.transports().feed().clone(),
            proximity: Arc::new(manager.transports().proximity().clone()),
        };

        let service = Self {
            debouncer: Debouncer::new(config.debounce_window()),
            session: ScanSession::new(config),
            manager,
            resolver: Arc::new(Unassociated),
            audit: Arc::new(LogAudit),
            commands,
            events,
        };
        (service, handle, events_rx)
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn TagResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Run until `shutdown` fires or every handle is dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            timeout_ms = self.session.config().timeout_ms,
            mode = ?self.session.config().mode,
            "Scan service started"
        );

        loop {
            let deadline = self.session.deadline();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = until(deadline) => self.on_deadline().await,
                Some(event) = self.manager.next_event() => self.on_device_event(event).await,
            }
        }

        if self.session.stop() {
            self.emit(ReaderEvent::ScanStopped).await;
        }
        self.manager.set_scanning(false);
        self.manager.disconnect().await;
        info!("Scan service stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::StartScan(reply) => {
                let result = self.start_scan().await;
                let _ = reply.send(result);
            }
            Command::StopScan(reply) => {
                let stopped = self.stop_scan().await;
                let _ = reply.send(stopped);
            }
            Command::ConnectReader(reply) => {
                let result = self.connect_reader().await;
                let _ = reply.send(result);
            }
        }
    }

    fn status(&self) -> StatusReport {
        let handle = self.manager.current();
        StatusReport {
            reader_connected: handle.is_some(),
            reader_name: handle.map(|h| h.name().to_string()),
            transport: handle.map(|h| h.transport),
            is_scanning: self.session.is_scanning(),
            timestamp: Utc::now(),
        }
    }

    async fn start_scan(&mut self) -> Result<u64> {
        if self.session.is_scanning() {
            return Err(ControlError::AlreadyScanning);
        }
        if !self.manager.is_connected() {
            return Err(ControlError::NoReader);
        }

        self.session.start(Instant::now())?;
        self.debouncer.reset();
        self.manager.set_scanning(true);

        let timeout_ms = self.session.config().timeout_ms;
        info!(timeout_ms, "Scan started");
        self.emit(ReaderEvent::ScanStarted { timeout_ms }).await;
        Ok(timeout_ms)
    }

    async fn stop_scan(&mut self) -> bool {
        let stopped = self.end_scan();
        if stopped {
            info!("Scan stopped");
            self.emit(ReaderEvent::ScanStopped).await;
        }
        stopped
    }

    /// Close the scan window and quiesce polling. Returns `true` if a scan
    /// was open.
    fn end_scan(&mut self) -> bool {
        self.manager.set_scanning(false);
        self.debouncer.reset();
        self.session.stop()
    }

    async fn connect_reader(&mut self) -> Result<DeviceHandle> {
        if let Some(transport) = self.manager.disconnect().await {
            self.emit(ReaderEvent::ReaderDisconnected { transport }).await;
        }

        match self.manager.connect().await {
            Ok(handle) => {
                self.emit(ReaderEvent::ReaderConnected {
                    name: handle.name().to_string(),
                    transport: handle.transport,
                })
                .await;
                Ok(handle)
            }
            Err(e) => {
                warn!(error = %e, "No reader available");
                if self.end_scan() {
                    self.emit(ReaderEvent::ScanStopped).await;
                }
                Err(ControlError::NoReader)
            }
        }
    }

    async fn on_deadline(&mut self) {
        if self.session.on_deadline(Instant::now()) {
            self.manager.set_scanning(false);
            self.debouncer.reset();
            info!("Scan timed out");
            self.emit(ReaderEvent::ScanTimeout).await;
        }
    }

    async fn on_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Read(read) => self.on_read(read).await,
            DeviceEvent::Lost { transport, reason } => {
                debug!(transport = %transport, %reason, "Reader handle lost");
                self.emit(ReaderEvent::ReaderDisconnected { transport }).await;
            }
            DeviceEvent::Reconnected(handle) => {
                self.emit(ReaderEvent::ReaderConnected {
                    name: handle.name().to_string(),
                    transport: handle.transport,
                })
                .await;
            }
            DeviceEvent::Unavailable { transport, reason } => {
                debug!(transport = %transport, %reason, "Reader unavailable");
                if self.end_scan() {
                    self.emit(ReaderEvent::ScanStopped).await;
                }
                self.emit(ReaderEvent::ReaderUnavailable {
                    message: READER_UNAVAILABLE.to_string(),
                })
                .await;
            }
            DeviceEvent::Failed { transport, reason } => {
                if self.end_scan() {
                    self.emit(ReaderEvent::ScanStopped).await;
                }
                self.emit(ReaderEvent::ReaderDisconnected { transport }).await;
                self.emit(ReaderEvent::Error { message: reason }).await;
            }
        }
    }

    async fn on_read(&mut self, read: AcquiredRead) {
        let AcquiredRead { raw, output, .. } = read;
        if !self.session.is_scanning() {
            debug!(transport = %raw.transport, "Discarding read outside a scan");
            return;
        }

        let Some(tag_id) = decode(raw.transport, &raw.payload, output) else {
            trace!(transport = %raw.transport, "No tag in payload");
            return;
        };

        if !self.debouncer.accept(&tag_id, Instant::now()) {
            debug!(tag_id = %tag_id, "Duplicate read suppressed");
            return;
        }

        let Some(outcome) = self.session.on_tag() else {
            return;
        };

        let event = TagReadEvent::new(tag_id, raw.transport, raw.received_at);
        info!(tag_id = %event.tag_id(), transport = %event.transport(), "Card detected");
        collaborators::dispatch(
            Arc::clone(&self.resolver),
            Arc::clone(&self.audit),
            event.clone(),
        );
        self.emit(ReaderEvent::CardDetected(event)).await;

        if outcome == TagOutcome::Completed {
            self.manager.set_scanning(false);
            self.debouncer.reset();
            self.emit(ReaderEvent::ScanStopped).await;
        }
    }

    async fn emit(&self, event: ReaderEvent) {
        if self.events.send(event).await.is_err() {
            trace!("Event stream has no receiver");
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable control surface of a running [`ScanService`].
#[derive(Clone)]
pub struct ServiceHandle {
    commands: mpsc::Sender<Command>,
    feed: ProximityFeed,
    proximity: Arc<ProximityConfig>,
}

impl ServiceHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| ControlError::ServiceStopped)?;
        rx.await.map_err(|_| ControlError::ServiceStopped)
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.request(Command::Status).await
    }

    /// Open a scan window. Returns its deadline in milliseconds.
    ///
    /// # Errors
    ///
    /// `AlreadyScanning` if a scan is open, `NoReader` if no reader is
    /// connected. Neither is broadcast.
    pub async fn start_scan(&self) -> Result<u64> {
        self.request(Command::StartScan).await?
    }

    /// Close the scan window. Returns `true` if a scan was open.
    pub async fn stop_scan(&self) -> Result<bool> {
        self.request(Command::StopScan).await
    }

    /// Re-run transport selection and claim the best reader.
    pub async fn connect_reader(&self) -> Result<DeviceHandle> {
        self.request(Command::ConnectReader).await?
    }

    /// Returns `true` if a page served from `origin` may forward proximity reads.
    pub fn accepts_proximity_from(&self, origin: Option<&str>) -> bool {
        self.proximity.is_trusted(origin)
    }

    /// Forward a serial number scanned by a browser page.
    pub fn proximity_read(&self, origin: Option<&str>, serial_number: &str) -> Result<()> {
        if !self.accepts_proximity_from(origin) {
            return Err(ControlError::UntrustedOrigin);
        }
        self.feed
            .push(serial_number)
            .map_err(ControlError::Proximity)
    }
}

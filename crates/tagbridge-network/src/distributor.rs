//! Event fan-out.
//!
//! The [`Distributor`] consumes the ordered [`ReaderEvent`] stream of the
//! scan service and copies every event into the bounded queue of each
//! subscriber. Subscriptions are registered by the same loop that fans out
//! events, so the snapshot a new subscriber receives first and the events
//! that follow it never overlap or leave a gap.
//!
//! ```text
//!                                     ┌──► subscriber 1 queue ──► WebSocket
//! ScanService ──ReaderEvent──► Distributor ──► subscriber 2 queue ──► WebSocket
//!                                     └──► subscriber N queue ──► WebSocket
//! ```
//!
//! A subscriber whose queue is full is dropped rather than allowed to hold
//! up everyone else; its connection is closed and it can reconnect for a
//! fresh snapshot.

use crate::error::{Result, ServerError};
use std::collections::BTreeMap;
use tagbridge_core::ReaderEvent;
use tagbridge_protocol::{ServerMessage, StatusReport};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type SubscriberId = u64;

enum Command {
    Subscribe(oneshot::Sender<Subscription>),
    Unsubscribe(SubscriberId),
    Snapshot(oneshot::Sender<StatusReport>),
    Count(oneshot::Sender<usize>),
}

/// Receiving end of one subscriber.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    messages: mpsc::Receiver<ServerMessage>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next message; `None` once the subscriber was dropped or the
    /// distributor stopped.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.messages.recv().await
    }
}

/// Fan-out loop.
pub struct Distributor {
    events: mpsc::Receiver<ReaderEvent>,
    commands: mpsc::Receiver<Command>,
    subscribers: BTreeMap<SubscriberId, mpsc::Sender<ServerMessage>>,
    status: StatusReport,
    queue_len: usize,
    next_id: SubscriberId,
}

impl Distributor {
    /// `status` is the state at the time the event stream starts.
    pub fn new(
        events: mpsc::Receiver<ReaderEvent>,
        status: StatusReport,
        queue_len: usize,
    ) -> (Self, DistributorHandle) {
        let (tx, commands) = mpsc::channel(32);
        let distributor = Self {
            events,
            commands,
            subscribers: BTreeMap::new(),
            status,
            queue_len: queue_len.max(1),
            next_id: 0,
        };
        (distributor, DistributorHandle { commands: tx })
    }

    /// Run until `shutdown` fires or the event stream ends.
    ///
    /// Dropping the distributor closes every subscription.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command),
                event = self.events.recv() => match event {
                    Some(event) => self.broadcast(event),
                    None => {
                        debug!("Event stream ended");
                        break;
                    }
                },
            }
        }
        info!(subscribers = self.subscribers.len(), "Distributor stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe(reply) => {
                let subscription = self.subscribe();
                if let Err(subscription) = reply.send(subscription) {
                    self.subscribers.remove(&subscription.id);
                }
            }
            Command::Unsubscribe(id) => {
                if self.subscribers.remove(&id).is_some() {
                    info!(subscriber = id, remaining = self.subscribers.len(), "Subscriber left");
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.status.clone());
            }
            Command::Count(reply) => {
                let _ = reply.send(self.subscribers.len());
            }
        }
    }

    fn subscribe(&mut self) -> Subscription {
        self.next_id += 1;
        let id = self.next_id;
        let (tx, messages) = mpsc::channel(self.queue_len);

        // Capacity is at least one, so the snapshot always fits.
        let _ = tx.try_send(ServerMessage::Snapshot(self.status.clone()));
        self.subscribers.insert(id, tx);
        info!(subscriber = id, total = self.subscribers.len(), "Subscriber joined");

        Subscription { id, messages }
    }

    fn broadcast(&mut self, event: ReaderEvent) {
        self.status.apply(&event);
        let message = ServerMessage::from(event);

        self.subscribers.retain(|id, tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = *id, "Subscriber lagging, dropping it");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = *id, "Subscriber gone");
                false
            }
        });
    }
}

/// Cloneable access to a running [`Distributor`].
#[derive(Debug, Clone)]
pub struct DistributorHandle {
    commands: mpsc::Sender<Command>,
}

impl DistributorHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| ServerError::DistributorStopped)?;
        rx.await.map_err(|_| ServerError::DistributorStopped)
    }

    /// Register a subscriber. Its first message is a snapshot.
    pub async fn subscribe(&self) -> Result<Subscription> {
        self.request(Command::Subscribe).await
    }

    pub async fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.commands.send(Command::Unsubscribe(id)).await;
    }

    /// Status as last reported on the event stream.
    pub async fn snapshot(&self) -> Result<StatusReport> {
        self.request(Command::Snapshot).await
    }

    pub async fn subscriber_count(&self) -> Result<usize> {
        self.request(Command::Count).await
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Subscribe(_) => f.write_str("Subscribe"),
            Command::Unsubscribe(id) => write!(f, "Unsubscribe({id})"),
            Command::Snapshot(_) => f.write_str("Snapshot"),
            Command::Count(_) => f.write_str("Count"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tagbridge_core::{TagId, TagReadEvent, TransportKind};

    fn spawn(queue_len: usize) -> (mpsc::Sender<ReaderEvent>, DistributorHandle, CancellationToken) {
        let (events_tx, events) = mpsc::channel(16);
        let (distributor, handle) = Distributor::new(events, StatusReport::disconnected(), queue_len);
        let shutdown = CancellationToken::new();
        tokio::spawn(distributor.run(shutdown.clone()));
        (events_tx, handle, shutdown)
    }

    fn card(raw: &str) -> ReaderEvent {
        ReaderEvent::CardDetected(TagReadEvent::new(
            TagId::parse(raw).unwrap(),
            TransportKind::Usb,
            Utc::now(),
        ))
    }

    async fn recv(subscription: &mut Subscription) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("timed out waiting for message")
            .expect("subscription closed")
    }

    #[tokio::test]
    async fn test_snapshot_reflects_earlier_events() {
        let (events, handle, _shutdown) = spawn(8);

        events
            .send(ReaderEvent::ReaderConnected {
                name: "ACR122U".to_string(),
                transport: TransportKind::Usb,
            })
            .await
            .unwrap();
        events.send(ReaderEvent::ScanStarted { timeout_ms: 30_000 }).await.unwrap();

        // Round-trip through the loop so both events are applied.
        let status = loop {
            let status = handle.snapshot().await.unwrap();
            if status.is_scanning {
                break status;
            }
            tokio::task::yield_now().await;
        };
        assert!(status.reader_connected);

        let mut subscription = handle.subscribe().await.unwrap();
        let ServerMessage::Snapshot(snapshot) = recv(&mut subscription).await else {
            panic!("first message must be a snapshot");
        };
        assert_eq!(snapshot.reader_name.as_deref(), Some("ACR122U"));
        assert!(snapshot.is_scanning);
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_events_in_order() {
        let (events, handle, _shutdown) = spawn(8);
        let mut first = handle.subscribe().await.unwrap();
        let mut second = handle.subscribe().await.unwrap();
        assert_ne!(first.id(), second.id());

        for raw in ["04a1b2c3", "04d4e5f6", "04a7b8c9"] {
            events.send(card(raw)).await.unwrap();
        }

        for subscription in [&mut first, &mut second] {
            assert!(matches!(recv(subscription).await, ServerMessage::Snapshot(_)));
            let mut tags = Vec::new();
            for _ in 0..3 {
                let ServerMessage::CardDetected(read) = recv(subscription).await else {
                    panic!("expected card-detected");
                };
                tags.push(read.tag_id().to_string());
            }
            assert_eq!(tags, vec!["04a1b2c3", "04d4e5f6", "04a7b8c9"]);
        }
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_dropped() {
        let (events, handle, _shutdown) = spawn(2);
        let mut slow = handle.subscribe().await.unwrap();

        for raw in ["04a1b2c3", "04d4e5f6", "04a7b8c9"] {
            events.send(card(raw)).await.unwrap();
        }

        // Snapshot and one event fit; the rest overflowed.
        assert!(matches!(recv(&mut slow).await, ServerMessage::Snapshot(_)));
        assert!(matches!(recv(&mut slow).await, ServerMessage::CardDetected(_)));
        assert!(slow.recv().await.is_none());
        assert_eq!(handle.subscriber_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let (_events, handle, _shutdown) = spawn(8);
        let subscription = handle.subscribe().await.unwrap();
        assert_eq!(handle.subscriber_count().await.unwrap(), 1);

        handle.unsubscribe(subscription.id()).await;
        assert_eq!(handle.subscriber_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscriptions() {
        let (_events, handle, shutdown) = spawn(8);
        let mut subscription = handle.subscribe().await.unwrap();
        recv(&mut subscription).await;

        shutdown.cancel();
        assert!(subscription.recv().await.is_none());
        assert!(matches!(
            handle.subscribe().await,
            Err(ServerError::DistributorStopped)
        ));
    }
}

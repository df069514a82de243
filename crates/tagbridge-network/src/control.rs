//! Control operations shared by the HTTP routes and the event channel.

use crate::distributor::{DistributorHandle, Subscription};
use std::time::Duration;
use tagbridge_core::TagReadEvent;
use tagbridge_protocol::{ControlReply, ServerMessage};
use tagbridge_session::{ControlError, ServiceHandle};
use tracing::debug;

pub async fn start_scan(service: &ServiceHandle) -> Result<ControlReply, ControlError> {
    let timeout_ms = service.start_scan().await?;
    Ok(ControlReply::ok(format!("Scan started ({timeout_ms} ms)")))
}

pub async fn stop_scan(service: &ServiceHandle) -> Result<ControlReply, ControlError> {
    let reply = if service.stop_scan().await? {
        ControlReply::ok("Scan stopped")
    } else {
        ControlReply::ok("No scan in progress")
    };
    Ok(reply)
}

pub async fn connect_reader(service: &ServiceHandle) -> Result<ControlReply, ControlError> {
    let reader = service.connect_reader().await?;
    Ok(ControlReply::ok(format!("Connected to {}", reader.name())))
}

/// Fold a control outcome into the reply sent over the event channel.
pub fn into_reply(result: Result<ControlReply, ControlError>) -> ControlReply {
    result.unwrap_or_else(|e| ControlReply::failed(e.to_string()))
}

/// Open a scan, wait for its first tag and close it again.
///
/// Waits at most `limit` and never past the scan deadline. Returns `None`
/// when the scan ends without a tag.
pub async fn read_once(
    service: &ServiceHandle,
    distributor: &DistributorHandle,
    limit: Option<Duration>,
) -> Result<Option<TagReadEvent>, ControlError> {
    let mut subscription = distributor
        .subscribe()
        .await
        .map_err(|_| ControlError::ServiceStopped)?;
    let outcome = wait_for_tag(service, &mut subscription, limit).await;
    distributor.unsubscribe(subscription.id()).await;
    outcome
}

async fn wait_for_tag(
    service: &ServiceHandle,
    subscription: &mut Subscription,
    limit: Option<Duration>,
) -> Result<Option<TagReadEvent>, ControlError> {
    let deadline = Duration::from_millis(service.start_scan().await?);
    let limit = limit.map_or(deadline, |limit| limit.min(deadline));

    let first = async {
        while let Some(message) = subscription.recv().await {
            match message {
                ServerMessage::CardDetected(read) => return Some(read),
                ServerMessage::ScanStopped
                | ServerMessage::ScanTimeout
                | ServerMessage::ReaderDisconnected
                | ServerMessage::Error { .. } => return None,
                _ => {}
            }
        }
        None
    };
    let read = tokio::time::timeout(limit, first).await.ok().flatten();
    if read.is_none() {
        debug!(limit_ms = limit.as_millis() as u64, "One-shot read found no tag");
    }

    // Single-shot scans have already closed themselves.
    service.stop_scan().await?;
    Ok(read)
}

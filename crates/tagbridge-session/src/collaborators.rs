//! External collaborators of the scan service.
//!
//! A [`TagResolver`] answers which customer a tag belongs to; an
//! [`AuditSink`] receives every read together with that answer. Both run on
//! spawned tasks, so a slow or failing collaborator never delays or breaks
//! event distribution.

use futures::future::BoxFuture;
use std::sync::Arc;
use tagbridge_core::{Resolution, Result, TagId, TagReadEvent};
use tracing::{debug, warn};

/// Customer lookup keyed by normalized tag id.
pub trait TagResolver: Send + Sync + 'static {
    fn resolve(&self, tag_id: &TagId) -> BoxFuture<'static, Result<Resolution>>;
}

/// Best-effort persistence hook for reads.
pub trait AuditSink: Send + Sync + 'static {
    fn record(
        &self,
        event: &TagReadEvent,
        resolution: &Resolution,
    ) -> BoxFuture<'static, Result<()>>;
}

/// Resolver that never associates a tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unassociated;

impl TagResolver for Unassociated {
    fn resolve(&self, _tag_id: &TagId) -> BoxFuture<'static, Result<Resolution>> {
        Box::pin(async { Ok(Resolution::Unassociated) })
    }
}

/// Audit sink writing each read to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAudit;

impl AuditSink for LogAudit {
    fn record(
        &self,
        event: &TagReadEvent,
        resolution: &Resolution,
    ) -> BoxFuture<'static, Result<()>> {
        debug!(
            tag_id = %event.tag_id(),
            transport = %event.transport(),
            associated = resolution.is_associated(),
            "Tag read audited"
        );
        Box::pin(async { Ok(()) })
    }
}

/// Resolve `event` and hand both to the audit sink on a detached task.
pub fn dispatch(resolver: Arc<dyn TagResolver>, audit: Arc<dyn AuditSink>, event: TagReadEvent) {
    tokio::spawn(async move {
        let resolution = match resolver.resolve(event.tag_id()).await {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(tag_id = %event.tag_id(), error = %e, "Customer lookup failed");
                Resolution::Unassociated
            }
        };

        if let Err(e) = audit.record(&event, &resolution).await {
            warn!(tag_id = %event.tag_id(), error = %e, "Audit hook failed");
        }
    });
}

//! Delivers post-commit events. Failures are logged and counted, never raised.

use serde::Serialize;
use tracing::{debug, warn};

use crate::persistence::PostCommitEvent;
use crate::traits::NotificationDispatcher;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub sent: usize,
    pub failed: usize,
}

pub fn dispatch_all(events: &[PostCommitEvent], dispatcher: &dyn NotificationDispatcher) -> DispatchSummary {
    let mut summary = DispatchSummary::default();
    for event in events {
        match dispatcher.notify(&event.event_type, &event.recipient, &event.payload) {
            Ok(()) => summary.sent += 1,
            Err(err) => {
                warn!(
                    event_type = %event.event_type,
                    recipient = %event.recipient,
                    error = %err,
                    "notification failed"
                );
                summary.failed += 1;
            }
        }
    }
    debug!(sent = summary.sent, failed = summary.failed, "notifications dispatched");
    summary
}

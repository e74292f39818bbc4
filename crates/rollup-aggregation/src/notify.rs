//! Window-closed notifications
//!
//! Hooks are fire-and-forget: they run on the consumer task after the
//! closed window is persisted and must not block or fail it.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, trace};

use rollup_common::types::AggregateRecord;

/// Receives every window a consumer closes
pub trait WindowClosedHook: Send + Sync {
    fn on_window_closed(&self, record: &AggregateRecord);
}

/// Logs each closed window at info level
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHook;

impl WindowClosedHook for LoggingHook {
    fn on_window_closed(&self, record: &AggregateRecord) {
        info!(
            partition_key = %record.partition_key,
            metric = %record.metric_name,
            window_start = record.window_start,
            window_end = record.window_end,
            value = record.value,
            updates = record.update_count,
            "Window closed"
        );
    }
}

/// Publishes closed windows on a broadcast channel
pub struct BroadcastHook {
    sender: broadcast::Sender<AggregateRecord>,
}

impl BroadcastHook {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AggregateRecord> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl WindowClosedHook for BroadcastHook {
    fn on_window_closed(&self, record: &AggregateRecord) {
        // No subscribers is fine
        if self.sender.send(record.clone()).is_err() {
            trace!("Dropped window notification, no subscribers");
        }
    }
}

impl WindowClosedHook for Vec<Arc<dyn WindowClosedHook>> {
    fn on_window_closed(&self, record: &AggregateRecord) {
        for hook in self {
            hook.on_window_closed(record);
        }
    }
}

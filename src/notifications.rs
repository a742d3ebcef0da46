//! Append-only log of recent agent events.
//!
//! A bounded ring (oldest evicted first) for the status surface, plus a
//! broadcast channel so an external observer (UI bridge) can subscribe to
//! events as they happen instead of polling the ring.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Maximum number of notifications retained in the ring.
const RING_CAPACITY: usize = 50;

/// Broadcast buffer for live subscribers. A slow subscriber loses old
/// events rather than blocking the agent.
const BROADCAST_CAPACITY: usize = 64;

/// A single observable agent event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Stable machine-readable event name, e.g. `task_completed`.
    pub event: String,
    /// Human-readable description.
    pub message: String,
    /// Optional structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Bounded ring of recent agent events.
pub struct NotificationLog {
    ring: Mutex<VecDeque<Notification>>,
    tx: broadcast::Sender<Notification>,
}

impl NotificationLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            tx,
        }
    }

    /// Record an event. Never blocks; dropped subscribers are ignored.
    pub fn record(
        &self,
        event: impl Into<String>,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) {
        let notification = Notification {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event: event.into(),
            message: message.into(),
            data,
        };

        tracing::debug!(event = %notification.event, "{}", notification.message);

        {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(notification.clone());
        }

        let _ = self.tx.send(notification);
    }

    /// Snapshot of retained events, oldest first.
    pub fn recent(&self) -> Vec<Notification> {
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Subscribe to events recorded after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for NotificationLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_recent() {
        let log = NotificationLog::new();
        log.record("enrolled", "agent enrolled", None);
        log.record(
            "task_completed",
            "task t1 done",
            Some(serde_json::json!({"task_id": "t1"})),
        );

        let recent = log.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event, "enrolled");
        assert_eq!(recent[1].event, "task_completed");
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let log = NotificationLog::new();
        for i in 0..RING_CAPACITY + 10 {
            log.record("tick", format!("event {i}"), None);
        }

        let recent = log.recent();
        assert_eq!(recent.len(), RING_CAPACITY);
        assert_eq!(recent[0].message, "event 10");
        assert_eq!(recent.last().unwrap().message, format!("event {}", RING_CAPACITY + 9));
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let log = NotificationLog::new();
        let mut rx = log.subscribe();

        log.record("heartbeat", "sent", None);

        let n = rx.recv().await.unwrap();
        assert_eq!(n.event, "heartbeat");
    }
}

//! Notifier: best-effort fan-out of bus events.
//!
//! Every subscriber (local observers and the pub socket connections) gets its
//! own receiver. Nothing is acknowledged; a notification sent while nobody
//! listens is simply dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// Routing scope of the bus itself.
pub const GREATHALL: &str = "greathall";

pub const REGISTRY_CHANGED: &str = "greathall::bus.commands.registry";
pub const TOKEN_CHANGED: &str = "greathall::bus.token.changed";
pub const ORCNAME_ADDED: &str = "greathall::bus.orcname.added";
pub const ORCNAME_REMOVED: &str = "greathall::bus.orcname.removed";
pub const GAMEOVER: &str = "gameover";
pub const HEARTBEAT: &str = "heartbeat";

/// One published event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: u64,
}

impl Notification {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
        }
    }
}

/// Topic of an event addressed to a given orc.
pub fn orc_topic(orc_name: &str, topic: &str) -> String {
    format!("{}::{}", orc_name, topic)
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; returns how many subscribers received it.
    pub fn send(&self, topic: impl Into<String>, payload: Value) -> usize {
        let notification = Notification::new(topic, payload);
        debug!(topic = %notification.topic, "notify");
        self.tx.send(notification).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish `heartbeat` on a fixed period until the task is aborted.
    pub fn spawn_heartbeat(&self, period: Duration) -> JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                notifier.send(HEARTBEAT, Value::Null);
            }
        })
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

//! Single-process publish-subscribe of lifecycle events.
//!
//! Connections are registered by the transport layer (the WebSocket
//! endpoint); each holds an mpsc sender of wire envelopes. Delivery is
//! best-effort: there is no per-connection backlog, and a consumer whose
//! channel is full or closed is dropped on the spot.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::Event;

/// Bus tuning knobs.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Connections idle longer than this are reaped.
    pub max_idle: Duration,
    /// How often the reaper sweeps.
    pub reap_interval: Duration,
    /// Per-connection envelope buffer; a consumer this far behind is dead.
    pub buffer: usize,
    /// Feature flags advertised in the welcome message.
    pub feature_flags: Vec<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_secs(600),
            reap_interval: Duration::from_secs(300),
            buffer: 64,
            feature_flags: Vec::new(),
        }
    }
}

/// Wire envelope for server-to-client messages.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub id: Uuid,
}

impl Envelope {
    fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
        }
    }
}

/// Client-to-server messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        user_id: Option<Uuid>,
        organization_id: Option<Uuid>,
    },
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        channel: String,
    },
    Ping,
}

struct Connection {
    user_id: Option<Uuid>,
    organization_id: Option<Uuid>,
    channels: HashSet<String>,
    last_activity: Instant,
    tx: mpsc::Sender<Envelope>,
}

/// Connection counts for health reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubscriberStats {
    pub connections: usize,
    pub authenticated: usize,
    pub subscriptions: usize,
}

/// The notification bus.
pub struct NotificationBus {
    config: BusConfig,
    connections: Mutex<HashMap<Uuid, Connection>>,
}

impl NotificationBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Register a connection. The welcome message is already in the
    /// returned receiver.
    pub fn open(&self) -> (Uuid, mpsc::Receiver<Envelope>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.buffer);

        let welcome = Envelope::new(
            "welcome",
            serde_json::json!({
                "connection_id": id,
                "features": self.config.feature_flags,
            }),
        );
        // The buffer is freshly empty; this cannot fail.
        let _ = tx.try_send(welcome);

        let mut connections = self.connections.lock().expect("bus lock poisoned");
        connections.insert(id, Connection {
            user_id: None,
            organization_id: None,
            channels: HashSet::new(),
            last_activity: Instant::now(),
            tx,
        });
        (id, rx)
    }

    /// Drop a connection.
    pub fn close(&self, connection_id: Uuid) {
        let mut connections = self.connections.lock().expect("bus lock poisoned");
        connections.remove(&connection_id);
    }

    /// Handle one client message; refreshes the connection's activity clock.
    pub fn handle_client_message(&self, connection_id: Uuid, message: ClientMessage) {
        let mut connections = self.connections.lock().expect("bus lock poisoned");
        let Some(conn) = connections.get_mut(&connection_id) else {
            return;
        };
        conn.last_activity = Instant::now();

        match message {
            ClientMessage::Authenticate {
                user_id,
                organization_id,
            } => {
                conn.user_id = user_id;
                conn.organization_id = organization_id;
            }
            ClientMessage::Subscribe { channel } => {
                conn.channels.insert(channel);
            }
            ClientMessage::Unsubscribe { channel } => {
                conn.channels.remove(&channel);
            }
            ClientMessage::Ping => {
                let pong = Envelope::new("pong", serde_json::json!({}));
                let _ = conn.tx.try_send(pong);
            }
        }
    }

    /// Fan an event out to every matching connection.
    ///
    /// A connection matches when it subscribes to one of the event's
    /// channels and no identity filter excludes it. Send failure means the
    /// consumer is slow or gone; the connection is dropped.
    pub fn publish(&self, event: &Event) {
        let envelope = Envelope::new(event.kind.as_str(), event.data.clone());
        let channels = event.channels();

        let mut dead = Vec::new();
        {
            let connections = self.connections.lock().expect("bus lock poisoned");
            for (id, conn) in connections.iter() {
                if !Self::delivers_to(conn, event, &channels) {
                    continue;
                }
                if conn.tx.try_send(envelope.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut connections = self.connections.lock().expect("bus lock poisoned");
            for id in dead {
                tracing::debug!(connection_id = %id, "dropping unresponsive subscriber");
                connections.remove(&id);
            }
        }
    }

    fn delivers_to(conn: &Connection, event: &Event, channels: &[String; 2]) -> bool {
        if !channels.iter().any(|c| conn.channels.contains(c)) {
            return false;
        }
        if let (Some(event_org), Some(conn_org)) = (event.organization_id, conn.organization_id) {
            if event_org != conn_org {
                return false;
            }
        }
        if let (Some(event_user), Some(conn_user)) = (event.user_id, conn.user_id) {
            if event_user != conn_user {
                return false;
            }
        }
        true
    }

    /// Remove connections idle longer than the configured maximum.
    /// Returns how many were reaped.
    pub fn reap_inactive(&self) -> usize {
        let cutoff = self.config.max_idle;
        let mut connections = self.connections.lock().expect("bus lock poisoned");
        let before = connections.len();
        connections.retain(|id, conn| {
            let keep = conn.last_activity.elapsed() < cutoff;
            if !keep {
                tracing::debug!(connection_id = %id, "reaping inactive subscriber");
            }
            keep
        });
        before - connections.len()
    }

    /// Spawn the periodic reaper.
    pub fn spawn_reaper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let bus = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(bus.config.reap_interval) => {}
                    _ = cancel.cancelled() => break,
                }
                let reaped = bus.reap_inactive();
                if reaped > 0 {
                    tracing::info!(count = reaped, "reaped inactive subscribers");
                }
            }
        })
    }

    /// Connection counts.
    pub fn stats(&self) -> SubscriberStats {
        let connections = self.connections.lock().expect("bus lock poisoned");
        SubscriberStats {
            connections: connections.len(),
            authenticated: connections
                .values()
                .filter(|c| c.user_id.is_some() || c.organization_id.is_some())
                .count(),
            subscriptions: connections.values().map(|c| c.channels.len()).sum(),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn bus() -> NotificationBus {
        NotificationBus::new(BusConfig::default())
    }

    fn event(kind: EventKind, org: Option<Uuid>, run_id: Uuid) -> Event {
        Event::new(kind, org, run_id, serde_json::json!({"run_id": run_id}))
    }

    #[tokio::test]
    async fn open_delivers_welcome() {
        let bus = bus();
        let (_id, mut rx) = bus.open();
        let welcome = rx.recv().await.expect("welcome should arrive");
        assert_eq!(welcome.kind, "welcome");
        assert!(welcome.data.get("connection_id").is_some());
    }

    #[tokio::test]
    async fn publish_respects_channel_subscription() {
        let bus = bus();
        let run_id = Uuid::new_v4();

        let (subscribed, mut rx_subscribed) = bus.open();
        let (other, mut rx_other) = bus.open();
        rx_subscribed.recv().await.unwrap();
        rx_other.recv().await.unwrap();

        bus.handle_client_message(subscribed, ClientMessage::Subscribe {
            channel: "workflows".to_string(),
        });
        bus.handle_client_message(other, ClientMessage::Subscribe {
            channel: "tasks".to_string(),
        });

        bus.publish(&event(EventKind::WorkflowStarted, None, run_id));

        let got = rx_subscribed.recv().await.unwrap();
        assert_eq!(got.kind, "workflow_started");
        assert!(rx_other.try_recv().is_err(), "unsubscribed channel must not receive");
    }

    #[tokio::test]
    async fn run_channel_receives_task_events() {
        let bus = bus();
        let run_id = Uuid::new_v4();

        let (conn, mut rx) = bus.open();
        rx.recv().await.unwrap();
        bus.handle_client_message(conn, ClientMessage::Subscribe {
            channel: format!("run:{run_id}"),
        });

        bus.publish(&event(EventKind::TaskCompleted, None, run_id));
        assert_eq!(rx.recv().await.unwrap().kind, "task_completed");
    }

    #[tokio::test]
    async fn organization_filter_excludes_foreign_tenants() {
        let bus = bus();
        let run_id = Uuid::new_v4();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();

        let (conn, mut rx) = bus.open();
        rx.recv().await.unwrap();
        bus.handle_client_message(conn, ClientMessage::Authenticate {
            user_id: None,
            organization_id: Some(org_b),
        });
        bus.handle_client_message(conn, ClientMessage::Subscribe {
            channel: "workflows".to_string(),
        });

        bus.publish(&event(EventKind::WorkflowStarted, Some(org_a), run_id));
        assert!(rx.try_recv().is_err(), "foreign-tenant event must be filtered");

        bus.publish(&event(EventKind::WorkflowStarted, Some(org_b), run_id));
        assert_eq!(rx.recv().await.unwrap().kind, "workflow_started");
    }

    #[tokio::test]
    async fn user_addressed_events_skip_other_users() {
        let bus = bus();
        let run_id = Uuid::new_v4();
        let target = Uuid::new_v4();

        let (conn, mut rx) = bus.open();
        rx.recv().await.unwrap();
        bus.handle_client_message(conn, ClientMessage::Authenticate {
            user_id: Some(Uuid::new_v4()),
            organization_id: None,
        });
        bus.handle_client_message(conn, ClientMessage::Subscribe {
            channel: "workflows".to_string(),
        });

        let mut addressed = event(EventKind::WorkflowCompleted, None, run_id);
        addressed.user_id = Some(target);
        bus.publish(&addressed);
        assert!(rx.try_recv().is_err(), "message for another user must be filtered");

        let broadcast = event(EventKind::WorkflowCompleted, None, run_id);
        bus.publish(&broadcast);
        assert_eq!(rx.recv().await.unwrap().kind, "workflow_completed");
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let bus = bus();
        let (conn, mut rx) = bus.open();
        rx.recv().await.unwrap();

        bus.handle_client_message(conn, ClientMessage::Ping);
        assert_eq!(rx.recv().await.unwrap().kind, "pong");
    }

    #[tokio::test]
    async fn slow_consumer_is_dropped() {
        let bus = NotificationBus::new(BusConfig {
            buffer: 1,
            ..BusConfig::default()
        });
        let run_id = Uuid::new_v4();
        let (conn, mut rx) = bus.open();
        rx.recv().await.unwrap();
        bus.handle_client_message(conn, ClientMessage::Subscribe {
            channel: "workflows".to_string(),
        });

        // Fill the buffer without draining, then publish once more.
        bus.publish(&event(EventKind::WorkflowStarted, None, run_id));
        bus.publish(&event(EventKind::WorkflowRunning, None, run_id));

        assert_eq!(bus.stats().connections, 0, "slow consumer must be dropped");
    }

    #[tokio::test]
    async fn reap_removes_idle_connections() {
        let bus = NotificationBus::new(BusConfig {
            max_idle: Duration::from_millis(20),
            ..BusConfig::default()
        });
        let (_idle, mut rx_idle) = bus.open();
        rx_idle.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let (active, mut rx_active) = bus.open();
        rx_active.recv().await.unwrap();

        let reaped = bus.reap_inactive();
        assert_eq!(reaped, 1);
        assert_eq!(bus.stats().connections, 1);

        bus.handle_client_message(active, ClientMessage::Ping);
        assert_eq!(rx_active.recv().await.unwrap().kind, "pong");
    }
}

// src/bus.rs
//
// =============================================================================
// SUNBENCH: MESSAGE BUS SEAM
// =============================================================================
//
// The nervous system between bus clients and the engine.
//
// Responsibilities:
// 1. Define the `Bus` trait (publish / subscribe) the engine talks to.
// 2. Provide `LocalBus`, an in-process broker with MQTT topic filters,
//    retained messages and per-session last wills.
// 3. Name every topic the engine consumes or produces.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

// ============================================================================
// 1. TOPICS
// ============================================================================

pub mod topics {
    pub const RUN: &str = "measurement/run";
    pub const STOP: &str = "measurement/stop";
    pub const STATUS: &str = "measurement/status";
    pub const LOG: &str = "measurement/log";
    pub const DAQ_INIT: &str = "daq/init";
    pub const DAQ_START: &str = "daq/start";
    pub const DAQ_STOP: &str = "daq/stop";
    pub const LIVE_DEVICES: &str = "plotter/live_devices";
    pub const SPECTRUM: &str = "calibration/spectrum";

    /// Utility command namespace.
    pub const CMD: &str = "cmd/#";
    /// Utility log channel.
    pub const UTILITY_STATUS: &str = "status";
    /// Utility results (stage positions).
    pub const RESPONSE: &str = "response";

    pub fn clear_plot(kind: &str) -> String {
        format!("plotter/{}/clear", kind)
    }

    pub fn raw_data(kind: &str) -> String {
        format!("data/raw/{}", kind)
    }
}

// ============================================================================
// 2. WIRE TYPES
// ============================================================================

/// Delivery guarantee requested for a message. State-bearing traffic only
/// ever asks for exactly-once; `LocalBus` delivers each message once, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    ExactlyOnce,
}

/// A message queued for publication.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

impl OutgoingMessage {
    /// JSON payload at the highest QoS, which every state-bearing message uses.
    pub fn json<T: Serialize + ?Sized>(
        topic: impl Into<String>,
        value: &T,
        retain: bool,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            topic: topic.into(),
            payload: serde_json::to_vec(value)?,
            qos: Qos::ExactlyOnce,
            retain,
        })
    }
}

/// A message as seen by a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    /// True when replayed from the retained store on subscribe.
    pub retained: bool,
}

impl Delivery {
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.payload)
    }
}

pub type Subscription = mpsc::UnboundedReceiver<Delivery>;

// ============================================================================
// 3. THE BUS TRAIT (The Contract)
// ============================================================================

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, msg: OutgoingMessage) -> Result<()>;
    async fn subscribe(&self, filter: &str) -> Result<Subscription>;
}

/// MQTT filter matching: `+` is one level, a trailing `#` is any suffix.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ============================================================================
// 4. LOCAL BROKER
// ============================================================================

struct Subscriber {
    session: u64,
    filter: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    retained: BTreeMap<String, Vec<u8>>,
    subscribers: Vec<Subscriber>,
}

/// In-process broker. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct LocalBus {
    state: Arc<Mutex<BrokerState>>,
    next_session: Arc<AtomicU64>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a client session. `wills` are published if the session is
    /// dropped without `disconnect()`.
    pub fn connect(&self, client_id: &str, wills: Vec<OutgoingMessage>) -> Session {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("Bus session {} opened for {}", id, client_id);
        Session {
            id,
            client_id: client_id.to_string(),
            bus: self.clone(),
            wills: Mutex::new(wills),
            graceful: AtomicBool::new(false),
        }
    }

    /// Current retained payload for a topic.
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.lock().retained.get(topic).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        // A panicking subscriber cannot leave the maps half-written
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deliver(&self, msg: OutgoingMessage) {
        let mut state = self.lock();
        if msg.retain {
            if msg.payload.is_empty() {
                state.retained.remove(&msg.topic);
            } else {
                state.retained.insert(msg.topic.clone(), msg.payload.clone());
            }
        }
        let delivery = Delivery {
            topic: msg.topic,
            payload: msg.payload,
            retained: false,
        };
        state.subscribers.retain(|s| {
            if !topic_matches(&s.filter, &delivery.topic) {
                return !s.tx.is_closed();
            }
            s.tx.send(delivery.clone()).is_ok()
        });
    }

    fn register(&self, session: u64, filter: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        for (topic, payload) in &state.retained {
            if topic_matches(filter, topic) {
                let _ = tx.send(Delivery {
                    topic: topic.clone(),
                    payload: payload.clone(),
                    retained: true,
                });
            }
        }
        state.subscribers.push(Subscriber {
            session,
            filter: filter.to_string(),
            tx,
        });
        rx
    }

    fn drop_session(&self, session: u64) {
        self.lock().subscribers.retain(|s| s.session != session);
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, msg: OutgoingMessage) -> Result<()> {
        self.deliver(msg);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<Subscription> {
        Ok(self.register(0, filter))
    }
}

/// A client connection to a `LocalBus`.
pub struct Session {
    id: u64,
    client_id: String,
    bus: LocalBus,
    wills: Mutex<Vec<OutgoingMessage>>,
    graceful: AtomicBool,
}

impl Session {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Graceful disconnect: subscriptions end, last wills are discarded.
    pub fn disconnect(&self) {
        self.graceful.store(true, Ordering::SeqCst);
        self.bus.drop_session(self.id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.bus.drop_session(self.id);
        if !self.graceful.load(Ordering::SeqCst) {
            log::warn!("Bus session {} lost, publishing last will", self.client_id);
            let wills = std::mem::take(self.wills.get_mut().unwrap_or_else(|e| e.into_inner()));
            for will in wills {
                self.bus.deliver(will);
            }
        }
    }
}

#[async_trait]
impl Bus for Session {
    async fn publish(&self, msg: OutgoingMessage) -> Result<()> {
        self.bus.deliver(msg);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<Subscription> {
        Ok(self.bus.register(self.id, filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_follow_mqtt_rules() {
        assert!(topic_matches("cmd/#", "cmd/home"));
        assert!(topic_matches("cmd/#", "cmd/a/b"));
        assert!(topic_matches("#", "measurement/run"));
        assert!(topic_matches("measurement/+", "measurement/stop"));
        assert!(!topic_matches("measurement/+", "measurement/a/b"));
        assert!(!topic_matches("daq/init", "daq/start"));
        assert!(topic_matches("status", "status"));
    }

    #[tokio::test]
    async fn retained_messages_replay_and_clear() {
        let bus = LocalBus::new();
        bus.publish(OutgoingMessage::json(topics::STATUS, "Ready", true).unwrap())
            .await
            .unwrap();

        let mut sub = bus.subscribe("measurement/#").await.unwrap();
        let first = sub.recv().await.unwrap();
        assert!(first.retained);
        assert_eq!(first.json().unwrap(), serde_json::json!("Ready"));

        bus.publish(OutgoingMessage {
            topic: topics::STATUS.into(),
            payload: vec![],
            qos: Qos::ExactlyOnce,
            retain: true,
        })
        .await
        .unwrap();
        assert!(bus.retained(topics::STATUS).is_none());
    }

    #[tokio::test]
    async fn dropped_session_publishes_last_will() {
        let bus = LocalBus::new();
        let will = OutgoingMessage::json(topics::STATUS, "Offline", true).unwrap();

        let session = bus.connect("graceful", vec![will.clone()]);
        session.disconnect();
        assert!(bus.retained(topics::STATUS).is_none());

        let session = bus.connect("crashy", vec![will]);
        drop(session);
        assert_eq!(
            bus.retained(topics::STATUS),
            Some(serde_json::to_vec("Offline").unwrap())
        );
    }
}

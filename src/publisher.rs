// src/publisher.rs
//
// =============================================================================
// SUNBENCH: STATUS PUBLISHER
// =============================================================================
//
// One ordered outbound channel per server.
//
// Every producer (router, manager, worker, sequencer) holds a clone of the
// `Outbox`. A single sender task drains the queue in submission order, so a
// job's "Busy" can never be observed after that job's "Ready".

use crate::bus::{topics, Bus, OutgoingMessage};
use crate::core::Status;
use crate::logs::Severity;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Publish attempts before a message is given up on.
const MAX_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

enum Envelope {
    Message(OutgoingMessage),
    Flush(oneshot::Sender<()>),
}

// ============================================================================
// 1. THE PRODUCER HANDLE
// ============================================================================

#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Outbox {
    /// Creates the queue and spawns its sender loop on `bus`.
    pub fn spawn(bus: Arc<dyn Bus>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(sender_loop(bus, rx));
        (Self { tx }, handle)
    }

    /// Queues a raw message. Never blocks.
    pub fn send(&self, msg: OutgoingMessage) {
        if self.tx.send(Envelope::Message(msg)).is_err() {
            log::error!("Outbox closed, message dropped");
        }
    }

    pub fn append<T: Serialize + ?Sized>(&self, topic: &str, value: &T, retain: bool) {
        match OutgoingMessage::json(topic, value, retain) {
            Ok(msg) => self.send(msg),
            Err(e) => log::error!("Unable to encode payload for {}: {}", topic, e),
        }
    }

    /// Resolves once everything queued before this call reached the bus.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Envelope::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    // --- Measurement channel ---

    /// `measurement/log` event, mirrored to the local log.
    pub fn log(&self, level: Severity, msg: impl Into<String>) {
        let msg = msg.into();
        log::log!(level.as_log_level(), "{}", msg);
        self.append(topics::LOG, &json!({ "level": level, "msg": msg }), false);
    }

    pub fn status(&self, status: Status) {
        self.append(topics::STATUS, &status, true);
    }

    pub fn live_devices(&self, labels: &[String]) {
        self.append(topics::LIVE_DEVICES, labels, true);
    }

    pub fn clear_plot(&self, kind: &str) {
        self.append(&topics::clear_plot(kind), "", false);
    }

    // --- Utility channel ---

    /// `status` log event used by the utility handler.
    pub fn utility_log(&self, level: Severity, text: impl Into<String>) {
        let text = text.into();
        log::log!(level.as_log_level(), "Message to client: {}", text);
        self.append(
            topics::UTILITY_STATUS,
            &json!({ "log": { "level": level, "text": text } }),
            false,
        );
    }
}

// ============================================================================
// 2. THE SENDER LOOP
// ============================================================================

async fn sender_loop(bus: Arc<dyn Bus>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        match envelope {
            Envelope::Message(msg) => publish_with_retry(bus.as_ref(), msg).await,
            Envelope::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    log::debug!("Sender loop finished");
}

async fn publish_with_retry(bus: &dyn Bus, msg: OutgoingMessage) {
    let mut attempt = 1;
    loop {
        match bus.publish(msg.clone()).await {
            Ok(()) => return,
            Err(e) if attempt < MAX_ATTEMPTS => {
                log::warn!(
                    "Publish to {} failed (attempt {}): {}",
                    msg.topic,
                    attempt,
                    e
                );
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                log::error!("Giving up on message to {}: {}", msg.topic, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LocalBus, Subscription};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyBus {
        inner: LocalBus,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl Bus for FlakyBus {
        async fn publish(&self, msg: OutgoingMessage) -> anyhow::Result<()> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(anyhow!("broker unreachable"));
            }
            self.inner.publish(msg).await
        }

        async fn subscribe(&self, filter: &str) -> anyhow::Result<Subscription> {
            self.inner.subscribe(filter).await
        }
    }

    #[tokio::test]
    async fn messages_arrive_in_submission_order() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("#").await.unwrap();
        let (outbox, _h) = Outbox::spawn(Arc::new(bus));

        outbox.status(Status::Busy);
        outbox.log(Severity::Info, "working");
        outbox.status(Status::Ready);
        outbox.flush().await;

        let topics: Vec<_> = (0..3)
            .map(|_| sub.try_recv().unwrap())
            .map(|d| (d.topic.clone(), d.json().unwrap()))
            .collect();
        assert_eq!(topics[0], (topics::STATUS.into(), json!("Busy")));
        assert_eq!(topics[1].1["level"], 20);
        assert_eq!(topics[2], (topics::STATUS.into(), json!("Ready")));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_publishes_are_retried() {
        let inner = LocalBus::new();
        let mut sub = inner.subscribe(topics::STATUS).await.unwrap();
        let bus = FlakyBus {
            inner,
            failures_left: AtomicU32::new(2),
        };
        let (outbox, _h) = Outbox::spawn(Arc::new(bus));

        outbox.status(Status::Ready);
        outbox.flush().await;
        assert_eq!(sub.try_recv().unwrap().json().unwrap(), json!("Ready"));
    }

    #[tokio::test]
    async fn utility_logs_use_the_status_channel() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe(topics::UTILITY_STATUS).await.unwrap();
        let (outbox, _h) = Outbox::spawn(Arc::new(bus));

        outbox.utility_log(Severity::Warning, "Backend busy");
        outbox.flush().await;
        let v = sub.try_recv().unwrap().json().unwrap();
        assert_eq!(v["log"]["level"], 30);
        assert_eq!(v["log"]["text"], "Backend busy");
    }
}

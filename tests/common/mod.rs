// Shared rig for the bus-level tests: a LocalBus, a virtual bench and a
// running server, plus a tap on every message the bus carries.
#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use sunbench::bus::{Delivery, OutgoingMessage, Subscription};
use sunbench::{Bus, InstrumentFactory, LocalBus, Server, ServerSettings, SimBench};

pub struct Rig {
    pub bus: LocalBus,
    pub bench: SimBench,
    pub factory: InstrumentFactory,
    pub server: Server,
    pub tap: Subscription,
    /// Everything read from `tap` so far.
    pub seen: Vec<Delivery>,
}

pub async fn rig() -> Rig {
    let bus = LocalBus::new();
    let tap = bus.subscribe("#").await.expect("tap");
    let factory = InstrumentFactory::simulated();
    let bench = factory.bench().clone();
    let server = Server::start(Arc::new(bus.clone()), factory.clone(), ServerSettings::default())
        .await
        .expect("Server failed to start");
    Rig {
        bus,
        bench,
        factory,
        server,
        tap,
        seen: Vec::new(),
    }
}

impl Rig {
    pub async fn send(&self, topic: &str, payload: Value) {
        let msg = OutgoingMessage::json(topic, &payload, false).expect("encode");
        self.bus.publish(msg).await.expect("publish");
    }

    /// Reads the tap until `pred` matches. Paused clocks make the hour cheap.
    pub async fn wait_for(&mut self, what: &str, pred: impl Fn(&Delivery) -> bool) -> Delivery {
        let found = tokio::time::timeout(Duration::from_secs(3600), async {
            while let Some(d) = self.tap.recv().await {
                self.seen.push(d.clone());
                if pred(&d) {
                    return Some(d);
                }
            }
            None
        })
        .await;
        match found {
            Ok(Some(d)) => d,
            _ => panic!("never saw {}; logs so far: {:?}", what, self.logs()),
        }
    }

    pub async fn wait_log(&mut self, text: &str) -> Delivery {
        let wanted = text.to_string();
        self.wait_for(text, move |d| log_msg(d).is_some_and(|m| m.contains(&wanted)))
            .await
    }

    pub async fn wait_utility(&mut self, text: &str) -> Delivery {
        let wanted = text.to_string();
        self.wait_for(text, move |d| {
            utility_text(d).is_some_and(|m| m.contains(&wanted))
        })
        .await
    }

    pub fn logs(&self) -> Vec<String> {
        self.seen.iter().filter_map(log_msg).collect()
    }

    pub fn utility_logs(&self) -> Vec<String> {
        self.seen.iter().filter_map(utility_text).collect()
    }

    pub fn count_topic(&self, topic: &str) -> usize {
        self.seen.iter().filter(|d| d.topic == topic).count()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.seen
            .iter()
            .filter(|d| d.topic == "measurement/status")
            .filter_map(|d| d.json().ok()?.as_str().map(String::from))
            .collect()
    }
}

pub fn log_msg(d: &Delivery) -> Option<String> {
    if d.topic != "measurement/log" {
        return None;
    }
    d.json().ok()?.get("msg")?.as_str().map(String::from)
}

pub fn utility_text(d: &Delivery) -> Option<String> {
    if d.topic != "status" {
        return None;
    }
    d.json().ok()?.get("log")?.get("text")?.as_str().map(String::from)
}

fn row(label: &str, sort: &str) -> Value {
    json!({
        "label": "sub1", "device_label": label, "layout": "2pix",
        "system_label": "A", "mux_index": 1, "sort_string": sort,
        "loc": [0.0, 0.0], "area": -1.0, "mux_string": format!("s{}", sort)
    })
}

/// A two-device I-V request on a virtual bench. `args` overrides defaults.
pub fn request(args: Value) -> Value {
    let mut base = json!({
        "enable_iv": true,
        "enable_solarsim": true,
        "cycles": 1,
        "source_delay": 1.0,
        "nplc": 1.0,
        "a_ovr_spin": 1.0,
        "iv_devices": [row("dev-a", "A1"), row("dev-b", "A2")]
    });
    if let (Some(base), Some(extra)) = (base.as_object_mut(), args.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    json!({
        "config": {
            "smu": [{"address": "smu-1", "virtual": true, "channel_mapping": ["A1", "A2"]}],
            "solarsim": {"address": "le-1", "virtual": true},
            "stage": {"experiment_positions": {"solarsim": [50.0, 50.0]}}
        },
        "args": base
    })
}

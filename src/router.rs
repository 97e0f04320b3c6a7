// src/router.rs
//
// =============================================================================
// SUNBENCH: MEASUREMENT ROUTER
// =============================================================================
//
// Job-level channel: `measurement/run`, `measurement/stop`, `daq/init`.
//
// Run and stop go through the JobSupervisor; DAQ acknowledgements go to the
// running job's inbox. Acks older than an admitted run are discarded. Bad payloads are reported and dropped; nothing here
// may end the loop.

use crate::bus::{topics, Bus, Delivery, Subscription};
use crate::config::ServerSettings;
use crate::core::{DaqInit, JobState, Request};
use crate::error::LabError;
use crate::instruments::InstrumentFactory;
use crate::logs::Severity;
use crate::publisher::Outbox;
use crate::sequencer::{self, DaqInbox, RunContext};
use crate::supervisor::JobSupervisor;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct MeasurementRouter {
    outbox: Outbox,
    supervisor: JobSupervisor,
    factory: InstrumentFactory,
    daq: DaqInbox,
    settings: Arc<ServerSettings>,
}

impl MeasurementRouter {
    pub fn new(outbox: Outbox, factory: InstrumentFactory, settings: Arc<ServerSettings>) -> Self {
        Self {
            supervisor: JobSupervisor::new(outbox.clone()),
            outbox,
            factory,
            daq: DaqInbox::new(),
            settings,
        }
    }

    pub fn supervisor(&self) -> &JobSupervisor {
        &self.supervisor
    }

    /// Subscribes to the job and DAQ channels and starts routing.
    pub async fn spawn(self, bus: &dyn Bus) -> anyhow::Result<JoinHandle<()>> {
        let measurement = bus.subscribe("measurement/#").await?;
        let daq = bus.subscribe("daq/#").await?;
        Ok(tokio::spawn(self.route(measurement, daq)))
    }

    async fn route(self, mut measurement: Subscription, mut daq: Subscription) {
        loop {
            // Job requests before acks, so an ack never lands ahead of its run
            let delivery = tokio::select! {
                biased;
                Some(d) = measurement.recv() => d,
                Some(d) = daq.recv() => d,
                else => break,
            };
            if let Err(e) = self.handle(&delivery).await {
                log::warn!("{}", e);
                self.outbox.log(
                    Severity::Warning,
                    format!("Invalid message payload on topic: {}!", delivery.topic),
                );
            }
        }
        log::debug!("Measurement router finished");
    }

    pub async fn handle(&self, delivery: &Delivery) -> Result<(), LabError> {
        let malformed = |e: serde_json::Error| LabError::MalformedMessage {
            topic: delivery.topic.clone(),
            reason: e.to_string(),
        };
        match delivery.topic.as_str() {
            topics::RUN => {
                let request: Request =
                    serde_json::from_slice(&delivery.payload).map_err(malformed)?;
                if !(request.args.enable_iv || request.args.enable_eqe) {
                    log::debug!("Run request with no experiment enabled, ignored");
                    return Ok(());
                }
                if self.supervisor.state() == JobState::Idle {
                    self.daq.drain();
                }
                let ctx = RunContext {
                    request: Arc::new(request),
                    outbox: self.outbox.clone(),
                    factory: self.factory.clone(),
                    daq: self.daq.clone(),
                    settings: self.settings.clone(),
                };
                // A refusal is already reported on the bus
                let _ = self
                    .supervisor
                    .start(move |abort| sequencer::run(ctx, abort));
            }
            topics::STOP => self.supervisor.stop().await,
            topics::DAQ_INIT => {
                let init: DaqInit = serde_json::from_slice(&delivery.payload).map_err(malformed)?;
                self.daq.post(init);
            }
            // Our own status/log traffic, daq/start, daq/stop
            _ => {}
        }
        Ok(())
    }
}

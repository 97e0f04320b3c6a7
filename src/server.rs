// src/server.rs
//
// =============================================================================
// SUNBENCH: SERVER WIRING
// =============================================================================
//
// Builds one Outbox, one InstrumentFactory and both routers on a bus, and
// announces the bench as Ready.

use crate::bus::Bus;
use crate::config::ServerSettings;
use crate::core::{JobState, Status};
use crate::instruments::InstrumentFactory;
use crate::publisher::Outbox;
use crate::router::MeasurementRouter;
use crate::supervisor::JobSupervisor;
use crate::utility::UtilityHandler;
use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct Server {
    outbox: Outbox,
    supervisor: JobSupervisor,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub async fn start(
        bus: Arc<dyn Bus>,
        factory: InstrumentFactory,
        settings: ServerSettings,
    ) -> Result<Self> {
        let settings = Arc::new(settings);
        let (outbox, sender) = Outbox::spawn(bus.clone());

        let router = MeasurementRouter::new(outbox.clone(), factory.clone(), settings.clone());
        let supervisor = router.supervisor().clone();
        let mut tasks = vec![sender, router.spawn(bus.as_ref()).await?];
        tasks.extend(
            UtilityHandler::new(outbox.clone(), factory, settings)
                .spawn(bus.as_ref())
                .await?,
        );

        outbox.status(Status::Ready);
        outbox.flush().await;
        log::info!("Measurement server ready");
        Ok(Self {
            outbox,
            supervisor,
            tasks,
        })
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn supervisor(&self) -> &JobSupervisor {
        &self.supervisor
    }

    /// Stops any running job, drains the outbox and ends the loops.
    pub async fn shutdown(self) {
        if self.supervisor.state() == JobState::Busy {
            self.supervisor.stop().await;
        }
        self.outbox.flush().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

// src/utility.rs
//
// =============================================================================
// SUNBENCH: UTILITY COMMAND HANDLER
// =============================================================================
//
// Single-shot commands on `cmd/#`, handled by three loops:
//
// 1. CLASSIFIER: filters bus messages into typed commands. O(1) per message.
// 2. MANAGER:    runs emergency stops itself, admits everything else into a
//                one-task slot or rejects it as busy.
// 3. WORKER:     the only loop doing blocking instrument I/O.

use crate::bus::{topics, Bus, Delivery};
use crate::config::ServerSettings;
use crate::error::{LabError, LabResult};
use crate::instruments::{motion, InstrumentFactory, InstrumentKind, MotionController, SmuLink};
use crate::logs::Severity;
use crate::publisher::Outbox;
use crate::resources::Priority;
use crate::rtd;
use crate::supervisor::{TaskPermit, TaskSlot};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ============================================================================
// 1. COMMAND SCHEMA
// ============================================================================

const KNOWN_COMMANDS: &[&str] = &[
    "estop",
    "home",
    "goto",
    "for_pcb",
    "read_stage",
    "mono_zero",
    "spec",
    "round_robin",
    "check_health",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum UtilityCommand {
    Estop {
        pcb: String,
        #[serde(default)]
        pcb_virt: bool,
    },
    Home(StageTask),
    Goto(GotoTask),
    ForPcb {
        pcb: String,
        #[serde(default)]
        pcb_virt: bool,
        pcb_cmd: String,
    },
    ReadStage(StageTask),
    MonoZero {
        mono_address: String,
        #[serde(default)]
        mono_virt: bool,
    },
    Spec(SpectrumTask),
    RoundRobin(RoundRobinTask),
    CheckHealth(HealthTask),
}

impl UtilityCommand {
    pub fn name(&self) -> &'static str {
        match self {
            UtilityCommand::Estop { .. } => "estop",
            UtilityCommand::Home(_) => "home",
            UtilityCommand::Goto(_) => "goto",
            UtilityCommand::ForPcb { .. } => "for_pcb",
            UtilityCommand::ReadStage(_) => "read_stage",
            UtilityCommand::MonoZero { .. } => "mono_zero",
            UtilityCommand::Spec(_) => "spec",
            UtilityCommand::RoundRobin(_) => "round_robin",
            UtilityCommand::CheckHealth(_) => "check_health",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageTask {
    pub pcb: String,
    #[serde(default)]
    pub stage_uri: String,
    #[serde(default)]
    pub stage_virt: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GotoTask {
    pub pcb: String,
    #[serde(default)]
    pub stage_uri: String,
    #[serde(default)]
    pub stage_virt: bool,
    pub pos: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpectrumTask {
    pub le_address: String,
    #[serde(default)]
    pub le_virt: bool,
    pub le_recipe: String,
    #[serde(default = "full_intensity")]
    pub le_recipe_int: f64,
}

fn full_intensity() -> f64 {
    100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Reserved; selects and deselects without measuring.
    Current,
    Rtd,
    Connectivity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoundRobinTask {
    pub pcb: String,
    #[serde(default)]
    pub pcb_virt: bool,
    #[serde(rename = "type")]
    pub kind: ProbeKind,
    pub slots: Vec<String>,
    pub pads: Vec<String>,
    pub mux_strings: Vec<String>,
    pub smu_address: String,
    #[serde(default)]
    pub smu_virt: bool,
    #[serde(default = "default_terminator")]
    pub smu_le: String,
    #[serde(default = "default_baud")]
    pub smu_baud: u32,
}

fn default_terminator() -> String {
    "\n".into()
}

fn default_baud() -> u32 {
    57600
}

/// Every address present gets probed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HealthTask {
    pub pcb: Option<String>,
    pub pcb_virt: bool,
    pub psu: Option<String>,
    pub psu_virt: bool,
    pub smu_address: Option<String>,
    pub smu_virt: bool,
    pub lia_address: Option<String>,
    pub lia_virt: bool,
    pub mono_address: Option<String>,
    pub mono_virt: bool,
    pub le_address: Option<String>,
    pub le_virt: bool,
    pub le_recipe: String,
}

/// Outcome of classifying one bus message.
#[derive(Debug)]
pub enum Filtered {
    Command(UtilityCommand),
    /// Not a command message, or a known command with a bad shape.
    Malformed(String),
    /// A well-formed message with a `cmd` nobody handles.
    Unknown(String),
}

pub fn filter_cmd(delivery: &Delivery) -> Filtered {
    let value: Value = match delivery.json() {
        Ok(v) => v,
        Err(e) => return Filtered::Malformed(e.to_string()),
    };
    let Some(cmd) = value.get("cmd").and_then(Value::as_str) else {
        return Filtered::Malformed("no 'cmd' field".into());
    };
    if !KNOWN_COMMANDS.contains(&cmd) {
        return Filtered::Unknown(cmd.to_string());
    }
    match serde_json::from_value(value) {
        Ok(command) => Filtered::Command(command),
        Err(e) => Filtered::Malformed(e.to_string()),
    }
}

// ============================================================================
// 2. THE LOOPS
// ============================================================================

#[derive(Clone)]
pub struct UtilityHandler {
    outbox: Outbox,
    factory: InstrumentFactory,
    settings: Arc<ServerSettings>,
}

impl UtilityHandler {
    pub fn new(outbox: Outbox, factory: InstrumentFactory, settings: Arc<ServerSettings>) -> Self {
        Self {
            outbox,
            factory,
            settings,
        }
    }

    /// Subscribes to `cmd/#` and starts the classifier, manager and worker.
    pub async fn spawn(self, bus: &dyn Bus) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let mut sub = bus.subscribe(topics::CMD).await?;
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<UtilityCommand>();
        let (slot, mut task_rx) = TaskSlot::<UtilityCommand>::new();

        let classifier = {
            let outbox = self.outbox.clone();
            tokio::spawn(async move {
                while let Some(delivery) = sub.recv().await {
                    match filter_cmd(&delivery) {
                        Filtered::Command(cmd) => {
                            if cmd_tx.send(cmd).is_err() {
                                break;
                            }
                        }
                        Filtered::Malformed(reason) => outbox.utility_log(
                            Severity::Warning,
                            format!("Malformed command on {}: {}", delivery.topic, reason),
                        ),
                        Filtered::Unknown(cmd) => {
                            log::debug!("Command message rejected: {}", cmd)
                        }
                    }
                }
                log::debug!("Utility classifier finished");
            })
        };

        let manager = {
            let handler = self.clone();
            tokio::spawn(async move {
                while let Some(cmd) = cmd_rx.recv().await {
                    log::debug!("New command message: {}", cmd.name());
                    handler.manage(cmd, &slot).await;
                }
                log::debug!("Utility manager finished");
            })
        };

        let worker = {
            let handler = self.clone();
            tokio::spawn(async move {
                while let Some((task, permit)) = task_rx.recv().await {
                    handler.work(task, permit).await;
                }
                log::debug!("Utility worker finished");
            })
        };

        Ok(vec![classifier, manager, worker])
    }

    async fn manage(&self, cmd: UtilityCommand, slot: &TaskSlot<UtilityCommand>) {
        if let UtilityCommand::Estop { pcb, pcb_virt } = &cmd {
            self.estop(pcb, *pcb_virt).await;
            return;
        }
        if let Err(rejected) = slot.try_admit(cmd) {
            self.outbox.utility_log(
                Severity::Warning,
                format!(
                    "Backend busy (task queue size = {}). Command rejected: {}",
                    slot.unfinished(),
                    rejected.name()
                ),
            );
        }
    }

    /// Halts the stage. Runs even while the worker holds the board.
    pub async fn estop(&self, pcb: &str, virt: bool) {
        let res = async {
            let mut board = self
                .factory
                .controller(pcb, virt, self.settings.estop_timeout(), Priority::Preempt)
                .await?;
            board.query("b").await
        }
        .await;
        match res {
            Ok(_) => self.outbox.utility_log(
                Severity::Info,
                "Emergency stop command issued. Re-Homing required before any further movements.",
            ),
            Err(e) => {
                log::error!("Unable to emergency stop: {}", e);
                self.outbox
                    .utility_log(Severity::Warning, "Unable to emergency stop.");
            }
        }
    }

    async fn work(&self, task: UtilityCommand, permit: TaskPermit) {
        log::debug!("New task: {}", task.name());
        if let Err(e) = self.execute(task).await {
            log::error!("Utility task failed: {}", e);
            self.outbox.utility_log(Severity::Warning, e.to_string());
        }
        drop(permit);
    }

    // ========================================================================
    // 3. TASKS
    // ========================================================================

    pub async fn execute(&self, task: UtilityCommand) -> LabResult<()> {
        match task {
            UtilityCommand::Estop { pcb, pcb_virt } => {
                self.estop(&pcb, pcb_virt).await;
                Ok(())
            }
            UtilityCommand::Home(t) => {
                self.move_stage(&t.pcb, &t.stage_uri, t.stage_virt, None)
                    .await
            }
            UtilityCommand::Goto(t) => {
                self.move_stage(&t.pcb, &t.stage_uri, t.stage_virt, Some(&t.pos))
                    .await
            }
            UtilityCommand::ReadStage(t) => self.read_stage(&t).await,
            UtilityCommand::ForPcb {
                pcb,
                pcb_virt,
                pcb_cmd,
            } => self.for_pcb(&pcb, pcb_virt, &pcb_cmd).await,
            UtilityCommand::MonoZero {
                mono_address,
                mono_virt,
            } => self.mono_zero(&mono_address, mono_virt).await,
            UtilityCommand::Spec(t) => self.spectrum(&t).await,
            UtilityCommand::RoundRobin(t) => self.round_robin(&t).await,
            UtilityCommand::CheckHealth(t) => {
                self.check_health(&t).await;
                Ok(())
            }
        }
    }

    fn timeout(&self) -> Duration {
        self.settings.utility_timeout()
    }

    fn send_pos(&self, pos: &[f64]) {
        self.outbox
            .append(topics::RESPONSE, &json!({ "pos": pos }), false);
    }

    /// Homes (`target` None) or moves the stage, then reports its position.
    async fn move_stage(
        &self,
        pcb: &str,
        uri: &str,
        virt: bool,
        target: Option<&[f64]>,
    ) -> LabResult<()> {
        let mut board = self
            .factory
            .controller(pcb, virt, self.timeout(), Priority::Normal)
            .await?;
        let mut stage = MotionController::new(&mut *board, motion::steps_per_mm(uri));
        stage.connect().await?;
        match target {
            Some(pos) => stage.goto(pos).await?,
            None => {
                stage.home().await?;
                self.outbox
                    .utility_log(Severity::Info, "Homing procedure complete.");
            }
        }
        let pos = stage.read_pos().await?;
        self.send_pos(&pos);
        Ok(())
    }

    async fn read_stage(&self, t: &StageTask) -> LabResult<()> {
        let mut board = self
            .factory
            .controller(&t.pcb, t.stage_virt, self.timeout(), Priority::Normal)
            .await?;
        let mut stage = MotionController::new(&mut *board, motion::steps_per_mm(&t.stage_uri));
        stage.connect().await?;
        let pos = stage.read_pos().await?;
        self.send_pos(&pos);
        Ok(())
    }

    async fn for_pcb(&self, pcb: &str, virt: bool, cmd: &str) -> LabResult<()> {
        let mut board = self
            .factory
            .controller(pcb, virt, self.timeout(), Priority::Normal)
            .await?;
        // Deselect everything first so two pixels are never connected
        if is_select(cmd) {
            board.query("s").await?;
        }
        let result = board.query(cmd).await?;
        if result.is_empty() {
            self.outbox
                .utility_log(Severity::Debug, format!("Command acknowledged: {}", cmd));
        } else {
            self.outbox.utility_log(
                Severity::Warning,
                format!("Command {} not acknowledged with {}", cmd, result),
            );
        }
        Ok(())
    }

    async fn mono_zero(&self, address: &str, virt: bool) -> LabResult<()> {
        let mut mono = self
            .factory
            .monochromator(address, virt, self.timeout())
            .await?;
        for cmd in ["0 GOTO", "1 FILTER"] {
            let reply = mono.command(cmd).await?;
            let text = if virt {
                format!("{} virtually worked!", cmd)
            } else {
                reply
            };
            self.outbox.utility_log(Severity::Info, text);
        }
        Ok(())
    }

    async fn spectrum(&self, t: &SpectrumTask) -> LabResult<()> {
        let mut light = self
            .factory
            .light_engine(&t.le_address, &t.le_recipe, t.le_virt, self.timeout())
            .await?;
        light.set_intensity(t.le_recipe_int).await?;
        let data = light.spectrum().await?;
        let timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        self.outbox.append(
            topics::SPECTRUM,
            &json!({ "data": data, "timestamp": timestamp }),
            true,
        );
        Ok(())
    }

    async fn round_robin(&self, t: &RoundRobinTask) -> LabResult<()> {
        if t.slots.is_empty() {
            return Ok(());
        }
        if t.pads.len() != t.slots.len() || t.mux_strings.len() != t.slots.len() {
            return Err(LabError::MalformedMessage {
                topic: "cmd/round_robin".into(),
                reason: "slots, pads and mux_strings differ in length".into(),
            });
        }

        let mut board = self
            .factory
            .controller(&t.pcb, t.pcb_virt, self.timeout(), Priority::Normal)
            .await?;
        board.query("iv").await?;
        board.query("s").await?;

        let link = SmuLink {
            terminator: t.smu_le.clone(),
            baud: t.smu_baud,
            ..SmuLink::new(&t.smu_address)
        };
        let mut smu = self.factory.smu(&link, t.smu_virt, self.timeout()).await?;

        match t.kind {
            ProbeKind::Current => {}
            ProbeKind::Rtd => smu.setup_ohms(true).await?,
            ProbeKind::Connectivity => {
                self.outbox.utility_log(
                    Severity::Info,
                    "Checking connections. Only failures will be printed.",
                );
                smu.set_contact_check(true).await?;
            }
        }

        for ((slot, pad), mux) in t.slots.iter().zip(&t.pads).zip(&t.mux_strings) {
            board.query(mux).await?;
            let probed = match t.kind {
                ProbeKind::Current => Ok(()),
                ProbeKind::Rtd => smu.measure_resistance().await.map(|ohms| {
                    if rtd::plausible_pt1000(ohms) {
                        self.outbox.utility_log(
                            Severity::Info,
                            format!(
                                "{} -- {} Could be a PT1000 RTD at {:.1} °C",
                                slot,
                                pad,
                                rtd::pt1000(ohms)
                            ),
                        );
                    }
                }),
                ProbeKind::Connectivity => smu.contact_check().await.map(|ok| {
                    if !ok {
                        self.outbox.utility_log(
                            Severity::Info,
                            format!("{} -- {} appears disconnected.", slot, pad),
                        );
                    }
                }),
            };
            // Deselect before anything else, including a failed probe
            board.query(&format!("s{}0", slot)).await?;
            probed?;
        }

        match t.kind {
            ProbeKind::Current => {}
            ProbeKind::Rtd => {
                self.outbox
                    .utility_log(Severity::Info, "Temperature measurement complete.");
                smu.setup_ohms(false).await?;
            }
            ProbeKind::Connectivity => {
                smu.set_contact_check(false).await?;
                self.outbox
                    .utility_log(Severity::Info, "Contact check complete.");
            }
        }
        board.query("s").await?;
        Ok(())
    }

    /// Probes every instrument in the task. One failure never stops the rest.
    async fn check_health(&self, t: &HealthTask) {
        if let Some(pcb) = &t.pcb {
            self.outbox
                .utility_log(Severity::Info, format!("Checking controller@{}...", pcb));
            let res = async {
                let mut board = self
                    .factory
                    .controller(pcb, t.pcb_virt, self.timeout(), Priority::Normal)
                    .await?;
                self.outbox
                    .utility_log(Severity::Info, "Controller connection initiated");
                board.identity().await
            }
            .await;
            match res {
                Ok(id) => {
                    self.outbox.utility_log(
                        Severity::Info,
                        format!("Controller firmware version: {}", id.firmware),
                    );
                    self.outbox
                        .utility_log(Severity::Info, format!("Controller axes: {:?}", id.axes));
                    self.outbox.utility_log(
                        Severity::Info,
                        format!("Controller muxes: {:?}", id.muxes),
                    );
                }
                Err(e) => self.health_fault("Could not talk to control box", e),
            }
        }

        let probes = [
            (InstrumentKind::Psu, "Power supply", &t.psu, t.psu_virt, "*IDN?"),
            (InstrumentKind::Smu, "Sourcemeter", &t.smu_address, t.smu_virt, "*IDN?"),
            (InstrumentKind::LockIn, "Lock-in", &t.lia_address, t.lia_virt, "*IDN?"),
        ];
        for (kind, label, address, virt, query) in probes {
            if let Some(address) = address {
                self.probe_scpi(kind, label, address, virt, query).await;
            }
        }

        if let Some(address) = &t.mono_address {
            self.outbox.utility_log(
                Severity::Info,
                format!("Checking monochromator@{}...", address),
            );
            let res = async {
                let mut mono = self
                    .factory
                    .monochromator(address, t.mono_virt, self.timeout())
                    .await?;
                mono.command("?nm").await
            }
            .await;
            match res {
                Ok(_) if t.mono_virt => self
                    .outbox
                    .utility_log(Severity::Info, "Monochromator looks virtually great!"),
                Ok(reply) => self.outbox.utility_log(
                    Severity::Info,
                    format!("Monochromator wavelength query result: {}", reply.trim()),
                ),
                Err(e) => self.health_fault("Could not talk to monochromator", e),
            }
        }

        if let Some(address) = &t.le_address {
            self.outbox.utility_log(
                Severity::Info,
                format!("Checking light engine@{}...", address),
            );
            match self
                .factory
                .light_engine(address, &t.le_recipe, t.le_virt, self.timeout())
                .await
            {
                Ok(_light) => self
                    .outbox
                    .utility_log(Severity::Info, "Light engine connection successful"),
                Err(e) => self.outbox.utility_log(
                    Severity::Warning,
                    format!("Light engine connection check failed: {}", e),
                ),
            }
        }
    }

    async fn probe_scpi(
        &self,
        kind: InstrumentKind,
        label: &str,
        address: &str,
        virt: bool,
        query: &str,
    ) {
        self.outbox
            .utility_log(Severity::Info, format!("Checking {}@{}...", kind, address));
        let res = async {
            let mut probe = self
                .factory
                .scpi(kind, address, virt, self.timeout())
                .await?;
            probe.query(query).await
        }
        .await;
        match res {
            Ok(_) if virt => self
                .outbox
                .utility_log(Severity::Info, format!("{} looks virtually great!", label)),
            Ok(idn) => {
                self.outbox
                    .utility_log(Severity::Info, format!("{} connection initiated", label));
                self.outbox.utility_log(
                    Severity::Info,
                    format!("{} identification string: {}", label, idn.trim()),
                );
            }
            Err(e) => self.health_fault(&format!("Could not talk to {}", kind), e),
        }
    }

    fn health_fault(&self, msg: &str, e: LabError) {
        log::error!("{}: {}", msg, e);
        self.outbox.utility_log(Severity::Warning, msg);
    }
}

/// Channel-select commands: `s<slot>`, but not bare `s` or stream toggles.
fn is_select(cmd: &str) -> bool {
    cmd.starts_with('s') && !cmd.contains("stream") && cmd.len() != 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Delivery;

    fn delivery(payload: &str) -> Delivery {
        Delivery {
            topic: "cmd/anything".into(),
            payload: payload.as_bytes().to_vec(),
            retained: false,
        }
    }

    #[test]
    fn classifier_separates_malformed_from_unknown() {
        assert!(matches!(filter_cmd(&delivery("not json")), Filtered::Malformed(_)));
        assert!(matches!(filter_cmd(&delivery(r#"{"x": 1}"#)), Filtered::Malformed(_)));
        assert!(matches!(
            filter_cmd(&delivery(r#"{"cmd": "dance"}"#)),
            Filtered::Unknown(c) if c == "dance"
        ));
        // Known command, missing field
        assert!(matches!(
            filter_cmd(&delivery(r#"{"cmd": "goto", "pcb": "p"}"#)),
            Filtered::Malformed(_)
        ));
        assert!(matches!(
            filter_cmd(&delivery(r#"{"cmd": "estop", "pcb": "p", "pcb_virt": true}"#)),
            Filtered::Command(UtilityCommand::Estop { pcb_virt: true, .. })
        ));
    }

    #[test]
    fn round_robin_payload_parses() {
        let cmd = filter_cmd(&delivery(
            r#"{"cmd": "round_robin", "type": "rtd", "pcb": "p", "pcb_virt": true,
                "slots": ["A1"], "pads": ["1"], "mux_strings": ["sA1"],
                "smu_address": "virt", "smu_virt": true}"#,
        ));
        match cmd {
            Filtered::Command(UtilityCommand::RoundRobin(t)) => {
                assert_eq!(t.kind, ProbeKind::Rtd);
                assert_eq!(t.smu_baud, 57600);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn select_detection() {
        assert!(is_select("sA1"));
        assert!(!is_select("s"));
        assert!(!is_select("stream_on"));
        assert!(!is_select("h"));
    }
}

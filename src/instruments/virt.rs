// src/instruments/virt.rs
//
// =============================================================================
// SUNBENCH: VIRTUAL BENCH
// =============================================================================
//
// In-memory stand-ins for every instrument kind, sharing one `SimBench`.
//
// The bench models:
// 1. A light engine (on/off, intensity).
// 2. One photovoltaic diode per SMU channel, dead channels forced into
//    compliance.
// 3. A controller board with stage axes and a multiplexer selection.
// 4. An ordered journal of every instrument call, for tests.
// 5. One-shot injected faults, keyed by journal entry.

use super::{
    ControllerBoard, Instrument, InstrumentKind, LightEngine, Monochromator, ScpiProbe,
    SmuLink, SourceMeter,
};
use crate::core::{Sample, COMPLIANCE_BIT};
use crate::error::{LabError, LabResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

// Diode model
const PHOTOCURRENT: f64 = 0.02;
const SATURATION_CURRENT: f64 = 1e-12;
const IDEALITY: f64 = 1.5;
const THERMAL_VOLTAGE: f64 = 0.02569;

const AXIS_LENGTH_STEPS: i64 = 250_000;
const DEFAULT_RTD_OHMS: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Source {
    Voltage(f64),
    Current(f64),
}

#[derive(Default)]
struct BenchState {
    light_on: bool,
    intensity: f64,
    dead_channels: HashSet<usize>,
    selected: Option<String>,
    axes: BTreeMap<usize, i64>,
    rtd_ohms: HashMap<String, f64>,
    open_slots: HashSet<String>,
    journal: Vec<String>,
    faults: Vec<String>,
}

/// Shared state of every virtual instrument. Cheap to clone.
#[derive(Clone)]
pub struct SimBench {
    state: Arc<Mutex<BenchState>>,
}

impl Default for SimBench {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBench {
    pub fn new() -> Self {
        let state = BenchState {
            intensity: 100.0,
            axes: [(1, 0), (2, 0)].into_iter().collect(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Forces `channel` into compliance on every reading.
    pub fn kill_channel(&self, channel: usize) {
        self.lock().dead_channels.insert(channel);
    }

    pub fn set_rtd(&self, slot: &str, ohms: f64) {
        self.lock().rtd_ohms.insert(slot.to_string(), ohms);
    }

    /// Makes `slot` fail its contact check.
    pub fn open_contact(&self, slot: &str) {
        self.lock().open_slots.insert(slot.to_string());
    }

    pub fn light_is_on(&self) -> bool {
        self.lock().light_on
    }

    pub fn selected(&self) -> Option<String> {
        self.lock().selected.clone()
    }

    /// Every call recorded so far, oldest first, as `"<who>:<what>"`.
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.lock().journal.iter().filter(|e| *e == entry).count()
    }

    /// Makes the next call whose journal entry starts with `call` fail.
    pub fn fail_next(&self, call: &str) {
        self.lock().faults.push(call.to_string());
    }

    fn record(&self, entry: String) {
        self.lock().journal.push(entry);
    }

    /// Records `entry`, then consumes a matching injected fault, if any.
    fn call(&self, kind: InstrumentKind, entry: String) -> LabResult<()> {
        let mut state = self.lock();
        let hit = state.faults.iter().position(|f| entry.starts_with(f.as_str()));
        state.journal.push(entry);
        match hit {
            Some(i) => {
                let fault = state.faults.remove(i);
                Err(LabError::instrument(kind, format!("{} failed", fault)))
            }
            None => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BenchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn illumination(&self) -> f64 {
        let state = self.lock();
        if state.light_on {
            state.intensity / 100.0
        } else {
            0.0
        }
    }
}

// ============================================================================
// 1. CONTROLLER BOARD
// ============================================================================

pub struct VirtualBoard {
    address: String,
    bench: SimBench,
}

impl VirtualBoard {
    pub fn new(address: &str, bench: SimBench) -> Self {
        bench.record(format!("board:connect {}", address));
        Self {
            address: address.to_string(),
            bench,
        }
    }

    fn axis_of(cmd: &str) -> LabResult<usize> {
        cmd.get(1..2)
            .and_then(|a| a.parse().ok())
            .ok_or_else(|| LabError::instrument(InstrumentKind::StageController, format!("bad axis in '{}'", cmd)))
    }
}

impl Instrument for VirtualBoard {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::StageController
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn release(&mut self) {
        self.bench.record("board:release".into());
    }
}

#[async_trait]
impl ControllerBoard for VirtualBoard {
    async fn query(&mut self, cmd: &str) -> LabResult<String> {
        self.bench.record(format!("board:{}", cmd));
        let mut state = self.bench.lock();
        let reply = match cmd {
            "v" => "virtual-board 1.0".to_string(),
            "e" => state
                .axes
                .keys()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(" "),
            "c" => "A B".to_string(),
            "s" => {
                state.selected = None;
                String::new()
            }
            "h" => {
                state.axes.values_mut().for_each(|p| *p = 0);
                String::new()
            }
            // Emergency stop, IV/EQE routing and streaming toggles just ack
            "b" | "iv" | "eqe" => String::new(),
            c if c.starts_with("stream") => String::new(),
            c if c.starts_with('s') => {
                let slot = &c[1..];
                match &state.selected {
                    Some(sel) if slot == format!("{}0", sel) => state.selected = None,
                    _ => state.selected = Some(slot.to_string()),
                }
                String::new()
            }
            c if c.starts_with('g') => {
                let axis = Self::axis_of(c)?;
                let steps: i64 = c[2..].parse().map_err(|_| {
                    LabError::instrument(self.kind(), format!("bad goto '{}'", c))
                })?;
                state.axes.insert(axis, steps.clamp(0, AXIS_LENGTH_STEPS));
                String::new()
            }
            c if c.starts_with('r') => {
                let axis = Self::axis_of(c)?;
                state.axes.get(&axis).copied().unwrap_or(0).to_string()
            }
            c if c.starts_with('l') => AXIS_LENGTH_STEPS.to_string(),
            c => format!("unknown command '{}'", c),
        };
        Ok(reply)
    }
}

// ============================================================================
// 2. SOURCEMETER
// ============================================================================

pub struct VirtualSmu {
    address: String,
    bench: SimBench,
    started: Instant,
    integration: Duration,
    plf: f64,
    compliance: f64,
    output: bool,
    ohms: bool,
    sources: BTreeMap<usize, Source>,
}

impl VirtualSmu {
    pub fn new(link: &SmuLink, bench: SimBench) -> Self {
        bench.record(format!("smu:connect {}", link.address));
        Self {
            address: link.address.clone(),
            bench,
            started: Instant::now(),
            integration: Duration::from_secs_f64(1.0 / link.plf),
            plf: link.plf,
            compliance: 0.1,
            output: false,
            ohms: false,
            sources: BTreeMap::new(),
        }
    }

    fn diode_current(voltage: f64, illumination: f64) -> f64 {
        SATURATION_CURRENT * ((voltage / (IDEALITY * THERMAL_VOLTAGE)).exp() - 1.0)
            - PHOTOCURRENT * illumination
    }

    fn diode_voltage(current: f64, illumination: f64) -> Option<f64> {
        let arg = (current + PHOTOCURRENT * illumination) / SATURATION_CURRENT + 1.0;
        (arg > 0.0).then(|| IDEALITY * THERMAL_VOLTAGE * arg.ln())
    }

    fn sample(&self, channel: usize, illumination: f64, dead: bool) -> Sample {
        let time = self.started.elapsed().as_secs_f64();
        let source = self
            .sources
            .get(&channel)
            .copied()
            .unwrap_or(Source::Voltage(0.0));
        let (voltage, mut current) = match source {
            Source::Voltage(v) => (v, Self::diode_current(v, illumination)),
            Source::Current(i) => match Self::diode_voltage(i, illumination) {
                Some(v) => (v, i),
                None => (0.0, self.compliance),
            },
        };
        let mut status = 0;
        if dead || current.abs() >= self.compliance {
            // signum(0.0) is 1.0, so a dead channel reads +compliance
            current = current.signum() * self.compliance;
            status |= COMPLIANCE_BIT;
        }
        Sample {
            voltage,
            current,
            time,
            status,
        }
    }
}

impl Instrument for VirtualSmu {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Smu
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn release(&mut self) {
        self.bench.record("smu:release".into());
    }
}

#[async_trait]
impl SourceMeter for VirtualSmu {
    async fn identify(&mut self) -> LabResult<String> {
        Ok("Virtual SMU,SIM,0,1.0".into())
    }

    async fn set_nplc(&mut self, nplc: f64) -> LabResult<()> {
        self.integration = Duration::from_secs_f64(nplc.max(0.01) / self.plf);
        Ok(())
    }

    async fn set_compliance(&mut self, amps: f64) -> LabResult<()> {
        self.compliance = amps.abs();
        Ok(())
    }

    async fn source_voltage(&mut self, setpoints: &BTreeMap<usize, f64>) -> LabResult<()> {
        for (ch, v) in setpoints {
            self.sources.insert(*ch, Source::Voltage(*v));
        }
        Ok(())
    }

    async fn source_current(&mut self, setpoints: &BTreeMap<usize, f64>) -> LabResult<()> {
        for (ch, i) in setpoints {
            self.sources.insert(*ch, Source::Current(*i));
        }
        Ok(())
    }

    async fn measure(&mut self, channels: &[usize]) -> LabResult<BTreeMap<usize, Sample>> {
        if !self.output {
            return Err(LabError::instrument(self.kind(), "output is off"));
        }
        tokio::time::sleep(self.integration).await;
        let illumination = self.bench.illumination();
        let dead = self.bench.lock().dead_channels.clone();
        Ok(channels
            .iter()
            .map(|ch| (*ch, self.sample(*ch, illumination, dead.contains(ch))))
            .collect())
    }

    async fn enable_output(&mut self, on: bool) -> LabResult<()> {
        self.bench.call(
            self.kind(),
            format!("smu:output {}", if on { "on" } else { "off" }),
        )?;
        self.output = on;
        Ok(())
    }

    async fn setup_ohms(&mut self, on: bool) -> LabResult<()> {
        self.ohms = on;
        Ok(())
    }

    async fn measure_resistance(&mut self) -> LabResult<f64> {
        if !self.ohms {
            return Err(LabError::instrument(self.kind(), "not in resistance mode"));
        }
        tokio::time::sleep(self.integration).await;
        let state = self.bench.lock();
        let ohms = state
            .selected
            .as_ref()
            .and_then(|slot| state.rtd_ohms.get(slot).copied())
            .unwrap_or(DEFAULT_RTD_OHMS);
        Ok(ohms)
    }

    async fn set_contact_check(&mut self, _on: bool) -> LabResult<()> {
        Ok(())
    }

    async fn contact_check(&mut self) -> LabResult<bool> {
        let state = self.bench.lock();
        Ok(match &state.selected {
            Some(slot) => !state.open_slots.contains(slot),
            None => false,
        })
    }
}

// ============================================================================
// 3. LIGHT ENGINE
// ============================================================================

pub struct VirtualLight {
    address: String,
    bench: SimBench,
}

impl VirtualLight {
    pub fn new(address: &str, recipe: &str, bench: SimBench) -> Self {
        bench.record(format!("light:connect {} {}", address, recipe));
        Self {
            address: address.to_string(),
            bench,
        }
    }
}

impl Instrument for VirtualLight {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::LightEngine
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn release(&mut self) {
        self.bench.record("light:release".into());
    }
}

#[async_trait]
impl LightEngine for VirtualLight {
    async fn set_intensity(&mut self, percent: f64) -> LabResult<()> {
        self.bench
            .call(self.kind(), format!("light:intensity {}", percent))?;
        self.bench.lock().intensity = percent;
        Ok(())
    }

    async fn on(&mut self) -> LabResult<()> {
        self.bench.call(self.kind(), "light:on".into())?;
        self.bench.lock().light_on = true;
        Ok(())
    }

    async fn off(&mut self) -> LabResult<()> {
        self.bench.call(self.kind(), "light:off".into())?;
        self.bench.lock().light_on = false;
        Ok(())
    }

    async fn spectrum(&mut self) -> LabResult<Vec<[f64; 2]>> {
        self.bench.call(self.kind(), "light:spectrum".into())?;
        let scale = self.bench.lock().intensity / 100.0;
        // Smooth bump peaking near 650 nm
        Ok((350..=1100)
            .step_by(10)
            .map(|nm| {
                let x = (nm as f64 - 650.0) / 250.0;
                [nm as f64, scale * 1.6 * (-x * x).exp()]
            })
            .collect())
    }
}

// ============================================================================
// 4. MONOCHROMATOR & SCPI PROBES
// ============================================================================

pub struct VirtualMono {
    address: String,
    bench: SimBench,
    wavelength: f64,
}

impl VirtualMono {
    pub fn new(address: &str, bench: SimBench) -> Self {
        Self {
            address: address.to_string(),
            bench,
            wavelength: 0.0,
        }
    }
}

impl Instrument for VirtualMono {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Monochromator
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn release(&mut self) {
        self.bench.record("mono:release".into());
    }
}

#[async_trait]
impl Monochromator for VirtualMono {
    async fn command(&mut self, cmd: &str) -> LabResult<String> {
        self.bench.record(format!("mono:{}", cmd));
        if cmd.eq_ignore_ascii_case("?nm") {
            return Ok(format!("{:.1} nm", self.wavelength));
        }
        if let Some(nm) = cmd.strip_suffix(" GOTO").and_then(|n| n.trim().parse().ok()) {
            self.wavelength = nm;
        }
        Ok(String::new())
    }
}

pub struct VirtualProbe {
    kind: InstrumentKind,
    address: String,
    bench: SimBench,
}

impl VirtualProbe {
    pub fn new(kind: InstrumentKind, address: &str, bench: SimBench) -> Self {
        Self {
            kind,
            address: address.to_string(),
            bench,
        }
    }
}

impl Instrument for VirtualProbe {
    fn kind(&self) -> InstrumentKind {
        self.kind
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn release(&mut self) {
        self.bench.record(format!("{}:release", self.kind));
    }
}

#[async_trait]
impl ScpiProbe for VirtualProbe {
    async fn query(&mut self, cmd: &str) -> LabResult<String> {
        self.bench.record(format!("{}:{}", self.kind, cmd));
        match cmd {
            "*IDN?" => Ok(format!("Virtual {},SIM,0,1.0", self.kind)),
            _ => Ok(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn lit_diode_has_a_positive_open_circuit_voltage() {
        let bench = SimBench::new();
        let mut smu = VirtualSmu::new(&SmuLink::new("virt"), bench.clone());
        bench.lock().light_on = true;
        smu.enable_output(true).await.unwrap();
        smu.source_current(&[(0, 0.0)].into_iter().collect())
            .await
            .unwrap();
        let voc = smu.measure(&[0]).await.unwrap()[&0].voltage;
        assert!(voc > 0.8 && voc < 1.0, "voc = {}", voc);

        smu.source_voltage(&[(0, 0.0)].into_iter().collect())
            .await
            .unwrap();
        let jsc = smu.measure(&[0]).await.unwrap()[&0];
        assert!((jsc.current + PHOTOCURRENT).abs() < 1e-9);
        assert!(!jsc.in_compliance());
    }

    #[tokio::test(start_paused = true)]
    async fn dead_channels_sit_in_compliance() {
        let bench = SimBench::new();
        bench.kill_channel(1);
        let mut smu = VirtualSmu::new(&SmuLink::new("virt"), bench);
        smu.enable_output(true).await.unwrap();
        let samples = smu.measure(&[0, 1]).await.unwrap();
        assert!(!samples[&0].in_compliance());
        assert!(samples[&1].in_compliance());
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let bench = SimBench::new();
        let mut light = VirtualLight::new("le", "AM1.5", bench.clone());
        bench.fail_next("light:on");
        assert!(matches!(
            light.on().await,
            Err(LabError::Instrument { kind: InstrumentKind::LightEngine, .. })
        ));
        assert!(!bench.light_is_on());
        light.on().await.unwrap();
        assert!(bench.light_is_on());
        assert_eq!(bench.count("light:on"), 2);
    }

    #[tokio::test]
    async fn board_tracks_mux_selection() {
        let bench = SimBench::new();
        let mut board = VirtualBoard::new("pcb", bench.clone());
        board.query("sA1").await.unwrap();
        assert_eq!(bench.selected().as_deref(), Some("A1"));
        board.query("sA10").await.unwrap();
        assert_eq!(bench.selected(), None);
        board.query("g1500").await.unwrap();
        assert_eq!(board.query("r1").await.unwrap(), "500");
    }
}

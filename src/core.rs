// src/core.rs
//
// =============================================================================
// SUNBENCH: CORE SCHEMA
// =============================================================================
//
// The data contracts between bus clients and the measurement engine.
//
// Design Principles:
// 1. A Request is read-only for the lifetime of its job (shared as Arc).
// 2. Every field a client may omit has a serde default, so partial requests
//    from older front-ends still deserialize.
// 3. The PixelQueue is the only piece of job state that shrinks mid-run.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

// ============================================================================
// 1. THE REQUEST (Client Blueprint)
// ============================================================================

/// Immutable job description submitted on `measurement/run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub config: BenchConfig,
    pub args: RunArgs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub smu: Vec<SmuConfig>,
    pub solarsim: LightConfig,
    pub stage: StageConfig,
    pub ccd: CcdConfig,
}

impl BenchConfig {
    /// The bench drives a single sourcemeter; extra entries are ignored.
    pub fn primary_smu(&self) -> Option<&SmuConfig> {
        self.smu.first()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmuConfig {
    pub address: String,
    pub port: u16,
    pub terminator: String,
    /// Power-line frequency, used to turn NPLC into seconds.
    pub plf: f64,
    pub two_wire: bool,
    /// Absolute current ceiling in A.
    pub current_limit: f64,
    pub smart_compliance: bool,
    /// Sort strings in SMU channel order, e.g. ["A1", "A2", ...].
    pub channel_mapping: Vec<String>,
    #[serde(rename = "virtual")]
    pub virt: bool,
}

impl Default for SmuConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 0,
            terminator: "\n".into(),
            plf: 50.0,
            two_wire: false,
            current_limit: 0.1,
            smart_compliance: false,
            channel_mapping: Vec::new(),
            virt: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LightConfig {
    pub address: String,
    #[serde(rename = "virtual")]
    pub virt: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Stage centre for each experiment ("solarsim", "eqe") in mm.
    pub experiment_positions: HashMap<String, Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CcdConfig {
    /// Voltage ceiling applied during max-power tracking.
    pub max_voltage: f64,
}

impl Default for CcdConfig {
    fn default() -> Self {
        Self { max_voltage: 3.0 }
    }
}

/// User-chosen run parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunArgs {
    pub enable_eqe: bool,
    pub enable_iv: bool,
    pub enable_solarsim: bool,
    pub light_recipe: String,
    pub light_recipe_int: f64,
    /// SMU settling delay in ms.
    pub source_delay: f64,
    /// 0 = repeat until stopped.
    pub cycles: u32,
    pub i_dwell: f64,
    pub i_dwell_value: f64,
    pub sweep_check: bool,
    /// 0: dark then light, 1: light then dark, 2: dark only, 3: light only.
    pub lit_sweep: u8,
    pub sweep_start: f64,
    pub sweep_end: f64,
    pub iv_steps: u32,
    pub return_switch: bool,
    pub mppt_dwell: f64,
    pub mppt_params: String,
    pub v_dwell: f64,
    pub v_dwell_value: f64,
    pub nplc: f64,
    /// Current density limit in mA/cm^2.
    pub jmax: f64,
    /// Current limit in A.
    pub imax: f64,
    /// Operator-supplied area (cm^2) for layouts with custom areas.
    pub a_ovr_spin: f64,
    pub inverted_conn: bool,
    /// One row per enabled solar-simulator device.
    pub iv_devices: Option<Vec<LayoutRow>>,
    /// One row per enabled EQE device.
    pub eqe_devices: Option<Vec<LayoutRow>>,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            enable_eqe: false,
            enable_iv: false,
            enable_solarsim: false,
            light_recipe: "AM1.5_1.0SUN".into(),
            light_recipe_int: 100.0,
            source_delay: 5.0,
            cycles: 1,
            i_dwell: 0.0,
            i_dwell_value: 0.0,
            sweep_check: false,
            lit_sweep: 0,
            sweep_start: -0.2,
            sweep_end: 1.2,
            iv_steps: 101,
            return_switch: false,
            mppt_dwell: 0.0,
            mppt_params: "basic://10:100".into(),
            v_dwell: 0.0,
            v_dwell_value: 0.0,
            nplc: 1.0,
            jmax: 30.0,
            imax: 0.1,
            a_ovr_spin: 0.1,
            inverted_conn: false,
            iv_devices: None,
            eqe_devices: None,
        }
    }
}

/// One row of the device layout table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutRow {
    pub label: String,
    pub device_label: String,
    pub layout: String,
    pub system_label: String,
    pub mux_index: u32,
    pub sort_string: String,
    /// Offset from the experiment centre in mm.
    pub loc: Vec<f64>,
    /// Area in cm^2; -1 means "use the operator override".
    pub area: f64,
    pub mux_string: String,
}

// ============================================================================
// 2. DEVICES UNDER TEST
// ============================================================================

/// One physical device, as published alongside its data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub label: String,
    pub device_label: String,
    pub layout: String,
    pub sub_name: String,
    pub pixel: u32,
    pub sort_string: String,
    pub pos: Vec<f64>,
    pub area: f64,
    pub mux_string: String,
}

/// SMU channel -> device. Iteration follows layout-row order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PixelQueue {
    devices: Vec<(usize, DeviceRecord)>,
}

impl PixelQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `device`, or replaces the one already on `channel` in place.
    pub fn insert(&mut self, channel: usize, device: DeviceRecord) {
        match self.devices.iter_mut().find(|(ch, _)| *ch == channel) {
            Some(slot) => slot.1 = device,
            None => self.devices.push((channel, device)),
        }
    }

    pub fn remove(&mut self, channel: usize) -> Option<DeviceRecord> {
        let idx = self.devices.iter().position(|(ch, _)| *ch == channel)?;
        Some(self.devices.remove(idx).1)
    }

    pub fn get(&self, channel: usize) -> Option<&DeviceRecord> {
        self.devices
            .iter()
            .find(|(ch, _)| *ch == channel)
            .map(|(_, d)| d)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn channels(&self) -> Vec<usize> {
        self.devices.iter().map(|(ch, _)| *ch).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &DeviceRecord)> {
        self.devices.iter().map(|(ch, d)| (*ch, d))
    }

    /// Labels published on `plotter/live_devices`.
    pub fn live_labels(&self) -> Vec<String> {
        self.devices
            .iter()
            .map(|(_, d)| d.device_label.clone())
            .collect()
    }

    /// Area of the first queued device, used as representative for the
    /// whole queue when estimating compliance.
    pub fn first_area(&self) -> Option<f64> {
        self.devices.first().map(|(_, d)| d.area)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Experiment {
    SolarSim,
    Eqe,
}

impl Experiment {
    /// Key into `stage.experiment_positions`.
    pub fn key(self) -> &'static str {
        match self {
            Experiment::SolarSim => "solarsim",
            Experiment::Eqe => "eqe",
        }
    }
}

// ============================================================================
// 3. RUNTIME VALUES
// ============================================================================

/// Retained value of `measurement/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ready,
    Busy,
    Offline,
}

/// Process-wide job slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Busy,
}

/// Illumination condition of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Dark,
    Light,
}

impl Polarity {
    pub fn as_str(self) -> &'static str {
        match self {
            Polarity::Dark => "dark",
            Polarity::Light => "light",
        }
    }
}

/// Status register bit raised when the SMU hits its compliance limit.
pub const COMPLIANCE_BIT: u32 = 1 << 3;

/// One SMU reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub voltage: f64,
    pub current: f64,
    /// Seconds since the SMU connection was opened.
    pub time: f64,
    pub status: u32,
}

impl Sample {
    pub fn in_compliance(&self) -> bool {
        self.status & COMPLIANCE_BIT != 0
    }

    /// Power delivered by the device (photocurrent flows out, so I < 0).
    pub fn power_out(&self) -> f64 {
        -self.voltage * self.current
    }
}

/// Channel -> readings for one acquisition step or one whole curve.
pub type Batch = BTreeMap<usize, Vec<Sample>>;

/// Payload of `daq/init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaqInit {
    pub init_success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_request_fills_defaults() {
        let req: Request = serde_json::from_value(serde_json::json!({
            "config": {"smu": [{"address": "virt", "virtual": true}]},
            "args": {"enable_iv": true, "i_dwell": 2.0}
        }))
        .unwrap();
        assert!(req.args.enable_iv);
        assert_eq!(req.args.cycles, 1);
        assert_eq!(req.config.ccd.max_voltage, 3.0);
        assert!(req.config.primary_smu().unwrap().virt);
        assert!(req.args.iv_devices.is_none());
    }

    #[test]
    fn compliance_bit_and_power_sign() {
        let s = Sample {
            voltage: 0.5,
            current: -0.01,
            time: 0.0,
            status: COMPLIANCE_BIT,
        };
        assert!(s.in_compliance());
        assert!((s.power_out() - 0.005).abs() < 1e-12);
    }
}

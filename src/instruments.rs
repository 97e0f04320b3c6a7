// src/instruments.rs
//
// =============================================================================
// SUNBENCH: INSTRUMENT CAPABILITIES & FACTORY
// =============================================================================
//
// The Hexagonal Port.
//
// Responsibilities:
// 1. Define one capability trait per instrument kind (The Contract).
// 2. Resolve virtual vs. hardware once, at acquisition time.
// 3. Hand out ledger-backed `Handle`s so every connection is released once.

use crate::core::Sample;
use crate::error::{LabError, LabResult};
use crate::resources::{Handle, Priority, ResourceLedger};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

// Declare the concrete implementations
pub mod motion;
pub mod network;
pub mod virt;

pub use motion::MotionController;
pub use network::NetworkBackend;
pub use virt::SimBench;

// ============================================================================
// 1. KINDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentKind {
    Smu,
    StageController,
    LightEngine,
    Monochromator,
    Psu,
    LockIn,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstrumentKind::Smu => "sourcemeter",
            InstrumentKind::StageController => "controller",
            InstrumentKind::LightEngine => "light engine",
            InstrumentKind::Monochromator => "monochromator",
            InstrumentKind::Psu => "power supply",
            InstrumentKind::LockIn => "lock-in",
        };
        f.write_str(name)
    }
}

// ============================================================================
// 2. THE CAPABILITY TRAITS (The Contract)
// ============================================================================

/// Common surface of every open instrument.
pub trait Instrument: Send {
    fn kind(&self) -> InstrumentKind;
    fn address(&self) -> &str;

    /// Closes the connection. Called exactly once, by `Handle::drop`.
    fn release(&mut self);
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoardIdentity {
    pub firmware: String,
    pub axes: Vec<usize>,
    pub muxes: Vec<String>,
}

/// Multiplexer / stage controller board. Commands answer with an empty
/// string when acknowledged.
#[async_trait]
pub trait ControllerBoard: Instrument {
    async fn query(&mut self, cmd: &str) -> LabResult<String>;

    async fn identity(&mut self) -> LabResult<BoardIdentity> {
        let firmware = self.query("v").await?;
        let axes = self
            .query("e")
            .await?
            .split_whitespace()
            .filter_map(|a| a.parse().ok())
            .collect();
        let muxes = self
            .query("c")
            .await?
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Ok(BoardIdentity {
            firmware,
            axes,
            muxes,
        })
    }
}

/// Multi-channel source-measure unit.
#[async_trait]
pub trait SourceMeter: Instrument {
    async fn identify(&mut self) -> LabResult<String>;
    async fn set_nplc(&mut self, nplc: f64) -> LabResult<()>;
    async fn set_compliance(&mut self, amps: f64) -> LabResult<()>;
    async fn source_voltage(&mut self, setpoints: &BTreeMap<usize, f64>) -> LabResult<()>;
    async fn source_current(&mut self, setpoints: &BTreeMap<usize, f64>) -> LabResult<()>;
    async fn measure(&mut self, channels: &[usize]) -> LabResult<BTreeMap<usize, Sample>>;
    async fn enable_output(&mut self, on: bool) -> LabResult<()>;

    /// DC resistance mode (RTD readout) when `on`, back to voltage sourcing otherwise.
    async fn setup_ohms(&mut self, on: bool) -> LabResult<()>;
    async fn measure_resistance(&mut self) -> LabResult<f64>;
    async fn set_contact_check(&mut self, on: bool) -> LabResult<()>;
    /// True when the selected device makes contact.
    async fn contact_check(&mut self) -> LabResult<bool>;
}

/// Solar-simulator light engine with an internal spectrometer.
#[async_trait]
pub trait LightEngine: Instrument {
    async fn set_intensity(&mut self, percent: f64) -> LabResult<()>;
    async fn on(&mut self) -> LabResult<()>;
    async fn off(&mut self) -> LabResult<()>;
    /// (wavelength nm, irradiance) pairs.
    async fn spectrum(&mut self) -> LabResult<Vec<[f64; 2]>>;
}

#[async_trait]
pub trait Monochromator: Instrument {
    /// Writes one command and returns the reply line.
    async fn command(&mut self, cmd: &str) -> LabResult<String>;
}

/// Anything that answers SCPI-style text queries (PSU, lock-in, SMU idn).
#[async_trait]
pub trait ScpiProbe: Instrument {
    async fn query(&mut self, cmd: &str) -> LabResult<String>;
}

// ============================================================================
// 3. CONNECTION PARAMETERS
// ============================================================================

#[derive(Debug, Clone)]
pub struct SmuLink {
    pub address: String,
    pub port: u16,
    pub terminator: String,
    pub baud: u32,
    pub plf: f64,
    pub two_wire: bool,
    pub invert_channels: bool,
}

impl SmuLink {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: 0,
            terminator: "\n".into(),
            baud: 57600,
            plf: 50.0,
            two_wire: false,
            invert_channels: false,
        }
    }
}

/// Real-instrument constructors. Wire drivers live outside this crate.
#[async_trait]
pub trait HardwareBackend: Send + Sync {
    async fn board(&self, address: &str, timeout: Duration) -> LabResult<Box<dyn ControllerBoard>>;
    async fn smu(&self, link: &SmuLink, timeout: Duration) -> LabResult<Box<dyn SourceMeter>>;
    async fn light_engine(
        &self,
        address: &str,
        recipe: &str,
        timeout: Duration,
    ) -> LabResult<Box<dyn LightEngine>>;
    async fn monochromator(
        &self,
        address: &str,
        timeout: Duration,
    ) -> LabResult<Box<dyn Monochromator>>;
    async fn scpi(
        &self,
        kind: InstrumentKind,
        address: &str,
        timeout: Duration,
    ) -> LabResult<Box<dyn ScpiProbe>>;
}

// ============================================================================
// 4. THE FACTORY (The Dispatcher)
// ============================================================================

#[derive(Clone)]
pub struct InstrumentFactory {
    ledger: ResourceLedger,
    bench: SimBench,
    hardware: Arc<dyn HardwareBackend>,
}

impl InstrumentFactory {
    pub fn new(hardware: Arc<dyn HardwareBackend>, bench: SimBench) -> Self {
        Self {
            ledger: ResourceLedger::new(),
            bench,
            hardware,
        }
    }

    /// Virtual bench with the default network backend for real instruments.
    pub fn simulated() -> Self {
        Self::new(Arc::new(NetworkBackend), SimBench::new())
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn bench(&self) -> &SimBench {
        &self.bench
    }

    pub async fn controller(
        &self,
        address: &str,
        virt: bool,
        timeout: Duration,
        priority: Priority,
    ) -> LabResult<Handle<dyn ControllerBoard>> {
        let kind = InstrumentKind::StageController;
        let lease = self.ledger.claim(kind, address, priority)?;
        let inner = if virt {
            Box::new(virt::VirtualBoard::new(address, self.bench.clone())) as Box<dyn ControllerBoard>
        } else {
            connect_within(kind, address, timeout, self.hardware.board(address, timeout)).await?
        };
        Ok(Handle::new(inner, lease))
    }

    pub async fn smu(
        &self,
        link: &SmuLink,
        virt: bool,
        timeout: Duration,
    ) -> LabResult<Handle<dyn SourceMeter>> {
        let kind = InstrumentKind::Smu;
        let lease = self.ledger.claim(kind, &link.address, Priority::Normal)?;
        let inner = if virt {
            Box::new(virt::VirtualSmu::new(link, self.bench.clone())) as Box<dyn SourceMeter>
        } else {
            connect_within(kind, &link.address, timeout, self.hardware.smu(link, timeout)).await?
        };
        Ok(Handle::new(inner, lease))
    }

    pub async fn light_engine(
        &self,
        address: &str,
        recipe: &str,
        virt: bool,
        timeout: Duration,
    ) -> LabResult<Handle<dyn LightEngine>> {
        let kind = InstrumentKind::LightEngine;
        let lease = self.ledger.claim(kind, address, Priority::Normal)?;
        let inner = if virt {
            Box::new(virt::VirtualLight::new(address, recipe, self.bench.clone()))
                as Box<dyn LightEngine>
        } else {
            connect_within(
                kind,
                address,
                timeout,
                self.hardware.light_engine(address, recipe, timeout),
            )
            .await?
        };
        Ok(Handle::new(inner, lease))
    }

    pub async fn monochromator(
        &self,
        address: &str,
        virt: bool,
        timeout: Duration,
    ) -> LabResult<Handle<dyn Monochromator>> {
        let kind = InstrumentKind::Monochromator;
        let lease = self.ledger.claim(kind, address, Priority::Normal)?;
        let inner = if virt {
            Box::new(virt::VirtualMono::new(address, self.bench.clone())) as Box<dyn Monochromator>
        } else {
            connect_within(kind, address, timeout, self.hardware.monochromator(address, timeout))
                .await?
        };
        Ok(Handle::new(inner, lease))
    }

    pub async fn scpi(
        &self,
        kind: InstrumentKind,
        address: &str,
        virt: bool,
        timeout: Duration,
    ) -> LabResult<Handle<dyn ScpiProbe>> {
        let lease = self.ledger.claim(kind, address, Priority::Normal)?;
        let inner = if virt {
            Box::new(virt::VirtualProbe::new(kind, address, self.bench.clone())) as Box<dyn ScpiProbe>
        } else {
            connect_within(kind, address, timeout, self.hardware.scpi(kind, address, timeout))
                .await?
        };
        Ok(Handle::new(inner, lease))
    }
}

/// Bounds a hardware connect attempt by `timeout`.
async fn connect_within<T>(
    kind: InstrumentKind,
    address: &str,
    timeout: Duration,
    connect: impl Future<Output = LabResult<T>>,
) -> LabResult<T> {
    match tokio::time::timeout(timeout, connect).await {
        Ok(res) => res,
        Err(_) => Err(LabError::connect(
            kind,
            address,
            format!("no answer within {:?}", timeout),
        )),
    }
}

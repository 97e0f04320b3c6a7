// src/lib.rs
//
// =============================================================================
// SUNBENCH: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.

// 1. Declare Modules
pub mod bus;
pub mod config;
pub mod core;
pub mod error;
pub mod instruments;
pub mod layout;
pub mod logs;
pub mod measure;
pub mod mppt;
pub mod publisher;
pub mod resources;
pub mod router;
pub mod rtd;
pub mod sequencer;
pub mod server;
pub mod supervisor;
pub mod utility;

// 2. Re-exports (The Public API)

pub use bus::{Bus, LocalBus};
pub use config::ServerSettings;
pub use core::{DeviceRecord, PixelQueue, Request, Status};
pub use error::{LabError, LabResult};
pub use instruments::{InstrumentFactory, SimBench};
pub use publisher::Outbox;
pub use server::Server;
pub use supervisor::JobSupervisor;

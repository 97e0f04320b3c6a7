// src/measure.rs
//
// =============================================================================
// SUNBENCH: MEASUREMENT ROUTINES
// =============================================================================
//
// The physics-facing half of the sequencer.
//
// Responsibilities:
// 1. Estimate the current compliance for a queue.
// 2. Run steady-state dwells and I-V sweeps on every queued channel at once.
// 3. Route each acquisition step to the bus through a `DataHandler`.

use crate::bus::topics;
use crate::core::{Batch, PixelQueue, Polarity, Sample};
use crate::error::LabResult;
use crate::instruments::SourceMeter;
use crate::publisher::Outbox;
use crate::supervisor::AbortSignal;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

/// Headroom applied to the forward sweep's current when refining the
/// return sweep's compliance.
const SMART_COMPLIANCE_MARGIN: f64 = 1.5;

// ============================================================================
// 1. PURE HELPERS
// ============================================================================

/// Current compliance in A: the smallest of the density limit applied to
/// `area` (cm^2, `jmax` in mA/cm^2), `imax` and the SMU's own limit.
pub fn compliance_current_guess(area: f64, jmax: f64, imax: f64, smu_limit: f64) -> f64 {
    (area * jmax / 1000.0).min(imax).min(smu_limit)
}

/// Ordered sweep polarities for the `lit_sweep` selector.
pub fn sweep_plan(selector: u8) -> Vec<Polarity> {
    match selector {
        0 => vec![Polarity::Dark, Polarity::Light],
        1 => vec![Polarity::Light, Polarity::Dark],
        2 => vec![Polarity::Dark],
        3 => vec![Polarity::Light],
        other => {
            log::warn!("Unknown sweep selector {}, no sweeps", other);
            Vec::new()
        }
    }
}

pub fn linspace(start: f64, end: f64, points: u32) -> Vec<f64> {
    match points {
        0 => Vec::new(),
        1 => vec![start],
        n => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Open-circuit voltage by linear interpolation at the first current
/// zero-crossing of a curve.
pub fn voc_from_curve(curve: &[Sample]) -> Option<f64> {
    curve.windows(2).find_map(|w| {
        let (a, b) = (w[0], w[1]);
        if a.current == 0.0 {
            return Some(a.voltage);
        }
        if a.current.signum() == b.current.signum() {
            return None;
        }
        let frac = a.current / (a.current - b.current);
        Some(a.voltage + frac * (b.voltage - a.voltage))
    })
}

/// Compliance for a return sweep: the largest current seen below Voc on
/// the forward sweep, with headroom, never above `cap`.
pub fn refine_compliance(forward: &Batch, vocs: &BTreeMap<usize, f64>, cap: f64) -> f64 {
    let peak = forward
        .iter()
        .filter_map(|(ch, curve)| vocs.get(ch).map(|voc| (curve, *voc)))
        .flat_map(|(curve, voc)| curve.iter().filter(move |s| s.voltage <= voc))
        .map(|s| s.current.abs())
        .fold(0.0_f64, f64::max);
    if peak > 0.0 {
        (peak * SMART_COMPLIANCE_MARGIN).min(cap)
    } else {
        cap
    }
}

fn uniform(channels: &[usize], value: f64) -> BTreeMap<usize, f64> {
    channels.iter().map(|ch| (*ch, value)).collect()
}

fn append(batch: &mut Batch, step: &BTreeMap<usize, Sample>) {
    for (ch, s) in step {
        batch.entry(*ch).or_default().push(*s);
    }
}

// ============================================================================
// 2. DATA ROUTING
// ============================================================================

/// Per-job router for acquired data. `kind` names the sub-channel of
/// `data/raw/<kind>`.
pub struct DataHandler {
    outbox: Option<Outbox>,
    pub kind: String,
    pub sweep: Option<Polarity>,
}

impl DataHandler {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            outbox: Some(outbox),
            kind: String::new(),
            sweep: None,
        }
    }

    /// Handler that drops everything.
    pub fn muted() -> Self {
        Self {
            outbox: None,
            kind: String::new(),
            sweep: None,
        }
    }

    /// Switches to a new phase kind and clears its sweep tag.
    pub fn phase(&mut self, kind: &str) {
        self.kind = kind.to_string();
        self.sweep = None;
    }

    /// Emits one record per channel still in `queue`. Pruned or unknown
    /// channels are skipped.
    pub fn handle(&self, queue: &PixelQueue, data: &Batch) {
        let Some(outbox) = &self.outbox else {
            return;
        };
        let topic = topics::raw_data(&self.kind);
        for (ch, samples) in data {
            let Some(device) = queue.get(*ch) else {
                continue;
            };
            let rows: Vec<[f64; 4]> = samples
                .iter()
                .map(|s| [s.voltage, s.current, s.time, s.status as f64])
                .collect();
            let sweep = self.sweep.map(Polarity::as_str).unwrap_or("");
            outbox.append(
                &topic,
                &json!({ "data": rows, "pixel": device, "sweep": sweep }),
                false,
            );
        }
    }

    fn handle_step(&self, queue: &PixelQueue, step: &BTreeMap<usize, Sample>) {
        let batch: Batch = step.iter().map(|(ch, s)| (*ch, vec![*s])).collect();
        self.handle(queue, &batch);
    }
}

// ============================================================================
// 3. ACQUISITION ROUTINES
// ============================================================================

/// Shared acquisition settings for one job.
#[derive(Debug, Clone, Copy)]
pub struct Acquisition {
    pub nplc: f64,
    pub settling: Duration,
}

#[derive(Debug, Clone, Copy)]
pub enum SetPoint {
    Voltage(f64),
    Current(f64),
}

/// Holds every queued channel at `set_point` for `dwell`, streaming each
/// reading. Returns the full record per channel.
pub async fn steady_state(
    smu: &mut dyn SourceMeter,
    queue: &PixelQueue,
    acq: Acquisition,
    set_point: SetPoint,
    dwell: Duration,
    handler: &DataHandler,
    abort: &AbortSignal,
) -> LabResult<Batch> {
    let channels = queue.channels();
    smu.set_nplc(acq.nplc).await?;
    match set_point {
        SetPoint::Voltage(v) => smu.source_voltage(&uniform(&channels, v)).await?,
        SetPoint::Current(i) => smu.source_current(&uniform(&channels, i)).await?,
    }
    smu.enable_output(true).await?;
    abort.sleep(acq.settling).await?;

    let mut record = Batch::new();
    let deadline = tokio::time::Instant::now() + dwell;
    while tokio::time::Instant::now() < deadline {
        abort.check()?;
        let step = smu.measure(&channels).await?;
        handler.handle_step(queue, &step);
        append(&mut record, &step);
    }
    Ok(record)
}

#[derive(Debug, Clone, Copy)]
pub struct SweepSpec {
    pub start: f64,
    pub end: f64,
    pub points: u32,
}

/// Forward context for a return sweep: the previous curve and its Vocs.
pub struct ReturnContext<'a> {
    pub forward: &'a Batch,
    pub vocs: &'a BTreeMap<usize, f64>,
}

/// Steps the voltage on every queued channel. Returns the curves and the
/// Voc found on each channel's curve.
#[allow(clippy::too_many_arguments)]
pub async fn sweep(
    smu: &mut dyn SourceMeter,
    queue: &PixelQueue,
    acq: Acquisition,
    spec: SweepSpec,
    compliance: f64,
    smart: Option<ReturnContext<'_>>,
    handler: &DataHandler,
    abort: &AbortSignal,
) -> LabResult<(Batch, BTreeMap<usize, f64>)> {
    let channels = queue.channels();
    let limit = match smart {
        Some(ctx) => refine_compliance(ctx.forward, ctx.vocs, compliance),
        None => compliance,
    };
    smu.set_compliance(limit).await?;
    smu.set_nplc(acq.nplc).await?;
    smu.enable_output(true).await?;

    let mut curves = Batch::new();
    for v in linspace(spec.start, spec.end, spec.points) {
        abort.check()?;
        smu.source_voltage(&uniform(&channels, v)).await?;
        abort.sleep(acq.settling).await?;
        let step = smu.measure(&channels).await?;
        handler.handle_step(queue, &step);
        append(&mut curves, &step);
    }
    // Sourcing compliance goes back to the job-wide value
    if limit != compliance {
        smu.set_compliance(compliance).await?;
    }

    let vocs = curves
        .iter()
        .filter_map(|(ch, curve)| voc_from_curve(curve).map(|voc| (*ch, voc)))
        .collect();
    Ok((curves, vocs))
}

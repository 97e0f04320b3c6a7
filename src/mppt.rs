// src/mppt.rs
//
// =============================================================================
// SUNBENCH: MAX-POWER-POINT TRACKER
// =============================================================================
//
// Perturb-and-observe tracking across every queued channel in parallel.
//
// Responsibilities:
// 1. Parse tracker parameters (`basic://<perturbation_mV>:<period_ms>`).
// 2. Remember Voc/Vmpp seeds from dwells and registered sweeps.
// 3. Prune channels that stay in compliance, straight out of the live queue.

use crate::bus::topics;
use crate::core::{Batch, DeviceRecord, PixelQueue, Sample};
use crate::error::{LabError, LabResult};
use crate::instruments::SourceMeter;
use crate::measure::{self, Acquisition, DataHandler, SetPoint};
use crate::supervisor::AbortSignal;
use std::collections::BTreeMap;
use std::time::Duration;

/// Consecutive compliance readings before a channel is dropped.
pub const PRUNE_AFTER: u32 = 3;
/// Voc search dwell for channels with no seed.
const VOC_SEARCH: Duration = Duration::from_secs(1);
/// Unseeded start point as a fraction of Voc.
const START_FRACTION: f64 = 0.7;

// ============================================================================
// 1. PARAMETERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MpptParams {
    /// Voltage step in V.
    pub perturbation: f64,
    pub period: Duration,
}

impl MpptParams {
    pub fn parse(spec: &str) -> LabResult<Self> {
        let bad = |reason: &str| LabError::MalformedMessage {
            topic: topics::RUN.into(),
            reason: format!("mppt_params '{}': {}", spec, reason),
        };
        let (algo, rest) = spec.split_once("://").ok_or_else(|| bad("missing scheme"))?;
        if algo != "basic" {
            return Err(bad("only 'basic' tracking is supported"));
        }
        let (dv, period) = rest.split_once(':').ok_or_else(|| bad("expected <mV>:<ms>"))?;
        let dv: f64 = dv.parse().map_err(|_| bad("perturbation is not a number"))?;
        let period: f64 = period.parse().map_err(|_| bad("period is not a number"))?;
        if dv <= 0.0 || period <= 0.0 {
            return Err(bad("values must be positive"));
        }
        Ok(Self {
            perturbation: dv / 1000.0,
            period: Duration::from_secs_f64(period / 1000.0),
        })
    }
}

// ============================================================================
// 2. THE TRACKER
// ============================================================================

/// Max-power point of one curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerPoint {
    pub pmax: f64,
    pub vmpp: f64,
    pub impp: f64,
    pub index: usize,
}

#[derive(Debug, Default)]
pub struct TrackOutcome {
    pub data: Batch,
    /// Voc search readings taken before tracking started.
    pub voc_search: Batch,
    pub pruned: Vec<DeviceRecord>,
}

struct Channel {
    voltage: f64,
    direction: f64,
    last_power: Option<f64>,
    compliance_streak: u32,
}

#[derive(Debug, Default)]
pub struct MaxPowerTracker {
    pub current_compliance: f64,
    voc: BTreeMap<usize, f64>,
    vmpp: BTreeMap<usize, f64>,
}

impl MaxPowerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds Voc from a steady-state dwell.
    pub fn seed_voc(&mut self, vocs: BTreeMap<usize, f64>) {
        self.voc.extend(vocs);
    }

    pub fn voc(&self, channel: usize) -> Option<f64> {
        self.voc.get(&channel).copied()
    }

    pub fn vmpp(&self, channel: usize) -> Option<f64> {
        self.vmpp.get(&channel).copied()
    }

    /// Finds each curve's max-power point. Lit curves also seed the tracker.
    pub fn register_curve(&mut self, curves: &Batch, light: bool) -> BTreeMap<usize, PowerPoint> {
        let mut points = BTreeMap::new();
        for (ch, curve) in curves {
            let best = curve
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.power_out().total_cmp(&b.power_out()));
            let Some((index, s)) = best else {
                continue;
            };
            let point = PowerPoint {
                pmax: s.power_out(),
                vmpp: s.voltage,
                impp: s.current,
                index,
            };
            if light {
                self.vmpp.insert(*ch, point.vmpp);
                if let Some(voc) = measure::voc_from_curve(curve) {
                    self.voc.insert(*ch, voc);
                }
            }
            points.insert(*ch, point);
        }
        points
    }

    fn start_voltage(&self, channel: usize, ceiling: f64) -> f64 {
        let v = self
            .vmpp(channel)
            .or_else(|| self.voc(channel).map(|voc| voc * START_FRACTION))
            .unwrap_or(0.0);
        v.clamp(0.0, ceiling)
    }

    /// Tracks every queued channel for `dwell`. Channels that read in
    /// compliance `PRUNE_AFTER` times in a row are removed from `queue`.
    #[allow(clippy::too_many_arguments)]
    pub async fn track(
        &mut self,
        smu: &mut dyn SourceMeter,
        queue: &mut PixelQueue,
        acq: Acquisition,
        params: MpptParams,
        dwell: Duration,
        voltage_ceiling: f64,
        handler: &DataHandler,
        abort: &AbortSignal,
    ) -> LabResult<TrackOutcome> {
        let mut outcome = TrackOutcome::default();

        let unseeded: Vec<usize> = queue
            .channels()
            .into_iter()
            .filter(|ch| self.voc(*ch).is_none() && self.vmpp(*ch).is_none())
            .collect();
        if !unseeded.is_empty() {
            log::info!("Searching Voc on channels {:?}", unseeded);
            let mut subset = PixelQueue::new();
            for ch in &unseeded {
                if let Some(d) = queue.get(*ch) {
                    subset.insert(*ch, d.clone());
                }
            }
            let silent = DataHandler::muted();
            let vt = measure::steady_state(
                smu,
                &subset,
                acq,
                SetPoint::Current(0.0),
                VOC_SEARCH,
                &silent,
                abort,
            )
            .await?;
            for (ch, samples) in &vt {
                if let Some(last) = samples.last() {
                    self.voc.insert(*ch, last.voltage);
                }
            }
            outcome.voc_search = vt;
        }

        let mut state: BTreeMap<usize, Channel> = queue
            .channels()
            .into_iter()
            .map(|ch| {
                let ch_state = Channel {
                    voltage: self.start_voltage(ch, voltage_ceiling),
                    direction: 1.0,
                    last_power: None,
                    compliance_streak: 0,
                };
                (ch, ch_state)
            })
            .collect();

        smu.set_compliance(self.current_compliance).await?;
        smu.set_nplc(acq.nplc).await?;
        smu.source_voltage(&state.iter().map(|(ch, c)| (*ch, c.voltage)).collect())
            .await?;
        smu.enable_output(true).await?;
        abort.sleep(acq.settling).await?;

        let deadline = tokio::time::Instant::now() + dwell;
        while tokio::time::Instant::now() < deadline && !state.is_empty() {
            abort.check()?;
            let channels: Vec<usize> = state.keys().copied().collect();
            let step = smu.measure(&channels).await?;
            let batch: Batch = step.iter().map(|(ch, s)| (*ch, vec![*s])).collect();
            handler.handle(queue, &batch);

            let mut next = BTreeMap::new();
            for (ch, sample) in &step {
                let Some(c) = state.get_mut(ch) else {
                    continue;
                };
                outcome.data.entry(*ch).or_default().push(*sample);
                if self.observe(c, sample, params, voltage_ceiling) {
                    next.insert(*ch, c.voltage);
                } else if let Some(device) = queue.remove(*ch) {
                    log::warn!(
                        "Dropping {} (channel {}): stuck in compliance",
                        device.device_label,
                        ch
                    );
                    outcome.pruned.push(device);
                    next.insert(*ch, 0.0);
                }
            }
            state.retain(|ch, _| queue.get(*ch).is_some());
            smu.source_voltage(&next).await?;
            abort.sleep(params.period).await?;
        }

        for (ch, c) in &state {
            self.vmpp.insert(*ch, c.voltage);
        }
        Ok(outcome)
    }

    /// One perturb-and-observe step. False when the channel should be pruned.
    fn observe(&self, c: &mut Channel, s: &Sample, params: MpptParams, ceiling: f64) -> bool {
        if s.in_compliance() {
            c.compliance_streak += 1;
            if c.compliance_streak >= PRUNE_AFTER {
                return false;
            }
        } else {
            c.compliance_streak = 0;
        }
        let power = s.power_out();
        if let Some(last) = c.last_power {
            if power < last {
                c.direction = -c.direction;
            }
        }
        c.last_power = Some(power);
        c.voltage = (c.voltage + c.direction * params.perturbation).clamp(0.0, ceiling);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(voltage: f64, current: f64) -> Sample {
        Sample {
            voltage,
            current,
            time: 0.0,
            status: 0,
        }
    }

    #[test]
    fn basic_params_parse_to_volts_and_seconds() {
        let p = MpptParams::parse("basic://10:100").unwrap();
        assert!((p.perturbation - 0.010).abs() < 1e-12);
        assert_eq!(p.period, Duration::from_millis(100));
        assert!(MpptParams::parse("gd://10:100").is_err());
        assert!(MpptParams::parse("basic://10").is_err());
        assert!(MpptParams::parse("basic://x:100").is_err());
    }

    #[test]
    fn lit_curves_seed_the_tracker() {
        let mut t = MaxPowerTracker::new();
        let curve: Batch = [(4, vec![s(0.0, -0.02), s(0.6, -0.018), s(0.8, -0.01), s(1.0, 0.01)])]
            .into_iter()
            .collect();

        let dark = t.register_curve(&curve, false);
        assert_eq!(dark[&4].index, 1);
        assert_eq!(t.vmpp(4), None);

        let lit = t.register_curve(&curve, true);
        assert!((lit[&4].pmax - 0.0108).abs() < 1e-12);
        assert_eq!(t.vmpp(4), Some(0.6));
        assert!((t.voc(4).unwrap() - 0.9).abs() < 1e-12);
        assert_eq!(t.start_voltage(4, 0.5), 0.5);
    }

    #[test]
    fn compliance_streak_prunes_on_the_third_reading() {
        let t = MaxPowerTracker::new();
        let params = MpptParams::parse("basic://10:100").unwrap();
        let mut c = Channel {
            voltage: 0.5,
            direction: 1.0,
            last_power: None,
            compliance_streak: 0,
        };
        let stuck = Sample {
            status: crate::core::COMPLIANCE_BIT,
            ..s(0.5, 0.1)
        };
        assert!(t.observe(&mut c, &stuck, params, 3.0));
        assert!(t.observe(&mut c, &stuck, params, 3.0));
        assert!(!t.observe(&mut c, &stuck, params, 3.0));

        // A clean reading resets the streak
        let mut c = Channel {
            voltage: 0.5,
            direction: 1.0,
            last_power: None,
            compliance_streak: 2,
        };
        assert!(t.observe(&mut c, &s(0.5, -0.01), params, 3.0));
        assert_eq!(c.compliance_streak, 0);
        assert!((c.voltage - 0.51).abs() < 1e-12);
    }
}

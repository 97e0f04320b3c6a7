// src/sequencer.rs
//
// =============================================================================
// SUNBENCH: MEASUREMENT SEQUENCER (I-V-T)
// =============================================================================
//
// The state machine one measurement job walks through:
//
//   SpectrumCalibration? -> DaqReadinessCheck
//     -> per cycle { Voc dwell? -> sweeps? -> MPPT? -> Jsc dwell? }
//     -> Teardown
//
// Design Principles:
// 1. Every instrument lives in a scoped `Handle`; no exit path leaks one.
// 2. Teardown runs exactly once, whatever ended the cycle loop.
// 3. The PixelQueue only shrinks; the live list is reconciled after MPPT.

use crate::bus::topics;
use crate::config::ServerSettings;
use crate::core::{Batch, DaqInit, Experiment, PixelQueue, Polarity, Request};
use crate::error::{LabError, LabResult};
use crate::instruments::{InstrumentFactory, LightEngine, SmuLink, SourceMeter};
use crate::layout;
use crate::logs::Severity;
use crate::measure::{self, Acquisition, DataHandler, ReturnContext, SetPoint, SweepSpec};
use crate::mppt::{MaxPowerTracker, MpptParams};
use crate::publisher::Outbox;
use crate::resources::Handle;
use crate::supervisor::AbortSignal;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Pause between cycles, giving a pending stop the chance to land.
const CYCLE_GAP: Duration = Duration::from_millis(10);

// ============================================================================
// 1. DAQ READINESS RENDEZVOUS
// ============================================================================

/// Mailbox for `daq/init` acknowledgements. Cheap to clone.
#[derive(Clone)]
pub struct DaqInbox {
    tx: mpsc::UnboundedSender<DaqInit>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<DaqInit>>>,
}

impl Default for DaqInbox {
    fn default() -> Self {
        Self::new()
    }
}

impl DaqInbox {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn post(&self, init: DaqInit) {
        let _ = self.tx.send(init);
    }

    /// Drops acknowledgements left over from earlier runs. A no-op while a
    /// job is waiting on the inbox.
    pub fn drain(&self) {
        let Ok(mut rx) = self.rx.try_lock() else {
            return;
        };
        while let Ok(stale) = rx.try_recv() {
            log::debug!("Discarding stale DAQ ack: {:?}", stale);
        }
    }

    /// Blocks until the DAQ acknowledges, fails, or `timeout` passes.
    async fn wait_ready(&self, timeout: Duration, abort: &AbortSignal) -> LabResult<()> {
        let mut rx = self.rx.lock().await;
        let ack = abort
            .abortable(async { Ok(tokio::time::timeout(timeout, rx.recv()).await) })
            .await?;
        match ack {
            Ok(Some(DaqInit { init_success: true })) => Ok(()),
            Ok(Some(_)) => Err(LabError::DaqNotReady("initialisation failed".into())),
            Ok(None) => Err(LabError::DaqNotReady("inbox closed".into())),
            Err(_) => Err(LabError::DaqNotReady(format!(
                "no answer within {:?}",
                timeout
            ))),
        }
    }
}

// ============================================================================
// 2. THE JOB
// ============================================================================

/// Everything a measurement job needs, owned by the job task.
#[derive(Clone)]
pub struct RunContext {
    pub request: Arc<Request>,
    pub outbox: Outbox,
    pub factory: InstrumentFactory,
    pub daq: DaqInbox,
    pub settings: Arc<ServerSettings>,
}

/// Runs one measurement request to completion.
pub async fn run(ctx: RunContext, abort: AbortSignal) -> LabResult<()> {
    log::info!("Running measurement...");
    let args = &ctx.request.args;

    if args.iv_devices.is_some() && args.enable_solarsim {
        calibrate_spectrum(&ctx, &abort).await?;
    }

    ctx.outbox.log(Severity::Info, "Checking DAQ status...");
    ctx.daq
        .wait_ready(ctx.settings.daq_timeout(), &abort)
        .await?;

    ctx.outbox.log(Severity::Info, "Starting run...");
    if args.iv_devices.is_some() {
        let queue = layout::build_queue(&ctx.request, Experiment::SolarSim)?;
        ivt(&ctx, queue, &abort).await?;
    }
    ctx.outbox.log(Severity::Info, "Run complete!");
    log::info!("Measurement complete.");
    Ok(())
}

async fn calibrate_spectrum(ctx: &RunContext, abort: &AbortSignal) -> LabResult<()> {
    log::info!("Calibrating spectrum...");
    let config = &ctx.request.config;
    let args = &ctx.request.args;

    let res = abort
        .abortable(async {
            ctx.outbox
                .log(Severity::Info, "Calibrating solar simulator spectrum...");
            let mut light = ctx
                .factory
                .light_engine(
                    &config.solarsim.address,
                    &args.light_recipe,
                    config.solarsim.virt,
                    ctx.settings.instrument_timeout(),
                )
                .await?;
            light.set_intensity(args.light_recipe_int).await?;
            let timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
            let data = light.spectrum().await?;
            ctx.outbox.append(
                topics::SPECTRUM,
                &json!({ "data": data, "timestamp": timestamp }),
                true,
            );
            ctx.outbox
                .log(Severity::Info, "Finished calibrating solar simulator spectrum!");
            Ok::<(), LabError>(())
        })
        .await;

    match &res {
        Ok(()) => log::info!("Spectrum calibration complete."),
        Err(e) if e.is_abort() => {}
        Err(e) => ctx
            .outbox
            .log(Severity::Error, format!("Spectrum calibration aborted! {}", e)),
    }
    ctx.outbox.status(crate::core::Status::Ready);
    res
}

// ============================================================================
// 3. I-V-T PHASES
// ============================================================================

/// The instruments of one I-V-T run.
struct Bench {
    smu: Handle<dyn SourceMeter>,
    light: Option<Handle<dyn LightEngine>>,
}

impl Bench {
    async fn light(&mut self, on: bool) -> LabResult<()> {
        match self.light.as_mut() {
            Some(le) if on => le.on().await,
            Some(le) => le.off().await,
            None => Ok(()),
        }
    }

    /// Output off, light off, DAQ stop. Faults are logged, never raised.
    async fn teardown(&mut self, outbox: &Outbox) {
        outbox.live_devices(&[]);
        if let Err(e) = self.smu.enable_output(false).await {
            outbox.log(Severity::Warning, format!("Unable to disable SMU output: {}", e));
        }
        if let Some(le) = self.light.as_mut() {
            if let Err(e) = le.off().await {
                outbox.log(Severity::Warning, format!("Unable to turn light off: {}", e));
            }
        }
        outbox.append(topics::DAQ_STOP, "", false);
    }
}

async fn ivt(ctx: &RunContext, queue: PixelQueue, abort: &AbortSignal) -> LabResult<()> {
    let config = &ctx.request.config;
    let args = &ctx.request.args;
    let smu_cfg = config.primary_smu().ok_or_else(|| LabError::MalformedMessage {
        topic: topics::RUN.into(),
        reason: "no sourcemeter configured".into(),
    })?;
    if smu_cfg.plf.is_nan() || smu_cfg.plf <= 0.0 {
        return Err(LabError::MalformedMessage {
            topic: topics::RUN.into(),
            reason: format!("power line frequency must be positive, got {}", smu_cfg.plf),
        });
    }
    let params = if args.mppt_dwell > 0.0 {
        Some(MpptParams::parse(&args.mppt_params)?)
    } else {
        None
    };

    let timeout = ctx.settings.instrument_timeout();
    let link = SmuLink {
        address: smu_cfg.address.clone(),
        port: smu_cfg.port,
        terminator: smu_cfg.terminator.clone(),
        plf: smu_cfg.plf,
        two_wire: smu_cfg.two_wire,
        invert_channels: args.inverted_conn,
        ..SmuLink::new(&smu_cfg.address)
    };
    let mut smu = ctx.factory.smu(&link, smu_cfg.virt, timeout).await?;
    log::info!("Sourcemeter: {}", smu.identify().await?);
    let light = if args.enable_solarsim {
        let mut le = ctx
            .factory
            .light_engine(
                &config.solarsim.address,
                &args.light_recipe,
                config.solarsim.virt,
                timeout,
            )
            .await?;
        le.set_intensity(args.light_recipe_int).await?;
        Some(le)
    } else {
        None
    };
    let mut bench = Bench { smu, light };

    ctx.outbox.append(topics::DAQ_START, "", false);
    ctx.outbox.live_devices(&queue.live_labels());

    let result = cycles(ctx, &mut bench, queue, params, abort).await;
    bench.teardown(&ctx.outbox).await;
    result
}

async fn cycles(
    ctx: &RunContext,
    bench: &mut Bench,
    mut queue: PixelQueue,
    params: Option<MpptParams>,
    abort: &AbortSignal,
) -> LabResult<()> {
    let config = &ctx.request.config;
    let args = &ctx.request.args;
    let outbox = &ctx.outbox;
    let smart_compliance = config.primary_smu().is_some_and(|s| s.smart_compliance);
    let current_limit = config.primary_smu().map_or(f64::INFINITY, |s| s.current_limit);

    let acq = Acquisition {
        nplc: args.nplc,
        settling: Duration::from_secs_f64(args.source_delay.max(0.0) / 1000.0),
    };
    let forward = SweepSpec {
        start: args.sweep_start,
        end: args.sweep_end,
        points: args.iv_steps,
    };
    let reverse = SweepSpec {
        start: args.sweep_end,
        end: args.sweep_start,
        points: args.iv_steps,
    };

    let mut tracker = MaxPowerTracker::new();
    let mut handler = DataHandler::new(outbox.clone());

    if queue.is_empty() {
        outbox.log(Severity::Warning, "No devices left to measure.");
        return Ok(());
    }

    let mut cycle: u32 = 0;
    while args.cycles == 0 || cycle < args.cycles {
        abort.check()?;
        cycle += 1;
        outbox.log(Severity::Info, format!("### Loop {} ###", cycle));
        let mut ssvocs: Option<BTreeMap<usize, f64>> = None;

        let area = queue.first_area().unwrap_or(args.a_ovr_spin);
        let compliance =
            measure::compliance_current_guess(area, args.jmax, args.imax, current_limit);
        tracker.current_compliance = compliance;
        bench.smu.set_compliance(compliance).await?;

        // Steady-state Voc
        if args.i_dwell > 0.0 {
            outbox.log(Severity::Info, "Measuring steady-state Voc");
            bench.light(true).await?;
            start_phase(outbox, &mut handler, "vt_measurement", "vt_measurement");
            let vt = measure::steady_state(
                &mut *bench.smu,
                &queue,
                acq,
                SetPoint::Current(args.i_dwell_value),
                Duration::from_secs_f64(args.i_dwell),
                &handler,
                abort,
            )
            .await?;
            if args.i_dwell_value == 0.0 {
                ssvocs = Some(last_voltages(&vt));
            }
        }

        // Sweeps
        if args.sweep_check {
            for polarity in measure::sweep_plan(args.lit_sweep) {
                let lit = polarity == Polarity::Light;
                bench.light(lit).await?;

                outbox.log(
                    Severity::Info,
                    format!("Performing first {} sweep.", polarity.as_str()),
                );
                log::info!("Sweeping voltage from {} V to {} V", forward.start, forward.end);
                start_phase(outbox, &mut handler, "iv_measurement/1", "iv_measurement");
                handler.sweep = Some(polarity);
                let (iv1, vocs1) = measure::sweep(
                    &mut *bench.smu,
                    &queue,
                    acq,
                    forward,
                    compliance,
                    None,
                    &handler,
                    abort,
                )
                .await?;
                tracker.register_curve(&iv1, lit);

                if args.return_switch {
                    outbox.log(
                        Severity::Info,
                        format!("Performing second {} sweep.", polarity.as_str()),
                    );
                    log::info!("Sweeping voltage from {} V to {} V", reverse.start, reverse.end);
                    handler.phase("iv_measurement/2");
                    handler.sweep = Some(polarity);
                    let smart = smart_compliance.then_some(ReturnContext {
                        forward: &iv1,
                        vocs: &vocs1,
                    });
                    let (iv2, _) = measure::sweep(
                        &mut *bench.smu,
                        &queue,
                        acq,
                        reverse,
                        compliance,
                        smart,
                        &handler,
                        abort,
                    )
                    .await?;
                    tracker.register_curve(&iv2, lit);
                }
            }
        }

        // Max-power tracking
        if let Some(params) = params {
            bench.light(true).await?;
            outbox.log(Severity::Info, "Performing max. power tracking.");
            log::info!("Tracking maximum power point for {} seconds.", args.mppt_dwell);
            start_phase(outbox, &mut handler, "mppt_measurement", "mppt_measurement");
            if let Some(vocs) = ssvocs.take() {
                tracker.seed_voc(vocs);
            }

            let before = queue.len();
            let outcome = tracker
                .track(
                    &mut *bench.smu,
                    &mut queue,
                    acq,
                    params,
                    Duration::from_secs_f64(args.mppt_dwell),
                    config.ccd.max_voltage,
                    &handler,
                    abort,
                )
                .await?;
            for device in &outcome.pruned {
                outbox.log(
                    Severity::Warning,
                    format!("{} dropped: stuck in compliance.", device.device_label),
                );
            }

            if queue.len() != before {
                if queue.is_empty() {
                    outbox.log(Severity::Warning, "No devices left to measure.");
                    outbox.live_devices(&[]);
                    break;
                }
                outbox.live_devices(&queue.live_labels());
            }

            if !outcome.voc_search.is_empty() {
                handler.phase("vtmppt_measurement");
                handler.handle(&queue, &outcome.voc_search);
            }
        }

        // Steady-state Jsc
        if args.v_dwell > 0.0 {
            bench.light(true).await?;
            outbox.log(Severity::Info, "Measuring current at constant voltage.");
            start_phase(outbox, &mut handler, "it_measurement", "it_measurement");
            measure::steady_state(
                &mut *bench.smu,
                &queue,
                acq,
                SetPoint::Voltage(args.v_dwell_value),
                Duration::from_secs_f64(args.v_dwell),
                &handler,
                abort,
            )
            .await?;
        }

        outbox.log(Severity::Info, format!("Cycle {} complete.", cycle));
        outbox.flush().await;
        abort.sleep(CYCLE_GAP).await?;
    }
    Ok(())
}

fn start_phase(outbox: &Outbox, handler: &mut DataHandler, kind: &str, plot: &str) {
    handler.phase(kind);
    outbox.clear_plot(plot);
}

fn last_voltages(batch: &Batch) -> BTreeMap<usize, f64> {
    batch
        .iter()
        .filter_map(|(ch, samples)| samples.last().map(|s| (*ch, s.voltage)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Sample;

    #[tokio::test(start_paused = true)]
    async fn daq_wait_times_out_as_not_ready() {
        let inbox = DaqInbox::new();
        let err = inbox
            .wait_ready(Duration::from_secs(30), &AbortSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::DaqNotReady(_)));
    }

    #[tokio::test]
    async fn stale_acks_are_drained() {
        let inbox = DaqInbox::new();
        inbox.post(DaqInit { init_success: false });
        inbox.drain();
        inbox.post(DaqInit { init_success: true });
        inbox
            .wait_ready(Duration::from_secs(1), &AbortSignal::never())
            .await
            .unwrap();
    }

    #[test]
    fn last_voltage_per_channel_seeds_voc() {
        let s = |v| Sample {
            voltage: v,
            current: 0.0,
            time: 0.0,
            status: 0,
        };
        let vt: Batch = [(0, vec![s(0.5), s(0.9)]), (3, vec![]), (5, vec![s(1.1)])]
            .into_iter()
            .collect();
        let vocs = last_voltages(&vt);
        assert_eq!(vocs.len(), 2);
        assert_eq!(vocs[&0], 0.9);
        assert_eq!(vocs[&5], 1.1);
    }
}

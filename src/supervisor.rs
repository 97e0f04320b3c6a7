// src/supervisor.rs
//
// =============================================================================
// SUNBENCH: ADMISSION CONTROL & JOB SUPERVISION
// =============================================================================
//
// The Gatekeeper.
//
// Responsibilities:
// 1. Run at most one measurement job at a time, each in its own task.
// 2. Cancel it cooperatively (`AbortSignal`) and wait for its teardown.
// 3. Never leave the bench latched in `Busy`: whatever ends the job
//    (success, fault, interrupt, panic), `Ready` is published last.
// 4. Admit at most one utility task at a time (`TaskSlot`).

use crate::core::{JobState, Status};
use crate::error::{LabError, LabResult};
use crate::logs::Severity;
use crate::publisher::Outbox;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ============================================================================
// 1. COOPERATIVE CANCELLATION
// ============================================================================

/// Read side of an interrupt. Cheap to clone.
#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

/// Write side of an interrupt, held by the supervisor.
pub struct AbortTrigger {
    tx: watch::Sender<bool>,
}

impl AbortTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl AbortSignal {
    pub fn pair() -> (AbortTrigger, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        (AbortTrigger { tx }, AbortSignal { rx })
    }

    /// A signal that never fires (utility tasks).
    pub fn never() -> Self {
        Self::pair().1
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// `Err(UserAbort)` once triggered.
    pub fn check(&self) -> LabResult<()> {
        if self.is_triggered() {
            Err(LabError::UserAbort)
        } else {
            Ok(())
        }
    }

    /// Resolves when triggered. Pends forever if the trigger was dropped
    /// without firing.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Races `fut` against the interrupt.
    pub async fn abortable<T>(&self, fut: impl Future<Output = LabResult<T>>) -> LabResult<T> {
        tokio::select! {
            biased;
            _ = self.triggered() => Err(LabError::UserAbort),
            res = fut => res,
        }
    }

    pub async fn sleep(&self, duration: Duration) -> LabResult<()> {
        self.abortable(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

// ============================================================================
// 2. THE JOB SUPERVISOR
// ============================================================================

struct RunningJob {
    trigger: AbortTrigger,
    handle: JoinHandle<()>,
}

/// Single-flight slot for long-running measurement jobs.
#[derive(Clone)]
pub struct JobSupervisor {
    outbox: Outbox,
    busy: Arc<AtomicBool>,
    current: Arc<Mutex<Option<RunningJob>>>,
}

impl JobSupervisor {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            busy: Arc::new(AtomicBool::new(false)),
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> JobState {
        if self.busy.load(Ordering::SeqCst) {
            JobState::Busy
        } else {
            JobState::Idle
        }
    }

    /// Launches `job` unless one is alive. Refusal is reported on the bus
    /// and returned as `Busy`.
    pub fn start<F, Fut>(&self, job: F) -> LabResult<()>
    where
        F: FnOnce(AbortSignal) -> Fut,
        Fut: Future<Output = LabResult<()>> + Send + 'static,
    {
        let mut current = self.lock();
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.outbox.log(Severity::Warning, "Measurement server busy!");
            return Err(LabError::Busy);
        }

        // Busy is queued before the job can emit anything
        self.outbox.status(Status::Busy);

        let (trigger, signal) = AbortSignal::pair();
        let job = tokio::spawn(job(signal));
        let handle = tokio::spawn(watch_job(job, self.outbox.clone(), self.busy.clone()));
        *current = Some(RunningJob { trigger, handle });
        Ok(())
    }

    /// Interrupts the running job and waits for it to finish its teardown.
    /// Idempotent.
    pub async fn stop(&self) {
        let running = self.lock().take();
        match running {
            Some(job) if !job.handle.is_finished() => {
                log::info!("Interrupting measurement job");
                job.trigger.trigger();
                if let Err(e) = job.handle.await {
                    log::error!("Job watcher failed: {}", e);
                }
                self.outbox.log(Severity::Info, "Request to stop completed!");
                self.outbox.status(Status::Ready);
                self.outbox.live_devices(&[]);
            }
            _ => {
                self.outbox
                    .log(Severity::Info, "Nothing to stop. Measurement server is idle.");
            }
        }
    }

    /// Waits for the current job, if any, to end on its own.
    pub async fn join(&self) {
        let running = self.lock().take();
        if let Some(job) = running {
            let _ = job.handle.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<RunningJob>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Job boundary: every outcome is reported, then `Ready` goes out.
async fn watch_job(job: JoinHandle<LabResult<()>>, outbox: Outbox, busy: Arc<AtomicBool>) {
    match job.await {
        Ok(Ok(())) => {}
        Ok(Err(LabError::UserAbort)) => outbox.log(Severity::Info, "Run interrupted by user."),
        Ok(Err(e)) => outbox.log(e.severity(), format!("Run aborted! {}", e)),
        Err(e) if e.is_panic() => {
            let reason = panic_message(e.into_panic());
            outbox.log(Severity::Error, format!("Run aborted! {}", reason));
        }
        Err(e) => log::warn!("Measurement task cancelled: {}", e),
    }
    outbox.status(Status::Ready);
    outbox.flush().await;
    busy.store(false, Ordering::SeqCst);
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".into()
    }
}

// ============================================================================
// 3. UTILITY TASK ADMISSION
// ============================================================================

/// Bounded (capacity 1) task channel plus an unfinished-task count, so a
/// task is admitted only when nothing is queued or executing.
pub struct TaskSlot<T> {
    tx: mpsc::Sender<(T, TaskPermit)>,
    unfinished: Arc<AtomicUsize>,
}

impl<T> Clone for TaskSlot<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            unfinished: self.unfinished.clone(),
        }
    }
}

/// Held by the worker while it executes a task. Dropping it frees the slot.
pub struct TaskPermit {
    unfinished: Arc<AtomicUsize>,
}

impl Drop for TaskPermit {
    fn drop(&mut self) {
        self.unfinished.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T> TaskSlot<T> {
    pub fn new() -> (Self, mpsc::Receiver<(T, TaskPermit)>) {
        let (tx, rx) = mpsc::channel(1);
        let slot = Self {
            tx,
            unfinished: Arc::new(AtomicUsize::new(0)),
        };
        (slot, rx)
    }

    pub fn unfinished(&self) -> usize {
        self.unfinished.load(Ordering::SeqCst)
    }

    /// Hands `task` to the worker if the slot is free. Never waits.
    pub fn try_admit(&self, task: T) -> Result<(), T> {
        if self
            .unfinished
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(task);
        }
        let permit = TaskPermit {
            unfinished: self.unfinished.clone(),
        };
        match self.tx.try_send((task, permit)) {
            Ok(()) => Ok(()),
            // The permit inside is dropped here, freeing the slot again
            Err(mpsc::error::TrySendError::Full((task, _)))
            | Err(mpsc::error::TrySendError::Closed((task, _))) => Err(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{topics, Bus, LocalBus};

    #[tokio::test(start_paused = true)]
    async fn abort_interrupts_a_sleep() {
        let (trigger, signal) = AbortSignal::pair();
        let sleeper = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.sleep(Duration::from_secs(3600)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.trigger();
        assert!(matches!(sleeper.await.unwrap(), Err(LabError::UserAbort)));
        assert!(signal.check().is_err());
        assert!(AbortSignal::never().check().is_ok());
    }

    #[tokio::test]
    async fn task_slot_admits_one_at_a_time() {
        let (slot, mut rx) = TaskSlot::new();
        assert!(slot.try_admit("home").is_ok());
        assert_eq!(slot.try_admit("goto"), Err("goto"));

        let (task, permit) = rx.recv().await.unwrap();
        assert_eq!(task, "home");
        // Still executing
        assert!(slot.try_admit("goto").is_err());
        drop(permit);
        assert_eq!(slot.unfinished(), 0);
        assert!(slot.try_admit("goto").is_ok());
    }

    async fn exploding_job(_: AbortSignal) -> LabResult<()> {
        panic!("smu exploded")
    }

    #[tokio::test]
    async fn panicking_job_still_ends_ready() {
        let bus = LocalBus::new();
        let mut logs = bus.subscribe(topics::LOG).await.unwrap();
        let (outbox, _h) = Outbox::spawn(Arc::new(bus.clone()));
        let sup = JobSupervisor::new(outbox);

        sup.start(exploding_job).unwrap();
        sup.join().await;

        assert_eq!(sup.state(), JobState::Idle);
        let log = logs.try_recv().unwrap().json().unwrap();
        assert_eq!(log["level"], 40);
        assert_eq!(log["msg"], "Run aborted! smu exploded");
        assert_eq!(
            bus.retained(topics::STATUS),
            Some(serde_json::to_vec("Ready").unwrap())
        );
    }
}

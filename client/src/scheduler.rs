//! Adaptive scheduler deciding when a pass runs.
//!
//! The scheduler is a single-owner actor. [`SchedulerHandle`] sends it
//! commands over a channel, so triggers are handled strictly one at a time and
//! at most one pass is ever in flight.
//!
//! A trigger asks for a pass after a trigger-specific delay. While a pass is
//! already scheduled, a trigger only takes effect if it would fire earlier.
//! After a successful pass the next one is scheduled after the standard
//! interval; after a failed one the scheduler idles until the next trigger.

use crate::config::SchedulerConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use std::future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Why a pass is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// The app came to the foreground
    AppStart,
    /// The user changed local data
    LocalDataModified,
    /// Run as soon as possible
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Initialized,
    /// Waiting for the regular pass after a successful one
    RegularWait,
    Triggered(Trigger),
    WaitingForReply,
    Replied,
}

/// Snapshot of the scheduler's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    /// When the next pass fires, if one is scheduled
    pub expected_at: Option<Instant>,
    /// Trigger received while a pass was running
    pub queued: Option<Trigger>,
    /// Passes started so far
    pub runs: u64,
}

/// The work the scheduler runs.
#[async_trait]
pub trait SyncTask: Send + Sync + 'static {
    /// Run one pass and report whether it succeeded.
    async fn run(&self) -> bool;
}

#[derive(Debug)]
enum Command {
    Apply(Trigger),
    Stop,
    Status(oneshot::Sender<SchedulerStatus>),
}

/// Handle for driving the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Start the scheduler on the current tokio runtime.
    ///
    /// The actor runs until every handle is dropped.
    pub fn spawn(config: SchedulerConfig, task: Arc<dyn SyncTask>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        let scheduler = Scheduler::new(config, task);
        tokio::spawn(scheduler.run(command_rx));
        Self { command_tx }
    }

    /// Request a pass.
    pub async fn apply(&self, trigger: Trigger) -> Result<()> {
        self.command_tx
            .send(Command::Apply(trigger))
            .await
            .map_err(|_| SyncError::SchedulerStopped)
    }

    /// Cancel the scheduled pass and abort a running one.
    pub async fn stop(&self) -> Result<()> {
        self.command_tx
            .send(Command::Stop)
            .await
            .map_err(|_| SyncError::SchedulerStopped)
    }

    pub async fn status(&self) -> Result<SchedulerStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Status(reply_tx))
            .await
            .map_err(|_| SyncError::SchedulerStopped)?;
        reply_rx.await.map_err(|_| SyncError::SchedulerStopped)
    }
}

struct Scheduler {
    config: SchedulerConfig,
    task: Arc<dyn SyncTask>,
    state: SchedulerState,
    expected_at: Option<Instant>,
    queued: Option<(Trigger, Instant)>,
    runs: u64,
}

impl Scheduler {
    fn new(config: SchedulerConfig, task: Arc<dyn SyncTask>) -> Self {
        Self {
            config,
            task,
            state: SchedulerState::Initialized,
            expected_at: None,
            queued: None,
            runs: 0,
        }
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<Command>) {
        let mut in_flight: Option<JoinHandle<bool>> = None;

        loop {
            let deadline = self.deadline();
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => future::pending().await,
                }
            };
            let reply = async {
                match in_flight.as_mut() {
                    Some(handle) => handle.await,
                    None => future::pending().await,
                }
            };

            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        Command::Apply(trigger) => self.apply(trigger, Instant::now()),
                        Command::Stop => {
                            if let Some(handle) = in_flight.take() {
                                handle.abort();
                            }
                            self.stop();
                        }
                        Command::Status(reply_tx) => {
                            let _ = reply_tx.send(self.status());
                        }
                    }
                }
                () = timer => {
                    in_flight = Some(self.fire());
                }
                outcome = reply => {
                    in_flight = None;
                    let success = outcome.unwrap_or_else(|e| {
                        warn!(error = %e, "Sync task did not complete");
                        false
                    });
                    self.on_reply(success);
                }
            }
        }

        if let Some(handle) = in_flight {
            handle.abort();
        }
        debug!("Scheduler stopped");
    }

    /// When the armed timer fires, if one is armed.
    fn deadline(&self) -> Option<Instant> {
        match self.state {
            SchedulerState::RegularWait | SchedulerState::Triggered(_) => self.expected_at,
            _ => None,
        }
    }

    fn apply(&mut self, trigger: Trigger, now: Instant) {
        let requested = now + self.config.delay(trigger);

        if self.state == SchedulerState::WaitingForReply {
            match self.queued {
                Some((_, queued_at)) if queued_at <= requested => {
                    debug!(?trigger, "Later trigger ignored while a pass is running");
                }
                _ => {
                    debug!(?trigger, "Trigger queued until the running pass replies");
                    self.queued = Some((trigger, requested));
                }
            }
            return;
        }

        if let Some(expected) = self.deadline() {
            if requested >= expected {
                debug!(?trigger, "Trigger ignored, an earlier pass is already scheduled");
                return;
            }
        }

        info!(?trigger, delay_secs = self.config.delay(trigger).as_secs(), "Pass scheduled");
        self.expected_at = Some(requested);
        self.state = SchedulerState::Triggered(trigger);
    }

    fn fire(&mut self) -> JoinHandle<bool> {
        self.state = SchedulerState::WaitingForReply;
        self.expected_at = None;
        self.runs += 1;
        info!(run = self.runs, "Starting sync pass");

        let task = Arc::clone(&self.task);
        tokio::spawn(async move { task.run().await })
    }

    fn on_reply(&mut self, success: bool) {
        self.state = SchedulerState::Replied;
        if success {
            self.expected_at = Some(Instant::now() + self.config.standard_interval);
            self.state = SchedulerState::RegularWait;
        } else {
            warn!("Sync pass failed, waiting for the next trigger");
            self.expected_at = None;
        }

        if let Some((trigger, requested)) = self.queued.take() {
            // The queued trigger keeps the firing time it asked for on arrival
            let arrived = requested - self.config.delay(trigger);
            self.apply(trigger, arrived);
        }
    }

    fn stop(&mut self) {
        info!("Scheduler stopped by request");
        self.state = SchedulerState::Initialized;
        self.expected_at = None;
        self.queued = None;
    }

    fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            state: self.state,
            expected_at: self.expected_at,
            queued: self.queued.map(|(trigger, _)| trigger),
            runs: self.runs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct Counting(AtomicU64);

    #[async_trait]
    impl SyncTask for Counting {
        async fn run(&self) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn scheduler() -> Scheduler {
        let config = SchedulerConfig::from_secs(30, 60, 5).unwrap();
        Scheduler::new(config, Arc::new(Counting(AtomicU64::new(0))))
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_trigger_wins() {
        let mut s = scheduler();
        let now = Instant::now();
        s.apply(Trigger::AppStart, now);
        assert_eq!(s.expected_at, Some(now + Duration::from_secs(30)));

        s.apply(Trigger::LocalDataModified, now);
        assert_eq!(s.expected_at, Some(now + Duration::from_secs(5)));
        assert_eq!(s.state, SchedulerState::Triggered(Trigger::LocalDataModified));

        s.apply(Trigger::AppStart, now);
        assert_eq!(s.expected_at, Some(now + Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_trigger_keeps_its_arrival_time() {
        let mut s = scheduler();
        let now = Instant::now();
        s.state = SchedulerState::WaitingForReply;
        s.apply(Trigger::LocalDataModified, now);
        s.apply(Trigger::AppStart, now);
        assert_eq!(s.queued, Some((Trigger::LocalDataModified, now + Duration::from_secs(5))));

        s.on_reply(true);
        assert_eq!(s.state, SchedulerState::Triggered(Trigger::LocalDataModified));
        assert_eq!(s.expected_at, Some(now + Duration::from_secs(5)));
        assert_eq!(s.queued, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_clears_schedule() {
        let mut s = scheduler();
        s.state = SchedulerState::WaitingForReply;
        s.on_reply(false);
        assert_eq!(s.state, SchedulerState::Replied);
        assert_eq!(s.expected_at, None);
        assert_eq!(s.deadline(), None);
    }
}

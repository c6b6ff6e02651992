//! FIFO job sequencing over a single background runner.
//!
//! The sequencer owns one [`BackgroundRunner`] and drives queued jobs through
//! it, one step at a time. Its loop waits on the work queue with a bounded
//! poll interval and, once per iteration, checks whether the active step's
//! process has died; exit notification is deliberately poll-based, which adds
//! at most one interval of latency to a step transition, negligible against
//! encodes that run for minutes.
//!
//! Terminal outcomes are reported on the status queue: `Converted` per job,
//! `Error` (which halts and empties the queue), `Cancelled`, `Complete` when
//! the queue drains, and `Exit` when the sequencer stops.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::power::SleepInhibitor;
use crate::runner::background::{BackgroundRunner, RunnerConfig};
use crate::runner::output::LogLine;

use super::job::{Job, Step, StepCommand};
use super::messages::{StatusEvent, WorkRequest};

const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Sequencer tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Work-queue poll interval; also bounds step-transition latency.
    pub poll_interval_ms: u64,
    pub runner: RunnerConfig,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            runner: RunnerConfig::default(),
        }
    }
}

impl SequencerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Where the sequencer currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    /// No job running, waiting for work.
    Idle,
    /// A step's process is live.
    Running,
    /// The current step finished; deciding what runs next.
    StepTransition,
}

struct ActiveJob {
    video_id: String,
    command_id: String,
    work_dir: Option<PathBuf>,
    remaining: VecDeque<Step>,
}

impl ActiveJob {
    fn from_job(job: Job) -> Self {
        Self {
            video_id: job.video_id,
            command_id: job.command_id,
            work_dir: job.work_dir,
            remaining: job.steps.into(),
        }
    }
}

/// Drives queued jobs through a background runner, step by step.
pub struct JobSequencer {
    config: SequencerConfig,
    runner: BackgroundRunner,
    work_rx: mpsc::UnboundedReceiver<WorkRequest>,
    status_tx: mpsc::UnboundedSender<StatusEvent>,
    sleep_inhibitor: Arc<dyn SleepInhibitor>,
    shutdown_token: CancellationToken,
    pending: VecDeque<Job>,
    active: Option<ActiveJob>,
    state: SequencerState,
}

impl JobSequencer {
    pub fn new(
        config: SequencerConfig,
        work_rx: mpsc::UnboundedReceiver<WorkRequest>,
        status_tx: mpsc::UnboundedSender<StatusEvent>,
        log_tx: mpsc::UnboundedSender<LogLine>,
        sleep_inhibitor: Arc<dyn SleepInhibitor>,
    ) -> Self {
        let runner = BackgroundRunner::new(config.runner.clone(), log_tx);
        Self {
            config,
            runner,
            work_rx,
            status_tx,
            sleep_inhibitor,
            shutdown_token: CancellationToken::new(),
            pending: VecDeque::new(),
            active: None,
            state: SequencerState::Idle,
        }
    }

    /// Token that stops the run loop; grab a clone before spawning [`run`].
    ///
    /// [`run`]: Self::run
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Main loop. Runs until the shutdown token fires, the work channel
    /// closes, or the status channel is gone, then reports `Exit`.
    pub async fn run(mut self) {
        info!("Job sequencer started");
        loop {
            let keep_running = tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => {
                    debug!("Shutdown requested");
                    false
                }
                request = self.work_rx.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => {
                        debug!("Work channel closed");
                        false
                    }
                },
                _ = tokio::time::sleep(self.config.poll_interval()) => true,
            };
            if !keep_running {
                break;
            }
            if !self.poll_active().await {
                break;
            }
        }
        self.shutdown().await;
    }

    async fn handle_request(&mut self, request: WorkRequest) -> bool {
        match request {
            WorkRequest::AddItems { work_dir, jobs } => {
                info!(count = jobs.len(), "Queueing jobs");
                self.runner.set_scratch_dir(work_dir);
                for job in jobs {
                    if job.steps.is_empty() {
                        warn!(video_id = %job.video_id, "Ignoring job with no steps");
                        continue;
                    }
                    self.pending.push_back(job);
                }
                if self.active.is_none() && !self.pending.is_empty() {
                    return self.start_next_job().await;
                }
                true
            }
            WorkRequest::Cancel => self.cancel_active().await,
            WorkRequest::Pause => {
                match self.runner.pause() {
                    Ok(()) => info!("Paused active encoding step"),
                    Err(e) => warn!(error = %e, "Unable to pause"),
                }
                true
            }
            WorkRequest::Resume => {
                match self.runner.resume() {
                    Ok(()) => info!("Resumed active encoding step"),
                    Err(e) => warn!(error = %e, "Unable to resume"),
                }
                true
            }
        }
    }

    /// Check the active step once; if its process died, classify the outcome
    /// and advance.
    async fn poll_active(&mut self) -> bool {
        if self.runner.is_alive() {
            return true;
        }
        let Some(mut active) = self.active.take() else {
            return true;
        };
        self.state = SequencerState::StepTransition;
        // Let the reader finish its final drain before reading the flags, or
        // a failure written in the process's last instant could be missed.
        self.runner.settle_output().await;
        let exit_code = self.runner.exit_status().and_then(|status| status.code());

        if self.runner.error_detected() {
            warn!(video_id = %active.video_id, code = ?exit_code, "Encoding step failed");
            return self.fail_job(active.video_id, active.command_id).await;
        }

        debug!(video_id = %active.video_id, code = ?exit_code, "Step finished");
        active.remaining.pop_front();

        if !active.remaining.is_empty() {
            return match self.launch_front_step(&active).await {
                Ok(()) => {
                    self.active = Some(active);
                    self.state = SequencerState::Running;
                    true
                }
                Err(e) => {
                    warn!(video_id = %active.video_id, error = %e, "Failed to start next step");
                    self.fail_job(active.video_id, active.command_id).await
                }
            };
        }

        // Last step done with nothing flagged: the job converted. Clean
        // first so the log channel is fully drained before the status lands.
        self.runner.clean().await;
        info!(video_id = %active.video_id, "Job converted");
        if !self.emit(StatusEvent::Converted {
            video_id: active.video_id,
            command_id: active.command_id,
        }) {
            return false;
        }
        self.start_next_job().await
    }

    /// Pop the next pending job and start its first step; with nothing left,
    /// report `Complete` and go idle.
    async fn start_next_job(&mut self) -> bool {
        let Some(job) = self.pending.pop_front() else {
            info!("Queue drained");
            self.enter_idle();
            return self.emit(StatusEvent::Complete);
        };
        info!(video_id = %job.video_id, command_id = %job.command_id, "Starting job");
        self.sleep_inhibitor.prevent_sleep();

        let active = ActiveJob::from_job(job);
        match self.launch_front_step(&active).await {
            Ok(()) => {
                self.active = Some(active);
                self.state = SequencerState::Running;
                true
            }
            Err(e) => {
                warn!(video_id = %active.video_id, error = %e, "Failed to start job");
                self.fail_job(active.video_id, active.command_id).await
            }
        }
    }

    async fn launch_front_step(&mut self, active: &ActiveJob) -> Result<()> {
        let Some(step) = active.remaining.front() else {
            return Err(Error::config("Job has no steps left to run"));
        };
        let work_dir = step.work_dir.as_deref().or(active.work_dir.as_deref());
        match &step.command {
            StepCommand::Single { command, shell } => {
                self.runner
                    .start_exec(
                        command,
                        work_dir,
                        *shell,
                        step.error_markers.clone(),
                        step.success_markers.clone(),
                    )
                    .await
            }
            StepCommand::Piped { primary, secondary } => {
                self.runner
                    .start_piped_exec(
                        primary,
                        secondary,
                        work_dir,
                        step.error_markers.clone(),
                        step.success_markers.clone(),
                    )
                    .await
            }
        }
    }

    /// Kill the active job, drop the queue, and report `Cancelled` for the
    /// job that was active.
    async fn cancel_active(&mut self) -> bool {
        self.pending.clear();
        let Some(active) = self.active.take() else {
            debug!("Cancel received with no active job");
            return true;
        };
        info!(video_id = %active.video_id, "Cancelling active job");
        self.runner.kill();
        self.runner.clean().await;
        self.enter_idle();
        self.emit(StatusEvent::Cancelled {
            video_id: active.video_id,
            command_id: active.command_id,
        })
    }

    /// A job failed: halt, empty the queue, and report `Error`.
    async fn fail_job(&mut self, video_id: String, command_id: String) -> bool {
        self.runner.clean().await;
        self.pending.clear();
        self.enter_idle();
        self.emit(StatusEvent::Error {
            video_id,
            command_id,
        })
    }

    fn enter_idle(&mut self) {
        self.state = SequencerState::Idle;
        self.sleep_inhibitor.allow_sleep();
    }

    fn emit(&self, event: StatusEvent) -> bool {
        if self.status_tx.send(event).is_err() {
            warn!("Status channel closed, shutting down");
            return false;
        }
        true
    }

    async fn shutdown(&mut self) {
        if let Some(active) = self.active.take() {
            info!(video_id = %active.video_id, "Stopping active job for shutdown");
            self.runner.kill();
        }
        self.runner.clean().await;
        self.enter_idle();
        let _ = self.status_tx.send(StatusEvent::Exit);
        info!("Job sequencer stopped");
    }
}

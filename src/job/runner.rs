//! Streams a parsed program block by block with pause/resume, stop,
//! auto-save and post-crash resume.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Local;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::controller::events::Event;
use crate::controller::Controller;
use crate::error::HostError;
use crate::gcode::{self, display::render_block};
use crate::geometry::Position;
use crate::util::push_bounded;

use super::state::{JobState, StateSink};
use super::{ExecutionStats, Job, JobId, JobOptions, JobStatus};

pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(10);
pub const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(60);
pub const JOB_HISTORY_CAPACITY: usize = 100;
const BLOCK_RETRY_BASE: Duration = Duration::from_millis(500);
const RESUME_DESCENT_FEED: f64 = 200.0;

/// Fixed preamble sent before the first block of a fresh run. Not replayed
/// on post-crash resume.
pub const JOB_PREAMBLE: [&str; 4] = ["G0 Z20 F500", "G90", "G21", "G92 X0 Y0 Z0"];

enum RunOutcome {
    Completed,
    Failed(String),
    Stopped,
}

struct RunControl {
    pause: watch::Sender<bool>,
    stop: Arc<AtomicBool>,
    autosave: JoinHandle<()>,
}

struct RunnerInner {
    current: Option<Job>,
    queue: VecDeque<Job>,
    history: VecDeque<Job>,
    control: Option<RunControl>,
    last_saved: Option<JobState>,
}

pub struct JobRunner {
    controller: Arc<Controller>,
    sink: Arc<dyn StateSink>,
    inner: Mutex<RunnerInner>,
    next_id: AtomicU64,
}

impl JobRunner {
    pub fn new(controller: Arc<Controller>, sink: Arc<dyn StateSink>) -> Arc<JobRunner> {
        Arc::new(JobRunner {
            controller,
            sink,
            inner: Mutex::new(RunnerInner {
                current: None,
                queue: VecDeque::new(),
                history: VecDeque::new(),
                control: None,
                last_saved: None,
            }),
            next_id: AtomicU64::new(0),
        })
    }

    /// Parse and stage a job. With `strict` the first parse error fails the
    /// load; otherwise problems ride along as block-level errors.
    pub fn load_job(
        &self,
        name: &str,
        source: &str,
        options: JobOptions,
    ) -> Result<JobId, HostError> {
        let parse = gcode::parse(source);
        if options.strict {
            if let Some(first) = parse.errors.first() {
                return Err(HostError::InvalidGCode(first.to_string()));
            }
        }
        let safety = gcode::check_safety(
            &parse.blocks,
            self.controller.soft_limits(),
            self.controller.speed_limits(),
        );
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let job = Job {
            id,
            name: name.to_string(),
            source: source.to_string(),
            parse,
            safety,
            progress_percent: 0.0,
            status: JobStatus::Ready,
            options,
            created_at: Local::now(),
            started_at: None,
            finished_at: None,
            stats: ExecutionStats::default(),
            pause_position: None,
        };
        let mut inner = self.inner.lock().unwrap();
        if inner.current.is_none() {
            inner.current = Some(job);
        } else {
            inner.queue.push_back(job);
        }
        Ok(id)
    }

    /// Start the staged job from the top, preamble included.
    pub fn start_job(self: &Arc<Self>) -> Result<JobId, HostError> {
        self.begin(0, true)
    }

    fn begin(self: &Arc<Self>, start_index: usize, replay_preamble: bool) -> Result<JobId, HostError> {
        let controller = &self.controller;
        if !controller.is_connected() {
            return Err(HostError::ConnectionFailed("not connected".to_string()));
        }
        if controller.machine_state().is_alarm() {
            return Err(HostError::MachineNotReady("machine is in alarm state".to_string()));
        }
        let (job_id, pause_rx, stop) = {
            let mut inner = self.inner.lock().unwrap();
            let job = inner
                .current
                .as_mut()
                .ok_or_else(|| HostError::MachineNotReady("no job loaded".to_string()))?;
            if job.status.is_active() {
                return Err(HostError::MachineNotReady("a job is already running".to_string()));
            }
            if job.options.require_homed && !controller.is_homed() {
                return Err(HostError::MachineNotReady(
                    "machine must be homed before running a job".to_string(),
                ));
            }
            let hull = job.parse.bounding_box;
            if !controller.soft_limits().contains(&hull.min)
                || !controller.soft_limits().contains(&hull.max)
            {
                controller.events().emit(Event::Warning(
                    "job bounding box reaches outside the soft envelope".to_string(),
                ));
            }
            job.status = JobStatus::Running;
            job.started_at = Some(Local::now());
            let job_id = job.id;
            let (pause, pause_rx) = watch::channel(false);
            let stop = Arc::new(AtomicBool::new(false));
            let autosave = tokio::spawn(run_autosave(Arc::downgrade(self)));
            inner.control = Some(RunControl { pause, stop: stop.clone(), autosave });
            (job_id, pause_rx, stop)
        };
        let runner = self.clone();
        tokio::spawn(async move {
            let outcome =
                runner.stream_blocks(job_id, start_index, replay_preamble, pause_rx, stop).await;
            runner.finish_job(job_id, outcome).await;
        });
        Ok(job_id)
    }

    /// Convenience: stage and immediately start a program.
    pub fn stream_gcode(self: &Arc<Self>, source: &str) -> Result<JobId, HostError> {
        let id = self.load_job("stream", source, JobOptions::default())?;
        let is_current =
            self.inner.lock().unwrap().current.as_ref().map(|job| job.id) == Some(id);
        if is_current {
            self.start_job()?;
        }
        Ok(id)
    }

    /// Feed-hold and mark Paused. Only a running job can pause.
    pub async fn pause_job(&self) -> Result<(), HostError> {
        {
            let mut inner = self.inner.lock().unwrap();
            let pause_position = self.controller.expected_position();
            let job = inner
                .current
                .as_mut()
                .ok_or_else(|| HostError::MachineNotReady("no active job".to_string()))?;
            if job.status != JobStatus::Running {
                return Err(HostError::MachineNotReady("job is not running".to_string()));
            }
            job.status = JobStatus::Paused;
            job.pause_position = Some(pause_position);
            if let Some(control) = inner.control.as_ref() {
                drop(control.pause.send(true));
            }
        }
        self.controller.feed_hold().await
    }

    /// Cycle-start and mark Running. Only a paused job can resume.
    pub async fn resume_job(&self) -> Result<(), HostError> {
        {
            let mut inner = self.inner.lock().unwrap();
            let job = inner
                .current
                .as_mut()
                .ok_or_else(|| HostError::MachineNotReady("no active job".to_string()))?;
            if job.status != JobStatus::Paused {
                return Err(HostError::MachineNotReady("job is not paused".to_string()));
            }
            job.status = JobStatus::Running;
            if let Some(control) = inner.control.as_ref() {
                drop(control.pause.send(false));
            }
        }
        self.controller.cycle_resume().await
    }

    /// Stop the current job: feed-hold plus soft reset, or an emergency
    /// stop. The streaming task observes the cancellation and finishes the
    /// job as Stopped.
    pub async fn stop_job(&self, emergency: bool) -> Result<(), HostError> {
        let state = {
            let mut inner = self.inner.lock().unwrap();
            let expected = self.controller.expected_position();
            let machine_state = self.controller.machine_state();
            let job = inner
                .current
                .as_mut()
                .ok_or_else(|| HostError::MachineNotReady("no active job".to_string()))?;
            if !job.status.is_active() {
                return Err(HostError::MachineNotReady("job is not running".to_string()));
            }
            if job.pause_position.is_none() {
                job.pause_position = Some(expected);
            }
            let state = snapshot_state(job, machine_state.name());
            if let Some(control) = inner.control.as_ref() {
                control.stop.store(true, Ordering::SeqCst);
                drop(control.pause.send(false));
            }
            inner.last_saved = Some(state.clone());
            state
        };
        self.sink.save(&state.crash_filename(), &state).await?;
        if emergency {
            self.controller.emergency_stop().await;
        } else {
            self.controller.feed_hold().await?;
            self.controller.soft_reset().await?;
        }
        Ok(())
    }

    /// Pick up after a stop, failure or crash: clear the alarm, return to
    /// the saved coordinates, and restart from the estimated block index.
    /// The preamble is not replayed.
    pub async fn resume_after_crash(self: &Arc<Self>) -> Result<JobId, HostError> {
        let saved = {
            let inner = self.inner.lock().unwrap();
            inner.last_saved.clone()
        };
        let state = match saved {
            Some(state) => state,
            None => self
                .sink
                .load_latest(None)
                .await?
                .ok_or_else(|| HostError::MachineNotReady("no saved job state".to_string()))?,
        };
        {
            let mut inner = self.inner.lock().unwrap();
            let current_matches =
                inner.current.as_ref().map(|job| job.id) == Some(state.job_id);
            if !current_matches {
                let index = inner
                    .history
                    .iter()
                    .position(|job| job.id == state.job_id)
                    .ok_or_else(|| {
                        HostError::MachineNotReady(format!(
                            "job {} is no longer available",
                            state.job_id
                        ))
                    })?;
                let mut job = inner.history.remove(index).unwrap();
                job.status = JobStatus::Ready;
                if let Some(active) = inner.current.take() {
                    inner.queue.push_front(active);
                }
                inner.current = Some(job);
            } else if let Some(job) = inner.current.as_mut() {
                job.status = JobStatus::Ready;
            }
        }
        let pause = state.pause_position.unwrap_or(Position::ZERO);
        let clearance = pause.z + 10.0;
        // Unlock before moving: a machine that crashed into an alarm
        // rejects motion until `$X` goes through. Only then raise clear of
        // the work, travel back over the crash point, and descend.
        self.controller.clear_alarm().await?;
        self.controller.send(&format!("G0 Z{}", fmt(clearance)), Some(BLOCK_TIMEOUT)).await?;
        self.controller
            .send(&format!("G0 X{} Y{}", fmt(pause.x), fmt(pause.y)), Some(BLOCK_TIMEOUT))
            .await?;
        self.controller
            .send(
                &format!("G1 Z{} F{}", fmt(pause.z), fmt(RESUME_DESCENT_FEED)),
                Some(BLOCK_TIMEOUT),
            )
            .await?;
        self.begin(resume_index(state.progress_percent, state.total_blocks), false)
    }

    pub fn get_current_job(&self) -> Option<Job> {
        self.inner.lock().unwrap().current.clone()
    }

    pub fn get_job_queue(&self) -> Vec<Job> {
        self.inner.lock().unwrap().queue.iter().cloned().collect()
    }

    pub fn get_job_history(&self) -> Vec<Job> {
        self.inner.lock().unwrap().history.iter().cloned().collect()
    }

    pub fn get_execution_stats(&self) -> Option<ExecutionStats> {
        let inner = self.inner.lock().unwrap();
        inner
            .current
            .as_ref()
            .map(|job| job.stats)
            .or_else(|| inner.history.back().map(|job| job.stats))
    }

    async fn stream_blocks(
        self: &Arc<Self>,
        job_id: JobId,
        start_index: usize,
        replay_preamble: bool,
        mut pause_rx: watch::Receiver<bool>,
        stop: Arc<AtomicBool>,
    ) -> RunOutcome {
        let controller = &self.controller;
        let (blocks, options, mut stats) = {
            let inner = self.inner.lock().unwrap();
            match inner.current.as_ref().filter(|job| job.id == job_id) {
                Some(job) => (job.parse.blocks.clone(), job.options.clone(), job.stats),
                None => return RunOutcome::Stopped,
            }
        };
        let total = blocks.len();
        if replay_preamble {
            for line in JOB_PREAMBLE.iter().map(|s| s.to_string()).chain(options.pre_job_commands.iter().cloned()) {
                if stop.load(Ordering::SeqCst) {
                    return RunOutcome::Stopped;
                }
                if let Err(error) = controller.send(&line, Some(BLOCK_TIMEOUT)).await {
                    if stop.load(Ordering::SeqCst) {
                        return RunOutcome::Stopped;
                    }
                    return RunOutcome::Failed(format!("preamble failed: {}", error));
                }
            }
        }
        for (index, block) in blocks.iter().enumerate().skip(start_index) {
            if stop.load(Ordering::SeqCst) {
                return RunOutcome::Stopped;
            }
            while *pause_rx.borrow() {
                if pause_rx.changed().await.is_err() || stop.load(Ordering::SeqCst) {
                    return RunOutcome::Stopped;
                }
            }
            if !block.valid {
                warn!(line = block.line_number, "skipping invalid block");
                stats.skipped += 1;
                continue;
            }
            let text = render_block(block);
            if text.is_empty() {
                continue;
            }
            let mut attempt = 0u8;
            loop {
                match controller.send(&text, Some(BLOCK_TIMEOUT)).await {
                    Ok(_) => {
                        stats.blocks_executed += 1;
                        break;
                    }
                    Err(error) => {
                        if stop.load(Ordering::SeqCst) || error == HostError::Cancelled {
                            return RunOutcome::Stopped;
                        }
                        stats.errors += 1;
                        if options.stop_on_error {
                            self.store_stats(job_id, &stats, None);
                            return RunOutcome::Failed(format!(
                                "block {} failed: {}",
                                block.line_number, error
                            ));
                        }
                        if options.retry_on_error && attempt < options.retry_count {
                            attempt += 1;
                            stats.retries += 1;
                            sleep(BLOCK_RETRY_BASE * attempt as u32).await;
                            continue;
                        }
                        warn!(line = block.line_number, %error, "skipping failed block");
                        stats.skipped += 1;
                        break;
                    }
                }
            }
            let percent = (index + 1) as f64 / total.max(1) as f64 * 100.0;
            self.store_stats(job_id, &stats, Some(percent));
            controller.events().emit(Event::JobProgress {
                job_id,
                percent,
                blocks_executed: stats.blocks_executed,
                total_blocks: total,
            });
        }
        RunOutcome::Completed
    }

    fn store_stats(&self, job_id: JobId, stats: &ExecutionStats, percent: Option<f64>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.current.as_mut().filter(|job| job.id == job_id) {
            job.stats = *stats;
            if let Some(percent) = percent {
                job.progress_percent = percent;
            }
        }
    }

    async fn finish_job(self: &Arc<Self>, job_id: JobId, outcome: RunOutcome) {
        let (status, crash_state) = {
            let mut inner = self.inner.lock().unwrap();
            let machine_state = self.controller.machine_state();
            let expected = self.controller.expected_position();
            if inner.current.as_ref().map(|job| job.id) != Some(job_id) {
                return;
            }
            if let Some(control) = inner.control.take() {
                control.autosave.abort();
            }
            let mut job = inner.current.take().unwrap();
            job.finished_at = Some(Local::now());
            job.status = match outcome {
                RunOutcome::Completed => JobStatus::Completed,
                RunOutcome::Failed(ref reason) => {
                    warn!(job_id, reason = %reason, "job failed");
                    JobStatus::Failed
                }
                RunOutcome::Stopped => JobStatus::Stopped,
            };
            if job.pause_position.is_none() {
                job.pause_position = Some(expected);
            }
            let status = job.status;
            let crash_state = if status == JobStatus::Completed {
                None
            } else {
                let state = snapshot_state(&job, machine_state.name());
                inner.last_saved = Some(state.clone());
                Some(state)
            };
            push_bounded(&mut inner.history, JOB_HISTORY_CAPACITY, job);
            if let Some(next) = inner.queue.pop_front() {
                inner.current = Some(next);
            }
            (status, crash_state)
        };
        if let Some(state) = crash_state {
            if let Err(error) = self.sink.save(&state.crash_filename(), &state).await {
                warn!(%error, "failed to persist crash state");
            }
        }
        debug!(job_id, ?status, "job finished");
        self.controller.events().emit(Event::JobComplete { job_id, status });
    }
}

fn snapshot_state(job: &Job, machine_state: &str) -> JobState {
    JobState {
        job_id: job.id,
        name: job.name.clone(),
        progress_percent: job.progress_percent,
        status: job.status,
        paused: job.status == JobStatus::Paused,
        pause_position: job.pause_position,
        last_machine_state: Some(machine_state.to_string()),
        blocks_executed: job.stats.blocks_executed,
        total_blocks: job.total_blocks(),
        errors: job.stats.errors,
        retries: job.stats.retries,
        saved_at: Local::now(),
    }
}

async fn run_autosave(runner: Weak<JobRunner>) {
    loop {
        sleep(AUTOSAVE_INTERVAL).await;
        let Some(runner) = runner.upgrade() else { return };
        let state = {
            let inner = runner.inner.lock().unwrap();
            let machine_state = runner.controller.machine_state();
            inner
                .current
                .as_ref()
                .filter(|job| job.status.is_active())
                .map(|job| snapshot_state(job, machine_state.name()))
        };
        match state {
            Some(state) => {
                if let Err(error) = runner.sink.save(&state.autosave_filename(), &state).await {
                    warn!(%error, "autosave failed");
                }
                runner.inner.lock().unwrap().last_saved = Some(state);
            }
            None => return,
        }
    }
}

fn fmt(value: f64) -> String {
    crate::gcode::display::format_value(value)
}

/// `floor(progress% x total)`, nudged so a progress figure that came from
/// an exact block count does not round down through float noise.
fn resume_index(progress_percent: f64, total_blocks: usize) -> usize {
    ((progress_percent / 100.0) * total_blocks as f64 + 1e-6).floor() as usize
}

//! Facade over the link, the command queue and the validator. Owns the
//! machine model: reported state, expected position, alarm bookkeeping and
//! the command journal.

pub mod events;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::command_queue::{Command, CommandQueue, CommandResponse, DEFAULT_COMMAND_TIMEOUT};
use crate::config::{HostConfig, SoftLimits, SpeedLimits, POSITION_TOLERANCE_MM};
use crate::error::HostError;
use crate::gcode::parser::scan_words;
use crate::geometry::{Axis, Position};
use crate::grbl::{self, parser::parse_line, GrblMessage, MachineState, StatusReport};
use crate::safety::{SafetyValidator, Validation};
use crate::sequence::homing::{HomingResult, HomingSequencer};
use crate::sequence::jog::{JogRequest, JogResult, JoggingSequencer};
use crate::sequence::probe::{GridProbeOptions, GridProbeResult, ProbeOutcome, ProbingSequencer};
use crate::transport::{Link, LinkEvent, Transport};
use crate::util::push_bounded;
use events::{Event, EventBus};

pub const JOURNAL_CAPACITY: usize = 1000;
const STATUS_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// One journalled outgoing command, kept for diagnosis.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub command: String,
    pub timestamp: DateTime<Local>,
    pub expected_delta: Option<Position>,
}

/// Decoded machine status at a point in time.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub state: MachineState,
    pub machine_position: Position,
    pub feed: Option<f64>,
    pub spindle: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DistanceMode {
    Absolute,
    Incremental,
}

struct ControllerState {
    machine_state: MachineState,
    last_known: Option<Position>,
    expected: Position,
    last_alarm_code: Option<u8>,
    distance_mode: DistanceMode,
    homed: bool,
    journal: VecDeque<JournalEntry>,
}

impl ControllerState {
    fn new() -> ControllerState {
        ControllerState {
            machine_state: MachineState::Disconnected,
            last_known: None,
            expected: Position::ZERO,
            last_alarm_code: None,
            distance_mode: DistanceMode::Absolute,
            homed: false,
            journal: VecDeque::new(),
        }
    }
}

pub struct Controller {
    link: Arc<Link>,
    queue: CommandQueue,
    validator: SafetyValidator,
    events: EventBus,
    state: Mutex<ControllerState>,
    jog_active: AtomicBool,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    config: HostConfig,
}

impl Controller {
    /// Open the transport and wire the event pump. Resolves once the link
    /// reports connected; fails after the configured connect timeout.
    pub async fn connect(
        transport: Box<dyn Transport>,
        config: HostConfig,
    ) -> Result<Arc<Controller>, HostError> {
        let (link, link_events) = Link::spawn(transport);
        let link = Arc::new(link);
        let queue = CommandQueue::spawn(link.clone());
        let controller = Arc::new(Controller {
            validator: SafetyValidator::new(config.soft_limits, config.speed_limits),
            link,
            queue,
            events: EventBus::new(),
            state: Mutex::new(ControllerState::new()),
            jog_active: AtomicBool::new(false),
            poll_task: Mutex::new(None),
            config,
        });
        let mut host_events = controller.events.subscribe();
        tokio::spawn(run_event_pump(Arc::downgrade(&controller), link_events));
        let deadline = Instant::now() + controller.config.connect_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, host_events.recv()).await {
                Ok(Ok(Event::Connected)) => return Ok(controller),
                Ok(Ok(_)) => {}
                Ok(Err(_)) => {
                    return Err(HostError::ConnectionFailed("event pump stopped".to_string()))
                }
                Err(_) => return Err(HostError::ConnectionTimeout),
            }
        }
    }

    /// Validate, account and dispatch one line. Safety rejections surface
    /// synchronously; warnings are forwarded as events and do not block.
    pub async fn send(
        &self,
        line: &str,
        command_timeout: Option<Duration>,
    ) -> Result<CommandResponse, HostError> {
        let text = line.trim().to_string();
        let current = self.expected_position();
        match self.validator.validate(&text, &current) {
            Validation::Invalid(message) => return Err(HostError::SafetyViolation(message)),
            Validation::Warn(message) => self.events.emit(Event::Warning(message)),
            Validation::Valid => {}
        }
        self.track_outgoing(&text);
        let command = Command::new(text.as_str())
            .with_timeout(command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT));
        self.queue.execute_command(command).await
    }

    /// Issue a status query and decode the reply.
    pub async fn get_status(&self) -> Result<StatusSnapshot, HostError> {
        let response = self.queue.execute("?", STATUS_QUERY_TIMEOUT).await?;
        let report = response
            .status_report()
            .ok_or_else(|| HostError::HardwareError("no status report in reply".to_string()))?;
        Ok(self.record_status(&report))
    }

    /// Best-effort recurring status query. Errors are swallowed; reports
    /// flow to subscribers through the event pump.
    pub fn start_status_polling(self: &Arc<Self>, poll_interval: Option<Duration>) {
        let mut task = self.poll_task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let period = poll_interval.unwrap_or(self.config.poll_interval);
        let controller = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(controller) = controller.upgrade() else { return };
                if controller.link.is_connected() {
                    let _ = controller.get_status().await;
                }
            }
        }));
    }

    pub fn stop_status_polling(&self) {
        if let Some(task) = self.poll_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Poll until the machine settles in `Idle`. Fails fast on an alarm.
    pub async fn wait_for_idle(
        &self,
        poll_interval: Duration,
        wait_timeout: Duration,
    ) -> Result<(), HostError> {
        let deadline = Instant::now() + wait_timeout;
        loop {
            let snapshot = self.get_status().await?;
            match snapshot.state {
                MachineState::Idle => return Ok(()),
                MachineState::Alarm(code) => {
                    return Err(HostError::HardwareError(match code {
                        Some(code) => format!("alarm {} while waiting for idle", code),
                        None => "alarm while waiting for idle".to_string(),
                    }))
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(HostError::CommandTimeout("wait for idle".to_string()));
            }
            sleep(poll_interval).await;
        }
    }

    /// Realtime feed hold (`!`), bypassing the queue.
    pub async fn feed_hold(&self) -> Result<(), HostError> {
        self.link.send_raw(b'!').await?;
        self.events.emit(Event::FeedHold);
        Ok(())
    }

    /// Realtime cycle start / resume (`~`), bypassing the queue.
    pub async fn cycle_resume(&self) -> Result<(), HostError> {
        self.link.send_raw(b'~').await
    }

    /// Hard stop: realtime reset, then cancel everything queued. Never
    /// fails; a dead link cannot make an emergency stop worse.
    pub async fn emergency_stop(&self) {
        if let Err(error) = self.link.send_raw(0x18).await {
            warn!(%error, "emergency stop write failed");
        }
        self.queue.clear().await;
        self.events.emit(Event::EmergencyStop);
    }

    /// Reset the firmware, give it a second to come back, then cancel the
    /// queue so stale commands cannot fire into the fresh session.
    pub async fn soft_reset(&self) -> Result<(), HostError> {
        self.link.send_raw(0x18).await?;
        sleep(Duration::from_secs(1)).await;
        self.queue.clear().await;
        self.events.emit(Event::SoftReset);
        Ok(())
    }

    /// `$$` settings dump, decoded into an index→value map.
    pub async fn get_settings(&self) -> Result<BTreeMap<u16, f64>, HostError> {
        let response = self.send("$$", None).await?;
        let mut settings = BTreeMap::new();
        for line in &response.lines {
            if let GrblMessage::Setting { index, value } = parse_line(line) {
                settings.insert(index, value);
            }
        }
        Ok(settings)
    }

    /// `$I` build info: the bracketed feedback lines, unwrapped.
    pub async fn get_version(&self) -> Result<Vec<String>, HostError> {
        let response = self.send("$I", None).await?;
        Ok(response
            .lines
            .iter()
            .filter_map(|line| match parse_line(line) {
                GrblMessage::Feedback(text) => Some(text),
                _ => None,
            })
            .collect())
    }

    /// `$C` check-mode toggle.
    pub async fn toggle_check_mode(&self) -> Result<CommandResponse, HostError> {
        self.send("$C", None).await
    }

    /// `$X` unlock.
    pub async fn clear_alarm(&self) -> Result<CommandResponse, HostError> {
        let response = self.send("$X", None).await?;
        let mut state = self.state.lock().unwrap();
        state.last_alarm_code = None;
        if state.machine_state.is_alarm() {
            state.machine_state = MachineState::Idle;
        }
        Ok(response)
    }

    pub async fn home(&self, axes: Option<&[Axis]>) -> HomingResult {
        HomingSequencer::new(self).run(axes).await
    }

    pub async fn jog(&self, request: JogRequest, feed: f64) -> Result<JogResult, HostError> {
        JoggingSequencer::new(self).run(request, feed).await
    }

    pub async fn probe(
        &self,
        axis: Axis,
        feed: f64,
        distance: f64,
    ) -> Result<ProbeOutcome, HostError> {
        ProbingSequencer::new(self).probe(axis, feed, distance).await
    }

    pub async fn probe_grid(&self, options: GridProbeOptions) -> Result<GridProbeResult, HostError> {
        ProbingSequencer::new(self).probe_grid(options).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn disconnect(&self) {
        self.stop_status_polling();
        self.link.disconnect();
    }

    pub fn machine_state(&self) -> MachineState {
        self.state.lock().unwrap().machine_state.clone()
    }

    pub fn expected_position(&self) -> Position {
        self.state.lock().unwrap().expected
    }

    pub fn last_known_position(&self) -> Option<Position> {
        self.state.lock().unwrap().last_known
    }

    pub fn last_alarm_code(&self) -> Option<u8> {
        self.state.lock().unwrap().last_alarm_code
    }

    pub fn is_homed(&self) -> bool {
        self.state.lock().unwrap().homed
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().unwrap().journal.iter().cloned().collect()
    }

    /// True when the expected and reported positions diverge beyond the
    /// step-loss tolerance on any axis.
    pub fn check_position_mismatch(&self) -> bool {
        let state = self.state.lock().unwrap();
        match state.last_known {
            Some(known) => known.max_axis_delta(&state.expected) > POSITION_TOLERANCE_MM,
            None => false,
        }
    }

    pub fn soft_limits(&self) -> &SoftLimits {
        self.validator.soft_limits()
    }

    pub fn speed_limits(&self) -> &SpeedLimits {
        self.validator.speed_limits()
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn jog_flag(&self) -> &AtomicBool {
        &self.jog_active
    }

    pub(crate) fn mark_homed(&self, homed: bool) {
        self.state.lock().unwrap().homed = homed;
    }

    /// Adopt the reported position as the expected one, e.g. after homing
    /// re-establishes the origin.
    pub(crate) fn resync_expected(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(known) = state.last_known {
            state.expected = known;
        }
    }

    fn record_status(&self, report: &StatusReport) -> StatusSnapshot {
        let position = Position::from_array(&report.machine_position);
        let mut state = self.state.lock().unwrap();
        state.last_known = Some(position);
        state.machine_state = match &report.state {
            MachineState::Alarm(_) => MachineState::Alarm(state.last_alarm_code),
            other => other.clone(),
        };
        StatusSnapshot {
            state: state.machine_state.clone(),
            machine_position: position,
            feed: report.feed,
            spindle: report.spindle,
        }
    }

    fn track_outgoing(&self, text: &str) {
        let mut state = self.state.lock().unwrap();
        let delta = apply_expected(text, &mut state);
        push_bounded(
            &mut state.journal,
            JOURNAL_CAPACITY,
            JournalEntry {
                command: text.to_string(),
                timestamp: Local::now(),
                expected_delta: delta,
            },
        );
    }

    fn absorb_line(&self, line: &str) {
        match parse_line(line) {
            GrblMessage::Status(report) => {
                let snapshot = self.record_status(&report);
                self.events.emit(Event::StatusRaw(line.to_string()));
                self.events.emit(Event::Status(snapshot));
            }
            GrblMessage::Alarm(code) => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.last_alarm_code = Some(code);
                    state.machine_state = MachineState::Alarm(Some(code));
                    state.homed = false;
                }
                self.events
                    .emit(Event::Alarm { code, message: grbl::alarm_text(code).to_string() });
            }
            GrblMessage::Probe(report) => self.events.emit(Event::ProbeReport(report)),
            // ok / error terminate the in-flight command; the queue's own
            // listener resolves them.
            GrblMessage::Ok | GrblMessage::Error(_) => {}
            GrblMessage::Setting { .. } => {}
            GrblMessage::Feedback(text) => debug!(feedback = %text, "device feedback"),
            GrblMessage::Greeting(text) => debug!(greeting = %text, "firmware greeting"),
            GrblMessage::Unrecognized(text) => debug!(line = %text, "dropped unrecognized line"),
        }
    }
}

/// Expected-position accounting: G0–G3 words replace components in
/// absolute mode and add in incremental mode; `$J=` is always additive.
/// Any other command leaves the expected position unchanged.
fn apply_expected(text: &str, state: &mut ControllerState) -> Option<Position> {
    if let Some(jog) = text.strip_prefix("$J=") {
        let words = scan_words(jog).ok()?;
        let before = state.expected;
        for (letter, value) in words {
            if let Some(axis) = axis_of(letter) {
                state.expected.set_axis(axis, state.expected.axis(axis) + value);
            }
        }
        return Some(state.expected - before);
    }
    let words = scan_words(text).ok()?;
    for &(letter, value) in &words {
        if letter == 'G' {
            if value == 90.0 {
                state.distance_mode = DistanceMode::Absolute;
            } else if value == 91.0 {
                state.distance_mode = DistanceMode::Incremental;
            }
        }
    }
    let motion = words
        .iter()
        .any(|&(letter, value)| {
            letter == 'G' && matches!((value * 10.0).round() as i64, 0 | 10 | 20 | 30)
        });
    if !motion {
        return None;
    }
    let before = state.expected;
    for &(letter, value) in &words {
        if let Some(axis) = axis_of(letter) {
            let resolved = match state.distance_mode {
                DistanceMode::Absolute => value,
                DistanceMode::Incremental => state.expected.axis(axis) + value,
            };
            state.expected.set_axis(axis, resolved);
        }
    }
    Some(state.expected - before)
}

fn axis_of(letter: char) -> Option<Axis> {
    match letter {
        'X' => Some(Axis::X),
        'Y' => Some(Axis::Y),
        'Z' => Some(Axis::Z),
        _ => None,
    }
}

async fn run_event_pump(
    controller: Weak<Controller>,
    mut link_events: broadcast::Receiver<LinkEvent>,
) {
    loop {
        let event = match link_events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event pump lagged behind the link");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(controller) = controller.upgrade() else { return };
        match event {
            LinkEvent::Connected => controller.events.emit(Event::Connected),
            LinkEvent::Disconnected => {
                {
                    let mut state = controller.state.lock().unwrap();
                    state.machine_state = MachineState::Disconnected;
                }
                controller.events.emit(Event::Disconnected);
            }
            LinkEvent::Error(message) => controller.events.emit(Event::Error(message)),
            LinkEvent::Line(line) => controller.absorb_line(&line),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn motion(state: &mut ControllerState, text: &str) -> Option<Position> {
        apply_expected(text, state)
    }

    #[test]
    fn absolute_moves_replace_named_components() {
        let mut state = ControllerState::new();
        motion(&mut state, "G0 X10 Y20");
        assert_eq!(state.expected, Position::new(10.0, 20.0, 0.0));
        motion(&mut state, "G1 Z-5 F100");
        assert_eq!(state.expected, Position::new(10.0, 20.0, -5.0));
        // Unnamed axes stay put.
        motion(&mut state, "G0 X1");
        assert_eq!(state.expected, Position::new(1.0, 20.0, -5.0));
    }

    #[test]
    fn incremental_moves_accumulate() {
        let mut state = ControllerState::new();
        motion(&mut state, "G91");
        motion(&mut state, "G0 X10");
        motion(&mut state, "G0 X10 Y-2");
        assert_eq!(state.expected, Position::new(20.0, -2.0, 0.0));
        motion(&mut state, "G90");
        motion(&mut state, "G0 X5");
        assert_eq!(state.expected, Position::new(5.0, -2.0, 0.0));
    }

    #[test]
    fn jog_is_always_additive() {
        let mut state = ControllerState::new();
        // Even in absolute mode, jog deltas add.
        let delta = motion(&mut state, "$J=G91 X10 Y-5 F1000");
        assert_eq!(state.expected, Position::new(10.0, -5.0, 0.0));
        assert_eq!(delta, Some(Position::new(10.0, -5.0, 0.0)));
        motion(&mut state, "$J=G91 X10 F1000");
        assert_eq!(state.expected, Position::new(20.0, -5.0, 0.0));
    }

    #[test]
    fn non_motion_commands_leave_position_alone() {
        let mut state = ControllerState::new();
        motion(&mut state, "G0 X10");
        assert_eq!(motion(&mut state, "$H"), None);
        assert_eq!(motion(&mut state, "M3 S1000"), None);
        assert_eq!(motion(&mut state, "G4 P1"), None);
        assert_eq!(state.expected, Position::new(10.0, 0.0, 0.0));
    }

    #[test]
    fn mode_words_apply_within_their_own_line() {
        let mut state = ControllerState::new();
        motion(&mut state, "G0 X10");
        motion(&mut state, "G91 G0 X5");
        assert_eq!(state.expected, Position::new(15.0, 0.0, 0.0));
        motion(&mut state, "G90 G0 X5");
        assert_eq!(state.expected, Position::new(5.0, 0.0, 0.0));
    }
}

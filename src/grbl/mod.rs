//! GRBL wire protocol: message model and the line parser.
//!
//! See the real-time status report section of the GRBL interface notes at
//! https://github.com/gnea/grbl/blob/master/doc/markdown/interface.md

pub mod parser;

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Machine state as reported by the firmware. Transitions are driven solely
/// by status reports; the host never fabricates one. The alarm payload is
/// filled in by the controller from the most recent `ALARM:<n>` line since
/// the status report itself carries no code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MachineState {
    Idle,
    Run,
    Hold(i64),
    Jog,
    Alarm(Option<u8>),
    Door(i64),
    Check,
    Home,
    Sleep,
    Disconnected,
}

impl MachineState {
    pub fn is_idle(&self) -> bool {
        matches!(self, MachineState::Idle)
    }

    pub fn is_alarm(&self) -> bool {
        matches!(self, MachineState::Alarm(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            MachineState::Idle => "Idle",
            MachineState::Run => "Run",
            MachineState::Hold(_) => "Hold",
            MachineState::Jog => "Jog",
            MachineState::Alarm(_) => "Alarm",
            MachineState::Door(_) => "Door",
            MachineState::Check => "Check",
            MachineState::Home => "Home",
            MachineState::Sleep => "Sleep",
            MachineState::Disconnected => "Disconnected",
        }
    }
}

mod array_serializer {
    use ndarray::Array1;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(array: &Array1<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        array.to_vec().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Array1<f64>, D::Error> {
        let values = Vec::<f64>::deserialize(deserializer)?;
        Ok(values.into_iter().collect())
    }
}

/// One decoded `<...>` status report. Any field past the position triple is
/// optional; unknown fields are collected rather than rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: MachineState,
    #[serde(with = "array_serializer")]
    pub machine_position: Array1<f64>,
    pub work_position: Option<Vec<f64>>,
    pub feed: Option<f64>,
    pub spindle: Option<f64>,
    pub unknown_fields: Vec<String>,
}

impl StatusReport {
    pub fn new(state: MachineState) -> StatusReport {
        StatusReport {
            state,
            machine_position: Array1::zeros(0),
            work_position: None,
            feed: None,
            spindle: None,
            unknown_fields: Vec::new(),
        }
    }
}

/// One decoded `[PRB:...]` probe report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    #[serde(with = "array_serializer")]
    pub position: Array1<f64>,
    pub contact: bool,
}

/// Classification of a single device line.
#[derive(Debug, Clone, PartialEq)]
pub enum GrblMessage {
    Status(StatusReport),
    Probe(ProbeReport),
    Ok,
    Error(u8),
    Alarm(u8),
    /// One `$<n>=<value>` line from a settings dump.
    Setting { index: u16, value: f64 },
    /// Bracketed feedback other than a probe report: `[VER:...]`,
    /// `[OPT:...]`, `[MSG:...]`.
    Feedback(String),
    Greeting(String),
    Unrecognized(String),
}

/// Fixed text for alarm codes 1..=9; anything else formats generically.
pub fn alarm_text(code: u8) -> Cow<'static, str> {
    match code {
        1 => "Hard limit triggered.".into(),
        2 => "Motion target exceeds machine travel.".into(),
        3 => "Reset while in motion; position may be lost.".into(),
        4 => "Probe fail: probe not in expected initial state.".into(),
        5 => "Probe fail: no contact within programmed travel.".into(),
        6 => "Homing fail: reset during active homing cycle.".into(),
        7 => "Homing fail: safety door opened during homing.".into(),
        8 => "Homing fail: cycle failed to clear limit switch.".into(),
        9 => "Homing fail: limit switch not found within search distance.".into(),
        _ => Cow::Owned(format!("Unknown ALARM:{}", code)),
    }
}

/// Text for the error codes the host routinely encounters.
pub fn error_text(code: u8) -> Cow<'static, str> {
    match code {
        1 => "Expected a g-code word letter.".into(),
        2 => "Bad or missing numeric value.".into(),
        8 => "'$' command only valid when idle.".into(),
        9 => "G-code locked out during alarm or jog state.".into(),
        15 => "Jog target exceeds machine travel.".into(),
        16 => "Invalid jog command.".into(),
        20 => "Unsupported g-code command in block.".into(),
        22 => "Feed rate has not been set.".into(),
        33 => "Motion command has an invalid target.".into(),
        _ => Cow::Owned(format!("Unknown error:{}", code)),
    }
}

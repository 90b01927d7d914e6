//! Host-side controller core for machines speaking the GRBL line protocol.
//!
//! The crate models the machine (position, state, alarms), frames the wire
//! protocol, gates every outgoing line against soft limits and feed caps,
//! and layers the compound operations on top: homing, jogging, probing,
//! block-by-block job streaming with crash recovery, and a periodic
//! recovery supervisor.
//!
//! The embedding application supplies a [`transport::Transport`] (serial,
//! TCP, Bluetooth — only their configuration types live here) and drives
//! the [`controller::Controller`] facade and the [`job::JobRunner`].
//! Everything is cooperative tokio tasks; commands funnel through a FIFO
//! queue that keeps at most one command in flight on the wire.

pub mod command_queue;
pub mod config;
pub mod controller;
pub mod error;
pub mod gcode;
pub mod geometry;
pub mod grbl;
pub mod job;
pub mod recovery;
pub mod safety;
pub mod sequence;
pub mod transport;

mod util;

pub use command_queue::{Command, CommandQueue, CommandResponse};
pub use config::{AxisRange, HostConfig, SoftLimits, SpeedLimits, TransportConfig};
pub use controller::events::Event;
pub use controller::{Controller, JournalEntry, StatusSnapshot};
pub use error::HostError;
pub use geometry::{Axis, BoundingBox, Position};
pub use grbl::{GrblMessage, MachineState, ProbeReport, StatusReport};
pub use job::{Job, JobOptions, JobRunner, JobState, JobStatus, MemoryStateSink, StateSink};
pub use recovery::{
    AutoConfirm, RecoveryConfirmer, RecoveryDiagnosis, RecoveryStep, RecoverySupervisor,
    RecoveryState, Severity,
};
pub use safety::{SafetyValidator, Validation};
pub use sequence::homing::HomingResult;
pub use sequence::jog::{JogRequest, JogResult};
pub use sequence::probe::{GridProbeOptions, GridProbeResult, ProbeOutcome};
pub use transport::{Link, LinkEvent, LinkQuality, Transport, TransportStream};

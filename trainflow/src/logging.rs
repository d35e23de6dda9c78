//! Events logged by flows and the parallel scheduler.
//!
//! Each flow owns a [`Registry`](trainflow_logging::Registry); events are logged to the logger
//! registered under [`LOG_NAME`], if any.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::parallel::JobId;

/// Name of the flow event log.
pub const LOG_NAME: &str = "trainflow";

/// Logger type for flow events.
pub type FlowLogger = trainflow_logging::Logger<FlowEvent>;

/// Marks the beginning or end of an activity.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum StartStop {
    /// Activity begins.
    Start,
    /// Activity ends.
    Stop,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// A training phase of a unit begins or ends.
pub struct TrainEvent {
    /// Position of the unit in its flow.
    pub unit: usize,
    /// Identifier of the phase.
    pub phase: usize,
    /// Whether the phase begins or ends.
    pub start_stop: StartStop,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// A checkpoint was taken after a unit finished training.
pub struct CheckpointEvent {
    /// Position of the unit that finished.
    pub unit: usize,
    /// True if the checkpoint halted training.
    pub stop: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// The flow was persisted after a failure.
pub struct CrashEvent {
    /// File holding the snapshot, if it could be written.
    pub path: Option<String>,
    /// The failure that triggered persistence.
    pub error: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
/// What happened to a job.
pub enum JobEventKind {
    /// The job was handed to the caller.
    Issued,
    /// The job's result was merged.
    Merged,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// A job was issued or its result merged.
pub struct JobEvent {
    /// The job.
    pub id: JobId,
    /// What happened.
    pub kind: JobEventKind,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// A training phase was run by the scheduler itself, as the unit cannot produce jobs for it.
pub struct FallbackEvent {
    /// Position of the unit.
    pub unit: usize,
    /// Identifier of the phase.
    pub phase: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// Data passes through a flow.
pub struct ExecuteEvent {
    /// Number of units in the flow.
    pub units: usize,
    /// Number of observations.
    pub rows: usize,
    /// Whether execution begins or ends.
    pub start_stop: StartStop,
}

/// An event logged by a flow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    /// A training phase begins or ends.
    Train(TrainEvent),
    /// A checkpoint was taken.
    Checkpoint(CheckpointEvent),
    /// The flow was persisted after a failure.
    CrashRecovery(CrashEvent),
    /// A job was issued or merged.
    Job(JobEvent),
    /// A phase was trained without jobs.
    Fallback(FallbackEvent),
    /// Data passes through the flow.
    Execute(ExecuteEvent),
}

impl From<TrainEvent> for FlowEvent {
    fn from(v: TrainEvent) -> FlowEvent { FlowEvent::Train(v) }
}

impl From<CheckpointEvent> for FlowEvent {
    fn from(v: CheckpointEvent) -> FlowEvent { FlowEvent::Checkpoint(v) }
}

impl From<CrashEvent> for FlowEvent {
    fn from(v: CrashEvent) -> FlowEvent { FlowEvent::CrashRecovery(v) }
}

impl From<JobEvent> for FlowEvent {
    fn from(v: JobEvent) -> FlowEvent { FlowEvent::Job(v) }
}

impl From<FallbackEvent> for FlowEvent {
    fn from(v: FallbackEvent) -> FlowEvent { FlowEvent::Fallback(v) }
}

impl From<ExecuteEvent> for FlowEvent {
    fn from(v: ExecuteEvent) -> FlowEvent { FlowEvent::Execute(v) }
}

/// Registers a logger under [`LOG_NAME`] that prints events to standard error.
pub fn log_to_stderr(registry: &mut trainflow_logging::Registry) {
    registry.insert::<FlowEvent, _>(LOG_NAME, |_time: &Duration, data: &mut Vec<(Duration, FlowEvent)>| {
        for (time, event) in data.drain(..) {
            eprintln!("trainflow\t{:?}\t{:?}", time, event);
        }
    });
}

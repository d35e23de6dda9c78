//! Checkpoints and crash-recovery snapshots.
//!
//! A [`Checkpoint`] is invoked after each unit of a flow finishes training, and may halt
//! training by returning `ControlFlow::Break`. A [`FlowSnapshot`] is the persisted state of a
//! whole flow; it is written when a flow fails with crash recovery enabled, and by
//! [`SaveCheckpoint`].

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::unit::UnitSnapshot;
use super::Flow;

/// A hook invoked after each unit finishes training.
pub trait Checkpoint {
    /// Called once unit `index` of `flow` has closed all its training phases.
    ///
    /// Returning `ControlFlow::Break(())` halts training; later units are left untrained.
    fn checkpoint(&mut self, index: usize, flow: &Flow) -> Result<ControlFlow<()>, FlowError>;
}

impl<F: FnMut(usize, &Flow) -> ControlFlow<()>> Checkpoint for F {
    fn checkpoint(&mut self, index: usize, flow: &Flow) -> Result<ControlFlow<()>, FlowError> {
        Ok(self(index, flow))
    }
}

/// Halts training once the unit at the given position has been trained.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StopAfter(pub usize);

impl Checkpoint for StopAfter {
    fn checkpoint(&mut self, index: usize, _flow: &Flow) -> Result<ControlFlow<()>, FlowError> {
        Ok(if index >= self.0 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) })
    }
}

/// Persists a snapshot of the flow to `<prefix>.<index>` after each unit is trained.
#[derive(Clone, Debug)]
pub struct SaveCheckpoint {
    prefix: PathBuf,
    saved: Vec<PathBuf>,
}

impl SaveCheckpoint {
    /// Saves snapshots next to `prefix`.
    pub fn new<P: Into<PathBuf>>(prefix: P) -> Self {
        SaveCheckpoint { prefix: prefix.into(), saved: Vec::new() }
    }

    /// The files written so far, in order.
    pub fn saved(&self) -> &[PathBuf] {
        &self.saved
    }
}

impl Checkpoint for SaveCheckpoint {
    fn checkpoint(&mut self, index: usize, flow: &Flow) -> Result<ControlFlow<()>, FlowError> {
        let mut name = self.prefix.clone().into_os_string();
        name.push(format!(".{}", index));
        let path = PathBuf::from(name);
        flow.snapshot()?.save(&path)?;
        self.saved.push(path);
        Ok(ControlFlow::Continue(()))
    }
}

/// Where and why a flow failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Position of the failing unit, if a unit failed.
    pub unit: Option<usize>,
    /// Open phase of the failing unit at the time of failure.
    pub phase: Option<usize>,
    /// Description of the failure.
    pub error: String,
}

/// The complete persisted state of a flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    /// Snapshots of all units, in order.
    pub units: Vec<UnitSnapshot>,
    /// The failure that prompted the snapshot, if any.
    pub failure: Option<Failure>,
}

impl FlowSnapshot {

    /// Writes the snapshot to `path`.
    ///
    /// The snapshot is first written in full to a sibling file and then renamed into place, so
    /// that `path` never holds a partial snapshot. The sibling is removed if either step fails.
    pub fn save(&self, path: &Path) -> Result<(), FlowError> {
        let mut partial = OsString::from(path.as_os_str());
        partial.push(".partial");
        let partial = PathBuf::from(partial);
        let saved = self.write(&partial).and_then(|()| Ok(fs::rename(&partial, path)?));
        if saved.is_err() {
            // Best effort; the error reported is the one that stopped the save.
            let _ = fs::remove_file(&partial);
        }
        saved
    }

    fn write(&self, path: &Path) -> Result<(), FlowError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Reads a snapshot written by `save`.
    pub fn load(path: &Path) -> Result<FlowSnapshot, FlowError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(reader)?)
    }
}

//! Sequential flows of units.
//!
//! A [`Flow`] is an ordered chain of units, each consuming the output of its predecessor. Training
//! proceeds one unit at a time: every training phase of unit `i` sees all of its data source,
//! mapped through the already trained units `0 .. i`. Once every unit is trained, the flow maps
//! data through all of its units in order.
//!
//! Flows report failures with the position of the failing unit. With crash recovery configured,
//! a flow persists a [`FlowSnapshot`] of itself before returning any unit failure from training
//! or execution.

use std::borrow::Cow;
use std::fmt;
use std::ops::{ControlFlow, Range};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use crate::config::Config;
use crate::data::{Chunk, DataSource};
use crate::error::FlowError;
use crate::logging::{CheckpointEvent, CrashEvent, ExecuteEvent, FlowEvent, FlowLogger, StartStop, TrainEvent, LOG_NAME};
use crate::unit::Unit;

pub mod checkpoint;
mod flow_unit;

pub use checkpoint::{Checkpoint, Failure, FlowSnapshot, SaveCheckpoint, StopAfter};
pub use flow_unit::FlowUnit;

/// How a call to train a flow ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Training {
    /// Every unit is trained.
    Complete,
    /// A checkpoint halted training after the unit at position `after`.
    Stopped {
        /// Position of the last trained unit.
        after: usize,
    },
}

/// An ordered chain of units.
pub struct Flow {
    units: Vec<Box<dyn Unit>>,
    config: Config,
    log_register: trainflow_logging::Registry,
    /// The most recent crash recovery snapshot.
    crashed: Mutex<Option<PathBuf>>,
}

impl Flow {

    /// Creates a flow from units, checking that adjacent units agree on dimensionality.
    pub fn new(units: Vec<Box<dyn Unit>>) -> Result<Flow, FlowError> {
        Flow::with_config(units, Config::default())
    }

    /// Creates a flow with a configuration.
    pub fn with_config(units: Vec<Box<dyn Unit>>, config: Config) -> Result<Flow, FlowError> {
        check_consistency(&units)?;
        let mut log_register = trainflow_logging::Registry::new(Instant::now());
        if config.log_stderr {
            crate::logging::log_to_stderr(&mut log_register);
        }
        Ok(Flow {
            units,
            config,
            log_register,
            crashed: Mutex::new(None),
        })
    }

    /// The flow's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replaces the flow's configuration.
    ///
    /// Loggers already registered are unaffected.
    pub fn set_config(&mut self, config: Config) {
        self.config = config;
    }

    /// The flow's logger registry, for installing loggers under [`LOG_NAME`].
    pub fn log_register(&mut self) -> &mut trainflow_logging::Registry {
        &mut self.log_register
    }

    /// The flow event logger, if one is registered.
    pub fn logger(&self) -> Option<FlowLogger> {
        self.log_register.get::<FlowEvent>(LOG_NAME)
    }

    /// The file written by the most recent crash recovery, if any.
    pub fn crash_recovery_path(&self) -> Option<PathBuf> {
        match self.crashed.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// True if the flow has no units.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// The units, in order.
    pub fn units(&self) -> &[Box<dyn Unit>] {
        &self.units[..]
    }

    /// The unit at `index`.
    pub fn unit(&self, index: usize) -> Option<&dyn Unit> {
        self.units.get(index).map(|unit| &**unit)
    }

    /// Mutable access to the unit at `index`.
    pub fn unit_mut(&mut self, index: usize) -> Option<&mut (dyn Unit + 'static)> {
        match self.units.get_mut(index) {
            Some(unit) => Some(unit.as_mut()),
            None => None,
        }
    }

    /// Iterates over the units in order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Unit> + '_ {
        self.units.iter().map(|unit| &**unit)
    }

    /// Appends a unit, which must accept the output of the current last unit.
    pub fn push(&mut self, unit: Box<dyn Unit>) -> Result<(), FlowError> {
        let index = self.units.len();
        self.insert(index, unit)
    }

    /// Inserts a unit at `index`, which must agree with its neighbours and be at most `len`.
    pub fn insert(&mut self, index: usize, unit: Box<dyn Unit>) -> Result<(), FlowError> {
        if index > self.units.len() {
            return Err(FlowError::OutOfRange { index, len: self.units.len() });
        }
        self.units.insert(index, unit);
        if let Err(error) = check_consistency(&self.units) {
            self.units.remove(index);
            return Err(error);
        }
        Ok(())
    }

    /// Removes and returns the unit at `index`, provided the remaining units still agree.
    pub fn remove(&mut self, index: usize) -> Result<Option<Box<dyn Unit>>, FlowError> {
        if index >= self.units.len() {
            return Ok(None);
        }
        let unit = self.units.remove(index);
        if let Err(error) = check_consistency(&self.units) {
            self.units.insert(index, unit);
            return Err(error);
        }
        Ok(Some(unit))
    }

    /// Consumes the flow, returning its units.
    pub fn into_units(self) -> Vec<Box<dyn Unit>> {
        self.units
    }

    /// True once every unit may execute.
    pub fn is_trained(&self) -> bool {
        self.units.iter().all(|unit| unit.is_ready())
    }

    /// Trains every unit in order, each on its own data source.
    ///
    /// `sources` must hold one entry per unit. Units that are not trainable, or that have already
    /// finished training, are skipped and their entry may be `None`.
    pub fn train(&mut self, sources: &[Option<Box<dyn DataSource>>]) -> Result<Training, FlowError> {
        self.train_inner(sources, None)
    }

    /// Trains every unit in order, invoking `checkpoint` as each trainable unit finishes.
    pub fn train_with_checkpoint(
        &mut self,
        sources: &[Option<Box<dyn DataSource>>],
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<Training, FlowError> {
        self.train_inner(sources, Some(checkpoint))
    }

    fn train_inner(
        &mut self,
        sources: &[Option<Box<dyn DataSource>>],
        mut checkpoint: Option<&mut dyn Checkpoint>,
    ) -> Result<Training, FlowError> {
        if sources.len() != self.units.len() {
            return Err(FlowError::SourceCount { expected: self.units.len(), found: sources.len() });
        }
        for index in 0 .. self.units.len() {
            if !self.units[index].is_trainable() {
                continue;
            }
            if self.units[index].is_training() {
                let source = sources[index].as_deref().ok_or(FlowError::MissingSource { index })?;
                if let Err(error) = self.train_unit(index, source) {
                    return Err(self.recover(error));
                }
            }
            if let Some(checkpoint) = checkpoint.as_deref_mut() {
                if stop_requested(checkpoint, index, self)? {
                    return Ok(Training::Stopped { after: index });
                }
            }
        }
        Ok(Training::Complete)
    }

    /// Runs every remaining training phase of the unit at `index` over `source`.
    ///
    /// All units before `index` must be ready.
    fn train_unit(&mut self, index: usize, source: &dyn DataSource) -> Result<(), FlowError> {
        let logger = self.logger();
        while let Some(phase) = self.units[index].current_phase() {
            if let Some(logger) = &logger {
                logger.log(TrainEvent { unit: index, phase, start_stop: StartStop::Start });
            }
            for chunk in source.chunks() {
                let x = self.execute_range(0 .. index, &chunk)?;
                self.units[index].train(&x).map_err(|error| FlowError::unit(index, error))?;
            }
            self.units[index].stop_training().map_err(|error| FlowError::unit(index, error))?;
            if let Some(logger) = &logger {
                logger.log(TrainEvent { unit: index, phase, start_stop: StartStop::Stop });
            }
        }
        Ok(())
    }

    /// Maps a chunk through every unit.
    pub fn execute(&self, chunk: &Chunk) -> Result<Chunk, FlowError> {
        let logger = self.logger();
        if let Some(logger) = &logger {
            logger.log(ExecuteEvent { units: self.units.len(), rows: chunk.rows(), start_stop: StartStop::Start });
        }
        let result = self.execute_range(0 .. self.units.len(), chunk);
        if let Some(logger) = &logger {
            logger.log(ExecuteEvent { units: self.units.len(), rows: chunk.rows(), start_stop: StartStop::Stop });
        }
        result.map(Cow::into_owned).map_err(|error| self.recover(error))
    }

    /// Maps a chunk through the units in `range`, without crash recovery.
    pub(crate) fn execute_range<'a>(&self, range: Range<usize>, chunk: &'a Chunk) -> Result<Cow<'a, Chunk>, FlowError> {
        let mut current = Cow::Borrowed(chunk);
        for (index, unit) in self.units[range.clone()].iter().enumerate() {
            let index = index + range.start;
            if !unit.is_ready() {
                return Err(FlowError::NotReady { index });
            }
            let output = unit.execute(&current).map_err(|error| FlowError::unit(index, error))?;
            current = Cow::Owned(output);
        }
        Ok(current)
    }

    /// Maps a chunk of output back through every unit, in reverse order.
    pub fn invert(&self, chunk: &Chunk) -> Result<Chunk, FlowError> {
        let mut current = Cow::Borrowed(chunk);
        for (index, unit) in self.units.iter().enumerate().rev() {
            if !unit.is_ready() {
                return Err(FlowError::NotReady { index });
            }
            let input = unit.invert(&current).map_err(|error| FlowError::unit(index, error))?;
            current = Cow::Owned(input);
        }
        Ok(current.into_owned())
    }

    /// Captures the state of every unit.
    pub fn snapshot(&self) -> Result<FlowSnapshot, FlowError> {
        let units = self.units
            .iter()
            .enumerate()
            .map(|(index, unit)| unit.snapshot().map_err(|error| FlowError::unit(index, error)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FlowSnapshot { units, failure: None })
    }

    /// Persists a snapshot of the flow to `path`.
    pub fn save(&self, path: &Path) -> Result<(), FlowError> {
        self.snapshot()?.save(path)
    }

    /// An independent copy of the flow, with the same configuration and no loggers.
    pub fn duplicate(&self) -> Flow {
        let mut log_register = trainflow_logging::Registry::new(Instant::now());
        if self.config.log_stderr {
            crate::logging::log_to_stderr(&mut log_register);
        }
        Flow {
            units: self.units.clone(),
            config: self.config.clone(),
            log_register,
            crashed: Mutex::new(None),
        }
    }

    /// Persists the flow if a unit failed and crash recovery is enabled, and returns `error`
    /// unchanged.
    ///
    /// Misuse of the flow, such as executing it untrained, is not persisted. Failure to persist
    /// does not mask `error`; it is only logged.
    pub(crate) fn recover(&self, error: FlowError) -> FlowError {
        let index = match error {
            FlowError::Unit { index, .. } => index,
            _ => return error,
        };
        let Some(target) = self.config.crash_recovery.target() else {
            return error;
        };
        let failure = Failure {
            unit: Some(index),
            phase: self.units.get(index).and_then(|unit| unit.current_phase()),
            error: error.to_string(),
        };
        let written = self.snapshot().and_then(|mut snapshot| {
            snapshot.failure = Some(failure);
            snapshot.save(&target)
        });
        let path = written.ok().map(|()| target);
        if let Some(logger) = self.logger() {
            logger.log(CrashEvent {
                path: path.as_ref().map(|path| path.display().to_string()),
                error: error.to_string(),
            });
        }
        if path.is_some() {
            match self.crashed.lock() {
                Ok(mut guard) => *guard = path,
                Err(poisoned) => *poisoned.into_inner() = path,
            }
        }
        error
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("units", &self.units)
            .field("config", &self.config)
            .finish()
    }
}

/// Checks that each unit accepts the dimensionality its predecessor produces, where both are known.
fn check_consistency(units: &[Box<dyn Unit>]) -> Result<(), FlowError> {
    for (index, pair) in units.windows(2).enumerate() {
        if let (Some(output), Some(input)) = (pair[0].output_dim(), pair[1].input_dim()) {
            if output != input {
                return Err(FlowError::InconsistentUnits { index: index + 1, output, input });
            }
        }
    }
    Ok(())
}

/// Invokes `checkpoint` for the trained unit at `index`, reporting whether training should halt.
pub(crate) fn stop_requested(checkpoint: &mut dyn Checkpoint, index: usize, flow: &Flow) -> Result<bool, FlowError> {
    let stop = checkpoint.checkpoint(index, flow)? == ControlFlow::Break(());
    if let Some(logger) = flow.logger() {
        logger.log(CheckpointEvent { unit: index, stop });
    }
    Ok(stop)
}

//! Errors reported by units, flows, the extension registry, and the parallel scheduler.

use std::error::Error;
use std::fmt::{self, Display};

use crate::data::Dtype;
use crate::parallel::JobId;

/// Failures of a single unit.
///
/// These describe misuse of the unit lifecycle or data that does not fit the unit. They are
/// never retried.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitError {
    /// The data dimensionality differs from the dimensionality fixed for the unit.
    InconsistentDimension {
        /// Dimensionality fixed for the unit.
        expected: usize,
        /// Dimensionality of the offending data.
        found: usize,
    },
    /// The data element type differs from the element type fixed for the unit.
    InconsistentType {
        /// Element type fixed for the unit.
        expected: Dtype,
        /// Element type of the offending data.
        found: Dtype,
    },
    /// Training was requested of a unit that cannot be trained.
    NotTrainable,
    /// Training was requested of a unit with no open training phase.
    TrainingFinished,
    /// Execution was requested of a unit that has not finished training.
    NotTrained,
    /// Inversion was requested of a unit that cannot be inverted.
    NotInvertible,
    /// A failure reported by the algorithm itself.
    Algorithm(String),
    /// A partial result could not be encoded or decoded.
    Codec(String),
}

impl Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitError::InconsistentDimension { expected, found } => {
                write!(f, "input dimensionality {} does not match the unit's {}", found, expected)
            }
            UnitError::InconsistentType { expected, found } => {
                write!(f, "element type {} does not match the unit's {}", found, expected)
            }
            UnitError::NotTrainable => f.write_str("the unit is not trainable"),
            UnitError::TrainingFinished => f.write_str("the unit has no open training phase"),
            UnitError::NotTrained => f.write_str("the unit has not finished training"),
            UnitError::NotInvertible => f.write_str("the unit is not invertible"),
            UnitError::Algorithm(message) => write!(f, "algorithm failure: {}", message),
            UnitError::Codec(message) => write!(f, "partial result codec failure: {}", message),
        }
    }
}

impl Error for UnitError {}

impl From<bincode::Error> for UnitError {
    fn from(error: bincode::Error) -> Self {
        UnitError::Codec(error.to_string())
    }
}

/// Failures of a flow of units.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowError {
    /// The unit at `index` failed.
    Unit {
        /// Position of the failing unit in the flow.
        index: usize,
        /// The failure, as reported by the unit.
        source: UnitError,
    },
    /// The unit at `index` must finish training before the flow can execute.
    NotReady {
        /// Position of the untrained unit.
        index: usize,
    },
    /// The number of data sources differs from the number of units.
    SourceCount {
        /// Number of units in the flow.
        expected: usize,
        /// Number of sources supplied.
        found: usize,
    },
    /// A trainable unit was given no data source.
    MissingSource {
        /// Position of the unit lacking data.
        index: usize,
    },
    /// Adjacent units disagree on the dimensionality passed between them.
    InconsistentUnits {
        /// Position of the downstream unit.
        index: usize,
        /// Output dimensionality of the upstream unit.
        output: usize,
        /// Input dimensionality of the downstream unit.
        input: usize,
    },
    /// A position lies beyond the end of the flow.
    OutOfRange {
        /// The position asked for.
        index: usize,
        /// Number of units in the flow.
        len: usize,
    },
    /// A snapshot could not be written or read.
    Persist(String),
}

impl FlowError {
    /// Wraps a unit failure with the unit's position.
    pub fn unit(index: usize, source: UnitError) -> Self {
        FlowError::Unit { index, source }
    }

    /// The underlying unit failure, if this is one.
    pub fn unit_error(&self) -> Option<&UnitError> {
        match self {
            FlowError::Unit { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::Unit { index, source } => write!(f, "unit {} failed: {}", index, source),
            FlowError::NotReady { index } => write!(f, "unit {} has not finished training", index),
            FlowError::SourceCount { expected, found } => {
                write!(f, "expected {} data sources, one per unit, found {}", expected, found)
            }
            FlowError::MissingSource { index } => write!(f, "trainable unit {} has no data source", index),
            FlowError::InconsistentUnits { index, output, input } => {
                write!(f, "unit {} expects dimensionality {} but its predecessor produces {}", index, input, output)
            }
            FlowError::OutOfRange { index, len } => write!(f, "position {} is beyond a flow of {} units", index, len),
            FlowError::Persist(message) => write!(f, "snapshot persistence failed: {}", message),
        }
    }
}

impl Error for FlowError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FlowError::Unit { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FlowError {
    fn from(error: std::io::Error) -> Self {
        FlowError::Persist(error.to_string())
    }
}

impl From<bincode::Error> for FlowError {
    fn from(error: bincode::Error) -> Self {
        FlowError::Persist(error.to_string())
    }
}

/// Misuse of the capability extension registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionError {
    /// No extension has been registered under this name.
    Unknown(String),
    /// The extension is registered but not active.
    NotActive(String),
    /// The extension already provides these methods for this unit type.
    Duplicate {
        /// Name of the extension.
        extension: String,
        /// Name of the unit type.
        unit: String,
    },
}

impl Display for ExtensionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionError::Unknown(name) => write!(f, "no extension named {:?}", name),
            ExtensionError::NotActive(name) => write!(f, "extension {:?} is not active", name),
            ExtensionError::Duplicate { extension, unit } => {
                write!(f, "extension {:?} already extends {}", extension, unit)
            }
        }
    }
}

impl Error for ExtensionError {}

/// Violations of the job polling protocol, and failures passed through from the flow.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// A job was requested while none was available.
    NoJob,
    /// More results were supplied than jobs are outstanding.
    ResultCount {
        /// Number of issued jobs whose results have not been used.
        outstanding: usize,
        /// Number of results supplied.
        received: usize,
    },
    /// A result does not correspond to an outstanding job.
    UnexpectedResult(JobId),
    /// A parallel operation was started while another is unfinished.
    Busy,
    /// Results were supplied while no parallel operation is running.
    Idle,
    /// The flow or one of its units failed.
    Flow(FlowError),
}

impl SchedulerError {
    /// True for errors caused by the caller's use of the polling protocol.
    pub fn is_contract_violation(&self) -> bool {
        !matches!(self, SchedulerError::Flow(_))
    }
}

impl Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::NoJob => f.write_str("no job is available"),
            SchedulerError::ResultCount { outstanding, received } => {
                write!(f, "received {} results but only {} jobs are outstanding", received, outstanding)
            }
            SchedulerError::UnexpectedResult(id) => write!(f, "result {} matches no outstanding job", id),
            SchedulerError::Busy => f.write_str("a parallel operation is still in progress"),
            SchedulerError::Idle => f.write_str("no parallel operation is in progress"),
            SchedulerError::Flow(error) => Display::fmt(error, f),
        }
    }
}

impl Error for SchedulerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SchedulerError::Flow(error) => Some(error),
            _ => None,
        }
    }
}

impl From<FlowError> for SchedulerError {
    fn from(error: FlowError) -> Self {
        SchedulerError::Flow(error)
    }
}

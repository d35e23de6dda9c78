//! Trainflow composes trainable data-processing units into flows, and trains them either directly
//! or by handing out jobs for external workers to run.
//!
//! The crate is organized in layers that depend on little beyond those below them.
//!
//! **Units**: The [`unit`] module defines the [`Unit`] lifecycle shared by every processing stage,
//! and the [`Algorithm`] hooks that concrete algorithms implement, wrapped in a [`Node`]. Units may
//! train over any number of phases, each of which sees all of their data. The [`units`] module
//! contains a few built-in algorithms.
//!
//! **Flows**: The [`flow`] module chains units into a [`Flow`], trained unit by unit and phase by
//! phase, with checkpoints after each unit and snapshots of the whole flow on failure. A
//! [`FlowUnit`](flow::FlowUnit) presents a flow as a single unit, so flows may nest.
//!
//! **Extensions**: The [`extension`] module attaches optional capabilities to unit types without
//! changing them, through a [`Registry`](extension::Registry) passed to whoever probes for them.
//!
//! **Parallel training**: The [`parallel`] module's [`ParallelFlow`] drives a flow by issuing
//! self-contained jobs and merging their results, using units' parallel capabilities where they
//! have them and training them directly where they do not.
//!
//! # Examples
//!
//! The following trains a flow with jobs, running each job as soon as it is issued.
//!
//! ```
//! use ndarray::Array2;
//! use trainflow::{Chunk, Flow, Node, ParallelFlow, Progress, Unit};
//! use trainflow::data::{source, Batches};
//! use trainflow::units::{Centering, QuadraticExpansion};
//!
//! let units: Vec<Box<dyn Unit>> = vec![
//!     Box::new(Node::new(QuadraticExpansion)),
//!     Box::new(Node::new(Centering::new())),
//! ];
//! let mut scheduler = ParallelFlow::new(Flow::new(units).unwrap());
//!
//! let data = Batches::from(
//!     (0 .. 4)
//!         .map(|c| Chunk::from(Array2::from_shape_fn((10, 3), |(i, j)| (c * i + j) as f64)))
//!         .collect::<Vec<_>>()
//! );
//! scheduler.parallel_train(vec![None, source(data)]).unwrap();
//! while scheduler.is_parallel_training() {
//!     let mut results = Vec::new();
//!     while scheduler.job_available() {
//!         results.push(scheduler.get_job().unwrap().run().unwrap());
//!     }
//!     scheduler.use_results(results).unwrap();
//! }
//!
//! let output = scheduler.execute(&Chunk::from(Array2::<f64>::zeros((5, 3)))).unwrap();
//! assert_eq!(output.dim(), 9);
//! ```

#![forbid(missing_docs)]

pub use config::{Config, CrashRecovery};
pub use data::{Chunk, DataSource, Dtype};
pub use error::{ExtensionError, FlowError, SchedulerError, UnitError};
pub use flow::{Flow, FlowUnit, Training};
pub use parallel::{Job, JobResult, ParallelFlow, Progress};
pub use unit::{Algorithm, Node, Phase, Unit, UnitState};

/// Re-export of the `trainflow_logging` crate.
pub mod logging_core {
    pub use trainflow_logging::*;
}

pub mod config;
pub mod data;
pub mod error;
pub mod extension;
pub mod flow;
pub mod logging;
pub mod parallel;
pub mod unit;
pub mod units;

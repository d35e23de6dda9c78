//! Job-based parallel training and execution.
//!
//! Parallel training is a capability attached to unit types through the extension [`Registry`],
//! under the extension named [`PARALLEL`]. A unit type supports it by registering
//! [`ParallelTraining`] methods, which split a training phase into a pure *fork* computed per chunk
//! of data by a job, and a *join* that merges each partial result into the unit. Algorithms
//! implement [`ParallelAlgorithm`], and [`ParallelTraining::of`] adapts them for [`Node`]s.
//!
//! The [`ParallelFlow`] scheduler probes each unit for the capability at the start of every
//! training phase; units without it are trained by the scheduler itself.

use std::any::type_name;
use std::sync::Arc;

use ndarray::ArrayView2;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::data::{Chunk, Dtype};
use crate::error::UnitError;
use crate::extension::Registry;
use crate::flow::FlowUnit;
use crate::unit::{Algorithm, Node, Unit};
use crate::units::{Centering, KMeans, QuadraticExpansion, Standardize};

pub mod job;
pub mod scheduler;
mod units;

pub use job::{Job, JobId, JobResult, Task};
pub use scheduler::{ParallelFlow, Progress};

/// Name of the extension providing parallel training and execution.
pub const PARALLEL: &str = "parallel";

/// The pure, per-chunk half of a training phase.
pub trait Fork: Send + Sync + 'static {
    /// The partial statistics computed from one chunk.
    type Partial: Serialize + DeserializeOwned;
    /// Computes partial statistics of `x` for the phase the fork was taken in.
    fn compute(&self, x: ArrayView2<'_, f64>) -> Result<Self::Partial, UnitError>;
}

/// An algorithm whose training phases split into independent per-chunk computations.
///
/// For every phase, joining the partial results of any partition of the data, in any order, must
/// leave the algorithm as training on all of the data would.
pub trait ParallelAlgorithm: Algorithm {
    /// The per-chunk computation.
    type Fork: Fork;
    /// True if the open phase can be forked.
    fn can_fork(&self) -> bool { true }
    /// Captures what the open phase needs to compute partial statistics.
    fn fork(&self) -> Result<Self::Fork, UnitError>;
    /// Merges one partial result into the open phase.
    fn join(&mut self, partial: <Self::Fork as Fork>::Partial) -> Result<(), UnitError>;
}

/// Methods for training a unit type with jobs.
#[derive(Copy, Clone)]
pub struct ParallelTraining {
    /// True if the unit's open phase can be trained with jobs.
    pub supports: fn(&dyn Unit, &Registry) -> bool,
    /// The task computing partial results for the unit's open phase.
    pub fork: fn(&dyn Unit, &Registry) -> Result<Arc<dyn Task>, UnitError>,
    /// Merges an encoded partial result into the unit's open phase.
    pub join: fn(&mut dyn Unit, &Registry, &[u8]) -> Result<(), UnitError>,
}

impl ParallelTraining {
    /// Methods for [`Node`]s of a parallel algorithm.
    pub fn of<A: ParallelAlgorithm>() -> Self {
        ParallelTraining {
            supports: supports_node::<A>,
            fork: fork_node::<A>,
            join: join_node::<A>,
        }
    }

    /// Methods for [`FlowUnit`]s, delegating to the inner unit currently training.
    pub fn flow_unit() -> Self {
        ParallelTraining {
            supports: supports_flow_unit,
            fork: fork_flow_unit,
            join: join_flow_unit,
        }
    }
}

impl std::fmt::Debug for ParallelTraining {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ParallelTraining")
    }
}

/// Marks unit types whose execution may be performed by jobs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ParallelExecution;

/// A registry with the built-in units registered under [`PARALLEL`], and that extension active.
pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.replace::<Node<Centering>, _>(PARALLEL, ParallelTraining::of::<Centering>());
    registry.replace::<Node<Standardize>, _>(PARALLEL, ParallelTraining::of::<Standardize>());
    registry.replace::<Node<KMeans>, _>(PARALLEL, ParallelTraining::of::<KMeans>());
    registry.replace::<FlowUnit, _>(PARALLEL, ParallelTraining::flow_unit());
    registry.replace::<Node<Centering>, _>(PARALLEL, ParallelExecution);
    registry.replace::<Node<Standardize>, _>(PARALLEL, ParallelExecution);
    registry.replace::<Node<KMeans>, _>(PARALLEL, ParallelExecution);
    registry.replace::<Node<QuadraticExpansion>, _>(PARALLEL, ParallelExecution);
    registry.replace::<FlowUnit, _>(PARALLEL, ParallelExecution);
    registry.enable(PARALLEL);
    registry
}

fn node<A: Algorithm>(unit: &dyn Unit) -> Result<&Node<A>, UnitError> {
    unit.downcast_ref::<Node<A>>()
        .ok_or_else(|| UnitError::Algorithm(format!("{} is not a {}", unit.name(), type_name::<Node<A>>())))
}

fn supports_node<A: ParallelAlgorithm>(unit: &dyn Unit, _registry: &Registry) -> bool {
    unit.downcast_ref::<Node<A>>()
        .is_some_and(|node| node.is_training() && node.algorithm().can_fork())
}

fn fork_node<A: ParallelAlgorithm>(unit: &dyn Unit, _registry: &Registry) -> Result<Arc<dyn Task>, UnitError> {
    let node = node::<A>(unit)?;
    node.check_training()?;
    Ok(Arc::new(ForkTask {
        fork: node.algorithm().fork()?,
        input_dim: node.input_dim(),
        dtype: node.dtype(),
    }))
}

fn join_node<A: ParallelAlgorithm>(unit: &mut dyn Unit, _registry: &Registry, payload: &[u8]) -> Result<(), UnitError> {
    let name = unit.name().to_owned();
    let node = unit.downcast_mut::<Node<A>>()
        .ok_or_else(|| UnitError::Algorithm(format!("{} is not a {}", name, type_name::<Node<A>>())))?;
    node.check_training()?;
    let (dim, dtype, partial): (usize, Dtype, <A::Fork as Fork>::Partial) = bincode::deserialize(payload)?;
    node.check(dim, dtype)?;
    node.algorithm_mut().join(partial)?;
    node.fix(dim, dtype);
    Ok(())
}

/// Computes and encodes a fork's partial result, along with the shape of the data it saw.
struct ForkTask<F> {
    fork: F,
    input_dim: Option<usize>,
    dtype: Option<Dtype>,
}

impl<F: Fork> Task for ForkTask<F> {
    fn run(&self, chunk: &Chunk) -> Result<Vec<u8>, UnitError> {
        if let Some(expected) = self.input_dim {
            if expected != chunk.dim() {
                return Err(UnitError::InconsistentDimension { expected, found: chunk.dim() });
            }
        }
        if let Some(expected) = self.dtype {
            if expected != chunk.dtype() {
                return Err(UnitError::InconsistentType { expected, found: chunk.dtype() });
            }
        }
        let partial = self.fork.compute(chunk.to_f64().view())?;
        Ok(bincode::serialize(&(chunk.dim(), chunk.dtype(), partial))?)
    }
}

fn flow_unit(unit: &dyn Unit) -> Result<&FlowUnit, UnitError> {
    unit.downcast_ref::<FlowUnit>()
        .ok_or_else(|| UnitError::Algorithm(format!("{} is not a FlowUnit", unit.name())))
}

fn supports_flow_unit(unit: &dyn Unit, registry: &Registry) -> bool {
    let Some(unit) = unit.downcast_ref::<FlowUnit>() else {
        return false;
    };
    let Some(inner) = unit.active().and_then(|index| unit.flow().unit(index)) else {
        return false;
    };
    registry
        .get::<ParallelTraining>(inner)
        .is_some_and(|methods| (methods.supports)(inner, registry))
}

fn fork_flow_unit(unit: &dyn Unit, registry: &Registry) -> Result<Arc<dyn Task>, UnitError> {
    let unit = flow_unit(unit)?;
    let index = unit.active().ok_or(UnitError::TrainingFinished)?;
    let flow = unit.flow();
    let inner = flow.unit(index).ok_or(UnitError::TrainingFinished)?;
    let methods = registry.get::<ParallelTraining>(inner).ok_or(UnitError::NotTrainable)?;
    let task = (methods.fork)(inner, registry)?;
    Ok(Arc::new(job::Prefixed { units: flow.units()[.. index].to_vec(), task }))
}

fn join_flow_unit(unit: &mut dyn Unit, registry: &Registry, payload: &[u8]) -> Result<(), UnitError> {
    let name = unit.name().to_owned();
    let unit = unit.downcast_mut::<FlowUnit>()
        .ok_or_else(|| UnitError::Algorithm(format!("{} is not a FlowUnit", name)))?;
    let (_, inner) = unit.active_mut().ok_or(UnitError::TrainingFinished)?;
    let methods = *registry.get::<ParallelTraining>(&*inner).ok_or(UnitError::NotTrainable)?;
    (methods.join)(inner, registry, payload)
}

#[cfg(test)]
mod tests {

    use ndarray::Array2;

    use crate::data::Chunk;
    use crate::error::ExtensionError;
    use crate::flow::{Flow, FlowUnit};
    use crate::unit::{Node, Unit};
    use crate::units::{Centering, QuadraticExpansion, Standardize};

    use super::{registry, ParallelExecution, ParallelTraining, PARALLEL};

    #[test]
    fn builtin_capabilities() {
        let mut registry = registry();
        let centering = Node::new(Centering::new());
        let quadratic = Node::new(QuadraticExpansion);
        assert!(registry.supports::<ParallelTraining>(&centering));
        assert!(!registry.supports::<ParallelTraining>(&quadratic));
        assert!(registry.supports::<ParallelExecution>(&quadratic));

        registry.deactivate(PARALLEL).unwrap();
        assert!(!registry.supports::<ParallelTraining>(&centering));
    }

    #[test]
    fn builtin_registrations_are_exclusive() {
        let mut registry = registry();
        assert_eq!(registry.active().collect::<Vec<_>>(), vec![PARALLEL]);
        let again = registry.register::<Node<Centering>, _>(PARALLEL, ParallelTraining::of::<Centering>());
        assert!(matches!(again, Err(ExtensionError::Duplicate { .. })));
        registry.register::<Node<QuadraticExpansion>, _>(PARALLEL, ParallelTraining::of::<Centering>()).unwrap();
        assert!(registry.supports::<ParallelTraining>(&Node::new(QuadraticExpansion)));
    }

    #[test]
    fn fork_and_join_node() {
        let registry = registry();
        let mut unit: Box<dyn Unit> = Box::new(Node::new(Centering::new()));
        let methods = *registry.get::<ParallelTraining>(&*unit).unwrap();
        assert!((methods.supports)(&*unit, &registry));
        let task = (methods.fork)(&*unit, &registry).unwrap();
        let x = Chunk::from(Array2::from_shape_fn((4, 2), |(i, j)| (i + j) as f64));
        let payload = task.run(&x).unwrap();
        (methods.join)(&mut *unit, &registry, &payload).unwrap();
        unit.stop_training().unwrap();
        assert_eq!(unit.input_dim(), Some(2));

        let mut sequential = Node::new(Centering::new());
        sequential.train(&x).unwrap();
        sequential.stop_training().unwrap();
        assert_eq!(unit.execute(&x).unwrap(), sequential.execute(&x).unwrap());
        assert!(!(methods.supports)(&*unit, &registry));
    }

    #[test]
    fn flow_unit_delegates() {
        let registry = registry();
        let inner: Vec<Box<dyn Unit>> = vec![
            Box::new(Node::new(QuadraticExpansion)),
            Box::new(Node::new(Standardize::new())),
        ];
        let unit = FlowUnit::new(Flow::new(inner).unwrap());
        let methods = *registry.get::<ParallelTraining>(&unit).unwrap();
        assert!((methods.supports)(&unit, &registry));
        let task = (methods.fork)(&unit, &registry).unwrap();
        // The quadratic expansion runs inside the task, ahead of the partial statistics.
        assert!(task.run(&Chunk::from(Array2::<f64>::ones((2, 2)))).is_ok());
    }
}

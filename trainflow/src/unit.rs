//! The unit lifecycle.
//!
//! [`Unit`] is the object-safe contract that flows and the parallel scheduler drive. Concrete
//! algorithms rarely implement it directly; instead they implement the [`Algorithm`] hooks and
//! are wrapped in a [`Node`], which takes care of dimensionality and element type checking, the
//! phase bookkeeping, and the state transitions:
//!
//! ```text
//! Untrained --train*--> Untrained --stop_training--> (Untrained: next phase | Trained)
//! NotTrainable: execution only
//! ```
//!
//! A unit may declare any positive number of training phases, including a number only known
//! once it has looked at the data; it reports this one phase at a time from `stop_training`.

use std::any::Any;
use std::fmt::Debug;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use smallvec::SmallVec;

use crate::data::{Chunk, Dtype};
use crate::error::UnitError;

/// Lifecycle state of a unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitState {
    /// A training phase is open and accepts data.
    Untrained,
    /// All training phases are closed; the unit may execute.
    Trained,
    /// The unit has no training phases and may always execute.
    NotTrainable,
}

/// What a closed training phase leads to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Another phase opens, and wants to see the data again.
    Next,
    /// Training is complete.
    Done,
}

/// A trainable, executable processing stage.
///
/// Units are exclusively owned by the flow that contains them. All side effects of these methods
/// are confined to the unit's own state.
pub trait Unit: Any + Send + Sync + 'static {
    /// A name for the kind of unit.
    fn name(&self) -> &str;
    /// Dimensionality of accepted observations, once fixed.
    fn input_dim(&self) -> Option<usize>;
    /// Dimensionality of produced observations, once known.
    fn output_dim(&self) -> Option<usize>;
    /// Element type of accepted observations, once fixed.
    fn dtype(&self) -> Option<Dtype>;
    /// True if the unit has training phases.
    fn is_trainable(&self) -> bool;
    /// True if the unit supports `invert`.
    fn is_invertible(&self) -> bool;
    /// The current lifecycle state.
    fn state(&self) -> UnitState;
    /// Identifiers of the training phases closed so far, in order.
    fn phases_completed(&self) -> &[usize];

    /// Accumulates a chunk of data into the open training phase.
    fn train(&mut self, chunk: &Chunk) -> Result<(), UnitError>;
    /// Closes the open training phase, opening the next one or completing training.
    fn stop_training(&mut self) -> Result<(), UnitError>;
    /// Maps a chunk of data through the trained unit.
    fn execute(&self, chunk: &Chunk) -> Result<Chunk, UnitError>;
    /// Maps a chunk of output back to input space.
    fn invert(&self, chunk: &Chunk) -> Result<Chunk, UnitError>;

    /// Captures the full state of the unit, including partially accumulated training data.
    fn snapshot(&self) -> Result<UnitSnapshot, UnitError>;
    /// An independent copy of the unit.
    fn boxed_clone(&self) -> Box<dyn Unit>;
    /// Upcast for downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;
    /// Mutable upcast for downcasting to the concrete type.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// True while a training phase is open.
    fn is_training(&self) -> bool {
        self.state() == UnitState::Untrained
    }
    /// True if the unit may execute.
    fn is_ready(&self) -> bool {
        self.state() != UnitState::Untrained
    }
    /// Identifier of the open training phase, if any.
    fn current_phase(&self) -> Option<usize> {
        if self.is_training() { Some(self.phases_completed().len()) } else { None }
    }
}

impl dyn Unit {
    /// Downcasts to a concrete unit type.
    pub fn downcast_ref<U: Unit>(&self) -> Option<&U> {
        self.as_any().downcast_ref::<U>()
    }
    /// Mutably downcasts to a concrete unit type.
    pub fn downcast_mut<U: Unit>(&mut self) -> Option<&mut U> {
        self.as_any_mut().downcast_mut::<U>()
    }
}

impl Clone for Box<dyn Unit> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

impl Debug for dyn Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("input_dim", &self.input_dim())
            .field("output_dim", &self.output_dim())
            .field("phases_completed", &self.phases_completed())
            .finish()
    }
}

/// The hooks a learning algorithm implements.
///
/// All values are presented in double precision; [`Node`] converts to and from the element type
/// of the data. The algorithm's serialized form must capture everything, including statistics
/// accumulated in an open phase, as it is what snapshots persist.
pub trait Algorithm: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Name identifying the algorithm in snapshots and logs.
    const NAME: &'static str;

    /// True if the algorithm has training phases.
    fn is_trainable(&self) -> bool { true }
    /// True if `invert` is implemented.
    fn is_invertible(&self) -> bool { false }
    /// Dimensionality of produced observations, given that of accepted ones.
    fn output_dim(&self, input_dim: usize) -> usize { input_dim }

    /// Accumulates statistics of `x` for the open phase.
    fn train(&mut self, _x: ArrayView2<'_, f64>) -> Result<(), UnitError> {
        Err(UnitError::NotTrainable)
    }
    /// Finalizes the open phase, reporting whether another phase follows.
    fn stop_training(&mut self) -> Result<Phase, UnitError> {
        Err(UnitError::NotTrainable)
    }
    /// Maps observations through the trained algorithm.
    fn execute(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, UnitError>;
    /// Maps produced observations back.
    fn invert(&self, _y: ArrayView2<'_, f64>) -> Result<Array2<f64>, UnitError> {
        Err(UnitError::NotInvertible)
    }
}

/// A unit driving an [`Algorithm`] through the training lifecycle.
#[derive(Clone, Debug)]
pub struct Node<A> {
    algorithm: A,
    input_dim: Option<usize>,
    dtype: Option<Dtype>,
    state: UnitState,
    phases: SmallVec<[usize; 4]>,
}

impl<A: Algorithm> Node<A> {

    /// Wraps an algorithm, with dimensionality and element type fixed by the first training data.
    pub fn new(algorithm: A) -> Self {
        let state = if algorithm.is_trainable() { UnitState::Untrained } else { UnitState::NotTrainable };
        Node {
            algorithm,
            input_dim: None,
            dtype: None,
            state,
            phases: SmallVec::new(),
        }
    }

    /// Fixes the input dimensionality up front.
    pub fn with_input_dim(mut self, input_dim: usize) -> Self {
        self.input_dim = Some(input_dim);
        self
    }

    /// Fixes the element type up front.
    pub fn with_dtype(mut self, dtype: Dtype) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// The wrapped algorithm.
    pub fn algorithm(&self) -> &A {
        &self.algorithm
    }

    /// Rebuilds a node from a snapshot, including any open-phase accumulators.
    pub fn restore(snapshot: &UnitSnapshot) -> Result<Self, UnitError> {
        if snapshot.name != A::NAME {
            return Err(UnitError::Codec(format!("snapshot of {} cannot restore {}", snapshot.name, A::NAME)));
        }
        Ok(Node {
            algorithm: bincode::deserialize(&snapshot.params)?,
            input_dim: snapshot.input_dim,
            dtype: snapshot.dtype,
            state: snapshot.state,
            phases: snapshot.phases.iter().copied().collect(),
        })
    }

    /// Validates observed data against the fixed dimensionality and type.
    pub(crate) fn check(&self, dim: usize, dtype: Dtype) -> Result<(), UnitError> {
        if let Some(expected) = self.input_dim {
            if expected != dim {
                return Err(UnitError::InconsistentDimension { expected, found: dim });
            }
        }
        if let Some(expected) = self.dtype {
            if expected != dtype {
                return Err(UnitError::InconsistentType { expected, found: dtype });
            }
        }
        Ok(())
    }

    /// Fixes dimensionality and type from accepted data, if not yet fixed.
    pub(crate) fn fix(&mut self, dim: usize, dtype: Dtype) {
        self.input_dim.get_or_insert(dim);
        self.dtype.get_or_insert(dtype);
    }

    /// Fails unless a training phase is open.
    pub(crate) fn check_training(&self) -> Result<(), UnitError> {
        match self.state {
            UnitState::Untrained => Ok(()),
            UnitState::Trained => Err(UnitError::TrainingFinished),
            UnitState::NotTrainable => Err(UnitError::NotTrainable),
        }
    }

    /// Mutable access to the algorithm for merging partial results.
    pub(crate) fn algorithm_mut(&mut self) -> &mut A {
        &mut self.algorithm
    }
}

impl<A: Algorithm> Unit for Node<A> {
    fn name(&self) -> &str { A::NAME }
    fn input_dim(&self) -> Option<usize> { self.input_dim }
    fn output_dim(&self) -> Option<usize> {
        self.input_dim.map(|dim| self.algorithm.output_dim(dim))
    }
    fn dtype(&self) -> Option<Dtype> { self.dtype }
    fn is_trainable(&self) -> bool { self.algorithm.is_trainable() }
    fn is_invertible(&self) -> bool { self.algorithm.is_invertible() }
    fn state(&self) -> UnitState { self.state }
    fn phases_completed(&self) -> &[usize] { &self.phases[..] }

    fn train(&mut self, chunk: &Chunk) -> Result<(), UnitError> {
        self.check_training()?;
        self.check(chunk.dim(), chunk.dtype())?;
        self.algorithm.train(chunk.to_f64().view())?;
        self.fix(chunk.dim(), chunk.dtype());
        Ok(())
    }

    fn stop_training(&mut self) -> Result<(), UnitError> {
        self.check_training()?;
        let phase = self.phases.len();
        let next = self.algorithm.stop_training()?;
        self.phases.push(phase);
        if next == Phase::Done {
            self.state = UnitState::Trained;
        }
        Ok(())
    }

    fn execute(&self, chunk: &Chunk) -> Result<Chunk, UnitError> {
        if self.state == UnitState::Untrained {
            return Err(UnitError::NotTrained);
        }
        self.check(chunk.dim(), chunk.dtype())?;
        let output = self.algorithm.execute(chunk.to_f64().view())?;
        Ok(Chunk::from_f64(output, chunk.dtype()))
    }

    fn invert(&self, chunk: &Chunk) -> Result<Chunk, UnitError> {
        if !self.algorithm.is_invertible() {
            return Err(UnitError::NotInvertible);
        }
        if self.state == UnitState::Untrained {
            return Err(UnitError::NotTrained);
        }
        if let Some(expected) = self.output_dim() {
            if expected != chunk.dim() {
                return Err(UnitError::InconsistentDimension { expected, found: chunk.dim() });
            }
        }
        if let Some(expected) = self.dtype {
            if expected != chunk.dtype() {
                return Err(UnitError::InconsistentType { expected, found: chunk.dtype() });
            }
        }
        let input = self.algorithm.invert(chunk.to_f64().view())?;
        Ok(Chunk::from_f64(input, chunk.dtype()))
    }

    fn snapshot(&self) -> Result<UnitSnapshot, UnitError> {
        Ok(UnitSnapshot {
            name: A::NAME.to_owned(),
            state: self.state,
            input_dim: self.input_dim,
            output_dim: self.output_dim(),
            dtype: self.dtype,
            phases: self.phases.to_vec(),
            params: bincode::serialize(&self.algorithm)?,
            inner: Vec::new(),
        })
    }

    fn boxed_clone(&self) -> Box<dyn Unit> { Box::new(self.clone()) }
    fn as_any(&self) -> &dyn Any { self }
    fn as_any_mut(&mut self) -> &mut dyn Any { self }
}

/// The persisted state of one unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnitSnapshot {
    /// Name of the kind of unit.
    pub name: String,
    /// Lifecycle state.
    pub state: UnitState,
    /// Fixed input dimensionality, if any.
    pub input_dim: Option<usize>,
    /// Known output dimensionality, if any.
    pub output_dim: Option<usize>,
    /// Fixed element type, if any.
    pub dtype: Option<Dtype>,
    /// Closed training phases.
    pub phases: Vec<usize>,
    /// Encoded algorithm parameters and accumulators; empty for composite units.
    pub params: Vec<u8>,
    /// Snapshots of contained units, for composite units.
    pub inner: Vec<UnitSnapshot>,
}

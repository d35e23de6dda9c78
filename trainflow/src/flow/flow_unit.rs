use std::any::Any;

use crate::data::{Chunk, Dtype};
use crate::error::{FlowError, UnitError};
use crate::unit::{Unit, UnitSnapshot, UnitState};
use super::Flow;

/// A flow presented as a single unit.
///
/// The phases of a `FlowUnit` are the phases of its inner units, in flow order. Each call to
/// `train` feeds the inner unit currently training, through the inner units before it; each call
/// to `stop_training` closes that unit's open phase, moving on to the next inner unit once it is
/// trained.
#[derive(Debug)]
pub struct FlowUnit {
    flow: Flow,
    /// Position of the inner unit currently training.
    active: Option<usize>,
    phases: Vec<usize>,
}

impl FlowUnit {

    /// Wraps a flow.
    pub fn new(flow: Flow) -> Self {
        let active = next_training(&flow, 0);
        FlowUnit { flow, active, phases: Vec::new() }
    }

    /// The wrapped flow.
    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    /// Unwraps the flow.
    pub fn into_flow(self) -> Flow {
        self.flow
    }

    /// Position of the inner unit currently training, if any.
    pub fn active(&self) -> Option<usize> {
        self.active
    }

    /// Mutable access to the inner unit currently training.
    pub(crate) fn active_mut(&mut self) -> Option<(usize, &mut (dyn Unit + 'static))> {
        let index = self.active?;
        self.flow.unit_mut(index).map(|unit| (index, unit))
    }

    /// Records the close of a phase of the active inner unit, advancing past it if it is trained.
    pub(crate) fn phase_closed(&mut self) {
        self.phases.push(self.phases.len());
        if let Some(index) = self.active {
            if !self.flow.units[index].is_training() {
                self.active = next_training(&self.flow, index + 1);
            }
        }
    }
}

/// The first inner unit at or after `from` with an open training phase.
fn next_training(flow: &Flow, from: usize) -> Option<usize> {
    (from .. flow.len()).find(|&index| flow.units[index].is_training())
}

/// Recovers the unit failure from an inner flow failure.
pub(crate) fn inner_error(error: FlowError) -> UnitError {
    match error {
        FlowError::Unit { source, .. } => source,
        FlowError::NotReady { .. } => UnitError::NotTrained,
        other => UnitError::Algorithm(other.to_string()),
    }
}

impl Unit for FlowUnit {
    fn name(&self) -> &str { "FlowUnit" }
    fn input_dim(&self) -> Option<usize> {
        self.flow.units.first().and_then(|unit| unit.input_dim())
    }
    fn output_dim(&self) -> Option<usize> {
        self.flow.units.last().and_then(|unit| unit.output_dim())
    }
    fn dtype(&self) -> Option<Dtype> {
        self.flow.units.first().and_then(|unit| unit.dtype())
    }
    fn is_trainable(&self) -> bool {
        self.flow.units.iter().any(|unit| unit.is_trainable())
    }
    fn is_invertible(&self) -> bool {
        self.flow.units.iter().all(|unit| unit.is_invertible())
    }
    fn state(&self) -> UnitState {
        if !self.is_trainable() {
            UnitState::NotTrainable
        } else if self.active.is_some() {
            UnitState::Untrained
        } else {
            UnitState::Trained
        }
    }
    fn phases_completed(&self) -> &[usize] {
        &self.phases[..]
    }

    fn train(&mut self, chunk: &Chunk) -> Result<(), UnitError> {
        let index = match self.active {
            Some(index) => index,
            None if self.is_trainable() => return Err(UnitError::TrainingFinished),
            None => return Err(UnitError::NotTrainable),
        };
        let x = self.flow.execute_range(0 .. index, chunk).map_err(inner_error)?;
        self.flow.units[index].train(&x)
    }

    fn stop_training(&mut self) -> Result<(), UnitError> {
        let index = match self.active {
            Some(index) => index,
            None if self.is_trainable() => return Err(UnitError::TrainingFinished),
            None => return Err(UnitError::NotTrainable),
        };
        self.flow.units[index].stop_training()?;
        self.phase_closed();
        Ok(())
    }

    fn execute(&self, chunk: &Chunk) -> Result<Chunk, UnitError> {
        if self.active.is_some() {
            return Err(UnitError::NotTrained);
        }
        self.flow
            .execute_range(0 .. self.flow.len(), chunk)
            .map(|output| output.into_owned())
            .map_err(inner_error)
    }

    fn invert(&self, chunk: &Chunk) -> Result<Chunk, UnitError> {
        if !self.is_invertible() {
            return Err(UnitError::NotInvertible);
        }
        if self.active.is_some() {
            return Err(UnitError::NotTrained);
        }
        self.flow.invert(chunk).map_err(inner_error)
    }

    fn snapshot(&self) -> Result<UnitSnapshot, UnitError> {
        let inner = self.flow.units
            .iter()
            .map(|unit| unit.snapshot())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(UnitSnapshot {
            name: self.name().to_owned(),
            state: self.state(),
            input_dim: self.input_dim(),
            output_dim: self.output_dim(),
            dtype: self.dtype(),
            phases: self.phases.clone(),
            params: Vec::new(),
            inner,
        })
    }

    fn boxed_clone(&self) -> Box<dyn Unit> {
        Box::new(FlowUnit {
            flow: self.flow.duplicate(),
            active: self.active,
            phases: self.phases.clone(),
        })
    }
    fn as_any(&self) -> &dyn Any { self }
    fn as_any_mut(&mut self) -> &mut dyn Any { self }
}

#[cfg(test)]
mod tests {

    use ndarray::Array2;

    use crate::data::{source, Batches, Chunk, DataSource};
    use crate::error::UnitError;
    use crate::flow::Flow;
    use crate::unit::{Node, Unit, UnitState};
    use crate::units::{Centering, QuadraticExpansion, Standardize};

    use super::FlowUnit;

    fn data() -> Batches {
        let chunks = (0 .. 3)
            .map(|c| Chunk::from(Array2::from_shape_fn((8, 2), |(i, j)| ((c * 8 + i) * (j + 1)) as f64 % 7.0)))
            .collect::<Vec<_>>();
        Batches::from(chunks)
    }

    fn inner() -> Flow {
        let units: Vec<Box<dyn Unit>> = vec![
            Box::new(Node::new(Standardize::new())),
            Box::new(Node::new(QuadraticExpansion)),
            Box::new(Node::new(Centering::new())),
        ];
        Flow::new(units).unwrap()
    }

    #[test]
    fn phases_span_inner_units() {
        let mut unit = FlowUnit::new(inner());
        assert_eq!(unit.state(), UnitState::Untrained);
        let data = data();
        let mut phases = 0;
        while unit.is_training() {
            for chunk in data.chunks() {
                unit.train(&chunk).unwrap();
            }
            unit.stop_training().unwrap();
            phases += 1;
        }
        assert_eq!(phases, 3);
        assert_eq!(unit.phases_completed(), &[0, 1, 2]);
        assert_eq!(unit.train(&Chunk::from(Array2::<f64>::zeros((1, 2)))), Err(UnitError::TrainingFinished));

        // The same units trained by a flow agree with the wrapped ones.
        let mut flow = inner();
        flow.train(&[source(data.clone()), None, source(data)]).unwrap();
        let x = Chunk::from(Array2::from_shape_fn((4, 2), |(i, j)| (i + 2 * j) as f64));
        let expected = flow.execute(&x).unwrap().to_f64().into_owned();
        let found = unit.execute(&x).unwrap().to_f64().into_owned();
        for (a, b) in expected.iter().zip(found.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn nested_in_flow() {
        let units: Vec<Box<dyn Unit>> = vec![
            Box::new(FlowUnit::new(inner())),
            Box::new(Node::new(Centering::new())),
        ];
        let mut flow = Flow::new(units).unwrap();
        let data = data();
        flow.train(&[source(data.clone()), source(data)]).unwrap();
        assert!(flow.is_trained());
        let snapshot = flow.snapshot().unwrap();
        assert_eq!(snapshot.units[0].inner.len(), 3);
        assert!(snapshot.units[0].params.is_empty());
        let output = flow.execute(&Chunk::from(Array2::<f64>::zeros((2, 2)))).unwrap();
        assert_eq!(output.dim(), QuadraticExpansion::expanded_dim(2));
    }

    #[test]
    fn not_trainable_inner_flow() {
        let units: Vec<Box<dyn Unit>> = vec![Box::new(Node::new(QuadraticExpansion))];
        let unit = FlowUnit::new(Flow::new(units).unwrap());
        assert_eq!(unit.state(), UnitState::NotTrainable);
        assert!(!unit.is_invertible());
        let output = unit.execute(&Chunk::from(Array2::<f64>::ones((3, 2)))).unwrap();
        assert_eq!(output.dim(), 5);
    }
}

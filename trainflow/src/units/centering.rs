//! Removes the mean of each variable.

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::UnitError;
use crate::unit::{Algorithm, Phase};
use super::Sums;

/// Subtracts the per-variable mean learned in a single training phase.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Centering {
    pub(crate) sums: Sums,
    mean: Option<Array1<f64>>,
}

impl Centering {
    /// An untrained centering algorithm.
    pub fn new() -> Self {
        Self::default()
    }

    /// The learned mean, once trained.
    pub fn mean(&self) -> Option<&Array1<f64>> {
        self.mean.as_ref()
    }

    fn learned(&self) -> Result<&Array1<f64>, UnitError> {
        self.mean.as_ref().ok_or(UnitError::NotTrained)
    }
}

impl Algorithm for Centering {
    const NAME: &'static str = "Centering";

    fn is_invertible(&self) -> bool { true }

    fn train(&mut self, x: ArrayView2<'_, f64>) -> Result<(), UnitError> {
        self.sums.add(x);
        Ok(())
    }

    fn stop_training(&mut self) -> Result<Phase, UnitError> {
        self.mean = Some(self.sums.mean()?);
        self.sums = Sums::default();
        Ok(Phase::Done)
    }

    fn execute(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, UnitError> {
        Ok(&x - self.learned()?)
    }

    fn invert(&self, y: ArrayView2<'_, f64>) -> Result<Array2<f64>, UnitError> {
        Ok(&y + self.learned()?)
    }
}

#[cfg(test)]
mod tests {

    use ndarray::array;

    use crate::data::Chunk;
    use crate::unit::{Node, Unit};
    use super::Centering;

    #[test]
    fn centers_and_restores() {
        let mut node = Node::new(Centering::new());
        node.train(&Chunk::from(array![[1.0, 10.0], [3.0, 20.0]])).unwrap();
        node.train(&Chunk::from(array![[5.0, 30.0]])).unwrap();
        node.stop_training().unwrap();

        assert_eq!(node.algorithm().mean(), Some(&array![3.0, 20.0]));
        let input = Chunk::from(array![[3.0, 21.0]]);
        let centered = node.execute(&input).unwrap();
        assert_eq!(centered, Chunk::from(array![[0.0, 1.0]]));
        assert_eq!(node.invert(&centered).unwrap(), input);
    }

    #[test]
    fn empty_phase_fails() {
        let mut node = Node::new(Centering::new());
        assert!(node.stop_training().is_err());
        assert!(node.is_training());
    }
}

//! Expands observations with all products of pairs of variables.

use itertools::Itertools;
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::UnitError;
use crate::unit::Algorithm;

/// Appends every product `x_i * x_j` with `i <= j` to the original variables.
///
/// This unit has nothing to learn, and so is not trainable.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QuadraticExpansion;

impl QuadraticExpansion {
    /// Number of produced variables for `dim` input variables.
    pub fn expanded_dim(dim: usize) -> usize {
        dim + dim * (dim + 1) / 2
    }
}

impl Algorithm for QuadraticExpansion {
    const NAME: &'static str = "QuadraticExpansion";

    fn is_trainable(&self) -> bool { false }

    fn output_dim(&self, input_dim: usize) -> usize {
        Self::expanded_dim(input_dim)
    }

    fn execute(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, UnitError> {
        let dim = x.ncols();
        let mut output = Array2::zeros((x.nrows(), Self::expanded_dim(dim)));
        for (row, mut out) in x.axis_iter(Axis(0)).zip(output.axis_iter_mut(Axis(0))) {
            for (index, value) in row.iter().enumerate() {
                out[index] = *value;
            }
            for (offset, pair) in (0 .. dim).combinations_with_replacement(2).enumerate() {
                out[dim + offset] = row[pair[0]] * row[pair[1]];
            }
        }
        Ok(output)
    }
}

//! Scales each variable to zero mean and unit variance, in two phases.

use ndarray::{s, Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::UnitError;
use crate::unit::{Algorithm, Phase};
use super::Sums;

/// Standardizes variables, optionally keeping only the leading `output_dim` of them.
///
/// The first phase learns the mean. The second phase, which needs the mean, learns the sample
/// standard deviation from summed squared deviations. Variables with no variance are left
/// unscaled.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Standardize {
    output_dim: Option<usize>,
    pub(crate) sums: Sums,
    pub(crate) mean: Option<Array1<f64>>,
    scale: Option<Array1<f64>>,
}

impl Standardize {
    /// An untrained standardization keeping all variables.
    pub fn new() -> Self {
        Self::default()
    }

    /// An untrained standardization keeping the leading `output_dim` variables.
    pub fn with_output_dim(output_dim: usize) -> Self {
        Standardize { output_dim: Some(output_dim), ..Self::default() }
    }

    /// The learned mean, once the first phase closed.
    pub fn mean(&self) -> Option<&Array1<f64>> {
        self.mean.as_ref()
    }

    /// The learned standard deviations, once trained.
    pub fn scale(&self) -> Option<&Array1<f64>> {
        self.scale.as_ref()
    }

    /// Elementwise squared deviations of `x` from `mean`.
    pub(crate) fn deviations(x: ArrayView2<'_, f64>, mean: &Array1<f64>) -> Result<Array2<f64>, UnitError> {
        if x.ncols() != mean.len() {
            return Err(UnitError::InconsistentDimension { expected: mean.len(), found: x.ncols() });
        }
        let centered = &x - mean;
        Ok(centered.mapv(|v| v * v))
    }

    fn learned(&self) -> Result<(&Array1<f64>, &Array1<f64>), UnitError> {
        match (&self.mean, &self.scale) {
            (Some(mean), Some(scale)) => Ok((mean, scale)),
            _ => Err(UnitError::NotTrained),
        }
    }
}

impl Algorithm for Standardize {
    const NAME: &'static str = "Standardize";

    fn is_invertible(&self) -> bool {
        self.output_dim.is_none()
    }

    fn output_dim(&self, input_dim: usize) -> usize {
        self.output_dim.map_or(input_dim, |dim| dim.min(input_dim))
    }

    fn train(&mut self, x: ArrayView2<'_, f64>) -> Result<(), UnitError> {
        match &self.mean {
            None => self.sums.add(x),
            Some(mean) => {
                let squares = Self::deviations(x, mean)?;
                self.sums.add(squares.view());
            }
        }
        Ok(())
    }

    fn stop_training(&mut self) -> Result<Phase, UnitError> {
        let sums = std::mem::take(&mut self.sums);
        if self.mean.is_none() {
            match sums.mean() {
                Ok(mean) => self.mean = Some(mean),
                Err(error) => {
                    self.sums = sums;
                    return Err(error);
                }
            }
            return Ok(Phase::Next);
        }
        if sums.count < 2 {
            self.sums = sums;
            return Err(UnitError::Algorithm("variance needs at least two observations".to_owned()));
        }
        let variance = &sums.values / (sums.count - 1) as f64;
        self.scale = Some(variance.mapv(|v| if v > 0.0 { v.sqrt() } else { 1.0 }));
        Ok(Phase::Done)
    }

    fn execute(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, UnitError> {
        let (mean, scale) = self.learned()?;
        let standardized = (&x - mean) / scale;
        let keep = self.output_dim(x.ncols());
        Ok(standardized.slice(s![.., .. keep]).to_owned())
    }

    fn invert(&self, y: ArrayView2<'_, f64>) -> Result<Array2<f64>, UnitError> {
        let (mean, scale) = self.learned()?;
        Ok(&(&y * scale) + mean)
    }
}

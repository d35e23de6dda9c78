//! Parallel training of the built-in units.
//!
//! Every phase of these units accumulates sums, minima or maxima, so a fork computes the same
//! accumulator over one chunk and a join merges it into the unit's own.

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::UnitError;
use crate::units::{Bounds, Centering, ClusterSums, KMeans, Standardize, Sums};
use super::{Fork, ParallelAlgorithm};

/// Column sums of the data.
#[derive(Copy, Clone, Debug, Default)]
pub struct SumsFork;

impl Fork for SumsFork {
    type Partial = Sums;
    fn compute(&self, x: ArrayView2<'_, f64>) -> Result<Sums, UnitError> {
        let mut sums = Sums::default();
        sums.add(x);
        Ok(sums)
    }
}

impl ParallelAlgorithm for Centering {
    type Fork = SumsFork;
    fn fork(&self) -> Result<SumsFork, UnitError> {
        Ok(SumsFork)
    }
    fn join(&mut self, partial: Sums) -> Result<(), UnitError> {
        self.sums.merge(partial);
        Ok(())
    }
}

/// Column sums of the data in the first phase, and of its squared deviations in the second.
#[derive(Clone, Debug)]
pub struct StandardizeFork {
    mean: Option<Array1<f64>>,
}

impl Fork for StandardizeFork {
    type Partial = Sums;
    fn compute(&self, x: ArrayView2<'_, f64>) -> Result<Sums, UnitError> {
        let mut sums = Sums::default();
        match &self.mean {
            None => sums.add(x),
            Some(mean) => sums.add(Standardize::deviations(x, mean)?.view()),
        }
        Ok(sums)
    }
}

impl ParallelAlgorithm for Standardize {
    type Fork = StandardizeFork;
    fn fork(&self) -> Result<StandardizeFork, UnitError> {
        Ok(StandardizeFork { mean: self.mean.clone() })
    }
    fn join(&mut self, partial: Sums) -> Result<(), UnitError> {
        self.sums.merge(partial);
        Ok(())
    }
}

/// Partial statistics of a k-means phase.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KMeansPartial {
    /// Range of the data, for initialization.
    Bounds(Bounds),
    /// Rows assigned to each centroid, for a Lloyd iteration.
    Assigned(ClusterSums),
}

/// The data range in the first phase, and assignments to the current centroids after.
#[derive(Clone, Debug)]
pub struct KMeansFork {
    centroids: Option<Array2<f64>>,
}

impl Fork for KMeansFork {
    type Partial = KMeansPartial;
    fn compute(&self, x: ArrayView2<'_, f64>) -> Result<KMeansPartial, UnitError> {
        match &self.centroids {
            None => {
                let mut bounds = Bounds::default();
                bounds.add(x);
                Ok(KMeansPartial::Bounds(bounds))
            }
            Some(centroids) => {
                let mut assigned = ClusterSums::new(centroids.nrows(), centroids.ncols());
                assigned.add(x, centroids)?;
                Ok(KMeansPartial::Assigned(assigned))
            }
        }
    }
}

impl ParallelAlgorithm for KMeans {
    type Fork = KMeansFork;
    fn fork(&self) -> Result<KMeansFork, UnitError> {
        let centroids = match self.assigned {
            Some(_) => self.centroids.clone(),
            None => None,
        };
        Ok(KMeansFork { centroids })
    }
    fn join(&mut self, partial: KMeansPartial) -> Result<(), UnitError> {
        match (partial, &mut self.assigned) {
            (KMeansPartial::Bounds(bounds), None) => self.bounds.merge(bounds),
            (KMeansPartial::Assigned(sums), Some(assigned)) => {
                if sums.sums.dim() != assigned.sums.dim() {
                    return Err(UnitError::Algorithm("cluster sums of a different shape".to_owned()));
                }
                assigned.merge(sums)
            }
            _ => return Err(UnitError::Algorithm("partial result belongs to another phase".to_owned())),
        }
        Ok(())
    }
}

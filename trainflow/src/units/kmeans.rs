//! Lloyd's k-means, iterated until the centroids settle.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::UnitError;
use crate::unit::{Algorithm, Phase};
use super::stats::squared_distance;
use super::{Bounds, ClusterSums};

/// Clusters observations around `clusters` centroids, producing squared distances to each.
///
/// The number of training phases depends on the data. The first phase measures the range of the
/// data and spreads the initial centroids along its diagonal, which keeps initialization
/// independent of the order in which data arrives. Each further phase is one Lloyd iteration;
/// training ends once no centroid moves further than `tolerance`, or after `max_iterations`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KMeans {
    clusters: usize,
    max_iterations: usize,
    tolerance: f64,
    pub(crate) bounds: Bounds,
    pub(crate) assigned: Option<ClusterSums>,
    pub(crate) centroids: Option<Array2<f64>>,
    iterations: usize,
    converged: bool,
}

impl KMeans {
    /// Untrained k-means with `clusters` centroids.
    pub fn new(clusters: usize) -> Self {
        KMeans {
            clusters,
            max_iterations: 100,
            tolerance: 1e-6,
            bounds: Bounds::default(),
            assigned: None,
            centroids: None,
            iterations: 0,
            converged: false,
        }
    }

    /// Sets the bound on Lloyd iterations.
    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Sets the largest centroid movement considered settled.
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// The current centroids, one per row.
    pub fn centroids(&self) -> Option<&Array2<f64>> {
        self.centroids.as_ref()
    }

    /// Number of completed Lloyd iterations.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// True if training stopped because the centroids settled.
    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Number of clusters.
    pub fn clusters(&self) -> usize {
        self.clusters
    }

    fn initialize(&mut self, bounds: &Bounds) -> Result<(), UnitError> {
        if bounds.is_empty() {
            return Err(UnitError::Algorithm("phase closed without any training data".to_owned()));
        }
        let span = &bounds.max - &bounds.min;
        let mut centroids = Array2::zeros((self.clusters, span.len()));
        for (index, mut centroid) in centroids.axis_iter_mut(Axis(0)).enumerate() {
            let position = (index as f64 + 0.5) / self.clusters as f64;
            centroid.assign(&(&bounds.min + &(&span * position)));
        }
        self.assigned = Some(ClusterSums::new(self.clusters, span.len()));
        self.centroids = Some(centroids);
        Ok(())
    }

    fn iterate(&mut self, assigned: ClusterSums) -> Result<Phase, UnitError> {
        let previous = self.centroids.as_ref().ok_or(UnitError::NotTrained)?;
        let mut centroids = previous.clone();
        for (index, mut centroid) in centroids.axis_iter_mut(Axis(0)).enumerate() {
            let count = assigned.counts[index];
            if count > 0 {
                centroid.assign(&(&assigned.sums.row(index) / count as f64));
            }
        }
        let shift = centroids
            .rows()
            .into_iter()
            .zip(previous.rows())
            .map(|(now, before)| squared_distance(now, before).sqrt())
            .fold(0.0, f64::max);

        self.iterations += 1;
        self.converged = shift <= self.tolerance;
        let dim = centroids.ncols();
        self.centroids = Some(centroids);
        if self.converged || self.iterations >= self.max_iterations {
            self.assigned = None;
            Ok(Phase::Done)
        }
        else {
            self.assigned = Some(ClusterSums::new(self.clusters, dim));
            Ok(Phase::Next)
        }
    }
}

impl Algorithm for KMeans {
    const NAME: &'static str = "KMeans";

    fn output_dim(&self, _input_dim: usize) -> usize {
        self.clusters
    }

    fn train(&mut self, x: ArrayView2<'_, f64>) -> Result<(), UnitError> {
        match (&mut self.assigned, &self.centroids) {
            (Some(assigned), Some(centroids)) => assigned.add(x, centroids),
            _ => {
                self.bounds.add(x);
                Ok(())
            }
        }
    }

    fn stop_training(&mut self) -> Result<Phase, UnitError> {
        if self.clusters == 0 {
            return Err(UnitError::Algorithm("k-means needs at least one cluster".to_owned()));
        }
        match self.assigned.take() {
            None => {
                let bounds = std::mem::take(&mut self.bounds);
                self.initialize(&bounds)?;
                Ok(Phase::Next)
            }
            Some(assigned) => self.iterate(assigned),
        }
    }

    fn execute(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, UnitError> {
        let centroids = self.centroids.as_ref().ok_or(UnitError::NotTrained)?;
        let mut output = Array2::zeros((x.nrows(), self.clusters));
        for (row, mut out) in x.rows().into_iter().zip(output.rows_mut()) {
            let distances: Array1<f64> = centroids.rows().into_iter().map(|c| squared_distance(row, c)).collect();
            out.assign(&distances);
        }
        Ok(output)
    }
}

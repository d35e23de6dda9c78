//! Mergeable training statistics.
//!
//! Each accumulator starts empty, learns its shape from the first data it sees, and supports
//! `merge`, which is associative and commutative up to floating point rounding.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::UnitError;

/// Column sums and a row count.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sums {
    /// Per-column sums; empty until data arrives.
    pub values: Array1<f64>,
    /// Number of rows summed.
    pub count: usize,
}

impl Sums {
    /// Accumulates the rows of `x`.
    pub fn add(&mut self, x: ArrayView2<'_, f64>) {
        if self.count == 0 && self.values.is_empty() {
            self.values = Array1::zeros(x.ncols());
        }
        self.values += &x.sum_axis(Axis(0));
        self.count += x.nrows();
    }

    /// Folds in another accumulator.
    pub fn merge(&mut self, other: Sums) {
        if other.values.is_empty() {
            return;
        }
        if self.values.is_empty() {
            *self = other;
        }
        else {
            self.values += &other.values;
            self.count += other.count;
        }
    }

    /// The column means; fails if no rows were seen.
    pub fn mean(&self) -> Result<Array1<f64>, UnitError> {
        if self.count == 0 {
            return Err(UnitError::Algorithm("phase closed without any training data".to_owned()));
        }
        Ok(&self.values / self.count as f64)
    }
}

/// Per-column minima and maxima.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Per-column minima; empty until data arrives.
    pub min: Array1<f64>,
    /// Per-column maxima; empty until data arrives.
    pub max: Array1<f64>,
}

impl Bounds {
    /// Widens the bounds to include the rows of `x`.
    pub fn add(&mut self, x: ArrayView2<'_, f64>) {
        for row in x.rows() {
            self.include(row);
        }
    }

    fn include(&mut self, row: ArrayView1<'_, f64>) {
        if self.min.is_empty() {
            self.min = row.to_owned();
            self.max = row.to_owned();
        }
        else {
            self.min.zip_mut_with(&row, |m, &v| *m = m.min(v));
            self.max.zip_mut_with(&row, |m, &v| *m = m.max(v));
        }
    }

    /// Folds in another accumulator.
    pub fn merge(&mut self, other: Bounds) {
        if other.min.is_empty() {
            return;
        }
        self.include(other.min.view());
        self.include(other.max.view());
    }

    /// True if no data has been seen.
    pub fn is_empty(&self) -> bool {
        self.min.is_empty()
    }
}

/// Per-cluster sums and counts of assigned rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterSums {
    /// Row `j` sums the rows assigned to cluster `j`.
    pub sums: Array2<f64>,
    /// Number of rows assigned to each cluster.
    pub counts: Vec<usize>,
}

impl ClusterSums {
    /// Empty sums for `clusters` clusters in `dim` dimensions.
    pub fn new(clusters: usize, dim: usize) -> Self {
        ClusterSums {
            sums: Array2::zeros((clusters, dim)),
            counts: vec![0; clusters],
        }
    }

    /// Assigns each row of `x` to its nearest centroid and accumulates it.
    pub fn add(&mut self, x: ArrayView2<'_, f64>, centroids: &Array2<f64>) -> Result<(), UnitError> {
        if x.ncols() != centroids.ncols() {
            return Err(UnitError::InconsistentDimension { expected: centroids.ncols(), found: x.ncols() });
        }
        for row in x.rows() {
            let cluster = nearest(row, centroids);
            let mut target = self.sums.row_mut(cluster);
            target += &row;
            self.counts[cluster] += 1;
        }
        Ok(())
    }

    /// Folds in another accumulator.
    pub fn merge(&mut self, other: ClusterSums) {
        self.sums += &other.sums;
        for (count, other) in self.counts.iter_mut().zip(other.counts) {
            *count += other;
        }
    }
}

/// Index of the centroid nearest to `row`, preferring the lowest index among ties.
pub(crate) fn nearest(row: ArrayView1<'_, f64>, centroids: &Array2<f64>) -> usize {
    let mut best = (0, f64::INFINITY);
    for (index, centroid) in centroids.rows().into_iter().enumerate() {
        let distance = squared_distance(row, centroid);
        if distance < best.1 {
            best = (index, distance);
        }
    }
    best.0
}

pub(crate) fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

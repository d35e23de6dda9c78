//! Built-in units.
//!
//! These are small, exact algorithms whose training statistics are sums, minima and maxima, so
//! their partial results merge independently of order and partitioning. They serve as reference
//! implementations of the [`Algorithm`](crate::unit::Algorithm) contract, and of its parallel
//! extension in [`crate::parallel`].

pub mod centering;
pub mod kmeans;
pub mod quadratic;
pub mod standardize;
mod stats;

pub use centering::Centering;
pub use kmeans::KMeans;
pub use quadratic::QuadraticExpansion;
pub use standardize::Standardize;
pub use stats::{Bounds, ClusterSums, Sums};

//! Dense data chunks, and the re-iterable sources that produce them.
//!
//! A [`Chunk`] is a two-dimensional array of observations (rows) by variables (columns), in one
//! of the supported element types. Training visits data once per phase, so sources must be able
//! to start a fresh pass on demand; this is what [`DataSource`] provides.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

/// The numeric element type of a chunk.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dtype {
    /// Single precision.
    F32,
    /// Double precision.
    F64,
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dtype::F32 => f.write_str("f32"),
            Dtype::F64 => f.write_str("f64"),
        }
    }
}

/// A block of observations, one per row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Chunk {
    /// Single precision observations.
    F32(Array2<f32>),
    /// Double precision observations.
    F64(Array2<f64>),
}

impl Chunk {
    /// The element type of the chunk.
    pub fn dtype(&self) -> Dtype {
        match self {
            Chunk::F32(_) => Dtype::F32,
            Chunk::F64(_) => Dtype::F64,
        }
    }

    /// Number of observations.
    pub fn rows(&self) -> usize {
        match self {
            Chunk::F32(x) => x.nrows(),
            Chunk::F64(x) => x.nrows(),
        }
    }

    /// Number of variables, the dimensionality of each observation.
    pub fn dim(&self) -> usize {
        match self {
            Chunk::F32(x) => x.ncols(),
            Chunk::F64(x) => x.ncols(),
        }
    }

    /// The observations as double precision values, borrowed when no conversion is needed.
    pub fn to_f64(&self) -> Cow<'_, Array2<f64>> {
        match self {
            Chunk::F32(x) => Cow::Owned(x.mapv(f64::from)),
            Chunk::F64(x) => Cow::Borrowed(x),
        }
    }

    /// Builds a chunk of element type `dtype` from double precision values.
    pub fn from_f64(values: Array2<f64>, dtype: Dtype) -> Chunk {
        match dtype {
            Dtype::F32 => Chunk::F32(values.mapv(|x| x as f32)),
            Dtype::F64 => Chunk::F64(values),
        }
    }

    /// Splits the chunk into consecutive blocks of at most `rows` observations.
    ///
    /// A `rows` of zero, or one at least the length of the chunk, leaves it whole.
    pub fn split_rows(&self, rows: usize) -> Vec<Chunk> {
        if rows == 0 || rows >= self.rows() {
            return vec![self.clone()];
        }
        match self {
            Chunk::F32(x) => x.axis_chunks_iter(Axis(0), rows).map(|b| Chunk::F32(b.to_owned())).collect(),
            Chunk::F64(x) => x.axis_chunks_iter(Axis(0), rows).map(|b| Chunk::F64(b.to_owned())).collect(),
        }
    }
}

impl From<Array2<f64>> for Chunk {
    fn from(values: Array2<f64>) -> Self { Chunk::F64(values) }
}

impl From<Array2<f32>> for Chunk {
    fn from(values: Array2<f32>) -> Self { Chunk::F32(values) }
}

/// A finite sequence of chunks that can be traversed any number of times.
///
/// Each call to `chunks` starts a new pass; multi-phase units see the same data once per phase.
pub trait DataSource {
    /// Starts a fresh pass over the data.
    fn chunks(&self) -> Box<dyn Iterator<Item = Chunk>>;
}

/// A single chunk is a source yielding just itself.
impl DataSource for Chunk {
    fn chunks(&self) -> Box<dyn Iterator<Item = Chunk>> {
        Box::new(std::iter::once(self.clone()))
    }
}

/// An in-memory list of chunks, shared between passes.
#[derive(Clone, Debug)]
pub struct Batches {
    chunks: Arc<[Chunk]>,
}

impl Batches {
    /// Number of chunks in each pass.
    pub fn len(&self) -> usize { self.chunks.len() }
    /// True if passes yield no chunks.
    pub fn is_empty(&self) -> bool { self.chunks.is_empty() }
}

impl From<Vec<Chunk>> for Batches {
    fn from(chunks: Vec<Chunk>) -> Self {
        Batches { chunks: chunks.into() }
    }
}

impl DataSource for Batches {
    fn chunks(&self) -> Box<dyn Iterator<Item = Chunk>> {
        let chunks = Arc::clone(&self.chunks);
        Box::new((0 .. chunks.len()).map(move |index| chunks[index].clone()))
    }
}

/// A source that calls a closure to start each pass, for data generated on the fly.
pub struct FromFn<F> {
    start: F,
}

/// Wraps a closure producing a fresh iterator of chunks as a [`DataSource`].
pub fn from_fn<F, I>(start: F) -> FromFn<F>
where
    F: Fn() -> I,
    I: IntoIterator<Item = Chunk>,
    I::IntoIter: 'static,
{
    FromFn { start }
}

impl<F, I> DataSource for FromFn<F>
where
    F: Fn() -> I,
    I: IntoIterator<Item = Chunk>,
    I::IntoIter: 'static,
{
    fn chunks(&self) -> Box<dyn Iterator<Item = Chunk>> {
        Box::new((self.start)().into_iter())
    }
}

/// The training data for a flow: one optional source per unit.
pub type Sources = Vec<Option<Box<dyn DataSource>>>;

/// Boxes a source for use in [`Sources`].
pub fn source<D: DataSource + 'static>(data: D) -> Option<Box<dyn DataSource>> {
    Some(Box::new(data))
}

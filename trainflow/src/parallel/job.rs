//! Jobs handed to external executors, and the results they return.

use std::borrow::Cow;
use std::fmt::{self, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::data::Chunk;
use crate::error::UnitError;
use crate::unit::Unit;

/// Identifies a job among those issued by one scheduler operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId {
    /// Position of the unit the job trains, or of the first unit it executes.
    pub unit: usize,
    /// Training phase of the unit, or `None` for execution jobs.
    pub phase: Option<usize>,
    /// Position of the job's data among the jobs of this unit and phase.
    pub seq: usize,
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            Some(phase) => write!(f, "(unit {}, phase {}, job {})", self.unit, phase, self.seq),
            None => write!(f, "(unit {}, execute, job {})", self.unit, self.seq),
        }
    }
}

/// The pure computation a job performs on its data.
///
/// Tasks capture only immutable state, and return an encoded value rather than mutating anything;
/// all mutation happens when the scheduler merges results.
pub trait Task: Send + Sync {
    /// Computes the encoded result for one chunk of data.
    fn run(&self, chunk: &Chunk) -> Result<Vec<u8>, UnitError>;
}

/// A self-contained unit of work.
///
/// A job holds its data, immutable copies of the trained units its data must first pass through,
/// and the task to apply. It may be run on any thread, any number of times, in any order relative
/// to other jobs.
#[derive(Clone)]
pub struct Job {
    id: JobId,
    chunk: Chunk,
    upstream: Arc<[Box<dyn Unit>]>,
    task: Arc<dyn Task>,
}

impl Job {

    pub(crate) fn new(id: JobId, chunk: Chunk, upstream: Arc<[Box<dyn Unit>]>, task: Arc<dyn Task>) -> Self {
        Job { id, chunk, upstream, task }
    }

    /// The job's identifier.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// The data the job works on, before any upstream units.
    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    /// Runs the job.
    pub fn run(&self) -> Result<JobResult, UnitError> {
        let mut data = Cow::Borrowed(&self.chunk);
        for unit in self.upstream.iter() {
            data = Cow::Owned(unit.execute(&data)?);
        }
        Ok(JobResult { id: self.id, payload: self.task.run(&data)? })
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("rows", &self.chunk.rows())
            .field("upstream", &self.upstream.len())
            .finish()
    }
}

/// The outcome of running a job, to be returned to the scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// The job that produced the result.
    pub id: JobId,
    /// The encoded partial result.
    pub payload: Vec<u8>,
}

/// Applies a task after a fixed chain of units.
pub(crate) struct Prefixed {
    pub(crate) units: Vec<Box<dyn Unit>>,
    pub(crate) task: Arc<dyn Task>,
}

impl Task for Prefixed {
    fn run(&self, chunk: &Chunk) -> Result<Vec<u8>, UnitError> {
        let mut data = Cow::Borrowed(chunk);
        for unit in self.units.iter() {
            data = Cow::Owned(unit.execute(&data)?);
        }
        self.task.run(&data)
    }
}

/// Maps data through a chain of units, encoding the output.
pub(crate) struct Execute {
    pub(crate) units: Vec<Box<dyn Unit>>,
}

impl Task for Execute {
    fn run(&self, chunk: &Chunk) -> Result<Vec<u8>, UnitError> {
        let mut data = Cow::Borrowed(chunk);
        for unit in self.units.iter() {
            data = Cow::Owned(unit.execute(&data)?);
        }
        Ok(bincode::serialize(data.as_ref())?)
    }
}

#[cfg(test)]
mod tests {

    use std::sync::Arc;

    use ndarray::array;

    use crate::data::Chunk;
    use crate::unit::{Node, Unit};
    use crate::units::QuadraticExpansion;

    use super::{Execute, Job, JobId};

    #[test]
    fn execute_job_runs_upstream() {
        let upstream: Vec<Box<dyn Unit>> = vec![Box::new(Node::new(QuadraticExpansion))];
        let task = Execute { units: vec![Box::new(Node::new(QuadraticExpansion))] };
        let id = JobId { unit: 1, phase: None, seq: 0 };
        let job = Job::new(id, Chunk::from(array![[1.0]]), upstream.into(), Arc::new(task));
        let result = job.run().unwrap();
        assert_eq!(result.id, id);
        let output: Chunk = bincode::deserialize(&result.payload).unwrap();
        // [1] -> [1, 1] -> [1, 1, 1, 1, 1]
        assert_eq!(output, Chunk::from(array![[1.0, 1.0, 1.0, 1.0, 1.0]]));
        assert_eq!(id.to_string(), "(unit 1, execute, job 0)");
    }
}

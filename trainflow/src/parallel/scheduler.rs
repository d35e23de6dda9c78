//! The pull-based parallel scheduler.
//!
//! A [`ParallelFlow`] drives a [`Flow`] through training or execution by handing out [`Job`]s and
//! merging the [`JobResult`]s it is given back. It performs no concurrency of its own and never
//! blocks: the caller polls for jobs, runs them however it likes, and returns their results in any
//! order and any batching.
//!
//! ```text
//! parallel_train(sources)
//! while is_parallel_training() {
//!     while job_available() { run get_job() somewhere }
//!     use_results(finished results)
//! }
//! ```
//!
//! Training proceeds unit by unit and phase by phase, as in [`Flow::train`]. At the start of each
//! phase the unit is probed for the [`ParallelTraining`] capability; if present, the phase is split
//! into one job per chunk of data, otherwise the scheduler trains the phase itself before moving
//! on. Execution splits the flow into segments of units with the [`ParallelExecution`] capability,
//! run as jobs, and units without it, run by the scheduler.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::data::{Chunk, Sources};
use crate::error::{FlowError, SchedulerError};
use crate::extension::Registry;
use crate::flow::{stop_requested, Checkpoint, Flow, Training};
use crate::logging::{ExecuteEvent, FallbackEvent, JobEvent, JobEventKind, StartStop, TrainEvent};
use crate::unit::Unit;

use super::job::Execute;
use super::{Job, JobId, JobResult, ParallelExecution, ParallelTraining, Task};

/// What a scheduler call left the current operation at.
#[derive(Clone, Debug, PartialEq)]
pub enum Progress {
    /// The operation awaits the results of further jobs.
    Pending,
    /// Training ended.
    Trained(Training),
    /// Execution ended, with one output per input chunk, in input order.
    Executed(Vec<Chunk>),
}

/// Drives a flow by issuing jobs and merging their results.
pub struct ParallelFlow {
    flow: Flow,
    registry: Registry,
    mode: Mode,
}

enum Mode {
    Idle,
    Training(TrainingRun),
    Executing(ExecutionRun),
}

impl ParallelFlow {

    /// Drives `flow` using the built-in parallel capabilities.
    pub fn new(flow: Flow) -> Self {
        ParallelFlow::with_registry(flow, super::registry())
    }

    /// Drives `flow`, probing capabilities in `registry`.
    pub fn with_registry(flow: Flow, registry: Registry) -> Self {
        ParallelFlow { flow, registry, mode: Mode::Idle }
    }

    /// The driven flow.
    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    /// Mutable access to the driven flow, unless an operation is in progress.
    pub fn flow_mut(&mut self) -> Result<&mut Flow, SchedulerError> {
        match self.mode {
            Mode::Idle => Ok(&mut self.flow),
            _ => Err(SchedulerError::Busy),
        }
    }

    /// Releases the driven flow, abandoning any operation in progress.
    pub fn into_flow(self) -> Flow {
        self.flow
    }

    /// The registry capabilities are probed in.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Mutable access to the registry.
    ///
    /// Capabilities are probed at the start of each phase, and the phase's results are merged
    /// with the capabilities it was forked with, so changes affect later phases only.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Begins training the flow with one data source per unit.
    ///
    /// Phases that cannot be trained with jobs are trained before this returns, up to the first
    /// phase that can.
    pub fn parallel_train(&mut self, sources: Sources) -> Result<Progress, SchedulerError> {
        self.start_training(sources, None)
    }

    /// Begins training the flow, invoking `checkpoint` as each trainable unit finishes.
    pub fn parallel_train_with_checkpoint(&mut self, sources: Sources, checkpoint: Box<dyn Checkpoint>) -> Result<Progress, SchedulerError> {
        self.start_training(sources, Some(checkpoint))
    }

    fn start_training(&mut self, sources: Sources, checkpoint: Option<Box<dyn Checkpoint>>) -> Result<Progress, SchedulerError> {
        if !matches!(self.mode, Mode::Idle) {
            return Err(SchedulerError::Busy);
        }
        if sources.len() != self.flow.len() {
            return Err(FlowError::SourceCount { expected: self.flow.len(), found: sources.len() }.into());
        }
        self.mode = Mode::Training(TrainingRun { sources, checkpoint, index: 0, round: None });
        self.advance()
    }

    /// Begins mapping chunks of data through the trained flow.
    ///
    /// The outputs are returned, in input order, by the call that completes the execution.
    pub fn parallel_execute(&mut self, data: Vec<Chunk>) -> Result<Progress, SchedulerError> {
        if !matches!(self.mode, Mode::Idle) {
            return Err(SchedulerError::Busy);
        }
        if let Some(index) = (0 .. self.flow.len()).find(|&index| !self.flow.units()[index].is_ready()) {
            return Err(FlowError::NotReady { index }.into());
        }
        if let Some(logger) = self.flow.logger() {
            let rows = data.iter().map(Chunk::rows).sum();
            logger.log(ExecuteEvent { units: self.flow.len(), rows, start_stop: StartStop::Start });
        }
        self.mode = Mode::Executing(ExecutionRun { data, index: 0, end: 0, round: None });
        self.advance()
    }

    /// Maps a chunk through the flow without jobs.
    pub fn execute(&self, chunk: &Chunk) -> Result<Chunk, SchedulerError> {
        Ok(self.flow.execute(chunk)?)
    }

    /// True while any unit still needs training.
    pub fn is_parallel_training(&self) -> bool {
        matches!(self.mode, Mode::Training(_))
    }

    /// True while a parallel execution awaits results.
    pub fn is_parallel_executing(&self) -> bool {
        matches!(self.mode, Mode::Executing(_))
    }

    /// True if [`get_job`](ParallelFlow::get_job) would return a job.
    pub fn job_available(&self) -> bool {
        self.round().is_some_and(|round| round.next.is_some())
    }

    /// Number of issued jobs whose results have not yet been used.
    pub fn outstanding(&self) -> usize {
        self.round().map_or(0, |round| round.outstanding.len())
    }

    /// Hands out the next job.
    pub fn get_job(&mut self) -> Result<Job, SchedulerError> {
        let job = self.round_mut().and_then(Round::next_job).ok_or(SchedulerError::NoJob)?;
        if let Some(logger) = self.flow.logger() {
            logger.log(JobEvent { id: job.id(), kind: JobEventKind::Issued });
        }
        Ok(job)
    }

    /// Merges the results of issued jobs, in any order.
    ///
    /// Results may be returned in batches of any size. The whole batch is validated before any
    /// of it is merged, so a rejected batch leaves the scheduler unchanged. Once every job of a
    /// phase has been merged the phase is closed and the operation moves on, possibly issuing
    /// further jobs.
    pub fn use_results(&mut self, results: Vec<JobResult>) -> Result<Progress, SchedulerError> {
        let merged = {
            let round = match &mut self.mode {
                Mode::Idle => return Err(SchedulerError::Idle),
                Mode::Training(run) => run.round.as_mut(),
                Mode::Executing(run) => run.round.as_mut(),
            };
            let Some(round) = round else {
                return Err(SchedulerError::ResultCount { outstanding: 0, received: results.len() });
            };
            round.check(&results)?;
            round.merge(&mut self.flow, results)
        };
        match merged {
            Ok(()) => self.advance(),
            Err(error) => Err(self.fail(error)),
        }
    }

    fn round(&self) -> Option<&Round> {
        match &self.mode {
            Mode::Idle => None,
            Mode::Training(run) => run.round.as_ref(),
            Mode::Executing(run) => run.round.as_ref(),
        }
    }

    fn round_mut(&mut self) -> Option<&mut Round> {
        match &mut self.mode {
            Mode::Idle => None,
            Mode::Training(run) => run.round.as_mut(),
            Mode::Executing(run) => run.round.as_mut(),
        }
    }

    /// Moves the current operation forward until it awaits job results or ends.
    fn advance(&mut self) -> Result<Progress, SchedulerError> {
        match std::mem::replace(&mut self.mode, Mode::Idle) {
            Mode::Idle => Err(SchedulerError::Idle),
            Mode::Training(mut run) => {
                let job_rows = self.flow.config().job_rows;
                match run.advance(&mut self.flow, &self.registry, job_rows) {
                    Ok(Some(training)) => Ok(Progress::Trained(training)),
                    Ok(None) => {
                        self.mode = Mode::Training(run);
                        Ok(Progress::Pending)
                    }
                    Err(error) => Err(self.fail(error)),
                }
            }
            Mode::Executing(mut run) => {
                match run.advance(&self.flow, &self.registry) {
                    Ok(Some(outputs)) => {
                        if let Some(logger) = self.flow.logger() {
                            let rows = outputs.iter().map(Chunk::rows).sum();
                            logger.log(ExecuteEvent { units: self.flow.len(), rows, start_stop: StartStop::Stop });
                        }
                        Ok(Progress::Executed(outputs))
                    }
                    Ok(None) => {
                        self.mode = Mode::Executing(run);
                        Ok(Progress::Pending)
                    }
                    Err(error) => Err(self.fail(error)),
                }
            }
        }
    }

    /// Abandons the current operation, persisting the flow if a unit failed.
    fn fail(&mut self, error: FlowError) -> SchedulerError {
        self.mode = Mode::Idle;
        SchedulerError::Flow(self.flow.recover(error))
    }
}

impl fmt::Debug for ParallelFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            Mode::Idle => "idle",
            Mode::Training(_) => "training",
            Mode::Executing(_) => "executing",
        };
        f.debug_struct("ParallelFlow")
            .field("flow", &self.flow)
            .field("registry", &self.registry)
            .field("mode", &mode)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// How the results of a round are merged.
enum Merge {
    /// Joined into the training unit, with the registry as it was when the phase was forked.
    Join {
        methods: ParallelTraining,
        registry: Registry,
    },
    /// Collected as execution outputs, by sequence number.
    Collect(Vec<Option<Chunk>>),
}

/// The jobs of one training phase, or of one execution segment.
struct Round {
    unit: usize,
    phase: Option<usize>,
    chunks: Box<dyn Iterator<Item = Chunk>>,
    /// The data of the next job, if any.
    next: Option<Chunk>,
    upstream: Arc<[Box<dyn Unit>]>,
    task: Arc<dyn Task>,
    issued: usize,
    outstanding: BTreeSet<usize>,
    merge: Merge,
}

impl Round {

    fn new(
        unit: usize,
        phase: Option<usize>,
        mut chunks: Box<dyn Iterator<Item = Chunk>>,
        upstream: Arc<[Box<dyn Unit>]>,
        task: Arc<dyn Task>,
        merge: Merge,
    ) -> Self {
        let next = chunks.next();
        Round { unit, phase, chunks, next, upstream, task, issued: 0, outstanding: BTreeSet::new(), merge }
    }

    fn next_job(&mut self) -> Option<Job> {
        let chunk = self.next.take()?;
        self.next = self.chunks.next();
        let id = JobId { unit: self.unit, phase: self.phase, seq: self.issued };
        self.issued += 1;
        self.outstanding.insert(id.seq);
        Some(Job::new(id, chunk, Arc::clone(&self.upstream), Arc::clone(&self.task)))
    }

    /// True once every job has been issued and its result merged.
    fn is_finished(&self) -> bool {
        self.next.is_none() && self.outstanding.is_empty()
    }

    /// Checks that every result answers a distinct outstanding job of this round.
    fn check(&self, results: &[JobResult]) -> Result<(), SchedulerError> {
        if results.len() > self.outstanding.len() {
            return Err(SchedulerError::ResultCount { outstanding: self.outstanding.len(), received: results.len() });
        }
        let mut seen = BTreeSet::new();
        for result in results {
            let id = result.id;
            let expected = id.unit == self.unit && id.phase == self.phase && self.outstanding.contains(&id.seq);
            if !expected || !seen.insert(id.seq) {
                return Err(SchedulerError::UnexpectedResult(id));
            }
        }
        Ok(())
    }

    /// Merges checked results in job order.
    fn merge(&mut self, flow: &mut Flow, mut results: Vec<JobResult>) -> Result<(), FlowError> {
        results.sort_by_key(|result| result.id.seq);
        let logger = flow.logger();
        for result in results {
            match &mut self.merge {
                Merge::Join { methods, registry } => {
                    let unit = flow.unit_mut(self.unit).ok_or(FlowError::NotReady { index: self.unit })?;
                    (methods.join)(unit, registry, &result.payload).map_err(|error| FlowError::unit(self.unit, error))?;
                }
                Merge::Collect(outputs) => {
                    let output: Chunk = bincode::deserialize(&result.payload)
                        .map_err(|error| FlowError::unit(self.unit, error.into()))?;
                    outputs[result.id.seq] = Some(output);
                }
            }
            self.outstanding.remove(&result.id.seq);
            if let Some(logger) = &logger {
                logger.log(JobEvent { id: result.id, kind: JobEventKind::Merged });
            }
        }
        Ok(())
    }
}

/// Progress of a parallel training operation.
struct TrainingRun {
    sources: Sources,
    checkpoint: Option<Box<dyn Checkpoint>>,
    /// Position of the unit being trained.
    index: usize,
    round: Option<Round>,
}

impl TrainingRun {

    /// Trains until a phase awaits job results, returning the outcome once training ends.
    fn advance(&mut self, flow: &mut Flow, registry: &Registry, job_rows: Option<usize>) -> Result<Option<Training>, FlowError> {
        loop {
            if let Some(round) = &self.round {
                if !round.is_finished() {
                    return Ok(None);
                }
                let (index, phase) = (round.unit, round.phase.unwrap_or(0));
                self.round = None;
                close_phase(flow, index, phase)?;
                continue;
            }

            let index = self.index;
            let Some(unit) = flow.unit(index) else {
                return Ok(Some(Training::Complete));
            };
            if !unit.is_trainable() {
                self.index += 1;
                continue;
            }
            let Some(phase) = unit.current_phase() else {
                self.index += 1;
                if let Some(checkpoint) = self.checkpoint.as_deref_mut() {
                    if stop_requested(checkpoint, index, flow)? {
                        return Ok(Some(Training::Stopped { after: index }));
                    }
                }
                continue;
            };
            let source = self.sources[index].as_deref().ok_or(FlowError::MissingSource { index })?;
            let logger = flow.logger();
            if let Some(logger) = &logger {
                logger.log(TrainEvent { unit: index, phase, start_stop: StartStop::Start });
            }

            let methods = registry
                .get::<ParallelTraining>(unit)
                .copied()
                .filter(|methods| (methods.supports)(unit, registry));
            match methods {
                Some(methods) => {
                    let task = (methods.fork)(unit, registry).map_err(|error| FlowError::unit(index, error))?;
                    let upstream: Arc<[Box<dyn Unit>]> = flow.units()[.. index].to_vec().into();
                    let chunks: Box<dyn Iterator<Item = Chunk>> = match job_rows {
                        Some(rows) => Box::new(source.chunks().flat_map(move |chunk| chunk.split_rows(rows))),
                        None => source.chunks(),
                    };
                    let merge = Merge::Join { methods, registry: registry.clone() };
                    self.round = Some(Round::new(index, Some(phase), chunks, upstream, task, merge));
                }
                None => {
                    if let Some(logger) = &logger {
                        logger.log(FallbackEvent { unit: index, phase });
                    }
                    for chunk in source.chunks() {
                        let x = flow.execute_range(0 .. index, &chunk)?;
                        if let Some(target) = flow.unit_mut(index) {
                            target.train(&x).map_err(|error| FlowError::unit(index, error))?;
                        }
                    }
                    close_phase(flow, index, phase)?;
                }
            }
        }
    }
}

/// Closes the open phase of the unit at `index`.
fn close_phase(flow: &mut Flow, index: usize, phase: usize) -> Result<(), FlowError> {
    if let Some(unit) = flow.unit_mut(index) {
        unit.stop_training().map_err(|error| FlowError::unit(index, error))?;
    }
    if let Some(logger) = flow.logger() {
        logger.log(TrainEvent { unit: index, phase, start_stop: StartStop::Stop });
    }
    Ok(())
}

/// Progress of a parallel execution.
struct ExecutionRun {
    /// Every chunk, mapped through the units before `index`.
    data: Vec<Chunk>,
    /// Position of the first unit not yet applied.
    index: usize,
    /// End of the segment executed by the current round.
    end: usize,
    round: Option<Round>,
}

impl ExecutionRun {

    /// Executes until a segment awaits job results, returning the outputs once execution ends.
    fn advance(&mut self, flow: &Flow, registry: &Registry) -> Result<Option<Vec<Chunk>>, FlowError> {
        loop {
            if let Some(round) = self.round.take() {
                if !round.is_finished() {
                    self.round = Some(round);
                    return Ok(None);
                }
                if let Merge::Collect(outputs) = round.merge {
                    self.data = outputs.into_iter().flatten().collect();
                }
                self.index = self.end;
                continue;
            }

            let index = self.index;
            let Some(unit) = flow.unit(index) else {
                return Ok(Some(std::mem::take(&mut self.data)));
            };
            let units = flow.units();
            let end = (index .. units.len())
                .find(|&next| !units[next].is_ready() || !registry.supports::<ParallelExecution>(&*units[next]))
                .unwrap_or(units.len());
            if end > index {
                let data = std::mem::take(&mut self.data);
                let outputs = vec![None; data.len()];
                let task = Execute { units: units[index .. end].to_vec() };
                let upstream: Arc<[Box<dyn Unit>]> = Arc::from(Vec::new());
                self.round = Some(Round::new(index, None, Box::new(data.into_iter()), upstream, Arc::new(task), Merge::Collect(outputs)));
                self.end = end;
            } else {
                if !unit.is_ready() {
                    return Err(FlowError::NotReady { index });
                }
                self.data = self.data
                    .iter()
                    .map(|chunk| unit.execute(chunk).map_err(|error| FlowError::unit(index, error)))
                    .collect::<Result<Vec<_>, _>>()?;
                self.index += 1;
            }
        }
    }
}

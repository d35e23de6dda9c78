use std::sync::{Arc, Mutex};
use std::time::Duration;

use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use trainflow::data::{source, Batches, Sources};
use trainflow::extension::Registry;
use trainflow::logging::{FlowEvent, LOG_NAME};
use trainflow::parallel::{ParallelTraining, PARALLEL};
use trainflow::units::{Centering, KMeans, QuadraticExpansion, Standardize};
use trainflow::{Chunk, Config, Flow, FlowUnit, JobResult, Node, ParallelFlow, Progress, SchedulerError, Training, Unit};

fn uniform(rng: &mut SmallRng, count: usize, rows: usize, cols: usize) -> Batches {
    let chunks = (0 .. count)
        .map(|_| Chunk::from(Array2::from_shape_fn((rows, cols), |_| rng.gen::<f64>())))
        .collect::<Vec<_>>();
    Batches::from(chunks)
}

/// Points scattered around three well separated centers on the diagonal.
fn blobs(rng: &mut SmallRng, count: usize, rows: usize) -> Batches {
    let chunks = (0 .. count)
        .map(|_| {
            let mut x = Array2::zeros((rows, 2));
            for mut row in x.rows_mut() {
                let center = 10.0 * rng.gen_range(0 .. 3) as f64;
                row[0] = center + rng.gen::<f64>();
                row[1] = center + rng.gen::<f64>();
            }
            Chunk::from(x)
        })
        .collect::<Vec<_>>();
    Batches::from(chunks)
}

/// Runs every job as soon as it is available, handing back each round's results at once.
fn run_all(scheduler: &mut ParallelFlow, mut progress: Progress) -> (Progress, usize) {
    let mut jobs = 0;
    while progress == Progress::Pending {
        let mut results = Vec::new();
        while scheduler.job_available() {
            results.push(scheduler.get_job().unwrap().run().unwrap());
        }
        jobs += results.len();
        progress = scheduler.use_results(results).unwrap();
    }
    (progress, jobs)
}

fn assert_close(a: &Chunk, b: &Chunk) {
    assert_eq!(a.rows(), b.rows());
    assert_eq!(a.dim(), b.dim());
    for (x, y) in a.to_f64().iter().zip(b.to_f64().iter()) {
        assert!((x - y).abs() < 1e-8, "{} differs from {}", x, y);
    }
}

fn capture(flow: &mut Flow) -> Arc<Mutex<Vec<FlowEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    flow.log_register().insert::<FlowEvent, _>(LOG_NAME, move |_time: &Duration, data: &mut Vec<(Duration, FlowEvent)>| {
        sink.lock().unwrap().extend(data.drain(..).map(|(_, event)| event));
    });
    events
}

#[test]
fn one_job_per_chunk_and_phase() {
    let mut rng = SmallRng::seed_from_u64(1);
    let units: Vec<Box<dyn Unit>> = vec![
        Box::new(Node::new(Standardize::new())),
        Box::new(Node::new(Centering::new())),
    ];
    let mut scheduler = ParallelFlow::new(Flow::new(units).unwrap());
    let first = uniform(&mut rng, 6, 20, 10);
    let second = uniform(&mut rng, 6, 20, 10);

    let progress = scheduler.parallel_train(vec![source(first), source(second)]).unwrap();
    assert!(scheduler.is_parallel_training());
    assert_eq!(scheduler.outstanding(), 0);

    // Two phases of standardization and one of centering, six chunks each.
    let (progress, jobs) = run_all(&mut scheduler, progress);
    assert_eq!(progress, Progress::Trained(Training::Complete));
    assert_eq!(jobs, 18);
    assert!(!scheduler.is_parallel_training());
    assert!(scheduler.flow().is_trained());

    let output = scheduler.execute(&Chunk::from(Array2::<f64>::zeros((100, 10)))).unwrap();
    assert_eq!((output.rows(), output.dim()), (100, 10));
}

#[test]
fn jobs_carry_upstream_units() {
    let mut rng = SmallRng::seed_from_u64(2);
    let units: Vec<Box<dyn Unit>> = vec![
        Box::new(Node::new(Standardize::new())),
        Box::new(Node::new(QuadraticExpansion)),
        Box::new(Node::new(Centering::new())),
    ];
    let mut sequential = Flow::new(units.clone()).unwrap();
    let mut scheduler = ParallelFlow::new(Flow::new(units).unwrap());
    let data = uniform(&mut rng, 4, 12, 3);

    let progress = scheduler.parallel_train(vec![source(data.clone()), None, source(data.clone())]).unwrap();
    let (_, jobs) = run_all(&mut scheduler, progress);
    assert_eq!(jobs, 12);
    sequential.train(&[source(data.clone()), None, source(data)]).unwrap();

    let input = Chunk::from(Array2::from_shape_fn((7, 3), |(i, j)| (i as f64 - j as f64) / 3.0));
    assert_close(&scheduler.execute(&input).unwrap(), &sequential.execute(&input).unwrap());
}

#[test]
fn merge_order_and_batching_are_irrelevant() {
    let mut rng = SmallRng::seed_from_u64(3);
    let data = blobs(&mut rng, 8, 15);
    let units: Vec<Box<dyn Unit>> = vec![Box::new(Node::new(KMeans::new(3)))];

    let mut ordered = ParallelFlow::new(Flow::new(units.clone()).unwrap());
    let progress = ordered.parallel_train(vec![source(data.clone())]).unwrap();
    run_all(&mut ordered, progress);

    let mut shuffled = ParallelFlow::new(Flow::new(units.clone()).unwrap());
    let mut progress = shuffled.parallel_train(vec![source(data.clone())]).unwrap();
    while progress == Progress::Pending {
        let mut results: Vec<JobResult> = Vec::new();
        while shuffled.job_available() {
            results.push(shuffled.get_job().unwrap().run().unwrap());
        }
        results.shuffle(&mut rng);
        while results.len() > 1 {
            let size = rng.gen_range(1 .. results.len());
            let batch = results.split_off(results.len() - size);
            assert_eq!(shuffled.use_results(batch).unwrap(), Progress::Pending);
        }
        progress = shuffled.use_results(results).unwrap();
    }
    assert_eq!(progress, Progress::Trained(Training::Complete));

    let mut sequential = Flow::new(units).unwrap();
    sequential.train(&[source(data)]).unwrap();

    let centroids = |flow: &Flow| {
        let node = flow.unit(0).unwrap().downcast_ref::<Node<KMeans>>().unwrap();
        (node.algorithm().centroids().unwrap().clone(), node.algorithm().iterations())
    };
    let (expected, iterations) = centroids(&sequential);
    for flow in [ordered.flow(), shuffled.flow()] {
        let (found, found_iterations) = centroids(flow);
        assert_eq!(found_iterations, iterations);
        for (a, b) in found.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-8);
        }
    }
}

#[test]
fn mixed_mode_matches_sequential() {
    let mut rng = SmallRng::seed_from_u64(4);
    let units: Vec<Box<dyn Unit>> = vec![
        Box::new(Node::new(Standardize::new())),
        Box::new(Node::new(Centering::new())),
        Box::new(Node::new(KMeans::new(3))),
    ];
    // Centering is left without the parallel capability, so the scheduler trains it itself.
    let mut registry = Registry::new();
    registry.register::<Node<Standardize>, _>(PARALLEL, ParallelTraining::of::<Standardize>()).unwrap();
    registry.register::<Node<KMeans>, _>(PARALLEL, ParallelTraining::of::<KMeans>()).unwrap();
    registry.activate(PARALLEL).unwrap();

    let mut flow = Flow::new(units.clone()).unwrap();
    let events = capture(&mut flow);
    let mut scheduler = ParallelFlow::with_registry(flow, registry);
    let data = blobs(&mut rng, 5, 10);
    let sources = || -> Sources { vec![source(data.clone()), source(data.clone()), source(data.clone())] };

    let progress = scheduler.parallel_train(sources()).unwrap();
    let (progress, _) = run_all(&mut scheduler, progress);
    assert_eq!(progress, Progress::Trained(Training::Complete));
    scheduler.flow_mut().unwrap().log_register().flush();

    let fallbacks = events.lock().unwrap()
        .iter()
        .filter_map(|event| match event {
            FlowEvent::Fallback(fallback) => Some((fallback.unit, fallback.phase)),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(fallbacks, vec![(1, 0)]);

    let mut sequential = Flow::new(units).unwrap();
    sequential.train(&sources()).unwrap();
    let input = Chunk::from(Array2::from_shape_fn((6, 2), |(i, j)| (i * j) as f64 / 5.0));
    assert_close(&scheduler.execute(&input).unwrap(), &sequential.execute(&input).unwrap());
}

#[test]
fn deactivated_extension_falls_back_entirely() {
    let mut rng = SmallRng::seed_from_u64(5);
    let units: Vec<Box<dyn Unit>> = vec![Box::new(Node::new(Centering::new()))];
    let mut scheduler = ParallelFlow::new(Flow::new(units).unwrap());
    scheduler.registry_mut().deactivate(PARALLEL).unwrap();

    let progress = scheduler.parallel_train(vec![source(uniform(&mut rng, 3, 4, 2))]).unwrap();
    assert_eq!(progress, Progress::Trained(Training::Complete));
    assert!(!scheduler.job_available());
    assert!(scheduler.flow().is_trained());
}

#[test]
fn deactivation_applies_from_the_next_phase() {
    let mut rng = SmallRng::seed_from_u64(13);
    let flow = || {
        let inner: Vec<Box<dyn Unit>> = vec![
            Box::new(Node::new(Standardize::new())),
            Box::new(Node::new(Centering::new())),
        ];
        let units: Vec<Box<dyn Unit>> = vec![Box::new(FlowUnit::new(Flow::new(inner).unwrap()))];
        Flow::new(units).unwrap()
    };
    let data = uniform(&mut rng, 3, 6, 2);

    let mut parallel = flow();
    let events = capture(&mut parallel);
    let mut scheduler = ParallelFlow::new(parallel);
    scheduler.parallel_train(vec![source(data.clone())]).unwrap();
    let mut results = Vec::new();
    while scheduler.job_available() {
        results.push(scheduler.get_job().unwrap().run().unwrap());
    }
    assert_eq!(results.len(), 3);

    // The open phase merges with the capabilities it was forked with.
    scheduler.registry_mut().deactivate(PARALLEL).unwrap();
    let progress = scheduler.use_results(results).unwrap();
    assert_eq!(progress, Progress::Trained(Training::Complete));
    assert!(scheduler.flow().is_trained());

    scheduler.flow_mut().unwrap().log_register().flush();
    let fallbacks = events.lock().unwrap().iter().filter(|event| matches!(event, FlowEvent::Fallback(_))).count();
    assert_eq!(fallbacks, 2);

    let mut sequential = flow();
    sequential.train(&[source(data)]).unwrap();
    let input = Chunk::from(Array2::from_shape_fn((4, 2), |(i, j)| (2 * i + j) as f64 / 5.0));
    assert_close(&scheduler.execute(&input).unwrap(), &sequential.execute(&input).unwrap());
}

#[test]
fn first_unit_not_trainable() {
    let mut rng = SmallRng::seed_from_u64(6);
    let units: Vec<Box<dyn Unit>> = vec![
        Box::new(Node::new(QuadraticExpansion)),
        Box::new(Node::new(Centering::new())),
    ];
    let mut scheduler = ParallelFlow::new(Flow::new(units).unwrap());
    let progress = scheduler.parallel_train(vec![None, source(uniform(&mut rng, 3, 5, 2))]).unwrap();
    let (progress, jobs) = run_all(&mut scheduler, progress);
    assert_eq!(progress, Progress::Trained(Training::Complete));
    assert_eq!(jobs, 3);
    assert_eq!(scheduler.flow().unit(1).unwrap().input_dim(), Some(5));
}

#[test]
fn no_job_leaves_state_unchanged() {
    let mut rng = SmallRng::seed_from_u64(7);
    let units: Vec<Box<dyn Unit>> = vec![Box::new(Node::new(Centering::new()))];
    let mut scheduler = ParallelFlow::new(Flow::new(units).unwrap());
    assert_eq!(scheduler.get_job().unwrap_err(), SchedulerError::NoJob);
    assert_eq!(scheduler.use_results(Vec::new()).unwrap_err(), SchedulerError::Idle);

    scheduler.parallel_train(vec![source(uniform(&mut rng, 2, 3, 2))]).unwrap();
    let results = vec![
        scheduler.get_job().unwrap().run().unwrap(),
        scheduler.get_job().unwrap().run().unwrap(),
    ];
    assert!(!scheduler.job_available());
    assert_eq!(scheduler.get_job().unwrap_err(), SchedulerError::NoJob);
    assert!(scheduler.is_parallel_training());
    assert_eq!(scheduler.outstanding(), 2);

    assert_eq!(scheduler.use_results(results).unwrap(), Progress::Trained(Training::Complete));
    assert_eq!(scheduler.outstanding(), 0);
}

#[test]
fn busy_scheduler_refuses_new_work() {
    let mut rng = SmallRng::seed_from_u64(8);
    let units: Vec<Box<dyn Unit>> = vec![Box::new(Node::new(Centering::new()))];
    let mut scheduler = ParallelFlow::new(Flow::new(units).unwrap());
    let data = uniform(&mut rng, 2, 3, 2);
    scheduler.parallel_train(vec![source(data.clone())]).unwrap();
    assert_eq!(scheduler.parallel_train(vec![source(data)]).unwrap_err(), SchedulerError::Busy);
    assert_eq!(scheduler.parallel_execute(Vec::new()).unwrap_err(), SchedulerError::Busy);
    assert!(scheduler.flow_mut().is_err());
}

#[test]
fn nested_flow_unit() {
    let mut rng = SmallRng::seed_from_u64(9);
    let inner = || {
        let units: Vec<Box<dyn Unit>> = vec![
            Box::new(Node::new(Standardize::new())),
            Box::new(Node::new(QuadraticExpansion)),
            Box::new(Node::new(Centering::new())),
        ];
        Flow::new(units).unwrap()
    };
    let outer = || {
        let units: Vec<Box<dyn Unit>> = vec![
            Box::new(FlowUnit::new(inner())),
            Box::new(Node::new(Centering::new())),
        ];
        Flow::new(units).unwrap()
    };
    let data = uniform(&mut rng, 4, 8, 2);

    let mut flow = outer();
    let events = capture(&mut flow);
    let mut scheduler = ParallelFlow::new(flow);
    let progress = scheduler.parallel_train(vec![source(data.clone()), source(data.clone())]).unwrap();
    run_all(&mut scheduler, progress);
    scheduler.flow_mut().unwrap().log_register().flush();
    assert!(!events.lock().unwrap().iter().any(|event| matches!(event, FlowEvent::Fallback(_))));
    assert_eq!(scheduler.flow().unit(0).unwrap().phases_completed(), &[0, 1, 2]);

    let mut sequential = outer();
    sequential.train(&[source(data.clone()), source(data)]).unwrap();
    let input = Chunk::from(Array2::from_shape_fn((5, 2), |(i, j)| (i + 3 * j) as f64 / 7.0));
    assert_close(&scheduler.execute(&input).unwrap(), &sequential.execute(&input).unwrap());
}

#[test]
fn job_rows_splits_chunks() {
    let mut rng = SmallRng::seed_from_u64(10);
    let units: Vec<Box<dyn Unit>> = vec![Box::new(Node::new(Centering::new()))];
    let config = Config::default().job_rows(7);
    let mut scheduler = ParallelFlow::new(Flow::with_config(units.clone(), config).unwrap());
    let data = uniform(&mut rng, 2, 20, 3);

    let progress = scheduler.parallel_train(vec![source(data.clone())]).unwrap();
    let (_, jobs) = run_all(&mut scheduler, progress);
    assert_eq!(jobs, 6);

    let mut sequential = Flow::new(units).unwrap();
    sequential.train(&[source(data)]).unwrap();
    let input = Chunk::from(Array2::<f64>::ones((2, 3)));
    assert_close(&scheduler.execute(&input).unwrap(), &sequential.execute(&input).unwrap());
}

#[test]
fn execute_with_jobs() {
    let mut rng = SmallRng::seed_from_u64(11);
    let units: Vec<Box<dyn Unit>> = vec![
        Box::new(Node::new(Standardize::new())),
        Box::new(Node::new(QuadraticExpansion)),
    ];
    let mut scheduler = ParallelFlow::new(Flow::new(units).unwrap());
    let data = uniform(&mut rng, 3, 6, 2);
    let progress = scheduler.parallel_train(vec![source(data.clone()), None]).unwrap();
    run_all(&mut scheduler, progress);

    let inputs = (0 .. 4).map(|rows| Chunk::from(Array2::from_elem((rows + 1, 2), rows as f64))).collect::<Vec<_>>();
    let progress = scheduler.parallel_execute(inputs.clone()).unwrap();
    assert!(scheduler.is_parallel_executing());

    let mut results = Vec::new();
    while scheduler.job_available() {
        results.push(scheduler.get_job().unwrap().run().unwrap());
    }
    results.reverse();
    assert_eq!(progress, Progress::Pending);
    let Progress::Executed(outputs) = scheduler.use_results(results).unwrap() else {
        panic!("execution did not finish");
    };
    assert!(!scheduler.is_parallel_executing());
    assert_eq!(outputs.len(), inputs.len());
    for (output, input) in outputs.iter().zip(inputs.iter()) {
        assert_close(output, &scheduler.execute(input).unwrap());
    }
}

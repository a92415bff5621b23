#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tessera_core::error::{TaskError, TaskResult};
use tessera_core::partitioning::constraint::{align, broadcast, broadcast_axes};
use tessera_core::scope::exchange_exception_mode;
use tessera_core::{
    CoreError, CoreResult, Domain, ExceptionMode, Library, Point, Runtime, Scalar, Scope,
    TaskContext, TaskInfo, TaskTarget, Type, VariantCode,
};

use crate::common::{library, runtime, values, SumOp};

const WRITER: i64 = 0;
const BROADCAST: i64 = 1;
const SCALAR_ARGS: i64 = 2;
const FAILING: i64 = 3;
const UNBOUND: i64 = 4;
const REDUCE_FUTURE: i64 = 5;
const REDUCE_REGION: i64 = 6;

/// A projected 1-element slice aligned with a scalar store runs as one single task
/// and writes both outputs back.
#[test]
fn test_aligned_projection_and_scalar_run_single_task() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.aligned");
    let runs = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(Mutex::new(Vec::new()));
    {
        let runs = runs.clone();
        let observed = observed.clone();
        library.register_task(
            WRITER,
            TaskInfo::new("writer").with_variant(VariantCode::Cpu, move |ctx| {
                runs.fetch_add(1, Ordering::SeqCst);
                observed.lock().unwrap().push((
                    ctx.is_single_task(),
                    ctx.task_index().clone(),
                    ctx.num_communicators(),
                ));
                ctx.output(0)?.write(&Point::new([0]), 7i64)?;
                ctx.output(1)?.write(&Point::new([0]), 84i64)?;
                Ok(())
            }),
        )?;
    }

    let store = runtime.create_store([10, 1], Type::int64())?;
    runtime.issue_fill(&store, &Scalar::new(42i64))?;
    let scalar = runtime.create_scalar_store(&Scalar::new(42i64), [1])?;

    let mut task = runtime.create_task(&library, WRITER)?;
    let v1 = task.add_output(&store.project(0, 0)?)?;
    let v2 = task.add_output(&scalar)?;
    task.add_constraint(align(v1, v2));
    task.add_communicator("cpu");
    runtime.submit(task)?;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        observed.lock().unwrap().as_slice(),
        &[(true, Point::new([0]), 0)]
    );
    let mut expected = vec![42i64; 10];
    expected[0] = 7;
    assert_eq!(values::<i64>(&store)?, expected);
    assert_eq!(values::<i64>(&scalar)?, vec![84]);
    Ok(())
}

/// Broadcasting axis 0 of a 3-D store keeps that axis whole in every point task.
#[test]
fn test_broadcast_axis_keeps_whole_extent() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.broadcast");
    let domains = Arc::new(Mutex::new(Vec::new()));
    {
        let domains = domains.clone();
        library.register_task(
            SCALAR_ARGS,
            TaskInfo::new("broadcast_axes").with_variant(VariantCode::Cpu, move |ctx| {
                let scale = ctx.scalar(0)?.value::<i64>()?;
                let domain = ctx.output(0)?.domain().clone();
                for point in domain.points() {
                    ctx.output(0)?.write(&point, scale * point[0])?;
                }
                domains.lock().unwrap().push(domain);
                Ok(())
            }),
        )?;
    }

    let store = runtime.create_store([100, 10, 10], Type::int64())?;
    let mut task = runtime.create_task(&library, SCALAR_ARGS)?;
    let v = task.add_output(&store)?;
    task.add_constraint(broadcast_axes(v, vec![0]));
    task.add_scalar_arg(Scalar::new(2i64));
    task.add_scalar_arg(Scalar::new(true));
    runtime.submit(task)?;

    let domains = domains.lock().unwrap();
    assert_eq!(domains.len(), 4);
    for domain in domains.iter() {
        assert_eq!(domain.lo()[0], 0);
        assert_eq!(domain.hi()[0], 99);
    }
    assert_eq!(domains.iter().map(Domain::volume).sum::<u64>(), 10_000);
    let data = values::<i64>(&store)?;
    assert_eq!(data[0], 0);
    assert_eq!(data[99 * 100], 198);
    Ok(())
}

/// Broadcasting every axis leaves nothing to partition, so the task runs once.
#[test]
fn test_full_broadcast_runs_single_task() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.full_broadcast");
    let indices = Arc::new(Mutex::new(Vec::new()));
    {
        let indices = indices.clone();
        library.register_task(
            BROADCAST,
            TaskInfo::new("full_broadcast").with_variant(VariantCode::Cpu, move |ctx| {
                indices
                    .lock()
                    .unwrap()
                    .push((ctx.is_single_task(), ctx.task_index().clone()));
                Ok(())
            }),
        )?;
    }

    let store = runtime.create_store([6, 6], Type::int64())?;
    let mut task = runtime.create_task(&library, BROADCAST)?;
    let v = task.add_output(&store)?;
    task.add_constraint(broadcast(v));
    runtime.submit(task)?;

    assert_eq!(
        indices.lock().unwrap().as_slice(),
        &[(true, Point::zeros(2))]
    );
    Ok(())
}

/// A store with a zero extent launches nothing.
#[test]
fn test_empty_store_skips_launch() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.empty");
    let runs = Arc::new(AtomicUsize::new(0));
    {
        let runs = runs.clone();
        library.register_task(
            BROADCAST,
            TaskInfo::new("never").with_variant(VariantCode::Cpu, move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )?;
    }

    let store = runtime.create_store([0, 8], Type::float64())?;
    let mut task = runtime.create_task(&library, BROADCAST)?;
    task.add_output(&store)?;
    runtime.submit(task)?;

    assert_eq!(runs.load(Ordering::SeqCst), 0);
    Ok(())
}

type VariantLog = Arc<Mutex<Vec<(VariantCode, u64)>>>;

fn recorder(
    seen: VariantLog,
) -> impl Fn(&mut TaskContext) -> TaskResult<()> + Send + Sync + 'static {
    move |ctx| {
        seen.lock()
            .unwrap()
            .push((ctx.variant_kind(), ctx.launch_domain().volume()));
        Ok(())
    }
}

fn register_variants(runtime: &Runtime) -> CoreResult<(Library, VariantLog)> {
    let library = library(runtime, "test.variants");
    let seen = VariantLog::default();
    library.register_task(
        0,
        TaskInfo::new("both")
            .with_variant(VariantCode::Cpu, recorder(seen.clone()))
            .with_variant(VariantCode::Gpu, recorder(seen.clone())),
    )?;
    library.register_task(
        1,
        TaskInfo::new("cpu_only").with_variant(VariantCode::Cpu, recorder(seen.clone())),
    )?;
    Ok((library, seen))
}

/// A CPU-only scope selects the CPU variant and partitions across the CPUs.
#[test]
fn test_cpu_scope_selects_cpu_variant() -> CoreResult<()> {
    let runtime = runtime(4, 2);
    let (library, seen) = register_variants(&runtime)?;
    let store = runtime.create_store([100], Type::int64())?;

    let machine = runtime.get_machine().only(&[TaskTarget::Cpu]);
    {
        let _scope = Scope::new().with_machine(&machine)?;
        let mut task = runtime.create_task(&library, 0)?;
        task.add_output(&store)?;
        runtime.submit(task)?;
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 4);
    assert!(seen.iter().all(|x| *x == (VariantCode::Cpu, 4)));
    Ok(())
}

/// A GPU-only scope rejects tasks that only have a CPU variant.
#[test]
fn test_gpu_scope_rejects_cpu_only_task() -> CoreResult<()> {
    let runtime = runtime(4, 2);
    let (library, _) = register_variants(&runtime)?;

    let machine = runtime.get_machine().only(&[TaskTarget::Gpu]);
    let _scope = Scope::new().with_machine(&machine)?;
    assert!(matches!(
        runtime.create_task(&library, 1),
        Err(CoreError::InvalidArgument(_))
    ));
    assert!(runtime.create_task(&library, 0).is_ok());
    Ok(())
}

/// The exception mode of the scope decides when a task error surfaces.
#[test]
fn test_task_exception_modes() -> CoreResult<()> {
    let runtime = runtime(2, 0);
    let library = library(&runtime, "test.exceptions");
    library.register_task(
        FAILING,
        TaskInfo::new("failing")
            .with_variant(VariantCode::Cpu, |_| Err(TaskError::new(3, "boom"))),
    )?;
    let store = runtime.create_store([4], Type::int32())?;

    let submit = || -> CoreResult<()> {
        let mut task = runtime.create_task(&library, FAILING)?;
        task.add_output(&store)?;
        runtime.submit(task)
    };

    match submit() {
        Err(CoreError::UserTaskException(exception)) => {
            assert_eq!(exception.index, 3);
            assert_eq!(exception.message, "boom");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    {
        let _scope = Scope::new().with_exception_mode(ExceptionMode::Deferred);
        submit()?;
    }
    assert!(matches!(
        runtime.raise_pending_exception(),
        Err(CoreError::UserTaskException(_))
    ));
    runtime.raise_pending_exception()?;

    let previous = exchange_exception_mode(ExceptionMode::Ignored);
    let ignored = submit();
    exchange_exception_mode(previous);
    ignored?;
    runtime.raise_pending_exception()?;
    Ok(())
}

/// An unbound store takes the extents its single writer binds.
#[test]
fn test_unbound_output_is_bound_by_task() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.unbound");
    library.register_task(
        UNBOUND,
        TaskInfo::new("bind").with_variant(VariantCode::Cpu, |ctx| {
            let output = ctx.output(0)?;
            let mut buffer = output.create_output_buffer(&[3])?;
            for i in 0..3i64 {
                buffer.write(&Point::new([i]), (i + 1) * 10)?;
            }
            output.bind_data(buffer, &[3])?;
            Ok(())
        }),
    )?;

    let store = runtime.create_unbound_store(Type::int64(), 1)?;
    assert!(store.is_unbound());
    let mut task = runtime.create_task(&library, UNBOUND)?;
    task.add_output(&store)?;
    runtime.submit(task)?;

    assert!(!store.is_unbound());
    assert_eq!(store.extents()?, vec![3]);
    assert_eq!(values::<i64>(&store)?, vec![10, 20, 30]);
    Ok(())
}

/// A reduction into a scalar store folds every point contribution into the current value.
#[test]
fn test_future_reduction() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.reduce_future");
    let redop = library.register_reduction_operator(0, Arc::new(SumOp))?;
    library.register_task(
        REDUCE_FUTURE,
        TaskInfo::new("reduce_future").with_variant(VariantCode::Cpu, |ctx| {
            ctx.reduction(0)?.reduce(&Point::new([0]), 5i64)?;
            Ok(())
        }),
    )?;

    let accumulator = runtime.create_scalar_store(&Scalar::new(0i64), [1])?;
    let mut task = runtime.create_task(&library, REDUCE_FUTURE)?;
    task.add_reduction(&accumulator, redop)?;
    runtime.submit(task)?;

    assert_eq!(values::<i64>(&accumulator)?, vec![5]);
    Ok(())
}

/// Every point task reduces its slice of the input into the broadcast accumulator.
#[test]
fn test_region_reduction_across_point_tasks() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.reduce_region");
    let redop = library.register_reduction_operator(0, Arc::new(SumOp))?;
    library.register_task(
        REDUCE_REGION,
        TaskInfo::new("reduce_region").with_variant(VariantCode::Cpu, |ctx| {
            let input = ctx.input(0)?;
            let mut sum = 0i64;
            for point in input.domain().points() {
                sum += input.read::<i64>(&point)?;
            }
            ctx.reduction(0)?.reduce(&Point::new([0]), sum)?;
            Ok(())
        }),
    )?;

    let input = runtime.create_store([16], Type::int64())?;
    runtime.issue_fill(&input, &Scalar::new(1i64))?;
    let accumulator = runtime.create_store([4], Type::int64())?;
    runtime.issue_fill(&accumulator, &Scalar::new(10i64))?;

    let mut task = runtime.create_task(&library, REDUCE_REGION)?;
    task.add_input(&input)?;
    let v = task.add_reduction(&accumulator, redop)?;
    task.add_constraint(broadcast(v));
    runtime.submit(task)?;

    assert_eq!(values::<i64>(&accumulator)?, vec![26, 10, 10, 10]);
    Ok(())
}

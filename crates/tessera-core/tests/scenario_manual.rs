#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tessera_core::{
    CoreError, CoreResult, Domain, ExternalAllocation, Library, LogicalStore, Point, Runtime,
    Scalar, TaskInfo, Type, VariantCode,
};

use crate::common::{library, runtime, values};

const AXPY: i64 = 0;
const WHOLE: i64 = 1;
const SUM: i64 = 2;
const NOTHING: i64 = 3;

fn register_axpy(library: &Library) -> CoreResult<Arc<Mutex<Vec<(Point, Domain)>>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let seen = log.clone();
    library.register_task(
        AXPY,
        TaskInfo::new("axpy").with_variant(VariantCode::Cpu, move |ctx| {
            let scale = ctx.scalar(0)?.value::<i64>()?;
            let input = ctx.input(0)?;
            let domain = input.domain().clone();
            let data = domain
                .points()
                .map(|p| input.read::<i64>(&p).map(|v| (p, v)))
                .collect::<CoreResult<Vec<_>>>()?;
            let output = ctx.output(0)?;
            for (point, value) in data {
                output.write(&point, value * scale + point[0])?;
            }
            seen.lock().unwrap().push((ctx.task_index().clone(), domain));
            Ok(())
        }),
    )?;
    Ok(log)
}

fn register_sum(library: &Library, runs: Arc<AtomicUsize>) -> CoreResult<()> {
    library.register_task(
        SUM,
        TaskInfo::new("sum").with_variant(VariantCode::Cpu, move |ctx| {
            runs.fetch_add(1, Ordering::SeqCst);
            let input = ctx.input(0)?;
            let mut sum = 0i64;
            for point in input.domain().points() {
                sum += input.read::<i64>(&point)?;
            }
            let output = ctx.output(0)?;
            let mut buffer = output.create_output_buffer(&[1])?;
            buffer.write(&Point::new([0]), sum)?;
            output.bind_data(buffer, &[1])?;
            Ok(())
        }),
    )
}

fn attach_i64(runtime: &Runtime, data: impl IntoIterator<Item = i64>) -> CoreResult<LogicalStore> {
    let bytes = data
        .into_iter()
        .flat_map(|x| x.to_ne_bytes())
        .collect::<Vec<_>>();
    let len = (bytes.len() / 8) as u64;
    runtime.attach([len], Type::int64(), ExternalAllocation::from_vec(bytes, false))
}

/// Every point of a manual launch gets the tile of its color in each partition.
#[test]
fn test_manual_task_over_tilings() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.manual");
    let log = register_axpy(&library)?;

    let input = runtime.create_store([8], Type::int64())?;
    runtime.issue_fill(&input, &Scalar::new(3i64))?;
    let output = runtime.create_store([8], Type::int64())?;

    let mut task = runtime.create_manual_task(&library, AXPY, &[4])?;
    task.add_input_partition(&input.partition_by_tiling(vec![2])?)?;
    task.add_output_partition(&output.partition_by_tiling(vec![2])?)?;
    task.add_scalar_arg(Scalar::new(10i64));
    assert_eq!((task.num_inputs(), task.num_outputs()), (1, 1));
    runtime.submit_manual(task)?;

    assert_eq!(values::<i64>(&output)?, (30..38).collect::<Vec<i64>>());
    let mut seen = log.lock().unwrap().clone();
    seen.sort_by_key(|(p, _)| p[0]);
    assert_eq!(seen.len(), 4);
    for (color, domain) in seen {
        let lo = color[0] * 2;
        assert_eq!(domain, Domain::new(Point::new([lo]), Point::new([lo + 1]))?);
    }
    Ok(())
}

/// A partition must have one color per point of the launch shape.
#[test]
fn test_manual_task_rejects_mismatched_colors() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.manual_colors");
    register_axpy(&library)?;
    let store = runtime.create_store([8], Type::int64())?;

    let mut task = runtime.create_manual_task(&library, AXPY, &[2])?;
    assert!(matches!(
        task.add_input_partition(&store.partition_by_tiling(vec![2])?),
        Err(CoreError::InvalidArgument(_))
    ));
    assert_eq!(task.num_inputs(), 0);
    assert!(matches!(
        runtime.create_manual_task(&library, AXPY, &[]),
        Err(CoreError::InvalidArgument(_))
    ));
    Ok(())
}

/// A launch shape with a single point runs a single task over whole stores.
#[test]
fn test_single_point_manual_task() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.manual_single");
    let observed = Arc::new(Mutex::new(Vec::new()));
    {
        let observed = observed.clone();
        library.register_task(
            WHOLE,
            TaskInfo::new("whole").with_variant(VariantCode::Cpu, move |ctx| {
                let output = ctx.output(0)?;
                let domain = output.domain().clone();
                for point in domain.points() {
                    output.write(&point, point[0] * 2)?;
                }
                observed
                    .lock()
                    .unwrap()
                    .push((ctx.is_single_task(), domain.volume()));
                Ok(())
            }),
        )?;
    }

    let store = runtime.create_store([3], Type::int64())?;
    let mut task = runtime.create_manual_task(&library, WHOLE, &[1])?;
    task.add_output(&store)?;
    runtime.submit_manual(task)?;

    assert_eq!(observed.lock().unwrap().as_slice(), &[(true, 3)]);
    assert_eq!(values::<i64>(&store)?, vec![0, 2, 4]);
    Ok(())
}

/// A concurrent launch wider than the machine fails before any communicator is built.
#[test]
fn test_concurrent_launch_wider_than_machine() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.manual_concurrent");
    let runs = Arc::new(AtomicUsize::new(0));
    {
        let runs = runs.clone();
        library.register_task(
            NOTHING,
            TaskInfo::new("nothing").with_variant(VariantCode::Cpu, move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )?;
    }

    let mut task = runtime.create_manual_task(&library, NOTHING, &[8])?;
    task.add_communicator("cpu");
    assert!(matches!(
        runtime.submit_manual(task),
        Err(CoreError::InvalidArgument(_))
    ));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    let stats = runtime.communicator_stats("cpu").expect("cpu factory");
    assert_eq!(stats.initializations, 0);
    assert_eq!(stats.live_communicators, 0);
    Ok(())
}

/// A tree reduction folds pairs of partial sums until one value is left.
#[test]
fn test_tree_reduce_sums_in_rounds() -> CoreResult<()> {
    let runtime = runtime(8, 0);
    let library = library(&runtime, "test.tree_reduce");
    let runs = Arc::new(AtomicUsize::new(0));
    register_sum(&library, runs.clone())?;

    let input = attach_i64(&runtime, 1..=16)?;
    let result = runtime.tree_reduce(&library, SUM, &input, 2)?;

    assert_eq!(result.extents()?, vec![1]);
    assert_eq!(values::<i64>(&result)?, vec![136]);
    // 4 leaves, then 2 partial sums, then the root.
    assert_eq!(runs.load(Ordering::SeqCst), 7);
    Ok(())
}

/// A store that fits in one leaf is reduced by a single task.
#[test]
fn test_tree_reduce_single_round() -> CoreResult<()> {
    let runtime = runtime(2, 0);
    let library = library(&runtime, "test.tree_reduce_small");
    let runs = Arc::new(AtomicUsize::new(0));
    register_sum(&library, runs.clone())?;

    let input = attach_i64(&runtime, [5, 7, 9])?;
    let result = runtime.tree_reduce(&library, SUM, &input, 4)?;

    assert_eq!(values::<i64>(&result)?, vec![21]);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_tree_reduce_rejects_bad_arguments() -> CoreResult<()> {
    let runtime = runtime(2, 0);
    let library = library(&runtime, "test.tree_reduce_invalid");
    register_sum(&library, Arc::new(AtomicUsize::new(0)))?;

    let input = attach_i64(&runtime, [1, 2])?;
    assert!(matches!(
        runtime.tree_reduce(&library, SUM, &input, 1),
        Err(CoreError::InvalidArgument(_))
    ));
    let grid = runtime.create_store([2, 2], Type::int64())?;
    assert!(matches!(
        runtime.tree_reduce(&library, SUM, &grid, 2),
        Err(CoreError::InvalidArgument(_))
    ));
    let unbound = runtime.create_unbound_store(Type::int64(), 1)?;
    assert!(matches!(
        runtime.tree_reduce(&library, SUM, &unbound, 2),
        Err(CoreError::InvalidArgument(_))
    ));
    Ok(())
}

/// Fences do not disturb the operations around them.
#[test]
fn test_execution_fences() -> CoreResult<()> {
    let runtime = runtime(2, 0);
    let store = runtime.create_store([4], Type::int64())?;
    runtime.issue_fill(&store, &Scalar::new(1i64))?;
    runtime.issue_execution_fence(false)?;
    runtime.issue_fill(&store, &Scalar::new(2i64))?;
    runtime.issue_execution_fence(true)?;
    assert_eq!(values::<i64>(&store)?, vec![2; 4]);
    Ok(())
}

/// A store of volume 1 can be the value of a fill, whether it holds a future or a region.
#[test]
fn test_fill_with_store_value() -> CoreResult<()> {
    let runtime = runtime(2, 0);
    let target = runtime.create_store([6], Type::int64())?;

    let scalar = runtime.create_scalar_store(&Scalar::new(9i64), [1])?;
    runtime.issue_fill_with_store(&target, &scalar)?;
    assert_eq!(values::<i64>(&target)?, vec![9; 6]);

    let region = attach_i64(&runtime, [-5])?;
    assert!(region.future().is_none());
    runtime.issue_fill_with_store(&target, &region)?;
    assert_eq!(values::<i64>(&target)?, vec![-5; 6]);

    let wide = runtime.create_store([2], Type::int64())?;
    assert!(matches!(
        runtime.issue_fill_with_store(&target, &wide),
        Err(CoreError::InvalidArgument(_))
    ));
    let unbound = runtime.create_unbound_store(Type::int64(), 1)?;
    assert!(matches!(
        runtime.issue_fill_with_store(&target, &unbound),
        Err(CoreError::InvalidArgument(_))
    ));
    let mismatched = runtime.create_scalar_store(&Scalar::new(1i32), [1])?;
    assert!(matches!(
        runtime.issue_fill_with_store(&target, &mismatched),
        Err(CoreError::InvalidArgument(_))
    ));
    Ok(())
}

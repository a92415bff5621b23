#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::{Arc, Mutex};

use tessera_common::config::AppConfig;
use tessera_core::partitioning::constraint::{
    align, bloat, broadcast, image, scale, ImageComputationHint,
};
use tessera_core::{
    CoreError, CoreResult, Domain, ExternalAllocation, Point, Scalar, TaskInfo, Type,
    VariantCode,
};
use tessera_telemetry::telemetry::init_telemetry;

use crate::common::{init_logging, library, runtime, values};

const GATHER: i64 = 0;
const RECORD: i64 = 1;

type DomainLog = Arc<Mutex<Vec<(Point, Domain)>>>;

fn to_bytes(values: impl IntoIterator<Item = i64>) -> Vec<u8> {
    values.into_iter().flat_map(|x| x.to_ne_bytes()).collect()
}

/// Registers a task that records the domain of input 0 under the index of each point task.
fn register_recorder(library: &tessera_core::Library) -> CoreResult<DomainLog> {
    let log = DomainLog::default();
    let seen = log.clone();
    library.register_task(
        RECORD,
        TaskInfo::new("record").with_variant(VariantCode::Cpu, move |ctx| {
            let domain = ctx.input(0)?.domain().clone();
            seen.lock().unwrap().push((ctx.task_index().clone(), domain));
            Ok(())
        }),
    )?;
    Ok(log)
}

fn sorted(log: &DomainLog) -> Vec<(Point, Domain)> {
    let mut entries = log.lock().unwrap().clone();
    entries.sort_by_key(|(p, _)| p[0]);
    entries
}

fn span(lo: i64, hi: i64) -> Domain {
    Domain::new(Point::new([lo]), Point::new([hi])).expect("domain")
}

/// Each point task of an image launch sees the bounding rectangle of the points its
/// slice of the function store refers to, and can gather through them.
#[test]
fn test_image_gathers_through_points() -> CoreResult<()> {
    let runtime = runtime(2, 0);
    let library = library(&runtime, "test.image");
    let ranges = Arc::new(Mutex::new(Vec::new()));
    {
        let ranges = ranges.clone();
        library.register_task(
            GATHER,
            TaskInfo::new("gather").with_variant(VariantCode::Cpu, move |ctx| {
                let func = ctx.input(0)?;
                let range = ctx.input(1)?;
                ranges.lock().unwrap().push(range.domain().clone());
                let mut gathered = vec![];
                for point in func.domain().points() {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(func.read_bytes(&point)?);
                    let index = i64::from_ne_bytes(buf);
                    gathered.push((point, range.read::<i64>(&Point::new([index]))?));
                }
                let output = ctx.output(0)?;
                for (point, value) in gathered {
                    output.write(&point, value)?;
                }
                Ok(())
            }),
        )?;
    }

    let range = runtime.attach(
        [16],
        Type::int64(),
        ExternalAllocation::from_vec(to_bytes((0..16).map(|i| i * 10)), false),
    )?;
    let func = runtime.attach(
        [4],
        Type::point(1),
        ExternalAllocation::from_vec(to_bytes([12, 13, 2, 3]), false),
    )?;
    let output = runtime.create_store([4], Type::int64())?;

    let mut task = runtime.create_task(&library, GATHER)?;
    let vfunc = task.add_input(&func)?;
    let vrange = task.add_input(&range)?;
    let vout = task.add_output(&output)?;
    task.add_constraint(align(vout, vfunc));
    task.add_constraint(image(vfunc, vrange, ImageComputationHint::None));
    runtime.submit(task)?;

    assert_eq!(values::<i64>(&output)?, vec![120, 130, 20, 30]);
    let mut ranges = ranges.lock().unwrap().clone();
    ranges.sort_by_key(|x| x.lo()[0]);
    assert_eq!(ranges, vec![span(2, 3), span(12, 13)]);
    Ok(())
}

/// A bloated input extends every tile of its source by the halo, clipped to the store.
#[test]
fn test_bloat_extends_tiles_by_halo() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.bloat");
    let log = register_recorder(&library)?;

    let input = runtime.create_store([16], Type::int64())?;
    runtime.issue_fill(&input, &Scalar::new(1i64))?;
    let output = runtime.create_store([16], Type::int64())?;

    let mut task = runtime.create_task(&library, RECORD)?;
    let vin = task.add_input(&input)?;
    let vout = task.add_output(&output)?;
    task.add_constraint(bloat(vout, vin, vec![1], vec![1]));
    runtime.submit(task)?;

    let domains = sorted(&log).into_iter().map(|(_, d)| d).collect::<Vec<_>>();
    assert_eq!(
        domains,
        vec![span(0, 4), span(3, 8), span(7, 12), span(11, 15)]
    );
    Ok(())
}

/// A scaled input gets the tiles of the smaller store multiplied by the factors.
#[test]
fn test_scale_multiplies_tiles() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.scale");
    let log = register_recorder(&library)?;

    let bigger = runtime.create_store([8], Type::int64())?;
    runtime.issue_fill(&bigger, &Scalar::new(1i64))?;
    let smaller = runtime.create_store([4], Type::int64())?;

    let mut task = runtime.create_task(&library, RECORD)?;
    let vbig = task.add_input(&bigger)?;
    let vsmall = task.add_output(&smaller)?;
    task.add_constraint(scale(vec![2], vsmall, vbig));
    runtime.submit(task)?;

    let entries = sorted(&log);
    assert_eq!(entries.len(), 4);
    for (index, domain) in entries {
        assert_eq!(domain, span(2 * index[0], 2 * index[0] + 1));
    }
    Ok(())
}

/// A derived partition that splits a broadcast store is rejected.
#[test]
fn test_broadcast_conflicts_with_scale() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.scale_broadcast");
    let log = register_recorder(&library)?;

    let bigger = runtime.create_store([8], Type::int64())?;
    runtime.issue_fill(&bigger, &Scalar::new(1i64))?;
    let smaller = runtime.create_store([4], Type::int64())?;

    let mut task = runtime.create_task(&library, RECORD)?;
    let vbig = task.add_input(&bigger)?;
    let vsmall = task.add_output(&smaller)?;
    task.add_constraint(scale(vec![2], vsmall, vbig));
    task.add_constraint(broadcast(vbig));
    assert!(matches!(
        runtime.submit(task),
        Err(CoreError::InvalidArgument(_))
    ));
    assert!(log.lock().unwrap().is_empty());
    Ok(())
}

/// Aligned stores are split into the same pieces.
#[test]
fn test_aligned_stores_get_equal_pieces() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.align");
    let pairs = Arc::new(Mutex::new(Vec::new()));
    {
        let pairs = pairs.clone();
        library.register_task(
            GATHER,
            TaskInfo::new("copy").with_variant(VariantCode::Cpu, move |ctx| {
                let input = ctx.input(0)?;
                let domain = input.domain().clone();
                let data = domain
                    .points()
                    .map(|p| input.read::<i64>(&p).map(|v| (p, v)))
                    .collect::<CoreResult<Vec<_>>>()?;
                let output = ctx.output(0)?;
                pairs
                    .lock()
                    .unwrap()
                    .push((domain.clone(), output.domain().clone()));
                for (point, value) in data {
                    output.write(&point, value + 1)?;
                }
                Ok(())
            }),
        )?;
    }

    let input = runtime.create_store([12], Type::int64())?;
    runtime.issue_fill(&input, &Scalar::new(4i64))?;
    let output = runtime.create_store([12], Type::int64())?;

    let mut task = runtime.create_task(&library, GATHER)?;
    let vin = task.add_input(&input)?;
    let vout = task.add_output(&output)?;
    task.add_constraint(align(vin, vout));
    runtime.submit(task)?;

    let pairs = pairs.lock().unwrap();
    assert_eq!(pairs.len(), 4);
    assert!(pairs.iter().all(|(i, o)| i == o && i.volume() == 3));
    assert_eq!(values::<i64>(&output)?, vec![5; 12]);
    Ok(())
}

/// Point tasks may not write overlapping pieces of the same store.
#[test]
fn test_bloated_output_is_rejected() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.bloat_output");
    let log = register_recorder(&library)?;

    let input = runtime.create_store([16], Type::int64())?;
    runtime.issue_fill(&input, &Scalar::new(1i64))?;
    let output = runtime.create_store([16], Type::int64())?;

    let mut task = runtime.create_task(&library, RECORD)?;
    let vin = task.add_input(&input)?;
    let vout = task.add_output(&output)?;
    task.add_constraint(bloat(vin, vout, vec![1], vec![1]));
    assert!(matches!(
        runtime.submit(task),
        Err(CoreError::InvalidArgument(_))
    ));
    assert!(log.lock().unwrap().is_empty());
    Ok(())
}

/// A local task id can be registered only once per library.
#[test]
fn test_duplicate_task_registration() -> CoreResult<()> {
    let runtime = runtime(1, 0);
    let library = library(&runtime, "test.duplicate");
    library.register_task(
        GATHER,
        TaskInfo::new("first").with_variant(VariantCode::Cpu, |_| Ok(())),
    )?;
    let duplicate = library.register_task(
        GATHER,
        TaskInfo::new("second").with_variant(VariantCode::Cpu, |_| Ok(())),
    );
    assert!(matches!(duplicate, Err(CoreError::InvalidArgument(_))));
    assert_eq!(library.find_task(GATHER)?.name(), "first");
    Ok(())
}

/// The telemetry of the process is installed once.
#[test]
fn test_telemetry_is_installed_once() -> CoreResult<()> {
    init_logging();
    let config = AppConfig::defaults().expect("default configuration").telemetry;
    assert!(init_telemetry(&config).is_err());
    Ok(())
}

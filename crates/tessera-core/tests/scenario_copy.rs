#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use tessera_core::{
    CoreResult, Domain, Library, LogicalStore, Point, Runtime, Scalar, TaskInfo, Type, VariantCode,
};

use crate::common::{library, runtime, values};

const INIT_SOURCE: i64 = 0;
const SOURCE_INDIRECT: i64 = 1;
const TARGET_INDIRECT: i64 = 2;

const EXTENT: i64 = 10;
const INDIRECT_SHAPE: [u64; 3] = [5, 4, 2];

fn source_value(p: &[i64]) -> i64 {
    100 * p[0] + 10 * p[1] + p[2] + 1
}

fn source_point(a: i64, b: i64, c: i64) -> [i64; 3] {
    [2 * a, 2 * b + 1, 3 * c]
}

fn target_point(a: i64, b: i64, c: i64) -> [i64; 3] {
    [9 - a, b + 3, 5 * c + 1]
}

fn run_writer(
    runtime: &Runtime,
    library: &Library,
    id: i64,
    store: &LogicalStore,
) -> CoreResult<()> {
    let mut task = runtime.create_task(library, id)?;
    task.add_output(store)?;
    runtime.submit(task)
}

fn register_tasks(library: &Library) -> CoreResult<()> {
    library.register_task(
        INIT_SOURCE,
        TaskInfo::new("init_source").with_variant(VariantCode::Cpu, |ctx| {
            let output = ctx.output(0)?;
            let domain = output.domain().clone();
            for point in domain.points() {
                output.write(&point, source_value(point.coords()))?;
            }
            Ok(())
        }),
    )?;
    for (id, name, index) in [
        (
            SOURCE_INDIRECT,
            "source_indirect",
            source_point as fn(i64, i64, i64) -> [i64; 3],
        ),
        (TARGET_INDIRECT, "target_indirect", target_point),
    ] {
        library.register_task(
            id,
            TaskInfo::new(name).with_variant(VariantCode::Cpu, move |ctx| {
                let output = ctx.output(0)?;
                let domain = output.domain().clone();
                for point in domain.points() {
                    output.write(&point, index(point[0], point[1], point[2]))?;
                }
                Ok(())
            }),
        )?;
    }
    Ok(())
}

/// Gathering through one indirection and scattering through another moves exactly
/// the indexed elements and leaves the rest of the target untouched.
#[test]
fn test_scatter_gather_copies_indexed_elements() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.copy");
    register_tasks(&library)?;

    let shape = [EXTENT as u64; 3];
    let source = runtime.create_store(shape, Type::int64())?;
    let target = runtime.create_store(shape, Type::int64())?;
    run_writer(&runtime, &library, INIT_SOURCE, &source)?;
    runtime.issue_fill(&target, &Scalar::new(42i64))?;

    let source_indirect = runtime.create_store(INDIRECT_SHAPE, Type::point(3))?;
    let target_indirect = runtime.create_store(INDIRECT_SHAPE, Type::point(3))?;
    run_writer(&runtime, &library, SOURCE_INDIRECT, &source_indirect)?;
    run_writer(&runtime, &library, TARGET_INDIRECT, &target_indirect)?;

    runtime.issue_scatter_gather(&target, &target_indirect, &source, &source_indirect, None)?;

    let domain = Domain::from_extents(&shape);
    let mut expected = vec![42i64; domain.volume() as usize];
    for index in Domain::from_extents(&INDIRECT_SHAPE).points() {
        let (a, b, c) = (index[0], index[1], index[2]);
        let t = domain.linearize(&Point::from(target_point(a, b, c)))? as usize;
        expected[t] = source_value(&source_point(a, b, c));
    }
    let actual = values::<i64>(&target)?;
    assert_eq!(actual, expected);
    assert_eq!(actual.iter().filter(|x| **x != 42).count(), 40);
    Ok(())
}

/// A plain copy reproduces the source.
#[test]
fn test_copy_reproduces_source() -> CoreResult<()> {
    let runtime = runtime(2, 0);
    let library = library(&runtime, "test.copy_plain");
    register_tasks(&library)?;

    let source = runtime.create_store([4, 3, 2], Type::int64())?;
    let target = runtime.create_store([4, 3, 2], Type::int64())?;
    run_writer(&runtime, &library, INIT_SOURCE, &source)?;
    runtime.issue_copy(&target, &source, None)?;

    assert_eq!(values::<i64>(&target)?, values::<i64>(&source)?);
    Ok(())
}

/// Gathering with an indirection of the wrong point type is rejected.
#[test]
fn test_gather_rejects_non_point_indirection() -> CoreResult<()> {
    let runtime = runtime(2, 0);
    let source = runtime.create_store([8], Type::int64())?;
    let target = runtime.create_store([8], Type::int64())?;
    let indirect = runtime.create_store([8], Type::int64())?;
    runtime.issue_fill(&source, &Scalar::new(1i64))?;
    runtime.issue_fill(&indirect, &Scalar::new(0i64))?;

    assert!(runtime.issue_gather(&target, &source, &indirect, None).is_err());
    Ok(())
}

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tessera_core::comm::Communicator;
use tessera_core::{CoreError, CoreResult, Domain, Point, TaskInfo, Type, VariantCode};

use crate::common::{library, runtime};

/// Repeated requests share one base communicator, and a 2-D launch gets an alias whose
/// points map onto the ranks in C order.
#[test]
fn test_communicator_cache_and_aliases() -> CoreResult<()> {
    let runtime = runtime(8, 0);
    let domain = Domain::from_extents(&[8]);

    let first = runtime.find_or_create_communicator("cpu", &domain)?;
    let second = runtime.find_or_create_communicator("cpu", &domain)?;
    assert!(first.ptr_eq(&second));
    assert_eq!(first.futures().len(), 8);

    let grid = Domain::new(Point::new([0, 0]), Point::new([1, 3]))?;
    let alias = runtime.find_or_create_communicator("cpu", &grid)?;
    assert!(!alias.ptr_eq(&first));
    assert_eq!(alias.domain(), &grid);
    assert!(alias.ptr_eq(&runtime.find_or_create_communicator("cpu", &grid)?));

    let last = alias
        .get(&Point::new([1, 3]))?
        .get_opaque::<Communicator>()
        .expect("communicator handle");
    assert_eq!(last.backend(), "cpu");
    assert_eq!(last.rank(), 7);
    assert_eq!(last.num_ranks(), 8);

    let stats = runtime.communicator_stats("cpu").expect("cpu factory");
    assert_eq!(stats.initializations, 1);
    assert_eq!(stats.live_communicators, 1);
    assert_eq!(stats.live_aliases, 1);

    runtime.destroy();
    let stats = runtime.communicator_stats("cpu").expect("cpu factory");
    assert_eq!(stats.finalizations, 1);
    assert_eq!(stats.live_communicators, 0);
    assert_eq!(stats.live_aliases, 0);
    Ok(())
}

/// A 1-D launch that does not start at the origin gets an alias instead of the base
/// communicator, and its last point still maps to the last rank.
#[test]
fn test_offset_launch_gets_alias() -> CoreResult<()> {
    let runtime = runtime(8, 0);
    let base = runtime.find_or_create_communicator("cpu", &Domain::from_extents(&[8]))?;
    let offset = Domain::new(Point::new([2]), Point::new([9]))?;
    let alias = runtime.find_or_create_communicator("cpu", &offset)?;
    assert!(!alias.ptr_eq(&base));
    assert_eq!(alias.domain(), &offset);

    let last = alias
        .get(&Point::new([9]))?
        .get_opaque::<Communicator>()
        .expect("communicator handle");
    assert_eq!(last.rank(), 7);
    assert!(alias.get(&Point::new([0])).is_err());

    let stats = runtime.communicator_stats("cpu").expect("cpu factory");
    assert_eq!(stats.initializations, 1);
    assert_eq!(stats.live_aliases, 1);
    Ok(())
}

/// Unknown communicator names are rejected.
#[test]
fn test_unknown_communicator() {
    let runtime = runtime(2, 0);
    assert!(matches!(
        runtime.find_or_create_communicator("carrier-pigeon", &Domain::from_extents(&[2])),
        Err(CoreError::InvalidArgument(_))
    ));
    assert!(runtime.communicator_stats("carrier-pigeon").is_none());
}

/// Point tasks of an index launch that requests a communicator each see their own rank.
#[test]
fn test_index_launch_receives_communicator() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.comm");
    let ranks = Arc::new(Mutex::new(Vec::new()));
    let runs = Arc::new(AtomicUsize::new(0));
    {
        let ranks = ranks.clone();
        let runs = runs.clone();
        library.register_task(
            0,
            TaskInfo::new("ranks").with_variant(VariantCode::Cpu, move |ctx| {
                runs.fetch_add(1, Ordering::SeqCst);
                if ctx.num_communicators() == 1 {
                    if let Some(comm) = ctx.communicator(0)?.get_opaque::<Communicator>() {
                        ranks.lock().unwrap().push((comm.rank(), comm.num_ranks()));
                    }
                }
                Ok(())
            }),
        )?;
    }

    let store = runtime.create_store([40], Type::int32())?;
    let mut task = runtime.create_task(&library, 0)?;
    task.add_output(&store)?;
    task.add_communicator("cpu");
    runtime.submit(task)?;

    let mut ranks = ranks.lock().unwrap().clone();
    ranks.sort_unstable();
    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert_eq!(ranks, vec![(0, 4), (1, 4), (2, 4), (3, 4)]);
    Ok(())
}

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tessera_core::{
    CoreError, CoreResult, Domain, ExternalAllocation, Point, Runtime, Scalar, TaskInfo, Type,
    VariantCode,
};

use crate::common::{config, init_logging, library, runtime, values};

const SUM: i64 = 0;

fn to_bytes(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|x| x.to_ne_bytes()).collect()
}

/// Tasks read attached memory in place, and detaching releases it exactly once while
/// the store stays readable.
#[test]
fn test_attach_then_detach_releases_allocation() -> CoreResult<()> {
    let runtime = runtime(4, 0);
    let library = library(&runtime, "test.attach");
    let total = Arc::new(AtomicI64::new(0));
    {
        let total = total.clone();
        library.register_task(
            SUM,
            TaskInfo::new("sum").with_variant(VariantCode::Cpu, move |ctx| {
                let input = ctx.input(0)?;
                let mut sum = 0i64;
                for point in input.domain().points() {
                    sum += input.read::<i64>(&point)?;
                }
                total.fetch_add(sum, Ordering::SeqCst);
                Ok(())
            }),
        )?;
    }

    let data = (0..128i64).collect::<Vec<_>>();
    let deleted = Rc::new(Cell::new(0usize));
    let deleted_ptr = Rc::new(Cell::new(std::ptr::null_mut::<u8>()));
    let allocation = {
        let deleted = deleted.clone();
        let deleted_ptr = deleted_ptr.clone();
        ExternalAllocation::from_vec_with_deleter(to_bytes(&data), false, move |ptr| {
            deleted.set(deleted.get() + 1);
            deleted_ptr.set(ptr);
        })
    };
    let ptr = allocation.ptr();
    assert_eq!(allocation.size(), 1024);

    let store = runtime.attach([128], Type::int64(), allocation)?;
    let field = store.region_field().expect("region field");
    assert!(field.is_attached());

    let mut task = runtime.create_task(&library, SUM)?;
    task.add_input(&store)?;
    runtime.submit(task)?;
    assert_eq!(total.load(Ordering::SeqCst), 8128);
    assert_eq!(deleted.get(), 0);

    store.detach()?;
    assert_eq!(deleted.get(), 1);
    assert_eq!(deleted_ptr.get(), ptr);
    assert!(!field.is_attached());
    assert_eq!(values::<i64>(&store)?, data);

    drop(field);
    drop(store);
    assert_eq!(deleted.get(), 1);
    Ok(())
}

/// Detaching a store that was never attached is an error.
#[test]
fn test_detach_requires_attachment() -> CoreResult<()> {
    let runtime = runtime(2, 0);
    let store = runtime.create_store([4], Type::int64())?;
    assert!(matches!(store.detach(), Err(CoreError::InvalidArgument(_))));
    Ok(())
}

/// An allocation smaller than the store is rejected.
#[test]
fn test_attach_rejects_short_allocation() {
    let runtime = runtime(2, 0);
    let allocation = ExternalAllocation::from_vec(to_bytes(&[1, 2, 3]), true);
    assert!(runtime.attach([4], Type::int64(), allocation).is_err());
}

/// Disjoint allocations each back one piece of the store.
#[test]
fn test_attach_resources_assembles_pieces() -> CoreResult<()> {
    let runtime = runtime(2, 0);
    let pieces = vec![
        (
            Domain::from_origin(&[0], &[3]),
            ExternalAllocation::from_vec(to_bytes(&[1, 2, 3]), true),
        ),
        (
            Domain::from_origin(&[3], &[3]),
            ExternalAllocation::from_vec(to_bytes(&[4, 5, 6]), true),
        ),
    ];
    let store = runtime.attach_resources([6], Type::int64(), pieces)?;
    assert_eq!(values::<i64>(&store)?, vec![1, 2, 3, 4, 5, 6]);
    Ok(())
}

/// An empty piece list is rejected, and a field that is already attached keeps its
/// attachment when more pieces are offered.
#[test]
fn test_attach_resources_rejects_empty_and_attached_fields() -> CoreResult<()> {
    let runtime = runtime(2, 0);
    assert!(matches!(
        runtime.attach_resources([4], Type::int64(), vec![]),
        Err(CoreError::InvalidArgument(_))
    ));

    let allocation = ExternalAllocation::from_vec(to_bytes(&[1, 2, 3, 4]), true);
    let store = runtime.attach([4], Type::int64(), allocation)?;
    let field = store.region_field().expect("region field");
    assert!(matches!(
        field.attach_resources(vec![]),
        Err(CoreError::InvalidArgument(_))
    ));
    let piece = (
        Domain::from_origin(&[0], &[4]),
        ExternalAllocation::from_vec(to_bytes(&[9, 9, 9, 9]), true),
    );
    assert!(matches!(
        field.attach_resources(vec![piece]),
        Err(CoreError::InvalidArgument(_))
    ));
    assert!(field.is_attached());
    assert_eq!(values::<i64>(&store)?, vec![1, 2, 3, 4]);
    Ok(())
}

/// A store dropped by a deleter while its field manager is busy reusing another field
/// is recycled by the next allocation of its shape.
#[test]
fn test_field_released_during_reuse_is_recycled() -> CoreResult<()> {
    let runtime = runtime(2, 0);
    let victim = Rc::new(RefCell::new(Some(runtime.create_store([16], Type::int64())?)));
    let allocation = {
        let victim = victim.clone();
        ExternalAllocation::from_vec_with_deleter(to_bytes(&[0; 8]), true, move |_| {
            victim.borrow_mut().take();
        })
    };
    let attached = runtime.attach([8], Type::int64(), allocation)?;
    drop(attached);
    assert_eq!(runtime.num_free_fields(), 1);

    let reused = runtime.create_store([8], Type::int64())?;
    assert!(victim.borrow().is_none());
    assert_eq!(runtime.num_free_fields(), 1);

    let recycled = runtime.create_store([16], Type::int64())?;
    assert_eq!(runtime.num_free_fields(), 0);
    drop(reused);
    drop(recycled);
    Ok(())
}

/// A field destroyed out of order is only reused after the consensus match that runs
/// every `field_reuse_frequency` allocations.
#[test]
fn test_out_of_order_field_reused_after_consensus() -> CoreResult<()> {
    init_logging();
    let mut config = config(2, 0);
    config.core.field_reuse_frequency = 3;
    let runtime = Runtime::try_new(&config)?;

    let first = runtime.create_store([4], Type::int64())?;
    let first_field = first.region_field().expect("region field").field_id();
    first.allow_out_of_order_destruction();
    drop(first);
    assert_eq!(runtime.num_free_fields(), 1);

    let second = runtime.create_store([4], Type::int64())?;
    let second_field = second.region_field().expect("region field").field_id();
    assert_ne!(second_field, first_field);
    assert_eq!(runtime.num_free_fields(), 1);

    let third = runtime.create_store([4], Type::int64())?;
    assert_eq!(
        third.region_field().expect("region field").field_id(),
        first_field
    );
    assert_eq!(runtime.num_free_fields(), 0);
    Ok(())
}

/// Invalidation callbacks registered through a child run once, when the root goes away.
#[test]
fn test_invalidation_callbacks_run_on_root_destruction() -> CoreResult<()> {
    let runtime = runtime(2, 0);
    let fired = Rc::new(Cell::new(0usize));
    let store = runtime.create_store([8], Type::int64())?;
    let partition = store.partition_by_tiling(vec![4])?;
    let child = partition.get_child_store(&Point::new([1]))?;
    for _ in 0..2 {
        let fired = fired.clone();
        child
            .region_field()
            .expect("region field")
            .add_invalidation_callback(move || fired.set(fired.get() + 1));
    }

    drop(child);
    assert_eq!(fired.get(), 0);
    drop(partition);
    assert_eq!(fired.get(), 0);
    drop(store);
    assert_eq!(fired.get(), 2);

    let leaked = runtime.create_store([8], Type::int64())?;
    {
        let fired = fired.clone();
        leaked
            .region_field()
            .expect("region field")
            .add_invalidation_callback(move || fired.set(fired.get() + 1));
    }
    runtime.destroy();
    drop(leaked);
    assert_eq!(fired.get(), 2);
    Ok(())
}

/// Children of a tiling view the parent's storage: a fill through a child shows up in
/// the parent and the neighbouring tile is left alone.
#[test]
fn test_tiling_children_share_parent_storage() -> CoreResult<()> {
    let runtime = runtime(2, 0);
    let store = runtime.create_store([8], Type::int64())?;
    runtime.issue_fill(&store, &Scalar::new(0i64))?;
    let partition = store.partition_by_tiling(vec![4])?;
    assert_eq!(partition.color_shape(), &[2]);
    assert!(partition.is_complete());

    let child = partition.get_child_store(&Point::new([1]))?;
    assert_eq!(child.extents()?, vec![4]);
    runtime.issue_fill(&child, &Scalar::new(5i64))?;
    assert_eq!(values::<i64>(&child)?, vec![5; 4]);
    assert_eq!(values::<i64>(&store)?, vec![0, 0, 0, 0, 5, 5, 5, 5]);

    assert!(partition.get_child_store(&Point::new([2])).is_err());
    Ok(())
}

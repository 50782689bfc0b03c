#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use cachetable::types::{FullHash, PageId};
use cachetable::{CacheError, DependentPair, NoCheckpointHooks, PairAttr, PairState, PinMode, Result};
use common::{quiet_options, wait_until, Fixture, Node, NodeOps};

#[test]
fn shared_pins_coexist_and_count_hits() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 8)?;
    let first = fx.table.get_and_pin(&fx.file, PageId(3), fx.hash(3), PinMode::Shared)?;
    let second = fx.table.get_and_pin(&fx.file, PageId(3), fx.hash(3), PinMode::Shared)?;
    assert_eq!(first.head, 3);
    assert_eq!(second.head, 3);

    let state = fx.table.pair_state(&fx.file, PageId(3)).expect("resident");
    assert_eq!(state.pins, 2);
    assert!(!state.writer_pinned);
    assert_eq!(state.state, PairState::Available);
    assert_eq!(state.clock_count, 2);

    drop(first);
    drop(second);
    let status = fx.table.status();
    assert_eq!(status.misses, 1);
    assert_eq!(status.hits, 1);
    assert_eq!(status.pinned, 0);
    assert_eq!(fx.ops.fetches(), 1);
    fx.shutdown()
}

#[test]
fn exclusive_pin_waits_for_readers() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 4)?;
    let reader = fx.table.get_and_pin(&fx.file, PageId(1), fx.hash(1), PinMode::Shared)?;

    let (tx, rx) = mpsc::channel();
    let table = fx.table.clone();
    let file = fx.file.clone();
    let hash = fx.hash(1);
    let writer = thread::spawn(move || -> Result<()> {
        let mut guard = table.get_and_pin(&file, PageId(1), hash, PinMode::Exclusive)?;
        guard.payload_mut()?.head = 100;
        guard.mark_dirty()?;
        tx.send(()).expect("send");
        Ok(())
    });

    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    drop(reader);
    rx.recv_timeout(Duration::from_secs(5)).expect("writer finished");
    writer.join().expect("writer thread")?;

    let guard = fx.table.get_and_pin(&fx.file, PageId(1), fx.hash(1), PinMode::Shared)?;
    assert_eq!(guard.head, 100);
    assert!(guard.is_dirty());
    drop(guard);
    fx.shutdown()
}

#[test]
fn nonblocking_miss_schedules_background_fetch() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 4)?;
    let first = fx
        .table
        .get_and_pin_nonblocking(&fx.file, PageId(2), fx.hash(2), PinMode::Shared);
    assert!(matches!(first, Err(CacheError::TryAgain)));

    let mut pinned = None;
    assert!(wait_until(Duration::from_secs(5), || {
        match fx
            .table
            .get_and_pin_nonblocking(&fx.file, PageId(2), fx.hash(2), PinMode::Shared)
        {
            Ok(guard) => {
                pinned = Some(guard);
                true
            }
            Err(err) => {
                assert!(err.is_retryable(), "unexpected {err}");
                false
            }
        }
    }));
    let guard = pinned.expect("pinned");
    assert_eq!(guard.head, 2);
    drop(guard);
    assert_eq!(fx.ops.fetches(), 1);
    assert_eq!(fx.table.status().prefetches, 1);
    fx.shutdown()
}

#[test]
fn nonblocking_exclusive_reports_contention() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 4)?;
    let reader = fx.table.get_and_pin(&fx.file, PageId(0), fx.hash(0), PinMode::Shared)?;
    let attempt = fx
        .table
        .get_and_pin_nonblocking(&fx.file, PageId(0), fx.hash(0), PinMode::Exclusive);
    assert!(matches!(attempt, Err(CacheError::TryAgain)));
    drop(reader);
    let guard = fx
        .table
        .get_and_pin_nonblocking(&fx.file, PageId(0), fx.hash(0), PinMode::Exclusive)?;
    assert_eq!(guard.mode(), PinMode::Exclusive);
    drop(guard);
    fx.shutdown()
}

#[test]
fn fullhash_mismatch_is_rejected() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 4)?;
    drop(fx.table.get_and_pin(&fx.file, PageId(1), fx.hash(1), PinMode::Shared)?);
    let wrong = FullHash(fx.hash(1).0 ^ 0xdead_beef);
    let attempt = fx.table.get_and_pin(&fx.file, PageId(1), wrong, PinMode::Shared);
    assert!(matches!(attempt, Err(CacheError::InvalidOwned(_))));
    assert_eq!(fx.table.pair_count(), 1);
    fx.shutdown()
}

#[test]
fn put_refuses_resident_page() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 0)?;
    let node = Node::new(9);
    let attr = node.attr();
    let guard = fx.table.put(&fx.file, PageId(9), fx.hash(9), node, attr)?;
    assert_eq!(guard.mode(), PinMode::Exclusive);
    assert!(guard.is_dirty());
    drop(guard);

    let again = fx
        .table
        .put(&fx.file, PageId(9), fx.hash(9), Node::new(9), attr);
    assert!(matches!(again, Err(CacheError::AlreadyExists)));
    assert_eq!(fx.table.status().puts, 1);
    fx.shutdown()
}

#[test]
fn maybe_get_and_pin_only_takes_cheap_pages() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 4)?;
    let missing = fx
        .table
        .maybe_get_and_pin(&fx.file, PageId(1), fx.hash(1), PinMode::Shared);
    assert!(matches!(missing, Err(CacheError::NotFound)));

    drop(fx.table.get_and_pin(&fx.file, PageId(1), fx.hash(1), PinMode::Shared)?);
    let clean = fx
        .table
        .maybe_get_and_pin(&fx.file, PageId(1), fx.hash(1), PinMode::Shared);
    assert!(matches!(clean, Err(CacheError::NotFound)));
    drop(
        fx.table
            .maybe_get_and_pin_clean(&fx.file, PageId(1), fx.hash(1), PinMode::Shared)?,
    );

    let mut guard = fx.table.get_and_pin(&fx.file, PageId(1), fx.hash(1), PinMode::Exclusive)?;
    guard.payload_mut()?.head = 11;
    guard.unpin(true, None)?;
    let dirty = fx
        .table
        .maybe_get_and_pin(&fx.file, PageId(1), fx.hash(1), PinMode::Exclusive)?;
    assert_eq!(dirty.head, 11);
    drop(dirty);
    fx.shutdown()
}

#[test]
fn shared_pins_cannot_dirty() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 2)?;
    let mut guard = fx.table.get_and_pin(&fx.file, PageId(0), fx.hash(0), PinMode::Shared)?;
    assert!(matches!(guard.mark_dirty(), Err(CacheError::Invalid(_))));
    assert!(guard.payload_mut().is_err());
    drop(guard);
    assert!(!fx.table.pair_state(&fx.file, PageId(0)).expect("resident").dirty);
    fx.shutdown()
}

#[test]
fn unpin_installs_new_attr() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 2)?;
    let before = fx.table.status().size_current;
    let guard = fx.table.get_and_pin(&fx.file, PageId(0), fx.hash(0), PinMode::Exclusive)?;
    let grown = fx.table.status().size_current;
    assert_eq!(grown - before, 64);
    guard.unpin(true, Some(PairAttr::leaf(200)))?;
    assert_eq!(fx.table.status().size_current, before + 200);
    assert_eq!(fx.table.status().size_leaf, 200);
    fx.shutdown()
}

#[test]
fn rename_moves_the_page() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 2)?;
    let mut guard = fx.table.get_and_pin(&fx.file, PageId(1), fx.hash(1), PinMode::Exclusive)?;
    guard.rename(PageId(40), fx.hash(40))?;
    assert_eq!(guard.page_id(), PageId(40));
    guard.unpin(true, None)?;

    assert!(fx.table.pair_state(&fx.file, PageId(1)).is_none());
    let moved = fx.table.get_and_pin(&fx.file, PageId(40), fx.hash(40), PinMode::Shared)?;
    assert_eq!(moved.head, 1);
    drop(moved);

    let mut other = fx.table.get_and_pin(&fx.file, PageId(0), fx.hash(0), PinMode::Exclusive)?;
    assert!(matches!(
        other.rename(PageId(40), fx.hash(40)),
        Err(CacheError::AlreadyExists)
    ));
    drop(other);
    fx.shutdown()
}

#[test]
fn unpin_and_remove_reports_checkpoint_obligation() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 4)?;
    let guard = fx.table.get_and_pin(&fx.file, PageId(2), fx.hash(2), PinMode::Exclusive)?;
    fx.table.begin_checkpoint()?;
    assert!(fx.table.pair_state(&fx.file, PageId(2)).expect("resident").checkpoint_pending);

    let mut seen = None;
    guard.unpin_and_remove(|page, pending| seen = Some((page, pending)))?;
    assert_eq!(seen, Some((PageId(2), true)));
    assert!(fx.table.pair_state(&fx.file, PageId(2)).is_none());

    fx.table.end_checkpoint(&NoCheckpointHooks)?;
    assert!(fx.ops.flushes_of(PageId(2)).iter().all(|rec| !rec.write));
    fx.shutdown()
}

#[test]
fn unpin_and_remove_needs_exclusive_pin() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 2)?;
    let guard = fx.table.get_and_pin(&fx.file, PageId(0), fx.hash(0), PinMode::Shared)?;
    let outcome = guard.unpin_and_remove(|_, _| panic!("must not run"));
    assert!(matches!(outcome, Err(CacheError::Invalid(_))));
    assert_eq!(fx.table.pair_state(&fx.file, PageId(0)).expect("resident").pins, 0);
    fx.shutdown()
}

#[test]
fn dependents_are_dirtied_with_the_pin() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 4)?;
    let mut parent = fx.table.get_and_pin(&fx.file, PageId(0), fx.hash(0), PinMode::Exclusive)?;
    {
        let mut deps = [DependentPair::new(&mut parent, true)];
        let child = fx.table.get_and_pin_with_dependents(
            &fx.file,
            PageId(1),
            fx.hash(1),
            PinMode::Exclusive,
            &mut deps,
        )?;
        drop(child);
    }
    drop(parent);
    assert!(fx.table.pair_state(&fx.file, PageId(0)).expect("resident").dirty);
    assert!(!fx.table.pair_state(&fx.file, PageId(1)).expect("resident").dirty);

    let mut parent = fx.table.get_and_pin(&fx.file, PageId(2), fx.hash(2), PinMode::Exclusive)?;
    let node = Node::new(77);
    let attr = node.attr();
    {
        let mut deps = [DependentPair::new(&mut parent, true)];
        drop(fx.table.put_with_dependents(
            &fx.file,
            PageId(77),
            fx.hash(77),
            node,
            attr,
            &mut deps,
        )?);
    }
    drop(parent);
    assert!(fx.table.pair_state(&fx.file, PageId(2)).expect("resident").dirty);
    fx.shutdown()
}

#[test]
fn owed_dependent_is_written_before_it_changes() -> Result<()> {
    for clonable in [true, false] {
        let ops = if clonable { NodeOps::new().clonable() } else { NodeOps::new() };
        let fx = Fixture::new(quiet_options(1 << 20), ops, 4)?;
        let mut parent = fx.table.get_and_pin(&fx.file, PageId(0), fx.hash(0), PinMode::Exclusive)?;
        parent.payload_mut()?.head = 40;
        parent.unpin(true, None)?;

        let mut parent = fx.table.get_and_pin(&fx.file, PageId(0), fx.hash(0), PinMode::Exclusive)?;
        fx.table.begin_checkpoint()?;
        assert!(fx.table.pair_state(&fx.file, PageId(0)).expect("resident").checkpoint_pending);
        {
            let mut deps = [DependentPair::new(&mut parent, true)];
            let child = fx.table.get_and_pin_with_dependents(
                &fx.file,
                PageId(1),
                fx.hash(1),
                PinMode::Exclusive,
                &mut deps,
            )?;
            drop(child);
        }
        assert!(!fx.table.pair_state(&fx.file, PageId(0)).expect("resident").checkpoint_pending);
        parent.payload_mut()?.head = 41;
        drop(parent);
        fx.table.end_checkpoint(&NoCheckpointHooks)?;

        let owed: Vec<_> = fx
            .ops
            .flushes_of(PageId(0))
            .into_iter()
            .filter(|rec| rec.for_checkpoint)
            .collect();
        assert_eq!(owed.len(), 1, "clonable={clonable}");
        assert_eq!(owed[0].head, 40);
        assert_eq!(owed[0].is_clone, clonable);
        assert!(fx.ops.flushes_of(PageId(1)).is_empty());
        assert!(fx.table.pair_state(&fx.file, PageId(0)).expect("resident").dirty);
        fx.shutdown()?;
    }
    Ok(())
}

#[test]
fn failed_fetch_leaves_nothing_behind() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 2)?;
    for _ in 0..2 {
        let attempt = fx.table.get_and_pin(&fx.file, PageId(50), fx.hash(50), PinMode::Shared);
        assert!(matches!(attempt, Err(CacheError::Io(_))));
        assert_eq!(fx.table.pair_count(), 0);
    }
    assert_eq!(fx.ops.fetches(), 2);
    assert_eq!(fx.table.status().size_current, 0);
    fx.shutdown()
}

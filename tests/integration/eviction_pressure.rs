#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use cachetable::types::PageId;
use cachetable::{CacheError, PairAttr, PairState, PartialEvictionCost, PinMode, Result};
use common::{quiet_options, wait_until, Fixture, Node, NodeOps, TAIL_BYTES};

#[test]
fn small_limit_holds_under_steady_inserts() -> Result<()> {
    let fx = Fixture::new(quiet_options(6), NodeOps::new(), 0)?;
    for page in 0..100u64 {
        let guard = fx.table.put(
            &fx.file,
            PageId(page),
            fx.hash(page),
            Node::new(page),
            PairAttr::with_size(1),
        )?;
        drop(guard);
        assert!(
            fx.table.status().size_current <= 6,
            "size {} after page {page}",
            fx.table.status().size_current
        );
    }

    let big = fx.table.put(
        &fx.file,
        PageId(1000),
        fx.hash(1000),
        Node::new(1000),
        PairAttr::with_size(12),
    )?;
    assert_eq!(fx.table.status().size_current, 12);
    drop(big);
    fx.table.evict_to_limit();
    assert!(fx.table.status().size_current <= 6);
    fx.table.verify()?;

    let status = fx.table.status();
    assert!(status.evictions_dirty >= 95, "{status}");
    assert_eq!(status.eviction_write_errors, 0);

    for page in (0..100u64).chain(std::iter::once(1000)) {
        let guard = fx
            .table
            .get_and_pin(&fx.file, PageId(page), fx.hash(page), PinMode::Shared)?;
        assert_eq!(guard.head, page);
        assert_eq!(guard.tail.as_deref(), Some(common::tail_for(page).as_slice()));
    }
    fx.shutdown()
}

#[test]
fn cheap_partial_eviction_round_trips_exactly() -> Result<()> {
    let fx = Fixture::new(
        quiet_options(100),
        NodeOps::new().partial(PartialEvictionCost::Cheap),
        4,
    )?;
    let guard = fx.table.get_and_pin(&fx.file, PageId(1), fx.hash(1), PinMode::Shared)?;
    let original = guard.encode();
    drop(guard);

    let reserved = fx.table.reserve_memory(0.92);
    assert_eq!(reserved, 92);
    let state = fx.table.pair_state(&fx.file, PageId(1)).expect("still resident");
    assert_eq!(state.state, PairState::Partial);
    assert_eq!(state.attr.size, 8);
    assert_eq!(fx.table.status().size_current, 8);
    fx.table.release_reserved_memory(reserved);

    let guard = fx.table.get_and_pin(&fx.file, PageId(1), fx.hash(1), PinMode::Shared)?;
    assert_eq!(guard.encode(), original);
    drop(guard);

    let status = fx.table.status();
    assert_eq!(status.partial_evictions, 1);
    assert_eq!(status.partial_eviction_bytes, TAIL_BYTES as u64);
    assert_eq!(status.partial_fetches, 1);
    assert_eq!(status.size_current, 64);
    assert_eq!(fx.ops.fetches(), 1);
    fx.shutdown()
}

#[test]
fn expensive_partial_eviction_runs_on_workers() -> Result<()> {
    let fx = Fixture::new(
        quiet_options(100),
        NodeOps::new().partial(PartialEvictionCost::Expensive),
        4,
    )?;
    drop(fx.table.get_and_pin(&fx.file, PageId(2), fx.hash(2), PinMode::Shared)?);

    let reserved = fx.table.reserve_memory(0.92);
    assert!(wait_until(Duration::from_secs(5), || {
        fx.table
            .pair_state(&fx.file, PageId(2))
            .map_or(false, |state| state.state == PairState::Partial)
            && fx.table.status().size_evicting == 0
    }));
    assert_eq!(fx.table.status().size_current, 8);
    fx.table.release_reserved_memory(reserved);

    let nonblocking = fx
        .table
        .get_and_pin_nonblocking(&fx.file, PageId(2), fx.hash(2), PinMode::Shared);
    assert!(matches!(nonblocking, Err(CacheError::TryAgain)));
    assert!(wait_until(Duration::from_secs(5), || {
        fx.table
            .pair_state(&fx.file, PageId(2))
            .map_or(false, |state| state.state == PairState::Available)
    }));
    let guard = fx.table.get_and_pin(&fx.file, PageId(2), fx.hash(2), PinMode::Shared)?;
    assert_eq!(guard.tail.as_deref(), Some(common::tail_for(2).as_slice()));
    drop(guard);
    fx.shutdown()
}

#[test]
fn dirty_pages_round_trip_through_full_eviction() -> Result<()> {
    let fx = Fixture::new(
        quiet_options(1 << 20),
        NodeOps::new().partial(PartialEvictionCost::Cheap),
        8,
    )?;
    for page in 0..8u64 {
        let mut guard = fx
            .table
            .get_and_pin(&fx.file, PageId(page), fx.hash(page), PinMode::Exclusive)?;
        let node = guard.payload_mut()?;
        node.head = page * 10;
        node.set_tail_byte(0, page as u8 + 200);
        guard.unpin(true, None)?;
    }

    let reserved = fx.table.reserve_memory(1.0);
    assert_eq!(fx.table.pair_count(), 0);
    assert_eq!(fx.table.status().partial_evictions, 0);
    fx.table.release_reserved_memory(reserved);

    for page in 0..8u64 {
        let guard = fx
            .table
            .get_and_pin(&fx.file, PageId(page), fx.hash(page), PinMode::Shared)?;
        assert_eq!(guard.head, page * 10);
        assert_eq!(guard.tail.as_ref().expect("tail")[0], page as u8 + 200);
    }
    fx.shutdown()
}

#[test]
fn failed_eviction_write_keeps_page_dirty() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 0)?;
    let node = Node::new(5);
    let attr = node.attr();
    drop(fx.table.put(&fx.file, PageId(5), fx.hash(5), node, attr)?);

    fx.io.set_fail_writes(true);
    let reserved = fx.table.reserve_memory(1.0);
    let state = fx.table.pair_state(&fx.file, PageId(5)).expect("kept");
    assert!(state.dirty);
    assert_eq!(state.state, PairState::Available);
    assert!(fx.table.status().eviction_write_errors >= 1);
    assert!(fx.table.panic_reason().is_none());

    fx.io.set_fail_writes(false);
    fx.table.evict_to_limit();
    assert_eq!(fx.table.pair_count(), 0);
    fx.table.release_reserved_memory(reserved);

    let guard = fx.table.get_and_pin(&fx.file, PageId(5), fx.hash(5), PinMode::Shared)?;
    assert_eq!(guard.head, 5);
    drop(guard);
    fx.shutdown()
}

#[test]
fn admission_waits_for_an_unpin() -> Result<()> {
    let fx = Fixture::new(quiet_options(4), NodeOps::new(), 0)?;
    let mut held = Vec::new();
    for page in 0..4u64 {
        held.push(fx.table.put(
            &fx.file,
            PageId(page),
            fx.hash(page),
            Node::new(page),
            PairAttr::with_size(1),
        )?);
    }

    let table = fx.table.clone();
    let file = fx.file.clone();
    let hash = fx.hash(4);
    let started = Instant::now();
    let inserter = thread::spawn(move || -> Result<Duration> {
        let guard = table.put(&file, PageId(4), hash, Node::new(4), PairAttr::with_size(1))?;
        drop(guard);
        Ok(started.elapsed())
    });

    thread::sleep(Duration::from_millis(50));
    drop(held.remove(0));
    let waited = inserter.join().expect("inserter")?;
    assert!(waited >= Duration::from_millis(40), "waited {waited:?}");
    assert!(waited < Duration::from_secs(2), "waited {waited:?}");
    assert!(fx.table.status().admission_waits >= 1);
    assert!(fx.table.status().size_current <= 4);
    drop(held);
    fx.shutdown()
}

#[test]
fn admission_holds_the_limit_while_pages_stay_pinned() -> Result<()> {
    let fx = Fixture::new(quiet_options(10), NodeOps::new(), 0)?;
    let held = fx.table.put(
        &fx.file,
        PageId(0),
        fx.hash(0),
        Node::new(0),
        PairAttr::with_size(10),
    )?;

    let table = fx.table.clone();
    let file = fx.file.clone();
    let hash = fx.hash(1);
    let (tx, rx) = mpsc::channel();
    let inserter = thread::spawn(move || -> Result<()> {
        let guard = table.put(&file, PageId(1), hash, Node::new(1), PairAttr::with_size(10))?;
        let _ = tx.send(table.status().size_current);
        drop(guard);
        Ok(())
    });

    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(fx.table.status().size_current, 10);
    assert!(fx.table.status().admission_waits >= 1);

    drop(held);
    let size_at_admission = rx.recv_timeout(Duration::from_secs(5)).expect("put admitted");
    inserter.join().expect("inserter")?;
    assert_eq!(size_at_admission, 10);
    assert!(fx.table.pair_state(&fx.file, PageId(0)).is_none());
    assert_eq!(fx.ops.flushes_of(PageId(0)).len(), 1);
    fx.shutdown()
}

#[test]
fn admission_gives_up_after_an_explicit_timeout() -> Result<()> {
    let mut options = quiet_options(2);
    options.admission_wait_ms = Some(30);
    let fx = Fixture::new(options, NodeOps::new(), 0)?;
    let held: Vec<_> = (0..2u64)
        .map(|page| {
            fx.table.put(
                &fx.file,
                PageId(page),
                fx.hash(page),
                Node::new(page),
                PairAttr::with_size(1),
            )
        })
        .collect::<Result<_>>()?;

    let started = Instant::now();
    let extra = fx.table.put(
        &fx.file,
        PageId(2),
        fx.hash(2),
        Node::new(2),
        PairAttr::with_size(1),
    )?;
    assert!(started.elapsed() >= Duration::from_millis(25));
    assert_eq!(fx.table.status().size_current, 3);
    drop(extra);
    drop(held);
    fx.shutdown()
}

#[test]
fn reservations_shrink_the_watermarks() -> Result<()> {
    let fx = Fixture::new(quiet_options(1000), NodeOps::new(), 0)?;
    assert_eq!(fx.table.watermarks().low, 1000);
    let reserved = fx.table.reserve_memory(0.5);
    assert_eq!(reserved, 500);
    let marks = fx.table.watermarks();
    assert_eq!(marks.low, 500);
    assert_eq!(marks.high, 750);
    assert_eq!(fx.table.status().size_limit, 500);
    fx.table.release_reserved_memory(reserved);
    assert_eq!(fx.table.watermarks().low, 1000);
    fx.shutdown()
}

#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cachetable::primitives::io::MemFileIo;
use cachetable::types::PageId;
use cachetable::{
    CacheError, CacheTable, CacheTableOptions, NoCheckpointHooks, PairAttr, PinMode, Result,
};
use common::{init_tracing, quiet_options, Fixture, Node, NodeOps, RecordingHooks};
use tempfile::tempdir;

#[test]
fn pages_survive_close_and_reopen_on_disk() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("pages.db");
    let table = CacheTable::<Node>::new(quiet_options(1 << 20))?;

    let file = table.open_path(&path, Arc::new(NodeOps::new()))?;
    assert_eq!(file.path(), Some(path.as_path()));
    for page in 0..10u64 {
        let node = Node::new(page + 500);
        let attr = node.attr();
        drop(table.put(&file, PageId(page), file.fullhash(PageId(page)), node, attr)?);
    }
    table.close_file(&file)?;
    assert_eq!(table.pair_count(), 0);

    let file = table.open_path(&path, Arc::new(NodeOps::new()))?;
    for page in 0..10u64 {
        let guard = table.get_and_pin(&file, PageId(page), file.fullhash(PageId(page)), PinMode::Shared)?;
        assert_eq!(guard.head, page + 500);
        assert_eq!(guard.tail.as_deref(), Some(common::tail_for(page + 500).as_slice()));
    }
    table.close_file(&file)?;
    table.close()
}

#[test]
fn close_refuses_pinned_files() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 4)?;
    let guard = fx.table.get_and_pin(&fx.file, PageId(0), fx.hash(0), PinMode::Shared)?;
    assert!(matches!(fx.table.close_file(&fx.file), Err(CacheError::Invalid(_))));
    assert!(!fx.file.is_closed());
    assert_eq!(fx.table.count_pinned(&fx.file), 1);
    drop(guard);
    fx.shutdown()
}

#[test]
fn close_during_checkpoint_tells_the_hook() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 0)?;
    let hooks = Arc::new(RecordingHooks::default());
    fx.file.set_hooks(hooks.clone());
    let node = Node::new(1);
    let attr = node.attr();
    drop(fx.table.put(&fx.file, PageId(1), fx.hash(1), node, attr)?);

    fx.table.begin_checkpoint()?;
    fx.table.close_file(&fx.file)?;
    assert!(hooks.calls().contains(&"close:true".to_string()));
    let writes = fx.ops.flushes_of(PageId(1));
    assert_eq!(writes.len(), 1);
    assert!(writes[0].for_checkpoint);
    fx.table.end_checkpoint(&NoCheckpointHooks)?;
    fx.table.close()
}

#[test]
fn flush_file_writes_and_evicts_but_stays_open() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 0)?;
    for page in 0..4u64 {
        let node = Node::new(page);
        let attr = node.attr();
        drop(fx.table.put(&fx.file, PageId(page), fx.hash(page), node, attr)?);
    }
    fx.table.flush_file(&fx.file)?;
    assert_eq!(fx.table.pair_count(), 0);
    assert_eq!(fx.ops.writes(), 4);
    assert!(!fx.file.is_closed());
    let guard = fx.table.get_and_pin(&fx.file, PageId(3), fx.hash(3), PinMode::Shared)?;
    assert_eq!(guard.head, 3);
    drop(guard);
    fx.shutdown()
}

#[test]
fn file_numbers_are_looked_up_and_reused() -> Result<()> {
    let table = CacheTable::<Node>::new(quiet_options(1 << 20))?;
    let first = table.open_file(Arc::new(MemFileIo::new()), Arc::new(NodeOps::new()))?;
    let second = table.open_file(Arc::new(MemFileIo::new()), Arc::new(NodeOps::new()))?;
    assert_ne!(first.filenum(), second.filenum());
    assert_eq!(table.file_of_filenum(second.filenum())?.filenum(), second.filenum());

    let early_close = table.clone();
    assert!(matches!(early_close.close(), Err(CacheError::Invalid(_))));

    table.close_file(&first)?;
    assert!(matches!(
        table.file_of_filenum(first.filenum()),
        Err(CacheError::NotFound)
    ));
    let third = table.open_file(Arc::new(MemFileIo::new()), Arc::new(NodeOps::new()))?;
    assert_eq!(third.filenum(), first.filenum());
    table.close_file(&second)?;
    table.close_file(&third)?;
    table.close()
}

#[test]
fn close_waits_for_enqueued_jobs() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 0)?;
    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    fx.table.enqueue_job(&fx.file, move || {
        thread::sleep(Duration::from_millis(50));
        flag.store(true, Ordering::SeqCst);
    })?;
    let table = fx.table.clone();
    let file = fx.file.clone();
    fx.shutdown()?;
    assert!(done.load(Ordering::SeqCst));
    assert!(matches!(
        table.enqueue_job(&file, || {}),
        Err(CacheError::Closed)
    ));
    Ok(())
}

#[test]
fn enqueued_job_can_pin_a_page_it_prefetched() -> Result<()> {
    let mut options = quiet_options(1 << 20);
    options.worker_threads = 1;
    options.client_threads = 1;
    let fx = Fixture::new(options, NodeOps::new(), 8)?;
    let (tx, rx) = mpsc::channel();
    for page in [5u64, 6] {
        let table = fx.table.clone();
        let file = fx.file.clone();
        let tx = tx.clone();
        fx.table.enqueue_job(&fx.file, move || {
            let id = PageId(page);
            let outcome = table
                .prefetch(&file, id, file.fullhash(id))
                .and_then(|_| table.get_and_pin(&file, id, file.fullhash(id), PinMode::Exclusive))
                .map(|guard| guard.head);
            let _ = tx.send(outcome);
        })?;
    }
    for _ in 0..2 {
        let head = rx.recv_timeout(Duration::from_secs(5)).expect("job finished")?;
        assert!(head == 5 || head == 6);
    }
    assert_eq!(fx.ops.fetches(), 2);
    fx.shutdown()
}

#[test]
fn close_drops_pages_it_cannot_write() -> Result<()> {
    let fx = Fixture::new(quiet_options(1 << 20), NodeOps::new(), 0)?;
    let node = Node::new(8);
    let attr = node.attr();
    drop(fx.table.put(&fx.file, PageId(8), fx.hash(8), node, attr)?);
    fx.io.set_fail_writes(true);
    assert!(matches!(fx.table.close_file(&fx.file), Err(CacheError::Io(_))));
    assert!(fx.file.is_closed());
    assert_eq!(fx.table.pair_count(), 0);
    assert_eq!(fx.table.status().size_current, 0);
    fx.table.verify()?;
    fx.table.close()
}

#[test]
fn files_share_one_budget() -> Result<()> {
    let table = CacheTable::<Node>::new(quiet_options(4))?;
    let left = table.open_file(Arc::new(MemFileIo::new()), Arc::new(NodeOps::new()))?;
    let right = table.open_file(Arc::new(MemFileIo::new()), Arc::new(NodeOps::new()))?;
    for page in 0..6u64 {
        for file in [&left, &right] {
            let guard = table.put(
                file,
                PageId(page),
                file.fullhash(PageId(page)),
                Node::new(page),
                PairAttr::with_size(1),
            )?;
            drop(guard);
        }
    }
    assert!(table.status().size_current <= 4);
    for page in 0..6u64 {
        for file in [&left, &right] {
            let guard = table.get_and_pin(file, PageId(page), file.fullhash(PageId(page)), PinMode::Shared)?;
            assert_eq!(guard.head, page);
        }
    }
    table.close_file(&left)?;
    table.close_file(&right)?;
    table.close()
}

#[test]
fn options_load_from_toml_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("cachetable.toml");
    std::fs::write(
        &path,
        "size_limit = 4096\nworker_threads = 3\ncleaner_period_ms = 0\ncheckpoint_period_ms = 250\n",
    )?;
    let options = CacheTableOptions::from_path(&path)?;
    assert_eq!(options.size_limit, 4096);
    assert_eq!(options.checkpoint_period_ms, Some(250));

    let table = CacheTable::<Node>::new(options.clone())?;
    assert_eq!(table.options(), options);
    table.set_cleaner_period(5);
    table.set_cleaner_iterations(4);
    let current = table.options();
    assert_eq!(current.cleaner_period_ms, 5);
    assert_eq!(current.cleaner_iterations, 4);
    table.set_size_limit(8192);
    assert_eq!(table.status().size_limit, 8192);
    table.close()
}

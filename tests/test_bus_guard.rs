// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bus guard behaviour within one process: held flag, unmatched unlocks,
// register cache write-back and refresh, expander lookup budget.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use buslock::{
    segment_size_for, BusConfig, BusContext, BusGuard, BusKind, Error, MemoryNode, NamedLock,
    NodeTable, RegisterCache, RegisterState,
};

const PIN_BASE: i32 = 100;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("/{prefix}_{}_{n}", std::process::id());
    NamedLock::unlink(&name).expect("unlink stale");
    name
}

/// Stateful guard with an expander node registered at `PIN_BASE`.
fn i2c_guard(name: &str) -> (BusGuard, Arc<MemoryNode>, Arc<NodeTable>) {
    let node = Arc::new(MemoryNode::default());
    let table = Arc::new(NodeTable::new());
    table.insert(PIN_BASE, node.clone());
    let guard = BusGuard::stateful(BusKind::I2c, name, table.clone(), PIN_BASE);
    (guard, node, table)
}

/// A second handle on the guard's segment, used to inspect or fake what
/// another process left behind.
fn peer(name: &str) -> NamedLock {
    NamedLock::create_or_attach(name, RegisterState::SIZE).expect("attach peer")
}

fn shared_state(peer: &NamedLock) -> (Option<libc::pid_t>, bool, RegisterState) {
    peer.acquire().expect("peer acquire");
    let mut buf = [0u8; RegisterState::SIZE];
    peer.read_payload(&mut buf).expect("read payload");
    let out = (peer.owner_pid(), peer.data_initialized(), RegisterState::from_bytes(&buf));
    peer.release().expect("peer release");
    out
}

fn my_pid() -> libc::pid_t {
    std::process::id() as libc::pid_t
}

#[test]
fn held_flag_follows_lock_and_unlock() {
    let name = unique_name("bg_held");
    let guard = BusGuard::stateless(BusKind::Spi, &name);

    assert!(!guard.is_held());
    guard.lock().expect("lock");
    assert!(guard.is_held());
    assert!(guard.is_held_by_current_thread());
    guard.unlock().expect("unlock");
    assert!(!guard.is_held());

    // Unmatched unlocks are no-ops.
    guard.unlock().expect("second unlock");
    guard.unlock().expect("third unlock");
    assert!(!guard.is_held());

    guard.lock().expect("relock");
    assert!(guard.is_held());
    guard.unlock().expect("unlock");

    guard.destroy().expect("destroy");
}

#[test]
fn unlock_before_first_lock_does_nothing() {
    let name = unique_name("bg_uninit");
    let guard = BusGuard::stateless(BusKind::Spi, &name);

    guard.unlock().expect("unlock");
    assert!(!guard.is_held());

    // The segment was never created by the unlock.
    let other = NamedLock::create_or_attach(&name, 0).expect("attach");
    assert!(other.is_creator());
    other.destroy().expect("destroy");
}

#[test]
fn relock_from_same_thread_is_an_error() {
    let name = unique_name("bg_reentrant");
    let guard = BusGuard::stateless(BusKind::Spi, &name);

    guard.lock().expect("lock");
    assert!(matches!(guard.lock(), Err(Error::AlreadyHeld { .. })));
    assert!(guard.is_held());
    guard.unlock().expect("unlock");

    guard.destroy().expect("destroy");
}

#[test]
fn other_thread_cannot_unlock() {
    let name = unique_name("bg_foreign_unlock");
    let guard = BusGuard::stateless(BusKind::Spi, &name);

    guard.lock().expect("lock");
    thread::scope(|s| {
        s.spawn(|| {
            assert!(!guard.is_held_by_current_thread());
            guard.unlock().expect("foreign unlock");
            assert!(guard.is_held());
        });
    });
    assert!(guard.is_held_by_current_thread());
    guard.unlock().expect("unlock");

    guard.destroy().expect("destroy");
}

#[test]
fn threads_take_turns_on_one_guard() {
    let name = unique_name("bg_threads");
    let guard = BusGuard::stateless(BusKind::Spi, &name);
    let in_cs = AtomicBool::new(false);
    let violation = AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..25 {
                    guard.lock().expect("lock");
                    if in_cs.swap(true, Ordering::SeqCst) {
                        violation.store(true, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_micros(20));
                    in_cs.store(false, Ordering::SeqCst);
                    guard.unlock().expect("unlock");
                }
            });
        }
    });

    assert!(!violation.load(Ordering::SeqCst), "two threads held the bus");
    assert!(!guard.is_held());
    guard.destroy().expect("destroy");
}

#[test]
fn concurrent_unlocks_release_once() {
    let name = unique_name("bg_unlock_race");
    let guard = BusGuard::stateless(BusKind::Spi, &name);

    guard.lock().expect("lock");
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| guard.unlock().expect("racing unlock"));
        }
        guard.unlock().expect("owner unlock");
    });
    assert!(!guard.is_held());

    // Still usable: a double release would have broken the mutex.
    guard.lock().expect("lock again");
    guard.unlock().expect("unlock again");
    guard.destroy().expect("destroy");
}

#[test]
fn spi_guard_uses_lock_only_segment() {
    let name = unique_name("bg_spi");
    let guard = BusGuard::stateless(BusKind::Spi, &name);
    assert!(!guard.is_stateful());

    guard.lock().expect("lock");
    guard.unlock().expect("unlock");

    let other = NamedLock::create_or_attach(&name, 0).expect("attach");
    assert!(!other.is_creator());
    assert_eq!(other.segment_size(), segment_size_for(0));
    assert_eq!(other.owner_pid(), None);
    drop(other);

    guard.destroy().expect("destroy");
}

#[test]
fn init_flag_is_clear_until_first_unlock() {
    let name = unique_name("bg_init_flag");
    let (guard, node, _table) = i2c_guard(&name);
    let peer = peer(&name);

    let (_, initialized, _) = shared_state(&peer);
    assert!(!initialized);

    guard.lock().expect("lock");
    node.store(RegisterState::new(7, 3));
    guard.unlock().expect("unlock");

    let (owner, initialized, state) = shared_state(&peer);
    assert!(initialized);
    assert_eq!(owner, Some(my_pid()));
    assert_eq!(state, RegisterState::new(7, 3));

    drop(peer);
    guard.destroy().expect("destroy");
}

#[test]
fn same_process_relock_skips_refresh() {
    let name = unique_name("bg_same_pid");
    let (guard, node, _table) = i2c_guard(&name);
    let peer = peer(&name);

    guard.lock().expect("lock");
    node.store(RegisterState::new(7, 3));
    guard.unlock().expect("unlock");

    // Scribble over the payload without changing the owner pid.
    peer.acquire().expect("peer acquire");
    peer.write_payload(&RegisterState::new(1, 1).to_bytes()).expect("write");
    peer.release().expect("peer release");

    guard.lock().expect("relock");
    assert_eq!(node.load(), RegisterState::new(7, 3));
    guard.unlock().expect("unlock");

    drop(peer);
    guard.destroy().expect("destroy");
}

#[test]
fn lock_after_other_owner_refreshes_cache() {
    let name = unique_name("bg_handoff");
    let (guard, node, _table) = i2c_guard(&name);
    let peer = peer(&name);

    // Pretend another process held the bus last and left {9, 4} behind.
    peer.acquire().expect("peer acquire");
    peer.set_owner_pid(my_pid().wrapping_add(1)).expect("pid");
    peer.write_payload(&RegisterState::new(9, 4).to_bytes()).expect("write");
    peer.set_data_initialized(true).expect("flag");
    peer.release().expect("peer release");

    guard.lock().expect("lock");
    assert_eq!(node.load(), RegisterState::new(9, 4));
    guard.unlock().expect("unlock");

    let (owner, _, _) = shared_state(&peer);
    assert_eq!(owner, Some(my_pid()));

    drop(peer);
    guard.destroy().expect("destroy");
}

#[test]
fn uninitialized_payload_is_not_loaded() {
    let name = unique_name("bg_no_init");
    let (guard, node, _table) = i2c_guard(&name);
    node.store(RegisterState::new(5, 6));
    let peer = peer(&name);

    peer.acquire().expect("peer acquire");
    peer.set_owner_pid(my_pid().wrapping_add(1)).expect("pid");
    peer.release().expect("peer release");

    guard.lock().expect("lock");
    assert_eq!(node.load(), RegisterState::new(5, 6));
    guard.unlock().expect("unlock");

    drop(peer);
    guard.destroy().expect("destroy");
}

#[test]
fn missing_expander_is_looked_up_twice_at_most() {
    let name = unique_name("bg_lookup");
    let table = Arc::new(NodeTable::new());
    let guard = BusGuard::stateful(BusKind::I2c, &name, table.clone(), PIN_BASE);

    for _ in 0..3 {
        guard.lock().expect("lock");
        guard.unlock().expect("unlock");
    }
    assert_eq!(table.lookups(), 2);

    // Nothing was ever published without a node.
    let (_, initialized, _) = shared_state(&peer(&name));
    assert!(!initialized);

    guard.destroy().expect("destroy");
}

#[test]
fn missing_expander_lookup_budget_holds_across_threads() {
    let name = unique_name("bg_lookup_mt");
    let table = Arc::new(NodeTable::new());
    let guard = BusGuard::stateful(BusKind::I2c, &name, table.clone(), PIN_BASE);

    guard.lock().expect("lock");
    thread::scope(|s| {
        // Blocks in lock() while the main thread holds the bus.
        let waiter = s.spawn(|| {
            guard.lock().expect("waiter lock");
            guard.unlock().expect("waiter unlock");
        });
        thread::sleep(Duration::from_millis(100));
        guard.unlock().expect("unlock");
        waiter.join().expect("waiter");
    });

    for _ in 0..3 {
        guard.lock().expect("lock");
        guard.unlock().expect("unlock");
    }
    assert!(table.lookups() <= 2, "lookups = {}", table.lookups());

    guard.destroy().expect("destroy");
}

#[test]
fn expander_found_on_unlock_is_used() {
    let name = unique_name("bg_late_node");
    let table = Arc::new(NodeTable::new());
    let guard = BusGuard::stateful(BusKind::I2c, &name, table.clone(), PIN_BASE);

    guard.lock().expect("lock");
    table.insert(PIN_BASE, Arc::new(MemoryNode::new(RegisterState::new(2, 8))));
    guard.unlock().expect("unlock");
    assert_eq!(table.lookups(), 2);

    guard.lock().expect("lock");
    guard.unlock().expect("unlock");
    assert_eq!(table.lookups(), 2);

    let (_, initialized, state) = shared_state(&peer(&name));
    assert!(initialized);
    assert_eq!(state, RegisterState::new(2, 8));

    guard.destroy().expect("destroy");
}

#[test]
fn bus_access_unlocks_on_drop() {
    let name = unique_name("bg_access");
    let guard = BusGuard::stateless(BusKind::Spi, &name);

    {
        let access = guard.access().expect("access");
        assert_eq!(access.bus(), BusKind::Spi);
        assert!(guard.is_held());
    }
    assert!(!guard.is_held());

    let access = guard.access().expect("access again");
    access.release().expect("release");
    assert!(!guard.is_held());

    guard.destroy().expect("destroy");
}

#[test]
fn destroy_while_held_releases_and_unlinks() {
    let name = unique_name("bg_destroy");
    let guard = BusGuard::stateless(BusKind::Spi, &name);

    guard.lock().expect("lock");
    guard.destroy().expect("destroy");
    assert!(!guard.is_held());

    let other = NamedLock::create_or_attach(&name, 0).expect("attach");
    assert!(other.is_creator());
    other.destroy().expect("destroy other");
}

#[test]
fn context_guards_are_independent() {
    let prefix = format!("bg_ctx_{}", std::process::id());
    let config = BusConfig::with_prefix(&prefix);
    NamedLock::unlink(&config.i2c_name).expect("unlink");
    NamedLock::unlink(&config.spi_name).expect("unlink");

    let table = Arc::new(NodeTable::new());
    let node = Arc::new(MemoryNode::default());
    table.insert(config.expander_pin_base, node.clone());
    let ctx = BusContext::new(config, table);

    ctx.i2c().lock().expect("lock i2c");
    ctx.spi().lock().expect("lock spi");
    assert!(ctx.bus(BusKind::I2c).is_held());
    assert!(ctx.bus(BusKind::Spi).is_held());
    ctx.spi().unlock().expect("unlock spi");
    assert!(ctx.i2c().is_held());
    node.store(RegisterState::new(0x12, 0x34));
    ctx.i2c().unlock().expect("unlock i2c");

    let (_, initialized, state) = shared_state(&peer(&ctx.config().i2c_name));
    assert!(initialized);
    assert_eq!(state, RegisterState::new(0x12, 0x34));

    ctx.i2c().destroy().expect("destroy i2c");
    ctx.spi().destroy().expect("destroy spi");
}

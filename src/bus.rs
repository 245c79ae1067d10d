// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-bus guard on top of NamedLock.
//
// The guard lazily opens the bus's named lock, remembers which thread of
// this process holds it, and for the bus carrying the GPIO expander moves
// the expander's register cache through the lock payload: refreshed from
// the payload when the lock arrives from another process, written back to
// the payload before every release.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::hardware::{HardwareLookup, RegisterCache, RegisterState};
use crate::mutex::{NamedLock, DEFAULT_RECOVERY_DELAY};
use crate::scoped_access::BusAccess;

/// The physical buses guarded by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    I2c,
    Spi,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::I2c => f.write_str("i2c"),
            BusKind::Spi => f.write_str("spi"),
        }
    }
}

struct Expander {
    lookup: Arc<dyn HardwareLookup>,
    pin_base: i32,
}

enum NodeSlot {
    Unresolved,
    Resolved(Arc<dyn RegisterCache>),
    /// The lookup on lock found nothing; one more try is left for unlock.
    Tried,
    /// Looked up on lock and again on unlock without success.
    GaveUp,
}

struct GuardState {
    lock: Option<Arc<NamedLock>>,
    holder: Option<ThreadId>,
    node: NodeSlot,
}

/// Process-local guard for one bus.
///
/// `lock` blocks until this process owns the bus; `unlock` from a thread
/// that does not hold it is a no-op.
pub struct BusGuard {
    kind: BusKind,
    name: String,
    recovery_delay: Duration,
    expander: Option<Expander>,
    state: Mutex<GuardState>,
}

fn current_pid() -> libc::pid_t {
    std::process::id() as libc::pid_t
}

impl BusGuard {
    fn new(kind: BusKind, name: &str, expander: Option<Expander>) -> Self {
        Self {
            kind,
            name: name.to_string(),
            recovery_delay: DEFAULT_RECOVERY_DELAY,
            expander,
            state: Mutex::new(GuardState {
                lock: None,
                holder: None,
                node: NodeSlot::Unresolved,
            }),
        }
    }

    /// Guard for a bus without device state (lock-only segment).
    pub fn stateless(kind: BusKind, name: &str) -> Self {
        Self::new(kind, name, None)
    }

    /// Guard for a bus carrying the expander found at `pin_base` in `lookup`.
    pub fn stateful(kind: BusKind, name: &str, lookup: Arc<dyn HardwareLookup>, pin_base: i32) -> Self {
        Self::new(kind, name, Some(Expander { lookup, pin_base }))
    }

    pub fn with_recovery_delay(mut self, delay: Duration) -> Self {
        self.recovery_delay = delay;
        self
    }

    pub fn kind(&self) -> BusKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the guard hands off device state through the lock payload.
    pub fn is_stateful(&self) -> bool {
        self.expander.is_some()
    }

    fn payload_len(&self) -> usize {
        if self.is_stateful() {
            RegisterState::SIZE
        } else {
            0
        }
    }

    fn state(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether some thread of this process holds the bus.
    pub fn is_held(&self) -> bool {
        self.state().holder.is_some()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.state().holder == Some(thread::current().id())
    }

    fn named_lock(&self, st: &mut GuardState) -> Result<Arc<NamedLock>> {
        if let Some(lock) = &st.lock {
            return Ok(Arc::clone(lock));
        }
        let lock = NamedLock::create_or_attach(&self.name, self.payload_len())?
            .with_recovery_delay(self.recovery_delay);
        let lock = Arc::new(lock);
        st.lock = Some(Arc::clone(&lock));
        Ok(lock)
    }

    /// Look the expander node up, at most once on lock and once on unlock
    /// over the guard's lifetime.  The lookup on unlock is the last one.
    fn resolve_node(&self, st: &mut GuardState, last_attempt: bool) {
        let Some(expander) = &self.expander else {
            return;
        };
        let due = match st.node {
            NodeSlot::Unresolved => true,
            NodeSlot::Tried => last_attempt,
            NodeSlot::Resolved(_) | NodeSlot::GaveUp => false,
        };
        if !due {
            return;
        }
        match expander.lookup.find_node(expander.pin_base) {
            Some(node) => st.node = NodeSlot::Resolved(node),
            None if last_attempt => {
                debug!(bus = %self.kind, pin_base = expander.pin_base, "no expander node, not looking again");
                st.node = NodeSlot::GaveUp;
            }
            None => st.node = NodeSlot::Tried,
        }
    }

    /// Take the bus, blocking until it is free.
    pub fn lock(&self) -> Result<()> {
        let me = thread::current().id();
        let lock = {
            let mut st = self.state();
            if st.holder == Some(me) {
                return Err(Error::AlreadyHeld {
                    name: self.name.clone(),
                });
            }
            let lock = self.named_lock(&mut st)?;
            self.resolve_node(&mut st, false);
            lock
        };

        // Not under the local section: the holder's unlock needs it.
        lock.acquire()?;

        let mut st = self.state();
        st.holder = Some(me);
        if self.is_stateful() {
            if let Err(e) = self.take_over(&lock, &st.node) {
                st.holder = None;
                if let Err(release_err) = lock.release() {
                    warn!(bus = %self.kind, error = %release_err, "release after failed hand-off also failed");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Refresh the node's register cache if the lock comes from another
    /// process, then claim the lock for this process.
    fn take_over(&self, lock: &NamedLock, node: &NodeSlot) -> Result<()> {
        let pid = current_pid();
        let owner = lock.owner_pid();
        if owner == Some(pid) {
            trace!(bus = %self.kind, "bus last held by this process, cache is current");
            return Ok(());
        }
        if lock.data_initialized() {
            if let NodeSlot::Resolved(node) = node {
                let mut buf = [0u8; RegisterState::SIZE];
                lock.read_payload(&mut buf)?;
                let state = RegisterState::from_bytes(&buf);
                node.store(state);
                trace!(bus = %self.kind, previous_owner = ?owner, ?state, "loaded register cache from previous owner");
            }
        }
        lock.set_owner_pid(pid)
    }

    /// Release the bus.  A no-op unless the calling thread holds it; an
    /// unlock from another thread leaves [`is_held`](Self::is_held) true.
    ///
    /// The whole sequence runs inside the process-local section, so two
    /// threads racing here cannot both release.
    pub fn unlock(&self) -> Result<()> {
        let mut st = self.state();
        if st.holder != Some(thread::current().id()) {
            trace!(bus = %self.kind, "unlock without holding the bus, ignored");
            return Ok(());
        }
        st.holder = None;
        let Some(lock) = st.lock.clone() else {
            return Ok(());
        };

        let stored = if self.is_stateful() {
            self.resolve_node(&mut st, true);
            self.store_state(&lock, &st.node)
        } else {
            Ok(())
        };
        let released = lock.release();
        stored.and(released)
    }

    fn store_state(&self, lock: &NamedLock, node: &NodeSlot) -> Result<()> {
        if let NodeSlot::Resolved(node) = node {
            lock.write_payload(&node.load().to_bytes())?;
            lock.set_data_initialized(true)?;
        }
        Ok(())
    }

    /// Lock the bus for the lifetime of the returned guard.
    pub fn access(&self) -> Result<BusAccess<'_>> {
        BusAccess::new(self)
    }

    /// Destroy the shared lock of this bus and unlink its name.
    ///
    /// Releases the bus first if the calling thread holds it.  Fails with
    /// `EBUSY` while another thread of this process holds or waits for it.
    pub fn destroy(&self) -> Result<()> {
        let busy = || {
            Error::resource(
                "pthread_mutex_destroy",
                &self.name,
                io::Error::from_raw_os_error(libc::EBUSY),
            )
        };

        let mut st = self.state();
        let me = thread::current().id();
        if st.holder.is_some_and(|holder| holder != me) {
            return Err(busy());
        }
        let Some(lock) = st.lock.take() else {
            return NamedLock::unlink(&self.name);
        };
        if st.holder.take().is_some() {
            lock.release()?;
        }
        match Arc::try_unwrap(lock) {
            Ok(lock) => lock.destroy(),
            Err(lock) => {
                st.lock = Some(lock);
                Err(busy())
            }
        }
    }
}

impl fmt::Debug for BusGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusGuard")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("stateful", &self.is_stateful())
            .field("held", &self.is_held())
            .finish()
    }
}

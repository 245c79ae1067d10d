// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named cross-process lock: a robust process-shared mutex at the start of a
// named shared memory segment, optionally followed by an owner pid, an init
// flag and a fixed-size payload that travels with the lock.

use std::fmt;
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::layout::{AuxHeader, SegmentLayout, SegmentView};
use crate::platform::{LockOutcome, PlatformSegment, RobustMutex};

/// Pause between owner-death recovery attempts.
pub const DEFAULT_RECOVERY_DELAY: Duration = Duration::from_millis(50);

/// A named, inter-process lock that survives the death of its holder.
///
/// The handle itself is process-local; the segment it maps is shared by
/// every process that opens the same name.  Dropping the handle unmaps the
/// segment but leaves the mutex and the name in place for other processes.
///
/// The owner pid, init flag and payload accessors do no locking of their
/// own: call them only between [`acquire`](Self::acquire) and
/// [`release`](Self::release).
pub struct NamedLock {
    segment: PlatformSegment,
    view: SegmentView,
    mutex: RobustMutex,
    recovery_delay: Duration,
    /// Thread of this process holding the mutex through this handle.
    holder: Mutex<Option<ThreadId>>,
}

// Safety: the view points into `segment`, which lives as long as the lock;
// the shared regions behind it are only touched while the mutex is held.
unsafe impl Send for NamedLock {}
unsafe impl Sync for NamedLock {}

impl NamedLock {
    /// Open the lock segment `name`, creating and initialising it if this is
    /// the first process to use the name.
    ///
    /// `payload_len == 0` gives a lock-only segment without owner pid, init
    /// flag or payload.
    pub fn create_or_attach(name: &str, payload_len: usize) -> Result<Self> {
        let layout = SegmentLayout::new(payload_len);
        let segment = PlatformSegment::open_or_create(name, layout.total_size())?;

        // Safety: the mapping is exactly `total_size` bytes and page aligned.
        let view = unsafe { SegmentView::new(segment.as_mut_ptr(), layout) };
        let mutex = unsafe { RobustMutex::from_ptr(view.mutex) };

        if segment.created() {
            unsafe { ptr::write_bytes(segment.as_mut_ptr(), 0, layout.total_size()) };
            if let Err(failure) = mutex.init() {
                let err = failure.into_error(segment.name());
                if let Err(unlink_err) = segment.unlink() {
                    warn!(name = segment.name(), error = %unlink_err, "unlink after failed mutex init also failed");
                }
                return Err(err);
            }
            debug!(name = segment.name(), size = segment.size(), "created shared lock");
        } else {
            debug!(name = segment.name(), size = segment.size(), "attached to shared lock");
        }

        Ok(Self {
            segment,
            view,
            mutex,
            recovery_delay: DEFAULT_RECOVERY_DELAY,
            holder: Mutex::new(None),
        })
    }

    /// Override the pause used while recovering from a dead holder.
    pub fn with_recovery_delay(mut self, delay: Duration) -> Self {
        self.recovery_delay = delay;
        self
    }

    /// POSIX name of the segment (with leading '/').
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Whether this handle created the segment and initialised the mutex.
    pub fn is_creator(&self) -> bool {
        self.segment.created()
    }

    /// Mapped size of the segment.
    pub fn segment_size(&self) -> usize {
        self.segment.size()
    }

    pub fn payload_len(&self) -> usize {
        self.view.payload_len
    }

    /// Block until the lock is held by the calling thread.
    ///
    /// If the previous holder died while holding the lock, the mutex is
    /// marked consistent, released, and taken again after a short pause.
    /// Only a clean acquisition returns.
    pub fn acquire(&self) -> Result<()> {
        let mut recoveries = 0u32;
        loop {
            let outcome = self.mutex.lock().map_err(|f| f.into_error(self.name()))?;
            match outcome {
                LockOutcome::Acquired => {
                    *self.holder() = Some(thread::current().id());
                    return Ok(());
                }
                LockOutcome::OwnerDied => {
                    recoveries += 1;
                    warn!(
                        name = self.name(),
                        attempt = recoveries,
                        "previous holder died holding the lock, recovering"
                    );
                    self.mutex
                        .make_consistent()
                        .map_err(|f| f.into_error(self.name()))?;
                    self.mutex.unlock().map_err(|f| f.into_error(self.name()))?;
                    thread::sleep(self.recovery_delay);
                }
            }
        }
    }

    /// Release the lock.  Fails if the calling thread does not hold it.
    pub fn release(&self) -> Result<()> {
        let me = thread::current().id();
        let mut holder = self.holder();
        // Cleared while still held; a waiter may own the mutex right after
        // the unlock.
        let was_mine = *holder == Some(me);
        if was_mine {
            *holder = None;
        }
        drop(holder);

        let result = self.mutex.unlock().map_err(|f| f.into_error(self.name()));
        if result.is_err() && was_mine {
            *self.holder() = Some(me);
        }
        result
    }

    fn holder(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the calling thread holds the lock through this handle.
    pub fn is_held_by_current_thread(&self) -> bool {
        *self.holder() == Some(thread::current().id())
    }

    /// Release before unmapping: a robust mutex still held by this thread
    /// stays on its robust list and must not outlive the mapping.
    fn release_if_held(&self) -> Result<()> {
        if self.is_held_by_current_thread() {
            debug!(name = self.name(), "releasing lock before teardown");
            self.release()?;
        }
        Ok(())
    }

    fn aux(&self) -> Result<*mut AuxHeader> {
        self.view.aux.ok_or_else(|| Error::NoPayload {
            name: self.name().to_string(),
        })
    }

    /// Pid of the last process that took the lock (0 if none yet).
    /// `None` for lock-only segments.
    pub fn owner_pid(&self) -> Option<libc::pid_t> {
        self.view
            .aux
            .map(|aux| unsafe { ptr::addr_of!((*aux).owner_pid).read() })
    }

    pub fn set_owner_pid(&self, pid: libc::pid_t) -> Result<()> {
        let aux = self.aux()?;
        unsafe { ptr::addr_of_mut!((*aux).owner_pid).write(pid) };
        Ok(())
    }

    /// Whether the payload has been written at least once.
    pub fn data_initialized(&self) -> bool {
        self.view
            .aux
            .map(|aux| unsafe { ptr::addr_of!((*aux).data_init).read() } != 0)
            .unwrap_or(false)
    }

    pub fn set_data_initialized(&self, initialized: bool) -> Result<()> {
        let aux = self.aux()?;
        unsafe { ptr::addr_of_mut!((*aux).data_init).write(libc::c_int::from(initialized)) };
        Ok(())
    }

    fn check_payload_len(&self, found: usize) -> Result<()> {
        self.aux()?;
        if found != self.view.payload_len {
            return Err(Error::PayloadLength {
                expected: self.view.payload_len,
                found,
            });
        }
        Ok(())
    }

    /// Copy the whole payload into `buf`, which must be exactly
    /// [`payload_len`](Self::payload_len) bytes.
    pub fn read_payload(&self, buf: &mut [u8]) -> Result<()> {
        self.check_payload_len(buf.len())?;
        unsafe { ptr::copy_nonoverlapping(self.view.payload, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Overwrite the whole payload with `buf`.
    pub fn write_payload(&self, buf: &[u8]) -> Result<()> {
        self.check_payload_len(buf.len())?;
        unsafe { ptr::copy_nonoverlapping(buf.as_ptr(), self.view.payload, buf.len()) };
        Ok(())
    }

    /// Unmap and close this handle, leaving the shared lock in place.
    ///
    /// Releases the lock first if the calling thread holds it.
    pub fn close(mut self) -> Result<()> {
        debug!(name = self.name(), "closing shared lock handle");
        self.release_if_held()?;
        self.segment.unmap_and_close()
    }

    /// Destroy the mutex, unmap, close and unlink the name.
    ///
    /// Releases the lock first if the calling thread holds it.  Meant for
    /// controlled shutdown; other processes still mapping the segment are
    /// left with a destroyed mutex.
    pub fn destroy(mut self) -> Result<()> {
        debug!(name = self.name(), "destroying shared lock");
        self.release_if_held()?;
        self.mutex
            .destroy()
            .map_err(|f| f.into_error(self.segment.name()))?;
        self.segment.unmap_and_close()?;
        self.segment.unlink()
    }

    /// Remove the name of a lock segment without opening it.
    pub fn unlink(name: &str) -> Result<()> {
        PlatformSegment::unlink_by_name(name)
    }
}

impl fmt::Debug for NamedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedLock")
            .field("name", &self.name())
            .field("created", &self.is_creator())
            .field("size", &self.segment_size())
            .field("payload_len", &self.payload_len())
            .finish()
    }
}

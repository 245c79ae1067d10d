// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX implementation of the named lock segment: shm_open / ftruncate /
// mmap for the segment itself and a process-shared robust pthread mutex
// living at its start.  Every `unsafe` libc call of the crate is in here.

use std::ffi::CString;
use std::io;
use std::mem;
use std::ptr;

use crate::error::{Error, Result};
use crate::shm_name;

// ---------------------------------------------------------------------------
// Robust mutex symbols, not exposed by `libc` crate on all platforms.
// macOS has no robust mutexes; there the mutex is process-shared only.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

/// Owner and group read/write.
pub const SHM_MODE: libc::mode_t = 0o660;

/// How often the open-existing / create-exclusive pair is retried when the
/// object appears or vanishes between the two calls.
const OPEN_ATTEMPTS: usize = 8;

// ---------------------------------------------------------------------------
// PlatformSegment: the mapped shared memory object
// ---------------------------------------------------------------------------

pub struct PlatformSegment {
    mem: *mut u8,
    size: usize,
    fd: libc::c_int,
    name: String,
    c_name: CString,
    created: bool,
}

// Safety: the mapping is shared between processes; all mutation of its
// contents is serialised by the mutex stored inside it.
unsafe impl Send for PlatformSegment {}
unsafe impl Sync for PlatformSegment {}

impl PlatformSegment {
    /// Open the segment `name` if it exists, otherwise create it.
    ///
    /// The open and the create are two separate calls so that exactly one
    /// process observes `created() == true`: the create uses `O_EXCL`, and a
    /// process losing that race goes back to opening the existing object.
    pub fn open_or_create(name: &str, size: usize) -> Result<Self> {
        let c_name = shm_name::to_c_name(name)?;
        let name = c_name.to_string_lossy().into_owned();

        let (fd, created) = open_fd(&c_name, &name)?;

        if let Err(e) = size_segment(fd, &name, size, created) {
            unsafe { libc::close(fd) };
            return Err(e);
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            let err = Error::last_os("mmap", &name);
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(Self {
            mem: mem as *mut u8,
            size,
            fd,
            name,
            c_name,
            created,
        })
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// POSIX name (with leading '/').
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True only for the handle whose `shm_open` created the object.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Unmap the segment and close the descriptor.  Safe to call twice.
    pub fn unmap_and_close(&mut self) -> Result<()> {
        if !self.mem.is_null() {
            let rc = unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
            self.mem = ptr::null_mut();
            if rc != 0 {
                return Err(Error::last_os("munmap", &self.name));
            }
        }
        if self.fd >= 0 {
            let rc = unsafe { libc::close(self.fd) };
            self.fd = -1;
            if rc != 0 {
                return Err(Error::last_os("close", &self.name));
            }
        }
        Ok(())
    }

    /// Remove the name.  Existing mappings stay valid.
    pub fn unlink(&self) -> Result<()> {
        let rc = unsafe { libc::shm_unlink(self.c_name.as_ptr()) };
        if rc != 0 {
            return Err(Error::last_os("shm_unlink", &self.name));
        }
        Ok(())
    }

    /// Remove a named segment without an open handle.  A missing name is
    /// not an error.
    pub fn unlink_by_name(name: &str) -> Result<()> {
        let c_name = shm_name::to_c_name(name)?;
        let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(Error::resource("shm_unlink", name, err));
            }
        }
        Ok(())
    }
}

impl Drop for PlatformSegment {
    fn drop(&mut self) {
        // The mutex and the name outlive this handle on purpose.
        let _ = self.unmap_and_close();
    }
}

fn open_fd(c_name: &CString, name: &str) -> Result<(libc::c_int, bool)> {
    for _ in 0..OPEN_ATTEMPTS {
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, SHM_MODE as libc::c_uint) };
        if fd != -1 {
            return Ok((fd, false));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(Error::resource("shm_open", name, err));
        }

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                SHM_MODE as libc::c_uint,
            )
        };
        if fd != -1 {
            return Ok((fd, true));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(Error::resource("shm_open", name, err));
        }
        // Another process created it in between; attach to theirs.
    }
    Err(Error::resource(
        "shm_open",
        name,
        io::Error::new(io::ErrorKind::Other, "segment kept vanishing while attaching"),
    ))
}

fn size_segment(fd: libc::c_int, name: &str, size: usize, created: bool) -> Result<()> {
    if created {
        // umask may have stripped the group bits.
        unsafe { libc::fchmod(fd, SHM_MODE) };
        return truncate(fd, name, size);
    }

    let mut st: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(Error::last_os("fstat", name));
    }
    let found = st.st_size as usize;
    if found == 0 {
        // The creator has not sized it yet; the result is identical.
        return truncate(fd, name, size);
    }

    // macOS reports shm object sizes rounded up to a page.
    #[cfg(target_os = "macos")]
    let fits = found >= size;
    #[cfg(not(target_os = "macos"))]
    let fits = found == size;

    if !fits {
        return Err(Error::LayoutMismatch {
            name: name.to_string(),
            expected: size,
            found,
        });
    }
    Ok(())
}

fn truncate(fd: libc::c_int, name: &str, size: usize) -> Result<()> {
    if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
        return Err(Error::last_os("ftruncate", name));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RobustMutex: pthread_mutex_t inside the segment
// ---------------------------------------------------------------------------

/// A failed pthread call: which call, and the error code it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsFailure {
    pub op: &'static str,
    pub errno: i32,
}

impl OsFailure {
    pub fn into_error(self, name: &str) -> Error {
        Error::from_errno(self.op, name, self.errno)
    }
}

pub type OsResult<T> = std::result::Result<T, OsFailure>;

/// Result of a blocking lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// The previous holder died; the caller owns the mutex but it is
    /// inconsistent until marked consistent.
    OwnerDied,
}

fn check(op: &'static str, eno: libc::c_int) -> OsResult<()> {
    if eno == 0 {
        Ok(())
    } else {
        Err(OsFailure { op, errno: eno })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RobustMutex {
    ptr: *mut libc::pthread_mutex_t,
}

// Safety: pthread mutexes are made for concurrent use; this one lives in a
// mapping that outlives every RobustMutex built on it.
unsafe impl Send for RobustMutex {}
unsafe impl Sync for RobustMutex {}

impl RobustMutex {
    /// # Safety
    /// `ptr` must point into a live mapping for as long as this value is used.
    pub unsafe fn from_ptr(ptr: *mut libc::pthread_mutex_t) -> Self {
        Self { ptr }
    }

    /// Construct the mutex in place with `PTHREAD_PROCESS_SHARED` and
    /// `PTHREAD_MUTEX_ROBUST`.  Only the creator of the segment calls this.
    pub fn init(&self) -> OsResult<()> {
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
            check("pthread_mutexattr_init", libc::pthread_mutexattr_init(&mut attr))?;

            let configured = check(
                "pthread_mutexattr_setpshared",
                libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED),
            )
            .and_then(|()| set_robust(&mut attr));

            let result = configured
                .and_then(|()| check("pthread_mutex_init", libc::pthread_mutex_init(self.ptr, &attr)));
            libc::pthread_mutexattr_destroy(&mut attr);
            result
        }
    }

    /// Blocking lock.
    pub fn lock(&self) -> OsResult<LockOutcome> {
        let eno = unsafe { libc::pthread_mutex_lock(self.ptr) };
        match eno {
            0 => Ok(LockOutcome::Acquired),
            #[cfg(not(target_os = "macos"))]
            EOWNERDEAD => Ok(LockOutcome::OwnerDied),
            _ => Err(OsFailure {
                op: "pthread_mutex_lock",
                errno: eno,
            }),
        }
    }

    /// Clear the inconsistent state left by a dead owner.
    pub fn make_consistent(&self) -> OsResult<()> {
        #[cfg(not(target_os = "macos"))]
        {
            check("pthread_mutex_consistent", unsafe { pthread_mutex_consistent(self.ptr) })
        }
        #[cfg(target_os = "macos")]
        {
            Ok(())
        }
    }

    pub fn unlock(&self) -> OsResult<()> {
        check("pthread_mutex_unlock", unsafe { libc::pthread_mutex_unlock(self.ptr) })
    }

    pub fn destroy(&self) -> OsResult<()> {
        check("pthread_mutex_destroy", unsafe { libc::pthread_mutex_destroy(self.ptr) })
    }
}

#[cfg(not(target_os = "macos"))]
unsafe fn set_robust(attr: *mut libc::pthread_mutexattr_t) -> OsResult<()> {
    check(
        "pthread_mutexattr_setrobust",
        pthread_mutexattr_setrobust(attr, PTHREAD_MUTEX_ROBUST),
    )
}

#[cfg(target_os = "macos")]
unsafe fn set_robust(_attr: *mut libc::pthread_mutexattr_t) -> OsResult<()> {
    Ok(())
}

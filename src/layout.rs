// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Binary layout of a named lock segment:
//
//   [ pthread_mutex_t ][ owner pid_t ][ init flag c_int ][ payload bytes ]
//
// The pid, flag and payload regions only exist when the payload length is
// non-zero.  The layout is packed exactly like this (no padding, no trailer)
// so that any process using the same ABI can share the segment.

use std::mem::{align_of, size_of};
use std::ptr;

use libc::{c_int, pid_t, pthread_mutex_t};

pub const MUTEX_SIZE: usize = size_of::<pthread_mutex_t>();

/// Owner pid and init flag, directly after the mutex.
#[repr(C)]
pub struct AuxHeader {
    pub owner_pid: pid_t,
    pub data_init: c_int,
}

pub const AUX_HEADER_SIZE: usize = size_of::<AuxHeader>();

const _: () = assert!(AUX_HEADER_SIZE == size_of::<pid_t>() + size_of::<c_int>());
const _: () = assert!(MUTEX_SIZE % align_of::<AuxHeader>() == 0);

/// Offsets of every region inside a segment, computed once per handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    payload_len: usize,
}

impl SegmentLayout {
    pub const fn new(payload_len: usize) -> Self {
        Self { payload_len }
    }

    pub const fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Whether the pid/flag/payload regions exist.
    pub const fn has_aux(&self) -> bool {
        self.payload_len > 0
    }

    pub const fn aux_offset(&self) -> usize {
        MUTEX_SIZE
    }

    pub const fn payload_offset(&self) -> usize {
        MUTEX_SIZE + AUX_HEADER_SIZE
    }

    /// Exact mapped size of the segment.
    pub const fn total_size(&self) -> usize {
        if self.has_aux() {
            MUTEX_SIZE + AUX_HEADER_SIZE + self.payload_len
        } else {
            MUTEX_SIZE
        }
    }
}

/// Total segment size for a given payload length.
pub const fn segment_size_for(payload_len: usize) -> usize {
    SegmentLayout::new(payload_len).total_size()
}

/// Typed pointers into one mapped segment.
///
/// Valid for as long as the mapping it was built from stays alive; the
/// owning [`NamedLock`](crate::NamedLock) guarantees that.
#[derive(Debug, Clone, Copy)]
pub struct SegmentView {
    pub mutex: *mut pthread_mutex_t,
    pub aux: Option<*mut AuxHeader>,
    pub payload: *mut u8,
    pub payload_len: usize,
}

impl SegmentView {
    /// # Safety
    /// `base` must point to a mapping of at least `layout.total_size()` bytes,
    /// aligned for `pthread_mutex_t` (any page-aligned mapping is).
    pub unsafe fn new(base: *mut u8, layout: SegmentLayout) -> Self {
        if layout.has_aux() {
            Self {
                mutex: base as *mut pthread_mutex_t,
                aux: Some(base.add(layout.aux_offset()) as *mut AuxHeader),
                payload: base.add(layout.payload_offset()),
                payload_len: layout.payload_len(),
            }
        } else {
            Self {
                mutex: base as *mut pthread_mutex_t,
                aux: None,
                payload: ptr::null_mut(),
                payload_len: 0,
            }
        }
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error type shared by the named lock and the bus guards.

use std::io;

/// Errors surfaced by [`NamedLock`](crate::NamedLock) and
/// [`BusGuard`](crate::BusGuard).
///
/// Owner death of a previous lock holder never shows up here: it is
/// recovered inside `acquire`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An OS-level failure while opening, sizing, mapping, locking or
    /// tearing down a shared segment.
    #[error("{op} failed for shared lock {name:?}: {source}")]
    Resource {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    /// The segment name cannot be used as a POSIX shared memory object name.
    #[error("invalid shared lock name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// An existing segment has a different size than this process expects.
    #[error("shared lock {name:?} has size {found}, expected {expected}")]
    LayoutMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    /// A payload buffer does not match the segment's payload length.
    #[error("payload length mismatch: expected {expected} bytes, got {found}")]
    PayloadLength { expected: usize, found: usize },

    /// A pid/flag/payload accessor was used on a lock-only segment.
    #[error("shared lock {name:?} has no payload region")]
    NoPayload { name: String },

    /// The calling thread already holds this bus.
    #[error("bus lock {name:?} is already held by the calling thread")]
    AlreadyHeld { name: String },
}

impl Error {
    pub(crate) fn resource(op: &'static str, name: &str, source: io::Error) -> Self {
        Error::Resource {
            op,
            name: name.to_string(),
            source,
        }
    }

    /// Build a resource error from a pthread-style return code.
    pub(crate) fn from_errno(op: &'static str, name: &str, eno: i32) -> Self {
        Self::resource(op, name, io::Error::from_raw_os_error(eno))
    }

    /// Build a resource error from the current `errno`.
    pub(crate) fn last_os(op: &'static str, name: &str) -> Self {
        Self::resource(op, name, io::Error::last_os_error())
    }

    /// The raw OS error code, if this is a resource error carrying one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Resource { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared memory object naming.
// Every cooperating process must derive the exact same object name, so
// normalisation is deliberately minimal: a leading '/' is added when missing
// and nothing else is rewritten.

use std::ffi::CString;

use crate::error::{Error, Result};

/// Longest accepted object name, including the leading '/'.
///
/// Linux allows `NAME_MAX` (255) bytes after the slash; macOS caps the whole
/// name at `PSHMNAMLEN` (31).
#[cfg(target_os = "macos")]
pub const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const SHM_NAME_MAX: usize = 256;

/// Produce the POSIX form of `name` (with a single leading '/').
pub fn make_shm_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

/// Validate `name` and return the C string passed to `shm_open`.
pub fn to_c_name(name: &str) -> Result<CString> {
    let invalid = |reason| Error::InvalidName {
        name: name.to_string(),
        reason,
    };

    let posix = make_shm_name(name);
    if posix.len() <= 1 {
        return Err(invalid("name is empty"));
    }
    if posix[1..].contains('/') {
        return Err(invalid("name may only contain a leading '/'"));
    }
    if posix.len() > SHM_NAME_MAX {
        return Err(invalid("name is too long"));
    }
    CString::new(posix).map_err(|_| invalid("name contains a NUL byte"))
}

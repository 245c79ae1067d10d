// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// RAII guard that holds a bus for the lifetime of the access.

use crate::bus::{BusGuard, BusKind};
use crate::error::Result;

/// Holds a bus from construction until drop (or [`release`](Self::release)).
///
/// Dropping the guard unlocks the bus, including the register cache
/// write-back for the stateful bus; errors on that path are discarded, use
/// `release` to observe them.
pub struct BusAccess<'a> {
    guard: &'a BusGuard,
    released: bool,
}

impl<'a> BusAccess<'a> {
    /// Lock `guard` and return the access token.
    pub fn new(guard: &'a BusGuard) -> Result<Self> {
        guard.lock()?;
        Ok(Self {
            guard,
            released: false,
        })
    }

    pub fn bus(&self) -> BusKind {
        self.guard.kind()
    }

    /// Unlock now and report the outcome.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.guard.unlock()
    }
}

impl<'a> Drop for BusAccess<'a> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.guard.unlock();
        }
    }
}

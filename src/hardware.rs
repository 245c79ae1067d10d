// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Seam to the hardware-access layer.  The bus guards never talk to a bus;
// they only move the expander's cached output registers between the
// hardware layer's node record and the lock payload.

use std::collections::HashMap;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use libc::c_uint;

/// Cached output latch registers of the GPIO expander, in payload order.
///
/// The expander's registers are write-only from the cache's point of view,
/// so the software copy is the only record of what the chip is driving.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterState {
    pub olat_a: c_uint,
    pub olat_b: c_uint,
}

impl RegisterState {
    /// Payload size of the stateful bus.
    pub const SIZE: usize = size_of::<RegisterState>();

    pub const fn new(olat_a: c_uint, olat_b: c_uint) -> Self {
        Self { olat_a, olat_b }
    }

    /// Native-endian encoding, matching the in-memory `repr(C)` layout.
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let word = size_of::<c_uint>();
        out[..word].copy_from_slice(&self.olat_a.to_ne_bytes());
        out[word..].copy_from_slice(&self.olat_b.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let word = size_of::<c_uint>();
        let mut a = [0u8; size_of::<c_uint>()];
        let mut b = [0u8; size_of::<c_uint>()];
        a.copy_from_slice(&bytes[..word]);
        b.copy_from_slice(&bytes[word..]);
        Self {
            olat_a: c_uint::from_ne_bytes(a),
            olat_b: c_uint::from_ne_bytes(b),
        }
    }
}

/// A hardware node record holding the live register cache.
pub trait RegisterCache: Send + Sync {
    fn load(&self) -> RegisterState;
    fn store(&self, state: RegisterState);
}

/// Lookup of hardware node records by their numeric handle (pin base).
pub trait HardwareLookup: Send + Sync {
    fn find_node(&self, handle: i32) -> Option<Arc<dyn RegisterCache>>;
}

/// In-memory register cache, standing in for a driver's node record.
#[derive(Debug, Default)]
pub struct MemoryNode {
    olat_a: AtomicU32,
    olat_b: AtomicU32,
}

impl MemoryNode {
    pub fn new(state: RegisterState) -> Self {
        Self {
            olat_a: AtomicU32::new(state.olat_a),
            olat_b: AtomicU32::new(state.olat_b),
        }
    }
}

impl RegisterCache for MemoryNode {
    fn load(&self) -> RegisterState {
        RegisterState {
            olat_a: self.olat_a.load(Ordering::Acquire),
            olat_b: self.olat_b.load(Ordering::Acquire),
        }
    }

    fn store(&self, state: RegisterState) {
        self.olat_a.store(state.olat_a, Ordering::Release);
        self.olat_b.store(state.olat_b, Ordering::Release);
    }
}

/// A registry of nodes keyed by handle.
///
/// Counts lookups so callers can observe how often the bus guard asked.
#[derive(Default)]
pub struct NodeTable {
    nodes: RwLock<HashMap<i32, Arc<dyn RegisterCache>>>,
    lookups: AtomicU32,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: i32, node: Arc<dyn RegisterCache>) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, node);
    }

    pub fn remove(&self, handle: i32) -> Option<Arc<dyn RegisterCache>> {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
    }

    /// Number of `find_node` calls so far.
    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl HardwareLookup for NodeTable {
    fn find_node(&self, handle: i32) -> Option<Arc<dyn RegisterCache>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
    }
}

/// Lookup that never finds anything, for processes without the expander.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHardware;

impl HardwareLookup for NoHardware {
    fn find_node(&self, _handle: i32) -> Option<Arc<dyn RegisterCache>> {
        None
    }
}

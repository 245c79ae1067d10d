// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Crash-safe named cross-process bus locks.
// A robust process-shared pthread mutex lives in a named POSIX shared memory
// segment; the I2C bus lock also carries the GPIO expander's register cache
// so that the next process to take the bus starts from the right state.

pub mod shm_name;

mod platform;

mod error;
pub use error::{Error, Result};

pub mod layout;
pub use layout::segment_size_for;

mod mutex;
pub use mutex::{NamedLock, DEFAULT_RECOVERY_DELAY};

pub mod hardware;
pub use hardware::{HardwareLookup, MemoryNode, NoHardware, NodeTable, RegisterCache, RegisterState};

mod bus;
pub use bus::{BusGuard, BusKind};

mod scoped_access;
pub use scoped_access::BusAccess;

mod context;
pub use context::{BusConfig, BusContext};

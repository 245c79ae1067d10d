// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-process context owning one guard per bus.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::bus::{BusGuard, BusKind};
use crate::hardware::HardwareLookup;
use crate::mutex::DEFAULT_RECOVERY_DELAY;

pub const DEFAULT_I2C_NAME: &str = "/i2c0";
pub const DEFAULT_SPI_NAME: &str = "/spi0";

/// Pin base under which the hardware layer registers the GPIO expander.
pub const DEFAULT_EXPANDER_PIN_BASE: i32 = 100;

pub const ENV_I2C_NAME: &str = "BUSLOCK_I2C_NAME";
pub const ENV_SPI_NAME: &str = "BUSLOCK_SPI_NAME";
pub const ENV_PIN_BASE: &str = "BUSLOCK_PIN_BASE";
pub const ENV_RECOVERY_MS: &str = "BUSLOCK_RECOVERY_MS";

/// Names and constants shared by every cooperating process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    pub i2c_name: String,
    pub spi_name: String,
    pub expander_pin_base: i32,
    pub recovery_delay: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            i2c_name: DEFAULT_I2C_NAME.to_string(),
            spi_name: DEFAULT_SPI_NAME.to_string(),
            expander_pin_base: DEFAULT_EXPANDER_PIN_BASE,
            recovery_delay: DEFAULT_RECOVERY_DELAY,
        }
    }
}

impl BusConfig {
    /// Defaults overridden by the `BUSLOCK_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(name) = var(ENV_I2C_NAME) {
            config.i2c_name = name;
        }
        if let Some(name) = var(ENV_SPI_NAME) {
            config.spi_name = name;
        }
        if let Some(raw) = var(ENV_PIN_BASE) {
            match raw.parse() {
                Ok(base) => config.expander_pin_base = base,
                Err(_) => warn!(var = ENV_PIN_BASE, value = %raw, "ignoring unparsable value"),
            }
        }
        if let Some(raw) = var(ENV_RECOVERY_MS) {
            match raw.parse() {
                Ok(ms) => config.recovery_delay = Duration::from_millis(ms),
                Err(_) => warn!(var = ENV_RECOVERY_MS, value = %raw, "ignoring unparsable value"),
            }
        }
        config
    }

    /// Defaults with bus names isolated under `prefix`.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            i2c_name: format!("/{prefix}_i2c0"),
            spi_name: format!("/{prefix}_spi0"),
            ..Self::default()
        }
    }

    pub fn name_of(&self, kind: BusKind) -> &str {
        match kind {
            BusKind::I2c => &self.i2c_name,
            BusKind::Spi => &self.spi_name,
        }
    }
}

/// The bus guards of one process.
///
/// Build it once and hand it to whatever performs bus I/O.  The I2C guard
/// carries the expander's register cache; the SPI guard is lock-only.
#[derive(Debug)]
pub struct BusContext {
    config: BusConfig,
    i2c: BusGuard,
    spi: BusGuard,
}

impl BusContext {
    pub fn new(config: BusConfig, lookup: Arc<dyn HardwareLookup>) -> Self {
        let i2c = BusGuard::stateful(BusKind::I2c, &config.i2c_name, lookup, config.expander_pin_base)
            .with_recovery_delay(config.recovery_delay);
        let spi = BusGuard::stateless(BusKind::Spi, &config.spi_name)
            .with_recovery_delay(config.recovery_delay);
        Self { config, i2c, spi }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn i2c(&self) -> &BusGuard {
        &self.i2c
    }

    pub fn spi(&self) -> &BusGuard {
        &self.spi
    }

    pub fn bus(&self, kind: BusKind) -> &BusGuard {
        match kind {
            BusKind::I2c => &self.i2c,
            BusKind::Spi => &self.spi,
        }
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage:
//   busctl write <olat_a> <olat_b>
//   busctl read
//   busctl hold <i2c|spi> <ms>
//   busctl crash <i2c|spi>
//   busctl reset
//
// Bus names and the expander pin base come from the BUSLOCK_* environment
// variables (see BusConfig::from_env).  The expander is simulated by an
// in-memory node, so `read` prints whatever register state was handed over
// by the previous owner of the I2C bus.  Logs go to stderr (RUST_LOG).

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use buslock::{BusConfig, BusContext, BusKind, MemoryNode, NamedLock, NodeTable, RegisterCache, RegisterState};
use tracing::info;
use tracing_subscriber::EnvFilter;

const EXIT_USAGE: i32 = 1;
const EXIT_LOCK: i32 = 2;
const EXIT_CRASH: i32 = 3;

fn usage() -> ! {
    eprintln!("usage: busctl write <olat_a> <olat_b>");
    eprintln!("       busctl read");
    eprintln!("       busctl hold <i2c|spi> <ms>");
    eprintln!("       busctl crash <i2c|spi>");
    eprintln!("       busctl reset");
    process::exit(EXIT_USAGE);
}

fn parse_bus(arg: Option<&String>) -> BusKind {
    match arg.map(String::as_str) {
        Some("i2c") => BusKind::I2c,
        Some("spi") => BusKind::Spi,
        _ => usage(),
    }
}

fn parse_num<T: std::str::FromStr>(arg: Option<&String>) -> T {
    arg.and_then(|s| s.parse().ok()).unwrap_or_else(|| usage())
}

fn run(ctx: &BusContext, node: &MemoryNode, args: &[String]) -> buslock::Result<()> {
    match args.first().map(String::as_str) {
        Some("write") => {
            let state = RegisterState::new(parse_num(args.get(1)), parse_num(args.get(2)));
            ctx.i2c().lock()?;
            node.store(state);
            info!(?state, "stored register state");
            ctx.i2c().unlock()
        }
        Some("read") => {
            ctx.i2c().lock()?;
            let state = node.load();
            println!("{} {}", state.olat_a, state.olat_b);
            ctx.i2c().unlock()
        }
        Some("hold") => {
            let bus = ctx.bus(parse_bus(args.get(1)));
            let ms: u64 = parse_num(args.get(2));
            let access = bus.access()?;
            info!(bus = %access.bus(), ms, "holding bus");
            println!("locked");
            thread::sleep(Duration::from_millis(ms));
            access.release()
        }
        Some("crash") => {
            let bus = ctx.bus(parse_bus(args.get(1)));
            bus.lock()?;
            info!(bus = %bus.kind(), "terminating while holding the bus");
            // No destructors, no unlock: the kernel marks the mutex owner dead.
            process::exit(EXIT_CRASH);
        }
        Some("reset") => {
            NamedLock::unlink(&ctx.config().i2c_name)?;
            NamedLock::unlink(&ctx.config().spi_name)
        }
        _ => usage(),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = BusConfig::from_env();

    let node = Arc::new(MemoryNode::default());
    let table = Arc::new(NodeTable::new());
    table.insert(config.expander_pin_base, node.clone());
    let ctx = BusContext::new(config, table);

    if let Err(e) = run(&ctx, &node, &args) {
        eprintln!("busctl: {e}");
        process::exit(EXIT_LOCK);
    }
}

//! # machine_manager
//!
//! Command-line configuration: parses the daemon's `--device`/`-d` options
//! into strongly typed, validated device configs. Everything else the real
//! hypervisor's machine manager owns (zone lifecycle, image loading, the
//! outer CLI) is out of scope here — see the top-level spec's Non-goals.

pub mod config;

pub use config::{BlkDeviceConfig, DeviceConfig, NetworkInterfaceConfig, VmConfig};

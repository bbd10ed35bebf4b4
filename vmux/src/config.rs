//! Process configuration. CLI parsing via `clap` derive; a handful of
//! options are additionally loadable from a `serde`/`toml` config file
//! for values impractical to pass as flags (per-VM CPU pin sets).

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use derive_builder::Builder;
use serde::Deserialize;

use crate::interrupts::ThrottlerKind;
use vmux_transport::PciIdentity;

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThrottlerVariant {
    None,
    Accurate,
    Qemu,
    Simbricks,
}

impl From<ThrottlerVariant> for ThrottlerKind {
    fn from(variant: ThrottlerVariant) -> Self {
        match variant {
            ThrottlerVariant::None => ThrottlerKind::None,
            ThrottlerVariant::Accurate => ThrottlerKind::Accurate,
            ThrottlerVariant::Qemu => ThrottlerKind::QemuLike,
            ThrottlerVariant::Simbricks => ThrottlerKind::Simbricks,
        }
    }
}

/// `vmux`: a userspace PCI device multiplexer.
#[derive(Parser, Clone, Debug)]
#[command(name = "vmux", version, about)]
pub struct Cli {
    /// PCI address of a physical device to present to guests. Repeatable.
    #[arg(short = 'd', long = "device", value_name = "PCI-ADDRESS")]
    pub devices: Vec<String>,

    /// Base path for the per-VM guest transport sockets.
    #[arg(short = 's', long = "socket", default_value = "/tmp/vmux.sock")]
    pub socket: PathBuf,

    /// Interrupt throttler variant.
    #[arg(long, value_enum, default_value = "accurate")]
    pub throttler: ThrottlerVariant,

    /// Enable zero-copy TX (attach guest buffers directly instead of
    /// copying into a backend-owned mbuf).
    #[arg(long)]
    pub tx_zero_copy: bool,

    /// Emit per-packet debug logging (very chatty; off by default).
    #[arg(long)]
    pub debug_output: bool,

    /// Maximum packets per TX/RX burst.
    #[arg(long, default_value_t = 128)]
    pub burst_size: usize,

    /// Interval, in seconds, at which the global interrupt-rate
    /// statistics collector recomputes per-queue spacing.
    #[arg(long, default_value_t = 1)]
    pub stats_interval_secs: u64,

    /// Caps the number of distinct MAC->vm-id switch rules accepted.
    #[arg(long, default_value_t = 4096)]
    pub max_switch_rules: usize,

    /// Comma-separated list of CPU indices to pin per-VM worker threads
    /// to, in device order; shorter than the device list means the
    /// remaining devices are left unpinned.
    #[arg(long, value_delimiter = ',')]
    pub cpu_pin: Vec<usize>,

    /// Optional TOML file providing defaults for any of the above
    /// (CLI flags still take precedence where both are given).
    #[arg(long)]
    pub config_file: Option<PathBuf>,
}

/// Resolved configuration, after merging a config file (if any) under
/// whatever the CLI explicitly set.
#[derive(Clone, Debug)]
pub struct Config {
    pub devices: Vec<String>,
    pub socket: PathBuf,
    pub throttler: ThrottlerVariant,
    pub tx_zero_copy: bool,
    pub debug_output: bool,
    pub burst_size: usize,
    pub stats_interval_secs: u64,
    pub max_switch_rules: usize,
    pub cpu_pin: Vec<usize>,
}

/// The subset of [`Config`] a TOML file may override. Every field is
/// optional: only keys present in the file are applied.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub devices: Option<Vec<String>>,
    pub socket: Option<PathBuf>,
    pub throttler: Option<ThrottlerVariant>,
    pub tx_zero_copy: Option<bool>,
    pub debug_output: Option<bool>,
    pub burst_size: Option<usize>,
    pub stats_interval_secs: Option<u64>,
    pub max_switch_rules: Option<usize>,
    pub cpu_pin: Option<Vec<usize>>,
}

impl Config {
    pub fn from_cli(cli: Cli) -> crate::Result<Self> {
        let file = match &cli.config_file {
            Some(path) => Some(load_config_file(path)?),
            None => None,
        };

        let mut config = Config {
            devices: cli.devices,
            socket: cli.socket,
            throttler: cli.throttler,
            tx_zero_copy: cli.tx_zero_copy,
            debug_output: cli.debug_output,
            burst_size: cli.burst_size,
            stats_interval_secs: cli.stats_interval_secs,
            max_switch_rules: cli.max_switch_rules,
            cpu_pin: cli.cpu_pin,
        };

        if let Some(file) = file {
            if config.devices.is_empty() {
                if let Some(devices) = file.devices {
                    config.devices = devices;
                }
            }
            if let Some(cpu_pin) = file.cpu_pin {
                if config.cpu_pin.is_empty() {
                    config.cpu_pin = cpu_pin;
                }
            }
        }

        if config.devices.is_empty() {
            return Err(crate::VmuxError::ConfigInconsistency(
                "at least one -d/--device must be given".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Everything `main` needs to bring up one VM's endpoint, assembled from
/// [`Config`] plus per-device identity that only the device itself knows
/// (vDPDK's fixed PCI ids vs. a passthrough device's discovered ones).
/// Grounded in the `DeviceConfiguration`/`#[derive(Builder)]`
/// pattern in `libvfio-user`'s `lib.rs`: optional fields get a default,
/// required ones (`pci_identity`, `socket`) must be set before `build()`.
#[derive(Builder, Clone, Debug)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct DeviceSetup {
    pub pci_identity: PciIdentity,
    pub socket: PathBuf,

    #[builder(default = "ThrottlerKind::Accurate")]
    pub throttler: ThrottlerKind,

    #[builder(default = "false")]
    pub tx_zero_copy: bool,

    #[builder(default = "128")]
    pub burst_size: usize,

    #[builder(default)]
    pub cpu_pin: Option<usize>,

    #[builder(default = "false")]
    pub add_standard_caps: bool,
}

impl DeviceSetupBuilder {
    fn validate(&self) -> Result<(), String> {
        if matches!(&self.socket, Some(path) if path.as_os_str().is_empty()) {
            return Err("socket path must not be empty".to_string());
        }
        Ok(())
    }
}

fn load_config_file(path: &std::path::Path) -> crate::Result<ConfigFile> {
    let text = std::fs::read_to_string(path)?;
    toml::from_str(&text)
        .map_err(|err| crate::VmuxError::ConfigInconsistency(format!("{}: {err}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_cli_rejects_an_empty_device_list() {
        let cli = Cli {
            devices: vec![],
            socket: PathBuf::from("/tmp/vmux.sock"),
            throttler: ThrottlerVariant::Accurate,
            tx_zero_copy: false,
            debug_output: false,
            burst_size: 128,
            stats_interval_secs: 1,
            max_switch_rules: 4096,
            cpu_pin: vec![],
            config_file: None,
        };
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn from_cli_accepts_a_populated_device_list() {
        let cli = Cli {
            devices: vec!["0000:01:00.0".to_string()],
            socket: PathBuf::from("/tmp/vmux.sock"),
            throttler: ThrottlerVariant::Qemu,
            tx_zero_copy: true,
            debug_output: false,
            burst_size: 64,
            stats_interval_secs: 2,
            max_switch_rules: 16,
            cpu_pin: vec![0, 1],
            config_file: None,
        };
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.devices, vec!["0000:01:00.0".to_string()]);
        assert_eq!(config.cpu_pin, vec![0, 1]);
    }

    #[test]
    fn device_setup_builder_fills_in_defaults() {
        let identity = PciIdentity {
            vendor_id: 0x1af4,
            device_id: 0x7abc,
            subsystem_vendor_id: 0,
            subsystem_id: 0,
            class_base: 2,
            class_subclass: 0,
            class_prog_if: 0,
            revision_id: 1,
        };
        let setup = DeviceSetupBuilder::default()
            .pci_identity(identity)
            .socket(PathBuf::from("/tmp/vmux_0.sock"))
            .build()
            .unwrap();
        assert_eq!(setup.throttler, ThrottlerKind::Accurate);
        assert_eq!(setup.burst_size, 128);
        assert!(!setup.tx_zero_copy);
    }

    #[test]
    fn device_setup_builder_rejects_an_empty_socket_path() {
        let identity = PciIdentity {
            vendor_id: 0x1af4,
            device_id: 0x7abc,
            subsystem_vendor_id: 0,
            subsystem_id: 0,
            class_base: 2,
            class_subclass: 0,
            class_prog_if: 0,
            revision_id: 1,
        };
        let result = DeviceSetupBuilder::default()
            .pci_identity(identity)
            .socket(PathBuf::new())
            .build();
        assert!(result.is_err());
    }
}

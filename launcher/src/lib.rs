// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Launches a QEMU/KVM guest as a legacy BIOS VM, an EFI VM or a TDX trust
//! domain.
//!
//! [`prepare`] checks the host in a fixed order and turns a [`LaunchConfig`]
//! into a [`LaunchPlan`]; [`QemuCommand::from_plan`] renders the plan into a
//! hypervisor command line and [`launch::run`] executes it.

#[macro_use]
extern crate log;

pub mod config;
pub mod console;
pub mod firmware;
pub mod host;
pub mod launch;
pub mod qemu;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::result;

use thiserror::Error;

pub use crate::config::{BootType, ConsoleMode, DiskFormat, HostPaths, LaunchConfig, VmType};
use crate::firmware::Firmware;
pub use crate::qemu::QemuCommand;

/// Errors associated with preparing a launch.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid launch configuration")]
    Config(#[source] config::Error),
    #[error("Firmware is not usable")]
    Firmware(#[source] firmware::Error),
    #[error("Error resolving path {0:?}")]
    Canonicalize(PathBuf, #[source] io::Error),
    #[error("Error naming the console log")]
    ConsoleLog(#[source] io::Error),
}

pub type Result<T> = result::Result<T, Error>;

/// A validated configuration with every host path resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct LaunchPlan {
    pub config: LaunchConfig,
    pub image: PathBuf,
    pub format: DiskFormat,
    pub firmware: Firmware,
    /// Only set for direct boot.
    pub kernel: Option<PathBuf>,
    /// Only set for the HVC console.
    pub console_log: Option<PathBuf>,
    pub pin_tsc: bool,
}

impl LaunchPlan {
    pub fn command(&self) -> QemuCommand {
        QemuCommand::from_plan(self)
    }

    pub fn summary(&self) -> Summary<'_> {
        Summary(self)
    }
}

/// Human readable banner printed before the guest starts.
pub struct Summary<'a>(&'a LaunchPlan);

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let plan = self.0;
        let config = &plan.config;
        let rule = "=========================================";

        writeln!(f, "{rule}")?;
        writeln!(f, "Guest Image       : {}", plan.image.display())?;
        match &plan.kernel {
            Some(kernel) => writeln!(f, "Kernel binary     : {}", kernel.display())?,
            None => writeln!(f, "Kernel binary     : (from guest image)")?,
        }
        match &plan.firmware {
            Firmware::LegacyBios(bios) => writeln!(f, "BIOS              : {}", bios.display())?,
            Firmware::Ovmf { code, vars } => {
                writeln!(f, "OVMF_CODE         : {}", code.display())?;
                writeln!(f, "OVMF_VARS         : {}", vars.display())?;
            }
        }
        writeln!(f, "VM Type           : {}", config.vm_type)?;
        writeln!(f, "CPUS              : {}", config.cpus)?;
        writeln!(f, "Memory            : {}", config.memory)?;
        writeln!(f, "Boot type         : {}", config.boot)?;
        writeln!(f, "Monitor port      : {}", config.monitor_port)?;
        writeln!(f, "SSH forward port  : {}", config.forward_port)?;
        writeln!(f, "Enable vsock      : {}", config.vsock)?;
        writeln!(f, "Enable debug      : {}", config.debug)?;
        if let Some(mac) = &config.mac {
            writeln!(f, "MAC Address       : {mac}")?;
        }
        writeln!(f, "Console           : {}", config.console)?;
        if let Some(log) = &plan.console_log {
            writeln!(f, "Console log       : {}", log.display())?;
        }
        write!(f, "{rule}")
    }
}

fn canonicalize(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).map_err(|e| Error::Canonicalize(path.to_owned(), e))
}

/// Checks the host preconditions, in order, and resolves every path the
/// hypervisor will be given. Creates the per-VM firmware vars file if needed.
pub fn prepare(config: LaunchConfig) -> Result<LaunchPlan> {
    if !config.host.qemu.is_file() {
        return Err(Error::Config(config::Error::HypervisorMissing(
            config.host.qemu.clone(),
        )));
    }

    config.validate().map_err(Error::Config)?;

    if !config.image.is_file() {
        return Err(Error::Config(config::Error::GuestImageMissing(
            config.image.clone(),
        )));
    }
    let format = DiskFormat::from_path(&config.image)
        .ok_or_else(|| Error::Config(config::Error::UnknownImageFormat(config.image.clone())))?;
    let image = canonicalize(&config.image)?;

    let firmware = Firmware::resolve(&config).map_err(Error::Firmware)?;

    let kernel = match config.boot {
        BootType::Direct => {
            if !config.kernel.is_file() {
                return Err(Error::Config(config::Error::KernelMissing(
                    config.kernel.clone(),
                )));
            }
            Some(canonicalize(&config.kernel)?)
        }
        BootType::Grub => {
            if config.console == ConsoleMode::Hvc {
                warn!("Using HVC console for grub, could not accept key input in grub menu");
            }
            None
        }
    };

    if let Some(mac) = &config.mac {
        if mac.is_multicast() {
            warn!("MAC address {mac} is a multicast address, the NIC may refuse it");
        }
    }

    let console_log = match config.console {
        ConsoleMode::Hvc => {
            let stamp = console::local_timestamp().map_err(Error::ConsoleLog)?;
            Some(console::console_log_path(&config.workdir, &stamp))
        }
        ConsoleMode::Serial => None,
    };

    let pin_tsc = config.vm_type == VmType::Td && host::needs_tsc_pin();

    Ok(LaunchPlan {
        config,
        image,
        format,
        firmware,
        kernel,
        console_log,
        pin_tsc,
    })
}

// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::result;
use std::str::FromStr;

use net_util::MacAddr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_QEMU_PATH: &str = "/usr/libexec/qemu-kvm";
pub const DEFAULT_LEGACY_BIOS: &str = "/usr/share/qemu/bios.bin";
pub const DEFAULT_OVMF_CODE: &str = "/usr/share/qemu/OVMF_CODE.fd";
pub const DEFAULT_OVMF_VARS_TEMPLATE: &str = "/usr/share/qemu/OVMF_VARS.fd";

pub const DEFAULT_GUEST_IMAGE: &str = "td-guest.qcow2";
pub const DEFAULT_KERNEL: &str = "vmlinuz";
pub const DEFAULT_VCPUS: u32 = 1;
pub const DEFAULT_MEMORY: &str = "2G";
pub const DEFAULT_MONITOR_PORT: u16 = 9001;
pub const DEFAULT_FORWARD_PORT: u16 = 10026;
pub const DEFAULT_ROOT_PARTITION: &str = "/dev/vda1";

/// Errors associated with launch configuration parameters.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Hypervisor binary {0:?} does not exist, please install a TDX capable QEMU")]
    HypervisorMissing(PathBuf),
    #[error("Invalid number of CPUs: {0}")]
    InvalidCpus(u32),
    #[error("Invalid memory size {0:?}, expected <number>[K|M|G|T]")]
    InvalidMemory(String),
    #[error("Port for {0} must not be zero")]
    ZeroPort(&'static str),
    #[error("Monitor and SSH forward ports are both {0}")]
    PortClash(u16),
    #[error("Guest image file {0:?} does not exist, please specify it via \"-i\"")]
    GuestImageMissing(PathBuf),
    #[error("Unknown disk image format for {0:?}, expected a .qcow2, .img or .raw file")]
    UnknownImageFormat(PathBuf),
    #[error("Kernel image file {0:?} does not exist, please specify it via \"-k\"")]
    KernelMissing(PathBuf),
    #[error("Error reading host configuration {0:?}")]
    ReadHostConfig(PathBuf, #[source] io::Error),
    #[error("Error parsing host configuration {0:?}")]
    ParseHostConfig(PathBuf, #[source] serde_json::Error),
    #[error("Unknown {kind} {value:?}, must be one of [{}]", .expected.join("|"))]
    UnknownVariant {
        kind: &'static str,
        value: String,
        expected: &'static [&'static str],
    },
}

pub type Result<T> = result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VmType {
    /// Non-confidential guest on SeaBIOS.
    Legacy,
    /// Non-confidential guest on OVMF.
    Efi,
    /// TDX trust domain on OVMF.
    #[default]
    Td,
}

impl VmType {
    pub const NAMES: &'static [&'static str] = &["legacy", "efi", "td"];

    pub fn uses_ovmf(&self) -> bool {
        matches!(self, VmType::Efi | VmType::Td)
    }
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            VmType::Legacy => "legacy",
            VmType::Efi => "efi",
            VmType::Td => "td",
        };
        f.write_str(s)
    }
}

impl FromStr for VmType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "legacy" => Ok(VmType::Legacy),
            "efi" => Ok(VmType::Efi),
            "td" => Ok(VmType::Td),
            _ => Err(Error::UnknownVariant {
                kind: "VM type",
                value: s.to_owned(),
                expected: Self::NAMES,
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BootType {
    /// Kernel and command line handed to QEMU with -kernel/-append.
    #[default]
    Direct,
    /// The guest firmware runs shim and grub from the image.
    Grub,
}

impl BootType {
    pub const NAMES: &'static [&'static str] = &["direct", "grub"];
}

impl fmt::Display for BootType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            BootType::Direct => "direct",
            BootType::Grub => "grub",
        })
    }
}

impl FromStr for BootType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "direct" => Ok(BootType::Direct),
            "grub" => Ok(BootType::Grub),
            _ => Err(Error::UnknownVariant {
                kind: "boot type",
                value: s.to_owned(),
                expected: Self::NAMES,
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConsoleMode {
    /// virtio console multiplexed with the monitor on stdio, logged to a file.
    #[default]
    Hvc,
    /// Plain serial port on stdio, needed to drive the grub menu.
    Serial,
}

impl ConsoleMode {
    /// Device name the guest kernel should print to.
    pub fn kernel_console(&self) -> &'static str {
        match self {
            ConsoleMode::Hvc => "hvc0",
            ConsoleMode::Serial => "ttyS0",
        }
    }
}

impl fmt::Display for ConsoleMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ConsoleMode::Hvc => "HVC",
            ConsoleMode::Serial => "Serial",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskFormat {
    Qcow2,
    Raw,
}

impl DiskFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "qcow2" => Some(DiskFormat::Qcow2),
            "img" | "raw" => Some(DiskFormat::Raw),
            _ => None,
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        })
    }
}

/// Fixed locations of the hypervisor and firmware on the host.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostPaths {
    pub qemu: PathBuf,
    pub legacy_bios: PathBuf,
    pub ovmf_code: PathBuf,
    pub ovmf_vars_template: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        HostPaths {
            qemu: PathBuf::from(DEFAULT_QEMU_PATH),
            legacy_bios: PathBuf::from(DEFAULT_LEGACY_BIOS),
            ovmf_code: PathBuf::from(DEFAULT_OVMF_CODE),
            ovmf_vars_template: PathBuf::from(DEFAULT_OVMF_VARS_TEMPLATE),
        }
    }
}

impl HostPaths {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).map_err(|e| Error::ReadHostConfig(path.to_owned(), e))?;
        serde_json::from_str(&content).map_err(|e| Error::ParseHostConfig(path.to_owned(), e))
    }
}

/// Accepts the subset of QEMU's size syntax that makes sense for guest RAM.
pub fn parse_memory_size(s: &str) -> Result<String> {
    let digits = s.trim_end_matches(['K', 'M', 'G', 'T', 'k', 'm', 'g', 't']);
    let suffix_len = s.len() - digits.len();
    let valid = suffix_len <= 1
        && !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit())
        && digits.parse::<u64>().is_ok_and(|n| n > 0);
    if !valid {
        return Err(Error::InvalidMemory(s.to_owned()));
    }

    Ok(s.to_owned())
}

#[derive(Clone, Debug, PartialEq)]
pub struct LaunchConfig {
    pub host: HostPaths,
    pub workdir: PathBuf,
    pub image: PathBuf,
    pub kernel: PathBuf,
    pub vm_type: VmType,
    pub boot: BootType,
    pub cpus: u32,
    pub memory: String,
    pub monitor_port: u16,
    pub forward_port: u16,
    pub ovmf_code: PathBuf,
    pub ovmf_vars: PathBuf,
    pub mac: Option<MacAddr>,
    pub root_partition: String,
    pub extra_cmdline: Option<String>,
    pub vsock: bool,
    pub debug: bool,
    pub console: ConsoleMode,
    /// Check and report only; nothing is written to the working directory.
    pub dry_run: bool,
}

impl LaunchConfig {
    /// Defaults for a TD guest whose image and kernel sit in `workdir`.
    pub fn new(host: HostPaths, workdir: PathBuf) -> Self {
        LaunchConfig {
            image: workdir.join(DEFAULT_GUEST_IMAGE),
            kernel: workdir.join(DEFAULT_KERNEL),
            ovmf_code: host.ovmf_code.clone(),
            ovmf_vars: host.ovmf_vars_template.clone(),
            host,
            workdir,
            vm_type: VmType::default(),
            boot: BootType::default(),
            cpus: DEFAULT_VCPUS,
            memory: DEFAULT_MEMORY.to_owned(),
            monitor_port: DEFAULT_MONITOR_PORT,
            forward_port: DEFAULT_FORWARD_PORT,
            mac: None,
            root_partition: DEFAULT_ROOT_PARTITION.to_owned(),
            extra_cmdline: None,
            vsock: false,
            debug: false,
            console: ConsoleMode::default(),
            dry_run: false,
        }
    }

    /// Checks that do not touch the filesystem.
    pub fn validate(&self) -> Result<()> {
        if self.cpus == 0 {
            return Err(Error::InvalidCpus(self.cpus));
        }
        parse_memory_size(&self.memory)?;
        if self.monitor_port == 0 {
            return Err(Error::ZeroPort("monitor"));
        }
        if self.forward_port == 0 {
            return Err(Error::ZeroPort("SSH forwarding"));
        }
        if self.monitor_port == self.forward_port {
            return Err(Error::PortClash(self.monitor_port));
        }

        Ok(())
    }

    /// Kernel command line used for direct boot.
    pub fn kernel_cmdline(&self) -> String {
        let mut cmdline = format!(
            "root={} rw console={}",
            self.root_partition,
            self.console.kernel_console()
        );
        if let Some(extra) = self.extra_cmdline.as_deref().map(str::trim) {
            if !extra.is_empty() {
                cmdline.push(' ');
                cmdline.push_str(extra);
            }
        }
        cmdline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LaunchConfig {
        LaunchConfig::new(HostPaths::default(), PathBuf::from("/work"))
    }

    #[test]
    fn test_defaults() {
        let c = config();
        assert_eq!(c.image, PathBuf::from("/work/td-guest.qcow2"));
        assert_eq!(c.kernel, PathBuf::from("/work/vmlinuz"));
        assert_eq!(c.ovmf_vars, PathBuf::from(DEFAULT_OVMF_VARS_TEMPLATE));
        assert_eq!(c.vm_type, VmType::Td);
        assert_eq!(c.boot, BootType::Direct);
        assert_eq!(c.console, ConsoleMode::Hvc);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_vm_type_parsing() {
        assert_eq!("legacy".parse::<VmType>().unwrap(), VmType::Legacy);
        assert_eq!("efi".parse::<VmType>().unwrap(), VmType::Efi);
        assert_eq!("td".parse::<VmType>().unwrap(), VmType::Td);
        let err = "tdx".parse::<VmType>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown VM type \"tdx\", must be one of [legacy|efi|td]"
        );
        for name in VmType::NAMES {
            assert_eq!(name.parse::<VmType>().unwrap().to_string(), *name);
        }
        assert!(!VmType::Legacy.uses_ovmf());
        assert!(VmType::Td.uses_ovmf());
    }

    #[test]
    fn test_boot_type_parsing() {
        assert_eq!("grub".parse::<BootType>().unwrap(), BootType::Grub);
        assert!("pxe".parse::<BootType>().is_err());
    }

    #[test]
    fn test_disk_format() {
        assert_eq!(
            DiskFormat::from_path(Path::new("/a/td-guest.qcow2")),
            Some(DiskFormat::Qcow2)
        );
        assert_eq!(
            DiskFormat::from_path(Path::new("guest.img")),
            Some(DiskFormat::Raw)
        );
        assert_eq!(DiskFormat::from_path(Path::new("guest.vmdk")), None);
        assert_eq!(DiskFormat::from_path(Path::new("guest")), None);
    }

    #[test]
    fn test_memory_size() {
        assert!(parse_memory_size("2G").is_ok());
        assert!(parse_memory_size("4096").is_ok());
        assert!(parse_memory_size("512m").is_ok());
        assert!(parse_memory_size("0G").is_err());
        assert!(parse_memory_size("G").is_err());
        assert!(parse_memory_size("2GG").is_err());
        assert!(parse_memory_size("2 G").is_err());
        assert!(parse_memory_size("").is_err());
    }

    #[test]
    fn test_validate() {
        let mut c = config();
        c.cpus = 0;
        assert!(matches!(c.validate(), Err(Error::InvalidCpus(0))));

        let mut c = config();
        c.monitor_port = 0;
        assert!(matches!(c.validate(), Err(Error::ZeroPort("monitor"))));

        let mut c = config();
        c.forward_port = c.monitor_port;
        assert!(matches!(c.validate(), Err(Error::PortClash(9001))));

        let mut c = config();
        c.memory = "lots".to_owned();
        assert!(matches!(c.validate(), Err(Error::InvalidMemory(_))));
    }

    #[test]
    fn test_kernel_cmdline() {
        let mut c = config();
        assert_eq!(c.kernel_cmdline(), "root=/dev/vda1 rw console=hvc0");

        c.console = ConsoleMode::Serial;
        c.root_partition = "/dev/vda3".to_owned();
        c.extra_cmdline = Some(" tdx_debug  ".to_owned());
        assert_eq!(
            c.kernel_cmdline(),
            "root=/dev/vda3 rw console=ttyS0 tdx_debug"
        );

        c.extra_cmdline = Some(String::new());
        assert_eq!(c.kernel_cmdline(), "root=/dev/vda3 rw console=ttyS0");
    }

    #[test]
    fn test_host_paths_from_file() {
        let dir = vmm_sys_util::tempdir::TempDir::new().unwrap();
        let path = dir.as_path().join("host.json");

        fs::write(&path, r#"{"qemu": "/opt/qemu/bin/qemu-system-x86_64"}"#).unwrap();
        let host = HostPaths::from_file(&path).unwrap();
        assert_eq!(host.qemu, PathBuf::from("/opt/qemu/bin/qemu-system-x86_64"));
        assert_eq!(host.legacy_bios, PathBuf::from(DEFAULT_LEGACY_BIOS));

        fs::write(&path, r#"{"qemu_binary": "/usr/bin/qemu"}"#).unwrap();
        assert!(matches!(
            HostPaths::from_file(&path),
            Err(Error::ParseHostConfig(..))
        ));

        assert!(matches!(
            HostPaths::from_file(&dir.as_path().join("missing.json")),
            Err(Error::ReadHostConfig(..))
        ));
    }
}

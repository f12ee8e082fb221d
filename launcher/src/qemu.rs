// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! QEMU command line assembly.
//!
//! The argument order only depends on the [`LaunchPlan`], so the same
//! options always produce the same command line.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::{ConsoleMode, VmType};
use crate::firmware::Firmware;
use crate::host::MIN_TSC_HZ;
use crate::LaunchPlan;

pub const NETDEV_ID: &str = "mynet0";
pub const VSOCK_GUEST_CID: u32 = 3;
pub const GUEST_SSH_PORT: u16 = 22;

/// QEMU splits option values on ',' and reads ",," as a literal comma.
pub fn escape_commas<S: AsRef<str>>(value: S) -> String {
    value.as_ref().replace(',', ",,")
}

fn path_value(path: &Path) -> String {
    escape_commas(path.display().to_string())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QemuCommand {
    binary: PathBuf,
    args: Vec<String>,
}

impl QemuCommand {
    pub fn new<P: Into<PathBuf>>(binary: P) -> Self {
        QemuCommand {
            binary: binary.into(),
            args: Vec::new(),
        }
    }

    pub fn arg<S: Into<String>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Value following the first occurrence of `option`.
    pub fn value_of<'a>(&'a self, option: &'a str) -> Option<&'a str> {
        self.values_of(option).next()
    }

    pub fn values_of<'a>(&'a self, option: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.args
            .windows(2)
            .filter(move |w| w[0] == option)
            .map(|w| w[1].as_str())
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(self.args.iter().map(OsStr::new));
        command
    }

    pub fn from_plan(plan: &LaunchPlan) -> Self {
        let config = &plan.config;
        let mut cmd = QemuCommand::new(&config.host.qemu);

        cmd.args(["-accel", "kvm"])
            .args(["-name", "process=tdxvm,debug-threads=on"])
            .args(["-smp".to_owned(), config.cpus.to_string()])
            .args(["-m", config.memory.as_str()])
            .args(["-vga", "none"])
            .args(["-no-hpet", "-nodefaults"]);

        cmd.arg("-drive").arg(format!(
            "file={},if=virtio,format={}",
            path_value(&plan.image),
            plan.format
        ));
        cmd.arg("-monitor").arg(format!(
            "telnet:127.0.0.1:{},server,nowait",
            config.monitor_port
        ));

        match &plan.firmware {
            Firmware::LegacyBios(bios) => {
                cmd.arg("-bios").arg(bios.display().to_string());
            }
            Firmware::Ovmf { code, vars } => {
                cmd.arg("-drive").arg(format!(
                    "if=pflash,format=raw,unit=0,readonly=on,file={}",
                    path_value(code)
                ));
                cmd.arg("-drive").arg(format!(
                    "if=pflash,format=raw,unit=1,file={}",
                    path_value(vars)
                ));
            }
        }

        if let Some(kernel) = &plan.kernel {
            cmd.arg("-kernel").arg(kernel.display().to_string());
            cmd.arg("-append").arg(config.kernel_cmdline());
        }

        if config.vm_type == VmType::Td {
            let mut object = "tdx-guest,id=tdx".to_owned();
            if config.debug {
                object.push_str(",debug=on");
            }
            cmd.arg("-object").arg(object);
        }

        if config.debug {
            // gdb stub on tcp::1234, vCPUs held until the debugger continues.
            cmd.args(["-s", "-S"]);
        }

        if config.vsock {
            cmd.arg("-device").arg(format!("vhost-vsock-pci,guest-cid={VSOCK_GUEST_CID}"));
        }

        match config.console {
            ConsoleMode::Hvc => {
                let mut chardev = "stdio,id=mux,mux=on".to_owned();
                if let Some(log) = &plan.console_log {
                    chardev.push_str(&format!(",logfile={}", path_value(log)));
                }
                cmd.arg("-chardev").arg(chardev);
                cmd.args(["-device", "virtio-serial,romfile="])
                    .args(["-device", "virtconsole,chardev=mux"])
                    .args(["-monitor", "chardev:mux"])
                    .args(["-serial", "chardev:mux"])
                    .arg("-nographic");
            }
            ConsoleMode::Serial => {
                cmd.args(["-serial", "stdio"]);
            }
        }

        let mut nic = format!("virtio-net-pci,netdev={NETDEV_ID}");
        if let Some(mac) = &config.mac {
            nic.push_str(&format!(",mac={mac}"));
        }
        cmd.arg("-device").arg(nic);
        cmd.arg("-netdev").arg(format!(
            "user,id={NETDEV_ID},hostfwd=tcp::{}-:{GUEST_SSH_PORT}",
            config.forward_port
        ));

        let mut cpu = "host,-kvm-steal-time,pmu=off".to_owned();
        if plan.pin_tsc {
            cpu.push_str(&format!(",tsc-freq={MIN_TSC_HZ}"));
        }
        cmd.arg("-cpu").arg(cpu);

        let mut machine = "q35".to_owned();
        if config.vm_type == VmType::Td {
            machine.push_str(",kvm-type=tdx,kernel_irqchip=split,confidential-guest-support=tdx");
        }
        cmd.arg("-machine").arg(machine);

        if config.vm_type == VmType::Td {
            // A TD cannot be reset in place.
            cmd.arg("-no-reboot");
        }

        cmd
    }
}

impl fmt::Display for QemuCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.binary.display())?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) || arg.contains('"') {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

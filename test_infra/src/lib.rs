// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Fixtures for driving the launcher binary against a fake host.

use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};
use std::{fs, io, thread};

use serde_json::json;
use thiserror::Error;
use vmm_sys_util::tempdir::TempDir;
use wait_timeout::ChildExt;

pub const DEFAULT_LAUNCHER_TIMEOUT: u64 = 30;

#[derive(Error, Debug)]
pub enum WaitTimeoutError {
    #[error("timeout")]
    Timedout,
    #[error("general failure")]
    General(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("spawning process failed")]
    Spawn(#[source] std::io::Error),
    #[error("waiting for timeout failed")]
    WaitTimeout(#[source] WaitTimeoutError),
    #[error("collecting process output failed")]
    Output(#[source] std::io::Error),
}

// Records its arguments one per line, then either becomes a sleeper for
// $FAKE_QEMU_SLEEP seconds or exits with $FAKE_QEMU_EXIT.
const FAKE_QEMU_SCRIPT: &str = "#!/bin/sh
printf '%s\\n' \"$@\" > \"$FAKE_QEMU_ARGS\"
if [ -n \"$FAKE_QEMU_SLEEP\" ]; then
    exec sleep \"$FAKE_QEMU_SLEEP\"
fi
exit \"${FAKE_QEMU_EXIT:-0}\"
";

/// A throwaway directory laid out like a TDX capable host: a fake
/// hypervisor, firmware blobs, a guest image and kernel, and a host
/// configuration pointing at all of them.
pub struct FakeHost {
    pub tmp_dir: TempDir,
    pub workdir: PathBuf,
    pub qemu: PathBuf,
    pub legacy_bios: PathBuf,
    pub ovmf_code: PathBuf,
    pub ovmf_vars_template: PathBuf,
    pub host_config: PathBuf,
    pub args_log: PathBuf,
}

impl FakeHost {
    pub fn new() -> Self {
        let tmp_dir = TempDir::new_with_prefix("/tmp/tdl").unwrap();
        let root = tmp_dir.as_path().to_owned();
        let firmware_dir = root.join("firmware");
        let workdir = root.join("work");
        fs::create_dir(&firmware_dir).unwrap();
        fs::create_dir(&workdir).unwrap();

        let qemu = root.join("qemu-kvm");
        fs::write(&qemu, FAKE_QEMU_SCRIPT).unwrap();
        fs::set_permissions(&qemu, fs::Permissions::from_mode(0o755)).unwrap();

        let legacy_bios = firmware_dir.join("bios.bin");
        let ovmf_code = firmware_dir.join("OVMF_CODE.fd");
        let ovmf_vars_template = firmware_dir.join("OVMF_VARS.fd");
        fs::write(&legacy_bios, b"bios").unwrap();
        fs::write(&ovmf_code, b"code").unwrap();
        fs::write(&ovmf_vars_template, b"vars template").unwrap();

        fs::write(workdir.join("td-guest.qcow2"), b"QFI\xfb").unwrap();
        fs::write(workdir.join("vmlinuz"), b"kernel").unwrap();

        let host_config = root.join("host.json");
        let content = json!({
            "qemu": qemu,
            "legacy_bios": legacy_bios,
            "ovmf_code": ovmf_code,
            "ovmf_vars_template": ovmf_vars_template,
        });
        fs::write(&host_config, content.to_string()).unwrap();

        FakeHost {
            args_log: root.join("qemu.args"),
            tmp_dir,
            workdir,
            qemu,
            legacy_bios,
            ovmf_code,
            ovmf_vars_template,
            host_config,
        }
    }

    /// Arguments the fake hypervisor was started with, if it ran at all.
    pub fn recorded_args(&self) -> Option<Vec<String>> {
        match fs::read_to_string(&self.args_log) {
            Ok(content) => Some(content.lines().map(str::to_owned).collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => panic!("reading {:?} failed: {e}", self.args_log),
        }
    }

    /// The launcher command, pointed at this host and its working directory.
    pub fn launcher(&self, binary: &str) -> LauncherCommand {
        let mut command = Command::new(binary);
        command
            .arg("--workdir")
            .arg(&self.workdir)
            .arg("--host-config")
            .arg(&self.host_config)
            .env("FAKE_QEMU_ARGS", &self.args_log)
            .env_remove("RUST_LOG");

        LauncherCommand {
            command,
            timeout: DEFAULT_LAUNCHER_TIMEOUT,
        }
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LauncherCommand {
    command: Command,
    timeout: u64,
}

impl LauncherCommand {
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(&mut self, key: K, val: V) -> &mut Self {
        self.command.env(key, val);
        self
    }

    /// Exit code the fake hypervisor reports.
    pub fn qemu_exit_code(&mut self, code: i32) -> &mut Self {
        self.env("FAKE_QEMU_EXIT", code.to_string())
    }

    /// Keeps the fake hypervisor running for `secs` seconds.
    pub fn qemu_sleep(&mut self, secs: u64) -> &mut Self {
        self.env("FAKE_QEMU_SLEEP", secs.to_string())
    }

    pub fn timeout(&mut self, timeout: u64) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Starts the launcher detached from the terminal.
    pub fn spawn(&mut self) -> Result<RunningLauncher, Error> {
        let child = self
            .command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Error::Spawn)?;

        Ok(RunningLauncher {
            child,
            timeout: self.timeout,
        })
    }

    /// Runs the launcher to completion and collects its output.
    pub fn run(&mut self) -> Result<Output, Error> {
        self.spawn()?.output()
    }
}

pub struct RunningLauncher {
    child: Child,
    timeout: u64,
}

impl RunningLauncher {
    fn signal(&self, signal: i32) -> io::Result<()> {
        // SAFETY: kill(2) on the pid of a child we have not reaped yet.
        let ret = unsafe { libc::kill(self.child.id() as libc::pid_t, signal) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn terminate(&self) -> io::Result<()> {
        self.signal(libc::SIGTERM)
    }

    /// Waits for the launcher to exit, killing it after the timeout.
    pub fn output(mut self) -> Result<Output, Error> {
        match self.child.wait_timeout(Duration::from_secs(self.timeout)) {
            Err(e) => return Err(Error::WaitTimeout(WaitTimeoutError::General(e))),
            Ok(None) => {
                let _ = self.child.kill();
                let _ = self.child.wait();
                return Err(Error::WaitTimeout(WaitTimeoutError::Timedout));
            }
            Ok(Some(_)) => {}
        }

        self.child.wait_with_output().map_err(Error::Output)
    }
}

/// Polls until `path` exists or `timeout` runs out.
pub fn wait_for_file(path: &Path, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if path.exists() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    path.exists()
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// Value following `flag` in a recorded argument list.
pub fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use std::result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::SigId;
use thiserror::Error;
use wait_timeout::ChildExt;

use crate::console::{InterruptKeyGuard, INTERRUPT_KEY};
use crate::qemu::QemuCommand;

const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum Error {
    #[error("Error spawning hypervisor {0:?}")]
    Spawn(PathBuf, #[source] io::Error),
    #[error("Error waiting for the hypervisor to exit")]
    Wait(#[source] io::Error),
    #[error("Error registering signal handler")]
    Signal(#[source] io::Error),
    #[error("Error remapping the terminal interrupt key")]
    Terminal(#[source] vmm_sys_util::errno::Error),
}

pub type Result<T> = result::Result<T, Error>;

/// Keeps SIGINT/SIGTERM from killing the launcher while the guest runs, so
/// the terminal always gets restored. The last caught signal is parked in
/// `pending` until the wait loop hands it to the hypervisor.
struct SignalTrap {
    ids: Vec<SigId>,
    pending: Arc<AtomicUsize>,
}

impl SignalTrap {
    fn install() -> Result<Self> {
        let pending = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::new();
        for signal in [SIGINT, SIGTERM] {
            let id = signal_hook::flag::register_usize(signal, pending.clone(), signal as usize)
                .map_err(Error::Signal)?;
            ids.push(id);
        }
        Ok(SignalTrap { ids, pending })
    }
}

impl Drop for SignalTrap {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Waits for `child`, relaying any signal that shows up in `pending`.
fn wait_forwarding(child: &mut Child, pending: &AtomicUsize) -> Result<ExitStatus> {
    loop {
        let signal = pending.swap(0, Ordering::SeqCst);
        if signal != 0 {
            info!("Forwarding signal {signal} to the hypervisor");
            // SAFETY: kill(2) on the pid of a child we have not reaped yet.
            let ret = unsafe { libc::kill(child.id() as libc::pid_t, signal as libc::c_int) };
            if ret != 0 {
                warn!("Error forwarding signal {signal}: {}", io::Error::last_os_error());
            }
        }

        if let Some(status) = child.wait_timeout(SIGNAL_POLL_INTERVAL).map_err(Error::Wait)? {
            return Ok(status);
        }
    }
}

/// Runs the hypervisor in the foreground with inherited stdio until it exits.
pub fn run(command: &QemuCommand) -> Result<ExitStatus> {
    let trap = SignalTrap::install()?;
    let interrupt = InterruptKeyGuard::remap(libc::STDIN_FILENO, INTERRUPT_KEY)
        .map_err(Error::Terminal)?;
    if interrupt.is_some() {
        println!("Remapping CTRL-C to CTRL-]");
    }

    info!("Spawning {:?}", command.binary());
    let mut child = command
        .to_command()
        .spawn()
        .map_err(|e| Error::Spawn(command.binary().to_owned(), e))?;

    let status = wait_forwarding(&mut child, &trap.pending)?;
    info!("Hypervisor exited with {status}");

    Ok(status)
}

/// Shell convention: the child's code, or 128 + signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGKILL)), 137);
    }

    #[test]
    fn test_run_reports_child_status() {
        let mut cmd = QemuCommand::new("/bin/sh");
        cmd.args(["-c", "exit 7"]);
        let status = run(&cmd).unwrap();
        assert_eq!(exit_code(status), 7);
    }

    #[test]
    fn test_pending_signal_reaches_child() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "exec sleep 10"])
            .spawn()
            .unwrap();
        let pending = AtomicUsize::new(SIGTERM as usize);

        let start = std::time::Instant::now();
        let status = wait_forwarding(&mut child, &pending).unwrap();
        assert_eq!(exit_code(status), 128 + SIGTERM);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(pending.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_run_missing_binary() {
        let cmd = QemuCommand::new("/nonexistent/qemu-kvm");
        assert!(matches!(run(&cmd), Err(Error::Spawn(..))));
    }
}

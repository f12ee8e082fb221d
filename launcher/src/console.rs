// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

use std::io;
use std::mem::zeroed;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use libc::{isatty, tcgetattr, tcsetattr, termios, TCSANOW, VINTR};

/// Ctrl-]. Ctrl-C goes to the guest while the hypervisor owns the terminal.
pub const INTERRUPT_KEY: libc::cc_t = 0x1d;

const LOG_TIMESTAMP_FORMAT: &std::ffi::CStr = c"%FT%H%M";

/// Formats `t` in local time as `YYYY-MM-DDTHHMM`.
pub fn format_timestamp(t: libc::time_t) -> io::Result<String> {
    // SAFETY: tm is plain data and gets totally overwritten by localtime_r,
    // whose result we check.
    let mut tm: libc::tm = unsafe { zeroed() };
    // SAFETY: both pointers are valid for the duration of the call.
    if unsafe { libc::localtime_r(&t, &mut tm) }.is_null() {
        return Err(io::Error::last_os_error());
    }

    let mut buf = [0u8; 32];
    // SAFETY: buf outlives the call and its length is passed along, the
    // format string is NUL terminated and tm was initialized above.
    let len = unsafe {
        libc::strftime(
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            LOG_TIMESTAMP_FORMAT.as_ptr(),
            &tm,
        )
    };
    if len == 0 {
        return Err(io::Error::other("strftime produced an empty timestamp"));
    }

    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}

pub fn local_timestamp() -> io::Result<String> {
    // SAFETY: time(NULL) only reads the clock.
    let now = unsafe { libc::time(std::ptr::null_mut()) };
    format_timestamp(now)
}

/// Where the HVC console output of a guest started at `stamp` is logged.
pub fn console_log_path(workdir: &Path, stamp: &str) -> PathBuf {
    workdir.join(format!("vm_log_{stamp}.log"))
}

/// Swaps the terminal interrupt character and puts the original one back
/// when dropped.
pub struct InterruptKeyGuard {
    fd: RawFd,
    original: termios,
}

impl InterruptKeyGuard {
    /// Returns `None` when `fd` is not a terminal.
    pub fn remap(fd: RawFd, key: libc::cc_t) -> vmm_sys_util::errno::Result<Option<Self>> {
        // SAFETY: safe because we check the return value of isatty.
        if unsafe { isatty(fd) } != 1 {
            return Ok(None);
        }

        // SAFETY: The following pair are safe because termios gets totally overwritten by tcgetattr
        // and we check the return result.
        let mut termios: termios = unsafe { zeroed() };
        // SAFETY: see above
        let ret = unsafe { tcgetattr(fd, &mut termios as *mut _) };
        if ret < 0 {
            return vmm_sys_util::errno::errno_result();
        }
        let original = termios;

        termios.c_cc[VINTR] = key;
        // SAFETY: Safe because the syscall will only read the extent of termios and we check
        // the return result.
        let ret = unsafe { tcsetattr(fd, TCSANOW, &termios as *const _) };
        if ret < 0 {
            return vmm_sys_util::errno::errno_result();
        }
        debug!(
            "Remapped interrupt key from {:#x} to {key:#x}",
            original.c_cc[VINTR]
        );

        Ok(Some(InterruptKeyGuard { fd, original }))
    }
}

impl Drop for InterruptKeyGuard {
    fn drop(&mut self) {
        // SAFETY: original was filled in by tcgetattr on the same fd.
        let ret = unsafe { tcsetattr(self.fd, TCSANOW, &self.original as *const _) };
        if ret < 0 {
            warn!(
                "Error restoring terminal interrupt key: {}",
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn test_timestamp_shape() {
        let stamp = local_timestamp().unwrap();
        assert_eq!(stamp.len(), 15, "{stamp}");
        for (i, c) in stamp.chars().enumerate() {
            match i {
                4 | 7 => assert_eq!(c, '-', "{stamp}"),
                10 => assert_eq!(c, 'T', "{stamp}"),
                _ => assert!(c.is_ascii_digit(), "{stamp}"),
            }
        }
    }

    #[test]
    fn test_console_log_path() {
        assert_eq!(
            console_log_path(Path::new("/var/lib/vms"), "2024-03-01T0915"),
            PathBuf::from("/var/lib/vms/vm_log_2024-03-01T0915.log")
        );
    }

    #[test]
    fn test_remap_skips_non_tty() {
        let f = File::open("/dev/null").unwrap();
        assert!(InterruptKeyGuard::remap(f.as_raw_fd(), INTERRUPT_KEY)
            .unwrap()
            .is_none());
    }
}

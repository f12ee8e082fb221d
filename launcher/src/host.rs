// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host CPU probing.
//!
//! A TD guest's TSC follows the host frequency QEMU sees. When the host
//! reports less than [`MIN_CPU_MHZ`] the guest TSC is pinned at [`MIN_TSC_HZ`].

use std::fs;
use std::io;

pub const CPUINFO_PATH: &str = "/proc/cpuinfo";

/// Frequency below which the guest TSC is pinned.
pub const MIN_CPU_MHZ: f64 = 1000.0;
pub const MIN_TSC_HZ: u64 = 1_000_000_000;

/// Returns the first `cpu MHz` value found in cpuinfo formatted text.
pub fn cpu_mhz_from(cpuinfo: &str) -> Option<f64> {
    cpuinfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != "cpu MHz" {
            return None;
        }
        value.trim().parse().ok()
    })
}

pub fn cpu_mhz() -> io::Result<Option<f64>> {
    Ok(cpu_mhz_from(&fs::read_to_string(CPUINFO_PATH)?))
}

/// Whether a guest on this host needs its TSC frequency pinned.
pub fn needs_tsc_pin() -> bool {
    match cpu_mhz() {
        Ok(Some(mhz)) => {
            debug!("Host CPU frequency is {mhz} MHz");
            mhz < MIN_CPU_MHZ
        }
        Ok(None) => {
            debug!("No CPU frequency in {CPUINFO_PATH}");
            false
        }
        Err(e) => {
            warn!("Error reading {CPUINFO_PATH}: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_mhz_from() {
        let cpuinfo = "processor\t: 0\n\
                       vendor_id\t: GenuineIntel\n\
                       model name\t: Intel(R) Xeon(R) Platinum 8480+\n\
                       cpu MHz\t\t: 800.003\n\
                       cache size\t: 107520 KB\n\
                       \n\
                       processor\t: 1\n\
                       cpu MHz\t\t: 3800.000\n";
        assert_eq!(cpu_mhz_from(cpuinfo), Some(800.003));
    }

    #[test]
    fn test_cpu_mhz_missing() {
        // aarch64 and some VMs omit the field.
        assert_eq!(cpu_mhz_from("processor\t: 0\nBogoMIPS\t: 50.00\n"), None);
        assert_eq!(cpu_mhz_from("cpu MHz\t\t: unknown\n"), None);
        assert_eq!(cpu_mhz_from(""), None);
    }
}

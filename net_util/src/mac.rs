// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

use std::fmt;
use std::result::Result;
use std::str::FromStr;

use thiserror::Error;

pub const MAC_ADDR_LEN: usize = 6;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MacAddrParseError {
    #[error("expected {MAC_ADDR_LEN} colon-separated octets in {0:?}")]
    OctetCount(String),
    #[error("octet {1:?} of {0:?} is not two hexadecimal digits")]
    InvalidOctet(String, String),
}

/// A guest NIC hardware address in the `aa:bb:cc:dd:ee:ff` form QEMU accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacAddr {
    bytes: [u8; MAC_ADDR_LEN],
}

impl MacAddr {
    pub fn parse_str<S>(s: &S) -> Result<MacAddr, MacAddrParseError>
    where
        S: AsRef<str> + ?Sized,
    {
        let s = s.as_ref();
        let v: Vec<&str> = s.split(':').collect();
        if v.len() != MAC_ADDR_LEN {
            return Err(MacAddrParseError::OctetCount(s.to_owned()));
        }

        let mut bytes = [0u8; MAC_ADDR_LEN];
        for (byte, octet) in bytes.iter_mut().zip(v) {
            // from_str_radix tolerates a leading '+', so check the digits first.
            if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(MacAddrParseError::InvalidOctet(
                    s.to_owned(),
                    octet.to_owned(),
                ));
            }
            *byte = u8::from_str_radix(octet, 16).map_err(|_| {
                MacAddrParseError::InvalidOctet(s.to_owned(), octet.to_owned())
            })?;
        }

        Ok(MacAddr { bytes })
    }

    /// Group addresses are refused by the virtio-net device model.
    pub fn is_multicast(&self) -> bool {
        self.bytes[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = MacAddrParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        MacAddr::parse_str(s)
    }
}

// Copyright (C) 2019-2020  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Parsing of the response to the IDENTIFY DEVICE command.
//!
//! The response is made of 256 16-bits words. The PIO transfer stores each word in big-endian
//! order, which means that the strings can be read directly from the buffer.

use blockstore_core::Error;

use alloc::string::String;
use core::fmt;

const WORD_CAPABILITIES: usize = 49;
const WORD_QUEUE_DEPTH: usize = 75;
const WORD_SATA_CAPABILITIES: usize = 76;
const WORD_MAJOR_VERSION: usize = 80;
const WORD_MINOR_VERSION: usize = 81;
const WORD_COMMAND_SETS: usize = 82;
const WORD_SECTORS: usize = 100;
const WORD_SECTOR_FLAGS: usize = 106;
const WORD_WWN: usize = 108;
const WORD_LOGICAL_SECTOR_SIZE: usize = 117;
const WORD_NV_CACHE_CAPABILITIES: usize = 214;
const WORD_NV_CACHE_SIZE: usize = 215;
const WORD_ROTATION_RATE: usize = 217;

const VALID_MASK: u16 = 3 << 14;
const VALID: u16 = 1 << 14;

const CAP_DMA: u16 = 1 << 8;
const CAP_LBA: u16 = 1 << 9;
const FEAT1_ADDR48: u16 = 1 << 10;
const FEAT2_WWN64: u16 = 1 << 8;

const SECTORS_LARGE_LOGICAL: u16 = 1 << 12;

const SATA_CAP_GEN1: u16 = 1 << 1;
const SATA_CAP_GEN2: u16 = 1 << 2;
const SATA_CAP_NCQ: u16 = 1 << 8;

/// Information about a device, as reported by IDENTIFY DEVICE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub model: String,
    pub serial: String,
    pub firmware: String,
    /// Number of logical sectors.
    pub sectors: u64,
    /// Size in bytes of a logical sector.
    pub sector_size: u32,
    /// Number of commands that can be queued at the same time.
    pub queue_depth: u8,
    pub major_version: u16,
    pub minor_version: u16,
    /// Words 82 to 87: supported then enabled command sets. Words whose validity marker is
    /// wrong are zeroed.
    pub command_sets: [u16; 6],
    pub sector_flags: u16,
    /// World-wide name, or 0 if not supported.
    pub wwn: u64,
    pub sata_capabilities: u16,
    pub nv_cache_capabilities: u16,
    pub nv_cache_blocks: u32,
    /// 0 if unknown, 1 for a non-rotating device, otherwise the rotation rate in rpm.
    pub rpm: u16,
}

impl Identity {
    /// Parses the 512 bytes returned by the device.
    pub fn parse(buf: &[u8; 512]) -> Result<Self, Error> {
        let checksum = buf.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
        if checksum != 0 {
            log::warn!("invalid checksum in identify response");
            return Err(Error::ProtocolError);
        }

        let word = |n: usize| u16::from_be_bytes([buf[n * 2], buf[n * 2 + 1]]);
        let valid = |w: u16| if w & VALID_MASK == VALID { w } else { 0 };

        let capabilities = word(WORD_CAPABILITIES);
        if capabilities & CAP_DMA == 0 || capabilities & CAP_LBA == 0 {
            log::warn!("device doesn't support DMA or LBA");
            return Err(Error::Unsupported);
        }

        let mut command_sets = [0; 6];
        for (n, set) in command_sets.iter_mut().enumerate() {
            *set = word(WORD_COMMAND_SETS + n);
        }
        command_sets[1] = valid(command_sets[1]);
        command_sets[2] = valid(command_sets[2]);
        command_sets[5] = valid(command_sets[5]);

        if command_sets[4] & FEAT1_ADDR48 == 0 {
            log::warn!("device doesn't have 48-bits addressing enabled");
            return Err(Error::Unsupported);
        }

        let sector_flags = valid(word(WORD_SECTOR_FLAGS));
        let sector_size = if sector_flags & SECTORS_LARGE_LOGICAL != 0 {
            // Expressed in 16-bits words.
            2 * (u32::from(word(WORD_LOGICAL_SECTOR_SIZE)) << 16
                | u32::from(word(WORD_LOGICAL_SECTOR_SIZE + 1)))
        } else {
            512
        };

        let wwn = if command_sets[2] & FEAT2_WWN64 != 0 && command_sets[5] & FEAT2_WWN64 != 0 {
            (0..4).fold(0u64, |acc, n| acc << 16 | u64::from(word(WORD_WWN + n)))
        } else {
            0
        };

        let sata_capabilities = match word(WORD_SATA_CAPABILITIES) {
            0xffff => 0,
            w => w,
        };

        // Values in the reserved range are reported as unknown.
        let rpm = match word(WORD_ROTATION_RATE) {
            2..=0x3ff | 0xffff => 0,
            w => w,
        };

        Ok(Identity {
            model: string(&buf[27 * 2..][..40]),
            serial: string(&buf[10 * 2..][..20]),
            firmware: string(&buf[23 * 2..][..8]),
            sectors: (0..3).fold(0u64, |acc, n| acc | u64::from(word(WORD_SECTORS + n)) << (16 * n)),
            sector_size,
            queue_depth: 1 + (word(WORD_QUEUE_DEPTH) & 0x1f) as u8,
            major_version: word(WORD_MAJOR_VERSION),
            minor_version: word(WORD_MINOR_VERSION),
            command_sets,
            sector_flags,
            wwn,
            sata_capabilities,
            nv_cache_capabilities: word(WORD_NV_CACHE_CAPABILITIES),
            nv_cache_blocks: u32::from(word(WORD_NV_CACHE_SIZE)) << 16
                | u32::from(word(WORD_NV_CACHE_SIZE + 1)),
            rpm,
        })
    }

    /// Total size of the device in bytes.
    pub fn size(&self) -> u64 {
        self.sectors * u64::from(self.sector_size)
    }

    /// Returns true if the device supports native command queuing.
    pub fn supports_ncq(&self) -> bool {
        self.sata_capabilities & SATA_CAP_NCQ != 0
    }

    /// Returns the fastest link speed supported by the device, in tenths of Gb/s.
    pub fn link_speed(&self) -> Option<u32> {
        if self.sata_capabilities & SATA_CAP_GEN2 != 0 {
            Some(30)
        } else if self.sata_capabilities & SATA_CAP_GEN1 != 0 {
            Some(15)
        } else {
            None
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}, serial {}, firmware {}, {} sectors",
            self.model, self.serial, self.firmware, self.sectors
        )
    }
}

/// Decodes a string field, stripping the padding.
fn string(raw: &[u8]) -> String {
    let raw = match raw.iter().position(|b| *b == 0) {
        Some(end) => &raw[..end],
        None => raw,
    };
    String::from_utf8_lossy(raw).trim_matches(' ').into()
}

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

//! Entries of the request ring, the response ring, and of the PRD tables.
//!
//! All the structures are made of little-endian 32-bits words.

use crate::registers::{ATA_CMD_READ_FPDMA, ATA_CMD_WRITE_FPDMA, ATA_DEV_LBA};

use smallvec::SmallVec;

/// Number of entries in the request ring and in the response ring. Also the maximum number
/// of tags.
pub const RING_LEN: usize = 32;
/// Size in bytes of an entry of the request ring.
pub const REQUEST_SIZE: usize = 32;
/// Size in bytes of an entry of the response ring.
pub const RESPONSE_SIZE: usize = 8;
/// Size in bytes of an entry of a PRD table.
pub const PRD_SIZE: usize = 16;
/// Maximum number of bytes described by one PRD entry.
pub const PRD_SEGMENT_LEN: usize = 64 * 1024;
/// Maximum number of entries of a PRD table, and therefore of one request.
pub const MAX_PRDS: usize = 8;
/// Maximum number of bytes transferred by one request.
pub const MAX_TRANSFER_LEN: usize = MAX_PRDS * PRD_SEGMENT_LEN;
/// Requests of at most this many sectors point directly to their buffer.
pub const MAX_DIRECT_SECTORS: u32 = 128;

const REQ_DEVICE_TO_MEMORY: u32 = 1 << 0;
const REQ_DEVICE_TAG_SHIFT: u32 = 1;
const REQ_PRD_SINGLE: u32 = 1 << 16;
const REQ_HOST_TAG_SHIFT: u32 = 17;

const PRD_END_OF_TABLE: u32 = 1 << 31;

/// Where the data of a request is found.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataLocation {
    /// The buffer itself, for requests of at most [`MAX_DIRECT_SECTORS`] sectors.
    Direct(u64),
    /// A PRD table built with [`encode_prds`].
    Table(u64),
}

/// Description of a queued read or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub tag: u8,
    pub write: bool,
    pub lba: u64,
    pub sectors: u32,
    /// Number of bytes to transfer.
    pub len: usize,
    pub data: DataLocation,
}

impl Request {
    /// Returns the content of the entry of the request ring.
    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let tag = u32::from(self.tag);

        let (prd_lo, mut ctl, count) = match self.data {
            // A count of 0 means 64kiB.
            DataLocation::Direct(address) => {
                (address as u32, REQ_PRD_SINGLE, self.len as u32 & 0xffff)
            }
            DataLocation::Table(address) => (address as u32, 0, 0),
        };
        if !self.write {
            ctl |= REQ_DEVICE_TO_MEMORY;
        }
        ctl |= tag << REQ_DEVICE_TAG_SHIFT;
        ctl |= tag << REQ_HOST_TAG_SHIFT;

        let cmd = if self.write {
            ATA_CMD_WRITE_FPDMA
        } else {
            ATA_CMD_READ_FPDMA
        };
        let lba_lo = (self.lba & 0xff_ffff) as u32;
        let lba_hi = ((self.lba >> 24) & 0xff_ffff) as u32;
        let sectors_lo = self.sectors & 0xff;
        let sectors_hi = (self.sectors >> 8) & 0xff;

        // For FPDMA commands, the sector count goes in the features register and the tag in
        // the sector count register.
        let words = [
            prd_lo,
            0,
            ctl,
            count,
            u32::from(cmd) << 16 | sectors_lo << 24,
            lba_lo | u32::from(ATA_DEV_LBA) << 24,
            lba_hi | sectors_hi << 24,
            tag << 3,
        ];

        let mut out = [0; REQUEST_SIZE];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}

/// Builds the PRD table describing `len` bytes starting at `address`.
///
/// # Panic
///
/// Panics if `len` is 0 or above [`MAX_TRANSFER_LEN`].
pub fn encode_prds(address: u64, len: usize) -> SmallVec<[[u8; PRD_SIZE]; MAX_PRDS]> {
    assert!(len != 0 && len <= MAX_TRANSFER_LEN);

    let mut out = SmallVec::new();
    let mut offset = 0;
    while offset < len {
        let n = (len - offset).min(PRD_SEGMENT_LEN);
        let mut flag_count = n as u32 & 0xffff;
        if offset + n == len {
            flag_count |= PRD_END_OF_TABLE;
        }

        let mut entry = [0; PRD_SIZE];
        entry[0..4].copy_from_slice(&((address + offset as u64) as u32).to_le_bytes());
        entry[4..8].copy_from_slice(&flag_count.to_le_bytes());
        out.push(entry);
        offset += n;
    }
    out
}

/// Extracts the tag from an entry of the response ring.
pub fn response_tag(entry: &[u8; RESPONSE_SIZE]) -> u8 {
    (u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]) & 0x1f) as u8
}

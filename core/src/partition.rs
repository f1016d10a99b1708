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

//! Slicing of a disk into partitions.
//!
//! Partition 0 always covers the entire disk and is created before any partition table is
//! read. The other partitions come from the partition table found on the disk, if any.
//!
//! This module doesn't perform any I/O. It is the responsibility of the caller to read the
//! partition table and to commit the newly-built list together with a version bump.

use crate::Error;

use alloc::{
    format,
    string::{String, ToString as _},
};
use smallvec::SmallVec;

/// List of partitions of a disk. Index `i` of the list is partition `i`.
pub type PartitionTable = SmallVec<[Partition; 5]>;

/// Default owner of partition 0.
pub const DEFAULT_OWNER: &str = "eve";
/// Default permission bits of partition 0.
pub const DEFAULT_PERM: u32 = 0o660;

/// Size of a sector, as used in MBR partition tables.
const MBR_SECTOR_SIZE: u64 = 512;
/// Offset of the first partition entry within the MBR.
const MBR_ENTRIES_OFFSET: usize = 446;
/// Size of one partition entry within the MBR.
const MBR_ENTRY_SIZE: usize = 16;
/// Number of partition entries in the MBR.
const MBR_NUM_ENTRIES: usize = 4;

/// Region of a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Index within its disk.
    pub index: usize,
    /// Type code found in the partition table. 0 for the whole-disk partition.
    pub typ: u8,
    /// Name of the partition.
    pub name: String,
    /// Disk-relative offset, in bytes, of the first byte of the partition.
    pub start: u64,
    /// Disk-relative offset, in bytes, right after the last byte of the partition.
    pub end: u64,
    /// Owning principal.
    pub owner: String,
    /// Permission bits.
    pub perm: u32,
    /// True if a handle to this partition is currently open. Never set for partition 0.
    pub(crate) is_open: bool,
}

impl Partition {
    /// Returns the size of the partition in bytes.
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Returns true if a handle to this partition is currently open.
    pub fn is_open(&self) -> bool {
        self.is_open
    }
}

/// Builds the partition that covers the whole disk.
pub fn whole_disk(size: u64) -> Partition {
    Partition {
        index: 0,
        typ: 0,
        name: "data".to_string(),
        start: 0,
        end: size,
        owner: DEFAULT_OWNER.to_string(),
        perm: DEFAULT_PERM,
        is_open: false,
    }
}

/// Returns a table containing only the whole-disk partition.
///
/// Used whenever no partition table can be parsed.
pub fn build_default(size: u64) -> PartitionTable {
    let mut table = PartitionTable::new();
    table.push(whole_disk(size));
    table
}

/// Parses a classic MBR partition table found at the beginning of a disk of `size` bytes.
///
/// Returns the full table, including the whole-disk partition at index 0. Empty entries are
/// skipped. Extended partitions are reported as regular partitions; their content isn't
/// followed.
pub fn build_from_table(size: u64, raw: &[u8]) -> Result<PartitionTable, Error> {
    if raw.len() < 512 {
        return Err(Error::ProtocolError);
    }
    if raw[510] != 0x55 || raw[511] != 0xaa {
        return Err(Error::ProtocolError);
    }

    let mut table = build_default(size);

    for slot in 0..MBR_NUM_ENTRIES {
        let entry = &raw[MBR_ENTRIES_OFFSET + slot * MBR_ENTRY_SIZE..][..MBR_ENTRY_SIZE];

        let typ = entry[4];
        if typ == 0 {
            continue;
        }

        let lba = u64::from(u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]));
        let sectors = u64::from(u32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]]));
        if sectors == 0 {
            continue;
        }

        let start = lba * MBR_SECTOR_SIZE;
        let end = start + sectors * MBR_SECTOR_SIZE;
        if end > size {
            log::warn!(
                "partition entry {} ({}..{}) goes past the end of the disk ({})",
                slot + 1,
                start,
                end,
                size
            );
            return Err(Error::ProtocolError);
        }

        table.push(Partition {
            index: table.len(),
            typ,
            name: format!("p{}", slot + 1),
            start,
            end,
            owner: DEFAULT_OWNER.to_string(),
            perm: DEFAULT_PERM,
            is_open: false,
        });
    }

    Ok(table)
}

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

use crate::{partition, Error};

use alloc::{string::String, vec::Vec};
use futures::future::{self, BoxFuture, FutureExt as _};

/// Direction and buffer of a transfer passed to [`Backend::io`].
#[derive(Debug)]
pub enum Io<'a> {
    /// Read from the device into the buffer.
    Read(&'a mut [u8]),
    /// Write the content of the buffer to the device.
    Write(&'a [u8]),
}

impl<'a> Io<'a> {
    /// Returns the number of bytes to transfer.
    pub fn len(&self) -> usize {
        match self {
            Io::Read(buf) => buf.len(),
            Io::Write(buf) => buf.len(),
        }
    }

    /// Returns true for [`Io::Write`].
    pub fn is_write(&self) -> bool {
        matches!(self, Io::Write(_))
    }
}

/// Information about a device, as found by [`Backend::devinit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    /// Total size of the device in bytes.
    pub size: u64,
    /// Writes must have `offset & align_mask == 0` and `len & align_mask == 0`.
    pub align_mask: u64,
    /// Human-readable description of the device.
    pub descr: String,
}

/// Capabilities of a controller driver, as seen by a [`Disk`](crate::Disk).
///
/// The methods returning a future might be called concurrently from multiple tasks, with the
/// exception of `init` and `devinit` which are never called concurrently with each other or
/// with `io` on the same disk.
pub trait Backend: Send + Sync {
    /// Short name of the kind of device, such as `sata` or `sdcard`.
    fn devtype(&self) -> &str;

    /// Initializes the controller. Called once before the first `devinit`, and again by
    /// [`Registry::init_all`](crate::Registry::init_all) for disks that aren't ready.
    fn init(&self) -> BoxFuture<Result<(), Error>>;

    /// Probes the device attached to the controller and returns its geometry.
    fn devinit(&self) -> BoxFuture<Result<Geometry, Error>>;

    /// Transfers data between the device and `io`, starting at the given device-absolute
    /// offset.
    ///
    /// The offset and length are guaranteed to satisfy the alignment mask returned by
    /// `devinit`. Might transfer less than requested; returns the number of bytes
    /// transferred.
    fn io<'a>(&'a self, io: Io<'a>, offset: u64) -> BoxFuture<'a, Result<usize, Error>>;

    /// Returns the text describing the state of the device.
    fn rctl(&self) -> BoxFuture<Result<String, Error>>;

    /// Executes a backend-specific control command.
    fn wctl<'a>(&'a self, cmd: &'a str) -> BoxFuture<'a, Result<(), Error>>;

    /// Executes a raw device command and returns its response.
    fn raw<'a>(&'a self, _cmd: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>, Error>> {
        future::ready(Err(Error::Unsupported)).boxed()
    }

    /// Number of bytes at the start of the device that contain the partition table.
    fn table_len(&self) -> usize {
        512
    }

    /// Parses the partition table read from the start of the device.
    fn parse_table(&self, size: u64, raw: &[u8]) -> Result<partition::PartitionTable, Error> {
        partition::build_from_table(size, raw)
    }
}

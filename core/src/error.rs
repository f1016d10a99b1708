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

/// Error that can happen when accessing a disk or one of its partitions.
///
/// The same type is returned by the core and by the backends, so that an error produced deep
/// inside a driver can be propagated unchanged up to the caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_more::Display)]
pub enum Error {
    /// Disk is not registered, or is not ready.
    #[display(fmt = "no disk")]
    NoDisk,
    /// Partition index is out of range.
    #[display(fmt = "no such partition")]
    NoPartition,
    /// Write whose offset or length doesn't match the alignment of the disk.
    #[display(fmt = "misaligned request")]
    Misaligned,
    /// Disk has been re-initialized since the handle was opened.
    #[display(fmt = "disk changed")]
    Stale,
    /// Partition is already opened.
    #[display(fmt = "in use")]
    InUse,
    /// Hardware didn't respond in time.
    #[display(fmt = "timeout")]
    Timeout,
    /// Resource is temporarily unavailable.
    #[display(fmt = "device busy")]
    Busy,
    /// Device reported an error in its status.
    #[display(fmt = "bad status")]
    BadStatus,
    /// Response of the device doesn't have the expected format.
    #[display(fmt = "protocol error")]
    ProtocolError,
    /// Device requires a capability that isn't supported.
    #[display(fmt = "unsupported")]
    Unsupported,
    /// Device or controller reported that the command failed.
    #[display(fmt = "device error")]
    DeviceError,
    /// Invalid argument.
    #[display(fmt = "bad arg in system call")]
    BadArgument,
    /// Control command isn't recognized, or has a wrong number of arguments.
    #[display(fmt = "bad control message")]
    BadCommand,
    /// Raw response read before any raw command was written.
    #[display(fmt = "no command executed")]
    NoCommand,
    /// Failed to allocate physical memory.
    #[display(fmt = "out of memory")]
    OutOfMemory,
    /// Disk identifier is above [`MAX_DISK_ID`](crate::MAX_DISK_ID).
    #[display(fmt = "bad block store number")]
    InvalidId,
    /// Disk identifier is already registered.
    #[display(fmt = "block store number already registered")]
    AlreadyRegistered,
}

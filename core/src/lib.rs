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

//! Hot-pluggable block storage.
//!
//! This crate contains the device-agnostic part of the block storage layer: a [`Registry`] of
//! [`Disk`]s, each driven by a [`Backend`] implemented by a controller driver, the partitioning
//! of each disk into [`Partition`]s, and the alignment-aware I/O path shared by all the
//! backends.
//!
//! # Overview
//!
//! A controller driver creates its backend and registers it with [`Registry::register`]. The
//! disk starts in a "not ready" state. Calling [`Disk::init`] (or [`Registry::init_all`]) asks
//! the backend to probe the device, installs a partition covering the whole disk, then tries to
//! parse a partition table found on the disk.
//!
//! Each time a disk is re-initialized, its version number is bumped. Handles returned by
//! [`Disk::open_partition`] and [`Disk::open_control`] remember the version at which they were
//! opened, and all operations on a handle whose version doesn't match anymore fail with
//! [`Error::Stale`].
//!
//! The code of this crate doesn't access the hardware. Drivers access physical memory and
//! registers through the [`HwAccess`] trait, which this crate defines so that all drivers
//! share the same abstraction.

#![no_std]

extern crate alloc;

pub use self::backend::{Backend, Geometry, Io};
pub use self::disk::{ControlHandle, Disk, PartitionHandle};
pub use self::error::Error;
pub use self::hw::{DmaBuffer, HwAccess};
pub use self::partition::Partition;
pub use self::registry::{Registry, MAX_DISK_ID};

pub mod ctl;
pub mod partition;
pub mod sync;

mod backend;
mod disk;
mod error;
mod hw;
mod registry;

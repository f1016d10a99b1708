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

//! Driver for the integrated SATA host controller of Marvell Kirkwood chips.
//!
//! The controller processes reads and writes as NCQ commands through a ring of requests and a
//! ring of responses located in physical memory. Each command in progress is identified by a
//! tag, and the device can complete commands in any order.
//!
//! Other commands, such as IDENTIFY DEVICE or FLUSH CACHE EXT, are issued by writing to the
//! shadow registers of the ATA task file, and can only be issued while the queue is idle.
//!
//! # Usage
//!
//! ```ignore
//! let controller = Arc::new(unsafe { SataController::new(access, Config::default())? });
//! let disk = registry.register(1, controller.clone())?;
//! // In parallel: `controller.run()`, and `controller.on_interrupt()` on each interrupt.
//! disk.init().await?;
//! ```

#![no_std]

extern crate alloc;

pub use self::controller::{Config, SataController};
pub use self::identify::Identity;

pub mod registers;

mod controller;
mod identify;
mod request;
mod tags;

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

//! Driver for SD memory cards attached to an SDIO host controller.
//!
//! The [`SdController`] implements the [`Backend`](blockstore_core::Backend) trait and is
//! meant to be registered in a [`Registry`](blockstore_core::Registry). Initializing the disk
//! resets the host controller and brings the card to the transfer state. Transfers are done
//! by DMA with multiple blocks read and write commands.
//!
//! Both standard capacity cards, addressed in bytes, and high capacity cards, addressed in
//! blocks of 512 bytes, are supported.

#![no_std]

extern crate alloc;

pub use self::card::{Card, Cid, Csd};
pub use self::controller::{Config, SdController};

pub mod command;
pub mod registers;

mod card;
mod controller;

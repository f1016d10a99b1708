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

//! Registers of the SDIO host controller.
//!
//! All registers are 32 bits wide, but most of them only use the lower 16 bits.

pub const DMA_ADDR_LO_OFFSET: u64 = 0x00;
pub const DMA_ADDR_HI_OFFSET: u64 = 0x04;
pub const BLOCK_SIZE_OFFSET: u64 = 0x08;
pub const BLOCK_COUNT_OFFSET: u64 = 0x0c;
pub const ARG_LO_OFFSET: u64 = 0x10;
pub const ARG_HI_OFFSET: u64 = 0x14;
pub const XFER_MODE_OFFSET: u64 = 0x18;
pub const CMD_OFFSET: u64 = 0x1c;
/// First of the eight response registers, each holding 16 bits of the response.
pub const RESP_OFFSET: u64 = 0x20;
pub const HOST_STATE_OFFSET: u64 = 0x48;
pub const HOST_CTL_OFFSET: u64 = 0x50;
pub const SW_RESET_OFFSET: u64 = 0x5c;
pub const STATUS_OFFSET: u64 = 0x60;
pub const ERR_STATUS_OFFSET: u64 = 0x64;
pub const STATUS_ENABLE_OFFSET: u64 = 0x68;
pub const ERR_STATUS_ENABLE_OFFSET: u64 = 0x6c;
pub const STATUS_IRQ_OFFSET: u64 = 0x70;
pub const ERR_STATUS_IRQ_OFFSET: u64 = 0x74;
pub const ACMD12_STATUS_OFFSET: u64 = 0x78;
pub const ACMD12_ARG_LO_OFFSET: u64 = 0x84;
pub const ACMD12_ARG_HI_OFFSET: u64 = 0x88;
pub const ACMD12_INDEX_OFFSET: u64 = 0x8c;
pub const CLOCK_DIV_OFFSET: u64 = 0x128;

// Transfer mode. The documentation is contradictory about these bits; the comments describe
// what the hardware actually does.
/// Data follows the response, for write commands.
pub const XFER_DATA_WRITE: u32 = 1 << 1;
/// The controller sends CMD12 itself at the end of the transfer.
pub const XFER_AUTO_CMD12: u32 = 1 << 2;
/// Data flows from the card to the host.
pub const XFER_TO_HOST: u32 = 1 << 4;

// Command register.
pub const CMD_RESP_NONE: u32 = 0;
pub const CMD_RESP_136: u32 = 1;
pub const CMD_RESP_48: u32 = 2;
pub const CMD_RESP_48_BUSY: u32 = 3;
pub const CMD_DATA_CRC_CHECK: u32 = 1 << 2;
pub const CMD_CRC_CHECK: u32 = 1 << 3;
pub const CMD_INDEX_CHECK: u32 = 1 << 4;
pub const CMD_DATA_PRESENT: u32 = 1 << 5;
pub const CMD_UNEXPECTED_RESP: u32 = 1 << 7;
pub const CMD_INDEX_SHIFT: u32 = 8;

// Host state.
pub const HOST_CMD_INHIBIT: u32 = 1 << 0;
pub const HOST_CARD_BUSY: u32 = 1 << 1;

// Host control.
pub const HOST_PUSH_PULL: u32 = 1 << 0;
pub const HOST_CARD_MEM_ONLY: u32 = 0 << 1;
pub const HOST_BIG_ENDIAN: u32 = 1 << 3;
pub const HOST_DATA_WIDTH_4: u32 = 1 << 9;
pub const HOST_HIGH_SPEED: u32 = 1 << 10;
pub const HOST_TIMEOUT_ENABLE: u32 = 1 << 15;

pub const fn host_timeout(v: u32) -> u32 {
    (v & 0xf) << 11
}

pub const SW_RESET_ALL: u32 = 1 << 8;

// Status, status enable and status interrupt registers.
pub const ST_CMD_COMPLETE: u32 = 1 << 0;
pub const ST_XFER_COMPLETE: u32 = 1 << 1;
pub const ST_DMA_INTR: u32 = 1 << 3;
pub const ST_TX_READY: u32 = 1 << 4;
pub const ST_FIFO_8W_AVAIL: u32 = 1 << 11;
pub const ST_AUTO_CMD12_DONE: u32 = 1 << 13;
pub const ST_UNEXPECTED_RESP: u32 = 1 << 14;
pub const ST_ERROR: u32 = 1 << 15;

// Error status.
pub const EST_CMD_TIMEOUT: u32 = 1 << 0;

pub const ACMD12_CHECK_BUSY: u32 = 1 << 0;
pub const ACMD12_CHECK_INDEX: u32 = 1 << 1;
pub const ACMD12_INDEX_SHIFT: u32 = 8;

/// Names of the bits of the error status register.
pub const ERR_STATUS_NAMES: &[&str] = &[
    "cmdtimeout",
    "cmdcrc",
    "cmdendbit",
    "cmdindex",
    "datatimeout",
    "rddatacrc",
    "rddataend",
    "",
    "autocmd12",
    "cmdstartbit",
    "xfersize",
    "resptbit",
    "crcendbit",
    "crcstartbit",
    "crcstatus",
];

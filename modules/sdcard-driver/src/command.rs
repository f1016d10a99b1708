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

//! Commands sent to the card and their responses.

use crate::registers::*;

use blockstore_core::{DmaBuffer, Error, HwAccess};
use core::fmt;

// Commands.
pub const CMD_GO_IDLE: u8 = 0;
pub const CMD_ALL_SEND_CID: u8 = 2;
pub const CMD_SEND_RELATIVE_ADDR: u8 = 3;
pub const CMD_SELECT_CARD: u8 = 7;
pub const CMD_SEND_IF_COND: u8 = 8;
pub const CMD_SEND_CSD: u8 = 9;
pub const CMD_STOP_TRANSMISSION: u8 = 12;
pub const CMD_SET_BLOCKLEN: u8 = 16;
pub const CMD_READ_MULTIPLE: u8 = 18;
pub const CMD_WRITE_MULTIPLE: u8 = 25;
pub const CMD_ERASE_START: u8 = 32;
pub const CMD_ERASE_END: u8 = 33;
pub const CMD_ERASE: u8 = 38;
pub const CMD_APP: u8 = 55;

// Application-specific commands, preceded by `CMD_APP`.
pub const ACMD_SET_BUS_WIDTH: u8 = 6;
pub const ACMD_SET_WR_BLK_ERASE_COUNT: u8 = 23;
pub const ACMD_SD_SEND_OP_COND: u8 = 41;

pub const IF_COND_PATTERN: u32 = 0xaa;
pub const IF_COND_PATTERN_MASK: u32 = 0xff;
pub const IF_COND_VOLTAGE: u32 = 1 << 8;
pub const IF_COND_VOLTAGE_MASK: u32 = 0xf << 8;

/// 2.7V to 3.6V.
pub const OCR_VOLTAGE_WINDOW: u32 = 0x1ff << 15;
pub const OCR_HIGH_CAPACITY: u32 = 1 << 30;
pub const OCR_READY: u32 = 1 << 31;

// Card status, found in R1 and R1b responses.
/// The next command is interpreted as application-specific.
pub const STATUS_APP_CMD: u32 = 1 << 5;
pub const STATUS_STATE_SHIFT: u32 = 9;
pub const STATUS_ERROR: u32 = 1 << 19;
pub const STATUS_ILLEGAL_COMMAND: u32 = 1 << 22;
/// Bits considered as an error. Some indicate conditions that aren't handled.
pub const STATUS_BAD: u32 = 1 << 3 | 1 << 13 | 1 << 14 | 1 << 15 | 1 << 16 | 0x1fff << 19;

/// Names of the bits of the card status.
pub const STATUS_NAMES: &[&str] = &[
    "tm0",
    "tm1",
    "apprsvd",
    "akeseqerr",
    "sdiorsvd",
    "appcmd",
    "rsvd6",
    "rsvd7",
    "readyfordata",
    "st9",
    "st10",
    "st11",
    "st12",
    "erasereset",
    "noecc",
    "wperaseskip",
    "csdoverwrite",
    "rsvd17",
    "rsvd18",
    "error",
    "ccerror",
    "eccfail",
    "badcmd",
    "cmdcrcerr",
    "lockerr",
    "locked",
    "wpviolation",
    "eraseparam",
    "eraseseqerr",
    "blocklenerr",
    "addrerr",
    "outofrange",
];

/// Names of the states found in the card status.
pub const STATE_NAMES: &[&str] = &[
    "idle", "ready", "ident", "stby", "tran", "data", "rcv", "prg", "dis",
];

/// Response expected from the card.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseType {
    /// No response.
    R0,
    /// Card status.
    R1,
    /// Card status, with the card signalling busy afterwards.
    R1b,
    /// CID or CSD register.
    R2,
    /// OCR register, without CRC.
    R3,
    /// Published relative address.
    R6,
    /// Card interface condition.
    R7,
}

impl ResponseType {
    /// Bits of the command register describing the response.
    pub fn command_bits(self) -> u32 {
        let mut bits = match self {
            ResponseType::R0 => CMD_RESP_NONE,
            ResponseType::R1b => CMD_RESP_48_BUSY,
            ResponseType::R2 => CMD_RESP_136,
            _ => CMD_RESP_48,
        };
        if self != ResponseType::R0 && self != ResponseType::R3 {
            bits |= CMD_CRC_CHECK;
        }
        if self != ResponseType::R0 && self != ResponseType::R2 && self != ResponseType::R3 {
            bits |= CMD_INDEX_CHECK;
        }
        bits
    }

    /// True if the response contains the card status.
    pub fn has_status(self) -> bool {
        matches!(self, ResponseType::R1 | ResponseType::R1b)
    }
}

/// Direction of the data phase of a command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    ToHost,
    ToCard,
}

/// Data phase of a command, performed by DMA.
pub struct Transfer<'a, A: HwAccess> {
    pub buffer: &'a DmaBuffer<A>,
    pub block_size: u32,
    pub blocks: u32,
    pub direction: Direction,
}

/// Command to send to the card.
pub struct Command<'a, A: HwAccess> {
    pub index: u8,
    pub arg: u32,
    pub response: ResponseType,
    /// If true, the command is preceded with `CMD_APP`.
    pub app: bool,
    pub transfer: Option<Transfer<'a, A>>,
    /// If true, the controller stops the transfer with CMD12.
    pub multi_block: bool,
}

impl<'a, A: HwAccess> Command<'a, A> {
    pub fn new(index: u8, arg: u32, response: ResponseType) -> Self {
        Command {
            index,
            arg,
            response,
            app: false,
            transfer: None,
            multi_block: false,
        }
    }

    pub fn app(index: u8, arg: u32, response: ResponseType) -> Self {
        Command {
            app: true,
            ..Command::new(index, arg, response)
        }
    }

    /// Adds a multiple blocks data phase to the command.
    pub fn with_blocks(mut self, buffer: &'a DmaBuffer<A>, direction: Direction) -> Self {
        self.transfer = Some(Transfer {
            buffer,
            block_size: 512,
            blocks: (buffer.len() / 512) as u32,
            direction,
        });
        self.multi_block = true;
        self
    }
}

/// Response to a command.
///
/// For 136 bits responses, contains bits 127 to 8 of the register. Otherwise, contains the 32
/// bits of payload shifted by 8.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Response(pub u128);

impl Response {
    /// Assembles a response from the content of the response registers.
    pub fn from_registers(response: ResponseType, regs: &[u16; 8]) -> Self {
        let r = |n: usize| u128::from(regs[n]);
        match response {
            ResponseType::R0 => Response(0),
            ResponseType::R2 => Response(
                (r(7) & 0x3fff) << 8
                    | r(6) << 22
                    | r(5) << 38
                    | r(4) << 54
                    | r(3) << 70
                    | r(2) << 86
                    | r(1) << 102
                    | (r(0) & 0x3ff) << 118,
            ),
            _ => Response((r(2) & 0x3f) << 8 | r(1) << 14 | (r(0) & 0x3ff) << 30),
        }
    }

    /// Returns the 32 bits payload of a 48 bits response.
    pub fn value(&self) -> u32 {
        (self.0 >> 8) as u32
    }

    /// Returns the content of a CID or CSD register.
    pub fn register(&self) -> u128 {
        self.0
    }
}

/// Failure of a command.
#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_more::Display)]
pub enum CommandError {
    #[display(fmt = "timeout")]
    Timeout,
    #[display(fmt = "card busy")]
    CardBusy,
    /// Error reported by the host controller, with the error status.
    #[display(fmt = "error (est {:#x})", _0)]
    Host(u32),
    /// Error bits in the status returned by the card.
    #[display(fmt = "bad status (r1 status {:#x})", _0)]
    BadStatus(u32),
}

impl CommandError {
    /// Returns the names of the error bits, for diagnostics.
    pub fn flags(&self) -> Option<Flags> {
        match *self {
            CommandError::Host(est) => Some(Flags(est, ERR_STATUS_NAMES)),
            CommandError::BadStatus(status) => Some(Flags(status, STATUS_NAMES)),
            _ => None,
        }
    }
}

impl From<CommandError> for Error {
    fn from(err: CommandError) -> Error {
        match err {
            CommandError::Timeout => Error::Timeout,
            CommandError::CardBusy => Error::Busy,
            CommandError::Host(_) => Error::DeviceError,
            CommandError::BadStatus(_) => Error::BadStatus,
        }
    }
}

/// Displays the names of the bits set in a register.
pub struct Flags(pub u32, pub &'static [&'static str]);

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (n, name) in self.1.iter().enumerate() {
            if self.0 & (1 << n) != 0 && !name.is_empty() {
                write!(f, " {}", name)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandError, Flags, Response, ResponseType, STATUS_NAMES};
    use alloc::string::ToString as _;

    #[test]
    fn short_response() {
        // Status 0x0000_0920: ready for data, state "tran", app cmd.
        let w = 0x920u64 << 8;
        let regs = [
            (w >> 30) as u16 & 0x3ff,
            (w >> 14) as u16,
            (w >> 8) as u16 & 0x3f,
            0,
            0,
            0,
            0,
            0,
        ];
        let response = Response::from_registers(ResponseType::R1, &regs);
        assert_eq!(response.value(), 0x920);
    }

    #[test]
    fn long_response() {
        let register = 0x0353_4453_5530_3247_8012_3456_7800_a500u128 & !0xff;
        let regs = [
            (register >> 118) as u16 & 0x3ff,
            (register >> 102) as u16,
            (register >> 86) as u16,
            (register >> 70) as u16,
            (register >> 54) as u16,
            (register >> 38) as u16,
            (register >> 22) as u16,
            (register >> 8) as u16 & 0x3fff,
        ];
        let response = Response::from_registers(ResponseType::R2, &regs);
        assert_eq!(response.register(), register);
    }

    #[test]
    fn command_bits() {
        assert_eq!(ResponseType::R0.command_bits(), 0);
        assert_eq!(ResponseType::R3.command_bits(), 2);
        assert_eq!(ResponseType::R2.command_bits(), 1 | 1 << 3);
        assert_eq!(ResponseType::R1b.command_bits(), 3 | 1 << 3 | 1 << 4);
    }

    #[test]
    fn error_display() {
        assert_eq!(Flags(1 << 5 | 1 << 22, STATUS_NAMES).to_string(), " appcmd badcmd");
        let err = CommandError::BadStatus(1 << 19);
        assert_eq!(err.to_string(), "bad status (r1 status 0x80000)");
        assert_eq!(err.flags().unwrap().to_string(), " error");
        assert_eq!(CommandError::Host(1).flags().unwrap().to_string(), " cmdtimeout");
        assert!(CommandError::Timeout.flags().is_none());
    }
}

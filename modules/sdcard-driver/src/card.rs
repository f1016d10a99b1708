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

//! Identification and capabilities of a card, as found in its CID and CSD registers.

use alloc::string::String;
use blockstore_core::{ctl, Error};
use core::{
    convert::TryFrom as _,
    fmt::{self, Write as _},
};

/// Extracts bits `hi` to `lo` (inclusive) of a register.
fn bits(register: u128, hi: u32, lo: u32) -> u32 {
    debug_assert!(hi >= lo && hi - lo < 32);
    ((register >> lo) & ((1u128 << (hi - lo + 1)) - 1)) as u32
}

/// Content of the CID register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cid {
    pub manufacturer: u8,
    pub oem: String,
    pub product: String,
    pub revision: u8,
    pub serial: u32,
    pub year: u16,
    pub month: u8,
}

impl Cid {
    pub fn parse(register: u128) -> Result<Self, Error> {
        let ascii = |hi, lo| -> Result<String, Error> {
            let mut out = String::new();
            let mut bit = hi;
            while bit > lo {
                let c = bits(register, bit, bit - 7) as u8;
                if !c.is_ascii_graphic() && c != b' ' {
                    return Err(Error::ProtocolError);
                }
                out.push(char::from(c));
                bit -= 8;
            }
            Ok(String::from(out.trim_end()))
        };

        let month = bits(register, 11, 8) as u8;
        if month == 0 || month > 12 {
            return Err(Error::ProtocolError);
        }

        Ok(Cid {
            manufacturer: bits(register, 127, 120) as u8,
            oem: ascii(119, 104)?,
            product: ascii(103, 64)?,
            revision: bits(register, 63, 56) as u8,
            serial: bits(register, 55, 24),
            year: 2000 + bits(register, 19, 12) as u16,
            month,
        })
    }
}

/// Content of the CSD register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Csd {
    /// 0 for standard capacity cards, 1 for high capacity cards.
    pub version: u8,
    pub transfer_speed: u8,
    pub command_classes: u16,
    /// Base 2 logarithm of the maximum read block length.
    pub read_block_len: u8,
    /// Base 2 logarithm of the maximum write block length.
    pub write_block_len: u8,
    pub device_size: u32,
    /// Only meaningful for version 0.
    pub size_multiplier: u8,
    pub erase_block_enable: bool,
    /// Size of an erasable sector, in write blocks, minus one.
    pub erase_sector_size: u8,
}

impl Csd {
    pub fn parse(register: u128) -> Result<Self, Error> {
        let version = bits(register, 127, 126) as u8;
        let read_block_len = bits(register, 83, 80) as u8;
        let (device_size, size_multiplier) = match version {
            0 => (bits(register, 73, 62), bits(register, 49, 47) as u8),
            1 => (bits(register, 69, 48), 0),
            _ => return Err(Error::ProtocolError),
        };
        if read_block_len < 9 || read_block_len > 11 || (version == 1 && read_block_len != 9) {
            return Err(Error::ProtocolError);
        }

        Ok(Csd {
            version,
            transfer_speed: bits(register, 103, 96) as u8,
            command_classes: bits(register, 95, 84) as u16,
            read_block_len,
            write_block_len: bits(register, 25, 22) as u8,
            device_size,
            size_multiplier,
            erase_block_enable: bits(register, 46, 46) != 0,
            erase_sector_size: bits(register, 45, 39) as u8,
        })
    }

    /// Returns the capacity of the card, in bytes.
    pub fn capacity(&self) -> u64 {
        let blocks = u64::from(self.device_size) + 1;
        if self.version == 0 {
            blocks << (self.size_multiplier + 2) << self.read_block_len
        } else {
            blocks * 512 * 1024
        }
    }

    /// Returns the block length used for reads.
    pub fn block_len(&self) -> u32 {
        if self.version == 0 {
            1 << self.read_block_len
        } else {
            512
        }
    }
}

/// Card that went through the initialization sequence.
#[derive(Debug, Clone)]
pub struct Card {
    /// Card replied to the interface condition command, meaning it supports version 2.00.
    pub sd2: bool,
    /// High capacity card, addressed in blocks rather than bytes.
    pub sdhc: bool,
    pub rca: u16,
    pub cid: Cid,
    pub csd: Csd,
}

impl Card {
    /// Capacity of the card, in bytes.
    pub fn size(&self) -> u64 {
        self.csd.capacity()
    }

    /// Returns the argument designating `offset` in read, write and erase commands.
    pub fn address(&self, offset: u64) -> Result<u32, Error> {
        let address = if self.sdhc { offset / 512 } else { offset };
        u32::try_from(address).map_err(|_| Error::BadArgument)
    }

    /// Writes the text shown by the device control file.
    pub fn write_description(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "card sd2 {} sdhc {} rca {:#x} size {} blocksize {}",
            self.sd2 as u8,
            self.sdhc as u8,
            self.rca,
            self.size(),
            self.csd.block_len()
        );

        let cid = &self.cid;
        let _ = writeln!(out, "cid:");
        let _ = writeln!(out, "\tmanufacturer {:#x}", cid.manufacturer);
        let _ = writeln!(out, "\toem {}", ctl::quote(&cid.oem));
        let _ = writeln!(out, "\tproduct {}", ctl::quote(&cid.product));
        let _ = writeln!(out, "\trev {:#x}", cid.revision);
        let _ = writeln!(out, "\tserial {:#x}", cid.serial);
        let _ = writeln!(out, "\tdate {}-{}", cid.year, cid.month);

        let csd = &self.csd;
        let _ = writeln!(out, "csd:");
        let _ = writeln!(out, "\tversion {}", csd.version);
        let _ = writeln!(out, "\tspeed {:#x}", csd.transfer_speed);
        let _ = writeln!(out, "\tclasses {:#x}", csd.command_classes);
        let _ = writeln!(out, "\tread block {}", 1u32 << csd.read_block_len);
        let _ = writeln!(out, "\twrite block {}", 1u32 << csd.write_block_len);
        let _ = writeln!(out, "\tdevice size {}", csd.device_size);
        if csd.version == 0 {
            let _ = writeln!(out, "\tsize mult {}", csd.size_multiplier);
        }
        let _ = writeln!(
            out,
            "\terase block {} sector {}",
            csd.erase_block_enable as u8,
            u32::from(csd.erase_sector_size) + 1
        );
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "product {}, serial {:#x}, rev {:#x}, {}-{}, sdhc {}",
            ctl::quote(&self.cid.product),
            self.cid.serial,
            self.cid.revision,
            self.cid.year,
            self.cid.month,
            self.sdhc as u8
        )
    }
}

#[cfg(test)]
pub(crate) mod testing {
    /// Sets bits `hi` to `lo` (inclusive) of a register.
    pub fn set(register: &mut u128, hi: u32, lo: u32, value: u32) {
        let mask = ((1u128 << (hi - lo + 1)) - 1) << lo;
        *register = (*register & !mask) | ((u128::from(value) << lo) & mask);
    }

    /// CID of a SanDisk 2GB card made in May 2010.
    pub fn cid() -> u128 {
        let mut r = 0;
        set(&mut r, 127, 120, 0x03);
        set(&mut r, 119, 104, u32::from(u16::from_be_bytes(*b"SD")));
        for (n, c) in b"SU02G".iter().enumerate() {
            let hi = 103 - n as u32 * 8;
            set(&mut r, hi, hi - 7, u32::from(*c));
        }
        set(&mut r, 63, 56, 0x80);
        set(&mut r, 55, 24, 0x1234_5678);
        set(&mut r, 19, 12, 10);
        set(&mut r, 11, 8, 5);
        r
    }

    /// CSD of a high capacity card.
    pub fn csd_v1(device_size: u32) -> u128 {
        let mut r = 0;
        set(&mut r, 127, 126, 1);
        set(&mut r, 103, 96, 0x32);
        set(&mut r, 95, 84, 0x5b5);
        set(&mut r, 83, 80, 9);
        set(&mut r, 69, 48, device_size);
        set(&mut r, 46, 46, 1);
        set(&mut r, 45, 39, 0x7f);
        set(&mut r, 25, 22, 9);
        r
    }

    /// CSD of a standard capacity card.
    pub fn csd_v0(device_size: u32, size_multiplier: u32, read_block_len: u32) -> u128 {
        let mut r = 0;
        set(&mut r, 103, 96, 0x32);
        set(&mut r, 95, 84, 0x5f5);
        set(&mut r, 83, 80, read_block_len);
        set(&mut r, 73, 62, device_size);
        set(&mut r, 49, 47, size_multiplier);
        set(&mut r, 45, 39, 0x1f);
        set(&mut r, 25, 22, read_block_len);
        r
    }
}

#[cfg(test)]
mod tests {
    use super::{testing, Card, Cid, Csd};
    use alloc::string::{String, ToString as _};
    use blockstore_core::Error;

    #[test]
    fn cid_fields() {
        let cid = Cid::parse(testing::cid()).unwrap();
        assert_eq!(cid.manufacturer, 3);
        assert_eq!(cid.oem, "SD");
        assert_eq!(cid.product, "SU02G");
        assert_eq!(cid.revision, 0x80);
        assert_eq!(cid.serial, 0x1234_5678);
        assert_eq!((cid.year, cid.month), (2010, 5));
    }

    #[test]
    fn cid_bad_month() {
        let mut register = testing::cid();
        testing::set(&mut register, 11, 8, 13);
        assert_eq!(Cid::parse(register), Err(Error::ProtocolError));
    }

    #[test]
    fn cid_bad_product_name() {
        let mut register = testing::cid();
        testing::set(&mut register, 103, 96, 0x07);
        assert_eq!(Cid::parse(register), Err(Error::ProtocolError));
    }

    #[test]
    fn high_capacity_size() {
        // 8 GiB.
        let csd = Csd::parse(testing::csd_v1(16383)).unwrap();
        assert_eq!(csd.version, 1);
        assert_eq!(csd.capacity(), 8 * 1024 * 1024 * 1024);
        assert_eq!(csd.block_len(), 512);
    }

    #[test]
    fn standard_capacity_size() {
        // 4096 * 2^(7+2) * 2^10 = 2 GiB.
        let csd = Csd::parse(testing::csd_v0(4095, 7, 10)).unwrap();
        assert_eq!(csd.version, 0);
        assert_eq!(csd.capacity(), 2 * 1024 * 1024 * 1024);
        assert_eq!(csd.block_len(), 1024);
    }

    #[test]
    fn bad_csd() {
        let mut register = testing::csd_v1(100);
        testing::set(&mut register, 127, 126, 2);
        assert_eq!(Csd::parse(register), Err(Error::ProtocolError));
        assert_eq!(
            Csd::parse(testing::csd_v0(100, 0, 8)),
            Err(Error::ProtocolError)
        );
    }

    #[test]
    fn description() {
        let card = Card {
            sd2: true,
            sdhc: true,
            rca: 0xb368,
            cid: Cid::parse(testing::cid()).unwrap(),
            csd: Csd::parse(testing::csd_v1(3)).unwrap(),
        };
        assert_eq!(
            card.to_string(),
            "product SU02G, serial 0x12345678, rev 0x80, 2010-5, sdhc 1"
        );
        assert_eq!(card.address(4096), Ok(8));

        let mut text = String::new();
        card.write_description(&mut text);
        assert!(text.starts_with("card sd2 1 sdhc 1 rca 0xb368 size 2097152 blocksize 512\ncid:\n"));
        assert!(text.contains("\tdate 2010-5\ncsd:\n\tversion 1\n"));
    }
}

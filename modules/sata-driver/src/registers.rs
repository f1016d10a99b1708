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

//! Registers of the Marvell integrated SATA host controller, and bits within them.
//!
//! Offsets of the `HC_` registers are relative to the base of the host controller. All the
//! other offsets are relative to the base of the port.

// Host controller.
pub const HC_CFG_OFFSET: u64 = 0x000;
pub const HC_INTR_COALESCING_OFFSET: u64 = 0x00c;
pub const HC_INTR_TIME_OFFSET: u64 = 0x010;
/// Interrupt cause of the ports. Bits are cleared by writing 0 to them; writing 1 leaves them
/// untouched.
pub const HC_INTR_OFFSET: u64 = 0x014;
pub const HC_MAIN_INTR_OFFSET: u64 = 0x020;
pub const HC_MAIN_INTR_MASK_OFFSET: u64 = 0x024;

// EDMA.
pub const EDMA_CFG_OFFSET: u64 = 0x000;
pub const EDMA_INTR_ERR_CAUSE_OFFSET: u64 = 0x008;
pub const EDMA_INTR_ERR_MASK_OFFSET: u64 = 0x00c;
pub const EDMA_REQ_BASE_HI_OFFSET: u64 = 0x010;
pub const EDMA_REQ_IN_OFFSET: u64 = 0x014;
pub const EDMA_REQ_OUT_OFFSET: u64 = 0x018;
pub const EDMA_RESP_BASE_HI_OFFSET: u64 = 0x01c;
pub const EDMA_RESP_IN_OFFSET: u64 = 0x020;
pub const EDMA_RESP_OUT_OFFSET: u64 = 0x024;
pub const EDMA_CMD_OFFSET: u64 = 0x028;
pub const EDMA_STATUS_OFFSET: u64 = 0x030;
pub const EDMA_IORDY_TIMEOUT_OFFSET: u64 = 0x034;
pub const EDMA_CMD_DELAY_THR_OFFSET: u64 = 0x040;

// Shadow registers of the ATA task file.
pub const ATA_DATA_OFFSET: u64 = 0x100;
pub const ATA_FEATURES_OFFSET: u64 = 0x104;
pub const ATA_SECTORS_OFFSET: u64 = 0x108;
pub const ATA_LBA_LOW_OFFSET: u64 = 0x10c;
pub const ATA_LBA_MID_OFFSET: u64 = 0x110;
pub const ATA_LBA_HIGH_OFFSET: u64 = 0x114;
pub const ATA_DEVICE_OFFSET: u64 = 0x118;
/// Writing starts a command. Reading returns the status.
pub const ATA_CMD_STATUS_OFFSET: u64 = 0x11c;

// SATA interface.
pub const IFC_CFG_OFFSET: u64 = 0x050;
pub const SSTATUS_OFFSET: u64 = 0x300;
pub const SERROR_OFFSET: u64 = 0x304;
pub const SCONTROL_OFFSET: u64 = 0x308;
pub const PHY_M3_OFFSET: u64 = 0x310;
pub const PHY_M4_OFFSET: u64 = 0x314;
pub const SERROR_INTR_ENABLE_OFFSET: u64 = 0x340;
pub const FIS_CFG_OFFSET: u64 = 0x360;
pub const FIS_INTR_OFFSET: u64 = 0x364;
pub const FIS_INTR_ENABLE_OFFSET: u64 = 0x368;
pub const PHY_M9_GEN2_OFFSET: u64 = 0x398;
pub const PHY_M9_GEN1_OFFSET: u64 = 0x39c;

// Main interrupt cause, for the port we drive.
pub const MAIN_SATA_ERR: u32 = 1 << 2;
pub const MAIN_SATA_DONE: u32 = 1 << 3;

// Host controller interrupt cause.
pub const HC_DMA_DONE: u32 = 1 << 1;
pub const HC_DEVICE_INTR: u32 = 1 << 9;

// EDMA command.
pub const EDMA_ENABLE: u32 = 1 << 0;
pub const EDMA_ABORT: u32 = 1 << 1;
pub const EDMA_ATA_RESET: u32 = 1 << 2;

// EDMA configuration.
pub const EDMA_CFG_NCQ: u32 = 1 << 5;
pub const EDMA_CFG_QUEUE: u32 = 1 << 9;

// EDMA error cause.
pub const ERR_DEVICE_ERROR: u32 = 1 << 2;
pub const ERR_DEVICE_DISCONNECT: u32 = 1 << 3;
pub const ERR_DEVICE_CONNECT: u32 = 1 << 4;
pub const ERR_SERROR: u32 = 1 << 5;
pub const ERR_SELF_DISABLE: u32 = 1 << 7;
pub const ERR_TRANSPORT_INTR: u32 = 1 << 8;
pub const ERR_IORDY: u32 = 1 << 12;
pub const ERR_LINK_RX_CTL: u32 = 0xf << 13;
pub const ERR_LINK_RX_DATA: u32 = 0xf << 17;
pub const ERR_LINK_TX_CTL: u32 = 0x1f << 21;
pub const ERR_LINK_TX_DATA: u32 = 0x1f << 26;
pub const ERR_TRANSPORT: u32 = 1 << 31;
/// Link errors that require a reset of the link. Errors while transmitting control frames are
/// recovered by the controller.
pub const ERR_LINK_MASK: u32 = ERR_LINK_RX_CTL | ERR_LINK_RX_DATA | ERR_LINK_TX_DATA;
/// Errors after which nothing can be trusted anymore.
pub const ERR_FATAL_MASK: u32 = ERR_DEVICE_DISCONNECT | ERR_IORDY | ERR_LINK_MASK | ERR_TRANSPORT;

// ATA status.
pub const ATA_ERR: u8 = 1 << 0;
pub const ATA_DRQ: u8 = 1 << 3;
pub const ATA_DF: u8 = 1 << 5;
pub const ATA_DRDY: u8 = 1 << 6;
pub const ATA_BSY: u8 = 1 << 7;

// ATA commands.
pub const ATA_CMD_READ_FPDMA: u8 = 0x60;
pub const ATA_CMD_WRITE_FPDMA: u8 = 0x61;
pub const ATA_CMD_FLUSH_CACHE_EXT: u8 = 0xea;
pub const ATA_CMD_IDENTIFY: u8 = 0xec;
/// Value of the device register for commands using logical block addressing.
pub const ATA_DEV_LBA: u8 = 1 << 6;

// SError.
pub const SERROR_N: u32 = 1 << 16;
pub const SERROR_X: u32 = 1 << 26;

// SControl.
pub const SCONTROL_DET_COMRESET: u32 = 1 << 0;
pub const SCONTROL_IPM_NO_PARTIAL: u32 = 1 << 8;
pub const SCONTROL_IPM_NO_SLUMBER: u32 = 1 << 9;

/// FIS interrupt raised when the device updates the shadow registers.
pub const FIS_D2H_REGISTER: u32 = 1 << 0;

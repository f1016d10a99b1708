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

use crate::{
    card::{Card, Cid, Csd},
    command::{
        ResponseType::{R0, R1, R1b, R2, R3, R6, R7},
        *,
    },
    registers::*,
};

use alloc::string::{String, ToString as _};
use blockstore_core::{
    ctl,
    sync::{self, WaitQueue},
    Backend, DmaBuffer, Error, Geometry, HwAccess, Io,
};
use core::{
    convert::TryFrom as _,
    fmt::{self, Write as _},
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};
use futures::{
    future::{BoxFuture, FutureExt as _},
    lock::Mutex,
};


const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const BLOCK_LEN: u64 = 512;
/// Maximum number of bytes transferred with a single command.
const MAX_CHUNK_LEN: usize = 512 * 1024;

/// Configuration of an [`SdController`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Physical address of the registers of the host controller.
    pub base: u64,
    /// Frequency of the clock of the controller, in Hz. The card clock is derived from it.
    pub base_clock_hz: u32,
    /// Initial debug level. Can be changed later with the `debug` control command.
    pub debug: u32,
    /// If true, write commands are preceded with the number of blocks to pre-erase.
    pub preerase: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base: 0xf109_0000,
            base_clock_hz: 100_000_000,
            debug: 0,
            preerase: false,
        }
    }
}

/// Driver for an SD host controller with a memory card inserted.
///
/// Only SD memory cards are supported, with either standard or high capacity. MMC and SDIO
/// cards are rejected.
///
/// [`SdController::on_interrupt`] must be called whenever the controller raises an interrupt.
pub struct SdController<A: HwAccess> {
    access: A,
    base: u64,
    base_clock_hz: u32,
    debug: AtomicU32,
    preerase: AtomicBool,
    /// Card that went through the initialization, if any. Locked during each command or
    /// sequence of commands.
    card: Mutex<Option<Card>>,
    /// Woken up by interrupts.
    irq_wait: WaitQueue,
}

impl<A> SdController<A>
where
    A: HwAccess + Clone,
{
    /// Creates the driver, and disables the interrupts of the controller.
    ///
    /// # Safety
    ///
    /// The registers at `config.base` must belong to an SD host controller, and nothing else
    /// must access it.
    pub unsafe fn new(access: A, config: Config) -> Self {
        let controller = SdController {
            access,
            base: config.base,
            base_clock_hz: config.base_clock_hz,
            debug: AtomicU32::new(config.debug),
            preerase: AtomicBool::new(config.preerase),
            card: Mutex::new(None),
            irq_wait: WaitQueue::new(),
        };

        // Interrupts are only enabled while a command is in progress.
        controller.write(STATUS_IRQ_OFFSET, 0);
        controller.write(ERR_STATUS_IRQ_OFFSET, 0);
        controller
    }

    /// Reacts to an interrupt raised by the controller.
    ///
    /// Disables further interrupts. The status registers are left unchanged; the task that
    /// issued the command reads them.
    pub fn on_interrupt(&self) {
        self.write(STATUS_IRQ_OFFSET, 0);
        self.write(ERR_STATUS_IRQ_OFFSET, 0);
        self.irq_wait.wake_all();
    }

    /// Resets the host controller. Forgets about the card, if any.
    pub async fn init_host(&self) {
        let mut card = self.card.lock().await;
        self.reset_host(&mut card).await;
    }

    /// Returns the card currently initialized, if any.
    pub async fn card(&self) -> Option<Card> {
        self.card.lock().await.clone()
    }

    async fn reset_host(&self, card: &mut Option<Card>) {
        *card = None;

        // Forces all cards to the idle state.
        self.write(SW_RESET_OFFSET, SW_RESET_ALL);
        self.access.delay(Duration::from_millis(50)).await;
        self.set_clock(100_000).await;

        self.write(
            HOST_CTL_OFFSET,
            HOST_PUSH_PULL
                | HOST_CARD_MEM_ONLY
                | HOST_BIG_ENDIAN
                | HOST_DATA_WIDTH_4
                | host_timeout(15)
                | HOST_TIMEOUT_ENABLE,
        );

        self.write(STATUS_OFFSET, !0);
        self.write(ERR_STATUS_OFFSET, !0);
        self.write(STATUS_ENABLE_OFFSET, !(ST_TX_READY | ST_FIFO_8W_AVAIL));
        self.write(ERR_STATUS_ENABLE_OFFSET, !0);
        self.write(STATUS_IRQ_OFFSET, 0);
        self.write(ERR_STATUS_IRQ_OFFSET, 0);
    }

    async fn set_clock(&self, hz: u32) {
        let divider = (self.base_clock_hz / hz).saturating_sub(1);
        self.write(CLOCK_DIV_OFFSET, divider);
        self.access.delay(Duration::from_millis(10)).await;
    }

    /// Brings the card from the idle state to the transfer state.
    async fn probe(&self) -> Result<Card, Error> {
        self.modify(HOST_CTL_OFFSET, |v| v & !HOST_HIGH_SPEED);
        self.set_clock(400_000).await;

        self.command(0, Command::new(CMD_GO_IDLE, 0, R0))
            .await
            .map_err(|err| self.fail("reset failed", err))?;

        // Only cards of version 2.00 or later reply to the interface condition.
        let mut sd2 = false;
        let if_cond = Command::new(CMD_SEND_IF_COND, IF_COND_VOLTAGE | IF_COND_PATTERN, R7);
        match self.command(0, if_cond).await {
            Ok(response) => {
                sd2 = true;
                let v = response.value();
                if v & IF_COND_PATTERN_MASK != IF_COND_PATTERN {
                    log::warn!("sdcard: check pattern mismatch");
                    return Err(Error::ProtocolError);
                }
                if v & IF_COND_VOLTAGE_MASK != IF_COND_VOLTAGE {
                    log::warn!("sdcard: voltage not supported");
                    return Err(Error::Unsupported);
                }
            }
            // No response can also show up as an error.
            Err(CommandError::Timeout) | Err(CommandError::Host(_)) => {
                self.command(0, Command::new(CMD_GO_IDLE, 0, R0))
                    .await
                    .map_err(|err| self.fail("reset failed", err))?;
            }
            Err(err) => return Err(self.fail("voltage exchange failed", err)),
        }

        // Cards power up after having agreed on the voltage, and indicate whether they are
        // high capacity.
        let mut tries = 0;
        let sdhc = loop {
            let mut arg = OCR_VOLTAGE_WINDOW;
            if sd2 {
                arg |= OCR_HIGH_CAPACITY;
            }
            let ocr = match self
                .command(0, Command::app(ACMD_SD_SEND_OP_COND, arg, R3))
                .await
            {
                Ok(response) => response.value(),
                Err(CommandError::Timeout) if !sd2 => {
                    // MMC cards don't reply. They would need CMD1 instead.
                    log::warn!("sdcard: possibly mmc card, not supported");
                    return Err(Error::Unsupported);
                }
                Err(err) => return Err(self.fail("exchange voltage/sdhc support info", err)),
            };

            if ocr & OCR_VOLTAGE_WINDOW == 0 {
                log::warn!("sdcard: voltage not supported");
                return Err(Error::Unsupported);
            }
            if ocr & OCR_READY != 0 {
                break ocr & OCR_HIGH_CAPACITY != 0;
            }
            if tries >= 100 {
                log::warn!("sdcard: card failed to power up");
                return Err(Error::Timeout);
            }
            tries += 1;
            self.access.delay(Duration::from_millis(tries)).await;
        };
        if self.debug() {
            log::debug!("sdcard: powered up, sd2 {}, sdhc {}", sd2, sdhc);
        }

        let response = self
            .command(0, Command::new(CMD_ALL_SEND_CID, 0, R2))
            .await
            .map_err(|err| self.fail("card identification", err))?;
        let cid = Cid::parse(response.register()).map_err(|err| {
            log::warn!("sdcard: bad cid register");
            err
        })?;

        let mut tries = 0;
        let rca = loop {
            let v = self
                .command(0, Command::new(CMD_SEND_RELATIVE_ADDR, 0, R6))
                .await
                .map_err(|err| self.fail("getting relative address", err))?
                .value();
            let rca = (v >> 16) as u16;
            if self.debug() {
                log::debug!("sdcard: rca {:#x}, state {}", rca, state_name(v));
            }
            if rca != 0 {
                break rca;
            }
            if tries == 10 {
                log::warn!("sdcard: card insists on invalid rca 0");
                return Err(Error::ProtocolError);
            }
            tries += 1;
        };

        let response = self
            .command(rca, Command::new(CMD_SEND_CSD, u32::from(rca) << 16, R2))
            .await
            .map_err(|err| self.fail("get csd", err))?;
        let csd = Csd::parse(response.register()).map_err(|err| {
            log::warn!("sdcard: bad csd register");
            err
        })?;
        if self.debug() {
            log::debug!(
                "sdcard: csd version {}, size {} bytes, block length {}",
                csd.version,
                csd.capacity(),
                csd.block_len()
            );
        }

        if sdhc {
            self.modify(HOST_CTL_OFFSET, |v| v | HOST_HIGH_SPEED);
            self.set_clock(50_000_000).await;
        } else {
            self.set_clock(25_000_000).await;
        }

        self.command(rca, Command::new(CMD_SELECT_CARD, u32::from(rca) << 16, R1b))
            .await
            .map_err(|err| self.fail("selecting card", err))?;
        // TODO: check in the SCR register whether the card supports the 4-bit bus
        self.command(rca, Command::app(ACMD_SET_BUS_WIDTH, 1 << 1, R1))
            .await
            .map_err(|err| self.fail("setting buswidth to 4-bit", err))?;
        self.command(rca, Command::new(CMD_SET_BLOCKLEN, BLOCK_LEN as u32, R1))
            .await
            .map_err(|err| self.fail("setting 512 byte blocksize", err))?;

        Ok(Card {
            sd2,
            sdhc,
            rca,
            cid,
            csd,
        })
    }

    /// Sends a command, preceded with `CMD_APP` if it is application-specific.
    async fn command(&self, rca: u16, cmd: Command<'_, A>) -> Result<Response, CommandError> {
        if self.debug() {
            log::debug!(
                "sdcard: {}cmd {}, arg {:#x}",
                if cmd.app { "a" } else { "" },
                cmd.index,
                cmd.arg
            );
        }

        if cmd.app {
            let prefix = Command::new(CMD_APP, u32::from(rca) << 16, R1);
            let status = self.exchange(&prefix).await?.value();
            if status & STATUS_APP_CMD == 0 {
                return Err(CommandError::BadStatus(status));
            }
        }

        self.exchange(&cmd).await
    }

    /// Sends a single command and waits for its completion.
    async fn exchange(&self, cmd: &Command<'_, A>) -> Result<Response, CommandError> {
        let mut tries = 0;
        while self.read(HOST_STATE_OFFSET) & (HOST_CMD_INHIBIT | HOST_CARD_BUSY) != 0 {
            if tries >= 50 {
                return Err(CommandError::CardBusy);
            }
            tries += 1;
            self.access.delay(Duration::from_millis(tries)).await;
        }

        self.write(STATUS_OFFSET, !0);
        self.write(ERR_STATUS_OFFSET, !0);
        self.write(ACMD12_STATUS_OFFSET, !0);

        self.write(ARG_LO_OFFSET, cmd.arg & 0xffff);
        self.write(ARG_HI_OFFSET, cmd.arg >> 16);

        let mut options = CMD_UNEXPECTED_RESP | cmd.response.command_bits();
        let mut mode = 0;
        if let Some(transfer) = &cmd.transfer {
            let address = transfer.buffer.address();
            self.write(DMA_ADDR_LO_OFFSET, (address & 0xffff) as u32);
            self.write(DMA_ADDR_HI_OFFSET, ((address >> 16) & 0xffff) as u32);
            self.write(BLOCK_SIZE_OFFSET, transfer.block_size);
            self.write(BLOCK_COUNT_OFFSET, transfer.blocks);

            options |= CMD_DATA_PRESENT;
            match transfer.direction {
                Direction::ToHost => {
                    mode |= XFER_TO_HOST;
                    options |= CMD_DATA_CRC_CHECK;
                }
                Direction::ToCard => mode |= XFER_DATA_WRITE,
            }
        }
        if cmd.multi_block {
            mode |= XFER_AUTO_CMD12;
            self.write(ACMD12_ARG_LO_OFFSET, 0);
            self.write(ACMD12_ARG_HI_OFFSET, 0);
            self.write(
                ACMD12_INDEX_OFFSET,
                ACMD12_CHECK_BUSY
                    | ACMD12_CHECK_INDEX
                    | u32::from(CMD_STOP_TRANSMISSION) << ACMD12_INDEX_SHIFT,
            );
        }
        self.write(XFER_MODE_OFFSET, mode);
        self.write(
            CMD_OFFSET,
            u32::from(cmd.index) << CMD_INDEX_SHIFT | options,
        );

        // Data commands are done when the DMA transfer is, other commands when the response
        // has been received.
        let need = if cmd.transfer.is_some() {
            ST_DMA_INTR
        } else {
            ST_CMD_COMPLETE
        };
        let wanted = need | ST_UNEXPECTED_RESP | ST_ERROR;
        self.write(STATUS_IRQ_OFFSET, wanted);
        self.write(ERR_STATUS_IRQ_OFFSET, !0);

        let wait = self
            .irq_wait
            .wait_for(|| self.read(STATUS_OFFSET) & wanted != 0);
        let _ = sync::timeout(&self.access, COMMAND_TIMEOUT, wait).await;
        self.write(STATUS_IRQ_OFFSET, 0);
        self.write(ERR_STATUS_IRQ_OFFSET, 0);

        let status = self.read(STATUS_OFFSET);
        if status & (ST_UNEXPECTED_RESP | ST_ERROR) != 0 {
            let est = self.read(ERR_STATUS_OFFSET);
            if est & EST_CMD_TIMEOUT != 0 {
                return Err(CommandError::Timeout);
            }
            return Err(CommandError::Host(est));
        }
        if status & need == 0 {
            return Err(CommandError::Timeout);
        }

        if cmd.response == R0 {
            return Ok(Response::default());
        }
        let mut regs = [0; 8];
        for (n, reg) in regs.iter_mut().enumerate() {
            *reg = self.read(RESP_OFFSET + n as u64 * 4) as u16;
        }
        let response = Response::from_registers(cmd.response, &regs);
        if cmd.response.has_status() && response.value() & STATUS_BAD != 0 {
            return Err(CommandError::BadStatus(response.value()));
        }
        Ok(response)
    }

    /// Reads or writes blocks. Transfers everything or fails.
    async fn transfer(&self, mut io: Io<'_>, offset: u64) -> Result<usize, Error> {
        let len = io.len();
        if offset % BLOCK_LEN != 0 || len as u64 % BLOCK_LEN != 0 {
            return Err(Error::BadArgument);
        }
        let (index, direction) = if io.is_write() {
            (CMD_WRITE_MULTIPLE, Direction::ToCard)
        } else {
            (CMD_READ_MULTIPLE, Direction::ToHost)
        };

        let mut done = 0;
        while done < len {
            let n = (len - done).min(MAX_CHUNK_LEN);
            let buffer = DmaBuffer::new(self.access.clone(), n, 4)?;
            if let Io::Write(data) = &io {
                buffer.write(0, &data[done..done + n]);
            }

            // The lock is released between chunks, to give others a chance.
            let guard = self.card.lock().await;
            let card = guard.as_ref().ok_or(Error::NoDisk)?;
            let address = card.address(offset + done as u64)?;

            if io.is_write() && self.preerase.load(Ordering::Relaxed) {
                let blocks = (n as u64 / BLOCK_LEN) as u32;
                self.command(card.rca, Command::app(ACMD_SET_WR_BLK_ERASE_COUNT, blocks, R1))
                    .await
                    .map_err(|err| self.fail("erase before write", err))?;
            }
            let cmd = Command::new(index, address, R1).with_blocks(&buffer, direction);
            self.command(card.rca, cmd)
                .await
                .map_err(|err| self.fail("io", err))?;
            drop(guard);

            if let Io::Read(dest) = &mut io {
                buffer.read(0, &mut dest[done..done + n]);
            }
            done += n;
        }

        Ok(len)
    }

    /// Erases `len` bytes starting at `offset`. Both must be multiples of the block length.
    pub async fn erase(&self, offset: u64, len: u64) -> Result<(), Error> {
        if offset % BLOCK_LEN != 0 || len % BLOCK_LEN != 0 || len == 0 {
            return Err(Error::BadArgument);
        }

        let guard = self.card.lock().await;
        let card = guard.as_ref().ok_or(Error::NoDisk)?;
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= card.size())
            .ok_or(Error::BadArgument)?;

        // The address of the end is inclusive.
        let first = card.address(offset)?;
        let last = if card.sdhc {
            card.address(end - BLOCK_LEN)?
        } else {
            card.address(end - 1)?
        };

        for &(index, arg, response) in &[
            (CMD_ERASE_START, first, R1),
            (CMD_ERASE_END, last, R1),
            (CMD_ERASE, 0, R1b),
        ] {
            self.command(card.rca, Command::new(index, arg, response))
                .await
                .map_err(|err| self.fail("erase", err))?;
        }
        Ok(())
    }

    /// Returns the text describing the card.
    pub async fn read_control(&self) -> Result<String, Error> {
        let guard = self.card.lock().await;
        let card = guard.as_ref().ok_or(Error::NoDisk)?;

        let mut out = String::new();
        let _ = writeln!(out, "debug {}", self.debug.load(Ordering::Relaxed));
        let _ = writeln!(out, "preerase {}", self.preerase.load(Ordering::Relaxed) as u8);
        card.write_description(&mut out);
        Ok(out)
    }

    /// Executes a control command: `debug <level>`, `preerase <0|1>` or
    /// `erase <offset> <length>`.
    pub async fn write_control(&self, line: &str) -> Result<(), Error> {
        let fields = ctl::tokenize(line)?;
        match fields.first().map(|f| f.as_str()) {
            Some("debug") => {
                ctl::expect_fields(&fields, 2)?;
                let level = ctl::parse_number(&fields[1])?;
                let level = u32::try_from(level).map_err(|_| Error::BadArgument)?;
                self.debug.store(level, Ordering::Relaxed);
                Ok(())
            }
            Some("preerase") => {
                ctl::expect_fields(&fields, 2)?;
                let enabled = ctl::parse_number(&fields[1])? != 0;
                self.preerase.store(enabled, Ordering::Relaxed);
                Ok(())
            }
            Some("erase") => {
                ctl::expect_fields(&fields, 3)?;
                let offset = ctl::parse_number(&fields[1])?;
                let len = ctl::parse_number(&fields[2])?;
                self.erase(offset, len).await
            }
            _ => Err(Error::BadCommand),
        }
    }

    /// Logs a failed command and turns it into an [`Error`].
    fn fail(&self, what: &str, err: CommandError) -> Error {
        match err.flags() {
            Some(flags) => log::warn!("sdcard: {}: {}:{}", what, err, flags),
            None => log::warn!("sdcard: {}: {}", what, err),
        }
        err.into()
    }

    fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed) != 0
    }

    fn read(&self, offset: u64) -> u32 {
        unsafe { self.access.read_register(self.base + offset) }
    }

    fn write(&self, offset: u64, value: u32) {
        unsafe { self.access.write_register(self.base + offset, value) }
    }

    fn modify(&self, offset: u64, f: impl FnOnce(u32) -> u32) {
        let value = self.read(offset);
        self.write(offset, f(value));
    }
}

impl<A> Backend for SdController<A>
where
    A: HwAccess + Clone,
{
    fn devtype(&self) -> &str {
        "sdcard"
    }

    fn init(&self) -> BoxFuture<Result<(), Error>> {
        async move {
            self.init_host().await;
            Ok(())
        }
        .boxed()
    }

    fn devinit(&self) -> BoxFuture<Result<Geometry, Error>> {
        async move {
            let mut guard = self.card.lock().await;
            self.reset_host(&mut guard).await;
            let card = self.probe().await?;
            if self.debug() {
                log::debug!("sdcard: {:?}", card);
            }

            let geometry = Geometry {
                size: card.size(),
                align_mask: BLOCK_LEN - 1,
                descr: card.to_string(),
            };
            *guard = Some(card);
            Ok(geometry)
        }
        .boxed()
    }

    fn io<'a>(&'a self, io: Io<'a>, offset: u64) -> BoxFuture<'a, Result<usize, Error>> {
        self.transfer(io, offset).boxed()
    }

    fn rctl(&self) -> BoxFuture<Result<String, Error>> {
        self.read_control().boxed()
    }

    fn wctl<'a>(&'a self, cmd: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        self.write_control(cmd).boxed()
    }
}

impl<A: HwAccess> fmt::Debug for SdController<A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SdController")
            .field("base", &format_args!("{:#x}", self.base))
            .finish()
    }
}

/// Returns the name of the state found in a card status.
fn state_name(status: u32) -> &'static str {
    STATE_NAMES
        .get(((status >> STATUS_STATE_SHIFT) & 0xf) as usize)
        .copied()
        .unwrap_or("?")
}

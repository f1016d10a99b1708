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
    identify::Identity,
    registers::*,
    request::{
        encode_prds, response_tag, DataLocation, Request, MAX_DIRECT_SECTORS, MAX_PRDS,
        MAX_TRANSFER_LEN, PRD_SEGMENT_LEN, PRD_SIZE, REQUEST_SIZE, RESPONSE_SIZE, RING_LEN,
    },
    tags::{Outcome, TagPool, TagSlot},
};

use alloc::{
    string::{String, ToString as _},
    vec::Vec,
};
use blockstore_core::{
    ctl,
    sync::{self, EventQueue, WaitQueue},
    Backend, DmaBuffer, Error, Geometry, HwAccess, Io,
};
use core::{
    convert::TryFrom as _,
    fmt::{self, Write as _},
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
    time::Duration,
};
use futures::{
    future::{self, BoxFuture, FutureExt as _},
    lock::{Mutex, MutexGuard},
};
use spinning_top::Spinlock;

#[cfg(test)]
mod tests;

/// Maximum time a queued command can take.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(60);

// Actions of the recovery task.
const KICK_RESET: u32 = 1 << 0;
const KICK_IDENTIFY: u32 = 1 << 1;

// State of the PIO command in progress.
const ATA_PENDING: u8 = 0;
const ATA_DONE: u8 = 1;
const ATA_FAILED: u8 = 2;

/// Configuration of a [`SataController`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Physical address of the registers of the host controller.
    pub hc_base: u64,
    /// Physical address of the registers of the port.
    pub port_base: u64,
    /// Frequency of the clock driving the controller, in Hz.
    pub clock_hz: u32,
    /// Initial debug level. Can be changed later with the `debug` control command.
    pub debug: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hc_base: 0xf108_0000,
            port_base: 0xf108_4000,
            clock_hz: 200_000_000,
            debug: 0,
        }
    }
}

/// Event recorded by [`SataController::on_interrupt`].
#[derive(Debug)]
enum Event {
    /// New entries are available in the response ring.
    QueueDone,
    /// The PIO command in progress has finished.
    DeviceDone,
    /// The controller reported errors.
    Error { cause: u32, serror: u32 },
}

#[derive(Debug, Default)]
struct Stats {
    serror: AtomicU64,
    completed: AtomicU64,
    aborts: AtomicU64,
    resets: AtomicU64,
}

/// State protected by the queue lock.
#[derive(Debug)]
struct QueueState {
    /// Index of the next entry of the request ring to fill.
    request_next: usize,
}

/// Driver for one port of a SATA host controller, with native command queuing.
///
/// Reads and writes are issued as queued commands. Other commands, such as IDENTIFY DEVICE,
/// are PIO commands that can only be issued while no queued command is in progress.
///
/// The [`SataController::run`] future must be polled continuously, and
/// [`SataController::on_interrupt`] must be called whenever the controller raises an
/// interrupt.
pub struct SataController<A: HwAccess> {
    access: A,
    hc_base: u64,
    port_base: u64,
    clock_hz: u32,
    debug: AtomicU32,

    requests: DmaBuffer<A>,
    responses: DmaBuffer<A>,
    /// One PRD table per tag.
    prds: DmaBuffer<A>,
    requests_address: u32,
    responses_address: u32,

    /// Locked while issuing a queued command, and for the whole duration of a PIO command.
    queue: Mutex<QueueState>,
    tags: Spinlock<TagPool>,
    tag_slots: Vec<TagSlot>,
    /// Data buffer of the command using each tag. Freed when the tag is released, which is
    /// not necessarily done by the issuer.
    buffers: Spinlock<Vec<Option<DmaBuffer<A>>>>,
    /// Woken up whenever a tag is released.
    tags_released: WaitQueue,
    /// Index of the next entry of the response ring to process.
    response_next: Spinlock<usize>,

    events: EventQueue<Event>,
    ata_done: AtomicU8,
    /// Set when the device has updated its shadow registers.
    ata_regs: AtomicBool,
    ata_wait: WaitQueue,

    /// Set between an unrecoverable error and the end of the link reset that follows. No
    /// tag is handed out in the meantime.
    recovering: AtomicBool,
    /// Pending `KICK_*` actions.
    kicks: AtomicU32,
    kick_wait: WaitQueue,

    /// Device currently attached, if it has been identified.
    identity: Spinlock<Option<Identity>>,
    /// Incremented whenever `identity` is cleared.
    generation: AtomicU64,
    /// Value of `generation` when the device was last identified through [`Backend::devinit`].
    ready_generation: AtomicU64,
    stats: Stats,
}

/// Registers of the task file of a PIO command.
#[derive(Debug, Default, Copy, Clone)]
struct TaskFile {
    command: u8,
    features: u8,
    sectors: u8,
    lba: u32,
    device: u8,
}

impl TaskFile {
    fn new(command: u8) -> Self {
        TaskFile {
            command,
            ..Default::default()
        }
    }
}

/// Data phase of a PIO command.
enum PioData<'a> {
    None,
    FromDevice(&'a mut [u8; 512]),
}

/// Proof that the queue is idle and that PIO commands can be issued.
struct Claim<'a, A: HwAccess> {
    controller: &'a SataController<A>,
    queue: MutexGuard<'a, QueueState>,
}

impl<'a, A: HwAccess> Drop for Claim<'a, A> {
    fn drop(&mut self) {
        self.controller
            .modify_port(FIS_INTR_ENABLE_OFFSET, |v| v & !FIS_D2H_REGISTER);
    }
}

impl<A: HwAccess> SataController<A> {
    fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed) != 0
    }

    fn read_hc(&self, offset: u64) -> u32 {
        unsafe { self.access.read_register(self.hc_base + offset) }
    }

    fn write_hc(&self, offset: u64, value: u32) {
        unsafe { self.access.write_register(self.hc_base + offset, value) }
    }

    fn read_port(&self, offset: u64) -> u32 {
        unsafe { self.access.read_register(self.port_base + offset) }
    }

    fn write_port(&self, offset: u64, value: u32) {
        unsafe { self.access.write_register(self.port_base + offset, value) }
    }

    fn modify_port(&self, offset: u64, f: impl FnOnce(u32) -> u32) {
        let value = self.read_port(offset);
        self.write_port(offset, f(value));
    }
}

impl<A> SataController<A>
where
    A: HwAccess + Clone,
{
    /// Allocates the rings and puts the controller in a known state, with interrupts
    /// disabled. Call [`SataController::init_controller`] afterwards.
    ///
    /// # Safety
    ///
    /// The registers described by `config` must belong to a SATA host controller, and
    /// nothing else must access this port.
    pub unsafe fn new(access: A, config: Config) -> Result<Self, Error> {
        let requests = DmaBuffer::zeroed(
            access.clone(),
            RING_LEN * REQUEST_SIZE,
            RING_LEN * REQUEST_SIZE,
        )?;
        let responses = DmaBuffer::zeroed(
            access.clone(),
            RING_LEN * RESPONSE_SIZE,
            RING_LEN * RESPONSE_SIZE,
        )?;
        let prds = DmaBuffer::zeroed(access.clone(), RING_LEN * MAX_PRDS * PRD_SIZE, PRD_SIZE)?;
        let requests_address = dma_address(&requests)?;
        let responses_address = dma_address(&responses)?;

        let controller = SataController {
            access,
            hc_base: config.hc_base,
            port_base: config.port_base,
            clock_hz: config.clock_hz,
            debug: AtomicU32::new(config.debug),
            requests,
            responses,
            prds,
            requests_address,
            responses_address,
            queue: Mutex::new(QueueState { request_next: 0 }),
            tags: Spinlock::new(TagPool::new(1)),
            tag_slots: (0..RING_LEN).map(|_| TagSlot::default()).collect(),
            buffers: Spinlock::new((0..RING_LEN).map(|_| None).collect()),
            tags_released: WaitQueue::new(),
            response_next: Spinlock::new(0),
            events: EventQueue::new(),
            ata_done: AtomicU8::new(ATA_DONE),
            ata_regs: AtomicBool::new(false),
            ata_wait: WaitQueue::new(),
            recovering: AtomicBool::new(false),
            kicks: AtomicU32::new(0),
            kick_wait: WaitQueue::new(),
            identity: Spinlock::new(None),
            generation: AtomicU64::new(0),
            ready_generation: AtomicU64::new(0),
            stats: Stats::default(),
        };

        controller.hardware_reset();
        Ok(controller)
    }

    fn hardware_reset(&self) {
        // Disable interrupts.
        self.write_hc(HC_MAIN_INTR_MASK_OFFSET, 0);
        self.write_port(EDMA_INTR_ERR_MASK_OFFSET, 0);
        self.write_port(SERROR_INTR_ENABLE_OFFSET, 0);
        self.write_port(FIS_INTR_ENABLE_OFFSET, 0);

        self.modify_port(EDMA_CMD_OFFSET, |v| (v & !EDMA_ENABLE) | EDMA_ABORT);

        // Clear interrupts.
        self.write_hc(HC_INTR_OFFSET, 0);
        self.write_port(EDMA_INTR_ERR_CAUSE_OFFSET, 0);
        self.write_port(SERROR_OFFSET, !0);
        self.write_port(FIS_INTR_OFFSET, 0);

        // Clear the phy shutdown bit.
        self.modify_port(IFC_CFG_OFFSET, |v| v & !(1 << 9));

        // Mbus arbiter timeout of 0xff, no byte swapping, arbiter timer disabled.
        self.write_hc(
            HC_CFG_OFFSET,
            0xff | 1 << 8 | 1 << 9 | 1 << 10 | 1 << 16,
        );
        // No interrupt coalescing.
        self.write_hc(HC_INTR_COALESCING_OFFSET, 0);
        self.write_hc(HC_INTR_TIME_OFFSET, 0);

        // IORDY timeout of 1250ns, in clock ticks.
        let ticks = (u64::from(self.clock_hz) * 1250 + 999_999_999) / 1_000_000_000;
        self.write_port(EDMA_IORDY_TIMEOUT_OFFSET, ticks as u32);
        self.write_port(EDMA_CMD_DELAY_THR_OFFSET, 0);
    }

    /// Resets the queue, enables interrupts, then resets the link.
    ///
    /// Commands in progress are not aborted; the `reset` control command does that.
    pub async fn init_controller(&self) -> Result<(), Error> {
        let mut claim = self.claim().await;

        self.tags.lock().reset(1);

        self.modify_port(EDMA_CMD_OFFSET, |v| (v & !EDMA_ENABLE) | EDMA_ABORT);
        self.write_port(EDMA_REQ_BASE_HI_OFFSET, 0);
        self.write_port(EDMA_RESP_BASE_HI_OFFSET, 0);
        self.write_port(EDMA_REQ_IN_OFFSET, self.requests_address);
        self.write_port(EDMA_REQ_OUT_OFFSET, self.requests_address);
        self.write_port(EDMA_RESP_IN_OFFSET, self.responses_address);
        self.write_port(EDMA_RESP_OUT_OFFSET, self.responses_address);
        claim.queue.request_next = 0;
        *self.response_next.lock() = 0;

        // Among others, we want "device connected" interrupts.
        self.write_hc(HC_MAIN_INTR_MASK_OFFSET, MAIN_SATA_ERR | MAIN_SATA_DONE);
        self.write_hc(HC_INTR_OFFSET, 0);
        self.write_port(EDMA_INTR_ERR_CAUSE_OFFSET, 0);
        self.write_port(EDMA_INTR_ERR_MASK_OFFSET, !ERR_LINK_TX_CTL);
        self.write_port(SERROR_OFFSET, !0);
        self.write_port(SERROR_INTR_ENABLE_OFFSET, SERROR_N | SERROR_X);
        self.write_port(FIS_INTR_ENABLE_OFFSET, 0);
        self.write_port(FIS_CFG_OFFSET, 0);

        self.kicks.store(0, Ordering::SeqCst);
        self.reset_link(&claim).await;
        Ok(())
    }

    /// Returns the device attached to the port, if it has been identified.
    pub fn identity(&self) -> Option<Identity> {
        self.identity.lock().clone()
    }

    /// Reacts to an interrupt raised by the controller.
    ///
    /// Only acknowledges the interrupt. The actual processing is done by
    /// [`SataController::run`].
    pub fn on_interrupt(&self) {
        let main = self.read_hc(HC_MAIN_INTR_OFFSET);

        if main & MAIN_SATA_ERR != 0 {
            let cause = self.read_port(EDMA_INTR_ERR_CAUSE_OFFSET);
            let serror = if cause & ERR_SERROR != 0 {
                let serror = self.read_port(SERROR_OFFSET);
                self.write_port(SERROR_OFFSET, !0);
                serror
            } else {
                0
            };
            if cause & ERR_TRANSPORT_INTR != 0 {
                self.write_port(FIS_INTR_OFFSET, 0);
            }
            self.write_port(EDMA_INTR_ERR_CAUSE_OFFSET, 0);
            self.events.push(Event::Error { cause, serror });
        }

        if main & MAIN_SATA_DONE != 0 {
            let hc = self.read_hc(HC_INTR_OFFSET);
            if hc & HC_DMA_DONE != 0 {
                self.write_hc(HC_INTR_OFFSET, !HC_DMA_DONE);
                self.events.push(Event::QueueDone);
            }
            if hc & HC_DEVICE_INTR != 0 {
                // Reading the status acknowledges the interrupt on the device side.
                let _ = self.ata_status();
                self.write_hc(HC_INTR_OFFSET, !HC_DEVICE_INTR);
                self.events.push(Event::DeviceDone);
            }
        }
    }

    /// Processes the events recorded by [`SataController::on_interrupt`], and performs the
    /// resets and identifications that they require.
    ///
    /// Never returns.
    pub async fn run(&self) {
        future::join(self.process_events(), self.recovery()).await;
    }

    async fn process_events(&self) {
        loop {
            match self.events.next().await {
                Event::QueueDone => self.drain_responses(),
                Event::DeviceDone => {
                    let _ = self.ata_done.compare_exchange(
                        ATA_PENDING,
                        ATA_DONE,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    self.ata_wait.wake_all();
                }
                Event::Error { cause, serror } => self.handle_error(cause, serror),
            }
        }
    }

    /// Completes the tags found in the response ring.
    fn drain_responses(&self) {
        let mut next = self.response_next.lock();
        let hw_next = (self.read_port(EDMA_RESP_IN_OFFSET) & 0xff) as usize / RESPONSE_SIZE;

        while *next != hw_next {
            let mut entry = [0; RESPONSE_SIZE];
            self.responses.read(*next * RESPONSE_SIZE, &mut entry);
            let tag = response_tag(&entry);
            if self.debug() {
                log::debug!("sata: tag {} done", tag);
            }
            self.complete_tag(tag, Outcome::Done);

            *next = (*next + 1) % RING_LEN;
            self.write_port(
                EDMA_RESP_OUT_OFFSET,
                self.responses_address + (*next * RESPONSE_SIZE) as u32,
            );
        }
    }

    fn handle_error(&self, cause: u32, serror: u32) {
        if self.debug() {
            log::debug!("sata: error cause {:#010x}", cause);
        }

        if cause & ERR_FATAL_MASK != 0 {
            log::warn!("sata: link error {:#010x}, resetting", cause);
            self.abort_queue();
            self.kick(KICK_RESET);
        } else if cause & ERR_DEVICE_ERROR != 0 {
            log::warn!("sata: device reported an error");
            // The queue is enabled again by the next command.
            self.stop_queue();
            self.abort_all();
        }

        if cause & ERR_DEVICE_CONNECT != 0 {
            log::info!("sata: device connected");
            self.kick(KICK_IDENTIFY);
        }

        if cause & ERR_SERROR != 0 {
            if self.debug() {
                log::debug!("sata: serror {:#010x}", serror);
            }
            self.stats.serror.fetch_add(1, Ordering::Relaxed);
        }

        if cause & ERR_SELF_DISABLE != 0 {
            log::error!("sata: edma disabled itself");
            self.abort_queue();
            self.kick(KICK_RESET);
        }

        if cause & ERR_TRANSPORT_INTR != 0 {
            self.ata_regs.store(true, Ordering::SeqCst);
            self.ata_wait.wake_all();
        }
    }

    /// Stops handing out tags until the next link reset.
    fn suspend_queue(&self) {
        self.recovering.store(true, Ordering::SeqCst);
        self.tags_released.wake_all();
    }

    /// Drops the commands that the queue engine is processing.
    fn stop_queue(&self) {
        self.modify_port(EDMA_CMD_OFFSET, |v| v | EDMA_ABORT);
    }

    /// Stops the queue engine and fails all the commands in progress. Their tags can't be
    /// reused before the link has been reset.
    fn abort_queue(&self) {
        self.suspend_queue();
        self.stop_queue();
        self.abort_all();
    }

    /// Fails all the commands in progress, queued or not.
    fn abort_all(&self) {
        for (tag, slot) in self.tag_slots.iter().enumerate() {
            if slot.complete(Outcome::Failed) {
                self.release_tag(tag as u8);
            }
        }

        let _ = self.ata_done.compare_exchange(
            ATA_PENDING,
            ATA_FAILED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.ata_wait.wake_all();
        self.stats.aborts.fetch_add(1, Ordering::Relaxed);
    }

    fn complete_tag(&self, tag: u8, outcome: Outcome) {
        let slot = match self.tag_slots.get(usize::from(tag)) {
            Some(slot) => slot,
            None => return,
        };
        if slot.complete(outcome) {
            self.release_tag(tag);
        }
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn release_tag(&self, tag: u8) {
        let buffer = self
            .buffers
            .lock()
            .get_mut(usize::from(tag))
            .and_then(|b| b.take());
        drop(buffer);
        self.tags.lock().release(tag);
        self.tags_released.wake_all();
    }

    fn kick(&self, actions: u32) {
        self.kicks.fetch_or(actions, Ordering::SeqCst);
        self.kick_wait.wake_all();
    }

    /// Performs the actions requested with `kick`. Repeated requests are merged, and a reset
    /// is always done before an identification.
    async fn recovery(&self) {
        loop {
            let kicks = &self.kicks;
            let actions = self
                .kick_wait
                .wait_until(|| match kicks.swap(0, Ordering::SeqCst) {
                    0 => None,
                    v => Some(v),
                })
                .await;

            if actions & KICK_RESET != 0 {
                let claim = self.claim().await;
                self.reset_link(&claim).await;
            }

            if actions & KICK_IDENTIFY != 0 {
                match self.claim_and_identify().await {
                    Ok(identity) => log::info!(
                        "sata: {}, {} GiB, {} Gb/s",
                        identity.model,
                        identity.size() / (1024 * 1024 * 1024),
                        if self.read_port(SSTATUS_OFFSET) & (2 << 4) != 0 {
                            "3.0"
                        } else {
                            "1.5"
                        }
                    ),
                    Err(err) => log::warn!("sata: identify failed: {}", err),
                }
            }
        }
    }

    /// Pulses the ATA reset, then resets the link. The device has to be identified again
    /// afterwards.
    async fn reset_link(&self, _claim: &Claim<'_, A>) {
        self.stats.resets.fetch_add(1, Ordering::Relaxed);
        self.forget_device();

        if self.debug() {
            log::debug!(
                "sata: ata reset, sstatus {:#x}",
                self.read_port(SSTATUS_OFFSET)
            );
        }

        self.modify_port(EDMA_CMD_OFFSET, |v| v | EDMA_ATA_RESET);
        let _ = self.read_port(EDMA_CMD_OFFSET);
        self.modify_port(EDMA_CMD_OFFSET, |v| v & !EDMA_ATA_RESET);
        self.access.delay(Duration::from_millis(200)).await;

        // Errata of the phy. Also sets the amplitude of the transmitter.
        self.modify_port(PHY_M3_OFFSET, |v| (v & !0x7810_0000) | 0x2800_0000);
        self.modify_port(PHY_M4_OFFSET, |v| (v & !1) | 1 << 16);
        self.modify_port(PHY_M9_GEN2_OFFSET, |v| (v & !0x400f) | 0x8);
        self.modify_port(PHY_M9_GEN1_OFFSET, |v| (v & !0x400f) | 0x8);
        self.access.delay(Duration::from_millis(100)).await;

        self.write_port(SERROR_OFFSET, !0);
        self.write_port(SERROR_INTR_ENABLE_OFFSET, SERROR_N | SERROR_X);

        // Raise a transport interrupt when the device updates its registers, so that PIO
        // commands can wait for the busy bit to clear.
        self.write_port(FIS_INTR_ENABLE_OFFSET, 0);
        self.write_port(FIS_CFG_OFFSET, FIS_D2H_REGISTER);

        self.write_port(
            SCONTROL_OFFSET,
            SCONTROL_DET_COMRESET | SCONTROL_IPM_NO_PARTIAL | SCONTROL_IPM_NO_SLUMBER,
        );
        let _ = self.read_port(SCONTROL_OFFSET);
        self.modify_port(SCONTROL_OFFSET, |v| v & !SCONTROL_DET_COMRESET);
        let _ = self.read_port(SCONTROL_OFFSET);

        // A "device connected" interrupt follows if something is attached.
        if self.debug() {
            log::debug!(
                "sata: link reset, sstatus {:#x}",
                self.read_port(SSTATUS_OFFSET)
            );
        }

        self.recovering.store(false, Ordering::SeqCst);
        self.tags_released.wake_all();
    }

    /// Clears the identity of the device. Commands issued for the previous one fail.
    fn forget_device(&self) {
        *self.identity.lock() = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Waits until no queued command is in progress and stops the queue engine.
    async fn claim(&self) -> Claim<'_, A> {
        let queue = self.queue.lock().await;

        let (tags, slots) = (&self.tags, &self.tag_slots);
        self.tags_released
            .wait_for(|| {
                let abandoned = slots.iter().filter(|s| s.is_abandoned()).count();
                tags.lock().in_use() == abandoned
            })
            .await;

        self.stop_queue();

        // The commands whose issuer gave up can't complete anymore.
        for (tag, slot) in self.tag_slots.iter().enumerate() {
            if slot.is_abandoned() && slot.complete(Outcome::Failed) {
                self.release_tag(tag as u8);
            }
        }

        self.modify_port(FIS_INTR_ENABLE_OFFSET, |v| v | FIS_D2H_REGISTER);
        Claim {
            controller: self,
            queue,
        }
    }

    async fn claim_and_identify(&self) -> Result<Identity, Error> {
        let claim = self.claim().await;
        self.identify(&claim).await
    }

    /// Sends IDENTIFY DEVICE and updates the state of the driver with the response.
    async fn identify(&self, claim: &Claim<'_, A>) -> Result<Identity, Error> {
        self.forget_device();

        let mut buf = [0; 512];
        self.ata_command(
            claim,
            TaskFile::new(ATA_CMD_IDENTIFY),
            PioData::FromDevice(&mut buf),
            Some(IDENTIFY_TIMEOUT),
        )
        .await?;
        if !self.ata_check(ATA_BSY | ATA_DRDY | ATA_DF | ATA_DRQ | ATA_ERR, ATA_DRDY) {
            log::warn!("sata: identify failed, status {:#x}", self.ata_status());
            return Err(Error::DeviceError);
        }

        let identity = Identity::parse(&buf)?;
        if identity.sector_size < 512 || !identity.sector_size.is_power_of_two() {
            log::warn!("sata: unsupported sector size {}", identity.sector_size);
            return Err(Error::Unsupported);
        }

        if self.debug() {
            log::debug!("sata: identified {:?}", identity);
        }

        self.tags.lock().reset(identity.queue_depth);
        *self.identity.lock() = Some(identity.clone());
        Ok(identity)
    }

    /// Writes the content of the volatile cache of the device to the media.
    pub async fn flush(&self) -> Result<(), Error> {
        let claim = self.claim().await;
        self.ata_command(
            &claim,
            TaskFile::new(ATA_CMD_FLUSH_CACHE_EXT),
            PioData::None,
            None,
        )
        .await?;
        if !self.ata_check(ATA_BSY | ATA_DRDY | ATA_DF | ATA_DRQ | ATA_ERR, ATA_DRDY) {
            log::warn!("sata: flush cache ext failed");
            return Err(Error::DeviceError);
        }
        Ok(())
    }

    /// Issues a PIO command and performs its data phase.
    ///
    /// Without a timeout, waits for as long as the device needs.
    async fn ata_command(
        &self,
        _claim: &Claim<'_, A>,
        task_file: TaskFile,
        data: PioData<'_>,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let exchange = self.ata_exchange(task_file);
        match timeout {
            Some(timeout) => sync::timeout(&self.access, timeout, exchange).await??,
            None => exchange.await?,
        }

        let status = self.ata_status();
        if status & ATA_ERR != 0 {
            if self.debug() {
                log::debug!("sata: ata command {:#x} failed", task_file.command);
            }
            return Err(Error::DeviceError);
        }
        if status & ATA_DF != 0 {
            log::warn!("sata: device fault");
            return Err(Error::DeviceError);
        }

        match data {
            PioData::None => {}
            PioData::FromDevice(buf) => {
                for word in buf.chunks_exact_mut(2) {
                    let value = self.read_port(ATA_DATA_OFFSET);
                    word[0] = (value >> 8) as u8;
                    word[1] = value as u8;
                }
            }
        }

        Ok(())
    }

    async fn ata_exchange(&self, task_file: TaskFile) -> Result<(), Error> {
        loop {
            self.ata_regs.store(false, Ordering::SeqCst);
            if self.ata_status() & ATA_BSY == 0 {
                break;
            }
            let ata_regs = &self.ata_regs;
            self.ata_wait
                .wait_for(|| ata_regs.load(Ordering::SeqCst))
                .await;
        }

        self.ata_done.store(ATA_PENDING, Ordering::SeqCst);
        self.write_port(ATA_FEATURES_OFFSET, u32::from(task_file.features));
        self.write_port(ATA_SECTORS_OFFSET, u32::from(task_file.sectors));
        self.write_port(ATA_LBA_LOW_OFFSET, task_file.lba & 0xff);
        self.write_port(ATA_LBA_MID_OFFSET, (task_file.lba >> 8) & 0xff);
        self.write_port(ATA_LBA_HIGH_OFFSET, (task_file.lba >> 16) & 0xff);
        self.write_port(ATA_DEVICE_OFFSET, u32::from(task_file.device));
        self.write_port(ATA_CMD_STATUS_OFFSET, u32::from(task_file.command));

        let ata_done = &self.ata_done;
        let outcome = self
            .ata_wait
            .wait_until(|| match ata_done.load(Ordering::SeqCst) {
                ATA_PENDING => None,
                v => Some(v),
            })
            .await;

        if outcome == ATA_DONE {
            Ok(())
        } else {
            Err(Error::DeviceError)
        }
    }

    fn ata_status(&self) -> u8 {
        self.read_port(ATA_CMD_STATUS_OFFSET) as u8
    }

    fn ata_check(&self, mask: u8, expected: u8) -> bool {
        self.ata_status() & mask == expected
    }

    /// Reads or writes with a queued command. Transfers at most [`MAX_TRANSFER_LEN`] bytes.
    async fn queued_io(&self, io: Io<'_>, offset: u64) -> Result<usize, Error> {
        let generation = self.generation.load(Ordering::SeqCst);
        let (sectors, sector_size) = match &*self.identity.lock() {
            Some(identity) => (identity.sectors, u64::from(identity.sector_size)),
            None => return Err(Error::NoDisk),
        };

        let len = io.len() as u64;
        if offset % sector_size != 0 || len % sector_size != 0 {
            return Err(Error::BadArgument);
        }
        let lba = offset / sector_size;
        if len == 0 || lba == sectors {
            return Ok(0);
        }
        if lba > sectors {
            return Err(Error::BadArgument);
        }

        let count = (len / sector_size)
            .min(MAX_TRANSFER_LEN as u64 / sector_size)
            .min(sectors - lba);
        let nbytes = (count * sector_size) as usize;

        let buffer = DmaBuffer::new(self.access.clone(), nbytes, 16)?;
        let buffer_address = u64::from(dma_address(&buffer)?);
        if let Io::Write(data) = &io {
            buffer.write(0, &data[..nbytes]);
        }

        let (tags, recovering) = (&self.tags, &self.recovering);
        let acquire = async {
            loop {
                self.tags_released
                    .wait_for(|| !recovering.load(Ordering::SeqCst))
                    .await;

                // The queue lock is given up during a recovery, as the reset needs it.
                let queue = self.queue.lock().await;
                let tag = self
                    .tags_released
                    .wait_until(|| {
                        if recovering.load(Ordering::SeqCst) {
                            Some(None)
                        } else {
                            tags.lock().take().map(Some)
                        }
                    })
                    .await;
                if let Some(tag) = tag {
                    break (queue, tag);
                }
            }
        };
        let (mut queue, tag) = sync::timeout(&self.access, COMMAND_TIMEOUT, acquire)
            .await
            .map_err(|_| Error::Busy)?;

        if self.generation.load(Ordering::SeqCst) != generation {
            drop(queue);
            self.release_tag(tag);
            return Err(Error::NoDisk);
        }

        let slot = queue.request_next;
        queue.request_next = (slot + 1) % RING_LEN;

        let data = if count <= u64::from(MAX_DIRECT_SECTORS) && nbytes <= PRD_SEGMENT_LEN {
            DataLocation::Direct(buffer_address)
        } else {
            // The tables are indexed by tag, as the request ring is reused regardless of
            // which commands are still in progress.
            let table = usize::from(tag) * MAX_PRDS * PRD_SIZE;
            for (n, prd) in encode_prds(buffer_address, nbytes).iter().enumerate() {
                self.prds.write(table + n * PRD_SIZE, prd);
            }
            DataLocation::Table(self.prds.address() + table as u64)
        };
        let request = Request {
            tag,
            write: io.is_write(),
            lba,
            sectors: count as u32,
            len: nbytes,
            data,
        };
        self.requests.write(slot * REQUEST_SIZE, &request.encode());

        let tag_slot = &self.tag_slots[usize::from(tag)];
        self.buffers.lock()[usize::from(tag)] = Some(buffer);
        tag_slot.issue();

        self.write_port(
            EDMA_REQ_IN_OFFSET,
            self.requests_address + (queue.request_next * REQUEST_SIZE) as u32,
        );
        if self.read_port(EDMA_CMD_OFFSET) & EDMA_ENABLE == 0 {
            self.enable_queue();
        }
        drop(queue);

        let wait = future::poll_fn(|cx| tag_slot.poll_outcome(cx));
        let outcome = match sync::timeout(&self.access, COMMAND_TIMEOUT, wait).await {
            Ok(outcome) => outcome,
            Err(_) => match tag_slot.abandon() {
                Some(outcome) => outcome,
                None => {
                    // The tag is released by whoever completes the command, or by the reset.
                    log::warn!("sata: command with tag {} timed out, resetting", tag);
                    self.suspend_queue();
                    self.kick(KICK_RESET);
                    return Err(Error::Timeout);
                }
            },
        };

        tag_slot.finish();
        let buffer = self.buffers.lock()[usize::from(tag)].take();
        let result = match (outcome, io, &buffer) {
            (Outcome::Done, Io::Read(dest), Some(buffer)) => {
                buffer.read(0, &mut dest[..nbytes]);
                Ok(nbytes)
            }
            (Outcome::Done, Io::Write(_), Some(_)) => Ok(nbytes),
            _ => Err(Error::DeviceError),
        };
        drop(buffer);
        self.release_tag(tag);
        result
    }

    fn enable_queue(&self) {
        self.write_port(EDMA_INTR_ERR_CAUSE_OFFSET, 0);
        self.write_hc(HC_INTR_OFFSET, 0);
        self.modify_port(EDMA_CFG_OFFSET, |v| (v & !EDMA_CFG_QUEUE) | EDMA_CFG_NCQ);
        self.write_port(FIS_INTR_OFFSET, 0);
        self.write_port(EDMA_CMD_OFFSET, EDMA_ENABLE);
        let _ = self.read_port(EDMA_CMD_OFFSET);
    }

    /// Returns the text describing the device.
    pub fn read_control(&self) -> Result<String, Error> {
        let identity = self.identity().ok_or(Error::NoDisk)?;

        let mut out = String::new();
        let _ = writeln!(out, "inquiry '' {}", ctl::quote(&identity.model));
        let _ = writeln!(
            out,
            "config serial {} firmware {}",
            ctl::quote(&identity.serial),
            ctl::quote(&identity.firmware)
        );
        let _ = writeln!(out, "geometry {} {}", identity.sectors, identity.sector_size);
        let _ = writeln!(out, "part data 0 {}", identity.sectors);
        let _ = writeln!(out, "debug {}", self.debug.load(Ordering::Relaxed));
        let _ = writeln!(out, "ntags {}", self.tags.lock().depth());
        let _ = writeln!(out, "wwn {:016x}", identity.wwn);
        let _ = writeln!(out, "rpm {}", identity.rpm);
        let _ = writeln!(
            out,
            "stats serror {} completed {} aborts {} resets {}",
            self.stats.serror.load(Ordering::Relaxed),
            self.stats.completed.load(Ordering::Relaxed),
            self.stats.aborts.load(Ordering::Relaxed),
            self.stats.resets.load(Ordering::Relaxed)
        );
        Ok(out)
    }

    /// Executes a control command: `debug <level>`, `reset`, `identify` or `flush`.
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
            Some("reset") => {
                ctl::expect_fields(&fields, 1)?;
                self.abort_queue();
                self.init_controller().await
            }
            Some("identify") => {
                ctl::expect_fields(&fields, 1)?;
                self.claim_and_identify().await.map(|_| ())
            }
            Some("flush") => {
                ctl::expect_fields(&fields, 1)?;
                self.flush().await
            }
            _ => Err(Error::BadCommand),
        }
    }
}

impl<A> Backend for SataController<A>
where
    A: HwAccess + Clone,
{
    fn devtype(&self) -> &str {
        "sata"
    }

    fn init(&self) -> BoxFuture<Result<(), Error>> {
        self.init_controller().boxed()
    }

    fn devinit(&self) -> BoxFuture<Result<Geometry, Error>> {
        async move {
            let claim = self.claim().await;
            let identity = self.identify(&claim).await?;
            self.ready_generation
                .store(self.generation.load(Ordering::SeqCst), Ordering::SeqCst);
            drop(claim);
            Ok(Geometry {
                size: identity.size(),
                align_mask: u64::from(identity.sector_size) - 1,
                descr: identity.to_string(),
            })
        }
        .boxed()
    }

    fn io<'a>(&'a self, io: Io<'a>, offset: u64) -> BoxFuture<'a, Result<usize, Error>> {
        // The device has been reset or replaced since the disk was initialized.
        if self.ready_generation.load(Ordering::SeqCst) != self.generation.load(Ordering::SeqCst)
        {
            return future::ready(Err(Error::NoDisk)).boxed();
        }
        self.queued_io(io, offset).boxed()
    }

    fn rctl(&self) -> BoxFuture<Result<String, Error>> {
        future::ready(self.read_control()).boxed()
    }

    fn wctl<'a>(&'a self, cmd: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        self.write_control(cmd).boxed()
    }
}

impl<A: HwAccess> fmt::Debug for SataController<A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SataController")
            .field("port_base", &format_args!("{:#x}", self.port_base))
            .field("tags", &*self.tags.lock())
            .field("identity", &*self.identity.lock())
            .finish()
    }
}

/// Returns the address of `buffer`, which the controller requires to be below 4GiB.
fn dma_address<A: HwAccess>(buffer: &DmaBuffer<A>) -> Result<u32, Error> {
    u32::try_from(buffer.address()).map_err(|_| Error::OutOfMemory)
}

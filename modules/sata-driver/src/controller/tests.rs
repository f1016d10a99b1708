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

#![cfg(test)]

use super::{Config, SataController};
use crate::{identify::testing, registers::*};

use alloc::{collections::BTreeMap, sync::Arc, vec, vec::Vec};
use blockstore_core::{Error, HwAccess, Io, Registry};
use core::{
    alloc::Layout,
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll},
    time::Duration,
};
use futures::{
    executor::block_on,
    future::{self, Either},
    pin_mut,
};
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use spinning_top::Spinlock;

const MEMORY_BASE: u64 = 0x10_0000;
const MEMORY_LEN: usize = 4 * 1024 * 1024;

type Controller = SataController<Arc<Sim>>;

/// Simulation of the SATA host controller with a disk attached.
struct Sim {
    state: Spinlock<SimState>,
    /// If true, delays of one second or more are immediately over. Otherwise they never end.
    expire_timeouts: AtomicBool,
}

struct SimState {
    hc_base: u64,
    port_base: u64,
    registers: HashMap<u64, u32, FnvBuildHasher>,
    memory: Vec<u8>,
    /// Start and length of every allocation.
    allocations: BTreeMap<u64, usize>,
    disk: Vec<u8>,

    identify: [u8; 512],
    /// Data of the PIO command in progress, and the next word to read.
    pio: Option<([u8; 512], usize)>,
    status: u8,
    ata_commands: Vec<u8>,

    edma_enabled: bool,
    hc_intr: u32,
    err_cause: u32,
    req_base: u64,
    req_in: usize,
    req_out: usize,
    resp_base: u64,
    resp_in: usize,
    /// Queued commands not completed yet.
    pending: Vec<SimRequest>,
    completed: Vec<SimRequest>,
    max_in_flight: usize,
    auto_complete: bool,

    connect_on_reset: bool,
    resets: usize,
    irq: bool,
}

#[derive(Debug, Clone)]
struct SimRequest {
    tag: u8,
    write: bool,
    lba: u64,
    sectors: u32,
    segments: Vec<(u64, usize)>,
}

impl Sim {
    fn new(sectors: u64, identify: [u8; 512]) -> Self {
        let config = Config::default();
        Sim {
            state: Spinlock::new(SimState {
                hc_base: config.hc_base,
                port_base: config.port_base,
                registers: HashMap::default(),
                memory: vec![0; MEMORY_LEN],
                allocations: BTreeMap::new(),
                disk: vec![0; sectors as usize * 512],
                identify,
                pio: None,
                status: ATA_DRDY,
                ata_commands: Vec::new(),
                edma_enabled: false,
                hc_intr: 0,
                err_cause: 0,
                req_base: 0,
                req_in: 0,
                req_out: 0,
                resp_base: 0,
                resp_in: 0,
                pending: Vec::new(),
                completed: Vec::new(),
                max_in_flight: 0,
                auto_complete: false,
                connect_on_reset: false,
                resets: 0,
                irq: false,
            }),
            expire_timeouts: AtomicBool::new(false),
        }
    }

    fn take_irq(&self) -> bool {
        core::mem::replace(&mut self.state.lock().irq, false)
    }

    fn pending_tags(&self) -> Vec<u8> {
        self.state.lock().pending.iter().map(|r| r.tag).collect()
    }

    fn complete(&self, tag: u8) {
        self.state.lock().complete(tag);
    }

    fn raise_error(&self, cause: u32) {
        let mut state = self.state.lock();
        state.err_cause |= cause;
        state.irq = true;
    }

    fn resets(&self) -> usize {
        self.state.lock().resets
    }

    fn allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }
}

impl SimState {
    fn read(&mut self, address: u64) -> u32 {
        if address < self.port_base {
            return match address - self.hc_base {
                HC_MAIN_INTR_OFFSET => {
                    let mut main = 0;
                    if self.err_cause != 0 {
                        main |= MAIN_SATA_ERR;
                    }
                    if self.hc_intr & (HC_DMA_DONE | HC_DEVICE_INTR) != 0 {
                        main |= MAIN_SATA_DONE;
                    }
                    main
                }
                HC_INTR_OFFSET => self.hc_intr,
                _ => self.registers.get(&address).copied().unwrap_or(0),
            };
        }

        match address - self.port_base {
            EDMA_INTR_ERR_CAUSE_OFFSET => self.err_cause,
            EDMA_CMD_OFFSET => {
                let value = self.registers.get(&address).copied().unwrap_or(0);
                if self.edma_enabled {
                    value | EDMA_ENABLE
                } else {
                    value
                }
            }
            EDMA_RESP_IN_OFFSET => (self.resp_base + self.resp_in as u64 * 8) as u32,
            ATA_CMD_STATUS_OFFSET => {
                let drq = if self.pio.is_some() { ATA_DRQ } else { 0 };
                u32::from(self.status | drq)
            }
            ATA_DATA_OFFSET => match self.pio.take() {
                Some((data, word)) => {
                    let value = u32::from(data[word * 2]) << 8 | u32::from(data[word * 2 + 1]);
                    if word + 1 < 256 {
                        self.pio = Some((data, word + 1));
                    }
                    value
                }
                None => 0,
            },
            _ => self.registers.get(&address).copied().unwrap_or(0),
        }
    }

    fn write(&mut self, address: u64, value: u32) {
        if address < self.port_base {
            match address - self.hc_base {
                HC_INTR_OFFSET => self.hc_intr &= value,
                _ => {
                    self.registers.insert(address, value);
                }
            }
            return;
        }

        match address - self.port_base {
            EDMA_INTR_ERR_CAUSE_OFFSET => self.err_cause = value,
            EDMA_CMD_OFFSET => {
                if value & EDMA_ABORT != 0 {
                    // Commands in progress are dropped.
                    self.edma_enabled = false;
                    self.pending.clear();
                } else if value & EDMA_ENABLE != 0 {
                    self.edma_enabled = true;
                    self.process_requests();
                }
                self.registers
                    .insert(address, value & !(EDMA_ABORT | EDMA_ENABLE));
            }
            EDMA_REQ_IN_OFFSET => {
                self.req_base = u64::from(value & !0x3ff);
                self.req_in = (value & 0x3ff) as usize / 32;
                self.process_requests();
            }
            EDMA_REQ_OUT_OFFSET => self.req_out = (value & 0x3ff) as usize / 32,
            EDMA_RESP_IN_OFFSET => {
                self.resp_base = u64::from(value & !0xff);
                self.resp_in = (value & 0xff) as usize / 8;
            }
            ATA_CMD_STATUS_OFFSET => self.execute(value as u8),
            SCONTROL_OFFSET => {
                if value & SCONTROL_DET_COMRESET != 0 {
                    self.resets += 1;
                    self.pending.clear();
                    if self.connect_on_reset {
                        self.err_cause |= ERR_DEVICE_CONNECT;
                        self.irq = true;
                    }
                }
                self.registers.insert(address, value);
            }
            _ => {
                self.registers.insert(address, value);
            }
        }
    }

    fn execute(&mut self, command: u8) {
        self.ata_commands.push(command);
        match command {
            ATA_CMD_IDENTIFY => {
                self.pio = Some((self.identify, 0));
                self.status = ATA_DRDY;
            }
            ATA_CMD_FLUSH_CACHE_EXT => self.status = ATA_DRDY,
            _ => self.status = ATA_DRDY | ATA_ERR,
        }
        self.hc_intr |= HC_DEVICE_INTR;
        self.irq = true;
    }

    fn process_requests(&mut self) {
        while self.edma_enabled && self.req_out != self.req_in {
            let request = self.decode_request(self.req_base + self.req_out as u64 * 32);
            self.req_out = (self.req_out + 1) % 32;
            let tag = request.tag;
            self.pending.push(request);
            self.max_in_flight = self.max_in_flight.max(self.pending.len());
            if self.auto_complete {
                self.complete(tag);
            }
        }
    }

    fn decode_request(&self, address: u64) -> SimRequest {
        let word = |address: u64| {
            let offset = (address - MEMORY_BASE) as usize;
            let mut raw = [0; 4];
            raw.copy_from_slice(&self.memory[offset..offset + 4]);
            u32::from_le_bytes(raw)
        };
        let w = (0..8).map(|n| word(address + n * 4)).collect::<Vec<_>>();

        let tag = ((w[2] >> 17) & 0x1f) as u8;
        assert_eq!((w[2] >> 1) & 0x1f, u32::from(tag));
        assert_eq!(w[7] >> 3, u32::from(tag));
        let write = match (w[4] >> 16) & 0xff {
            0x60 => false,
            0x61 => true,
            other => panic!("unexpected command {:#x}", other),
        };
        assert_eq!(w[2] & 1 == 0, write);
        assert_eq!(w[5] >> 24, 0x40);

        let segments = if w[2] & (1 << 16) != 0 {
            let len = if w[3] == 0 { 0x10000 } else { w[3] as usize };
            vec![(u64::from(w[0]), len)]
        } else {
            let mut segments = Vec::new();
            for n in 0..8 {
                let entry = u64::from(w[0]) + n * 16;
                let flag_count = word(entry + 4);
                let len = match flag_count & 0xffff {
                    0 => 0x10000,
                    len => len as usize,
                };
                segments.push((u64::from(word(entry)), len));
                if flag_count & (1 << 31) != 0 {
                    break;
                }
            }
            segments
        };

        SimRequest {
            tag,
            write,
            lba: u64::from(w[5] & 0xff_ffff) | u64::from(w[6] & 0xff_ffff) << 24,
            sectors: (w[4] >> 24) | ((w[6] >> 24) & 0xff) << 8,
            segments,
        }
    }

    fn complete(&mut self, tag: u8) {
        let index = self
            .pending
            .iter()
            .position(|r| r.tag == tag)
            .expect("no such tag");
        let request = self.pending.remove(index);

        let mut position = request.lba as usize * 512;
        for &(address, len) in &request.segments {
            let offset = (address - MEMORY_BASE) as usize;
            if request.write {
                self.disk[position..position + len]
                    .copy_from_slice(&self.memory[offset..offset + len]);
            } else {
                self.memory[offset..offset + len]
                    .copy_from_slice(&self.disk[position..position + len]);
            }
            position += len;
        }
        assert_eq!(position, (request.lba + u64::from(request.sectors)) as usize * 512);

        let entry = (self.resp_base - MEMORY_BASE) as usize + self.resp_in * 8;
        self.memory[entry..entry + 8].copy_from_slice(&[tag, 0, 0, 0, 0, 0, 0, 0]);
        self.resp_in = (self.resp_in + 1) % 32;
        self.hc_intr |= HC_DMA_DONE;
        self.irq = true;
        self.completed.push(request);
    }

    fn alloc(&mut self, layout: Layout) -> Result<u64, ()> {
        let align = layout.align() as u64;
        let align_up = |v: u64| (v + align - 1) & !(align - 1);

        let mut candidate = align_up(MEMORY_BASE);
        for (&start, &len) in &self.allocations {
            if candidate + layout.size() as u64 <= start {
                break;
            }
            candidate = align_up(candidate.max(start + len as u64));
        }

        if candidate + layout.size() as u64 > MEMORY_BASE + MEMORY_LEN as u64 {
            return Err(());
        }
        self.allocations.insert(candidate, layout.size());
        Ok(candidate)
    }
}

unsafe impl HwAccess for Sim {
    type Delay = Either<future::Ready<()>, future::Pending<()>>;

    unsafe fn read_register(&self, address: u64) -> u32 {
        self.state.lock().read(address)
    }

    unsafe fn write_register(&self, address: u64, value: u32) {
        self.state.lock().write(address, value)
    }

    unsafe fn read_memory(&self, address: u64, dest: &mut [u8]) {
        let state = self.state.lock();
        let offset = (address - MEMORY_BASE) as usize;
        dest.copy_from_slice(&state.memory[offset..offset + dest.len()]);
    }

    unsafe fn write_memory(&self, address: u64, data: &[u8]) {
        let mut state = self.state.lock();
        let offset = (address - MEMORY_BASE) as usize;
        state.memory[offset..offset + data.len()].copy_from_slice(data);
    }

    fn alloc(&self, layout: Layout) -> Result<u64, ()> {
        self.state.lock().alloc(layout)
    }

    unsafe fn dealloc(&self, address: u64, _: Layout) {
        self.state.lock().allocations.remove(&address);
    }

    fn delay(&self, duration: Duration) -> Self::Delay {
        if duration < Duration::from_secs(1) || self.expire_timeouts.load(Ordering::SeqCst) {
            Either::Left(future::ready(()))
        } else {
            Either::Right(future::pending())
        }
    }
}

/// Future that lets the other futures of the executor run once.
struct YieldNow(bool);

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        if self.0 {
            return Poll::Ready(());
        }
        self.0 = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

fn yield_now() -> YieldNow {
    YieldNow(false)
}

async fn until(mut cond: impl FnMut() -> bool) {
    while !cond() {
        yield_now().await;
    }
}

async fn deliver_interrupts(sim: &Sim, controller: &Controller) {
    loop {
        if sim.take_irq() {
            controller.on_interrupt();
        }
        yield_now().await;
    }
}

/// Runs `fut` while delivering interrupts and running the background task of the controller.
fn run<T>(sim: &Sim, controller: &Controller, fut: impl Future<Output = T>) -> T {
    block_on(async {
        let background = future::join(deliver_interrupts(sim, controller), controller.run());
        pin_mut!(fut);
        pin_mut!(background);
        match future::select(fut, background).await {
            Either::Left((out, _)) => out,
            Either::Right(_) => unreachable!(),
        }
    })
}

fn setup_with(sectors: u64, identify: [u8; 512]) -> (Arc<Sim>, Arc<Controller>) {
    let sim = Arc::new(Sim::new(sectors, identify));
    let controller =
        Arc::new(unsafe { SataController::new(sim.clone(), Config::default()) }.unwrap());
    run(&sim, &controller, controller.init_controller()).unwrap();
    (sim, controller)
}

fn setup(sectors: u64, queue_depth: u8) -> (Arc<Sim>, Arc<Controller>) {
    setup_with(sectors, testing::response(sectors, queue_depth))
}

/// Same as `setup`, but the device has been identified.
fn identified(sectors: u64, queue_depth: u8) -> (Arc<Sim>, Arc<Controller>) {
    let (sim, controller) = setup(sectors, queue_depth);
    run(&sim, &controller, controller.claim_and_identify()).unwrap();
    (sim, controller)
}

fn fill_sector(sim: &Sim, lba: usize, value: u8) {
    let mut state = sim.state.lock();
    for b in &mut state.disk[lba * 512..][..512] {
        *b = value;
    }
}

#[test]
fn disk_init_identifies() {
    let (sim, controller) = setup(4096, 32);
    sim.state.lock().auto_complete = true;

    let registry = Registry::new();
    let disk = registry.register(1, controller.clone()).unwrap();
    run(&sim, &controller, disk.init()).unwrap();

    assert!(disk.is_ready());
    assert_eq!(disk.size(), 4096 * 512);
    assert_eq!(disk.align_mask(), 511);
    assert_eq!(
        disk.descr(),
        "WDC WD10EADS-00M2B0, serial WD-WCAV51234567, firmware 01.01A01, 4096 sectors"
    );

    let text = controller.read_control().unwrap();
    assert!(text.starts_with(
        "inquiry '' 'WDC WD10EADS-00M2B0'\n\
         config serial WD-WCAV51234567 firmware 01.01A01\n\
         geometry 4096 512\n\
         part data 0 4096\n"
    ));
    assert!(text.contains("ntags 32\n"));
    assert!(text.contains("rpm 5400\n"));
    assert_eq!(sim.state.lock().ata_commands, [ATA_CMD_IDENTIFY]);
}

#[test]
fn read_write_through_disk() {
    let (sim, controller) = identified(4096, 4);
    sim.state.lock().auto_complete = true;

    let registry = Registry::new();
    let disk = registry.register(1, controller.clone()).unwrap();
    run(&sim, &controller, disk.init()).unwrap();
    let handle = disk.open_partition(0).unwrap();

    let data = (0..300 * 1024).map(|n| (n % 253) as u8).collect::<Vec<_>>();
    assert_eq!(
        run(&sim, &controller, handle.write(&data, 8192)),
        Ok(data.len())
    );
    assert_eq!(&sim.state.lock().disk[8192..8192 + data.len()], &data[..]);

    let mut back = vec![0; data.len()];
    assert_eq!(
        run(&sim, &controller, handle.read(&mut back, 8192)),
        Ok(data.len())
    );
    assert_eq!(back, data);

    let mut small = [0; 10];
    assert_eq!(
        run(&sim, &controller, handle.read(&mut small, 8192 + 5)),
        Ok(10)
    );
    assert_eq!(&small[..], &data[5..15]);

    // The large transfers were described with a PRD table.
    let state = sim.state.lock();
    assert!(state.completed.iter().any(|r| r.segments.len() == 5));
    assert!(state.completed.iter().any(|r| r.segments.len() == 1));
}

#[test]
fn queue_depth_limits_concurrency() {
    let (sim, controller) = identified(4096, 2);
    for n in 0..3 {
        fill_sector(&sim, n * 8, n as u8 + 1);
    }

    let (mut a, mut b, mut c) = (vec![0; 512], vec![0; 512], vec![0; 512]);
    let results = run(&sim, &controller, async {
        let reads = future::join3(
            controller.queued_io(Io::Read(&mut a[..]), 0),
            controller.queued_io(Io::Read(&mut b[..]), 8 * 512),
            controller.queued_io(Io::Read(&mut c[..]), 16 * 512),
        );
        let device = async {
            until(|| sim.pending_tags().len() == 2).await;
            for _ in 0..20 {
                yield_now().await;
            }
            assert_eq!(sim.pending_tags().len(), 2);

            // Complete out of order.
            let second = sim.pending_tags()[1];
            sim.complete(second);
            until(|| sim.pending_tags().len() == 2).await;
            for tag in sim.pending_tags().into_iter().rev() {
                sim.complete(tag);
            }
        };
        future::join(reads, device).await.0
    });

    assert_eq!(results, (Ok(512), Ok(512), Ok(512)));
    assert!(a.iter().all(|b| *b == 1));
    assert!(b.iter().all(|b| *b == 2));
    assert!(c.iter().all(|b| *b == 3));
    assert_eq!(sim.state.lock().max_in_flight, 2);
    assert_eq!(controller.tags.lock().in_use(), 0);
}

#[test]
fn link_error_aborts_everything() {
    let (sim, controller) = identified(4096, 4);
    let resets = sim.resets();

    let (mut a, mut b, mut c) = (vec![0; 512], vec![0; 512], vec![0; 512]);
    let results = run(&sim, &controller, async {
        let reads = future::join3(
            controller.queued_io(Io::Read(&mut a[..]), 0),
            controller.queued_io(Io::Read(&mut b[..]), 512),
            controller.queued_io(Io::Read(&mut c[..]), 1024),
        );
        let device = async {
            until(|| sim.pending_tags().len() == 3).await;
            sim.raise_error(ERR_DEVICE_DISCONNECT);
        };
        let results = future::join(reads, device).await.0;
        until(|| sim.resets() == resets + 1).await;
        results
    });

    let failed = Err(Error::DeviceError);
    assert_eq!(results, (failed, failed, failed));
    assert_eq!(controller.tags.lock().in_use(), 0);
    assert!(controller.buffers.lock().iter().all(Option::is_none));
    assert!(controller.identity().is_none());
}

#[test]
fn device_error_without_reset() {
    let (sim, controller) = identified(4096, 4);
    let resets = sim.resets();

    let mut buf = vec![0; 512];
    let result = run(&sim, &controller, async {
        let read = controller.queued_io(Io::Read(&mut buf[..]), 0);
        let device = async {
            until(|| sim.pending_tags().len() == 1).await;
            sim.raise_error(ERR_DEVICE_ERROR);
        };
        future::join(read, device).await.0
    });
    assert_eq!(result, Err(Error::DeviceError));
    // The queue engine was stopped before the tag went back to the pool.
    assert!(sim.pending_tags().is_empty());
    assert_eq!(controller.tags.lock().in_use(), 0);

    sim.state.lock().auto_complete = true;
    assert_eq!(
        run(&sim, &controller, controller.queued_io(Io::Read(&mut buf[..]), 0)),
        Ok(512)
    );
    assert_eq!(sim.resets(), resets);
    assert!(controller.identity().is_some());
}

#[test]
fn link_status_event_counted() {
    let (sim, controller) = identified(4096, 4);

    let mut buf = vec![0; 512];
    let result = run(&sim, &controller, async {
        let read = controller.queued_io(Io::Read(&mut buf[..]), 0);
        let device = async {
            until(|| sim.pending_tags().len() == 1).await;
            sim.raise_error(ERR_SERROR);
            until(|| controller.stats.serror.load(Ordering::SeqCst) == 1).await;
            let tag = sim.pending_tags()[0];
            sim.complete(tag);
        };
        future::join(read, device).await.0
    });

    assert_eq!(result, Ok(512));
    assert!(controller
        .read_control()
        .unwrap()
        .contains("stats serror 1 "));
}

#[test]
fn timed_out_tag_released_on_completion() {
    let (sim, controller) = identified(4096, 1);
    sim.expire_timeouts.store(true, Ordering::SeqCst);

    let mut buf = vec![0; 512];
    assert_eq!(
        run(&sim, &controller, controller.queued_io(Io::Read(&mut buf[..]), 0)),
        Err(Error::Timeout)
    );
    assert_eq!(controller.tags.lock().in_use(), 1);
    assert!(controller.buffers.lock()[0].is_some());

    let allocations = sim.allocations();
    let tag = sim.pending_tags()[0];
    run(&sim, &controller, async {
        sim.complete(tag);
        until(|| controller.tags.lock().in_use() == 0).await;
    });
    assert!(controller.buffers.lock()[0].is_none());
    assert_eq!(sim.allocations(), allocations - 1);
}

#[test]
fn link_error_holds_tags_until_reset() {
    let (sim, controller) = identified(4096, 1);
    let resets = sim.resets();

    let (mut a, mut b) = (vec![0; 512], vec![0; 512]);
    let results = run(&sim, &controller, async {
        let reads = future::join(
            controller.queued_io(Io::Read(&mut a[..]), 0),
            controller.queued_io(Io::Read(&mut b[..]), 512),
        );
        let device = async {
            until(|| sim.pending_tags().len() == 1).await;
            sim.raise_error(ERR_DEVICE_DISCONNECT);
            until(|| sim.resets() == resets + 1).await;
        };
        future::join(reads, device).await.0
    });

    // The second read waited for the reset instead of reusing the tag on the broken link.
    assert_eq!(results, (Err(Error::DeviceError), Err(Error::NoDisk)));
    assert_eq!(sim.state.lock().max_in_flight, 1);
    assert!(sim.state.lock().completed.is_empty());
    assert!(sim.pending_tags().is_empty());
    assert_eq!(controller.tags.lock().in_use(), 0);
}

#[test]
fn timeout_resets_link() {
    let (sim, controller) = identified(4096, 1);
    sim.state.lock().connect_on_reset = true;
    sim.expire_timeouts.store(true, Ordering::SeqCst);
    let resets = sim.resets();

    let mut buf = vec![0; 512];
    assert_eq!(
        run(&sim, &controller, controller.queued_io(Io::Read(&mut buf[..]), 0)),
        Err(Error::Timeout)
    );
    sim.expire_timeouts.store(false, Ordering::SeqCst);

    run(&sim, &controller, async {
        until(|| sim.resets() == resets + 1).await;
        until(|| controller.identity().is_some()).await;
    });
    assert_eq!(controller.tags.lock().in_use(), 0);
    assert!(controller.buffers.lock()[0].is_none());
    assert!(sim.pending_tags().is_empty());

    sim.state.lock().auto_complete = true;
    assert_eq!(
        run(&sim, &controller, controller.queued_io(Io::Read(&mut buf[..]), 0)),
        Ok(512)
    );
}

#[test]
fn busy_when_no_tag_frees_up() {
    let (sim, controller) = identified(4096, 1);
    let resets = sim.resets();

    let (mut a, mut b) = (vec![0; 512], vec![0; 512]);
    let results = run(&sim, &controller, async {
        let first = controller.queued_io(Io::Read(&mut a[..]), 0);
        let second = async {
            until(|| sim.pending_tags().len() == 1).await;
            sim.expire_timeouts.store(true, Ordering::SeqCst);
            let result = controller.queued_io(Io::Read(&mut b[..]), 512).await;
            sim.expire_timeouts.store(false, Ordering::SeqCst);
            let tag = sim.pending_tags()[0];
            sim.complete(tag);
            result
        };
        future::join(first, second).await
    });

    assert_eq!(results, (Ok(512), Err(Error::Busy)));
    assert_eq!(sim.resets(), resets);
    assert_eq!(controller.tags.lock().in_use(), 0);
}

#[test]
fn hotplug_invalidates_disk() {
    let (sim, controller) = setup(4096, 4);
    sim.state.lock().auto_complete = true;

    let registry = Registry::new();
    let disk = registry.register(2, controller.clone()).unwrap();
    run(&sim, &controller, disk.init()).unwrap();
    let handle = disk.open_partition(0).unwrap();
    let mut buf = vec![0; 512];
    assert_eq!(run(&sim, &controller, handle.read(&mut buf, 0)), Ok(512));

    // A smaller disk takes the place of the first one.
    sim.state.lock().identify = testing::response(2048, 2);
    run(&sim, &controller, async {
        sim.raise_error(ERR_DEVICE_CONNECT);
        until(|| controller.identity().map(|id| id.sectors) == Some(2048)).await;
    });
    assert_eq!(
        run(&sim, &controller, handle.read(&mut buf, 0)),
        Err(Error::NoDisk)
    );

    run(&sim, &controller, disk.reinit()).unwrap();
    assert_eq!(disk.size(), 2048 * 512);
    assert_eq!(
        run(&sim, &controller, handle.read(&mut buf, 0)),
        Err(Error::Stale)
    );
    let handle = disk.open_partition(0).unwrap();
    assert_eq!(run(&sim, &controller, handle.read(&mut buf, 0)), Ok(512));
}

#[test]
fn bad_identify_checksum() {
    let mut response = testing::response(4096, 4);
    response[511] ^= 0x10;
    let (sim, controller) = setup_with(4096, response);

    let registry = Registry::new();
    let disk = registry.register(0, controller.clone()).unwrap();
    assert_eq!(
        run(&sim, &controller, disk.init()),
        Err(Error::ProtocolError)
    );
    assert!(!disk.is_ready());
    assert!(controller.identity().is_none());
    assert_eq!(controller.read_control(), Err(Error::NoDisk));
}

#[test]
fn requests_validated() {
    let (sim, controller) = setup(4096, 1);
    let mut buf = vec![0; 1024 * 1024];
    assert_eq!(
        run(&sim, &controller, controller.queued_io(Io::Read(&mut buf[..512]), 0)),
        Err(Error::NoDisk)
    );

    run(&sim, &controller, controller.claim_and_identify()).unwrap();
    sim.state.lock().auto_complete = true;
    run(&sim, &controller, async {
        let c = &controller;
        let result = c.queued_io(Io::Read(&mut buf[..100]), 0).await;
        assert_eq!(result, Err(Error::BadArgument));
        let result = c.queued_io(Io::Read(&mut buf[..512]), 3).await;
        assert_eq!(result, Err(Error::BadArgument));
        let result = c.queued_io(Io::Read(&mut buf[..512]), 4096 * 512).await;
        assert_eq!(result, Ok(0));
        let result = c.queued_io(Io::Read(&mut buf[..512]), 4097 * 512).await;
        assert_eq!(result, Err(Error::BadArgument));
        // Clipped to the end of the disk.
        let result = c.queued_io(Io::Read(&mut buf[..4096]), 4094 * 512).await;
        assert_eq!(result, Ok(1024));
        // At most 8 PRD entries.
        let result = c.queued_io(Io::Read(&mut buf[..]), 0).await;
        assert_eq!(result, Ok(512 * 1024));
    });
}

#[test]
fn control_commands() {
    let (sim, controller) = identified(4096, 4);

    run(&sim, &controller, controller.write_control("flush")).unwrap();
    assert_eq!(
        sim.state.lock().ata_commands.last(),
        Some(&ATA_CMD_FLUSH_CACHE_EXT)
    );

    run(&sim, &controller, controller.write_control("debug 2")).unwrap();
    assert!(controller.read_control().unwrap().contains("debug 2\n"));
    assert_eq!(
        run(&sim, &controller, controller.write_control("debug")),
        Err(Error::BadCommand)
    );
    assert_eq!(
        run(&sim, &controller, controller.write_control("eject")),
        Err(Error::BadCommand)
    );

    let resets = sim.resets();
    run(&sim, &controller, controller.write_control("reset")).unwrap();
    assert_eq!(sim.resets(), resets + 1);
    assert!(controller.identity().is_none());

    run(&sim, &controller, controller.write_control("identify")).unwrap();
    assert_eq!(controller.identity().unwrap().queue_depth, 4);
}

#[test]
fn hotplug_identifies() {
    let (sim, controller) = setup(4096, 8);
    assert!(controller.identity().is_none());

    sim.state.lock().connect_on_reset = true;
    run(&sim, &controller, async {
        sim.raise_error(ERR_DEVICE_CONNECT);
        until(|| controller.identity().is_some()).await;
    });
    assert_eq!(controller.tags.lock().depth(), 8);

    // A link error resets the link, after which the device announces itself again.
    let resets = sim.resets();
    run(&sim, &controller, async {
        sim.raise_error(ERR_TRANSPORT);
        until(|| sim.resets() == resets + 1).await;
        until(|| controller.identity().is_some()).await;
    });
}

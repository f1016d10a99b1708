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
    ctl,
    partition::{self, Partition, PartitionTable},
    sync::WaitQueue,
    Backend, Error, Geometry, Io,
};

use alloc::{
    format,
    string::{String, ToString as _},
    sync::Arc,
    vec,
    vec::Vec,
};
use core::{
    convert::TryFrom as _,
    fmt::{self, Write as _},
    sync::atomic::{AtomicUsize, Ordering},
};
use spinning_top::{RwSpinlock, Spinlock};

/// One physical disk, driven by a [`Backend`].
//
// # Locking
//
// `state` is a spin lock and is never held across an `.await`. Everything that must happen
// atomically with respect to the partition table and the version is done within one critical
// section of `state`.
//
// Initializing the disk can't be done while holding `state`, since it involves the backend.
// Instead, `init_lock` serializes initializations, and an initialization first marks the disk
// as not ready and bumps the version (so that no new I/O can start), then waits for
// `in_flight` to reach zero before calling the backend.
pub struct Disk {
    /// Identifier within the registry.
    id: u8,
    /// Name derived from the identifier.
    name: String,
    backend: Arc<dyn Backend>,
    state: RwSpinlock<DiskState>,
    /// Locked for the entire duration of an initialization.
    init_lock: futures::lock::Mutex<()>,
    /// Number of partition I/O operations currently being processed by the backend.
    in_flight: AtomicUsize,
    /// Woken up when `in_flight` reaches zero.
    drained: WaitQueue,
}

#[derive(Debug)]
struct DiskState {
    descr: String,
    size: u64,
    align_mask: u64,
    /// Bumped every time the partition table is rebuilt.
    version: u64,
    ready: bool,
    parts: PartitionTable,
}

impl Disk {
    pub(crate) fn new(id: u8, backend: Arc<dyn Backend>) -> Self {
        Disk {
            id,
            name: format!("bs{:02}", id),
            backend,
            state: RwSpinlock::new(DiskState {
                descr: String::new(),
                size: 0,
                align_mask: 0,
                version: 0,
                ready: false,
                parts: PartitionTable::new(),
            }),
            init_lock: futures::lock::Mutex::new(()),
            in_flight: AtomicUsize::new(0),
            drained: WaitQueue::new(),
        }
    }

    /// Returns the identifier of the disk within its registry.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Returns the name of the disk, such as `bs02`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the kind of device, as reported by the backend.
    pub fn devtype(&self) -> &str {
        self.backend.devtype()
    }

    pub fn is_ready(&self) -> bool {
        self.state.read().ready
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Returns the size of the disk in bytes. Only meaningful if the disk is ready.
    pub fn size(&self) -> u64 {
        self.state.read().size
    }

    pub fn align_mask(&self) -> u64 {
        self.state.read().align_mask
    }

    pub fn descr(&self) -> String {
        self.state.read().descr.clone()
    }

    /// Returns a copy of the current partition table. Empty if the disk isn't ready.
    pub fn partitions(&self) -> Vec<Partition> {
        self.state.read().parts.to_vec()
    }

    /// Initializes the controller, then probes the device and its partition table.
    pub async fn init(&self) -> Result<(), Error> {
        let _guard = self.init_lock.lock().await;
        self.backend.init().await?;
        self.diskinit().await
    }

    /// Probes the device and its partition table again.
    ///
    /// All the handles opened before this call become stale, even if the call fails.
    pub async fn reinit(&self) -> Result<(), Error> {
        let _guard = self.init_lock.lock().await;
        self.diskinit().await
    }

    /// Reads the partition table again, without probing the device.
    ///
    /// All the handles opened before this call become stale.
    pub async fn partinit(&self) -> Result<(), Error> {
        let _guard = self.init_lock.lock().await;

        let (size, align_mask) = {
            let mut state = self.state.write();
            if !state.ready {
                return Err(Error::NoDisk);
            }
            state.version += 1;
            state.parts.truncate(1);
            (state.size, state.align_mask)
        };

        self.wait_io_drained().await;

        let parts = self.read_table(size, align_mask).await;
        let mut state = self.state.write();
        state.parts = parts;
        Ok(())
    }

    /// Must be called with `init_lock` locked.
    async fn diskinit(&self) -> Result<(), Error> {
        {
            let mut state = self.state.write();
            state.ready = false;
            state.version += 1;
            state.parts.clear();
        }

        self.wait_io_drained().await;

        let Geometry {
            size,
            align_mask,
            descr,
        } = match self.backend.devinit().await {
            Ok(g) => g,
            Err(err) => {
                log::error!("{}: devinit failed: {}", self.name, err);
                return Err(err);
            }
        };

        if size & align_mask != 0 {
            log::error!("{}: misaligned size {} (align {})", self.name, size, align_mask + 1);
            return Err(Error::Misaligned);
        }

        let parts = self.read_table(size, align_mask).await;

        let mut state = self.state.write();
        state.size = size;
        state.align_mask = align_mask;
        state.descr = descr;
        state.parts = parts;
        state.ready = true;
        log::info!(
            "{}: {}, {} bytes, {} partitions",
            self.name,
            state.descr,
            size,
            state.parts.len() - 1
        );
        Ok(())
    }

    /// Reads and parses the partition table. Falls back to a single whole-disk partition if
    /// anything goes wrong.
    async fn read_table(&self, size: u64, align_mask: u64) -> PartitionTable {
        match self.try_read_table(size, align_mask).await {
            Ok(parts) => parts,
            Err(err) => {
                log::info!("{}: partinit: {}", self.name, err);
                partition::build_default(size)
            }
        }
    }

    async fn try_read_table(&self, size: u64, align_mask: u64) -> Result<PartitionTable, Error> {
        let wanted = self.backend.table_len();
        let len = (wanted as u64 + align_mask) & !align_mask;
        if len > size {
            return Err(Error::NoPartition);
        }

        let mut buf = vec![0; usize::try_from(len).map_err(|_| Error::BadArgument)?];
        let n = self.backend.io(Io::Read(&mut buf), 0).await?;
        if n < wanted {
            return Err(Error::ProtocolError);
        }
        self.backend.parse_table(size, &buf[..n])
    }

    async fn wait_io_drained(&self) {
        let in_flight = &self.in_flight;
        self.drained
            .wait_for(|| in_flight.load(Ordering::Acquire) == 0)
            .await
    }

    /// Opens partition `index` of the disk.
    ///
    /// Only one handle to a given partition can exist at any given time, except for partition
    /// 0 that covers the entire disk.
    pub fn open_partition(self: &Arc<Self>, index: usize) -> Result<PartitionHandle, Error> {
        let mut state = self.state.write();
        if !state.ready {
            return Err(Error::NoDisk);
        }
        let version = state.version;
        let part = state.parts.get_mut(index).ok_or(Error::NoPartition)?;
        if part.index != 0 {
            if part.is_open {
                return Err(Error::InUse);
            }
            part.is_open = true;
        }

        Ok(PartitionHandle {
            disk: self.clone(),
            index,
            version,
        })
    }

    /// Opens the control channel of the disk.
    pub fn open_control(self: &Arc<Self>) -> ControlHandle {
        ControlHandle {
            disk: self.clone(),
            version: self.version(),
            raw_response: Spinlock::new(None),
        }
    }

    /// Reads from partition `index` at the current version of the disk.
    pub async fn read_partition(
        &self,
        index: usize,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, Error> {
        let version = self.version();
        self.transfer(version, index, Io::Read(buf), offset).await
    }

    /// Writes to partition `index` at the current version of the disk.
    pub async fn write_partition(
        &self,
        index: usize,
        buf: &[u8],
        offset: u64,
    ) -> Result<usize, Error> {
        let version = self.version();
        self.transfer(version, index, Io::Write(buf), offset).await
    }

    /// Changes the owner and permissions of the whole-disk partition.
    pub fn set_access(&self, owner: Option<&str>, perm: Option<u32>) -> Result<(), Error> {
        let mut state = self.state.write();
        if !state.ready {
            return Err(Error::NoDisk);
        }
        let part = state.parts.get_mut(0).ok_or(Error::NoPartition)?;
        if let Some(owner) = owner {
            part.owner = owner.to_string();
        }
        if let Some(perm) = perm {
            part.perm = perm & 0o666;
        }
        Ok(())
    }

    /// Returns the text describing the disk and its partitions.
    pub fn read_control(&self) -> String {
        let state = self.state.read();
        let mut out = String::new();
        let _ = writeln!(out, "devtype {}", ctl::quote(self.devtype()));
        if state.ready {
            let _ = writeln!(out, "descr {}", ctl::quote(&state.descr));
            let _ = writeln!(out, "align {}", state.align_mask + 1);
            let _ = writeln!(out, "size {}", state.size);
            for p in state.parts.iter().skip(1) {
                let _ = writeln!(out, "part {} {} {}", ctl::quote(&p.name), p.start, p.end);
            }
        }
        out
    }

    /// Executes a control command.
    ///
    /// `init` and `partinit` are handled here. Other commands are passed to the backend.
    pub async fn write_control(&self, line: &str) -> Result<(), Error> {
        let fields = ctl::tokenize(line)?;
        match fields.first().map(|s| s.as_str()) {
            None => Err(Error::BadCommand),
            Some("init") => {
                ctl::expect_fields(&fields, 1)?;
                self.reinit().await
            }
            Some("partinit") => {
                ctl::expect_fields(&fields, 1)?;
                self.partinit().await
            }
            Some(_) => self.backend.wctl(line).await,
        }
    }

    /// Returns the backend-specific text describing the device.
    pub async fn read_device_control(&self) -> Result<String, Error> {
        self.backend.rctl().await
    }

    /// Executes a raw device command.
    pub async fn raw(&self, cmd: &[u8]) -> Result<Vec<u8>, Error> {
        if !self.is_ready() {
            return Err(Error::NoDisk);
        }
        self.backend.raw(cmd).await
    }

    /// Transfers data between a partition and a buffer.
    ///
    /// The range is clipped to the partition. Reads can have any alignment. Writes must
    /// satisfy the alignment of the disk.
    async fn transfer(
        &self,
        version: u64,
        index: usize,
        io: Io<'_>,
        offset: u64,
    ) -> Result<usize, Error> {
        let (part_start, part_size, align_mask, _in_flight) = {
            let state = self.state.read();
            if state.version != version {
                return Err(Error::Stale);
            }
            if !state.ready {
                return Err(Error::NoDisk);
            }
            let part = state.parts.get(index).ok_or(Error::NoPartition)?;
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            let guard = InFlight { disk: self };
            (part.start, part.size(), state.align_mask, guard)
        };

        let len = io.len() as u64;
        if io.is_write() && (offset & align_mask != 0 || len & align_mask != 0) {
            return Err(Error::Misaligned);
        }

        // Clip to the partition, then translate to disk-absolute offsets.
        let s = offset.min(part_size) + part_start;
        let e = offset.saturating_add(len).min(part_size) + part_start;
        let n = e - s;
        if n == 0 {
            return Ok(0);
        }

        // Range rounded outwards to the alignment.
        let xs = s & !align_mask;
        let xn = (n + (s & align_mask) + align_mask) & !align_mask;
        let exact = xs == s && xn == n;
        let n = usize::try_from(n).map_err(|_| Error::BadArgument)?;

        if exact {
            let io = match io {
                Io::Read(buf) => Io::Read(&mut buf[..n]),
                Io::Write(buf) => Io::Write(&buf[..n]),
            };
            let done = self.backend.io(io, s).await?;
            return Ok(done.min(n));
        }

        // Clipping a write to the end of a partition whose end isn't aligned.
        let buf = match io {
            Io::Read(buf) => buf,
            Io::Write(_) => return Err(Error::Misaligned),
        };

        let skip = usize::try_from(s - xs).map_err(|_| Error::BadArgument)?;
        let mut bounce = vec![0; usize::try_from(xn).map_err(|_| Error::BadArgument)?];
        let done = self.backend.io(Io::Read(&mut bounce), xs).await?;
        let done = done.saturating_sub(skip).min(n);
        buf[..done].copy_from_slice(&bounce[skip..skip + done]);
        Ok(done)
    }
}

impl fmt::Debug for Disk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Disk")
            .field("name", &self.name)
            .field("devtype", &self.devtype())
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Decrements the number of in-flight I/O operations when dropped.
struct InFlight<'a> {
    disk: &'a Disk,
}

impl<'a> Drop for InFlight<'a> {
    fn drop(&mut self) {
        if self.disk.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.disk.drained.wake_all();
        }
    }
}

/// Open partition of a disk.
///
/// The partition is closed when the handle is dropped.
pub struct PartitionHandle {
    disk: Arc<Disk>,
    index: usize,
    /// Version of the disk when the handle was opened.
    version: u64,
}

impl PartitionHandle {
    pub fn disk(&self) -> &Arc<Disk> {
        &self.disk
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Reads from the partition at the given offset. Returns the number of bytes read, which
    /// is 0 if `offset` is at or past the end of the partition.
    pub async fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        self.disk
            .transfer(self.version, self.index, Io::Read(buf), offset)
            .await
    }

    /// Writes to the partition at the given offset. Returns the number of bytes written.
    pub async fn write(&self, buf: &[u8], offset: u64) -> Result<usize, Error> {
        self.disk
            .transfer(self.version, self.index, Io::Write(buf), offset)
            .await
    }
}

impl Drop for PartitionHandle {
    fn drop(&mut self) {
        if self.index == 0 {
            return;
        }

        let mut state = self.disk.state.write();
        // After a re-init, the slot belongs to the new partition table.
        if state.version != self.version {
            return;
        }
        if let Some(part) = state.parts.get_mut(self.index) {
            debug_assert!(part.is_open);
            part.is_open = false;
        }
    }
}

impl fmt::Debug for PartitionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PartitionHandle")
            .field("disk", &self.disk.name)
            .field("index", &self.index)
            .field("version", &self.version)
            .finish()
    }
}

/// Open control channel of a disk.
///
/// All the operations fail with [`Error::Stale`] once the disk has been re-initialized.
pub struct ControlHandle {
    disk: Arc<Disk>,
    version: u64,
    /// Response to the last raw command.
    raw_response: Spinlock<Option<Vec<u8>>>,
}

impl ControlHandle {
    pub fn disk(&self) -> &Arc<Disk> {
        &self.disk
    }

    fn check_version(&self) -> Result<(), Error> {
        if self.disk.version() != self.version {
            return Err(Error::Stale);
        }
        Ok(())
    }

    /// See [`Disk::read_control`].
    pub fn read_control(&self) -> Result<String, Error> {
        self.check_version()?;
        Ok(self.disk.read_control())
    }

    /// See [`Disk::write_control`].
    pub async fn write_control(&self, line: &str) -> Result<(), Error> {
        self.check_version()?;
        self.disk.write_control(line).await
    }

    /// See [`Disk::read_device_control`].
    pub async fn read_device_control(&self) -> Result<String, Error> {
        self.check_version()?;
        self.disk.read_device_control().await
    }

    /// Executes a raw command. Its response can then be read with
    /// [`ControlHandle::read_raw`].
    pub async fn write_raw(&self, cmd: &[u8]) -> Result<(), Error> {
        self.check_version()?;
        *self.raw_response.lock() = None;
        let response = self.disk.raw(cmd).await?;
        *self.raw_response.lock() = Some(response);
        Ok(())
    }

    /// Reads part of the response to the last raw command.
    pub fn read_raw(&self, buf: &mut [u8], offset: usize) -> Result<usize, Error> {
        self.check_version()?;
        let response = self.raw_response.lock();
        let response = response.as_ref().ok_or(Error::NoCommand)?;
        let start = offset.min(response.len());
        let n = buf.len().min(response.len() - start);
        buf[..n].copy_from_slice(&response[start..start + n]);
        Ok(n)
    }
}

impl fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ControlHandle")
            .field("disk", &self.disk.name)
            .field("version", &self.version)
            .finish()
    }
}

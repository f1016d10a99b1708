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

use crate::{ctl, Backend, Disk, Error};

use alloc::{string::String, sync::Arc, vec::Vec};
use core::{convert::TryFrom as _, fmt, fmt::Write as _};
use spinning_top::RwSpinlock;

/// Highest identifier that a disk can have.
pub const MAX_DISK_ID: u8 = 99;

/// Collection of all the disks.
///
/// The lock of the registry only protects the list of disks. Each [`Disk`] has its own lock.
pub struct Registry {
    inner: RwSpinlock<Inner>,
}

struct Inner {
    /// Indexed by disk identifier.
    disks: Vec<Option<Arc<Disk>>>,
}

impl Registry {
    /// Builds a new empty registry.
    pub fn new() -> Self {
        Registry {
            inner: RwSpinlock::new(Inner { disks: Vec::new() }),
        }
    }

    /// Registers a new disk with the given identifier.
    ///
    /// The disk starts in a "not ready" state. Call [`Disk::init`] or [`Registry::init_all`]
    /// to probe it.
    pub fn register(&self, id: u8, backend: Arc<dyn Backend>) -> Result<Arc<Disk>, Error> {
        if id > MAX_DISK_ID {
            return Err(Error::InvalidId);
        }

        let mut inner = self.inner.write();
        let slot = usize::from(id);
        if inner.disks.len() <= slot {
            inner.disks.resize(slot + 1, None);
        }
        if inner.disks[slot].is_some() {
            return Err(Error::AlreadyRegistered);
        }

        let disk = Arc::new(Disk::new(id, backend));
        log::debug!("registered {} ({})", disk.name(), disk.devtype());
        inner.disks[slot] = Some(disk.clone());
        Ok(disk)
    }

    /// Returns the disk with the given identifier, if any.
    pub fn lookup(&self, id: u8) -> Option<Arc<Disk>> {
        let inner = self.inner.read();
        inner.disks.get(usize::from(id)).and_then(|d| d.clone())
    }

    /// Returns the highest identifier ever registered.
    pub fn max_id(&self) -> Option<u8> {
        let inner = self.inner.read();
        inner
            .disks
            .len()
            .checked_sub(1)
            .and_then(|n| u8::try_from(n).ok())
    }

    /// Returns the list of all registered disks, ordered by identifier.
    pub fn list(&self) -> Vec<Arc<Disk>> {
        let inner = self.inner.read();
        inner.disks.iter().filter_map(|d| d.clone()).collect()
    }

    /// Initializes all the disks that aren't ready yet. Errors are logged and otherwise
    /// ignored.
    pub async fn init_all(&self) {
        for disk in self.list() {
            if disk.is_ready() {
                continue;
            }
            if let Err(err) = disk.init().await {
                log::warn!("{}: init failed: {}", disk.name(), err);
            }
        }
    }

    /// Returns one line of text per disk.
    pub fn read_control(&self) -> String {
        let mut out = String::new();
        for disk in self.list() {
            let devtype = ctl::quote(disk.devtype());
            if disk.is_ready() {
                let _ = writeln!(
                    out,
                    "{}, devtype {}, size {}, partitions {}",
                    disk.name(),
                    devtype,
                    disk.size(),
                    disk.partitions().len().saturating_sub(1)
                );
            } else {
                let _ = writeln!(out, "{}, devtype {}", disk.name(), devtype);
            }
        }
        out
    }

    /// Executes a registry-level control command. Only `init <id>` is supported.
    pub async fn write_control(&self, line: &str) -> Result<(), Error> {
        let fields = ctl::tokenize(line)?;
        match fields.first().map(|s| s.as_str()) {
            Some("init") => {
                ctl::expect_fields(&fields, 2)?;
                let id = ctl::parse_number(&fields[1])?;
                let id = u8::try_from(id).map_err(|_| Error::NoDisk)?;
                let disk = self.lookup(id).ok_or(Error::NoDisk)?;
                disk.reinit().await
            }
            _ => Err(Error::BadCommand),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.list().iter()).finish()
    }
}

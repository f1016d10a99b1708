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

use crate::Error;

use alloc::sync::Arc;
use core::{alloc::Layout, fmt, future::Future, time::Duration};

/// Abstraction over the hardware.
///
/// The drivers don't assume that they can directly access physical memory. Instead, any access
/// to physical memory or to a memory-mapped register is done through this trait.
///
/// # Safety
///
/// Implementations must read and write the actual location designated by the addresses passed
/// as parameter, and the addresses returned by `alloc` must be valid for the devices that the
/// drivers program.
pub unsafe trait HwAccess: Send + Sync {
    /// Future returned by [`HwAccess::delay`].
    type Delay: Future<Output = ()> + Send + 'static;

    /// Reads the 32-bits memory-mapped register at the given physical address.
    ///
    /// # Safety
    ///
    /// Reading a register can have side effects on the device.
    unsafe fn read_register(&self, address: u64) -> u32;

    /// Writes the 32-bits memory-mapped register at the given physical address.
    ///
    /// # Safety
    ///
    /// Writing a register can have side effects on the device and on memory.
    unsafe fn write_register(&self, address: u64, value: u32);

    /// Copies physical memory starting at `address` into `dest`.
    ///
    /// # Safety
    ///
    /// The memory must have been allocated through [`HwAccess::alloc`].
    unsafe fn read_memory(&self, address: u64, dest: &mut [u8]);

    /// Copies `data` into physical memory starting at `address`.
    ///
    /// # Safety
    ///
    /// The memory must have been allocated through [`HwAccess::alloc`].
    unsafe fn write_memory(&self, address: u64, data: &[u8]);

    /// Allocate a memory buffer in physical memory. Does not need to be cleared with 0s.
    ///
    /// > **Note**: The value returned is a `u64` and not a pointer, as the buffer is not
    /// >           necessarily directly accessible. All accesses to the buffer must be performed
    /// >           through the other methods of this trait.
    fn alloc(&self, layout: Layout) -> Result<u64, ()>;

    /// Deallocates a previously-allocated block of physical memory.
    ///
    /// # Safety
    ///
    /// `address` must be a value previously-returned by a call to `alloc`, and `layout` must
    /// match the layout that was passed to `alloc`.
    unsafe fn dealloc(&self, address: u64, layout: Layout);

    /// Returns a future that is ready after the given duration has passed.
    fn delay(&self, duration: Duration) -> Self::Delay;
}

unsafe impl<'a, T: ?Sized + HwAccess> HwAccess for &'a T {
    type Delay = T::Delay;

    unsafe fn read_register(&self, address: u64) -> u32 {
        (**self).read_register(address)
    }

    unsafe fn write_register(&self, address: u64, value: u32) {
        (**self).write_register(address, value)
    }

    unsafe fn read_memory(&self, address: u64, dest: &mut [u8]) {
        (**self).read_memory(address, dest)
    }

    unsafe fn write_memory(&self, address: u64, data: &[u8]) {
        (**self).write_memory(address, data)
    }

    fn alloc(&self, layout: Layout) -> Result<u64, ()> {
        (**self).alloc(layout)
    }

    unsafe fn dealloc(&self, address: u64, layout: Layout) {
        (**self).dealloc(address, layout)
    }

    fn delay(&self, duration: Duration) -> Self::Delay {
        (**self).delay(duration)
    }
}

unsafe impl<T: ?Sized + HwAccess> HwAccess for Arc<T> {
    type Delay = T::Delay;

    unsafe fn read_register(&self, address: u64) -> u32 {
        (**self).read_register(address)
    }

    unsafe fn write_register(&self, address: u64, value: u32) {
        (**self).write_register(address, value)
    }

    unsafe fn read_memory(&self, address: u64, dest: &mut [u8]) {
        (**self).read_memory(address, dest)
    }

    unsafe fn write_memory(&self, address: u64, data: &[u8]) {
        (**self).write_memory(address, data)
    }

    fn alloc(&self, layout: Layout) -> Result<u64, ()> {
        (**self).alloc(layout)
    }

    unsafe fn dealloc(&self, address: u64, layout: Layout) {
        (**self).dealloc(address, layout)
    }

    fn delay(&self, duration: Duration) -> Self::Delay {
        (**self).delay(duration)
    }
}

/// Buffer located in physical memory, visible to devices.
///
/// The memory is freed when the buffer is dropped.
pub struct DmaBuffer<A: HwAccess> {
    access: A,
    /// Location of the buffer in physical memory.
    address: u64,
    layout: Layout,
}

impl<A: HwAccess> DmaBuffer<A> {
    /// Allocates a buffer of `len` bytes. The content is unspecified.
    pub fn new(access: A, len: usize, align: usize) -> Result<Self, Error> {
        let layout = Layout::from_size_align(len.max(1), align).map_err(|_| Error::BadArgument)?;
        let address = access.alloc(layout).map_err(|()| Error::OutOfMemory)?;
        Ok(DmaBuffer {
            access,
            address,
            layout,
        })
    }

    /// Allocates a buffer of `len` bytes filled with zeroes.
    pub fn zeroed(access: A, len: usize, align: usize) -> Result<Self, Error> {
        let buf = DmaBuffer::new(access, len, align)?;
        let zeroes = [0u8; 256];
        let mut offset = 0;
        while offset < len {
            let n = (len - offset).min(zeroes.len());
            buf.write(offset, &zeroes[..n]);
            offset += n;
        }
        Ok(buf)
    }

    /// Returns the location in physical memory of the buffer.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the size of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Copies `data` into the buffer, starting at `offset`.
    ///
    /// # Panic
    ///
    /// Panics if the data doesn't fit.
    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.layout.size());
        unsafe {
            self.access.write_memory(self.address + offset as u64, data);
        }
    }

    /// Copies the content of the buffer, starting at `offset`, into `dest`.
    ///
    /// # Panic
    ///
    /// Panics if `dest` goes past the end of the buffer.
    pub fn read(&self, offset: usize, dest: &mut [u8]) {
        assert!(offset + dest.len() <= self.layout.size());
        unsafe {
            self.access.read_memory(self.address + offset as u64, dest);
        }
    }
}

impl<A: HwAccess> Drop for DmaBuffer<A> {
    fn drop(&mut self) {
        unsafe {
            self.access.dealloc(self.address, self.layout);
        }
    }
}

impl<A: HwAccess> fmt::Debug for DmaBuffer<A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("address", &format_args!("{:#x}", self.address))
            .field("len", &self.layout.size())
            .finish()
    }
}

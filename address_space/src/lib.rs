//! A single contiguous guest-physical-to-host-virtual mapping.
//!
//! The daemon never holds more than one guest memory region: the zone's
//! non-root physical range, mapped once at startup via `/dev/mem` and kept
//! mapped for the process lifetime. [`GuestMemory`] only vends translations;
//! it never hands back a raw pointer with a lifetime longer than the call
//! that asked for one.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use thiserror::Error;
use vm_memory::{Address, GuestAddress, GuestMemory as _, GuestMemoryMmap, GuestUsize};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open guest memory device: {0}")]
    OpenDevice(#[source] std::io::Error),
    #[error("failed to map guest physical range at {base:#x}, len {len:#x}: {source}")]
    Map {
        base: u64,
        len: u64,
        #[source]
        source: vm_memory::mmap::Error,
    },
    #[error("address {0:#x} is outside the mapped guest-physical range")]
    InvalidGuestAddress(u64),
    #[error("host pointer {0:#x} is outside the mapped range")]
    InvalidHostAddress(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The non-root physical range backing a single zone, mapped once at
/// startup and shared (read-only clone of the `Arc`) with every device.
#[derive(Clone)]
pub struct GuestMemory {
    mem: Arc<GuestMemoryMmap>,
    guest_base: u64,
    len: u64,
}

impl GuestMemory {
    /// Open `device_path` (typically `/dev/mem`) and map `len` bytes
    /// starting at guest-physical address `guest_base`.
    pub fn new(device_path: &str, guest_base: u64, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .map_err(Error::OpenDevice)?;

        let region = vm_memory::GuestRegionMmap::new(
            vm_memory::MmapRegion::from_file(
                vm_memory::FileOffset::new(file, guest_base),
                len as usize,
            )
            .map_err(|source| Error::Map {
                base: guest_base,
                len,
                source,
            })?,
            GuestAddress(guest_base),
        )
        .map_err(|source| Error::Map {
            base: guest_base,
            len,
            source,
        })?;

        let mem = GuestMemoryMmap::from_regions(vec![region]).map_err(|source| Error::Map {
            base: guest_base,
            len,
            source,
        })?;

        log::info!("mapped guest memory base={guest_base:#x} len={len:#x} via {device_path}");

        Ok(GuestMemory {
            mem: Arc::new(mem),
            guest_base,
            len,
        })
    }

    /// `to_host(gpa) = Vh + (gpa - Pg)`. Fails rather than panicking when
    /// `gpa` falls outside the mapped range, so a malformed descriptor
    /// becomes a device-level error instead of a crash.
    pub fn to_host(&self, gpa: u64) -> Result<*mut u8> {
        let addr = GuestAddress(gpa);
        if !self.mem.address_in_range(addr) {
            return Err(Error::InvalidGuestAddress(gpa));
        }
        // Safety: `address_in_range` confirmed the address lies inside the
        // single mapped region, so the translation below stays in bounds.
        let host = self
            .mem
            .get_host_address(addr)
            .map_err(|_| Error::InvalidGuestAddress(gpa))?;
        Ok(host)
    }

    /// `to_guest(hva) = Pg + (hva - Vh)`.
    pub fn to_guest(&self, hva: u64) -> Result<u64> {
        let region = self
            .mem
            .find_region(GuestAddress(self.guest_base))
            .ok_or(Error::InvalidHostAddress(hva))?;
        let region_host_base = region.as_ptr() as u64;
        if hva < region_host_base || hva >= region_host_base + self.len {
            return Err(Error::InvalidHostAddress(hva));
        }
        Ok(self.guest_base + (hva - region_host_base))
    }

    /// Copy `buf.len()` bytes from guest-physical `gpa` into `buf`.
    pub fn read(&self, gpa: u64, buf: &mut [u8]) -> Result<()> {
        self.mem
            .read_slice(buf, GuestAddress(gpa))
            .map_err(|_| Error::InvalidGuestAddress(gpa))
    }

    /// Copy `buf` into guest-physical memory starting at `gpa`.
    pub fn write(&self, gpa: u64, buf: &[u8]) -> Result<()> {
        self.mem
            .write_slice(buf, GuestAddress(gpa))
            .map_err(|_| Error::InvalidGuestAddress(gpa))
    }

    pub fn base(&self) -> u64 {
        self.guest_base
    }

    pub fn len(&self) -> GuestUsize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // /dev/zero maps readable but its contents are fixed, which is enough to
    // exercise translation without depending on /dev/mem (unavailable in a
    // sandboxed test run).
    fn test_mem(len: u64) -> GuestMemory {
        GuestMemory::new("/dev/zero", 0x7000_0000, len).expect("map test region")
    }

    #[test]
    fn translates_guest_to_host_and_back() {
        let mem = test_mem(0x1000);
        let host = mem.to_host(0x7000_0100).unwrap();
        let back = mem.to_guest(host as u64).unwrap();
        assert_eq!(back, 0x7000_0100);
    }

    #[test]
    fn rejects_out_of_range_guest_address() {
        let mem = test_mem(0x1000);
        assert!(mem.to_host(0x7000_2000).is_err());
        assert!(mem.to_host(0x6fff_ffff).is_err());
    }

    #[test]
    fn rejects_out_of_range_host_address() {
        let mem = test_mem(0x1000);
        assert!(mem.to_guest(0x1).is_err());
    }
}

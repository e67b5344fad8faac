//! The kernel shim boundary: `/dev/hvisor`, its two ioctls, and the mmap of
//! the bridge page. Everything past this module treats the shim as an
//! opaque producer/consumer on the other end of [`crate::ring::BridgePage`].

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;

use vmm_sys_util::ioctl::ioctl;
use vmm_sys_util::ioctl_io_nr;

use crate::error::{Error, Result};
use crate::ring::{BridgePage, MMAP_SIZE};

const SHIM_PATH: &str = "/dev/hvisor";

ioctl_io_nr!(HVISOR_INIT_VIRTIO, 1, 0);
ioctl_io_nr!(HVISOR_FINISH_REQ, 1, 2);

/// Owns the open file descriptor to the kernel shim and the bridge page it
/// maps. Dropping it unmaps the page; the fd is closed by `File`'s own Drop.
pub struct KernelShim {
    file: File,
    bridge: NonNull<BridgePage>,
}

// The bridge page is written from multiple daemon threads (request loop,
// block workers, the event loop) and from the kernel concurrently; all
// cross-thread fields are Atomic* so sharing the raw pointer is sound.
unsafe impl Send for KernelShim {}
unsafe impl Sync for KernelShim {}

impl KernelShim {
    /// Open `/dev/hvisor`, run `HVISOR_INIT_VIRTIO` (the kernel allocates the
    /// bridge page and hands its physical address to the hypervisor via a
    /// hypercall), then mmap the page.
    pub fn open() -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(SHIM_PATH)
            .map_err(|source| Error::OpenShim {
                path: SHIM_PATH,
                source,
            })?;

        // Safety: HVISOR_INIT_VIRTIO takes no argument payload.
        let ret = unsafe { ioctl(&file, HVISOR_INIT_VIRTIO()) };
        if ret < 0 {
            return Err(Error::Ioctl {
                name: "HVISOR_INIT_VIRTIO",
                source: std::io::Error::last_os_error(),
            });
        }

        // Safety: length matches MMAP_SIZE, the shim's own mmap handler for
        // this fd returns a PROT_READ|PROT_WRITE|MAP_SHARED page of exactly
        // this size at offset 0.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                MMAP_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Mmap(std::io::Error::last_os_error()));
        }

        let bridge = NonNull::new(addr as *mut BridgePage).expect("mmap returned null on success");

        Ok(KernelShim { file, bridge })
    }

    pub fn page(&self) -> &BridgePage {
        // Safety: the page stays mapped for the lifetime of `self` and every
        // field inside it is an atomic or written under a mutex.
        unsafe { self.bridge.as_ref() }
    }

    /// Tell the kernel to look at the response ring (called after
    /// publishing an entry with a release store).
    pub fn finish_req(&self) -> Result<()> {
        // Safety: HVISOR_FINISH_REQ takes no argument payload.
        let ret = unsafe { ioctl(&self.file, HVISOR_FINISH_REQ()) };
        if ret < 0 {
            return Err(Error::Ioctl {
                name: "HVISOR_FINISH_REQ",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl Drop for KernelShim {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.bridge.as_ptr() as *mut libc::c_void, MMAP_SIZE);
        }
    }
}

//! Layout of the shared bridge page and its two SPSC rings.
//!
//! Mirrors the kernel shim's `struct virtio_bridge` bit for bit: the daemon
//! and the kernel module map the same page and must agree on every offset.
//! Index fields are `Atomic*` so the release/acquire discipline the bridge
//! needs (§4.2/§9: "treat each index word as an atomic ... release on
//! publication, acquire on observation") is enforced by the type rather than
//! by convention.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

pub const MMAP_SIZE: usize = 4096;
pub const MAX_REQ: u32 = 32;
pub const MAX_DEVS: usize = 4;
pub const MAX_CPUS: usize = 16;

/// `is_queue_full`/`is_queue_empty` assume `MAX_REQ` is a power of two so the
/// wraparound can be done with a mask instead of a modulo.
const _: () = assert!(MAX_REQ.is_power_of_two());

pub fn is_queue_full(front: u32, rear: u32) -> bool {
    (rear.wrapping_add(1) & (MAX_REQ - 1)) == front
}

pub fn is_queue_empty(front: u32, rear: u32) -> bool {
    front == rear
}

/// One entry in the kernel-to-daemon request ring. `needs_interrupt` is the
/// modern name for what the kernel shim's older versions called `is_cfg`:
/// `false` is a config-class access the trapping vCPU is synchronously
/// blocked on, `true` is a data-plane notify.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DeviceReq {
    pub src_cpu: u64,
    pub address: u64,
    pub size: u64,
    pub value: u64,
    pub src_zone: u32,
    pub is_write: bool,
    pub needs_interrupt: bool,
}

/// One entry in the daemon-to-kernel response ring: which zone to interrupt
/// and with which IRQ line.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DeviceRes {
    pub target_zone: u32,
    pub irq_id: u32,
}

/// The shared page itself, `repr(C)` so its layout matches the kernel
/// module's struct exactly. Never constructed directly — always reached
/// through a pointer into the `mmap`ed page (see [`crate::shim::KernelShim`]).
#[repr(C)]
pub struct BridgePage {
    pub req_head: AtomicU32,
    pub req_tail: AtomicU32,
    pub resp_head: AtomicU32,
    pub resp_tail: AtomicU32,
    pub req: [DeviceReqRaw; MAX_REQ as usize],
    pub resp: [DeviceRes; MAX_REQ as usize],
    pub cfg_flags: [AtomicU8; MAX_CPUS],
    pub cfg_values: [std::sync::atomic::AtomicU64; MAX_CPUS],
    pub mmio_addrs: [u64; MAX_DEVS],
    pub mmio_avail: AtomicU8,
    pub need_wakeup: AtomicU8,
}

/// `DeviceReq`, but with `bool` fields stored as `u8` so the struct has a
/// C-compatible, fixed layout for the shared page (a Rust `bool` is
/// guaranteed one byte but not guaranteed to be FFI-stable across all of the
/// kernel module's build toolchains).
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct DeviceReqRaw {
    pub src_cpu: u64,
    pub address: u64,
    pub size: u64,
    pub value: u64,
    pub src_zone: u32,
    pub is_write: u8,
    pub needs_interrupt: u8,
    pub padding: u16,
}

impl From<DeviceReqRaw> for DeviceReq {
    fn from(raw: DeviceReqRaw) -> Self {
        DeviceReq {
            src_cpu: raw.src_cpu,
            address: raw.address,
            size: raw.size,
            value: raw.value,
            src_zone: raw.src_zone,
            is_write: raw.is_write != 0,
            needs_interrupt: raw.needs_interrupt != 0,
        }
    }
}

const _: () = assert!(std::mem::size_of::<BridgePage>() <= MMAP_SIZE);

impl BridgePage {
    /// Snapshot `req[req_head]` and advance `req_head` with a release
    /// store, handing ownership of the slot back to the kernel producer.
    pub fn poll_request(&self) -> Option<DeviceReq> {
        let head = self.req_head.load(Ordering::Acquire);
        let tail = self.req_tail.load(Ordering::Acquire);
        if is_queue_empty(head, tail) {
            return None;
        }
        let entry = self.req[head as usize];
        self.req_head
            .store(head.wrapping_add(1) & (MAX_REQ - 1), Ordering::Release);
        Some(entry.into())
    }

    pub fn req_is_empty(&self) -> bool {
        is_queue_empty(
            self.req_head.load(Ordering::Acquire),
            self.req_tail.load(Ordering::Acquire),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_and_empty_use_standard_spsc_convention() {
        assert!(is_queue_empty(3, 3));
        assert!(!is_queue_full(3, 3));
        assert!(is_queue_full(3, 2));
    }

    #[test]
    fn full_detection_respects_max_req_wraparound() {
        let front = 5;
        let rear = front.wrapping_sub(1) & (MAX_REQ - 1);
        assert!(is_queue_full(front, rear));
    }
}

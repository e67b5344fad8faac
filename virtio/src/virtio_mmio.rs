//! The virtio-mmio register bank (§4.5): one per device, reached by the
//! bridge thread routing a [`bridge::DeviceReq`] whose address falls inside
//! `[base_addr, base_addr + len)`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::device::DeviceBackend;
use crate::queue::Virtqueue;
use crate::VIRTIO_F_RING_EVENT_IDX;

pub const MMIO_MAGIC_VALUE: u32 = 0x7472_6976;
pub const MMIO_VERSION: u32 = 2;
pub const MMIO_VENDOR_ID: u32 = 0x4856_4953; // "HVIS"

const REG_MAGIC: u64 = 0x000;
const REG_VERSION: u64 = 0x004;
const REG_DEVICE_ID: u64 = 0x008;
const REG_VENDOR_ID: u64 = 0x00c;
const REG_DEVICE_FEATURES: u64 = 0x010;
const REG_DEVICE_FEATURES_SEL: u64 = 0x014;
const REG_DRIVER_FEATURES: u64 = 0x020;
const REG_DRIVER_FEATURES_SEL: u64 = 0x024;
const REG_QUEUE_SEL: u64 = 0x030;
const REG_QUEUE_NUM_MAX: u64 = 0x034;
const REG_QUEUE_NUM: u64 = 0x038;
const REG_QUEUE_READY: u64 = 0x044;
const REG_QUEUE_NOTIFY: u64 = 0x050;
const REG_INTERRUPT_STATUS: u64 = 0x060;
const REG_INTERRUPT_ACK: u64 = 0x064;
const REG_STATUS: u64 = 0x070;
const REG_QUEUE_DESC_LOW: u64 = 0x080;
const REG_QUEUE_DESC_HIGH: u64 = 0x084;
const REG_QUEUE_AVAIL_LOW: u64 = 0x090;
const REG_QUEUE_AVAIL_HIGH: u64 = 0x094;
const REG_QUEUE_USED_LOW: u64 = 0x0a0;
const REG_QUEUE_USED_HIGH: u64 = 0x0a4;
const REG_CONFIG_GENERATION: u64 = 0x0fc;
const CONFIG_SPACE_START: u64 = 0x100;

type QueueHandle = Arc<Mutex<Virtqueue>>;

/// Shadow of the register bank plus the bookkeeping needed to decode
/// writes (selected queue, selected feature page). One instance lives
/// inside each `VirtioDevice`, alongside its queues and backend.
pub struct MmioTransport {
    pub device_id: u32,
    pub dev_features: u64,
    pub drv_features: u64,
    dev_features_sel: u32,
    drv_features_sel: u32,
    queue_sel: u32,
    pub status: u32,
    /// Shared with every worker thread that can complete a request
    /// asynchronously (block worker, net RX callback) so they can raise
    /// `VIRTIO_MMIO_INT_VRING` without taking a lock on the whole
    /// transport (mirrors the `Arc<AtomicUsize>` used for this field by
    /// rust-vmm MMIO transports).
    pub interrupt_status: Arc<AtomicU32>,
    pub config_generation: u32,
}

impl MmioTransport {
    pub fn new(device_id: u32, dev_features: u64) -> Self {
        MmioTransport {
            device_id,
            dev_features,
            drv_features: 0,
            dev_features_sel: 0,
            drv_features_sel: 0,
            queue_sel: 0,
            status: 0,
            interrupt_status: Arc::new(AtomicU32::new(0)),
            config_generation: 0,
        }
    }

    pub fn interrupt_status_handle(&self) -> Arc<AtomicU32> {
        self.interrupt_status.clone()
    }

    /// Dispatch a 4-byte-or-config-space read. Transport reads of a size
    /// other than 4 bytes log and return 0, per §4.5.
    pub fn read(&self, offset: u64, size: u32, queues: &[QueueHandle], backend: &DeviceBackend) -> u64 {
        if offset >= CONFIG_SPACE_START {
            let mut buf = vec![0u8; size as usize];
            backend.read_config((offset - CONFIG_SPACE_START) as usize, &mut buf);
            return read_le(&buf);
        }
        if size != 4 {
            warn!("virtio-mmio: non-4-byte transport read at {offset:#x}");
            return 0;
        }
        match offset {
            REG_MAGIC => MMIO_MAGIC_VALUE as u64,
            REG_VERSION => MMIO_VERSION as u64,
            REG_DEVICE_ID => self.device_id as u64,
            REG_VENDOR_ID => MMIO_VENDOR_ID as u64,
            REG_DEVICE_FEATURES => {
                if self.dev_features_sel == 0 {
                    self.dev_features as u32 as u64
                } else {
                    (self.dev_features >> 32) as u64
                }
            }
            REG_QUEUE_NUM_MAX => queues
                .get(self.queue_sel as usize)
                .map(|q| q.lock().unwrap().queue_num_max as u64)
                .unwrap_or(0),
            REG_QUEUE_READY => queues
                .get(self.queue_sel as usize)
                .map(|q| q.lock().unwrap().ready as u64)
                .unwrap_or(0),
            REG_INTERRUPT_STATUS => self.interrupt_status.load(Ordering::Acquire) as u64,
            REG_STATUS => self.status as u64,
            REG_CONFIG_GENERATION => self.config_generation as u64,
            _ => {
                warn!("virtio-mmio: write-only or unknown register read at {offset:#x}");
                0
            }
        }
    }

    /// Dispatch a register write. Returns `Some(queue_index)` if
    /// `QUEUE_NOTIFY` was hit (the caller still has to invoke the backend's
    /// notify handler; the transport itself never reaches into device I/O).
    pub fn write(
        &mut self,
        offset: u64,
        size: u32,
        value: u64,
        queues: &[QueueHandle],
        backend: &mut DeviceBackend,
    ) -> Option<u32> {
        if offset >= CONFIG_SPACE_START {
            let buf = write_le(value, size as usize);
            backend.write_config((offset - CONFIG_SPACE_START) as usize, &buf);
            return None;
        }
        if size != 4 {
            warn!("virtio-mmio: non-4-byte transport write at {offset:#x}");
            return None;
        }
        let v = value as u32;
        match offset {
            REG_DEVICE_FEATURES_SEL => self.dev_features_sel = v,
            REG_DRIVER_FEATURES_SEL => self.drv_features_sel = v,
            REG_DRIVER_FEATURES => {
                if self.drv_features_sel == 0 {
                    self.drv_features |= v as u64;
                } else {
                    self.drv_features |= (v as u64) << 32;
                }
                if self.drv_features & (1u64 << VIRTIO_F_RING_EVENT_IDX) != 0 {
                    for q in queues {
                        q.lock().unwrap().event_idx_enabled = true;
                    }
                }
            }
            REG_QUEUE_SEL => {
                if (v as usize) < queues.len() {
                    self.queue_sel = v;
                } else {
                    warn!("virtio-mmio: QUEUE_SEL {v} out of range ({} queues)", queues.len());
                }
            }
            REG_QUEUE_NUM => {
                if let Some(q) = queues.get(self.queue_sel as usize) {
                    q.lock().unwrap().num = v as u16;
                }
            }
            REG_QUEUE_READY => {
                if let Some(q) = queues.get(self.queue_sel as usize) {
                    q.lock().unwrap().ready = v == 1;
                }
            }
            REG_QUEUE_NOTIFY => return Some(v),
            REG_QUEUE_DESC_LOW => set_low(queues, self.queue_sel, v, |q| &mut q.desc_table_addr),
            REG_QUEUE_DESC_HIGH => set_high(queues, self.queue_sel, v, |q| &mut q.desc_table_addr),
            REG_QUEUE_AVAIL_LOW => set_low(queues, self.queue_sel, v, |q| &mut q.avail_addr),
            REG_QUEUE_AVAIL_HIGH => set_high(queues, self.queue_sel, v, |q| &mut q.avail_addr),
            REG_QUEUE_USED_LOW => set_low(queues, self.queue_sel, v, |q| &mut q.used_addr),
            REG_QUEUE_USED_HIGH => set_high(queues, self.queue_sel, v, |q| &mut q.used_addr),
            REG_STATUS => {
                self.status = v;
                if v == 0 {
                    self.interrupt_status.store(0, Ordering::Release);
                    for q in queues {
                        q.lock().unwrap().reset();
                    }
                }
            }
            REG_INTERRUPT_ACK => {
                self.interrupt_status.fetch_and(!v, Ordering::AcqRel);
            }
            _ => warn!("virtio-mmio: write to read-only or unknown register {offset:#x}"),
        }
        None
    }
}

fn set_low(queues: &[QueueHandle], sel: u32, v: u32, field: impl Fn(&mut Virtqueue) -> &mut u64) {
    if let Some(q) = queues.get(sel as usize) {
        let mut q = q.lock().unwrap();
        let addr = field(&mut q);
        *addr = (*addr & !0xffff_ffff) | v as u64;
    }
}

fn set_high(queues: &[QueueHandle], sel: u32, v: u32, field: impl Fn(&mut Virtqueue) -> &mut u64) {
    if let Some(q) = queues.get(sel as usize) {
        let mut q = q.lock().unwrap();
        let addr = field(&mut q);
        *addr = (*addr & 0xffff_ffff) | ((v as u64) << 32);
    }
}

fn read_le(buf: &[u8]) -> u64 {
    match buf.len() {
        1 => buf[0] as u64,
        2 => LittleEndian::read_u16(buf) as u64,
        4 => LittleEndian::read_u32(buf) as u64,
        8 => LittleEndian::read_u64(buf),
        _ => 0,
    }
}

fn write_le(value: u64, size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    match size {
        1 => buf[0] = value as u8,
        2 => LittleEndian::write_u16(&mut buf, value as u16),
        4 => LittleEndian::write_u32(&mut buf, value as u32),
        8 => LittleEndian::write_u64(&mut buf, value),
        _ => {}
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> MmioTransport {
        MmioTransport::new(2, 1u64 << 32)
    }

    fn queue_handles(n: usize) -> Vec<QueueHandle> {
        (0..n).map(|_| Arc::new(Mutex::new(Virtqueue::new(256)))).collect()
    }

    #[test]
    fn magic_version_vendor_readable_before_activation() {
        let t = transport();
        let queues = queue_handles(0);
        let backend = DeviceBackend::test_stub();
        assert_eq!(t.read(REG_MAGIC, 4, &queues, &backend), MMIO_MAGIC_VALUE as u64);
        assert_eq!(t.read(REG_VERSION, 4, &queues, &backend), MMIO_VERSION as u64);
        assert_eq!(t.read(REG_VENDOR_ID, 4, &queues, &backend), MMIO_VENDOR_ID as u64);
    }

    #[test]
    fn driver_features_enables_event_idx_on_every_queue() {
        let mut t = transport();
        let queues = queue_handles(2);
        let mut backend = DeviceBackend::test_stub();
        t.write(REG_DRIVER_FEATURES_SEL, 4, 0, &queues, &mut backend);
        t.write(
            REG_DRIVER_FEATURES,
            4,
            1u64 << crate::VIRTIO_F_RING_EVENT_IDX,
            &queues,
            &mut backend,
        );
        assert!(queues.iter().all(|q| q.lock().unwrap().event_idx_enabled));
    }

    #[test]
    fn status_zero_resets_every_queue() {
        let mut t = transport();
        let queues = queue_handles(1);
        {
            let mut q = queues[0].lock().unwrap();
            q.ready = true;
            q.last_avail_idx = 9;
        }
        let mut backend = DeviceBackend::test_stub();
        t.write(REG_STATUS, 4, 0, &queues, &mut backend);
        let q = queues[0].lock().unwrap();
        assert!(!q.ready);
        assert_eq!(q.last_avail_idx, 0);
        assert_eq!(q.queue_num_max, 256);
    }

    #[test]
    fn interrupt_ack_clears_only_acked_bits() {
        let mut t = transport();
        t.interrupt_status
            .store(crate::VIRTIO_MMIO_INT_VRING | 0x2, Ordering::Relaxed);
        let queues = queue_handles(0);
        let mut backend = DeviceBackend::test_stub();
        t.write(REG_INTERRUPT_ACK, 4, crate::VIRTIO_MMIO_INT_VRING as u64, &queues, &mut backend);
        assert_eq!(t.interrupt_status.load(Ordering::Relaxed), 0x2);
    }

    #[test]
    fn queue_notify_returns_the_notified_queue_index() {
        let mut t = transport();
        let queues = queue_handles(1);
        let mut backend = DeviceBackend::test_stub();
        let notified = t.write(REG_QUEUE_NOTIFY, 4, 0, &queues, &mut backend);
        assert_eq!(notified, Some(0));
    }
}

//! Devices as a tagged union instead of a trait-object hierarchy: every
//! virtio device in this daemon is either a block device or a net device,
//! there will never be a third kind added by a plugin, so a closed `enum`
//! with a shared dispatch table is a better fit than `dyn VirtioDevice`
//! (see the spec's polymorphism design note).

use std::sync::{Arc, Mutex};

use address_space::GuestMemory;
use bridge::Bridge;

use crate::block::Block;
use crate::net::Net;
use crate::queue::Virtqueue;
use crate::{Result, VIRTIO_TYPE_BLOCK, VIRTIO_TYPE_NET};

pub enum DeviceBackend {
    Block(Block),
    Net(Net),
}

impl DeviceBackend {
    pub fn device_type(&self) -> u32 {
        match self {
            DeviceBackend::Block(_) => VIRTIO_TYPE_BLOCK,
            DeviceBackend::Net(_) => VIRTIO_TYPE_NET,
        }
    }

    pub fn read_config(&self, offset: usize, data: &mut [u8]) {
        match self {
            DeviceBackend::Block(b) => b.read_config(offset, data),
            DeviceBackend::Net(n) => n.read_config(offset, data),
        }
    }

    pub fn write_config(&mut self, _offset: usize, _data: &[u8]) {
        // Both block and net config spaces are read-only from the driver's
        // side in this daemon (capacity/MAC/status are host-determined).
        log::warn!("virtio: write to read-only device config space ignored");
    }

    /// Dispatch a `QUEUE_NOTIFY` write to the backend's notify handler for
    /// `queue_index`.
    pub fn notify(
        &mut self,
        queue_index: u32,
        mem: &GuestMemory,
        queues: &[Arc<Mutex<Virtqueue>>],
        bridge: &Arc<Bridge>,
        zone_id: u32,
        irq_id: u32,
    ) -> Result<()> {
        match self {
            DeviceBackend::Block(b) => b.notify(mem, queues, bridge, zone_id, irq_id),
            DeviceBackend::Net(n) => n.notify(queue_index, mem, queues, bridge, zone_id, irq_id),
        }
    }

    #[cfg(test)]
    pub fn test_stub() -> Self {
        DeviceBackend::Net(Net::test_stub())
    }
}

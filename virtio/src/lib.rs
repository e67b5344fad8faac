// Copyright (c) 2020 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! # Virtio
//!
//! The split-virtqueue engine, the virtio-mmio register bank, and the two
//! device back-ends (block, net) this daemon serves over the bridge.
//!
//! ## Design
//!
//! Devices are a tagged union (`device::DeviceBackend`) dispatched from a
//! single `VirtioDevice` that owns the MMIO transport, the queues and the
//! backend together, reached by the bridge thread once per
//! [`bridge::DeviceReq`].
#[macro_use]
extern crate log;

pub mod block;
pub mod device;
pub mod error;
pub mod net;
pub mod queue;
pub mod virtio_mmio;

use std::sync::{Arc, Mutex};

use address_space::GuestMemory;
use bridge::Bridge;

pub use error::{Result, VirtioError};

use device::DeviceBackend;
use queue::Virtqueue;
use virtio_mmio::MmioTransport;

pub const VIRTIO_TYPE_NET: u32 = 1;
pub const VIRTIO_TYPE_BLOCK: u32 = 2;

// Transport feature bits (virtio 1.x, §6).
pub const VIRTIO_F_RING_EVENT_IDX: u32 = 29;
pub const VIRTIO_F_VERSION_1: u32 = 32;

pub const VIRTIO_MMIO_INT_VRING: u32 = 0x01;
pub const VIRTIO_MMIO_INT_CONFIG: u32 = 0x02;

/// Ties one device's MMIO transport, queues and backend together. One
/// instance per `blk,...`/`net,...` command-line descriptor; the daemon
/// keeps all of them in a `Vec` and routes each `DeviceReq` to whichever one
/// claims the request's address range.
pub struct VirtioDevice {
    pub id: String,
    pub zone_id: u32,
    pub irq_id: u32,
    pub base_addr: u64,
    pub len: u64,
    pub transport: MmioTransport,
    pub queues: Vec<Arc<Mutex<Virtqueue>>>,
    pub backend: DeviceBackend,
}

impl VirtioDevice {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_addr && address < self.base_addr + self.len
    }

    /// Service one bridge request already known to target this device
    /// (§4.5/§9 `virtio_handle_req`): dispatch through the MMIO transport,
    /// and for a data-plane notify, on into the backend.
    pub fn handle_req(&mut self, mem: &GuestMemory, bridge: &Arc<Bridge>, req: &bridge::DeviceReq) -> Result<()> {
        let offset = req.address - self.base_addr;

        if req.is_write {
            let notified = self
                .transport
                .write(offset, req.size as u32, req.value, &self.queues, &mut self.backend);
            if !req.needs_interrupt {
                bridge.post_config_reply(req.src_cpu, 0);
            }
            if let Some(queue_index) = notified {
                self.backend
                    .notify(queue_index, mem, &self.queues, bridge, self.zone_id, self.irq_id)?;
            }
        } else {
            let value = self.transport.read(offset, req.size as u32, &self.queues, &self.backend);
            if !req.needs_interrupt {
                bridge.post_config_reply(req.src_cpu, value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_checks_the_half_open_mmio_range() {
        let dev = VirtioDevice {
            id: "test".into(),
            zone_id: 0,
            irq_id: 32,
            base_addr: 0x1000,
            len: 0x200,
            transport: MmioTransport::new(VIRTIO_TYPE_NET, 0),
            queues: vec![],
            backend: DeviceBackend::test_stub(),
        };
        assert!(dev.contains(0x1000));
        assert!(dev.contains(0x11ff));
        assert!(!dev.contains(0x1200));
        assert!(!dev.contains(0xfff));
    }
}

//! Virtio net device: TAP RX via the event loop, TX parsed inline on the
//! bridge thread (§4.7).

use std::sync::{Arc, Mutex};

use address_space::GuestMemory;
use bridge::Bridge;
use log::{error, warn};

use crate::error::{Result, VirtioError};
use crate::queue::Virtqueue;

pub const NET_QUEUE_RX: u32 = 0;
pub const NET_QUEUE_TX: u32 = 1;

/// `sizeof(struct virtio_net_hdr_v1)`: flags, gso_type, hdr_len, gso_size,
/// csum_start, csum_offset, num_buffers — all `u8`/`u16`.
const NET_HDR_SIZE: usize = 12;
const NUM_BUFFERS_OFFSET: usize = 10;

/// The data-link layer's minimum frame size; shorter TX frames are
/// zero-padded before `writev` to the TAP device.
const MIN_FRAME_LEN: usize = 64;

const VIRTIO_NET_S_LINK_UP: u16 = 1;

pub const VIRTIO_NET_F_MAC: u64 = 5;
pub const VIRTIO_NET_F_STATUS: u64 = 16;

pub struct Net {
    tap_fd: std::os::unix::io::RawFd,
    mac: [u8; 6],
    status: u16,
    rx_ready: bool,
}

impl Net {
    pub fn open(tap_name: &str, mac: [u8; 6]) -> Result<Self> {
        let tap_fd = open_tap(tap_name)?;
        set_nonblocking(tap_fd)?;
        Ok(Net {
            tap_fd,
            mac,
            status: VIRTIO_NET_S_LINK_UP,
            rx_ready: false,
        })
    }

    pub fn tap_fd(&self) -> std::os::unix::io::RawFd {
        self.tap_fd
    }

    pub fn read_config(&self, offset: usize, data: &mut [u8]) {
        let mut buf = [0u8; 8];
        buf[0..6].copy_from_slice(&self.mac);
        buf[6..8].copy_from_slice(&self.status.to_le_bytes());
        for (i, b) in data.iter_mut().enumerate() {
            *b = buf.get(offset + i).copied().unwrap_or(0);
        }
    }

    /// Dispatch a `QUEUE_NOTIFY`: RX-queue notify just flips `rx_ready`
    /// (driver has posted receive buffers); TX is parsed and sent inline.
    pub fn notify(
        &mut self,
        queue_index: u32,
        mem: &GuestMemory,
        queues: &[Arc<Mutex<Virtqueue>>],
        bridge: &Arc<Bridge>,
        zone_id: u32,
        irq_id: u32,
    ) -> Result<()> {
        match queue_index {
            NET_QUEUE_RX => {
                if !self.rx_ready {
                    self.rx_ready = true;
                    let vq = queues
                        .get(NET_QUEUE_RX as usize)
                        .ok_or(VirtioError::QueueIndexOutOfBounds(NET_QUEUE_RX, queues.len()))?;
                    vq.lock().unwrap().suppress_notifications(mem)?;
                }
                Ok(())
            }
            NET_QUEUE_TX => self.handle_tx(mem, queues, bridge, zone_id, irq_id),
            other => Err(VirtioError::QueueIndexOutOfBounds(other, queues.len())),
        }
    }

    fn handle_tx(
        &mut self,
        mem: &GuestMemory,
        queues: &[Arc<Mutex<Virtqueue>>],
        bridge: &Arc<Bridge>,
        zone_id: u32,
        irq_id: u32,
    ) -> Result<()> {
        let vq = queues
            .get(NET_QUEUE_TX as usize)
            .ok_or(VirtioError::QueueIndexOutOfBounds(NET_QUEUE_TX, queues.len()))?;

        let mut sent_any = false;
        {
            let mut q = vq.lock().unwrap();
            q.suppress_notifications(mem)?;
            while let Some(chain) = q.pop(mem)? {
                sent_any = true;
                let total_len = chain.total_len();
                if let Err(e) = self.send_frame(&chain) {
                    warn!("net: tx writev failed: {e}");
                }
                q.commit_used(mem, chain.head_index, total_len)?;
            }
            q.enable_notifications(mem)?;
        }

        if sent_any {
            let inject = vq.lock().unwrap().should_inject_irq(mem)?;
            if inject {
                bridge.post_response(zone_id, irq_id)?;
            }
        }
        Ok(())
    }

    fn send_frame(&self, chain: &crate::queue::DescriptorChain) -> std::io::Result<()> {
        let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(chain.descriptors.len() + 1);
        let mut remaining = NET_HDR_SIZE;
        let mut packet_len = 0u32;
        for d in &chain.descriptors {
            if remaining > 0 {
                let skip = remaining.min(d.len as usize);
                remaining -= skip;
                if skip == d.len as usize {
                    continue;
                }
                let ptr = unsafe { d.host_ptr.add(skip) };
                let len = d.len - skip as u32;
                packet_len += len;
                iovecs.push(libc::iovec {
                    iov_base: ptr as *mut libc::c_void,
                    iov_len: len as usize,
                });
            } else {
                packet_len += d.len;
                iovecs.push(libc::iovec {
                    iov_base: d.host_ptr as *mut libc::c_void,
                    iov_len: d.len as usize,
                });
            }
        }

        let mut pad = [0u8; MIN_FRAME_LEN];
        if (packet_len as usize) < MIN_FRAME_LEN {
            iovecs.push(libc::iovec {
                iov_base: pad.as_mut_ptr() as *mut libc::c_void,
                iov_len: MIN_FRAME_LEN - packet_len as usize,
            });
        }

        let ret = unsafe { libc::writev(self.tap_fd, iovecs.as_ptr(), iovecs.len() as i32) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Invoked by the event loop on TAP `EPOLLIN` (§4.7).
    pub fn rx_callback(
        &mut self,
        mem: &GuestMemory,
        queues: &[Arc<Mutex<Virtqueue>>],
        bridge: &Arc<Bridge>,
        zone_id: u32,
        irq_id: u32,
    ) {
        if let Err(e) = self.rx_callback_inner(mem, queues, bridge, zone_id, irq_id) {
            error!("net: rx callback failed: {e}");
        }
    }

    fn rx_callback_inner(
        &mut self,
        mem: &GuestMemory,
        queues: &[Arc<Mutex<Virtqueue>>],
        bridge: &Arc<Bridge>,
        zone_id: u32,
        irq_id: u32,
    ) -> Result<()> {
        let vq = queues
            .get(NET_QUEUE_RX as usize)
            .ok_or(VirtioError::QueueIndexOutOfBounds(NET_QUEUE_RX, queues.len()))?;

        if !self.rx_ready {
            self.drain_one_and_discard();
            return Ok(());
        }

        if vq.lock().unwrap().is_empty(mem)? {
            self.drain_one_and_discard();
            let inject = vq.lock().unwrap().should_inject_irq(mem)?;
            if inject {
                bridge.post_response(zone_id, irq_id)?;
            }
            return Ok(());
        }

        let mut received_any = false;
        {
            let mut q = vq.lock().unwrap();
            loop {
                if q.is_empty(mem)? {
                    break;
                }
                let chain = match q.pop(mem)? {
                    Some(c) => c,
                    None => break,
                };
                match self.recv_into(&chain) {
                    Ok(Some(len)) => {
                        received_any = true;
                        q.commit_used(mem, chain.head_index, len + NET_HDR_SIZE as u32)?;
                    }
                    Ok(None) => {
                        // EAGAIN: no more packets queued on the TAP device.
                        q.last_avail_idx = q.last_avail_idx.wrapping_sub(1);
                        break;
                    }
                    Err(e) => {
                        warn!("net: rx readv failed: {e}");
                        q.commit_used(mem, chain.head_index, NET_HDR_SIZE as u32)?;
                    }
                }
            }
        }

        if received_any {
            let inject = vq.lock().unwrap().should_inject_irq(mem)?;
            if inject {
                bridge.post_response(zone_id, irq_id)?;
            }
        }
        Ok(())
    }

    fn recv_into(&self, chain: &crate::queue::DescriptorChain) -> std::io::Result<Option<u32>> {
        let header = chain
            .descriptors
            .first()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "empty rx chain"))?;
        if (header.len as usize) < NET_HDR_SIZE {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "rx header too small"));
        }
        unsafe {
            std::ptr::write_bytes(header.host_ptr, 0, NET_HDR_SIZE);
            // num_buffers = 1: this daemon never negotiates MRG_RXBUF.
            std::ptr::write(header.host_ptr.add(NUM_BUFFERS_OFFSET) as *mut u16, 1u16.to_le());
        }

        let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(chain.descriptors.len());
        let header_remainder = header.len as usize - NET_HDR_SIZE;
        if header_remainder > 0 {
            iovecs.push(libc::iovec {
                iov_base: unsafe { header.host_ptr.add(NET_HDR_SIZE) } as *mut libc::c_void,
                iov_len: header_remainder,
            });
        }
        for d in &chain.descriptors[1..] {
            iovecs.push(libc::iovec {
                iov_base: d.host_ptr as *mut libc::c_void,
                iov_len: d.len as usize,
            });
        }

        let ret = unsafe { libc::readv(self.tap_fd, iovecs.as_ptr(), iovecs.len() as i32) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(ret as u32))
    }

    fn drain_one_and_discard(&self) {
        let mut trash = [0u8; 1600];
        unsafe {
            libc::read(self.tap_fd, trash.as_mut_ptr() as *mut libc::c_void, trash.len());
        }
    }

    #[cfg(test)]
    pub fn test_stub() -> Self {
        Net {
            tap_fd: -1,
            mac: [0, 0, 0, 0, 0, 0],
            status: VIRTIO_NET_S_LINK_UP,
            rx_ready: false,
        }
    }
}

impl Drop for Net {
    fn drop(&mut self) {
        if self.tap_fd >= 0 {
            unsafe {
                libc::close(self.tap_fd);
            }
        }
    }
}

fn open_tap(name: &str) -> Result<std::os::unix::io::RawFd> {
    const IFF_TAP: i16 = 0x0002;
    const IFF_NO_PI: i16 = 0x1000;
    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

    #[repr(C)]
    struct IfReq {
        ifr_name: [libc::c_char; libc::IF_NAMESIZE],
        ifr_flags: i16,
        _padding: [u8; 22],
    }

    let path = std::ffi::CString::new("/dev/net/tun").unwrap();
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(VirtioError::Io(std::io::Error::last_os_error()));
    }

    let mut ifr: IfReq = unsafe { std::mem::zeroed() };
    let name_bytes = name.as_bytes();
    let n = name_bytes.len().min(libc::IF_NAMESIZE - 1);
    for (i, b) in name_bytes[..n].iter().enumerate() {
        ifr.ifr_name[i] = *b as libc::c_char;
    }
    ifr.ifr_flags = IFF_TAP | IFF_NO_PI;

    let ret = unsafe { libc::ioctl(fd, TUNSETIFF, &mut ifr) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(VirtioError::Io(err));
    }
    Ok(fd)
}

fn set_nonblocking(fd: std::os::unix::io::RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(VirtioError::Io(std::io::Error::last_os_error()));
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(VirtioError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DescriptorEntry;

    #[test]
    fn short_frames_are_padded_to_minimum_length() {
        let net = Net::test_stub();
        let mut header = [0u8; NET_HDR_SIZE];
        let mut payload = [0xAAu8; 10];
        let chain = crate::queue::DescriptorChain {
            head_index: 0,
            descriptors: vec![
                DescriptorEntry { host_ptr: header.as_mut_ptr(), len: NET_HDR_SIZE as u32, writable: false },
                DescriptorEntry { host_ptr: payload.as_mut_ptr(), len: 10, writable: false },
            ],
        };
        // Only assert the padding math here; the fd is -1 so writev will
        // fail, which is fine for a pure unit test of frame construction.
        let packet_len: u32 = chain.descriptors[1..].iter().map(|d| d.len).sum();
        assert!((packet_len as usize) < MIN_FRAME_LEN);
        let _ = net.send_frame(&chain); // exercises the code path without asserting on I/O result
    }

    #[test]
    fn advertised_features_are_version1_mac_status() {
        let features = (1u64 << 32) | (1u64 << VIRTIO_NET_F_MAC) | (1u64 << VIRTIO_NET_F_STATUS);
        assert_ne!(features & (1u64 << VIRTIO_NET_F_MAC), 0);
        assert_ne!(features & (1u64 << VIRTIO_NET_F_STATUS), 0);
    }

    #[test]
    fn read_config_reports_mac_and_link_up_status() {
        let net = Net { tap_fd: -1, mac: [1, 2, 3, 4, 5, 6], status: VIRTIO_NET_S_LINK_UP, rx_ready: false };
        let mut buf = [0u8; 8];
        net.read_config(0, &mut buf);
        assert_eq!(&buf[0..6], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), VIRTIO_NET_S_LINK_UP);
    }
}

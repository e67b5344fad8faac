//! Virtio block device: a worker thread draining a per-device FIFO,
//! `preadv`/`pwritev` against a backing image file (§4.6).

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use address_space::GuestMemory;
use bridge::Bridge;
use byteorder::{ByteOrder, LittleEndian};
use log::{error, warn};

use crate::error::{Result, VirtioError};
use crate::queue::{DescriptorChain, Virtqueue};

const SECTOR_SIZE: u64 = 512;
const SEG_MAX: u32 = 256;
const HEADER_SIZE: u32 = 16; // type: u32, reserved: u32, sector: u64

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_GET_ID: u32 = 8;

const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

pub const VIRTIO_BLK_F_SEG_MAX: u64 = 2;
pub const VIRTIO_BLK_F_SIZE_MAX: u64 = 1;

/// `struct virtio_blk_config` (§4.5): the only fields this daemon fills in.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct BlkConfig {
    pub capacity: u64,
    pub size_max: u32,
    pub seg_max: u32,
}

struct ParsedRequest {
    queue_index: usize,
    head: u16,
    kind: u32,
    sector: u64,
    /// Data descriptors, excluding the header and the trailing status byte.
    data: Vec<(*mut u8, u32, bool)>,
    status_ptr: *mut u8,
}

// Safety: a ParsedRequest's raw pointers reference guest memory that stays
// mapped for the lifetime of the process; only the worker thread that popped
// it off `procq` ever dereferences them, and only until it completes and
// drops the request.
unsafe impl Send for ParsedRequest {}

pub struct Block {
    device_id: String,
    image: Mutex<File>,
    config: BlkConfig,
    procq: Arc<(Mutex<VecDeque<ParsedRequest>>, Condvar)>,
    closing: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Block {
    pub fn new(img_path: &str, device_id: String) -> Result<Self> {
        let mut file = File::options().read(true).write(true).open(img_path)?;
        let capacity_bytes = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        let config = BlkConfig {
            capacity: capacity_bytes / SECTOR_SIZE,
            size_max: u32::MAX,
            seg_max: SEG_MAX,
        };

        Ok(Block {
            device_id,
            image: Mutex::new(file),
            config,
            procq: Arc::new((Mutex::new(VecDeque::new()), Condvar::new())),
            closing: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    /// Spawn the worker thread. Split from `new` so the device can be built
    /// (e.g. for config-space reads) before committing to a live thread.
    pub fn start_worker(
        &mut self,
        mem: GuestMemory,
        queues: Vec<Arc<Mutex<Virtqueue>>>,
        bridge: Arc<Bridge>,
        zone_id: u32,
        irq_id: u32,
    ) {
        let procq = self.procq.clone();
        let closing = self.closing.clone();
        let device_id = self.device_id.clone();
        let image = self.image.lock().unwrap().try_clone().expect("dup image fd");

        self.worker = Some(std::thread::spawn(move || {
            worker_loop(image, device_id, procq, closing, mem, queues, bridge, zone_id, irq_id)
        }));
    }

    pub fn read_config(&self, offset: usize, data: &mut [u8]) {
        let mut buf = [0u8; 16];
        LittleEndian::write_u64(&mut buf[0..8], self.config.capacity);
        LittleEndian::write_u32(&mut buf[8..12], self.config.size_max);
        LittleEndian::write_u32(&mut buf[12..16], self.config.seg_max);
        for (i, b) in data.iter_mut().enumerate() {
            *b = buf.get(offset + i).copied().unwrap_or(0);
        }
    }

    /// Parse every available chain on the (single) block queue and hand the
    /// batch to the worker. Runs on the bridge thread (§4.6).
    pub fn notify(
        &mut self,
        mem: &GuestMemory,
        queues: &[Arc<Mutex<Virtqueue>>],
        _bridge: &Arc<Bridge>,
        _zone_id: u32,
        _irq_id: u32,
    ) -> Result<()> {
        let queue_index = 0usize;
        let vq = queues.get(queue_index).ok_or(VirtioError::QueueIndexOutOfBounds(0, queues.len()))?;

        let mut drained = Vec::new();
        {
            let mut q = vq.lock().unwrap();
            q.suppress_notifications(mem)?;
            while let Some(chain) = q.pop(mem)? {
                match parse_chain(queue_index, &chain) {
                    Ok(req) => drained.push(req),
                    Err(e) => {
                        warn!("block: malformed request chain: {e}");
                    }
                }
            }
            q.enable_notifications(mem)?;
        }

        if !drained.is_empty() {
            let (lock, cvar) = &*self.procq;
            let mut pending = lock.lock().unwrap();
            pending.extend(drained);
            cvar.notify_one();
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn test_stub() -> Self {
        Block {
            device_id: "hvisor-virblk".to_string(),
            image: Mutex::new(tempfile()),
            config: BlkConfig {
                capacity: 1024,
                size_max: u32::MAX,
                seg_max: SEG_MAX,
            },
            procq: Arc::new((Mutex::new(VecDeque::new()), Condvar::new())),
            closing: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);
        let (_, cvar) = &*self.procq;
        cvar.notify_all();
        if let Some(handle) = self.worker.take() {
            if let Err(e) = handle.join() {
                error!("block worker thread panicked: {e:?}");
            }
        }
    }
}

/// First descriptor: readable header. Last: 1-byte writable status. Middle:
/// data, direction implied by `type`. Length in `2..=SEG_MAX+2` (§4.6).
fn parse_chain(queue_index: usize, chain: &DescriptorChain) -> Result<ParsedRequest> {
    let n = chain.descriptors.len();
    if n < 2 || n as u32 > SEG_MAX + 2 {
        return Err(VirtioError::MalformedBlockChain("chain length out of range"));
    }

    let header = &chain.descriptors[0];
    if header.writable {
        return Err(VirtioError::MalformedBlockChain("header must be device-readable"));
    }
    if header.len != HEADER_SIZE {
        return Err(VirtioError::MalformedBlockChain("header size mismatch"));
    }
    let header_bytes = unsafe { std::slice::from_raw_parts(header.host_ptr, HEADER_SIZE as usize) };
    let kind = LittleEndian::read_u32(&header_bytes[0..4]);
    let sector = LittleEndian::read_u64(&header_bytes[8..16]);

    let status = &chain.descriptors[n - 1];
    if status.len != 1 || !status.writable {
        return Err(VirtioError::MalformedBlockChain(
            "status descriptor must be exactly 1 writable byte",
        ));
    }

    let data_is_in = kind == VIRTIO_BLK_T_IN || kind == VIRTIO_BLK_T_GET_ID;
    let mut data = Vec::with_capacity(n - 2);
    for d in &chain.descriptors[1..n - 1] {
        if data_is_in && !d.writable {
            return Err(VirtioError::MalformedBlockChain("IN data must be device-writable"));
        }
        if !data_is_in && d.writable {
            return Err(VirtioError::MalformedBlockChain("OUT data must be device-readable"));
        }
        data.push((d.host_ptr, d.len, d.writable));
    }

    Ok(ParsedRequest {
        queue_index,
        head: chain.head_index,
        kind,
        sector,
        data,
        status_ptr: status.host_ptr,
    })
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    mut image: File,
    device_id: String,
    procq: Arc<(Mutex<VecDeque<ParsedRequest>>, Condvar)>,
    closing: Arc<AtomicBool>,
    mem: GuestMemory,
    queues: Vec<Arc<Mutex<Virtqueue>>>,
    bridge: Arc<Bridge>,
    zone_id: u32,
    irq_id: u32,
) {
    let (lock, cvar) = &*procq;
    loop {
        let req = {
            let mut pending = lock.lock().unwrap();
            loop {
                if let Some(req) = pending.pop_front() {
                    break Some(req);
                }
                if closing.load(Ordering::Acquire) {
                    return;
                }
                pending = cvar.wait(pending).unwrap();
            }
        };
        let Some(req) = req else { return };

        let status = handle_one_request(&mut image, &device_id, &req);
        unsafe {
            std::ptr::write(req.status_ptr, status);
        }

        let vq = &queues[req.queue_index];
        let inject = {
            let mut q = vq.lock().unwrap();
            if let Err(e) = q.commit_used(&mem, req.head, 1) {
                error!("block: commit_used failed: {e}");
                continue;
            }
            q.should_inject_irq(&mem).unwrap_or(false)
        };
        if inject {
            if let Err(e) = bridge.post_response(zone_id, irq_id) {
                error!("block: post_response failed: {e}");
            }
        }
    }
}

fn handle_one_request(image: &mut File, device_id: &str, req: &ParsedRequest) -> u8 {
    match req.kind {
        VIRTIO_BLK_T_IN => do_read(image, req),
        VIRTIO_BLK_T_OUT => do_write(image, req),
        VIRTIO_BLK_T_GET_ID => {
            if let Some(&(ptr, len, _)) = req.data.first() {
                let bytes = device_id.as_bytes();
                let n = bytes.len().min(len as usize).min(20);
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, n);
                    if (len as usize) > n {
                        std::ptr::write_bytes(ptr.add(n), 0, len as usize - n);
                    }
                }
            }
            VIRTIO_BLK_S_OK
        }
        _ => VIRTIO_BLK_S_UNSUPP,
    }
}

fn do_read(image: &mut File, req: &ParsedRequest) -> u8 {
    let offset = req.sector * SECTOR_SIZE;
    if image.seek(SeekFrom::Start(offset)).is_err() {
        return VIRTIO_BLK_S_IOERR;
    }
    for &(ptr, len, _) in &req.data {
        let buf = unsafe { std::slice::from_raw_parts_mut(ptr, len as usize) };
        if let Err(e) = image.read_exact(buf) {
            warn!("block: read failed: {e}");
            return VIRTIO_BLK_S_IOERR;
        }
    }
    VIRTIO_BLK_S_OK
}

fn do_write(image: &mut File, req: &ParsedRequest) -> u8 {
    let offset = req.sector * SECTOR_SIZE;
    if image.seek(SeekFrom::Start(offset)).is_err() {
        return VIRTIO_BLK_S_IOERR;
    }
    for &(ptr, len, _) in &req.data {
        let buf = unsafe { std::slice::from_raw_parts(ptr, len as usize) };
        if let Err(e) = image.write_all(buf) {
            warn!("block: write failed: {e}");
            return VIRTIO_BLK_S_IOERR;
        }
    }
    VIRTIO_BLK_S_OK
}

#[cfg(test)]
fn tempfile() -> File {
    let mut path = std::env::temp_dir();
    path.push(format!("hvisord-blk-test-{}-{}", std::process::id(), rand_suffix()));
    File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .unwrap()
}

#[cfg(test)]
fn rand_suffix() -> u64 {
    use std::sync::atomic::AtomicU64;
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(ptr: *mut u8, len: u32, writable: bool) -> crate::queue::DescriptorEntry {
        crate::queue::DescriptorEntry { host_ptr: ptr, len, writable }
    }

    fn header_bytes(kind: u32, sector: u64) -> [u8; 16] {
        let mut buf = [0u8; 16];
        LittleEndian::write_u32(&mut buf[0..4], kind);
        LittleEndian::write_u64(&mut buf[8..16], sector);
        buf
    }

    #[test]
    fn parses_a_well_formed_in_request() {
        let mut header = header_bytes(VIRTIO_BLK_T_IN, 0);
        let mut data = [0u8; 512];
        let mut status = [0u8; 1];
        let chain = DescriptorChain {
            head_index: 0,
            descriptors: vec![
                desc(header.as_mut_ptr(), HEADER_SIZE, false),
                desc(data.as_mut_ptr(), 512, true),
                desc(status.as_mut_ptr(), 1, true),
            ],
        };
        let req = parse_chain(0, &chain).unwrap();
        assert_eq!(req.kind, VIRTIO_BLK_T_IN);
        assert_eq!(req.data.len(), 1);
    }

    #[test]
    fn rejects_non_writable_status_descriptor() {
        let mut header = header_bytes(VIRTIO_BLK_T_IN, 0);
        let mut data = [0u8; 512];
        let mut status = [0u8; 1];
        let chain = DescriptorChain {
            head_index: 0,
            descriptors: vec![
                desc(header.as_mut_ptr(), HEADER_SIZE, false),
                desc(data.as_mut_ptr(), 512, true),
                desc(status.as_mut_ptr(), 1, false),
            ],
        };
        assert!(parse_chain(0, &chain).is_err());
    }

    #[test]
    fn rejects_wrong_direction_data_descriptor() {
        let mut header = header_bytes(VIRTIO_BLK_T_OUT, 0);
        let mut data = [0u8; 512];
        let mut status = [0u8; 1];
        let chain = DescriptorChain {
            head_index: 0,
            descriptors: vec![
                desc(header.as_mut_ptr(), HEADER_SIZE, false),
                desc(data.as_mut_ptr(), 512, true), // OUT data must be readable, not writable
                desc(status.as_mut_ptr(), 1, true),
            ],
        };
        assert!(parse_chain(0, &chain).is_err());
    }

    #[test]
    fn get_id_copies_truncated_device_id_into_iov() {
        let mut image = tempfile();
        let mut data = [0xffu8; 8];
        let req = ParsedRequest {
            queue_index: 0,
            head: 0,
            kind: VIRTIO_BLK_T_GET_ID,
            sector: 0,
            data: vec![(data.as_mut_ptr(), 8, true)],
            status_ptr: std::ptr::null_mut(),
        };
        let status = handle_one_request(&mut image, "hvisor-virblk", &req);
        assert_eq!(status, VIRTIO_BLK_S_OK);
        assert_eq!(&data, b"hvisor-v");
    }

    #[test]
    fn unsupported_type_sets_unsupp_without_io() {
        let mut image = tempfile();
        let req = ParsedRequest {
            queue_index: 0,
            head: 0,
            kind: 9999,
            sector: 0,
            data: vec![],
            status_ptr: std::ptr::null_mut(),
        };
        let status = handle_one_request(&mut image, "hvisor-virblk", &req);
        assert_eq!(status, VIRTIO_BLK_S_UNSUPP);
    }

    #[test]
    fn read_then_write_round_trips_through_backing_file() {
        let mut image = tempfile();
        image.set_len(4096).unwrap();

        let mut payload = [0xAAu8; 512];
        let write_req = ParsedRequest {
            queue_index: 0,
            head: 0,
            kind: VIRTIO_BLK_T_OUT,
            sector: 0,
            data: vec![(payload.as_mut_ptr(), 512, false)],
            status_ptr: std::ptr::null_mut(),
        };
        assert_eq!(handle_one_request(&mut image, "id", &write_req), VIRTIO_BLK_S_OK);

        let mut readback = [0u8; 512];
        let read_req = ParsedRequest {
            queue_index: 0,
            head: 0,
            kind: VIRTIO_BLK_T_IN,
            sector: 0,
            data: vec![(readback.as_mut_ptr(), 512, true)],
            status_ptr: std::ptr::null_mut(),
        };
        assert_eq!(handle_one_request(&mut image, "id", &read_req), VIRTIO_BLK_S_OK);
        assert_eq!(readback, payload);
    }
}

//! Daemon entry point: parse devices off the command line, open the guest
//! memory mapping and the kernel shim, build every `VirtioDevice`, then run
//! the bridge's sigwait/backoff request loop forever (§6).

mod cli;

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use epoll::EventSet;
use log::{error, info, warn};

use address_space::GuestMemory;
use bridge::Bridge;
use machine_manager::{BlkDeviceConfig, DeviceConfig, NetworkInterfaceConfig, VmConfig};
use util::loop_context::EventLoop;
use virtio::block::Block;
use virtio::device::DeviceBackend;
use virtio::net::Net;
use virtio::queue::Virtqueue;
use virtio::virtio_mmio::MmioTransport;
use virtio::{VirtioDevice, VIRTIO_F_VERSION_1, VIRTIO_TYPE_BLOCK, VIRTIO_TYPE_NET};

const BLOCK_QUEUE_SIZE: u16 = 512;
const NET_QUEUE_SIZE: u16 = 256;

/// Shared between the bridge thread (every request) and, for net devices,
/// the event loop's TAP RX callback. Devices never added or removed after
/// startup, so only the per-device lock matters.
type DeviceHandle = Arc<Mutex<VirtioDevice>>;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        error!("hvisord: fatal: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = cli::Args::parse();

    let mut vm_config = VmConfig::default();
    for spec in &args.devices {
        vm_config
            .add_device(spec)
            .map_err(|e| anyhow!("invalid --device '{spec}': {e}"))?;
    }
    if vm_config.devices.is_empty() {
        warn!("hvisord: starting with no devices configured");
    }

    let mem = GuestMemory::new(&args.mem_path, args.mem_base, args.mem_size)
        .context("failed to map guest memory")?;

    // Blocking SIGHVI here, before any other thread is spawned, means every
    // thread spawned from this one (workers, the event loop) inherits the
    // block; only the dedicated bridge thread below unblocks it again.
    let bridge = Arc::new(Bridge::open().context("failed to open kernel shim")?);

    let event_loop = EventLoop::new().context("failed to create epoll instance")?;

    let mut devices: Vec<DeviceHandle> = Vec::new();
    for device_config in &vm_config.devices {
        devices.push(build_device(device_config, &mem, &event_loop, &bridge)?);
    }
    let devices = Arc::new(devices);

    {
        let devices = devices.clone();
        let mem = mem.clone();
        let bridge_for_thread = bridge.clone();
        std::thread::Builder::new()
            .name("bridge".to_string())
            .spawn(move || {
                unblock_bridge_signal();
                bridge_for_thread.run_request_loop(|req| {
                    let handle = devices.iter().find(|d| d.lock().unwrap().contains(req.address));
                    match handle {
                        Some(handle) => {
                            let mut device = handle.lock().unwrap();
                            if let Err(e) = device.handle_req(&mem, &bridge_for_thread, &req) {
                                error!("hvisord: device '{}' failed to handle request: {e}", device.id);
                            }
                        }
                        None => {
                            warn!("hvisord: request for unknown address {:#x}", req.address);
                            if !req.needs_interrupt {
                                bridge_for_thread.post_config_reply(req.src_cpu, 0);
                            }
                        }
                    }
                })
            })
            .context("failed to spawn bridge thread")?;
    }

    event_loop.spawn();

    info!("hvisord: running");
    loop {
        std::thread::park();
    }
}

fn unblock_bridge_signal() {
    if let Err(e) = vmm_sys_util::signal::unblock_signal(bridge::SIGHVI) {
        error!("hvisord: failed to unblock SIGHVI on bridge thread: {e}");
    }
}

fn build_device(
    config: &DeviceConfig,
    mem: &GuestMemory,
    event_loop: &Arc<EventLoop>,
    bridge: &Arc<Bridge>,
) -> Result<DeviceHandle> {
    match config {
        DeviceConfig::Blk(cfg) => build_block_device(cfg, mem, bridge),
        DeviceConfig::Net(cfg) => build_net_device(cfg, mem, event_loop, bridge),
    }
}

fn build_block_device(cfg: &BlkDeviceConfig, mem: &GuestMemory, bridge: &Arc<Bridge>) -> Result<DeviceHandle> {
    let device_id = if cfg.id.is_empty() { "hvisor-virblk".to_string() } else { cfg.id.clone() };
    let mut block =
        Block::new(&cfg.img, device_id.clone()).with_context(|| format!("opening block image {}", cfg.img))?;

    let queues = vec![Arc::new(Mutex::new(Virtqueue::new(BLOCK_QUEUE_SIZE)))];
    block.start_worker(mem.clone(), queues.clone(), bridge.clone(), cfg.zone_id, cfg.irq);

    let dev_features = (1u64 << VIRTIO_F_VERSION_1)
        | (1u64 << virtio::block::VIRTIO_BLK_F_SIZE_MAX)
        | (1u64 << virtio::block::VIRTIO_BLK_F_SEG_MAX);

    Ok(Arc::new(Mutex::new(VirtioDevice {
        id: device_id,
        zone_id: cfg.zone_id,
        irq_id: cfg.irq,
        base_addr: cfg.addr,
        len: cfg.len,
        transport: MmioTransport::new(VIRTIO_TYPE_BLOCK, dev_features),
        queues,
        backend: DeviceBackend::Block(block),
    })))
}

fn build_net_device(
    cfg: &NetworkInterfaceConfig,
    mem: &GuestMemory,
    event_loop: &Arc<EventLoop>,
    bridge: &Arc<Bridge>,
) -> Result<DeviceHandle> {
    let mac = parse_mac(cfg.mac.as_deref()).unwrap_or([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
    let net = Net::open(&cfg.tap, mac).with_context(|| format!("opening tap device {}", cfg.tap))?;
    let tap_fd = net.tap_fd();

    let queues = vec![
        Arc::new(Mutex::new(Virtqueue::new(NET_QUEUE_SIZE))),
        Arc::new(Mutex::new(Virtqueue::new(NET_QUEUE_SIZE))),
    ];

    let dev_features = (1u64 << VIRTIO_F_VERSION_1)
        | (1u64 << virtio::net::VIRTIO_NET_F_MAC)
        | (1u64 << virtio::net::VIRTIO_NET_F_STATUS);

    let device: DeviceHandle = Arc::new(Mutex::new(VirtioDevice {
        id: if cfg.id.is_empty() { format!("hvisor-virnet-{}", cfg.tap) } else { cfg.id.clone() },
        zone_id: cfg.zone_id,
        irq_id: cfg.irq,
        base_addr: cfg.addr,
        len: cfg.len,
        transport: MmioTransport::new(VIRTIO_TYPE_NET, dev_features),
        queues,
        backend: DeviceBackend::Net(net),
    }));

    let rx_handle = device.clone();
    let mem = mem.clone();
    let bridge = bridge.clone();
    event_loop
        .register(
            tap_fd,
            EventSet::IN,
            Box::new(move |_fd, _events| {
                let mut device = rx_handle.lock().unwrap();
                let VirtioDevice { queues, backend, zone_id, irq_id, .. } = &mut *device;
                if let DeviceBackend::Net(net) = backend {
                    net.rx_callback(&mem, queues, &bridge, *zone_id, *irq_id);
                }
            }),
        )
        .context("failed to register tap fd with event loop")?;

    Ok(device)
}

fn parse_mac(mac: Option<&str>) -> Option<[u8; 6]> {
    let mac = mac?;
    let mut bytes = [0u8; 6];
    for (i, part) in mac.split(':').enumerate() {
        if i >= 6 {
            return None;
        }
        bytes[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(bytes)
}

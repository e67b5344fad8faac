//! # bridge
//!
//! The shared-page protocol between the hypervisor, the kernel shim, and
//! this daemon: a request ring the kernel produces into and the daemon
//! drains, a response ring the reverse, per-vCPU config-reply slots, and the
//! `SIGHVI`-driven idle/wake loop that lets the request thread avoid both
//! busy-spinning and syscall-per-request latency.

pub mod error;
pub mod ring;
pub mod shim;

use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use log::{error, trace, warn};
use vmm_sys_util::signal::block_signal;

pub use error::{Error, Result};
pub use ring::{DeviceReq, DeviceRes};

use ring::{is_queue_full, MAX_REQ};
use shim::KernelShim;

/// The reserved real-time signal the kernel shim uses to wake the bridge
/// thread out of `sigwait` when it has enqueued a request and observed
/// `need_wakeup == 1`. Agreed at build time with the kernel module.
pub const SIGHVI: libc::c_int = 10;

/// Bound on the spin phase of the idle loop before the daemon commits to
/// `need_wakeup=1` and a blocking `nanosleep`/`sigwait`. Matches the
/// original daemon's tuning: enough to absorb a burst without a syscall,
/// short enough not to waste a core when traffic is genuinely idle.
const SPIN_ITERATIONS: u64 = 10_000_000;
const BACKOFF: Duration = Duration::from_nanos(100);

/// Owns the kernel shim fd/mapping and the response-ring mutex. One
/// instance per daemon process, shared (via `Arc`) with every device.
pub struct Bridge {
    shim: KernelShim,
    /// Serialises `post_response` across every device worker thread, as the
    /// response ring has one producer slot but many callers (§5: "The
    /// response ring mutex (RES_MUTEX) serialises interrupt injection
    /// across all devices").
    res_mutex: Mutex<()>,
}

impl Bridge {
    /// Open the kernel shim and block `SIGHVI` on the calling thread. The
    /// caller must install the process-wide signal mask (blocking `SIGHVI`
    /// on every thread it spawns) before calling [`Bridge::run_request_loop`]
    /// on whichever thread should be the bridge thread.
    pub fn open() -> Result<Self> {
        block_signal(SIGHVI).map_err(|e| Error::Signal(std::io::Error::from_raw_os_error(e.errno())))?;
        let shim = KernelShim::open()?;
        Ok(Bridge {
            shim,
            res_mutex: Mutex::new(()),
        })
    }

    /// Non-blocking: `Some` if the request ring has an entry waiting.
    pub fn poll_request(&self) -> Option<DeviceReq> {
        self.shim.page().poll_request()
    }

    /// Publish `{target_zone, irq_id}` on the response ring and tell the
    /// kernel to look at it. Spin-blocks while the ring is full — per §7
    /// this is backpressure, not an error, because the kernel consumer is
    /// expected to drain promptly.
    pub fn post_response(&self, target_zone: u32, irq_id: u32) -> Result<()> {
        let page = self.shim.page();
        loop {
            let head = page.resp_head.load(Ordering::Acquire);
            let tail = page.resp_tail.load(Ordering::Acquire);
            if !is_queue_full(head, tail) {
                break;
            }
            std::hint::spin_loop();
        }

        {
            let _guard = self.res_mutex.lock().unwrap();
            let tail = page.resp_tail.load(Ordering::Acquire);
            // Safety: resp[] is only mutated here, under res_mutex, and only
            // at `tail`, which the kernel consumer has not yet reached
            // (verified by the fullness check above).
            let slot = unsafe {
                let ptr = page.resp.as_ptr().add(tail as usize) as *mut DeviceRes;
                &mut *ptr
            };
            slot.target_zone = target_zone;
            slot.irq_id = irq_id;
            page.resp_tail
                .store(tail.wrapping_add(1) & (MAX_REQ - 1), Ordering::Release);
        }

        self.shim.finish_req()
    }

    /// Write the per-vCPU config reply and bump its flag. No ioctl: the
    /// kernel is spinning on `cfg_flags[cpu]` and will observe the
    /// increment directly from the shared page.
    pub fn post_config_reply(&self, cpu: u64, value: u64) {
        let page = self.shim.page();
        let cpu = cpu as usize;
        page.cfg_values[cpu].store(value, Ordering::Relaxed);
        page.cfg_flags[cpu].fetch_add(1, Ordering::Release);
    }

    /// Run the sigwait/backoff idle loop forever, calling `handle` for every
    /// request drained from the ring. This must run on the one thread that
    /// has `SIGHVI` unblocked (see [`Bridge::open`]); every other thread in
    /// the process must keep it masked.
    pub fn run_request_loop<F: FnMut(DeviceReq)>(&self, mut handle: F) -> ! {
        let page = self.shim.page();
        page.need_wakeup.store(1, Ordering::Release);

        let mut wait_set: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut wait_set);
            libc::sigaddset(&mut wait_set, SIGHVI);
        }

        loop {
            let mut sig: libc::c_int = 0;
            let ret = unsafe { libc::sigwait(&wait_set, &mut sig) };
            if ret != 0 {
                warn!("sigwait failed: {}", std::io::Error::from_raw_os_error(ret));
                continue;
            }
            if sig != SIGHVI {
                error!("bridge thread observed unexpected signal {sig}");
                continue;
            }

            let mut spins: u64 = 0;
            loop {
                if let Some(req) = page.poll_request() {
                    spins = 0;
                    page.need_wakeup.store(0, Ordering::Release);
                    trace!("bridge: dispatching request from cpu {}", req.src_cpu);
                    handle(req);
                    continue;
                }

                spins += 1;
                if spins < SPIN_ITERATIONS {
                    continue;
                }
                spins = 0;
                page.need_wakeup.store(1, Ordering::Release);
                std::thread::sleep(BACKOFF);
                if page.req_is_empty() {
                    break;
                }
            }
        }
    }

    pub fn shim(&self) -> &KernelShim {
        &self.shim
    }
}

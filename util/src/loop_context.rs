//! A single epoll instance driven by a dedicated thread.
//!
//! Modeled on the original daemon's `mevent` monitor (`add_event` /
//! `mevent_loop`): one `epoll_fd`, callbacks invoked synchronously on the
//! loop's own thread, and no de-registration path since devices live for the
//! process lifetime.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use epoll::{ControlOptions, Epoll, EpollEvent, EventSet};
use log::{error, warn};

/// A handler invoked on the event loop thread when `fd` becomes ready for
/// the registered event set. Handlers must not block.
pub type NotifierCallback = Box<dyn FnMut(RawFd, EventSet) + Send>;

struct Registration {
    callback: Mutex<NotifierCallback>,
}

const MAX_EVENTS: usize = 64;

/// epoll-driven dispatcher. One instance per daemon; every device that needs
/// to watch a file descriptor (currently: net TAP RX) registers with it.
pub struct EventLoop {
    epoll: Epoll,
    registrations: Mutex<HashMap<RawFd, Arc<Registration>>>,
}

impl EventLoop {
    pub fn new() -> io::Result<Arc<Self>> {
        Ok(Arc::new(EventLoop {
            epoll: Epoll::new()?,
            registrations: Mutex::new(HashMap::new()),
        }))
    }

    /// Register `fd` for `events`; `callback` runs synchronously on the loop
    /// thread whenever the kernel reports activity on `fd`.
    pub fn register(
        self: &Arc<Self>,
        fd: RawFd,
        events: EventSet,
        callback: NotifierCallback,
    ) -> io::Result<()> {
        let registration = Arc::new(Registration {
            callback: Mutex::new(callback),
        });
        self.epoll
            .ctl(ControlOptions::Add, fd, EpollEvent::new(events, fd as u64))?;
        self.registrations.lock().unwrap().insert(fd, registration);
        Ok(())
    }

    /// Spawn the dedicated thread that drives `epoll_wait` forever.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        thread::Builder::new()
            .name("event-loop".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn event loop thread")
    }

    fn run(&self) {
        let mut events = vec![EpollEvent::new(EventSet::empty(), 0); MAX_EVENTS];
        loop {
            match self.epoll.wait(MAX_EVENTS, -1, &mut events[..]) {
                Ok(count) => {
                    for ev in &events[..count] {
                        let fd = ev.data() as RawFd;
                        let handler = self.registrations.lock().unwrap().get(&fd).cloned();
                        match handler {
                            Some(registration) => {
                                (registration.callback.lock().unwrap())(fd, ev.event_set());
                            }
                            None => warn!("event-loop: no handler registered for fd {fd}"),
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => error!("epoll_wait failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    #[test]
    fn registered_fd_invokes_callback_on_readable() {
        let event_loop = EventLoop::new().expect("epoll instance");
        let (rd, wr) = nix_pipe();
        let hits = StdArc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        event_loop
            .register(
                rd,
                EventSet::IN,
                Box::new(move |_fd, _events| {
                    let mut buf = [0u8; 1];
                    unsafe {
                        libc::read(rd, buf.as_mut_ptr() as *mut libc::c_void, 1);
                    }
                    hits_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        let _join = event_loop.spawn();
        unsafe {
            libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1);
        }
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        unsafe {
            libc::close(wr);
        }
    }

    fn nix_pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }
}

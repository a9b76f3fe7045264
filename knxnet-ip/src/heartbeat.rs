//! Periodically probes liveness via connection-state requests and triggers
//! connection cleanup on persistent failure (§4.4).
//!
//! Runs as a single actor with its own lock+condition pair, distinct from
//! the connection's state mutex (§5), so the sender and the
//! response-delivery path can rendezvous without contending on the
//! connection's own lock. The sender holds the lock across sending the
//! probe and entering the wait, so a response delivered immediately after
//! the probe goes out cannot be lost before the wait begins (§9).

use crate::error::EngineError;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
pub const PROBE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_FAILED_PROBES: u32 = 4;

struct Inner {
    waiting: bool,
    last_status: Option<u8>,
}

struct Shared {
    inner: Mutex<Inner>,
    cond: Condvar,
    stop: AtomicBool,
}

/// The heartbeat actor. Exists iff the owning connection has reached OK at
/// least once and not yet reached CLOSED.
pub struct Heartbeat {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn start<S, E>(send_probe: S, on_exhausted: E) -> Heartbeat
    where
        S: FnMut() -> Result<(), EngineError> + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                waiting: false,
                last_status: None,
            }),
            cond: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || Self::run(worker_shared, send_probe, on_exhausted));

        Heartbeat {
            shared,
            handle: Some(handle),
        }
    }

    fn run<S, E>(shared: Arc<Shared>, mut send_probe: S, on_exhausted: E)
    where
        S: FnMut() -> Result<(), EngineError>,
        E: FnOnce(),
    {
        loop {
            if Self::sleep_interruptible(&shared, HEARTBEAT_INTERVAL) {
                debug!("heartbeat loop exiting: quit requested during sleep");
                return;
            }

            let mut consecutive_failures = 0;
            let mut succeeded = false;

            while consecutive_failures < MAX_FAILED_PROBES {
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }

                if Self::probe_once(&shared, &mut send_probe) {
                    succeeded = true;
                    break;
                }
                consecutive_failures += 1;
            }

            if !succeeded {
                warn!("heartbeat exhausted after {MAX_FAILED_PROBES} consecutive failed probes");
                on_exhausted();
                return;
            }
        }
    }

    /// Sends one probe and waits for a matching connection-state response.
    /// Returns `true` only on a NO_ERROR response; a non-zero status is
    /// logged and does not count as success (§4.4).
    fn probe_once<S>(shared: &Arc<Shared>, send_probe: &mut S) -> bool
    where
        S: FnMut() -> Result<(), EngineError>,
    {
        let mut inner = shared.inner.lock().unwrap();
        inner.waiting = true;
        inner.last_status = None;

        if let Err(err) = send_probe() {
            warn!("failed to send heartbeat probe: {err}");
            inner.waiting = false;
            return false;
        }

        let (mut inner, timeout_result) = shared
            .cond
            .wait_timeout_while(inner, PROBE_RESPONSE_TIMEOUT, |i| i.waiting)
            .unwrap();

        inner.waiting = false;

        if timeout_result.timed_out() {
            debug!("heartbeat probe timed out waiting for a response");
            return false;
        }

        match inner.last_status.take() {
            Some(0x00) => {
                debug!("heartbeat probe succeeded");
                true
            }
            Some(status) => {
                warn!("heartbeat probe received non-zero status 0x{status:02X}");
                false
            }
            None => false,
        }
    }

    /// Waits up to `duration`, woken early by `quit`. Returns `true` if a
    /// stop was requested.
    fn sleep_interruptible(shared: &Arc<Shared>, duration: Duration) -> bool {
        let guard = shared.inner.lock().unwrap();
        let _ = shared
            .cond
            .wait_timeout_while(guard, duration, |_| !shared.stop.load(Ordering::Acquire))
            .unwrap();
        shared.stop.load(Ordering::Acquire)
    }

    /// Delivers a CONNECTIONSTATE_RES status from the dispatch path.
    /// Edge-triggered: a response that arrives while the monitor is not
    /// waiting is lost, and the current probe cycle must time out on its
    /// own (§4.4).
    pub fn on_response(&self, status: u8) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.last_status = Some(status);
        inner.waiting = false;
        self.shared.cond.notify_one();
    }

    /// Sets the stop flag, interrupts the sleeping/waiting actor, and joins
    /// it. Idempotent; a self-join (`quit` called from the heartbeat thread
    /// itself, e.g. from `on_exhausted`) is skipped.
    pub fn quit(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.cond.notify_one();

        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.quit();
    }
}

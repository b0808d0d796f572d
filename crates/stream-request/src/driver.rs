//! Drivers advancing requests.
//!
//! Both drivers call [`Request::tick`] in a loop and differ only in how they wait between ticks:
//! - [`Scheduler`] is cooperative: an external loop (a frame callback, a game loop) calls
//!   [`Scheduler::tick`] and every registered request advances once.
//! - [`poll_until_complete`] is for async callers: it sleeps a fixed interval between ticks and
//!   reacts to cancellation immediately.

use std::time::Duration;

use parking_lot::Mutex;
use tracing::{instrument, trace};

use crate::request::Request;

/// Object-safe view of a request for schedulers.
pub trait Tick: Send + Sync {
    fn id(&self) -> u64;

    /// Advance once; `true` when finished.
    fn tick(&self) -> bool;

    fn cancel(&self);
}

impl<T: Send + 'static> Tick for Request<T> {
    fn id(&self) -> u64 {
        Request::id(self)
    }

    fn tick(&self) -> bool {
        Request::tick(self)
    }

    fn cancel(&self) {
        Request::cancel(self)
    }
}

/// Cooperative per-tick driver.
#[derive(Default)]
pub struct Scheduler {
    pending: Mutex<Vec<Box<dyn Tick>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request: Box<dyn Tick>) {
        trace!(id = request.id(), "scheduler: register");
        self.pending.lock().push(request);
    }

    /// Advance every registered request once and drop the finished ones.
    /// Returns how many requests remain registered.
    ///
    /// Requests registered from inside a callback during this call are advanced on the next
    /// call.
    pub fn tick(&self) -> usize {
        let mut batch = std::mem::take(&mut *self.pending.lock());
        batch.retain(|request| !request.tick());

        let mut pending = self.pending.lock();
        batch.append(&mut pending);
        *pending = batch;
        pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Cancel a registered request by id. Returns `false` if no such request is registered.
    pub fn cancel(&self, id: u64) -> bool {
        let request = {
            let mut pending = self.pending.lock();
            let Some(pos) = pending.iter().position(|r| r.id() == id) else {
                return false;
            };
            pending.remove(pos)
        };
        request.cancel();
        true
    }

    /// Cancel every registered request.
    pub fn cancel_all(&self) {
        let batch = std::mem::take(&mut *self.pending.lock());
        for request in batch {
            request.cancel();
        }
    }

    /// Tick once per `frame` until no request is registered.
    pub async fn run(&self, frame: Duration) {
        let mut interval = tokio::time::interval(frame);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.tick() == 0 {
                break;
            }
        }
    }
}

/// Drive `request` until it finishes, sleeping `interval` between ticks.
///
/// Cancellation through the request's token is applied as soon as it happens, not at the next
/// poll.
#[instrument(skip_all, fields(id = request.id()))]
pub async fn poll_until_complete<T: Send + 'static>(request: &Request<T>, interval: Duration) {
    let cancel = request.cancellation_token();
    loop {
        if request.tick() {
            break;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                request.cancel();
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
    trace!("poll driver: finished");
}

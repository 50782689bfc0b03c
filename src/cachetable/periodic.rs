use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{CacheError, Result};

/// Wakeup schedule of one background thread: a period, explicit kicks and a
/// stop flag.
pub(crate) struct Periodic {
    state: Mutex<PeriodicState>,
    cv: Condvar,
}

struct PeriodicState {
    period: Option<Duration>,
    kicked: bool,
    stopped: bool,
}

impl Periodic {
    pub fn new(period: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PeriodicState {
                period,
                kicked: false,
                stopped: false,
            }),
            cv: Condvar::new(),
        })
    }

    pub fn set_period(&self, period: Option<Duration>) {
        self.state.lock().period = period;
        self.cv.notify_all();
    }

    /// Requests a run as soon as possible.
    pub fn kick(&self) {
        let mut state = self.state.lock();
        if !state.kicked {
            state.kicked = true;
            self.cv.notify_all();
        }
    }

    pub fn stop(&self) {
        self.state.lock().stopped = true;
        self.cv.notify_all();
    }

    /// Blocks until the next run is due. Returns false once stopped.
    pub fn wait_next(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return false;
            }
            if state.kicked {
                state.kicked = false;
                return true;
            }
            match state.period {
                None => self.cv.wait(&mut state),
                Some(period) => {
                    if self.cv.wait_for(&mut state, period).timed_out() && !state.stopped {
                        state.kicked = false;
                        return true;
                    }
                }
            }
        }
    }
}

/// Runs `body` on a named thread each time `schedule` fires, for as long as
/// `target` is alive.
pub(crate) fn spawn_periodic<T: Send + Sync + 'static>(
    name: &str,
    target: Weak<T>,
    schedule: Arc<Periodic>,
    body: fn(&Arc<T>),
) -> Result<JoinHandle<()>> {
    let thread_name = name.to_string();
    thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            while schedule.wait_next() {
                let Some(target) = target.upgrade() else {
                    break;
                };
                body(&target);
            }
            debug!(thread = %thread_name, "cachetable.background.exit");
        })
        .map_err(CacheError::from)
}

//! Background cleaner: picks the page with the most pending work among a
//! small window of the ring and hands it, pinned, to its owner.

use std::sync::Arc;

use tracing::{debug, warn};

use super::guard::ValueGuard;
use super::ops::Payload;
use super::pair::Pair;
use super::status::StatCounters;
use super::table::Shared;

impl<P: Payload> Shared<P> {
    /// Runs the configured number of cleaner iterations. Returns how many
    /// callbacks ran.
    pub(crate) fn run_cleaner_once(self: &Arc<Self>) -> usize {
        if self.check_usable().is_err() {
            return 0;
        }
        let iterations = self.options.lock().cleaner_iterations.max(1);
        let mut executed = 0;
        for _ in 0..iterations {
            let Some(pair) = self.pick_cleaner_candidate() else {
                continue;
            };
            if self.clean_pair(pair) {
                executed += 1;
            }
        }
        executed
    }

    fn pick_cleaner_candidate(&self) -> Option<Arc<Pair<P>>> {
        let window = self.index.write().advance_cleaner();
        let mut best: Option<(i64, Arc<Pair<P>>)> = None;
        for pair in window {
            let pressure = {
                let meta = pair.meta();
                if meta.is_busy() {
                    continue;
                }
                meta.attr.cache_pressure_size
            };
            if pressure > 0 && best.as_ref().map_or(true, |(top, _)| pressure > *top) {
                best = Some((pressure, pair));
            }
        }
        best.map(|(_, pair)| pair)
    }

    fn clean_pair(self: &Arc<Self>, pair: Arc<Pair<P>>) -> bool {
        let Some(mut guard) = pair.value.try_write_arc() else {
            return false;
        };
        if pair.meta().is_busy() {
            return false;
        }
        let pin = {
            let Some(_gate) = self.checkpoint_gate.try_read() else {
                return false;
            };
            if let Err(err) = self.settle_checkpoint_before_mutation(&pair, &mut guard) {
                warn!(key = %pair.key(), error = %err, "cachetable.cleaner.checkpoint_failed");
                return false;
            }
            self.pin(Arc::clone(&pair), ValueGuard::Write(guard))
        };
        let key = pin.page_id();
        match pair.ops.cleaner(pin) {
            Ok(()) => {
                StatCounters::bump(&self.stats.cleaner_executions);
                debug!(page = %key, "cachetable.cleaner.executed");
                true
            }
            Err(err) => {
                warn!(page = %key, error = %err, "cachetable.cleaner.failed");
                false
            }
        }
    }

    pub(crate) fn cleaner_pass(shared: &Arc<Self>) {
        let executed = shared.run_cleaner_once();
        if executed > 0 {
            debug!(executed, "cachetable.cleaner.pass");
        }
    }
}

use std::sync::atomic::{AtomicI64, Ordering};

use crate::model::Ms;

use super::conflict::now_ms;

/// Process-wide source of `last_modified` stamps.
///
/// Stamps track wall-clock milliseconds but never repeat and never go backwards, so a
/// record's next stamp is always strictly greater than its previous one even when the
/// system clock stalls or jumps back.
pub struct StampClock {
    last: AtomicI64,
}

impl StampClock {
    pub fn new() -> Self {
        Self { last: AtomicI64::new(0) }
    }

    /// Make sure future stamps sort after `stamp` (used while replaying the WAL).
    pub fn observe(&self, stamp: Ms) {
        self.last.fetch_max(stamp, Ordering::AcqRel);
    }

    /// The last stamp handed out or observed.
    pub fn current(&self) -> Ms {
        self.last.load(Ordering::Acquire)
    }

    /// A fresh stamp greater than both every stamp handed out so far and `previous`.
    pub fn next_after(&self, previous: Option<Ms>) -> Ms {
        let floor = previous.unwrap_or(Ms::MIN);
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let candidate = now_ms().max(last + 1).max(floor.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }
}

impl Default for StampClock {
    fn default() -> Self {
        Self::new()
    }
}

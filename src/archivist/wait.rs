//! Deadlines for files another process has not written yet. The poll loop checks
//! once per tick instead of sleeping, so a missing file never stalls a tick.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready { waited_secs: u64 },
    Pending { waited_secs: u64 },
    GaveUp { waited_secs: u64 },
}

/// Per-slot clocks started by the first unsuccessful check.
#[derive(Debug, Default)]
pub struct Deadlines {
    max_wait_secs: u64,
    started: BTreeMap<String, u64>,
}

impl Deadlines {
    pub fn new(max_wait_secs: u64) -> Self {
        Self {
            max_wait_secs,
            started: BTreeMap::new(),
        }
    }

    /// Records one look at `slot` at `now`. A slot that is ready or has given up
    /// forgets its clock.
    pub fn check(&mut self, slot: &str, now: u64, ready: bool) -> WaitOutcome {
        let started = match self.started.get(slot) {
            Some(started) => *started,
            None if ready => now,
            None => {
                self.started.insert(slot.to_string(), now);
                now
            }
        };
        let waited_secs = now.saturating_sub(started);
        if ready {
            self.started.remove(slot);
            return WaitOutcome::Ready { waited_secs };
        }
        if waited_secs >= self.max_wait_secs {
            self.started.remove(slot);
            return WaitOutcome::GaveUp { waited_secs };
        }
        WaitOutcome::Pending { waited_secs }
    }

    pub fn pending(&self) -> usize {
        self.started.len()
    }
}

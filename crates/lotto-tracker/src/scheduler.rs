//! Per-job poll bookkeeping: at most one poll task per key, and the
//! decision table for what a status reply means.

use std::collections::HashMap;

use lotto_download::JobStatus;
use tokio_util::sync::CancellationToken;

/// How a job came to be polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollSeed {
    /// Started here, or restored from saved state.
    Direct,
    /// Discovered by a reconciliation pass.
    Reconciled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Polling,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep polling and record the reply.
    Continue,
    /// Keep polling, ignore the reply (the client has not registered the
    /// torrent yet).
    Pending,
    Complete,
    Fail,
    /// The job no longer exists; drop it now.
    Gone,
}

pub fn judge(status: JobStatus, seed: PollSeed, queried_by_container: bool) -> Verdict {
    match status {
        JobStatus::InProgress | JobStatus::Unknown => Verdict::Continue,
        JobStatus::Completed => Verdict::Complete,
        JobStatus::Error => Verdict::Fail,
        JobStatus::NotFound => {
            if seed == PollSeed::Reconciled || queried_by_container {
                Verdict::Gone
            } else {
                Verdict::Pending
            }
        }
    }
}

#[derive(Debug)]
enum PollSlot {
    Polling {
        epoch: u64,
        seed: PollSeed,
        cancel: CancellationToken,
    },
    Terminal {
        epoch: u64,
    },
}

/// A slot exists from the first poll until the job is removed; its epoch
/// lets late replies and timers from an older incarnation of the same key
/// recognise themselves as stale.
#[derive(Debug, Default)]
pub struct PollSlots {
    next_epoch: u64,
    slots: HashMap<String, PollSlot>,
}

impl PollSlots {
    /// Claims the key for a new poll task. Returns `None` when a task is
    /// already running or the job has reached a terminal state.
    pub fn try_start(
        &mut self,
        key: &str,
        seed: PollSeed,
        parent: &CancellationToken,
    ) -> Option<(u64, CancellationToken)> {
        if self.slots.contains_key(key) {
            return None;
        }
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let cancel = parent.child_token();
        self.slots.insert(
            key.to_string(),
            PollSlot::Polling {
                epoch,
                seed,
                cancel: cancel.clone(),
            },
        );
        Some((epoch, cancel))
    }

    pub fn phase(&self, key: &str) -> PollPhase {
        match self.slots.get(key) {
            None => PollPhase::Idle,
            Some(PollSlot::Polling { .. }) => PollPhase::Polling,
            Some(PollSlot::Terminal { .. }) => PollPhase::Terminal,
        }
    }

    /// The seed of the live task with this epoch, if it is still current.
    pub fn current_seed(&self, key: &str, epoch: u64) -> Option<PollSeed> {
        match self.slots.get(key) {
            Some(PollSlot::Polling { epoch: e, seed, .. }) if *e == epoch => Some(*seed),
            _ => None,
        }
    }

    pub fn is_terminal(&self, key: &str, epoch: u64) -> bool {
        matches!(self.slots.get(key), Some(PollSlot::Terminal { epoch: e }) if *e == epoch)
    }

    /// Moves a live task to terminal and cancels it.
    pub fn finish(&mut self, key: &str, epoch: u64) -> bool {
        if self.current_seed(key, epoch).is_none() {
            return false;
        }
        if let Some(PollSlot::Polling { cancel, .. }) =
            self.slots.insert(key.to_string(), PollSlot::Terminal { epoch })
        {
            cancel.cancel();
        }
        true
    }

    /// Forgets the key entirely, cancelling a live task first.
    pub fn clear(&mut self, key: &str) {
        if let Some(PollSlot::Polling { cancel, .. }) = self.slots.remove(key) {
            cancel.cancel();
        }
    }

    pub fn active(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s, PollSlot::Polling { .. }))
            .count()
    }
}

//! Lock hierarchy bookkeeping.
//!
//! Deadlock avoidance rests on a fixed acquisition order: registry lock,
//! then the volume lock, then parent object main locks before child main
//! locks, then paging locks. Release happens in exactly the reverse order.
//! The [`LockLedger`] records what the current request holds so that
//! re-entrant or wrong-mode or out-of-order acquisition can be detected and
//! logged; it diagnoses violations, it does not prevent them.

use log::warn;
use std::sync::Mutex;

/// Position of a lock in the global acquisition order. Two `File` claims
/// are legal in sequence only as parent-before-child, which the ledger
/// cannot verify structurally; everything else is rank-ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Rank {
    Registry,
    Volume,
    File,
    Paging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    rank: Rank,
    owner: u64,
    mode: Mode,
}

/// Per-request record of held locks.
#[derive(Debug, Default)]
pub struct LockLedger {
    held: Mutex<Vec<Claim>>,
}

impl LockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mode in which this request already holds the given lock, if any.
    pub fn held(&self, rank: Rank, owner: u64) -> Option<Mode> {
        self.held
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.rank == rank && c.owner == owner)
            .map(|c| c.mode)
    }

    /// Inspect before acquiring. Returns `true` when a fresh acquisition is
    /// needed; logs (and returns `false`) when the lock is already held so
    /// the caller can skip the acquire instead of self-deadlocking.
    pub fn check_before_acquire(&self, rank: Rank, owner: u64, want: Mode) -> bool {
        match self.held(rank, owner) {
            None => true,
            Some(have) if have == want => {
                warn!("re-entrant {:?} acquisition of {:?}/{}", want, rank, owner);
                false
            }
            Some(have) => {
                warn!(
                    "wrong-mode reacquisition of {:?}/{}: held {:?}, wanted {:?}",
                    rank, owner, have, want
                );
                false
            }
        }
    }

    /// Record an acquisition, flagging hierarchy violations.
    pub fn note(&self, rank: Rank, owner: u64, mode: Mode) {
        let mut held = self.held.lock().unwrap();
        if let Some(last) = held.last() {
            if last.rank > rank {
                warn!(
                    "lock order violation: {:?}/{} acquired while holding {:?}/{}",
                    rank, owner, last.rank, last.owner
                );
            }
        }
        if held.iter().any(|c| c.rank == rank && c.owner == owner) {
            warn!("re-entrant acquisition of {:?}/{} recorded", rank, owner);
        }
        held.push(Claim { rank, owner, mode });
    }

    /// Record a release. Releases must unwind in reverse acquisition order.
    pub fn done(&self, rank: Rank, owner: u64) {
        let mut held = self.held.lock().unwrap();
        match held.last() {
            Some(last) if last.rank == rank && last.owner == owner => {
                held.pop();
            }
            _ => {
                warn!("out-of-order release of {:?}/{}", rank, owner);
                if let Some(pos) = held
                    .iter()
                    .rposition(|c| c.rank == rank && c.owner == owner)
                {
                    held.remove(pos);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock().unwrap().is_empty()
    }
}

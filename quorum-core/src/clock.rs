//! Lamport clock and write stamps.
//!
//! Every operation carries a [`Stamp`]: a monotonic counter paired with the
//! replica that issued it. Stamps form a total order across all replicas,
//! `(counter, replica)`, so concurrent writes to the same register always
//! resolve the same way everywhere.
//!
//! Reference: Lamport, "Time, Clocks, and the Ordering of Events" (1978)

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a replica (one engine instance).
pub type ReplicaId = Uuid;

/// Logical timestamp of an operation.
///
/// Ordered by `counter` first, then by `replica` as a deterministic
/// tie-break for equal counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub counter: u64,
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(counter: u64, replica: ReplicaId) -> Self {
        Self { counter, replica }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, &self.replica.to_string()[..8])
    }
}

/// Replica-local Lamport clock.
#[derive(Debug, Clone)]
pub struct LamportClock {
    replica: ReplicaId,
    counter: u64,
}

impl LamportClock {
    pub fn new(replica: ReplicaId) -> Self {
        Self { replica, counter: 0 }
    }

    /// Generate a stamp strictly greater than every stamp this clock has
    /// issued or observed.
    pub fn tick(&mut self) -> Stamp {
        self.counter += 1;
        Stamp::new(self.counter, self.replica)
    }

    /// Merge a remote stamp so the next `tick()` dominates it.
    pub fn observe(&mut self, remote: &Stamp) {
        if remote.counter > self.counter {
            self.counter = remote.counter;
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Current counter value (last issued or observed).
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

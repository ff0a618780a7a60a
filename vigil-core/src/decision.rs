//! Decision mailbox and the per-identity blocking wait protocol.
//!
//! An interception thread that cannot resolve a verdict from the
//! classification lists publishes the event and then parks on the subject
//! identity until the remote policy engine answers or a timeout elapses.
//! The [`DecisionLedger`] realizes both halves of that hand-off:
//!
//! - a bounded [`IdentityCache`] acting as the decision mailbox, written by
//!   the control surface and read after a wake;
//! - an explicit registry of per-identity wait handles, so a decision write
//!   for identity `X` wakes exactly the threads parked on `X` and nothing
//!   else.
//!
//! A waiter that times out removes its handle from the registry under the
//! registry lock, so a decision arriving afterwards can never wake a thread
//! that already gave up. The late verdict still lands in the mailbox, where
//! it stays until overwritten, deleted by a sentinel write, or dropped by a
//! capacity clear.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::cache::IdentityCache;

/// Authorization verdict for an intercepted operation.
///
/// The numeric codes travel through the decision mailbox, whose sentinel is
/// `0`. `Defer` deliberately shares that code: an explicit defer, a pending
/// answer, and a timed-out wait are indistinguishable to the caller and all
/// resolve to the default (fail-open) action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Verdict {
    /// No opinion; the operation proceeds under the default action.
    Defer = 0,
    /// The operation is explicitly authorized.
    Allow = 1,
    /// The operation is explicitly rejected.
    Deny = 2,
}

impl Verdict {
    /// Numeric mailbox code for this verdict.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Decodes a mailbox code. The sentinel and any unknown code map to
    /// `Defer`, the fail-open default.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Verdict::Allow,
            2 => Verdict::Deny,
            _ => Verdict::Defer,
        }
    }
}

/// One-shot mailbox slot a parked thread blocks on.
#[derive(Default)]
struct WaitSlot {
    verdict: Mutex<Option<u8>>,
    cond: Condvar,
}

/// Decision mailbox plus targeted wake registry.
pub struct DecisionLedger {
    decisions: IdentityCache<u64, u8>,
    waiters: Mutex<HashMap<u64, Vec<Arc<WaitSlot>>>>,
}

impl DecisionLedger {
    /// Creates a ledger whose mailbox holds up to `capacity` decisions.
    pub fn new(capacity: usize) -> Self {
        Self {
            decisions: IdentityCache::new(capacity, 0),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Records a verdict for `identity` and wakes every thread currently
    /// parked on it. Threads parked on other identities are never woken.
    ///
    /// Returns `false` for the null identity, and for a `Defer` post against
    /// an identity with no mailbox entry (writing the sentinel is a
    /// deletion, and deleting nothing records nothing).
    pub fn post(&self, identity: u64, verdict: Verdict) -> bool {
        if identity == 0 {
            return false;
        }
        if !self.decisions.set(identity, verdict.code()) {
            return false;
        }

        let slots = self.lock_waiters().remove(&identity);
        if let Some(slots) = slots {
            debug!(identity, verdict = ?verdict, woken = slots.len(), "decision posted");
            for slot in slots {
                *lock_slot(&slot.verdict) = Some(verdict.code());
                slot.cond.notify_all();
            }
        } else {
            trace!(identity, verdict = ?verdict, "decision posted with no waiter");
        }
        true
    }

    /// Parks the calling thread on `identity` until a verdict is posted or
    /// `timeout` elapses.
    ///
    /// Returns the posted verdict, or `None` on timeout (and immediately for
    /// the null identity). The caller treats `None` and `Verdict::Defer`
    /// identically; both resolve to the default action.
    pub fn wait(&self, identity: u64, timeout: Duration) -> Option<Verdict> {
        if identity == 0 {
            return None;
        }

        let slot = Arc::new(WaitSlot::default());
        self.lock_waiters()
            .entry(identity)
            .or_default()
            .push(Arc::clone(&slot));

        let deadline = Instant::now() + timeout;
        let mut verdict = {
            let mut filled = lock_slot(&slot.verdict);
            loop {
                if let Some(code) = *filled {
                    break Some(code);
                }
                let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
                    break None;
                };
                filled = slot
                    .cond
                    .wait_timeout(filled, remaining)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        };

        if verdict.is_none() {
            // Deregister so a late post cannot signal this slot. The post
            // path may have consumed the registration in the meantime, in
            // which case the slot now carries the verdict after all.
            let mut waiters = self.lock_waiters();
            if let Some(slots) = waiters.get_mut(&identity) {
                slots.retain(|s| !Arc::ptr_eq(s, &slot));
                if slots.is_empty() {
                    waiters.remove(&identity);
                }
            }
            drop(waiters);
            verdict = *lock_slot(&slot.verdict);
        }

        verdict.map(Verdict::from_code)
    }

    /// Reads the mailbox entry for `identity` without blocking.
    pub fn peek(&self, identity: u64) -> Verdict {
        Verdict::from_code(self.decisions.get(identity))
    }

    /// Number of threads currently parked on `identity`.
    pub fn parked(&self, identity: u64) -> usize {
        self.lock_waiters().get(&identity).map_or(0, Vec::len)
    }

    fn lock_waiters(&self) -> MutexGuard<'_, HashMap<u64, Vec<Arc<WaitSlot>>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_slot(slot: &Mutex<Option<u8>>) -> MutexGuard<'_, Option<u8>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

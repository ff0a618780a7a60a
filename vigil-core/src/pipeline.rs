//! The synchronous authorization pipeline.
//!
//! Each intercepted operation runs this pipeline on its own OS thread:
//!
//! ```text
//! Intercepted → Classified → FastDecision ─────────────────────→ Returned
//!                    │
//!                    └→ Published → Parked → Resolved ─────────→ Returned
//! ```
//!
//! Classification against the allow/deny lists short-circuits the round
//! trip. Otherwise the event is offered to the auth channel and the thread
//! parks on the subject identity until the remote verdict is posted or the
//! timeout elapses. Every internal failure on the way — channel full, no
//! consumer, timeout, sentinel verdict — degrades to the default verdict;
//! nothing recoverable propagates to the interception hook.
//!
//! An atomic in-flight count brackets every entry so shutdown can block
//! until the pipeline is quiescent before any shared structure is torn
//! down.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::cache::IdentityCache;
use crate::channel::{ChannelKind, EventChannelPair};
use crate::classify::{Classification, ClassificationStore};
use crate::config::SensorConfig;
use crate::decision::{DecisionLedger, Verdict};
use crate::event::{EventKind, EventPayload, EventRecord, FileInfo, ProcessInfo};

/// An intercepted authorization-class operation, as handed in by the hook
/// glue after field extraction.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// Subject identity of the executable object.
    pub identity: u64,
    /// Attribution of the requesting process.
    pub process: ProcessInfo,
    /// Metadata of the executable object.
    pub file: FileInfo,
}

/// In-flight operation accounting for quiescence on shutdown.
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    fn enter(&self) -> InFlightGuard<'_> {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        InFlightGuard { counter: self }
    }

    fn current(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .idle
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct InFlightGuard<'a> {
    counter: &'a InFlight,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut count = self
            .counter
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            self.counter.idle.notify_all();
        }
    }
}

/// Orchestrates interception: fast-path classification, publish, park, and
/// the attribution side tables.
pub struct AuthPipeline {
    classifier: Arc<ClassificationStore>,
    ledger: Arc<DecisionLedger>,
    channels: Arc<EventChannelPair>,
    exec_lineage: IdentityCache<u64, u64>,
    port_lineage: IdentityCache<u16, u64>,
    peer_lineage: IdentityCache<u64, u64>,
    decision_timeout: Duration,
    in_flight: InFlight,
}

impl AuthPipeline {
    /// Wires the pipeline to its collaborators.
    pub fn new(
        config: &SensorConfig,
        classifier: Arc<ClassificationStore>,
        ledger: Arc<DecisionLedger>,
        channels: Arc<EventChannelPair>,
    ) -> Self {
        Self {
            classifier,
            ledger,
            channels,
            exec_lineage: IdentityCache::new(config.cache_capacity, 0),
            port_lineage: IdentityCache::new(config.cache_capacity, 0),
            peer_lineage: IdentityCache::new(config.cache_capacity, 0),
            decision_timeout: config.decision_timeout,
            in_flight: InFlight::new(),
        }
    }

    /// Resolves a verdict for an authorization-class operation.
    ///
    /// Runs on the intercepting thread and blocks it for at most the
    /// configured decision timeout. Always returns a verdict; internal
    /// failures resolve to [`Verdict::Defer`], the fail-open default.
    pub fn authorize(&self, request: AuthRequest) -> Verdict {
        let _guard = self.in_flight.enter();

        if request.identity == 0 {
            debug!("authorization request without a subject identity, failing open");
            return Verdict::Defer;
        }

        let verdict = match self.classifier.classify(request.identity) {
            Classification::Allowed => {
                trace!(identity = request.identity, "allow-listed, skipping round trip");
                Verdict::Allow
            }
            Classification::Denied => {
                debug!(identity = request.identity, "deny-listed, rejecting");
                Verdict::Deny
            }
            Classification::Plain => self.resolve_remote(&request),
        };

        if verdict != Verdict::Deny {
            // Remember who ran this object so later notify events can be
            // attributed without re-deriving process state.
            self.exec_lineage
                .set(request.identity, request.process.packed_lineage());
        }

        verdict
    }

    /// Publishes a notify-class record, subject to the mute list.
    ///
    /// Fire-and-forget: a full or unattached notify channel drops the
    /// record.
    pub fn notify(&self, mut record: EventRecord) {
        let _guard = self.in_flight.enter();

        if self.classifier.is_muted(record.identity) {
            trace!(identity = record.identity, "subject muted, suppressing event");
            return;
        }

        if record.kind == EventKind::NotifyExec {
            // Exec notifications surface on a helper thread whose
            // credentials may not be the executing process; prefer the
            // lineage captured during authorization.
            let cached = self.exec_lineage.get(record.identity);
            if cached != 0 {
                let (pid, ppid) = ProcessInfo::unpack_lineage(cached);
                if pid != record.process.pid {
                    record.process.pid = pid;
                    record.process.ppid = ppid;
                }
            }
        }

        self.channels.publish(ChannelKind::Notify, record);
    }

    fn resolve_remote(&self, request: &AuthRequest) -> Verdict {
        let record = EventRecord::new(
            EventKind::AuthExec,
            request.identity,
            request.process,
            EventPayload::File(request.file.clone()),
        );

        if !self.channels.publish(ChannelKind::Auth, record) {
            warn!(
                identity = request.identity,
                "auth event not accepted, failing open"
            );
            return Verdict::Defer;
        }

        match self.ledger.wait(request.identity, self.decision_timeout) {
            Some(verdict) => verdict,
            None => {
                warn!(
                    identity = request.identity,
                    timeout_ms = self.decision_timeout.as_millis() as u64,
                    "decision timed out, failing open"
                );
                Verdict::Defer
            }
        }
    }

    /// Records which process bound a local port.
    pub fn record_port_lineage(&self, port: u16, process: &ProcessInfo) -> bool {
        self.port_lineage.set(port, process.packed_lineage())
    }

    /// Looks up the process that bound a local port.
    pub fn lookup_port_lineage(&self, port: u16) -> Option<(i32, i32)> {
        unpack_nonzero(self.port_lineage.get(port))
    }

    /// Records which process sent to a remote peer address.
    pub fn record_peer_lineage(&self, peer: u64, process: &ProcessInfo) -> bool {
        self.peer_lineage.set(peer, process.packed_lineage())
    }

    /// Looks up the process behind traffic to a remote peer address.
    pub fn lookup_peer_lineage(&self, peer: u64) -> Option<(i32, i32)> {
        unpack_nonzero(self.peer_lineage.get(peer))
    }

    /// Looks up the process that last executed the given object.
    pub fn lookup_exec_lineage(&self, identity: u64) -> Option<(i32, i32)> {
        unpack_nonzero(self.exec_lineage.get(identity))
    }

    /// Number of operations currently inside the pipeline.
    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    /// Blocks until no operation is inside the pipeline.
    ///
    /// Callers must stop feeding the pipeline first (unregister the hooks);
    /// otherwise this may never return.
    pub fn drain(&self) {
        self.in_flight.wait_idle();
    }
}

fn unpack_nonzero(packed: u64) -> Option<(i32, i32)> {
    (packed != 0).then(|| ProcessInfo::unpack_lineage(packed))
}

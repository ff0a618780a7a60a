//! # Vigil Sensor Core
//!
//! The synchronous authorization core of the vigil endpoint sensor: the
//! data structures and protocols that sit between an OS interception point
//! and the user-space policy engine.
//!
//! ## Overview
//!
//! - [`cache::IdentityCache`] — bounded identity-keyed map with a sentinel
//!   value and clear-all-on-overflow eviction
//! - [`classify::ClassificationStore`] — allow/deny/mute fast-path lists
//!   with bulk replace
//! - [`decision::DecisionLedger`] — decision mailbox plus targeted
//!   park/wake with timeout
//! - [`channel::EventChannelPair`] — bounded, non-blocking auth and notify
//!   queues to the consumer
//! - [`pipeline::AuthPipeline`] — the per-operation state machine tying it
//!   all together, with in-flight accounting for safe shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   classify   ┌─────────────────────┐
//! │ OS hook    │─────────────→│ ClassificationStore │──→ allow / deny
//! │ (thread)   │              └─────────────────────┘
//! │            │   publish    ┌─────────────────────┐
//! │  AuthPipe  │─────────────→│ auth channel        │──→ consumer
//! │            │   park       ├─────────────────────┤
//! │            │←─────────────│ DecisionLedger      │←── allow/deny posts
//! └────────────┘    wake      └─────────────────────┘
//! ```
//!
//! The pipeline blocks real OS threads; there is no event loop or async
//! runtime in this crate. Each intercepted operation may block only while
//! parked for its verdict, bounded by the configured timeout, and every
//! internal failure resolves to the fail-open default rather than an error.

pub mod cache;
pub mod channel;
pub mod classify;
pub mod config;
pub mod decision;
pub mod event;
pub mod pipeline;

pub use cache::IdentityCache;
pub use channel::{ChannelConsumer, ChannelKind, ChannelStats, ConsumerSignal, EventChannelPair};
pub use classify::{Classification, ClassificationStore, ListKind};
pub use config::SensorConfig;
pub use decision::{DecisionLedger, Verdict};
pub use event::{
    DnsInfo, EventKind, EventPayload, EventRecord, FileInfo, NetworkInfo, ProcessInfo,
};
pub use pipeline::{AuthPipeline, AuthRequest};

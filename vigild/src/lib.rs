//! # Vigild
//!
//! The vigil sensor daemon: owns the [`vigil_core`] authorization core and
//! surrounds it with lifecycle management, interception-hook registration,
//! and the local-socket surfaces an external policy client uses to drive
//! it.
//!
//! - [`service::SensorService`] — bring-up/teardown in dependency order
//!   with quiescence on stop
//! - [`hooks`] — the consumed OS interception contract and its
//!   all-or-nothing registration
//! - [`control::ControlServer`] — exclusive-client command surface
//!   (verdicts, list updates, log level)
//! - [`feed::FeedServer`] — streams drained channel records to the
//!   consumer
//! - [`config::ConfigLoader`] — hierarchical file/env configuration

pub mod codec;
pub mod config;
pub mod control;
pub mod feed;
pub mod hooks;
pub mod service;

pub use config::{ConfigLoader, DaemonConfig};
pub use control::{ControlConfig, ControlRequest, ControlResponse, ControlServer, ControlState};
pub use feed::{FeedConfig, FeedEvent, FeedServer};
pub use hooks::{HookDispatch, HookError, HookPoint, HookSet};
pub use service::{SensorService, ServiceError};

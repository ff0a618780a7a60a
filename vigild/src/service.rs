//! Sensor service lifecycle.
//!
//! `SensorService` is the single owner of every shared structure in the
//! sensor, constructed once in dependency order and handed out as shared
//! handles. Bring-up is all-or-nothing: any failure unwinds whatever was
//! already built (reverse construction order, which in Rust is drop order)
//! and nothing partial ever becomes visible. Teardown reverses bring-up:
//! hooks come off first so no new operation can enter, then the service
//! blocks until the pipeline is quiescent, and only then do the channels
//! and caches go away.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use vigil_core::{
    AuthPipeline, ClassificationStore, DecisionLedger, EventChannelPair, SensorConfig,
};

use crate::hooks::{HookDispatch, HookError, HookSet};

/// Fatal bring-up errors. Everything here aborts service start; nothing in
/// this enum is raised after the service is up.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid sensor configuration: {0}")]
    Config(#[source] anyhow::Error),

    #[error(transparent)]
    Hook(#[from] HookError),
}

/// The running sensor: owns the caches, channels, pipeline, and hook set.
///
/// Fields are declared in reverse construction order so the owned handles
/// drop dependents-first.
pub struct SensorService {
    running: bool,
    hooks: HookSet,
    dispatch: Arc<HookDispatch>,
    pipeline: Arc<AuthPipeline>,
    channels: Arc<EventChannelPair>,
    ledger: Arc<DecisionLedger>,
    classifier: Arc<ClassificationStore>,
}

impl SensorService {
    /// Builds every collaborator in dependency order and registers the
    /// interception hooks.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or any hook fails
    /// to register; in both cases everything constructed so far is torn
    /// down before returning and no hook remains registered.
    pub fn start(config: &SensorConfig, hooks: HookSet) -> Result<Self, ServiceError> {
        config.validate().map_err(ServiceError::Config)?;

        let classifier = Arc::new(ClassificationStore::new(
            config.cache_capacity,
            config.max_list_len,
        ));
        let ledger = Arc::new(DecisionLedger::new(config.cache_capacity));
        let channels = Arc::new(EventChannelPair::new(
            config.auth_channel_capacity,
            config.notify_channel_capacity,
        ));
        let pipeline = Arc::new(AuthPipeline::new(
            config,
            Arc::clone(&classifier),
            Arc::clone(&ledger),
            Arc::clone(&channels),
        ));
        let dispatch = Arc::new(HookDispatch::new(Arc::clone(&pipeline)));

        hooks.register_all(&dispatch)?;

        info!(
            hooks = hooks.len(),
            cache_capacity = config.cache_capacity,
            timeout_ms = config.decision_timeout.as_millis() as u64,
            "sensor service started"
        );

        Ok(Self {
            classifier,
            ledger,
            channels,
            pipeline,
            dispatch,
            hooks,
            running: true,
        })
    }

    /// Stops the service.
    ///
    /// Unregisters every hook first, then blocks until no intercepted
    /// operation remains inside the pipeline. Does not return while any
    /// operation is in flight. Idempotent.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.hooks.unregister_all();
        self.pipeline.drain();
        self.channels.set_connected(false);
        self.running = false;
        info!("sensor service stopped");
    }

    /// Whether the service has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Shared handle to the classification lists.
    pub fn classifier(&self) -> Arc<ClassificationStore> {
        Arc::clone(&self.classifier)
    }

    /// Shared handle to the decision ledger.
    pub fn ledger(&self) -> Arc<DecisionLedger> {
        Arc::clone(&self.ledger)
    }

    /// Shared handle to the event channel pair.
    pub fn channels(&self) -> Arc<EventChannelPair> {
        Arc::clone(&self.channels)
    }

    /// Shared handle to the pipeline.
    pub fn pipeline(&self) -> Arc<AuthPipeline> {
        Arc::clone(&self.pipeline)
    }

    /// Dispatch handle for late-bound hook registrations (tests, platform
    /// integrations that attach after start).
    pub fn dispatch(&self) -> Arc<HookDispatch> {
        Arc::clone(&self.dispatch)
    }
}

impl Drop for SensorService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookPoint;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagHook {
        fail: bool,
        registered: Arc<AtomicBool>,
    }

    impl HookPoint for FlagHook {
        fn name(&self) -> &'static str {
            "flag"
        }
        fn register(&self, _dispatch: Arc<HookDispatch>) -> Result<(), HookError> {
            if self.fail {
                return Err(HookError::Registration {
                    name: "flag",
                    reason: "denied".to_owned(),
                });
            }
            self.registered.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn unregister(&self) {
            self.registered.store(false, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_start_with_invalid_config_fails() {
        let config = SensorConfig::default().with_cache_capacity(0);
        let result = SensorService::start(&config, HookSet::new(vec![]));
        assert!(matches!(result, Err(ServiceError::Config(_))));
    }

    #[test]
    fn test_hook_failure_aborts_bring_up() {
        let registered = Arc::new(AtomicBool::new(false));
        let hooks = HookSet::new(vec![
            Box::new(FlagHook {
                fail: false,
                registered: Arc::clone(&registered),
            }),
            Box::new(FlagHook {
                fail: true,
                registered: Arc::new(AtomicBool::new(false)),
            }),
        ]);

        let result = SensorService::start(&SensorConfig::default(), hooks);
        assert!(matches!(result, Err(ServiceError::Hook(_))));
        assert!(!registered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_unregisters_hooks_and_is_idempotent() {
        let registered = Arc::new(AtomicBool::new(false));
        let hooks = HookSet::new(vec![Box::new(FlagHook {
            fail: false,
            registered: Arc::clone(&registered),
        })]);

        let mut service =
            SensorService::start(&SensorConfig::default(), hooks).expect("service start");
        assert!(service.is_running());
        assert!(registered.load(Ordering::SeqCst));

        service.stop();
        assert!(!service.is_running());
        assert!(!registered.load(Ordering::SeqCst));

        // A second stop is a no-op.
        service.stop();
    }
}

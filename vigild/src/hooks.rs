//! Interception hook registration glue.
//!
//! The OS-facing interception mechanics live outside this crate; what a
//! platform integration supplies is a set of [`HookPoint`]s wired into the
//! pipeline through a [`HookDispatch`]. Registration is all-or-nothing:
//! if any hook fails to register, everything registered so far is backed
//! out and bring-up aborts. Hooks are always unregistered before the
//! structures they dispatch into are torn down.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};
use vigil_core::{AuthPipeline, AuthRequest, EventRecord, Verdict};

/// Errors from hook registration.
#[derive(Debug, Error)]
pub enum HookError {
    /// The OS refused the hook registration.
    #[error("failed to register hook '{name}': {reason}")]
    Registration { name: &'static str, reason: String },
}

/// Pipeline entry points handed to each registered hook.
///
/// A hook callback runs synchronously on the intercepting thread;
/// [`authorize_exec`](Self::authorize_exec) blocks that thread for at most
/// the configured decision timeout and always produces a verdict. Hooks
/// must dispatch only operations on regular file-like objects; anything
/// else passes through the OS unmodified without entering the pipeline.
pub struct HookDispatch {
    pipeline: Arc<AuthPipeline>,
}

impl HookDispatch {
    pub fn new(pipeline: Arc<AuthPipeline>) -> Self {
        Self { pipeline }
    }

    /// Resolves a verdict for an authorization-class interception.
    pub fn authorize_exec(&self, request: AuthRequest) -> Verdict {
        self.pipeline.authorize(request)
    }

    /// Forwards a notify-class interception, fire-and-forget.
    pub fn notify_event(&self, record: EventRecord) {
        self.pipeline.notify(record);
    }
}

/// One OS interception point (a kauth scope, a socket filter, ...).
pub trait HookPoint: Send + Sync {
    /// Stable name for logs and errors.
    fn name(&self) -> &'static str;

    /// Registers the hook with the OS, directing callbacks at `dispatch`.
    fn register(&self, dispatch: Arc<HookDispatch>) -> Result<(), HookError>;

    /// Unregisters the hook. After this returns, no further callback may
    /// enter the pipeline from this hook.
    fn unregister(&self);
}

/// The daemon's full set of interception points, registered and
/// unregistered as a unit.
pub struct HookSet {
    hooks: Vec<Box<dyn HookPoint>>,
}

impl HookSet {
    pub fn new(hooks: Vec<Box<dyn HookPoint>>) -> Self {
        Self { hooks }
    }

    /// Registers every hook, in order.
    ///
    /// On the first failure the hooks already registered are unregistered
    /// in reverse order and the error is returned; no partial registration
    /// survives.
    pub fn register_all(&self, dispatch: &Arc<HookDispatch>) -> Result<(), HookError> {
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.register(Arc::clone(dispatch)) {
                error!(hook = hook.name(), error = %e, "hook registration failed, rolling back");
                for registered in self.hooks[..index].iter().rev() {
                    registered.unregister();
                }
                return Err(e);
            }
            info!(hook = hook.name(), "interception hook registered");
        }
        Ok(())
    }

    /// Unregisters every hook in reverse registration order.
    pub fn unregister_all(&self) {
        for hook in self.hooks.iter().rev() {
            hook.unregister();
            info!(hook = hook.name(), "interception hook unregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use vigil_core::{
        ClassificationStore, DecisionLedger, EventChannelPair, SensorConfig,
    };

    fn dispatch() -> Arc<HookDispatch> {
        let config = SensorConfig::default();
        let pipeline = Arc::new(AuthPipeline::new(
            &config,
            Arc::new(ClassificationStore::new(16, 16)),
            Arc::new(DecisionLedger::new(16)),
            Arc::new(EventChannelPair::new(4, 4)),
        ));
        Arc::new(HookDispatch::new(pipeline))
    }

    struct FakeHook {
        name: &'static str,
        fail: bool,
        registered: Arc<AtomicBool>,
        unregistered: Arc<AtomicUsize>,
    }

    impl HookPoint for FakeHook {
        fn name(&self) -> &'static str {
            self.name
        }

        fn register(&self, _dispatch: Arc<HookDispatch>) -> Result<(), HookError> {
            if self.fail {
                return Err(HookError::Registration {
                    name: self.name,
                    reason: "resource busy".to_owned(),
                });
            }
            self.registered.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn unregister(&self) {
            self.registered.store(false, Ordering::SeqCst);
            self.unregistered.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_register_all_is_all_or_nothing() {
        let first_registered = Arc::new(AtomicBool::new(false));
        let first_unregistered = Arc::new(AtomicUsize::new(0));
        let hooks = HookSet::new(vec![
            Box::new(FakeHook {
                name: "vnode",
                fail: false,
                registered: Arc::clone(&first_registered),
                unregistered: Arc::clone(&first_unregistered),
            }),
            Box::new(FakeHook {
                name: "fileop",
                fail: true,
                registered: Arc::new(AtomicBool::new(false)),
                unregistered: Arc::new(AtomicUsize::new(0)),
            }),
        ]);

        let result = hooks.register_all(&dispatch());
        assert!(result.is_err());
        // The successfully registered hook was rolled back.
        assert!(!first_registered.load(Ordering::SeqCst));
        assert_eq!(first_unregistered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_all_runs_in_reverse_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        struct OrderedHook {
            name: &'static str,
            order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        }
        impl HookPoint for OrderedHook {
            fn name(&self) -> &'static str {
                self.name
            }
            fn register(&self, _dispatch: Arc<HookDispatch>) -> Result<(), HookError> {
                Ok(())
            }
            fn unregister(&self) {
                self.order.lock().expect("order lock").push(self.name);
            }
        }

        let hooks = HookSet::new(vec![
            Box::new(OrderedHook {
                name: "first",
                order: Arc::clone(&order),
            }),
            Box::new(OrderedHook {
                name: "second",
                order: Arc::clone(&order),
            }),
        ]);
        hooks.register_all(&dispatch()).expect("register");
        hooks.unregister_all();

        assert_eq!(*order.lock().expect("order lock"), vec!["second", "first"]);
    }
}

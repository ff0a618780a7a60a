//! Control surface for the external policy client.
//!
//! A single exclusive client connects over a local socket and drives the
//! sensor: posting verdicts for parked operations, swapping classification
//! lists, and adjusting the log level. Verdict posts go straight into the
//! decision ledger, so a thread parked on that identity resumes without the
//! daemon's async runtime in the path.
//!
//! Messages use the [`FrameCodec`](crate::codec::FrameCodec) framing with
//! JSON bodies; see [`ControlRequest`] for the protocol.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[cfg(unix)]
use interprocess::local_socket::{GenericFilePath, ToFsName};
#[cfg(windows)]
use interprocess::local_socket::{GenericNamespaced, ToNsName};
use interprocess::local_socket::{ListenerOptions, Name, tokio::prelude::*};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use tracing_subscriber::Registry;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::reload;
use vigil_core::{ClassificationStore, DecisionLedger, EventChannelPair, ListKind, Verdict};

use crate::codec::{CodecError, FrameCodec};

/// Errors from the control server itself (not from client commands, which
/// are answered in-band).
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid socket path: {0}")]
    SocketName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Commands accepted from the control client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Claims the exclusive client slot and attaches the consumer.
    Connect,
    /// Authorizes the operation parked on `identity`.
    Allow { identity: u64 },
    /// Rejects the operation parked on `identity`.
    Deny { identity: u64 },
    /// Adjusts the daemon log level (`trace` through `error`).
    SetLogLevel { level: String },
    /// Replaces one classification list wholesale.
    UpdateMuteList { kind: ListKind, identities: Vec<u64> },
}

/// Reply to a control command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    Error { reason: String },
}

/// Runtime log-level adjustment seam.
///
/// The daemon backs this with a `tracing_subscriber` reload handle; tests
/// substitute a recorder.
pub trait LogLevelControl: Send + Sync {
    fn set_level(&self, level: &str) -> Result<(), String>;
}

/// [`LogLevelControl`] over the global subscriber's reloadable filter.
pub struct ReloadLevelControl {
    handle: reload::Handle<LevelFilter, Registry>,
}

impl ReloadLevelControl {
    pub fn new(handle: reload::Handle<LevelFilter, Registry>) -> Self {
        Self { handle }
    }
}

impl LogLevelControl for ReloadLevelControl {
    fn set_level(&self, level: &str) -> Result<(), String> {
        let filter: LevelFilter = level
            .parse()
            .map_err(|_| format!("unknown log level '{level}'"))?;
        self.handle.reload(filter).map_err(|e| e.to_string())
    }
}

/// Control server configuration.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Local socket path (Unix) or namespaced pipe name (Windows).
    pub socket_path: PathBuf,
    /// Largest accepted control frame.
    pub max_frame_bytes: usize,
    /// Write timeout for replies.
    pub write_timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/vigil/control.sock"),
            max_frame_bytes: 64 * 1024,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared state the control sessions operate on.
pub struct ControlState {
    ledger: Arc<DecisionLedger>,
    classifier: Arc<ClassificationStore>,
    channels: Arc<EventChannelPair>,
    log_level: Arc<dyn LogLevelControl>,
    session_active: AtomicBool,
}

impl ControlState {
    pub fn new(
        ledger: Arc<DecisionLedger>,
        classifier: Arc<ClassificationStore>,
        channels: Arc<EventChannelPair>,
        log_level: Arc<dyn LogLevelControl>,
    ) -> Self {
        Self {
            ledger,
            classifier,
            channels,
            log_level,
            session_active: AtomicBool::new(false),
        }
    }

    /// Applies one session-independent command.
    ///
    /// `Connect` is session-scoped and handled by the connection loop, not
    /// here.
    pub fn apply(&self, request: &ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Connect => ControlResponse::Error {
                reason: "connect is session-scoped".to_owned(),
            },
            ControlRequest::Allow { identity } => {
                if self.ledger.post(*identity, Verdict::Allow) {
                    debug!(identity, "allow verdict posted");
                    ControlResponse::Ok
                } else {
                    ControlResponse::Error {
                        reason: format!("invalid identity {identity}"),
                    }
                }
            }
            ControlRequest::Deny { identity } => {
                if self.ledger.post(*identity, Verdict::Deny) {
                    debug!(identity, "deny verdict posted");
                    ControlResponse::Ok
                } else {
                    ControlResponse::Error {
                        reason: format!("invalid identity {identity}"),
                    }
                }
            }
            ControlRequest::SetLogLevel { level } => match self.log_level.set_level(level) {
                Ok(()) => {
                    info!(level = %level, "log level changed by client");
                    ControlResponse::Ok
                }
                Err(reason) => ControlResponse::Error { reason },
            },
            ControlRequest::UpdateMuteList { kind, identities } => {
                self.classifier.replace(*kind, identities);
                info!(kind = ?kind, count = identities.len(), "classification list replaced");
                ControlResponse::Ok
            }
        }
    }

    fn try_claim_session(&self) -> bool {
        self.session_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release_session(&self) {
        self.session_active.store(false, Ordering::Release);
        self.channels.set_connected(false);
    }
}

/// Accepts control clients and runs their sessions.
pub struct ControlServer {
    config: ControlConfig,
    state: Arc<ControlState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ControlServer {
    pub fn new(config: ControlConfig, state: Arc<ControlState>) -> Self {
        Self {
            config,
            state,
            shutdown_tx: None,
        }
    }

    /// Binds the socket and spawns the accept loop.
    pub async fn start(&mut self) -> Result<(), ControlError> {
        let name = create_socket_name(&self.config.socket_path)?;
        let listener = ListenerOptions::new().name(name).create_tokio()?;
        info!(path = %self.config.socket_path.display(), "control server listening");

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let state = Arc::clone(&self.state);
        let config = self.config.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok(stream) => {
                                let state = Arc::clone(&state);
                                let config = config.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = run_session(stream, state, config).await {
                                        warn!(error = %e, "control session ended with error");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "failed to accept control connection");
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("control server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Signals the accept loop to exit and removes the socket.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(&self.config.socket_path);
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_session(
    mut stream: LocalSocketStream,
    state: Arc<ControlState>,
    config: ControlConfig,
) -> Result<(), CodecError> {
    let codec = FrameCodec::new(config.max_frame_bytes);
    let mut session_owner = false;

    let result = loop {
        // Control sessions idle between commands; block until the client
        // speaks or hangs up.
        let request: ControlRequest = match codec.read_frame(&mut stream, None).await {
            Ok(request) => request,
            Err(CodecError::PeerClosed) => {
                debug!("control client disconnected");
                break Ok(());
            }
            Err(e) => break Err(e),
        };

        let response = match &request {
            ControlRequest::Connect => {
                if session_owner {
                    ControlResponse::Ok
                } else if state.try_claim_session() {
                    session_owner = true;
                    state.channels.set_connected(true);
                    info!("control client connected");
                    ControlResponse::Ok
                } else {
                    warn!("second control client refused");
                    ControlResponse::Error {
                        reason: "another client is connected".to_owned(),
                    }
                }
            }
            other => state.apply(other),
        };

        if let Err(e) = codec
            .write_frame(&mut stream, &response, config.write_timeout)
            .await
        {
            break Err(e);
        }
    };

    if session_owner {
        state.release_session();
        info!("control client session released");
    }
    result
}

fn create_socket_name(path: &std::path::Path) -> Result<Name<'_>, ControlError> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // Remove a stale socket left by a previous run.
        let _ = std::fs::remove_file(path);

        path.to_fs_name::<GenericFilePath>()
            .map_err(|e| ControlError::SocketName(e.to_string()))
    }
    #[cfg(windows)]
    {
        path.to_string_lossy()
            .into_owned()
            .to_ns_name::<GenericNamespaced>()
            .map_err(|e| ControlError::SocketName(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingLevelControl {
        levels: Mutex<Vec<String>>,
    }

    impl LogLevelControl for RecordingLevelControl {
        fn set_level(&self, level: &str) -> Result<(), String> {
            if level.parse::<LevelFilter>().is_err() {
                return Err(format!("unknown log level '{level}'"));
            }
            self.levels.lock().expect("levels lock").push(level.to_owned());
            Ok(())
        }
    }

    fn state() -> (Arc<ControlState>, Arc<DecisionLedger>, Arc<ClassificationStore>, Arc<RecordingLevelControl>) {
        let ledger = Arc::new(DecisionLedger::new(64));
        let classifier = Arc::new(ClassificationStore::new(64, 64));
        let channels = Arc::new(EventChannelPair::new(8, 8));
        let levels = Arc::new(RecordingLevelControl {
            levels: Mutex::new(Vec::new()),
        });
        let state = Arc::new(ControlState::new(
            Arc::clone(&ledger),
            Arc::clone(&classifier),
            channels,
            Arc::clone(&levels) as Arc<dyn LogLevelControl>,
        ));
        (state, ledger, classifier, levels)
    }

    #[test]
    fn test_allow_and_deny_post_into_the_ledger() {
        let (state, ledger, _classifier, _levels) = state();

        assert!(matches!(
            state.apply(&ControlRequest::Allow { identity: 4 }),
            ControlResponse::Ok
        ));
        assert_eq!(ledger.peek(4), Verdict::Allow);

        assert!(matches!(
            state.apply(&ControlRequest::Deny { identity: 5 }),
            ControlResponse::Ok
        ));
        assert_eq!(ledger.peek(5), Verdict::Deny);

        // The null identity is refused in-band, not fatally.
        assert!(matches!(
            state.apply(&ControlRequest::Allow { identity: 0 }),
            ControlResponse::Error { .. }
        ));
    }

    #[test]
    fn test_update_mute_list_replaces_the_axis() {
        let (state, _ledger, classifier, _levels) = state();
        let response = state.apply(&ControlRequest::UpdateMuteList {
            kind: ListKind::Deny,
            identities: vec![10, 11],
        });
        assert!(matches!(response, ControlResponse::Ok));
        assert_eq!(classifier.list_len(ListKind::Deny), 2);

        state.apply(&ControlRequest::UpdateMuteList {
            kind: ListKind::Deny,
            identities: vec![12],
        });
        assert_eq!(classifier.list_len(ListKind::Deny), 1);
    }

    #[test]
    fn test_set_log_level_validates_input() {
        let (state, _ledger, _classifier, levels) = state();
        assert!(matches!(
            state.apply(&ControlRequest::SetLogLevel {
                level: "debug".to_owned()
            }),
            ControlResponse::Ok
        ));
        assert!(matches!(
            state.apply(&ControlRequest::SetLogLevel {
                level: "noisy".to_owned()
            }),
            ControlResponse::Error { .. }
        ));
        assert_eq!(*levels.levels.lock().expect("levels lock"), vec!["debug"]);
    }

    #[test]
    fn test_session_claim_is_exclusive() {
        let (state, _ledger, _classifier, _levels) = state();
        assert!(state.try_claim_session());
        assert!(!state.try_claim_session());
        state.release_session();
        assert!(state.try_claim_session());
    }

    #[test]
    fn test_request_wire_format_is_stable() {
        let json = serde_json::to_string(&ControlRequest::Allow { identity: 9 }).expect("json");
        assert_eq!(json, r#"{"op":"allow","identity":9}"#);

        let parsed: ControlRequest =
            serde_json::from_str(r#"{"op":"update_mute_list","kind":"mute","identities":[1,2]}"#)
                .expect("parse");
        match parsed {
            ControlRequest::UpdateMuteList { kind, identities } => {
                assert_eq!(kind, ListKind::Mute);
                assert_eq!(identities, vec![1, 2]);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }
}

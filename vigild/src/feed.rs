//! Event feed to the external consumer.
//!
//! The feed owns the drain side of both event channels and streams drained
//! records to an attached client as framed JSON, one [`FeedEvent`] per
//! frame. A wake signal registered on the channels replaces polling: the
//! serving task sleeps until the pipeline enqueues something.
//!
//! The feed is strictly best-effort. A slow or absent client never blocks
//! the pipeline; bounded channels drop on the producer side long before
//! anything here matters.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
use interprocess::local_socket::{GenericFilePath, ToFsName};
#[cfg(windows)]
use interprocess::local_socket::{GenericNamespaced, ToNsName};
use interprocess::local_socket::{ListenerOptions, Name, tokio::prelude::*};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};
use vigil_core::{ChannelConsumer, ChannelKind, ConsumerSignal, EventChannelPair, EventRecord};

use crate::codec::{CodecError, FrameCodec};

/// Errors from the feed server.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("invalid socket path: {0}")]
    SocketName(String),

    #[error("channel consumers already taken")]
    ConsumersTaken,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One drained record with its originating channel, as framed to the
/// client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedEvent {
    pub channel: ChannelKind,
    pub record: EventRecord,
}

/// Feed server configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub socket_path: PathBuf,
    pub max_frame_bytes: usize,
    pub write_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/vigil/events.sock"),
            max_frame_bytes: 64 * 1024,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Wake signal bridging the synchronous channel side to the async serving
/// task. `Notify` buffers one permit, so an enqueue racing the task's sleep
/// is never lost.
struct WakeSignal(Arc<Notify>);

impl ConsumerSignal for WakeSignal {
    fn notify(&self) {
        self.0.notify_one();
    }
}

/// Streams drained channel records to one feed client at a time.
pub struct FeedServer {
    config: FeedConfig,
    consumers: Option<(ChannelConsumer, ChannelConsumer)>,
    wake: Arc<Notify>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl FeedServer {
    /// Takes the drain side of both channels and registers the wake signal.
    pub fn new(config: FeedConfig, channels: &EventChannelPair) -> Self {
        let wake = Arc::new(Notify::new());
        channels.register_signal(
            ChannelKind::Auth,
            Arc::new(WakeSignal(Arc::clone(&wake))) as Arc<dyn ConsumerSignal>,
        );
        channels.register_signal(
            ChannelKind::Notify,
            Arc::new(WakeSignal(Arc::clone(&wake))) as Arc<dyn ConsumerSignal>,
        );

        let consumers = match (
            channels.consumer(ChannelKind::Auth),
            channels.consumer(ChannelKind::Notify),
        ) {
            (Some(auth), Some(notify)) => Some((auth, notify)),
            _ => {
                warn!("event channel consumers already taken, feed will refuse to start");
                None
            }
        };

        Self {
            config,
            consumers,
            wake,
            shutdown_tx: None,
        }
    }

    /// Binds the feed socket and spawns the serving loop.
    pub async fn start(&mut self) -> Result<(), FeedError> {
        let (auth, notify) = self.consumers.take().ok_or(FeedError::ConsumersTaken)?;

        let name = create_socket_name(&self.config.socket_path)?;
        let listener = ListenerOptions::new().name(name).create_tokio()?;
        info!(path = %self.config.socket_path.display(), "event feed listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let config = self.config.clone();
        let wake = Arc::clone(&self.wake);
        tokio::spawn(async move {
            let codec = FrameCodec::new(config.max_frame_bytes);
            let mut accept_shutdown = shutdown_rx.clone();
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok(stream) => {
                                info!("feed client attached");
                                let outcome = stream_events(
                                    stream,
                                    &auth,
                                    &notify,
                                    &wake,
                                    &codec,
                                    config.write_timeout,
                                    shutdown_rx.clone(),
                                )
                                .await;
                                match outcome {
                                    Ok(()) => break,
                                    Err(e) => debug!(error = %e, "feed client detached"),
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "failed to accept feed connection");
                            }
                        }
                    }
                    _ = accept_shutdown.changed() => break,
                }
            }
            info!("event feed stopped");
        });

        Ok(())
    }

    /// Signals the serving loop to exit and removes the socket.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(&self.config.socket_path);
        }
    }
}

impl Drop for FeedServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serves one client until it detaches or shutdown is signaled.
///
/// `Ok(())` means shutdown; an error means the client went away and the
/// caller should accept the next one.
async fn stream_events(
    mut stream: LocalSocketStream,
    auth: &ChannelConsumer,
    notify: &ChannelConsumer,
    wake: &Notify,
    codec: &FrameCodec,
    write_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), CodecError> {
    loop {
        let mut wrote = 0_usize;
        for (channel, consumer) in [(ChannelKind::Auth, auth), (ChannelKind::Notify, notify)] {
            for record in consumer.try_drain() {
                let event = FeedEvent { channel, record };
                codec.write_frame(&mut stream, &event, write_timeout).await?;
                wrote += 1;
            }
        }

        if wrote == 0 {
            tokio::select! {
                _ = wake.notified() => {}
                _ = shutdown_rx.changed() => return Ok(()),
            }
        }
    }
}

fn create_socket_name(path: &std::path::Path) -> Result<Name<'_>, FeedError> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let _ = std::fs::remove_file(path);

        path.to_fs_name::<GenericFilePath>()
            .map_err(|e| FeedError::SocketName(e.to_string()))
    }
    #[cfg(windows)]
    {
        path.to_string_lossy()
            .into_owned()
            .to_ns_name::<GenericNamespaced>()
            .map_err(|e| FeedError::SocketName(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{EventKind, EventPayload, FileInfo, ProcessInfo};

    #[test]
    fn test_feed_event_wire_format() {
        let event = FeedEvent {
            channel: ChannelKind::Auth,
            record: EventRecord::new(
                EventKind::AuthExec,
                12,
                ProcessInfo::default(),
                EventPayload::File(FileInfo::new(0, 0, 0o755, "/bin/true")),
            ),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["channel"], "auth");
        assert_eq!(json["record"]["identity"], 12);
        assert_eq!(json["record"]["kind"], "auth_exec");
    }

    #[test]
    fn test_consumers_can_only_back_one_feed() {
        let channels = EventChannelPair::new(4, 4);
        let first = FeedServer::new(FeedConfig::default(), &channels);
        assert!(first.consumers.is_some());

        let second = FeedServer::new(FeedConfig::default(), &channels);
        assert!(second.consumers.is_none());
    }
}

//! Serialized server-request queue.
//!
//! The manager owns the store and drains one command at a time on a
//! dedicated thread, which is the only writer ordering guarantee the engine
//! needs: at most one request is in flight, admission order is execution
//! order, and every mutation becomes visible in a single commit. Rate-limit
//! retries sleep on a helper thread and re-enter the queue through a cloned
//! sender, so a retried request lines up behind whatever was admitted in the
//! meantime.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::auth;
use crate::capabilities::CapabilityMap;
use crate::covers;
use crate::error::SyncError;
use crate::maintenance;
use crate::protocol::{Message, SyncMessage};
use crate::reconcile;
use crate::request::RequestKind;
use crate::server_keyring;
use crate::store::{ServerRow, Store};
use crate::transport::{api_version_at_least, RequestTransport, TransportReply};

/// One admitted logical request. The cancellation flag is honored only
/// before execution starts; a request that began always finishes.
pub struct QueuedRequest {
    pub server_id: i64,
    pub kind: RequestKind,
    pub cancelled: Arc<AtomicBool>,
}

pub enum SyncCommand {
    Request(QueuedRequest),
    Maintenance,
    RegisterDownload {
        server_id: i64,
        track_id: i64,
        path: PathBuf,
    },
    Shutdown,
}

/// Cloneable submission handle for the request queue. Submission never
/// blocks; the queue is unbounded.
#[derive(Clone)]
pub struct SyncHandle {
    tx: Sender<SyncCommand>,
}

impl SyncHandle {
    /// Enqueues a request and returns its cancellation flag.
    pub fn submit(&self, server_id: i64, kind: RequestKind) -> Arc<AtomicBool> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let request = QueuedRequest {
            server_id,
            kind,
            cancelled: cancelled.clone(),
        };
        let _ = self.tx.send(SyncCommand::Request(request));
        cancelled
    }

    pub fn run_maintenance(&self) {
        let _ = self.tx.send(SyncCommand::Maintenance);
    }

    pub fn register_download(&self, server_id: i64, track_id: i64, path: PathBuf) {
        let _ = self.tx.send(SyncCommand::RegisterDownload {
            server_id,
            track_id,
            path,
        });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(SyncCommand::Shutdown);
    }
}

/// Pluggable credential lookup, keyed by server name.
pub trait CredentialSource: Send {
    fn password(&self, server_name: &str) -> Result<Option<String>, String>;
}

/// Production credential source backed by the OS keyring.
pub struct KeyringCredentials;

impl CredentialSource for KeyringCredentials {
    fn password(&self, server_name: &str) -> Result<Option<String>, String> {
        server_keyring::get_server_password(server_name)
    }
}

pub struct SyncManager<T: RequestTransport, C: CredentialSource> {
    store: Store,
    transport: T,
    credentials: C,
    capabilities: Arc<CapabilityMap>,
    bus_producer: broadcast::Sender<Message>,
    rx: Receiver<SyncCommand>,
    retry_tx: Sender<SyncCommand>,
    cache_root: PathBuf,
}

impl<T: RequestTransport + 'static, C: CredentialSource + 'static> SyncManager<T, C> {
    pub fn new(
        store: Store,
        transport: T,
        credentials: C,
        capabilities: Arc<CapabilityMap>,
        bus_producer: broadcast::Sender<Message>,
        cache_root: PathBuf,
    ) -> (SyncHandle, Self) {
        let (tx, rx) = std::sync::mpsc::channel();
        let manager = Self {
            store,
            transport,
            credentials,
            capabilities,
            bus_producer,
            rx,
            retry_tx: tx.clone(),
            cache_root,
        };
        (SyncHandle { tx }, manager)
    }

    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("subtide-sync".to_string())
            .spawn(move || {
                let mut manager = self;
                manager.run();
            })
            .expect("sync worker thread failed to start")
    }

    pub fn run(&mut self) {
        info!("Sync manager started");
        while let Ok(command) = self.rx.recv() {
            match command {
                SyncCommand::Request(request) => self.execute(request),
                SyncCommand::Maintenance => self.run_maintenance(),
                SyncCommand::RegisterDownload {
                    server_id,
                    track_id,
                    path,
                } => self.register_download(server_id, track_id, path),
                SyncCommand::Shutdown => break,
            }
        }
        info!("Sync manager stopped");
    }

    fn execute(&mut self, request: QueuedRequest) {
        if request.cancelled.load(Ordering::SeqCst) {
            debug!("Dropping cancelled {} request", request.kind.action_name());
            return;
        }
        if let Some(feature) = request.kind.feature() {
            if !self.capabilities.is_supported(request.server_id, feature) {
                debug!(
                    "Skipping {}: feature unsupported by server {}",
                    request.kind.action_name(),
                    request.server_id
                );
                return;
            }
        }
        if let Err(err) = self.execute_inner(&request) {
            warn!(
                "{} against server {} failed: {err}",
                request.kind.action_name(),
                request.server_id
            );
            self.publish(SyncMessage::OperationFailed {
                server_id: request.server_id,
                action: request.kind.action_name().to_string(),
                error: err.to_string(),
            });
        }
    }

    fn execute_inner(&mut self, request: &QueuedRequest) -> Result<(), SyncError> {
        let server = self.load_server(request.server_id)?;
        let password = self
            .credentials
            .password(&server.name)
            .map_err(SyncError::Credentials)?
            .ok_or_else(|| {
                SyncError::Credentials(format!("no stored password for server '{}'", server.name))
            })?;
        let auth = auth::base_parameters(&server.username, &password, server.use_token_auth)?;
        let use_form_post = self.capabilities.uses_form_post(server.id);

        match self
            .transport
            .send(&server.url, &auth, &request.kind, use_form_post)?
        {
            TransportReply::Body { mime, bytes } => {
                self.reconcile_body(request, &server, &mime, &bytes)
            }
            TransportReply::Unsupported => {
                if let Some(feature) = request.kind.feature() {
                    if self.capabilities.mark_unsupported(server.id, feature) {
                        warn!(
                            "Server '{}' does not support {:?}; giving up on it",
                            server.name, feature
                        );
                    }
                }
                Ok(())
            }
            TransportReply::RateLimited(delay) => {
                // transparent: the user never sees rate limiting, the
                // request just lines up again after the server's delay
                debug!(
                    "{} rate limited, retrying in {delay:?}",
                    request.kind.action_name()
                );
                let retry = QueuedRequest {
                    server_id: request.server_id,
                    kind: request.kind.clone(),
                    cancelled: request.cancelled.clone(),
                };
                let retry_tx = self.retry_tx.clone();
                thread::spawn(move || {
                    thread::sleep(delay);
                    let _ = retry_tx.send(SyncCommand::Request(retry));
                });
                Ok(())
            }
        }
    }

    fn reconcile_body(
        &mut self,
        request: &QueuedRequest,
        server: &ServerRow,
        mime: &str,
        bytes: &[u8],
    ) -> Result<(), SyncError> {
        let covers_dir = covers::covers_dir(&self.cache_root, &server.name);
        let ws = self.store.workspace()?;
        let result = reconcile::reconcile(&ws, server.id, &request.kind, mime, bytes, &covers_dir);
        // a parse failure still commits whatever was applied before it
        if let Err(commit_err) = ws.commit() {
            error!(
                "Commit after {} failed: {commit_err}",
                request.kind.action_name()
            );
            return Err(commit_err);
        }
        let outcome = result?;

        if let Some(version) = &outcome.api_version {
            if api_version_at_least(version, 1, 13) {
                self.capabilities.set_form_post(server.id, true);
            }
        }
        if let Some(feature) = outcome.disabled_feature {
            if self.capabilities.mark_unsupported(server.id, feature) {
                warn!(
                    "Server '{}' reports {feature:?} as not supported; giving up on it",
                    server.name
                );
            }
        }
        for notification in outcome.notifications {
            self.publish(notification);
        }
        for fetch in outcome.cover_fetches {
            let cover_request = QueuedRequest {
                server_id: server.id,
                kind: RequestKind::GetCoverArt {
                    id: fetch.cover_remote_id,
                    album_id: fetch.album_remote_id,
                },
                cancelled: Arc::new(AtomicBool::new(false)),
            };
            let _ = self.retry_tx.send(SyncCommand::Request(cover_request));
        }
        Ok(())
    }

    fn load_server(&mut self, server_id: i64) -> Result<ServerRow, SyncError> {
        let ws = self.store.workspace()?;
        ws.server(server_id)?.ok_or_else(|| {
            SyncError::Store(rusqlite::Error::QueryReturnedNoRows)
        })
    }

    fn run_maintenance(&mut self) {
        let result = (|| -> Result<(), SyncError> {
            let ws = self.store.workspace()?;
            maintenance::run_sweeps(&ws)?;
            ws.commit()
        })();
        if let Err(err) = result {
            error!("Maintenance sweep failed: {err}");
        }
    }

    fn register_download(&mut self, server_id: i64, track_id: i64, path: PathBuf) {
        let result = (|| -> Result<(), SyncError> {
            let ws = self.store.workspace()?;
            ws.set_track_local_path(track_id, path.to_str())?;
            ws.commit()
        })();
        match result {
            Ok(()) => self.publish(SyncMessage::TrackDownloaded {
                server_id,
                track_id,
                path,
            }),
            Err(err) => {
                error!("Recording download for track {track_id} failed: {err}");
                self.publish(SyncMessage::OperationFailed {
                    server_id,
                    action: "download".to_string(),
                    error: err.to_string(),
                });
            }
        }
    }

    fn publish(&self, message: SyncMessage) {
        let _ = self.bus_producer.send(Message::Sync(message));
    }
}

//! Serialized track-download queue.
//!
//! Binary downloads run on their own dedicated thread so a long transfer
//! never stalls catalog requests. The download worker never touches the
//! store: completion is reported back into the request queue, whose worker
//! records the local path and publishes the notification. The submitter
//! supplies the server coordinates up front for the same reason.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::auth;
use crate::error::SyncError;
use crate::protocol::{Message, SyncMessage};
use crate::sync_manager::{CredentialSource, SyncHandle};
use crate::transport::build_query_url;

/// Server coordinates a download needs, captured at submission time.
#[derive(Debug, Clone)]
pub struct ServerTarget {
    pub server_id: i64,
    pub name: String,
    pub url: String,
    pub username: String,
    pub use_token_auth: bool,
}

pub struct DownloadRequest {
    pub server: ServerTarget,
    pub track_id: i64,
    pub track_remote_id: String,
    pub destination: PathBuf,
    pub cancelled: Arc<AtomicBool>,
}

pub enum DownloadCommand {
    Download(DownloadRequest),
    Shutdown,
}

#[derive(Clone)]
pub struct DownloadHandle {
    tx: Sender<DownloadCommand>,
}

impl DownloadHandle {
    /// Enqueues a download and returns its cancellation flag.
    pub fn download(
        &self,
        server: ServerTarget,
        track_id: i64,
        track_remote_id: String,
        destination: PathBuf,
    ) -> Arc<AtomicBool> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let _ = self.tx.send(DownloadCommand::Download(DownloadRequest {
            server,
            track_id,
            track_remote_id,
            destination,
            cancelled: cancelled.clone(),
        }));
        cancelled
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(DownloadCommand::Shutdown);
    }
}

/// Seam for the actual byte transfer; the production implementation streams
/// `rest/download.view` to disk over `ureq`.
pub trait TrackFetcher: Send {
    fn fetch(
        &self,
        base_url: &str,
        auth: &[(String, String)],
        track_remote_id: &str,
        destination: &Path,
    ) -> Result<(), SyncError>;
}

pub struct HttpTrackFetcher {
    agent: ureq::Agent,
}

impl HttpTrackFetcher {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            // long timeout: whole files stream through this call
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(15))
            .build();
        Self { agent }
    }
}

impl Default for HttpTrackFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackFetcher for HttpTrackFetcher {
    fn fetch(
        &self,
        base_url: &str,
        auth: &[(String, String)],
        track_remote_id: &str,
        destination: &Path,
    ) -> Result<(), SyncError> {
        let mut parameters = auth.to_vec();
        parameters.push(("id".to_string(), track_remote_id.to_string()));
        let url = build_query_url(base_url, "download", &parameters);
        let response = self
            .agent
            .get(&url)
            .call()
            .map_err(|err| SyncError::Transport(err.to_string()))?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(destination)?;
        io::copy(&mut response.into_reader(), &mut file)?;
        Ok(())
    }
}

pub struct DownloadManager<F: TrackFetcher, C: CredentialSource> {
    fetcher: F,
    credentials: C,
    sync: SyncHandle,
    bus_producer: broadcast::Sender<Message>,
    rx: Receiver<DownloadCommand>,
}

impl<F: TrackFetcher + 'static, C: CredentialSource + 'static> DownloadManager<F, C> {
    pub fn new(
        fetcher: F,
        credentials: C,
        sync: SyncHandle,
        bus_producer: broadcast::Sender<Message>,
    ) -> (DownloadHandle, Self) {
        let (tx, rx) = std::sync::mpsc::channel();
        let manager = Self {
            fetcher,
            credentials,
            sync,
            bus_producer,
            rx,
        };
        (DownloadHandle { tx }, manager)
    }

    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("subtide-download".to_string())
            .spawn(move || {
                let mut manager = self;
                manager.run();
            })
            .expect("download worker thread failed to start")
    }

    pub fn run(&mut self) {
        info!("Download manager started");
        while let Ok(command) = self.rx.recv() {
            match command {
                DownloadCommand::Download(request) => self.execute(request),
                DownloadCommand::Shutdown => break,
            }
        }
        info!("Download manager stopped");
    }

    fn execute(&mut self, request: DownloadRequest) {
        if request.cancelled.load(Ordering::SeqCst) {
            debug!(
                "Dropping cancelled download of track {}",
                request.track_remote_id
            );
            return;
        }
        match self.execute_inner(&request) {
            Ok(()) => {
                // the request queue owns the store; it records the path
                self.sync.register_download(
                    request.server.server_id,
                    request.track_id,
                    request.destination,
                );
            }
            Err(err) => {
                warn!(
                    "Download of track {} from '{}' failed: {err}",
                    request.track_remote_id, request.server.name
                );
                let _ = self
                    .bus_producer
                    .send(Message::Sync(SyncMessage::OperationFailed {
                        server_id: request.server.server_id,
                        action: "download".to_string(),
                        error: err.to_string(),
                    }));
            }
        }
    }

    fn execute_inner(&mut self, request: &DownloadRequest) -> Result<(), SyncError> {
        let password = self
            .credentials
            .password(&request.server.name)
            .map_err(SyncError::Credentials)?
            .ok_or_else(|| {
                SyncError::Credentials(format!(
                    "no stored password for server '{}'",
                    request.server.name
                ))
            })?;
        let auth = auth::base_parameters(
            &request.server.username,
            &password,
            request.server.use_token_auth,
        )?;
        self.fetcher.fetch(
            &request.server.url,
            &auth,
            &request.track_remote_id,
            &request.destination,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{DownloadManager, ServerTarget, TrackFetcher};
    use crate::capabilities::CapabilityMap;
    use crate::error::SyncError;
    use crate::protocol::{Message, SyncMessage};
    use crate::request::RequestKind;
    use crate::store::Store;
    use crate::sync_manager::{CredentialSource, SyncManager};
    use crate::transport::{RequestTransport, TransportReply};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct FixedPassword;

    impl CredentialSource for FixedPassword {
        fn password(&self, _server_name: &str) -> Result<Option<String>, String> {
            Ok(Some("sesame".to_string()))
        }
    }

    struct IdleTransport;

    impl RequestTransport for IdleTransport {
        fn send(
            &self,
            _base_url: &str,
            _auth: &[(String, String)],
            _kind: &RequestKind,
            _use_form_post: bool,
        ) -> Result<TransportReply, SyncError> {
            Ok(TransportReply::Body {
                mime: "text/xml".to_string(),
                bytes: b"<subsonic-response status=\"ok\" version=\"1.16.1\"/>".to_vec(),
            })
        }
    }

    struct WritingFetcher;

    impl TrackFetcher for WritingFetcher {
        fn fetch(
            &self,
            _base_url: &str,
            _auth: &[(String, String)],
            _track_remote_id: &str,
            destination: &Path,
        ) -> Result<(), SyncError> {
            std::fs::create_dir_all(destination.parent().expect("parent"))?;
            std::fs::write(destination, b"audio bytes")?;
            Ok(())
        }
    }

    struct FailingFetcher;

    impl TrackFetcher for FailingFetcher {
        fn fetch(
            &self,
            _base_url: &str,
            _auth: &[(String, String)],
            _track_remote_id: &str,
            _destination: &Path,
        ) -> Result<(), SyncError> {
            Err(SyncError::Transport("connection reset".to_string()))
        }
    }

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("subtide-dl-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    fn target(server_id: i64) -> ServerTarget {
        ServerTarget {
            server_id,
            name: "Home".to_string(),
            url: "https://music.example.com".to_string(),
            username: "alice".to_string(),
            use_token_auth: true,
        }
    }

    fn drain(bus_rx: &mut broadcast::Receiver<Message>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(message) = bus_rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_completed_download_is_recorded_through_the_request_queue() {
        let mut store = Store::open_in_memory().expect("store");
        let (server_id, track_id) = {
            let ws = store.workspace().expect("workspace");
            let server_id = ws
                .create_server("Home", "https://music.example.com", "alice", true)
                .expect("server");
            let track_id = ws
                .create_track(server_id, Some("t-1"), "So What")
                .expect("track");
            ws.commit().expect("commit");
            (server_id, track_id)
        };

        let (bus_tx, mut bus_rx) = broadcast::channel(64);
        let (sync_handle, sync_manager) = SyncManager::new(
            store,
            IdleTransport,
            FixedPassword,
            Arc::new(CapabilityMap::new()),
            bus_tx.clone(),
            std::env::temp_dir(),
        );
        let sync_worker = sync_manager.spawn();
        let (download_handle, download_manager) =
            DownloadManager::new(WritingFetcher, FixedPassword, sync_handle.clone(), bus_tx);
        let download_worker = download_manager.spawn();

        let destination = scratch_path("so-what.flac");
        download_handle.download(target(server_id), track_id, "t-1".to_string(), destination.clone());
        std::thread::sleep(Duration::from_millis(300));
        download_handle.shutdown();
        download_worker.join().expect("download worker exits");
        sync_handle.shutdown();
        sync_worker.join().expect("sync worker exits");

        assert!(destination.exists());
        let messages = drain(&mut bus_rx);
        assert!(messages.iter().any(|message| matches!(
            message,
            Message::Sync(SyncMessage::TrackDownloaded { track_id: id, .. }) if *id == track_id
        )));
    }

    #[test]
    fn test_failed_download_surfaces_operation_failure() {
        let (bus_tx, mut bus_rx) = broadcast::channel(64);
        let store = Store::open_in_memory().expect("store");
        let (sync_handle, sync_manager) = SyncManager::new(
            store,
            IdleTransport,
            FixedPassword,
            Arc::new(CapabilityMap::new()),
            bus_tx.clone(),
            std::env::temp_dir(),
        );
        let sync_worker = sync_manager.spawn();
        let (download_handle, download_manager) =
            DownloadManager::new(FailingFetcher, FixedPassword, sync_handle.clone(), bus_tx);
        let download_worker = download_manager.spawn();

        download_handle.download(target(1), 1, "t-1".to_string(), scratch_path("x.flac"));
        std::thread::sleep(Duration::from_millis(200));
        download_handle.shutdown();
        download_worker.join().expect("download worker exits");
        sync_handle.shutdown();
        sync_worker.join().expect("sync worker exits");

        let messages = drain(&mut bus_rx);
        assert!(messages.iter().any(|message| matches!(
            message,
            Message::Sync(SyncMessage::OperationFailed { action, .. }) if action == "download"
        )));
    }

    #[test]
    fn test_cancelled_download_never_starts() {
        let (bus_tx, _bus_rx) = broadcast::channel(64);
        let store = Store::open_in_memory().expect("store");
        let (sync_handle, sync_manager) = SyncManager::new(
            store,
            IdleTransport,
            FixedPassword,
            Arc::new(CapabilityMap::new()),
            bus_tx.clone(),
            std::env::temp_dir(),
        );
        let sync_worker = sync_manager.spawn();
        let (download_handle, download_manager) =
            DownloadManager::new(WritingFetcher, FixedPassword, sync_handle.clone(), bus_tx);

        let destination = scratch_path("never.flac");
        let cancelled =
            download_handle.download(target(1), 1, "t-1".to_string(), destination.clone());
        cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        // worker starts after the flag is already set
        let download_worker = download_manager.spawn();
        std::thread::sleep(Duration::from_millis(100));
        download_handle.shutdown();
        download_worker.join().expect("download worker exits");
        sync_handle.shutdown();
        sync_worker.join().expect("sync worker exits");

        assert!(!destination.exists());
    }
}

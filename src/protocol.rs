//! Event-bus protocol shared by all runtime components.
//!
//! This module defines all message payloads the sync engine publishes for
//! external consumers (UI, player). The engine has no knowledge of its
//! subscribers; every notification is fire-and-forget broadcast traffic.

use std::path::PathBuf;

use crate::config::ServersConfig;

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Sync(SyncMessage),
    Config(ConfigMessage),
}

/// Sync-domain notifications published as logical operations complete.
#[derive(Debug, Clone)]
pub enum SyncMessage {
    /// The ping round-trip succeeded and the server reported its API version.
    ConnectionSucceeded {
        server_id: i64,
    },
    /// The server reported an application-level error that was not recovered
    /// locally (anything other than "not found" / "not supported").
    ConnectionFailed {
        server_id: i64,
        code: Option<i32>,
        message: String,
    },
    /// Index groups or the folder-style artist index changed.
    IndexesUpdated {
        server_id: i64,
    },
    ArtistsUpdated {
        server_id: i64,
    },
    AlbumsUpdated {
        server_id: i64,
    },
    TracksUpdated {
        server_id: i64,
    },
    PlaylistsUpdated {
        server_id: i64,
    },
    PodcastsUpdated {
        server_id: i64,
    },
    NowPlayingUpdated {
        server_id: i64,
    },
    /// A cover image file landed in the on-disk cache.
    CoversUpdated {
        server_id: i64,
    },
    SearchResultUpdated(SearchResult),
    ScanProgress {
        server_id: i64,
        count: i64,
    },
    ScanDone {
        server_id: i64,
    },
    /// A track download finished and its local path was recorded.
    TrackDownloaded {
        server_id: i64,
        track_id: i64,
        path: PathBuf,
    },
    /// An operation ended in a failure that should reach the user.
    OperationFailed {
        server_id: i64,
        action: String,
        error: String,
    },
}

/// Matched local track rows for one search query.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub server_id: i64,
    /// The query string as submitted.
    pub query: String,
    /// Local row ids of matched tracks, in response order.
    pub track_ids: Vec<i64>,
}

/// Configuration updates.
#[derive(Debug, Clone)]
pub enum ConfigMessage {
    ServersChanged(ServersConfig),
}

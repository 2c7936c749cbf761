//! Sync engine for Subsonic-family media servers.
//!
//! Mirrors remote server catalogs (artists, albums, tracks, directories,
//! playlists, podcasts, covers, now-playing) into a local SQLite object
//! graph over the servers' XML REST protocol. Consumers submit logical
//! requests through [`sync_manager::SyncHandle`], subscribe to the
//! [`protocol::Message`] broadcast bus for change notifications, and read
//! the graph through [`store::Store`]. Binary track downloads run on their
//! own queue via [`download_manager::DownloadHandle`].

pub mod auth;
pub mod capabilities;
pub mod config;
pub mod covers;
pub mod download_manager;
pub mod error;
pub mod maintenance;
pub mod protocol;
pub mod reconcile;
pub mod request;
pub mod server_keyring;
pub mod store;
pub mod sync_manager;
pub mod transport;

pub use error::SyncError;
pub use request::{AlbumListFlavor, RequestKind};

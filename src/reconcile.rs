//! Streaming reconciliation of server responses into the object graph.
//!
//! One pass over the XML, constant memory: each recognized element is
//! upserted into the workspace as it streams by, unrecognized elements are
//! logged and skipped. Lookups prefer the remote id and fall back to the
//! name for legacy payloads that omit ids; a name match adopts the remote id
//! so the row converges on the stronger identity. Parents referenced before
//! they are described get partial stub rows, corrected when their own
//! element eventually arrives.
//!
//! Exhaustive listings (artist index, playlist index) prune rows the server
//! no longer reports. Partial listings never prune. A malformed document
//! aborts the pass with a parse error but leaves the mutations already
//! applied in the workspace; the caller decides whether to commit them.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use log::{debug, warn};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::capabilities::Feature;
use crate::covers;
use crate::error::SyncError;
use crate::protocol::{SearchResult, SyncMessage};
use crate::request::{AlbumListFlavor, RequestKind};
use crate::store::{TrackFields, Workspace};

/// A cover image the caller should fetch after committing.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverFetch {
    pub cover_remote_id: String,
    pub album_remote_id: Option<String>,
}

/// Everything one reconciliation pass produced besides store mutations.
#[derive(Debug, Default)]
pub struct Outcome {
    pub notifications: Vec<SyncMessage>,
    pub cover_fetches: Vec<CoverFetch>,
    /// Set when the server answered "not supported" at the application level.
    pub disabled_feature: Option<Feature>,
    /// Protocol version reported by the response envelope.
    pub api_version: Option<String>,
}

type Attrs = HashMap<String, String>;

fn attr_map(element: &BytesStart<'_>) -> Result<Attrs, SyncError> {
    let mut attrs = HashMap::new();
    for attr in element.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|err| SyncError::Parse(err.to_string()))?
            .to_string();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

fn get<'a>(attrs: &'a Attrs, key: &str) -> Option<&'a str> {
    attrs.get(key).map(String::as_str)
}

fn get_i64(attrs: &Attrs, key: &str) -> Option<i64> {
    attrs.get(key).and_then(|value| value.parse().ok())
}

/// Applies one response body to the workspace.
///
/// Binary bodies (cover art) are written to the cache directory; XML bodies
/// are streamed. The workspace is not committed here.
pub fn reconcile(
    ws: &Workspace<'_>,
    server_id: i64,
    kind: &RequestKind,
    mime: &str,
    body: &[u8],
    covers_dir: &Path,
) -> Result<Outcome, SyncError> {
    if let RequestKind::GetCoverArt { id, album_id } = kind {
        if mime.starts_with("image/") || mime == "application/octet-stream" {
            return import_fetched_cover(
                ws,
                server_id,
                id,
                album_id.as_deref(),
                mime,
                body,
                covers_dir,
            );
        }
    }

    let text = std::str::from_utf8(body)
        .map_err(|err| SyncError::Parse(format!("response is not UTF-8: {err}")))?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut pass = Pass {
        ws,
        server_id,
        kind,
        outcome: Outcome::default(),
        seen_artists: HashSet::new(),
        seen_playlists: HashSet::new(),
        seen_starred_albums: HashSet::new(),
        queued_covers: HashSet::new(),
        current_group: None,
        current_artist: None,
        current_album: None,
        current_directory: None,
        current_playlist: None,
        playlist_position: 0,
        current_podcast: None,
        search_track_ids: Vec::new(),
        error: None,
        scan_running: None,
        scan_count: None,
    };

    loop {
        match reader.read_event()? {
            Event::Start(element) => {
                let name = String::from_utf8_lossy(element.local_name().as_ref()).to_string();
                let attrs = attr_map(&element)?;
                pass.element(&name, &attrs)?;
            }
            Event::Empty(element) => {
                let name = String::from_utf8_lossy(element.local_name().as_ref()).to_string();
                let attrs = attr_map(&element)?;
                pass.element(&name, &attrs)?;
            }
            Event::End(element) => {
                let name = String::from_utf8_lossy(element.local_name().as_ref()).to_string();
                pass.element_end(&name);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    pass.finish()
}

fn import_fetched_cover(
    ws: &Workspace<'_>,
    server_id: i64,
    cover_remote_id: &str,
    album_remote_id: Option<&str>,
    mime: &str,
    body: &[u8],
    covers_dir: &Path,
) -> Result<Outcome, SyncError> {
    let path = covers::import_cover(covers_dir, cover_remote_id, mime, body)?;
    let cover_id = match ws.fetch_cover_by_remote_id(cover_remote_id)? {
        Some(cover) => cover.id,
        None => ws.create_cover(cover_remote_id)?,
    };
    ws.set_cover_path(cover_id, path.to_str())?;
    // requests issued for an album carry its id; wire the ownership in case
    // the listing that scheduled this fetch never got to
    if let Some(album_remote_id) = album_remote_id {
        if let Some(album) = ws.fetch_album_by_remote_id(server_id, album_remote_id)? {
            ws.set_cover_album(cover_id, Some(album.id))?;
        }
    }
    let mut outcome = Outcome::default();
    outcome
        .notifications
        .push(SyncMessage::CoversUpdated { server_id });
    Ok(outcome)
}

struct Pass<'a, 'tx> {
    ws: &'a Workspace<'tx>,
    server_id: i64,
    kind: &'a RequestKind,
    outcome: Outcome,
    seen_artists: HashSet<i64>,
    seen_playlists: HashSet<i64>,
    seen_starred_albums: HashSet<i64>,
    queued_covers: HashSet<String>,
    current_group: Option<i64>,
    current_artist: Option<i64>,
    current_album: Option<i64>,
    current_directory: Option<i64>,
    current_playlist: Option<i64>,
    playlist_position: usize,
    current_podcast: Option<i64>,
    search_track_ids: Vec<i64>,
    error: Option<(Option<i32>, String)>,
    scan_running: Option<bool>,
    scan_count: Option<i64>,
}

impl Pass<'_, '_> {
    fn element(&mut self, name: &str, attrs: &Attrs) -> Result<(), SyncError> {
        match name {
            "subsonic-response" => {
                if let Some(version) = get(attrs, "version") {
                    self.outcome.api_version = Some(version.to_string());
                }
            }
            "error" => {
                let code = get_i64(attrs, "code").map(|code| code as i32);
                let message = get(attrs, "message").unwrap_or_default().to_string();
                self.error = Some((code, message));
            }
            "license" => {
                self.ws
                    .set_server_license(self.server_id, get(attrs, "valid") == Some("true"))?;
            }
            "index" => {
                if let Some(group_name) = get(attrs, "name") {
                    let group_id = match self.ws.fetch_group(self.server_id, group_name)? {
                        Some(id) => id,
                        None => self.ws.create_group(self.server_id, group_name)?,
                    };
                    self.current_group = Some(group_id);
                }
            }
            "artist" => {
                if let Some(artist_id) = self.upsert_artist(attrs)? {
                    if matches!(
                        self.kind,
                        RequestKind::GetArtists | RequestKind::GetDirectories
                    ) {
                        self.seen_artists.insert(artist_id);
                    }
                    if matches!(self.kind, RequestKind::GetArtist { .. }) {
                        self.current_artist = Some(artist_id);
                    }
                }
            }
            "album" => {
                if let Some(album_id) = self.upsert_album(attrs)? {
                    if matches!(self.kind, RequestKind::GetAlbum { .. }) {
                        self.current_album = Some(album_id);
                    }
                    if matches!(
                        self.kind,
                        RequestKind::GetAlbumList {
                            flavor: AlbumListFlavor::Starred
                        }
                    ) {
                        self.seen_starred_albums.insert(album_id);
                    }
                }
            }
            "song" => {
                if let Some(track_id) = self.upsert_track(attrs)? {
                    if matches!(self.kind, RequestKind::Search { .. }) {
                        self.search_track_ids.push(track_id);
                    }
                }
            }
            "child" => {
                if get(attrs, "isDir") == Some("true") {
                    let Some(remote_id) = get(attrs, "id") else {
                        return Ok(());
                    };
                    let dir_name = get(attrs, "title")
                        .or_else(|| get(attrs, "name"))
                        .unwrap_or(remote_id);
                    self.upsert_directory(
                        remote_id,
                        dir_name,
                        get(attrs, "parent"),
                        get(attrs, "starred"),
                        false,
                    )?;
                } else if let Some(track_id) = self.upsert_track(attrs)? {
                    if let Some(directory_id) = self.current_directory {
                        self.ws.set_track_directory(track_id, directory_id)?;
                    }
                }
            }
            "directory" => {
                let Some(remote_id) = get(attrs, "id") else {
                    return Ok(());
                };
                let dir_name = get(attrs, "name").unwrap_or(remote_id);
                let directory_id = self.upsert_directory(
                    remote_id,
                    dir_name,
                    get(attrs, "parent"),
                    get(attrs, "starred"),
                    false,
                )?;
                self.current_directory = Some(directory_id);
            }
            "playlist" => {
                if let Some(playlist_id) = self.upsert_playlist(attrs)? {
                    if matches!(self.kind, RequestKind::GetPlaylists) {
                        self.seen_playlists.insert(playlist_id);
                    }
                    if matches!(
                        self.kind,
                        RequestKind::GetPlaylist { .. }
                            | RequestKind::CreatePlaylist { .. }
                            | RequestKind::ReplacePlaylist { .. }
                    ) {
                        // detail responses carry the authoritative membership
                        self.ws.clear_playlist(playlist_id)?;
                        self.current_playlist = Some(playlist_id);
                        self.playlist_position = 0;
                    }
                }
            }
            "entry" => match self.kind {
                RequestKind::GetNowPlaying => {
                    if let Some(track_id) = self.upsert_track(attrs)? {
                        self.ws.insert_now_playing(
                            self.server_id,
                            get(attrs, "username").unwrap_or_default(),
                            get_i64(attrs, "minutesAgo"),
                            track_id,
                        )?;
                    }
                }
                _ => {
                    if let Some(track_id) = self.upsert_track(attrs)? {
                        if let Some(playlist_id) = self.current_playlist {
                            self.ws.append_playlist_track(
                                playlist_id,
                                track_id,
                                self.playlist_position,
                            )?;
                            self.playlist_position += 1;
                        }
                    }
                }
            },
            "nowPlaying" => {
                self.ws.clear_now_playing(self.server_id)?;
            }
            "channel" => {
                let Some(remote_id) = get(attrs, "id") else {
                    return Ok(());
                };
                let podcast_name = get(attrs, "title").unwrap_or(remote_id);
                let podcast_id = match self
                    .ws
                    .fetch_podcast_by_remote_id(self.server_id, remote_id)?
                {
                    Some(podcast) => podcast.id,
                    None => self
                        .ws
                        .create_podcast(self.server_id, remote_id, podcast_name)?,
                };
                self.ws.update_podcast_fields(
                    podcast_id,
                    podcast_name,
                    get(attrs, "status"),
                    get(attrs, "description"),
                )?;
                self.current_podcast = Some(podcast_id);
            }
            "episode" => {
                self.upsert_episode(attrs)?;
            }
            "scanStatus" => {
                self.scan_running = Some(get(attrs, "scanning") == Some("true"));
                self.scan_count = get_i64(attrs, "count");
            }
            // pure containers
            "artists" | "albumList" | "albumList2" | "indexes" | "playlists" | "podcasts"
            | "searchResult2" | "searchResult3" | "starred" | "starred2" => {}
            other => {
                debug!("Skipping unrecognized element <{other}>");
            }
        }
        Ok(())
    }

    fn element_end(&mut self, name: &str) {
        match name {
            "index" => self.current_group = None,
            "artist" => {
                if !matches!(self.kind, RequestKind::GetArtist { .. }) {
                    self.current_artist = None;
                }
            }
            "directory" => self.current_directory = None,
            "playlist" => self.current_playlist = None,
            "channel" => self.current_podcast = None,
            _ => {}
        }
    }

    // Upserts: remote id first, name fallback, create last. A name match
    // with an id in hand adopts the id — but only when the matched row is
    // not already bound to a different id; same-named rows with distinct
    // remote ids are distinct entities.

    fn upsert_artist(&mut self, attrs: &Attrs) -> Result<Option<i64>, SyncError> {
        let remote_id = get(attrs, "id");
        let name = get(attrs, "name");
        let existing = match (remote_id, name) {
            (Some(remote_id), _) => {
                match self.ws.fetch_artist_by_remote_id(self.server_id, remote_id)? {
                    Some(artist) => Some(artist),
                    None => match name {
                        Some(name) => self
                            .ws
                            .fetch_artist_by_name(self.server_id, name)?
                            .filter(|artist| artist.remote_id.is_none()),
                        None => None,
                    },
                }
            }
            (None, Some(name)) => self.ws.fetch_artist_by_name(self.server_id, name)?,
            (None, None) => {
                debug!("Skipping artist element with neither id nor name");
                return Ok(None);
            }
        };

        let artist_id = match existing {
            Some(artist) => {
                if artist.remote_id.is_none() {
                    if let Some(remote_id) = remote_id {
                        self.ws.set_artist_remote_id(artist.id, remote_id)?;
                    }
                }
                let display_name = name.unwrap_or(artist.name.as_str());
                self.ws.update_artist_fields(
                    artist.id,
                    display_name,
                    get(attrs, "starred"),
                    false,
                )?;
                artist.id
            }
            None => {
                let display_name = name.unwrap_or_else(|| remote_id.unwrap_or_default());
                let artist_id =
                    self.ws
                        .create_artist(self.server_id, remote_id, display_name, false)?;
                if let Some(starred) = get(attrs, "starred") {
                    self.ws.set_artist_starred(artist_id, Some(starred))?;
                }
                artist_id
            }
        };
        if self.current_group.is_some() {
            self.ws.set_artist_group(artist_id, self.current_group)?;
        }
        Ok(Some(artist_id))
    }

    fn stub_artist(&mut self, name: &str) -> Result<i64, SyncError> {
        match self.ws.fetch_artist_by_name(self.server_id, name)? {
            Some(artist) => Ok(artist.id),
            None => self.ws.create_artist(self.server_id, None, name, true),
        }
    }

    fn resolve_album_artist(&mut self, attrs: &Attrs) -> Result<i64, SyncError> {
        if let Some(artist_remote_id) = get(attrs, "artistId") {
            if let Some(artist) = self
                .ws
                .fetch_artist_by_remote_id(self.server_id, artist_remote_id)?
            {
                return Ok(artist.id);
            }
            let artist_name = get(attrs, "artist").unwrap_or(artist_remote_id);
            let artist_id =
                self.ws
                    .create_artist(self.server_id, Some(artist_remote_id), artist_name, true)?;
            return Ok(artist_id);
        }
        if let Some(artist_id) = self.current_artist {
            return Ok(artist_id);
        }
        self.stub_artist(get(attrs, "artist").unwrap_or("Unknown Artist"))
    }

    fn upsert_album(&mut self, attrs: &Attrs) -> Result<Option<i64>, SyncError> {
        let remote_id = get(attrs, "id");
        let name = get(attrs, "name").or_else(|| get(attrs, "title"));
        if remote_id.is_none() && name.is_none() {
            debug!("Skipping album element with neither id nor name");
            return Ok(None);
        }
        let artist_id = self.resolve_album_artist(attrs)?;

        let mut existing = None;
        if let Some(remote_id) = remote_id {
            existing = self.ws.fetch_album_by_remote_id(self.server_id, remote_id)?;
        }
        if existing.is_none() {
            if let Some(name) = name {
                existing = self
                    .ws
                    .fetch_album_by_name(artist_id, name)?
                    .filter(|album| remote_id.is_none() || album.remote_id.is_none());
            }
        }

        let album_id = match existing {
            Some(album) => {
                if album.remote_id.is_none() {
                    if let Some(remote_id) = remote_id {
                        self.ws.set_album_remote_id(album.id, remote_id)?;
                    }
                }
                if album.artist_id != artist_id {
                    self.ws.set_album_artist(album.id, artist_id)?;
                }
                self.ws.update_album_fields(
                    album.id,
                    name.unwrap_or(album.name.as_str()),
                    get_i64(attrs, "year"),
                    get(attrs, "starred"),
                    false,
                )?;
                album.id
            }
            None => {
                let display_name = name.unwrap_or_else(|| remote_id.unwrap_or_default());
                let album_id = self
                    .ws
                    .create_album(artist_id, remote_id, display_name, false)?;
                self.ws.update_album_fields(
                    album_id,
                    display_name,
                    get_i64(attrs, "year"),
                    get(attrs, "starred"),
                    false,
                )?;
                album_id
            }
        };
        if let Some(cover_remote_id) = get(attrs, "coverArt") {
            self.reconcile_album_cover(album_id, remote_id, cover_remote_id)?;
        }
        Ok(Some(album_id))
    }

    fn stub_album(&mut self, album_remote_id: &str, artist_name: Option<&str>) -> Result<i64, SyncError> {
        if let Some(album) = self
            .ws
            .fetch_album_by_remote_id(self.server_id, album_remote_id)?
        {
            return Ok(album.id);
        }
        let artist_id = self.stub_artist(artist_name.unwrap_or("Unknown Artist"))?;
        let album_id = self
            .ws
            .create_album(artist_id, Some(album_remote_id), album_remote_id, true)?;
        self.ws
            .update_album_fields(album_id, album_remote_id, None, None, true)?;
        Ok(album_id)
    }

    fn upsert_track(&mut self, attrs: &Attrs) -> Result<Option<i64>, SyncError> {
        let remote_id = get(attrs, "id");
        let name = get(attrs, "title").or_else(|| get(attrs, "name"));
        let existing = match (remote_id, name) {
            (Some(remote_id), _) => {
                match self.ws.fetch_track_by_remote_id(self.server_id, remote_id)? {
                    Some(track) => Some(track),
                    None => match name {
                        Some(name) => self
                            .ws
                            .fetch_track_by_name(self.server_id, name)?
                            .filter(|track| track.remote_id.is_none()),
                        None => None,
                    },
                }
            }
            (None, Some(name)) => self.ws.fetch_track_by_name(self.server_id, name)?,
            (None, None) => {
                debug!("Skipping track element with neither id nor title");
                return Ok(None);
            }
        };

        let track_id = match &existing {
            Some(track) => {
                if track.remote_id.is_none() {
                    if let Some(remote_id) = remote_id {
                        self.ws.set_track_remote_id(track.id, remote_id)?;
                    }
                }
                track.id
            }
            None => {
                let display_name = name.unwrap_or_else(|| remote_id.unwrap_or_default());
                self.ws
                    .create_track(self.server_id, remote_id, display_name)?
            }
        };

        let display_name = name
            .map(str::to_string)
            .or_else(|| existing.as_ref().map(|track| track.name.clone()))
            .unwrap_or_else(|| remote_id.unwrap_or_default().to_string());
        self.ws.update_track_fields(
            track_id,
            &TrackFields {
                name: display_name,
                artist_name: get(attrs, "artist").map(str::to_string),
                duration: get_i64(attrs, "duration"),
                bitrate: get_i64(attrs, "bitRate"),
                content_type: get(attrs, "contentType").map(str::to_string),
                rating: get_i64(attrs, "userRating"),
                starred_at: get(attrs, "starred").map(str::to_string),
            },
        )?;

        let album_remote_id = get(attrs, "albumId");
        if let Some(album_remote_id) = album_remote_id {
            let album_id = self.stub_album(album_remote_id, get(attrs, "artist"))?;
            self.ws.set_track_album(track_id, album_id)?;
            if let Some(cover_remote_id) = get(attrs, "coverArt") {
                self.reconcile_album_cover(album_id, Some(album_remote_id), cover_remote_id)?;
            }
        } else if let Some(album_id) = self.current_album {
            self.ws.set_track_album(track_id, album_id)?;
        } else if let Some(cover_remote_id) = get(attrs, "coverArt") {
            self.reconcile_track_cover(track_id, cover_remote_id)?;
        }
        Ok(Some(track_id))
    }

    fn upsert_directory(
        &mut self,
        remote_id: &str,
        name: &str,
        parent_remote_id: Option<&str>,
        starred: Option<&str>,
        is_partial: bool,
    ) -> Result<i64, SyncError> {
        let parent_id = match parent_remote_id {
            Some(parent_remote_id) => Some(
                match self
                    .ws
                    .fetch_directory_by_remote_id(self.server_id, parent_remote_id)?
                {
                    Some(parent) => parent.id,
                    // stub parent; corrected when its own listing arrives
                    None => self.ws.create_directory(
                        self.server_id,
                        parent_remote_id,
                        parent_remote_id,
                        None,
                        true,
                    )?,
                },
            ),
            None => None,
        };
        match self
            .ws
            .fetch_directory_by_remote_id(self.server_id, remote_id)?
        {
            Some(directory) => {
                self.ws.update_directory_fields(
                    directory.id,
                    name,
                    parent_id.or(directory.parent_id),
                    starred,
                    is_partial,
                )?;
                Ok(directory.id)
            }
            None => self
                .ws
                .create_directory(self.server_id, remote_id, name, parent_id, is_partial),
        }
    }

    fn upsert_playlist(&mut self, attrs: &Attrs) -> Result<Option<i64>, SyncError> {
        let Some(remote_id) = get(attrs, "id") else {
            debug!("Skipping playlist element without id");
            return Ok(None);
        };
        let name = get(attrs, "name").unwrap_or(remote_id);
        match self
            .ws
            .fetch_playlist_by_remote_id(self.server_id, remote_id)?
        {
            Some(playlist) => {
                if playlist.name != name {
                    self.ws.rename_playlist(playlist.id, name)?;
                }
                Ok(Some(playlist.id))
            }
            None => Ok(Some(self.ws.create_playlist(
                Some(self.server_id),
                Some(remote_id),
                name,
                None,
            )?)),
        }
    }

    fn upsert_episode(&mut self, attrs: &Attrs) -> Result<(), SyncError> {
        let Some(podcast_id) = self.current_podcast else {
            debug!("Skipping episode element outside a channel");
            return Ok(());
        };
        let Some(remote_id) = get(attrs, "id") else {
            return Ok(());
        };
        let title = get(attrs, "title").unwrap_or(remote_id);
        let episode_id = match self.ws.fetch_episode_by_remote_id(podcast_id, remote_id)? {
            Some(episode) => episode.id,
            None => self.ws.create_episode(podcast_id, remote_id, title)?,
        };
        // the stream id doubles as the playable track's id
        let track_id = match get(attrs, "streamId") {
            Some(stream_id) => match self.ws.fetch_track_by_remote_id(self.server_id, stream_id)? {
                Some(track) => Some(track.id),
                None => Some(self.ws.create_track(self.server_id, Some(stream_id), title)?),
            },
            None => None,
        };
        self.ws.update_episode_fields(
            episode_id,
            title,
            get(attrs, "status"),
            get(attrs, "description"),
            get(attrs, "publishDate"),
            track_id,
        )?;
        Ok(())
    }

    // Cover reconciliation: an id mismatch invalidates the cached file path;
    // a fetch is queued only when no valid cached file exists and the same
    // cover is not already queued in this pass.

    fn reconcile_album_cover(
        &mut self,
        album_id: i64,
        album_remote_id: Option<&str>,
        cover_remote_id: &str,
    ) -> Result<(), SyncError> {
        let cover = match self.ws.album_cover(album_id)? {
            Some(cover) => {
                if cover.remote_id != cover_remote_id {
                    self.ws.set_cover_remote_id(cover.id, cover_remote_id)?;
                    self.ws.set_cover_path(cover.id, None)?;
                    self.ws.fetch_cover_by_remote_id(cover_remote_id)?.ok_or_else(|| {
                        SyncError::Store(rusqlite::Error::QueryReturnedNoRows)
                    })?
                } else {
                    cover
                }
            }
            None => {
                let cover_id = match self.ws.fetch_cover_by_remote_id(cover_remote_id)? {
                    Some(cover) => cover.id,
                    None => self.ws.create_cover(cover_remote_id)?,
                };
                self.ws.set_cover_album(cover_id, Some(album_id))?;
                self.ws
                    .fetch_cover_by_remote_id(cover_remote_id)?
                    .ok_or(SyncError::Store(rusqlite::Error::QueryReturnedNoRows))?
            }
        };
        self.queue_cover_fetch(&cover.remote_id, cover.image_path.as_deref(), album_remote_id);
        Ok(())
    }

    fn reconcile_track_cover(
        &mut self,
        track_id: i64,
        cover_remote_id: &str,
    ) -> Result<(), SyncError> {
        let cover_id = match self.ws.fetch_cover_by_remote_id(cover_remote_id)? {
            Some(cover) => cover.id,
            None => self.ws.create_cover(cover_remote_id)?,
        };
        self.ws.set_cover_track(cover_id, Some(track_id))?;
        let cover = self
            .ws
            .fetch_cover_by_remote_id(cover_remote_id)?
            .ok_or(SyncError::Store(rusqlite::Error::QueryReturnedNoRows))?;
        self.queue_cover_fetch(&cover.remote_id, cover.image_path.as_deref(), None);
        Ok(())
    }

    fn queue_cover_fetch(
        &mut self,
        cover_remote_id: &str,
        image_path: Option<&str>,
        album_remote_id: Option<&str>,
    ) {
        if !covers::needs_fetch(image_path) {
            return;
        }
        if self.queued_covers.insert(cover_remote_id.to_string()) {
            self.outcome.cover_fetches.push(CoverFetch {
                cover_remote_id: cover_remote_id.to_string(),
                album_remote_id: album_remote_id.map(str::to_string),
            });
        }
    }

    // End of document: error handling, pruning, notifications.

    fn finish(mut self) -> Result<Outcome, SyncError> {
        if let Some((code, message)) = self.error.take() {
            self.finish_error(code, message)?;
            return Ok(self.outcome);
        }

        match self.kind {
            RequestKind::Ping => {
                if let Some(version) = &self.outcome.api_version {
                    self.ws.set_server_api_version(self.server_id, version)?;
                }
                self.notify(SyncMessage::ConnectionSucceeded {
                    server_id: self.server_id,
                });
            }
            RequestKind::GetLicense => {}
            RequestKind::GetArtists => {
                self.prune_unseen_artists()?;
                self.ws
                    .set_server_last_indexes(self.server_id, chrono::Utc::now().timestamp())?;
                self.notify(SyncMessage::IndexesUpdated {
                    server_id: self.server_id,
                });
                self.notify(SyncMessage::ArtistsUpdated {
                    server_id: self.server_id,
                });
            }
            RequestKind::GetDirectories => {
                self.ws
                    .set_server_last_indexes(self.server_id, chrono::Utc::now().timestamp())?;
                self.notify(SyncMessage::IndexesUpdated {
                    server_id: self.server_id,
                });
            }
            RequestKind::GetArtist { .. } => {
                self.notify(SyncMessage::AlbumsUpdated {
                    server_id: self.server_id,
                });
            }
            RequestKind::GetAlbumList { flavor } => {
                if *flavor == AlbumListFlavor::Starred {
                    self.replace_starred_albums()?;
                }
                self.notify(SyncMessage::AlbumsUpdated {
                    server_id: self.server_id,
                });
            }
            RequestKind::GetAlbum { .. }
            | RequestKind::GetTrack { .. }
            | RequestKind::GetDirectory { .. } => {
                self.notify(SyncMessage::TracksUpdated {
                    server_id: self.server_id,
                });
            }
            RequestKind::GetPlaylists => {
                self.prune_unseen_playlists()?;
                self.notify(SyncMessage::PlaylistsUpdated {
                    server_id: self.server_id,
                });
            }
            RequestKind::GetPlaylist { .. }
            | RequestKind::CreatePlaylist { .. }
            | RequestKind::ReplacePlaylist { .. }
            | RequestKind::UpdatePlaylist { .. } => {
                self.notify(SyncMessage::PlaylistsUpdated {
                    server_id: self.server_id,
                });
            }
            RequestKind::DeletePlaylist { id } => {
                if let Some(playlist) = self.ws.fetch_playlist_by_remote_id(self.server_id, id)? {
                    self.ws.delete_playlist(playlist.id)?;
                }
                self.notify(SyncMessage::PlaylistsUpdated {
                    server_id: self.server_id,
                });
            }
            RequestKind::GetPodcasts => {
                self.notify(SyncMessage::PodcastsUpdated {
                    server_id: self.server_id,
                });
            }
            RequestKind::GetNowPlaying => {
                self.notify(SyncMessage::NowPlayingUpdated {
                    server_id: self.server_id,
                });
            }
            RequestKind::Search { query } => {
                let result = SearchResult {
                    server_id: self.server_id,
                    query: query.clone(),
                    track_ids: std::mem::take(&mut self.search_track_ids),
                };
                self.notify(SyncMessage::SearchResultUpdated(result));
            }
            RequestKind::SetRating { id, rating } => {
                if let Some(track) = self.ws.fetch_track_by_remote_id(self.server_id, id)? {
                    let rating = if *rating == 0 { None } else { Some(*rating as i64) };
                    self.ws.set_track_rating(track.id, rating)?;
                }
                self.notify(SyncMessage::TracksUpdated {
                    server_id: self.server_id,
                });
            }
            RequestKind::Scrobble { .. } => {}
            RequestKind::Star {
                track_ids,
                album_ids,
                artist_ids,
            } => {
                let now = chrono::Utc::now().to_rfc3339();
                self.apply_starred(track_ids, album_ids, artist_ids, Some(&now))?;
                self.notify(SyncMessage::TracksUpdated {
                    server_id: self.server_id,
                });
            }
            RequestKind::Unstar {
                track_ids,
                album_ids,
                artist_ids,
            } => {
                self.apply_starred(track_ids, album_ids, artist_ids, None)?;
                self.notify(SyncMessage::TracksUpdated {
                    server_id: self.server_id,
                });
            }
            RequestKind::ScanLibrary | RequestKind::GetScanStatus => {
                if self.scan_running == Some(false) {
                    self.notify(SyncMessage::ScanDone {
                        server_id: self.server_id,
                    });
                } else {
                    self.notify(SyncMessage::ScanProgress {
                        server_id: self.server_id,
                        count: self.scan_count.unwrap_or(0),
                    });
                }
            }
            RequestKind::GetCoverArt { .. } => {}
        }
        Ok(self.outcome)
    }

    /// Application-level `<error>`: code 70 ("data not found") on an
    /// id-bearing request means the entity is gone server-side, so the local
    /// row is deleted instead of surfacing a failure. A "not supported"
    /// message disables the feature. Everything else reaches the bus.
    fn finish_error(&mut self, code: Option<i32>, message: String) -> Result<(), SyncError> {
        if code == Some(70) && self.delete_missing_entity()? {
            return Ok(());
        }
        if message.to_lowercase().contains("not supported") {
            if let Some(feature) = self.kind.feature() {
                self.outcome.disabled_feature = Some(feature);
                return Ok(());
            }
        }
        warn!(
            "Server {} answered {} with error {:?}: {}",
            self.server_id,
            self.kind.action_name(),
            code,
            message
        );
        self.notify(SyncMessage::ConnectionFailed {
            server_id: self.server_id,
            code,
            message,
        });
        Ok(())
    }

    fn delete_missing_entity(&mut self) -> Result<bool, SyncError> {
        let server_id = self.server_id;
        match self.kind {
            RequestKind::GetArtist { id } => {
                if let Some(artist) = self.ws.fetch_artist_by_remote_id(server_id, id)? {
                    self.ws.delete_artist(artist.id)?;
                }
                self.notify(SyncMessage::ArtistsUpdated { server_id });
                Ok(true)
            }
            RequestKind::GetAlbum { id } => {
                if let Some(album) = self.ws.fetch_album_by_remote_id(server_id, id)? {
                    self.ws.delete_album(album.id)?;
                }
                self.notify(SyncMessage::AlbumsUpdated { server_id });
                Ok(true)
            }
            RequestKind::GetTrack { id } => {
                if let Some(track) = self.ws.fetch_track_by_remote_id(server_id, id)? {
                    self.ws.delete_track(track.id)?;
                }
                self.notify(SyncMessage::TracksUpdated { server_id });
                Ok(true)
            }
            RequestKind::GetDirectory { id } => {
                if let Some(directory) = self.ws.fetch_directory_by_remote_id(server_id, id)? {
                    self.ws.delete_directory(directory.id)?;
                }
                self.notify(SyncMessage::IndexesUpdated { server_id });
                Ok(true)
            }
            RequestKind::GetPlaylist { id } | RequestKind::DeletePlaylist { id } => {
                if let Some(playlist) = self.ws.fetch_playlist_by_remote_id(server_id, id)? {
                    self.ws.delete_playlist(playlist.id)?;
                }
                self.notify(SyncMessage::PlaylistsUpdated { server_id });
                Ok(true)
            }
            RequestKind::GetCoverArt { id, .. } => {
                if let Some(cover) = self.ws.fetch_cover_by_remote_id(id)? {
                    self.ws.delete_cover(cover.id)?;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn apply_starred(
        &mut self,
        track_ids: &[String],
        album_ids: &[String],
        artist_ids: &[String],
        starred_at: Option<&str>,
    ) -> Result<(), SyncError> {
        for remote_id in track_ids {
            if let Some(track) = self.ws.fetch_track_by_remote_id(self.server_id, remote_id)? {
                self.ws.set_track_starred(track.id, starred_at)?;
            }
        }
        for remote_id in album_ids {
            if let Some(album) = self.ws.fetch_album_by_remote_id(self.server_id, remote_id)? {
                self.ws.set_album_starred(album.id, starred_at)?;
            }
        }
        for remote_id in artist_ids {
            if let Some(artist) = self.ws.fetch_artist_by_remote_id(self.server_id, remote_id)? {
                self.ws.set_artist_starred(artist.id, starred_at)?;
            }
        }
        Ok(())
    }

    fn prune_unseen_artists(&mut self) -> Result<(), SyncError> {
        for artist in self.ws.artists_for_server(self.server_id)? {
            if !self.seen_artists.contains(&artist.id) {
                debug!("Pruning artist '{}' no longer listed", artist.name);
                self.ws.delete_artist(artist.id)?;
            }
        }
        Ok(())
    }

    fn prune_unseen_playlists(&mut self) -> Result<(), SyncError> {
        for playlist in self.ws.playlists_for_server(self.server_id)? {
            if !self.seen_playlists.contains(&playlist.id) {
                debug!("Pruning playlist '{}' no longer listed", playlist.name);
                self.ws.delete_playlist(playlist.id)?;
            }
        }
        Ok(())
    }

    /// The starred listing is authoritative: albums it omits are unstarred.
    fn replace_starred_albums(&mut self) -> Result<(), SyncError> {
        for album in self.ws.starred_albums_for_server(self.server_id)? {
            if !self.seen_starred_albums.contains(&album.id) {
                self.ws.set_album_starred(album.id, None)?;
            }
        }
        Ok(())
    }

    fn notify(&mut self, message: SyncMessage) {
        self.outcome.notifications.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::{reconcile, Outcome};
    use crate::capabilities::Feature;
    use crate::protocol::SyncMessage;
    use crate::request::{AlbumListFlavor, RequestKind};
    use crate::store::{Store, Workspace};
    use std::path::PathBuf;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("subtide-reconcile-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    fn envelope(inner: &str) -> String {
        format!(
            "<subsonic-response xmlns=\"http://subsonic.org/restapi\" status=\"ok\" \
             version=\"1.16.1\">{inner}</subsonic-response>"
        )
    }

    fn apply(ws: &Workspace<'_>, server_id: i64, kind: &RequestKind, inner: &str) -> Outcome {
        let body = envelope(inner);
        reconcile(
            ws,
            server_id,
            kind,
            "text/xml",
            body.as_bytes(),
            &scratch_dir(),
        )
        .expect("reconcile should succeed")
    }

    fn seeded_server(ws: &Workspace<'_>) -> i64 {
        ws.create_server("Home", "https://music.example.com", "alice", true)
            .expect("server created")
    }

    const THREE_ARTISTS: &str = "<artists><index name=\"D\">\
        <artist id=\"ar-1\" name=\"Miles Davis\"/>\
        <artist id=\"ar-2\" name=\"Duke Ellington\"/></index>\
        <index name=\"M\"><artist id=\"ar-3\" name=\"Charles Mingus\"/></index></artists>";

    #[test]
    fn test_ping_stores_api_version_and_notifies() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        let outcome = apply(&ws, server_id, &RequestKind::Ping, "");
        assert_eq!(outcome.api_version.as_deref(), Some("1.16.1"));
        assert!(matches!(
            outcome.notifications.as_slice(),
            [SyncMessage::ConnectionSucceeded { .. }]
        ));
        let server = ws.server(server_id).expect("query").expect("row");
        assert_eq!(server.api_version.as_deref(), Some("1.16.1"));
    }

    #[test]
    fn test_artist_listing_upsert_is_idempotent() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        apply(&ws, server_id, &RequestKind::GetArtists, THREE_ARTISTS);
        let first: Vec<i64> = ws
            .artists_for_server(server_id)
            .expect("query")
            .iter()
            .map(|artist| artist.id)
            .collect();
        apply(&ws, server_id, &RequestKind::GetArtists, THREE_ARTISTS);
        let second: Vec<i64> = ws
            .artists_for_server(server_id)
            .expect("query")
            .iter()
            .map(|artist| artist.id)
            .collect();
        assert_eq!(first, second, "re-applying the same listing changes nothing");
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_name_match_adopts_remote_id() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        let legacy_id = ws
            .create_artist(server_id, None, "Miles Davis", false)
            .expect("legacy artist");
        apply(
            &ws,
            server_id,
            &RequestKind::GetArtists,
            "<artists><index name=\"D\"><artist id=\"ar-1\" name=\"Miles Davis\"/></index></artists>",
        );
        let artists = ws.artists_for_server(server_id).expect("query");
        assert_eq!(artists.len(), 1, "no duplicate row was created");
        assert_eq!(artists[0].id, legacy_id);
        assert_eq!(artists[0].remote_id.as_deref(), Some("ar-1"));
    }

    #[test]
    fn test_exhaustive_artist_listing_prunes_unseen() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        for index in 1..=5 {
            ws.create_artist(server_id, Some(&format!("ar-{index}")), &format!("Artist {index}"), false)
                .expect("seed artist");
        }
        apply(&ws, server_id, &RequestKind::GetArtists, THREE_ARTISTS);
        let names: Vec<String> = ws
            .artists_for_server(server_id)
            .expect("query")
            .into_iter()
            .map(|artist| artist.name)
            .collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"Miles Davis".to_string()));
        assert!(!names.contains(&"Artist 4".to_string()));
    }

    #[test]
    fn test_playlist_listing_prunes_server_rows_only() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        ws.create_playlist(Some(server_id), Some("pl-old"), "Stale", None)
            .expect("stale playlist");
        let local = ws
            .create_playlist(None, None, "On Device", Some("LOCAL"))
            .expect("local playlist");
        apply(
            &ws,
            server_id,
            &RequestKind::GetPlaylists,
            "<playlists><playlist id=\"pl-1\" name=\"Favorites\"/></playlists>",
        );
        let server_playlists = ws.playlists_for_server(server_id).expect("query");
        assert_eq!(server_playlists.len(), 1);
        assert_eq!(server_playlists[0].remote_id.as_deref(), Some("pl-1"));
        // local playlists are outside the listing's authority
        assert!(ws
            .orphan_playlists()
            .expect("query")
            .iter()
            .all(|playlist| playlist.id != local));
    }

    #[test]
    fn test_absent_starred_attribute_clears_flag() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        let kind = RequestKind::GetArtist {
            id: "ar-1".to_string(),
        };
        apply(
            &ws,
            server_id,
            &kind,
            "<artist id=\"ar-1\" name=\"Miles Davis\">\
             <album id=\"al-1\" name=\"Kind of Blue\" starred=\"2026-01-01T00:00:00Z\"/></artist>",
        );
        let album = ws
            .fetch_album_by_remote_id(server_id, "al-1")
            .expect("query")
            .expect("album present");
        assert!(album.starred_at.is_some());

        apply(
            &ws,
            server_id,
            &kind,
            "<artist id=\"ar-1\" name=\"Miles Davis\">\
             <album id=\"al-1\" name=\"Kind of Blue\"/></artist>",
        );
        let album = ws
            .fetch_album_by_remote_id(server_id, "al-1")
            .expect("query")
            .expect("album present");
        assert!(album.starred_at.is_none(), "absence means cleared");
    }

    #[test]
    fn test_starred_listing_replaces_starred_set() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        let artist_id = ws
            .create_artist(server_id, Some("ar-1"), "Miles Davis", false)
            .expect("artist");
        let stale = ws
            .create_album(artist_id, Some("al-stale"), "Stale Star", false)
            .expect("album");
        ws.set_album_starred(stale, Some("2025-01-01T00:00:00Z"))
            .expect("starred seed");

        apply(
            &ws,
            server_id,
            &RequestKind::GetAlbumList {
                flavor: AlbumListFlavor::Starred,
            },
            "<albumList2><album id=\"al-1\" name=\"Kind of Blue\" artistId=\"ar-1\" \
             starred=\"2026-02-02T00:00:00Z\"/></albumList2>",
        );

        let starred = ws.starred_albums_for_server(server_id).expect("query");
        assert_eq!(starred.len(), 1);
        assert_eq!(starred[0].remote_id.as_deref(), Some("al-1"));
    }

    #[test]
    fn test_error_code_70_deletes_requested_entity() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        let artist_id = ws
            .create_artist(server_id, Some("ar-1"), "Miles Davis", false)
            .expect("artist");
        ws.create_album(artist_id, Some("al-1"), "Kind of Blue", false)
            .expect("album");
        let outcome = apply(
            &ws,
            server_id,
            &RequestKind::GetAlbum {
                id: "al-1".to_string(),
            },
            "<error code=\"70\" message=\"The requested data was not found.\"/>",
        );
        assert!(ws
            .fetch_album_by_remote_id(server_id, "al-1")
            .expect("query")
            .is_none());
        assert!(matches!(
            outcome.notifications.as_slice(),
            [SyncMessage::AlbumsUpdated { .. }]
        ));
    }

    #[test]
    fn test_not_supported_error_disables_feature() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        let outcome = apply(
            &ws,
            server_id,
            &RequestKind::GetPodcasts,
            "<error code=\"0\" message=\"Podcasts not supported.\"/>",
        );
        assert_eq!(outcome.disabled_feature, Some(Feature::Podcasts));
        assert!(outcome.notifications.is_empty());
    }

    #[test]
    fn test_other_error_surfaces_connection_failed() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        let outcome = apply(
            &ws,
            server_id,
            &RequestKind::Ping,
            "<error code=\"40\" message=\"Wrong username or password.\"/>",
        );
        let [SyncMessage::ConnectionFailed { code, message, .. }] =
            outcome.notifications.as_slice()
        else {
            panic!("expected a connection failure");
        };
        assert_eq!(*code, Some(40));
        assert!(message.contains("Wrong username"));
    }

    #[test]
    fn test_now_playing_is_cleared_and_rebuilt() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        apply(
            &ws,
            server_id,
            &RequestKind::GetNowPlaying,
            "<nowPlaying>\
             <entry id=\"t-1\" title=\"So What\" username=\"alice\" minutesAgo=\"1\"/>\
             <entry id=\"t-2\" title=\"All Blues\" username=\"bob\" minutesAgo=\"4\"/>\
             </nowPlaying>",
        );
        assert_eq!(ws.now_playing_for_server(server_id).expect("query").len(), 2);

        apply(
            &ws,
            server_id,
            &RequestKind::GetNowPlaying,
            "<nowPlaying>\
             <entry id=\"t-2\" title=\"All Blues\" username=\"bob\" minutesAgo=\"5\"/>\
             </nowPlaying>",
        );
        let entries = ws.now_playing_for_server(server_id).expect("query");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].username, "bob");
    }

    #[test]
    fn test_directory_children_create_stub_parents() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        apply(
            &ws,
            server_id,
            &RequestKind::GetDirectory {
                id: "d-10".to_string(),
            },
            "<directory id=\"d-10\" name=\"Jazz\" parent=\"d-1\">\
             <child id=\"d-11\" isDir=\"true\" title=\"Miles Davis\" parent=\"d-10\"/>\
             <child id=\"t-1\" isDir=\"false\" title=\"So What\" parent=\"d-10\"/>\
             </directory>",
        );
        let parent = ws
            .fetch_directory_by_remote_id(server_id, "d-1")
            .expect("query")
            .expect("stub parent exists");
        assert!(parent.is_partial);
        let listed = ws
            .fetch_directory_by_remote_id(server_id, "d-10")
            .expect("query")
            .expect("directory exists");
        assert!(!listed.is_partial);
        assert_eq!(listed.parent_id, Some(parent.id));
        let track = ws
            .fetch_track_by_remote_id(server_id, "t-1")
            .expect("query")
            .expect("track exists");
        assert_eq!(track.directory_id, Some(listed.id));
    }

    #[test]
    fn test_playlist_detail_rebuilds_membership_in_order() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        let kind = RequestKind::GetPlaylist {
            id: "pl-1".to_string(),
        };
        apply(
            &ws,
            server_id,
            &kind,
            "<playlist id=\"pl-1\" name=\"Favorites\">\
             <entry id=\"t-1\" title=\"So What\"/>\
             <entry id=\"t-2\" title=\"All Blues\"/>\
             </playlist>",
        );
        apply(
            &ws,
            server_id,
            &kind,
            "<playlist id=\"pl-1\" name=\"Favorites\">\
             <entry id=\"t-2\" title=\"All Blues\"/>\
             <entry id=\"t-1\" title=\"So What\"/>\
             </playlist>",
        );
        let playlist = ws
            .fetch_playlist_by_remote_id(server_id, "pl-1")
            .expect("query")
            .expect("playlist exists");
        let member_ids = ws.playlist_track_ids(playlist.id).expect("order query");
        let first = ws
            .fetch_track_by_remote_id(server_id, "t-2")
            .expect("query")
            .expect("track")
            .id;
        assert_eq!(member_ids.len(), 2);
        assert_eq!(member_ids[0], first, "second response order wins");
    }

    #[test]
    fn test_search_collects_matched_track_ids() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        let outcome = apply(
            &ws,
            server_id,
            &RequestKind::Search {
                query: "blue".to_string(),
            },
            "<searchResult3>\
             <song id=\"t-1\" title=\"All Blues\"/>\
             <song id=\"t-2\" title=\"Blue in Green\"/>\
             </searchResult3>",
        );
        let [SyncMessage::SearchResultUpdated(result)] = outcome.notifications.as_slice() else {
            panic!("expected a search result");
        };
        assert_eq!(result.query, "blue");
        assert_eq!(result.track_ids.len(), 2);
    }

    #[test]
    fn test_album_cover_fetch_queued_once_per_pass() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        let outcome = apply(
            &ws,
            server_id,
            &RequestKind::GetAlbumList {
                flavor: AlbumListFlavor::Newest,
            },
            "<albumList2>\
             <album id=\"al-1\" name=\"Kind of Blue\" artistId=\"ar-1\" coverArt=\"c-1\"/>\
             <album id=\"al-2\" name=\"Sketches of Spain\" artistId=\"ar-1\" coverArt=\"c-1\"/>\
             </albumList2>",
        );
        assert_eq!(outcome.cover_fetches.len(), 1);
        assert_eq!(outcome.cover_fetches[0].cover_remote_id, "c-1");
    }

    #[test]
    fn test_binary_cover_body_lands_in_cache() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        let dir = scratch_dir();
        let outcome = reconcile(
            &ws,
            server_id,
            &RequestKind::GetCoverArt {
                id: "c-1".to_string(),
                album_id: Some("al-1".to_string()),
            },
            "image/jpeg",
            b"\xff\xd8\xff\xe0",
            &dir,
        )
        .expect("binary reconcile");
        assert!(matches!(
            outcome.notifications.as_slice(),
            [SyncMessage::CoversUpdated { .. }]
        ));
        let cover = ws
            .fetch_cover_by_remote_id("c-1")
            .expect("query")
            .expect("cover row");
        let path = cover.image_path.expect("path recorded");
        assert!(std::path::Path::new(&path).exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_same_title_tracks_keep_distinct_rows() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        let outcome = apply(
            &ws,
            server_id,
            &RequestKind::Search {
                query: "intro".to_string(),
            },
            "<searchResult3>\
             <song id=\"t-1\" title=\"Intro\"/>\
             <song id=\"t-2\" title=\"Intro\"/>\
             </searchResult3>",
        );
        let first = ws
            .fetch_track_by_remote_id(server_id, "t-1")
            .expect("query")
            .expect("track t-1 has its own row");
        let second = ws
            .fetch_track_by_remote_id(server_id, "t-2")
            .expect("query")
            .expect("track t-2 has its own row");
        assert_ne!(first.id, second.id);
        let [SyncMessage::SearchResultUpdated(result)] = outcome.notifications.as_slice() else {
            panic!("expected a search result");
        };
        assert_eq!(result.track_ids, vec![first.id, second.id]);
    }

    #[test]
    fn test_same_name_artists_keep_distinct_rows() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        apply(
            &ws,
            server_id,
            &RequestKind::GetArtists,
            "<artists><index name=\"N\">\
             <artist id=\"ar-1\" name=\"Nirvana\"/>\
             <artist id=\"ar-2\" name=\"Nirvana\"/>\
             </index></artists>",
        );
        let artists = ws.artists_for_server(server_id).expect("query");
        assert_eq!(artists.len(), 2, "homonymous artists stay separate");
        assert!(ws
            .fetch_artist_by_remote_id(server_id, "ar-2")
            .expect("query")
            .is_some());
    }

    #[test]
    fn test_same_name_albums_keep_distinct_rows() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        let artist_id = ws
            .create_artist(server_id, Some("ar-1"), "Weezer", false)
            .expect("artist");
        apply(
            &ws,
            server_id,
            &RequestKind::GetArtist {
                id: "ar-1".to_string(),
            },
            "<artist id=\"ar-1\" name=\"Weezer\">\
             <album id=\"al-1\" name=\"Weezer\" year=\"1994\"/>\
             <album id=\"al-2\" name=\"Weezer\" year=\"2001\"/>\
             </artist>",
        );
        let albums = ws.albums_for_artist(artist_id).expect("query");
        assert_eq!(albums.len(), 2, "same-named albums stay separate");
        assert!(ws
            .fetch_album_by_remote_id(server_id, "al-2")
            .expect("query")
            .is_some());
    }

    #[test]
    fn test_binary_cover_links_known_album() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        let artist_id = ws
            .create_artist(server_id, Some("ar-1"), "Miles Davis", false)
            .expect("artist");
        let album_id = ws
            .create_album(artist_id, Some("al-1"), "Kind of Blue", false)
            .expect("album");
        let dir = scratch_dir();
        reconcile(
            &ws,
            server_id,
            &RequestKind::GetCoverArt {
                id: "c-1".to_string(),
                album_id: Some("al-1".to_string()),
            },
            "image/jpeg",
            b"\xff\xd8\xff\xe0",
            &dir,
        )
        .expect("binary reconcile");
        let cover = ws
            .album_cover(album_id)
            .expect("query")
            .expect("cover owned by the album");
        assert_eq!(cover.remote_id, "c-1");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_malformed_document_keeps_partial_mutations() {
        let mut store = Store::open_in_memory().expect("store");
        let ws = store.workspace().expect("workspace");
        let server_id = seeded_server(&ws);
        let body = "<subsonic-response status=\"ok\" version=\"1.16.1\"><artists>\
            <index name=\"D\"><artist id=\"ar-1\" name=\"Miles Davis\"/>\
            <artist id=\"ar-2\" name=\"Duke Ellington\"/></mismatched>";
        let result = reconcile(
            &ws,
            server_id,
            &RequestKind::GetArtists,
            "text/xml",
            body.as_bytes(),
            &scratch_dir(),
        );
        assert!(result.is_err(), "truncated document is a parse error");
        // rows parsed before the failure are still in the workspace
        assert_eq!(ws.artists_for_server(server_id).expect("query").len(), 2);
    }
}

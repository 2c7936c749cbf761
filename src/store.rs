//! Persistent object graph for synced server catalogs.
//!
//! Every entity row is ultimately owned by a server (playlists may instead be
//! local, living in a named section). Mutations happen through a [`Workspace`],
//! a transactional view over the shared graph: nothing an operation writes is
//! visible to other readers until `commit`, which is the sole
//! "operation finished" signal consumers may rely on.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use crate::error::SyncError;

pub struct Store {
    conn: Connection,
}

#[derive(Debug, Clone)]
pub struct ServerRow {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub username: String,
    pub use_token_auth: bool,
    pub api_version: Option<String>,
    pub last_indexes_ts: Option<i64>,
    pub license_valid: bool,
}

#[derive(Debug, Clone)]
pub struct ArtistRow {
    pub id: i64,
    pub server_id: i64,
    pub remote_id: Option<String>,
    pub name: String,
    pub starred_at: Option<String>,
    pub group_id: Option<i64>,
    pub is_partial: bool,
}

#[derive(Debug, Clone)]
pub struct AlbumRow {
    pub id: i64,
    pub artist_id: i64,
    pub remote_id: Option<String>,
    pub name: String,
    pub year: Option<i64>,
    pub starred_at: Option<String>,
    pub is_partial: bool,
}

/// Mutable track attributes replaced wholesale on every authoritative
/// response. Absent attributes clear the stored value.
#[derive(Debug, Clone, Default)]
pub struct TrackFields {
    pub name: String,
    pub artist_name: Option<String>,
    pub duration: Option<i64>,
    pub bitrate: Option<i64>,
    pub content_type: Option<String>,
    pub rating: Option<i64>,
    pub starred_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TrackRow {
    pub id: i64,
    pub server_id: i64,
    pub remote_id: Option<String>,
    pub name: String,
    pub artist_name: Option<String>,
    pub album_id: Option<i64>,
    pub directory_id: Option<i64>,
    pub duration: Option<i64>,
    pub bitrate: Option<i64>,
    pub content_type: Option<String>,
    pub rating: Option<i64>,
    pub starred_at: Option<String>,
    pub local_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DirectoryRow {
    pub id: i64,
    pub server_id: i64,
    pub remote_id: String,
    pub name: String,
    pub parent_id: Option<i64>,
    pub starred_at: Option<String>,
    pub is_partial: bool,
}

#[derive(Debug, Clone)]
pub struct PlaylistRow {
    pub id: i64,
    pub server_id: Option<i64>,
    pub remote_id: Option<String>,
    pub name: String,
    pub section: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PodcastRow {
    pub id: i64,
    pub server_id: i64,
    pub remote_id: String,
    pub name: String,
    pub status: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EpisodeRow {
    pub id: i64,
    pub podcast_id: i64,
    pub remote_id: String,
    pub title: String,
    pub status: Option<String>,
    pub description: Option<String>,
    pub publish_date: Option<String>,
    pub track_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CoverRow {
    pub id: i64,
    pub remote_id: String,
    pub album_id: Option<i64>,
    pub track_id: Option<i64>,
    pub image_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NowPlayingRow {
    pub id: i64,
    pub server_id: i64,
    pub username: String,
    pub minutes_ago: Option<i64>,
    pub track_id: i64,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Default on-disk location under the user data directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("subtide").join("catalog.db"))
    }

    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), SyncError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS servers (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                url TEXT NOT NULL,
                username TEXT NOT NULL,
                use_token_auth INTEGER NOT NULL DEFAULT 1,
                api_version TEXT,
                last_indexes_ts INTEGER,
                license_valid INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS groups (
                id INTEGER PRIMARY KEY,
                server_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                FOREIGN KEY(server_id) REFERENCES servers(id)
            );
            CREATE TABLE IF NOT EXISTS artists (
                id INTEGER PRIMARY KEY,
                server_id INTEGER NOT NULL,
                remote_id TEXT,
                name TEXT NOT NULL,
                starred_at TEXT,
                group_id INTEGER,
                is_partial INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY(server_id) REFERENCES servers(id),
                FOREIGN KEY(group_id) REFERENCES groups(id)
            );
            CREATE TABLE IF NOT EXISTS albums (
                id INTEGER PRIMARY KEY,
                artist_id INTEGER NOT NULL,
                remote_id TEXT,
                name TEXT NOT NULL,
                year INTEGER,
                starred_at TEXT,
                is_partial INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY(artist_id) REFERENCES artists(id)
            );
            CREATE TABLE IF NOT EXISTS directories (
                id INTEGER PRIMARY KEY,
                server_id INTEGER NOT NULL,
                remote_id TEXT NOT NULL,
                name TEXT NOT NULL,
                parent_id INTEGER,
                starred_at TEXT,
                is_partial INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY(server_id) REFERENCES servers(id),
                FOREIGN KEY(parent_id) REFERENCES directories(id)
            );
            CREATE TABLE IF NOT EXISTS tracks (
                id INTEGER PRIMARY KEY,
                server_id INTEGER NOT NULL,
                remote_id TEXT,
                name TEXT NOT NULL,
                artist_name TEXT,
                album_id INTEGER,
                directory_id INTEGER,
                duration INTEGER,
                bitrate INTEGER,
                content_type TEXT,
                rating INTEGER,
                starred_at TEXT,
                local_path TEXT,
                FOREIGN KEY(server_id) REFERENCES servers(id),
                FOREIGN KEY(album_id) REFERENCES albums(id),
                FOREIGN KEY(directory_id) REFERENCES directories(id)
            );
            CREATE TABLE IF NOT EXISTS playlists (
                id INTEGER PRIMARY KEY,
                server_id INTEGER,
                remote_id TEXT,
                name TEXT NOT NULL,
                section TEXT,
                FOREIGN KEY(server_id) REFERENCES servers(id)
            );
            CREATE TABLE IF NOT EXISTS playlist_tracks (
                playlist_id INTEGER NOT NULL,
                track_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                FOREIGN KEY(playlist_id) REFERENCES playlists(id),
                FOREIGN KEY(track_id) REFERENCES tracks(id)
            );
            CREATE TABLE IF NOT EXISTS podcasts (
                id INTEGER PRIMARY KEY,
                server_id INTEGER NOT NULL,
                remote_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT,
                description TEXT,
                FOREIGN KEY(server_id) REFERENCES servers(id)
            );
            CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY,
                podcast_id INTEGER NOT NULL,
                remote_id TEXT NOT NULL,
                title TEXT NOT NULL,
                status TEXT,
                description TEXT,
                publish_date TEXT,
                track_id INTEGER,
                FOREIGN KEY(podcast_id) REFERENCES podcasts(id),
                FOREIGN KEY(track_id) REFERENCES tracks(id)
            );
            CREATE TABLE IF NOT EXISTS covers (
                id INTEGER PRIMARY KEY,
                remote_id TEXT NOT NULL,
                album_id INTEGER,
                track_id INTEGER,
                image_path TEXT,
                FOREIGN KEY(album_id) REFERENCES albums(id),
                FOREIGN KEY(track_id) REFERENCES tracks(id)
            );
            CREATE TABLE IF NOT EXISTS now_playing (
                id INTEGER PRIMARY KEY,
                server_id INTEGER NOT NULL,
                username TEXT NOT NULL,
                minutes_ago INTEGER,
                track_id INTEGER NOT NULL,
                FOREIGN KEY(server_id) REFERENCES servers(id),
                FOREIGN KEY(track_id) REFERENCES tracks(id)
            );",
        )?;
        Ok(())
    }

    /// Opens a transactional workspace over the graph.
    pub fn workspace(&mut self) -> Result<Workspace<'_>, SyncError> {
        Ok(Workspace {
            tx: self.conn.transaction()?,
        })
    }
}

/// Transactional view over the object graph. Dropping without `commit`
/// rolls every mutation back.
pub struct Workspace<'a> {
    tx: rusqlite::Transaction<'a>,
}

fn server_from_row(row: &rusqlite::Row<'_>) -> Result<ServerRow, rusqlite::Error> {
    Ok(ServerRow {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        username: row.get(3)?,
        use_token_auth: row.get::<_, i64>(4)? != 0,
        api_version: row.get(5)?,
        last_indexes_ts: row.get(6)?,
        license_valid: row.get::<_, i64>(7)? != 0,
    })
}

fn artist_from_row(row: &rusqlite::Row<'_>) -> Result<ArtistRow, rusqlite::Error> {
    Ok(ArtistRow {
        id: row.get(0)?,
        server_id: row.get(1)?,
        remote_id: row.get(2)?,
        name: row.get(3)?,
        starred_at: row.get(4)?,
        group_id: row.get(5)?,
        is_partial: row.get::<_, i64>(6)? != 0,
    })
}

fn album_from_row(row: &rusqlite::Row<'_>) -> Result<AlbumRow, rusqlite::Error> {
    Ok(AlbumRow {
        id: row.get(0)?,
        artist_id: row.get(1)?,
        remote_id: row.get(2)?,
        name: row.get(3)?,
        year: row.get(4)?,
        starred_at: row.get(5)?,
        is_partial: row.get::<_, i64>(6)? != 0,
    })
}

fn track_from_row(row: &rusqlite::Row<'_>) -> Result<TrackRow, rusqlite::Error> {
    Ok(TrackRow {
        id: row.get(0)?,
        server_id: row.get(1)?,
        remote_id: row.get(2)?,
        name: row.get(3)?,
        artist_name: row.get(4)?,
        album_id: row.get(5)?,
        directory_id: row.get(6)?,
        duration: row.get(7)?,
        bitrate: row.get(8)?,
        content_type: row.get(9)?,
        rating: row.get(10)?,
        starred_at: row.get(11)?,
        local_path: row.get(12)?,
    })
}

fn cover_from_row(row: &rusqlite::Row<'_>) -> Result<CoverRow, rusqlite::Error> {
    Ok(CoverRow {
        id: row.get(0)?,
        remote_id: row.get(1)?,
        album_id: row.get(2)?,
        track_id: row.get(3)?,
        image_path: row.get(4)?,
    })
}

const SERVER_COLUMNS: &str =
    "id, name, url, username, use_token_auth, api_version, last_indexes_ts, license_valid";
const ARTIST_COLUMNS: &str = "id, server_id, remote_id, name, starred_at, group_id, is_partial";
const ALBUM_COLUMNS: &str = "id, artist_id, remote_id, name, year, starred_at, is_partial";
const TRACK_COLUMNS: &str = "id, server_id, remote_id, name, artist_name, album_id, directory_id, \
     duration, bitrate, content_type, rating, starred_at, local_path";
const COVER_COLUMNS: &str = "id, remote_id, album_id, track_id, image_path";

impl Workspace<'_> {
    pub fn commit(self) -> Result<(), SyncError> {
        self.tx.commit()?;
        Ok(())
    }

    // Servers

    pub fn create_server(
        &self,
        name: &str,
        url: &str,
        username: &str,
        use_token_auth: bool,
    ) -> Result<i64, SyncError> {
        self.tx.execute(
            "INSERT INTO servers (name, url, username, use_token_auth) VALUES (?1, ?2, ?3, ?4)",
            params![name, url, username, use_token_auth as i64],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn server(&self, id: i64) -> Result<Option<ServerRow>, SyncError> {
        Ok(self
            .tx
            .query_row(
                &format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = ?1"),
                params![id],
                server_from_row,
            )
            .optional()?)
    }

    pub fn set_server_api_version(&self, id: i64, version: &str) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE servers SET api_version = ?1 WHERE id = ?2",
            params![version, id],
        )?;
        Ok(())
    }

    pub fn set_server_last_indexes(&self, id: i64, timestamp: i64) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE servers SET last_indexes_ts = ?1 WHERE id = ?2",
            params![timestamp, id],
        )?;
        Ok(())
    }

    pub fn set_server_license(&self, id: i64, valid: bool) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE servers SET license_valid = ?1 WHERE id = ?2",
            params![valid as i64, id],
        )?;
        Ok(())
    }

    /// Deletes a server and everything it owns.
    pub fn delete_server(&self, id: i64) -> Result<(), SyncError> {
        self.tx.execute_batch(&format!(
            "DELETE FROM now_playing WHERE server_id = {id};
             DELETE FROM playlist_tracks WHERE playlist_id IN
                 (SELECT id FROM playlists WHERE server_id = {id});
             DELETE FROM playlists WHERE server_id = {id};
             DELETE FROM episodes WHERE podcast_id IN
                 (SELECT id FROM podcasts WHERE server_id = {id});
             DELETE FROM podcasts WHERE server_id = {id};
             DELETE FROM covers WHERE track_id IN
                 (SELECT id FROM tracks WHERE server_id = {id});
             DELETE FROM covers WHERE album_id IN
                 (SELECT albums.id FROM albums
                  JOIN artists ON albums.artist_id = artists.id
                  WHERE artists.server_id = {id});
             DELETE FROM tracks WHERE server_id = {id};
             DELETE FROM albums WHERE artist_id IN
                 (SELECT id FROM artists WHERE server_id = {id});
             DELETE FROM artists WHERE server_id = {id};
             DELETE FROM directories WHERE server_id = {id};
             DELETE FROM groups WHERE server_id = {id};
             DELETE FROM servers WHERE id = {id};"
        ))?;
        Ok(())
    }

    // Index groups

    pub fn fetch_group(&self, server_id: i64, name: &str) -> Result<Option<i64>, SyncError> {
        Ok(self
            .tx
            .query_row(
                "SELECT id FROM groups WHERE server_id = ?1 AND name = ?2",
                params![server_id, name],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn create_group(&self, server_id: i64, name: &str) -> Result<i64, SyncError> {
        self.tx.execute(
            "INSERT INTO groups (server_id, name) VALUES (?1, ?2)",
            params![server_id, name],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    // Artists

    pub fn fetch_artist_by_remote_id(
        &self,
        server_id: i64,
        remote_id: &str,
    ) -> Result<Option<ArtistRow>, SyncError> {
        Ok(self
            .tx
            .query_row(
                &format!(
                    "SELECT {ARTIST_COLUMNS} FROM artists WHERE server_id = ?1 AND remote_id = ?2"
                ),
                params![server_id, remote_id],
                artist_from_row,
            )
            .optional()?)
    }

    pub fn fetch_artist_by_name(
        &self,
        server_id: i64,
        name: &str,
    ) -> Result<Option<ArtistRow>, SyncError> {
        Ok(self
            .tx
            .query_row(
                &format!("SELECT {ARTIST_COLUMNS} FROM artists WHERE server_id = ?1 AND name = ?2"),
                params![server_id, name],
                artist_from_row,
            )
            .optional()?)
    }

    pub fn create_artist(
        &self,
        server_id: i64,
        remote_id: Option<&str>,
        name: &str,
        is_partial: bool,
    ) -> Result<i64, SyncError> {
        self.tx.execute(
            "INSERT INTO artists (server_id, remote_id, name, is_partial) VALUES (?1, ?2, ?3, ?4)",
            params![server_id, remote_id, name, is_partial as i64],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn set_artist_remote_id(&self, id: i64, remote_id: &str) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE artists SET remote_id = ?1 WHERE id = ?2",
            params![remote_id, id],
        )?;
        Ok(())
    }

    /// Full replacement of mutable artist fields from an authoritative
    /// response element.
    pub fn update_artist_fields(
        &self,
        id: i64,
        name: &str,
        starred_at: Option<&str>,
        is_partial: bool,
    ) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE artists SET name = ?1, starred_at = ?2, is_partial = ?3 WHERE id = ?4",
            params![name, starred_at, is_partial as i64, id],
        )?;
        Ok(())
    }

    pub fn set_artist_group(&self, id: i64, group_id: Option<i64>) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE artists SET group_id = ?1 WHERE id = ?2",
            params![group_id, id],
        )?;
        Ok(())
    }

    pub fn set_artist_starred(&self, id: i64, starred_at: Option<&str>) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE artists SET starred_at = ?1 WHERE id = ?2",
            params![starred_at, id],
        )?;
        Ok(())
    }

    pub fn artists_for_server(&self, server_id: i64) -> Result<Vec<ArtistRow>, SyncError> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {ARTIST_COLUMNS} FROM artists WHERE server_id = ?1 ORDER BY name"
        ))?;
        let rows = stmt.query_map(params![server_id], artist_from_row)?;
        let mut artists = Vec::new();
        for artist in rows {
            artists.push(artist?);
        }
        Ok(artists)
    }

    pub fn delete_artist(&self, id: i64) -> Result<(), SyncError> {
        let albums = self.albums_for_artist(id)?;
        for album in albums {
            self.delete_album(album.id)?;
        }
        self.tx
            .execute("DELETE FROM artists WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Reparents every album of `source_id` onto `target_id`, then deletes
    /// the source artist. Keeps artist↔album links mutually consistent.
    pub fn merge_artists(&self, source_id: i64, target_id: i64) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE albums SET artist_id = ?1 WHERE artist_id = ?2",
            params![target_id, source_id],
        )?;
        self.tx
            .execute("DELETE FROM artists WHERE id = ?1", params![source_id])?;
        Ok(())
    }

    // Albums

    pub fn fetch_album_by_remote_id(
        &self,
        server_id: i64,
        remote_id: &str,
    ) -> Result<Option<AlbumRow>, SyncError> {
        Ok(self
            .tx
            .query_row(
                &format!(
                    "SELECT {} FROM albums JOIN artists ON albums.artist_id = artists.id
                     WHERE artists.server_id = ?1 AND albums.remote_id = ?2",
                    prefixed_album_columns()
                ),
                params![server_id, remote_id],
                album_from_row,
            )
            .optional()?)
    }

    pub fn fetch_album_by_name(
        &self,
        artist_id: i64,
        name: &str,
    ) -> Result<Option<AlbumRow>, SyncError> {
        Ok(self
            .tx
            .query_row(
                &format!("SELECT {ALBUM_COLUMNS} FROM albums WHERE artist_id = ?1 AND name = ?2"),
                params![artist_id, name],
                album_from_row,
            )
            .optional()?)
    }

    pub fn create_album(
        &self,
        artist_id: i64,
        remote_id: Option<&str>,
        name: &str,
        is_partial: bool,
    ) -> Result<i64, SyncError> {
        self.tx.execute(
            "INSERT INTO albums (artist_id, remote_id, name, is_partial) VALUES (?1, ?2, ?3, ?4)",
            params![artist_id, remote_id, name, is_partial as i64],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn set_album_remote_id(&self, id: i64, remote_id: &str) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE albums SET remote_id = ?1 WHERE id = ?2",
            params![remote_id, id],
        )?;
        Ok(())
    }

    pub fn update_album_fields(
        &self,
        id: i64,
        name: &str,
        year: Option<i64>,
        starred_at: Option<&str>,
        is_partial: bool,
    ) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE albums SET name = ?1, year = ?2, starred_at = ?3, is_partial = ?4
             WHERE id = ?5",
            params![name, year, starred_at, is_partial as i64, id],
        )?;
        Ok(())
    }

    /// Moves an album under a different artist, e.g. after an artist-id
    /// correction. The inverse track links are unaffected.
    pub fn set_album_artist(&self, id: i64, artist_id: i64) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE albums SET artist_id = ?1 WHERE id = ?2",
            params![artist_id, id],
        )?;
        Ok(())
    }

    pub fn set_album_starred(&self, id: i64, starred_at: Option<&str>) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE albums SET starred_at = ?1 WHERE id = ?2",
            params![starred_at, id],
        )?;
        Ok(())
    }

    pub fn starred_albums_for_server(&self, server_id: i64) -> Result<Vec<AlbumRow>, SyncError> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {} FROM albums JOIN artists ON albums.artist_id = artists.id
             WHERE artists.server_id = ?1 AND albums.starred_at IS NOT NULL",
            prefixed_album_columns()
        ))?;
        let rows = stmt.query_map(params![server_id], album_from_row)?;
        let mut albums = Vec::new();
        for album in rows {
            albums.push(album?);
        }
        Ok(albums)
    }

    pub fn albums_for_artist(&self, artist_id: i64) -> Result<Vec<AlbumRow>, SyncError> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {ALBUM_COLUMNS} FROM albums WHERE artist_id = ?1 ORDER BY name"
        ))?;
        let rows = stmt.query_map(params![artist_id], album_from_row)?;
        let mut albums = Vec::new();
        for album in rows {
            albums.push(album?);
        }
        Ok(albums)
    }

    pub fn delete_album(&self, id: i64) -> Result<(), SyncError> {
        // covers become owner-less and are reaped by the orphan sweep
        self.tx.execute(
            "UPDATE covers SET album_id = NULL WHERE album_id = ?1",
            params![id],
        )?;
        let track_ids: Vec<i64> = {
            let mut stmt = self
                .tx
                .prepare("SELECT id FROM tracks WHERE album_id = ?1")?;
            let rows = stmt.query_map(params![id], |row| row.get(0))?;
            let mut ids = Vec::new();
            for track_id in rows {
                ids.push(track_id?);
            }
            ids
        };
        for track_id in track_ids {
            self.delete_track(track_id)?;
        }
        self.tx
            .execute("DELETE FROM albums WHERE id = ?1", params![id])?;
        Ok(())
    }

    // Tracks

    pub fn fetch_track_by_remote_id(
        &self,
        server_id: i64,
        remote_id: &str,
    ) -> Result<Option<TrackRow>, SyncError> {
        Ok(self
            .tx
            .query_row(
                &format!(
                    "SELECT {TRACK_COLUMNS} FROM tracks WHERE server_id = ?1 AND remote_id = ?2"
                ),
                params![server_id, remote_id],
                track_from_row,
            )
            .optional()?)
    }

    pub fn fetch_track_by_name(
        &self,
        server_id: i64,
        name: &str,
    ) -> Result<Option<TrackRow>, SyncError> {
        Ok(self
            .tx
            .query_row(
                &format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE server_id = ?1 AND name = ?2"),
                params![server_id, name],
                track_from_row,
            )
            .optional()?)
    }

    pub fn create_track(
        &self,
        server_id: i64,
        remote_id: Option<&str>,
        name: &str,
    ) -> Result<i64, SyncError> {
        self.tx.execute(
            "INSERT INTO tracks (server_id, remote_id, name) VALUES (?1, ?2, ?3)",
            params![server_id, remote_id, name],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn set_track_remote_id(&self, id: i64, remote_id: &str) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE tracks SET remote_id = ?1 WHERE id = ?2",
            params![remote_id, id],
        )?;
        Ok(())
    }

    pub fn update_track_fields(&self, id: i64, fields: &TrackFields) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE tracks SET name = ?1, artist_name = ?2, duration = ?3, bitrate = ?4,
                 content_type = ?5, rating = ?6, starred_at = ?7 WHERE id = ?8",
            params![
                fields.name,
                fields.artist_name,
                fields.duration,
                fields.bitrate,
                fields.content_type,
                fields.rating,
                fields.starred_at,
                id
            ],
        )?;
        Ok(())
    }

    pub fn set_track_starred(&self, id: i64, starred_at: Option<&str>) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE tracks SET starred_at = ?1 WHERE id = ?2",
            params![starred_at, id],
        )?;
        Ok(())
    }

    pub fn set_track_rating(&self, id: i64, rating: Option<i64>) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE tracks SET rating = ?1 WHERE id = ?2",
            params![rating, id],
        )?;
        Ok(())
    }

    pub fn set_track_album(&self, id: i64, album_id: i64) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE tracks SET album_id = ?1 WHERE id = ?2",
            params![album_id, id],
        )?;
        Ok(())
    }

    pub fn set_track_directory(&self, id: i64, directory_id: i64) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE tracks SET directory_id = ?1 WHERE id = ?2",
            params![directory_id, id],
        )?;
        Ok(())
    }

    pub fn set_track_local_path(&self, id: i64, path: Option<&str>) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE tracks SET local_path = ?1 WHERE id = ?2",
            params![path, id],
        )?;
        Ok(())
    }

    pub fn tracks_for_album(&self, album_id: i64) -> Result<Vec<TrackRow>, SyncError> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {TRACK_COLUMNS} FROM tracks WHERE album_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![album_id], track_from_row)?;
        let mut tracks = Vec::new();
        for track in rows {
            tracks.push(track?);
        }
        Ok(tracks)
    }

    pub fn delete_track(&self, id: i64) -> Result<(), SyncError> {
        self.tx.execute(
            "DELETE FROM playlist_tracks WHERE track_id = ?1",
            params![id],
        )?;
        self.tx.execute(
            "UPDATE covers SET track_id = NULL WHERE track_id = ?1",
            params![id],
        )?;
        self.tx.execute(
            "UPDATE episodes SET track_id = NULL WHERE track_id = ?1",
            params![id],
        )?;
        self.tx
            .execute("DELETE FROM now_playing WHERE track_id = ?1", params![id])?;
        self.tx
            .execute("DELETE FROM tracks WHERE id = ?1", params![id])?;
        Ok(())
    }

    // Directories

    pub fn fetch_directory_by_remote_id(
        &self,
        server_id: i64,
        remote_id: &str,
    ) -> Result<Option<DirectoryRow>, SyncError> {
        Ok(self
            .tx
            .query_row(
                "SELECT id, server_id, remote_id, name, parent_id, starred_at, is_partial
                 FROM directories WHERE server_id = ?1 AND remote_id = ?2",
                params![server_id, remote_id],
                |row| {
                    Ok(DirectoryRow {
                        id: row.get(0)?,
                        server_id: row.get(1)?,
                        remote_id: row.get(2)?,
                        name: row.get(3)?,
                        parent_id: row.get(4)?,
                        starred_at: row.get(5)?,
                        is_partial: row.get::<_, i64>(6)? != 0,
                    })
                },
            )
            .optional()?)
    }

    pub fn create_directory(
        &self,
        server_id: i64,
        remote_id: &str,
        name: &str,
        parent_id: Option<i64>,
        is_partial: bool,
    ) -> Result<i64, SyncError> {
        self.tx.execute(
            "INSERT INTO directories (server_id, remote_id, name, parent_id, is_partial)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![server_id, remote_id, name, parent_id, is_partial as i64],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn update_directory_fields(
        &self,
        id: i64,
        name: &str,
        parent_id: Option<i64>,
        starred_at: Option<&str>,
        is_partial: bool,
    ) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE directories SET name = ?1, parent_id = ?2, starred_at = ?3, is_partial = ?4
             WHERE id = ?5",
            params![name, parent_id, starred_at, is_partial as i64, id],
        )?;
        Ok(())
    }

    pub fn delete_directory(&self, id: i64) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE tracks SET directory_id = NULL WHERE directory_id = ?1",
            params![id],
        )?;
        self.tx.execute(
            "UPDATE directories SET parent_id = NULL WHERE parent_id = ?1",
            params![id],
        )?;
        self.tx
            .execute("DELETE FROM directories WHERE id = ?1", params![id])?;
        Ok(())
    }

    // Playlists

    pub fn fetch_playlist_by_remote_id(
        &self,
        server_id: i64,
        remote_id: &str,
    ) -> Result<Option<PlaylistRow>, SyncError> {
        Ok(self
            .tx
            .query_row(
                "SELECT id, server_id, remote_id, name, section FROM playlists
                 WHERE server_id = ?1 AND remote_id = ?2",
                params![server_id, remote_id],
                playlist_from_row,
            )
            .optional()?)
    }

    pub fn create_playlist(
        &self,
        server_id: Option<i64>,
        remote_id: Option<&str>,
        name: &str,
        section: Option<&str>,
    ) -> Result<i64, SyncError> {
        self.tx.execute(
            "INSERT INTO playlists (server_id, remote_id, name, section) VALUES (?1, ?2, ?3, ?4)",
            params![server_id, remote_id, name, section],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn rename_playlist(&self, id: i64, name: &str) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE playlists SET name = ?1 WHERE id = ?2",
            params![name, id],
        )?;
        Ok(())
    }

    pub fn playlists_for_server(&self, server_id: i64) -> Result<Vec<PlaylistRow>, SyncError> {
        let mut stmt = self.tx.prepare(
            "SELECT id, server_id, remote_id, name, section FROM playlists
             WHERE server_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![server_id], playlist_from_row)?;
        let mut playlists = Vec::new();
        for playlist in rows {
            playlists.push(playlist?);
        }
        Ok(playlists)
    }

    pub fn clear_playlist(&self, id: i64) -> Result<(), SyncError> {
        self.tx.execute(
            "DELETE FROM playlist_tracks WHERE playlist_id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn append_playlist_track(
        &self,
        playlist_id: i64,
        track_id: i64,
        position: usize,
    ) -> Result<(), SyncError> {
        self.tx.execute(
            "INSERT INTO playlist_tracks (playlist_id, track_id, position) VALUES (?1, ?2, ?3)",
            params![playlist_id, track_id, position as i64],
        )?;
        Ok(())
    }

    pub fn playlist_track_ids(&self, playlist_id: i64) -> Result<Vec<i64>, SyncError> {
        let mut stmt = self.tx.prepare(
            "SELECT track_id FROM playlist_tracks WHERE playlist_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![playlist_id], |row| row.get(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    pub fn delete_playlist(&self, id: i64) -> Result<(), SyncError> {
        self.clear_playlist(id)?;
        self.tx
            .execute("DELETE FROM playlists WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Playlists stranded mid-creation: no server, no section.
    pub fn orphan_playlists(&self) -> Result<Vec<PlaylistRow>, SyncError> {
        let mut stmt = self.tx.prepare(
            "SELECT id, server_id, remote_id, name, section FROM playlists
             WHERE server_id IS NULL AND section IS NULL",
        )?;
        let rows = stmt.query_map([], playlist_from_row)?;
        let mut playlists = Vec::new();
        for playlist in rows {
            playlists.push(playlist?);
        }
        Ok(playlists)
    }

    // Podcasts

    pub fn fetch_podcast_by_remote_id(
        &self,
        server_id: i64,
        remote_id: &str,
    ) -> Result<Option<PodcastRow>, SyncError> {
        Ok(self
            .tx
            .query_row(
                "SELECT id, server_id, remote_id, name, status, description FROM podcasts
                 WHERE server_id = ?1 AND remote_id = ?2",
                params![server_id, remote_id],
                podcast_from_row,
            )
            .optional()?)
    }

    pub fn create_podcast(
        &self,
        server_id: i64,
        remote_id: &str,
        name: &str,
    ) -> Result<i64, SyncError> {
        self.tx.execute(
            "INSERT INTO podcasts (server_id, remote_id, name) VALUES (?1, ?2, ?3)",
            params![server_id, remote_id, name],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn update_podcast_fields(
        &self,
        id: i64,
        name: &str,
        status: Option<&str>,
        description: Option<&str>,
    ) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE podcasts SET name = ?1, status = ?2, description = ?3 WHERE id = ?4",
            params![name, status, description, id],
        )?;
        Ok(())
    }

    pub fn fetch_episode_by_remote_id(
        &self,
        podcast_id: i64,
        remote_id: &str,
    ) -> Result<Option<EpisodeRow>, SyncError> {
        Ok(self
            .tx
            .query_row(
                "SELECT id, podcast_id, remote_id, title, status, description, publish_date, track_id
                 FROM episodes WHERE podcast_id = ?1 AND remote_id = ?2",
                params![podcast_id, remote_id],
                episode_from_row,
            )
            .optional()?)
    }

    pub fn create_episode(
        &self,
        podcast_id: i64,
        remote_id: &str,
        title: &str,
    ) -> Result<i64, SyncError> {
        self.tx.execute(
            "INSERT INTO episodes (podcast_id, remote_id, title) VALUES (?1, ?2, ?3)",
            params![podcast_id, remote_id, title],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn update_episode_fields(
        &self,
        id: i64,
        title: &str,
        status: Option<&str>,
        description: Option<&str>,
        publish_date: Option<&str>,
        track_id: Option<i64>,
    ) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE episodes SET title = ?1, status = ?2, description = ?3, publish_date = ?4,
                 track_id = ?5 WHERE id = ?6",
            params![title, status, description, publish_date, track_id, id],
        )?;
        Ok(())
    }

    // Covers

    pub fn fetch_cover_by_remote_id(&self, remote_id: &str) -> Result<Option<CoverRow>, SyncError> {
        Ok(self
            .tx
            .query_row(
                &format!("SELECT {COVER_COLUMNS} FROM covers WHERE remote_id = ?1"),
                params![remote_id],
                cover_from_row,
            )
            .optional()?)
    }

    pub fn create_cover(&self, remote_id: &str) -> Result<i64, SyncError> {
        self.tx.execute(
            "INSERT INTO covers (remote_id) VALUES (?1)",
            params![remote_id],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn set_cover_album(&self, id: i64, album_id: Option<i64>) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE covers SET album_id = ?1 WHERE id = ?2",
            params![album_id, id],
        )?;
        Ok(())
    }

    pub fn set_cover_track(&self, id: i64, track_id: Option<i64>) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE covers SET track_id = ?1 WHERE id = ?2",
            params![track_id, id],
        )?;
        Ok(())
    }

    pub fn set_cover_remote_id(&self, id: i64, remote_id: &str) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE covers SET remote_id = ?1 WHERE id = ?2",
            params![remote_id, id],
        )?;
        Ok(())
    }

    pub fn set_cover_path(&self, id: i64, path: Option<&str>) -> Result<(), SyncError> {
        self.tx.execute(
            "UPDATE covers SET image_path = ?1 WHERE id = ?2",
            params![path, id],
        )?;
        Ok(())
    }

    pub fn album_cover(&self, album_id: i64) -> Result<Option<CoverRow>, SyncError> {
        Ok(self
            .tx
            .query_row(
                &format!("SELECT {COVER_COLUMNS} FROM covers WHERE album_id = ?1"),
                params![album_id],
                cover_from_row,
            )
            .optional()?)
    }

    /// Covers with neither album nor track owner.
    pub fn orphan_covers(&self) -> Result<Vec<CoverRow>, SyncError> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {COVER_COLUMNS} FROM covers WHERE album_id IS NULL AND track_id IS NULL"
        ))?;
        let rows = stmt.query_map([], cover_from_row)?;
        let mut covers = Vec::new();
        for cover in rows {
            covers.push(cover?);
        }
        Ok(covers)
    }

    /// Counts cover rows whose cached image path ends with the given file
    /// name. Used as the collision safety net before deleting a file.
    pub fn covers_sharing_filename(&self, file_name: &str) -> Result<i64, SyncError> {
        Ok(self.tx.query_row(
            "SELECT COUNT(*) FROM covers WHERE image_path LIKE '%' || ?1",
            params![file_name],
            |row| row.get(0),
        )?)
    }

    pub fn delete_cover(&self, id: i64) -> Result<(), SyncError> {
        self.tx
            .execute("DELETE FROM covers WHERE id = ?1", params![id])?;
        Ok(())
    }

    // Now playing

    pub fn clear_now_playing(&self, server_id: i64) -> Result<(), SyncError> {
        self.tx.execute(
            "DELETE FROM now_playing WHERE server_id = ?1",
            params![server_id],
        )?;
        Ok(())
    }

    pub fn insert_now_playing(
        &self,
        server_id: i64,
        username: &str,
        minutes_ago: Option<i64>,
        track_id: i64,
    ) -> Result<i64, SyncError> {
        self.tx.execute(
            "INSERT INTO now_playing (server_id, username, minutes_ago, track_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![server_id, username, minutes_ago, track_id],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn now_playing_for_server(&self, server_id: i64) -> Result<Vec<NowPlayingRow>, SyncError> {
        let mut stmt = self.tx.prepare(
            "SELECT id, server_id, username, minutes_ago, track_id FROM now_playing
             WHERE server_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![server_id], |row| {
            Ok(NowPlayingRow {
                id: row.get(0)?,
                server_id: row.get(1)?,
                username: row.get(2)?,
                minutes_ago: row.get(3)?,
                track_id: row.get(4)?,
            })
        })?;
        let mut entries = Vec::new();
        for entry in rows {
            entries.push(entry?);
        }
        Ok(entries)
    }
}

fn prefixed_album_columns() -> String {
    ALBUM_COLUMNS
        .split(", ")
        .map(|column| format!("albums.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn playlist_from_row(row: &rusqlite::Row<'_>) -> Result<PlaylistRow, rusqlite::Error> {
    Ok(PlaylistRow {
        id: row.get(0)?,
        server_id: row.get(1)?,
        remote_id: row.get(2)?,
        name: row.get(3)?,
        section: row.get(4)?,
    })
}

fn podcast_from_row(row: &rusqlite::Row<'_>) -> Result<PodcastRow, rusqlite::Error> {
    Ok(PodcastRow {
        id: row.get(0)?,
        server_id: row.get(1)?,
        remote_id: row.get(2)?,
        name: row.get(3)?,
        status: row.get(4)?,
        description: row.get(5)?,
    })
}

fn episode_from_row(row: &rusqlite::Row<'_>) -> Result<EpisodeRow, rusqlite::Error> {
    Ok(EpisodeRow {
        id: row.get(0)?,
        podcast_id: row.get(1)?,
        remote_id: row.get(2)?,
        title: row.get(3)?,
        status: row.get(4)?,
        description: row.get(5)?,
        publish_date: row.get(6)?,
        track_id: row.get(7)?,
    })
}

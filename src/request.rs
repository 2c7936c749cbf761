//! Logical request kinds and their wire-level shapes.
//!
//! Each variant carries its own typed parameters; the transport resolves the
//! endpoint and parameter list here, and the reconciliation engine selects
//! behavior by matching the same tag. Unknown server behavior is negotiated
//! through the optional `Feature` each kind maps to.

use crate::capabilities::Feature;

/// Sort flavor for album list requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlbumListFlavor {
    Random,
    Newest,
    Frequent,
    Highest,
    Recent,
    Starred,
}

impl AlbumListFlavor {
    fn wire_value(self) -> &'static str {
        match self {
            AlbumListFlavor::Random => "random",
            AlbumListFlavor::Newest => "newest",
            AlbumListFlavor::Frequent => "frequent",
            AlbumListFlavor::Highest => "highest",
            AlbumListFlavor::Recent => "recent",
            AlbumListFlavor::Starred => "starred",
        }
    }
}

/// One logical operation against a server.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    Ping,
    GetLicense,
    GetArtists,
    GetArtist {
        id: String,
    },
    GetAlbum {
        id: String,
    },
    GetTrack {
        id: String,
    },
    GetCoverArt {
        id: String,
        album_id: Option<String>,
    },
    GetAlbumList {
        flavor: AlbumListFlavor,
    },
    GetDirectories,
    GetDirectory {
        id: String,
    },
    GetPlaylists,
    GetPlaylist {
        id: String,
    },
    CreatePlaylist {
        name: String,
        track_ids: Vec<String>,
    },
    /// Wholesale replacement reuses `createPlaylist` with an existing id,
    /// which every server understands.
    ReplacePlaylist {
        id: String,
        track_ids: Vec<String>,
    },
    UpdatePlaylist {
        id: String,
        name: Option<String>,
        comment: Option<String>,
        public: Option<bool>,
        appending: Vec<String>,
        removing: Vec<usize>,
    },
    DeletePlaylist {
        id: String,
    },
    GetPodcasts,
    GetNowPlaying,
    Search {
        query: String,
    },
    SetRating {
        id: String,
        rating: u8,
    },
    Scrobble {
        id: String,
        time_ms: i64,
    },
    Star {
        track_ids: Vec<String>,
        album_ids: Vec<String>,
        artist_ids: Vec<String>,
    },
    Unstar {
        track_ids: Vec<String>,
        album_ids: Vec<String>,
        artist_ids: Vec<String>,
    },
    ScanLibrary,
    GetScanStatus,
}

impl RequestKind {
    /// Endpoint name, dispatched as `rest/{endpoint}.view`.
    pub fn endpoint(&self) -> &'static str {
        match self {
            RequestKind::Ping => "ping",
            RequestKind::GetLicense => "getLicense",
            RequestKind::GetArtists => "getArtists",
            RequestKind::GetArtist { .. } => "getArtist",
            RequestKind::GetAlbum { .. } => "getAlbum",
            RequestKind::GetTrack { .. } => "getSong",
            RequestKind::GetCoverArt { .. } => "getCoverArt",
            RequestKind::GetAlbumList { .. } => "getAlbumList2",
            RequestKind::GetDirectories => "getIndexes",
            RequestKind::GetDirectory { .. } => "getMusicDirectory",
            RequestKind::GetPlaylists => "getPlaylists",
            RequestKind::GetPlaylist { .. } => "getPlaylist",
            RequestKind::CreatePlaylist { .. } | RequestKind::ReplacePlaylist { .. } => {
                "createPlaylist"
            }
            RequestKind::UpdatePlaylist { .. } => "updatePlaylist",
            RequestKind::DeletePlaylist { .. } => "deletePlaylist",
            RequestKind::GetPodcasts => "getPodcasts",
            RequestKind::GetNowPlaying => "getNowPlaying",
            RequestKind::Search { .. } => "search3",
            RequestKind::SetRating { .. } => "setRating",
            RequestKind::Scrobble { .. } => "scrobble",
            RequestKind::Star { .. } => "star",
            RequestKind::Unstar { .. } => "unstar",
            RequestKind::ScanLibrary => "startScan",
            RequestKind::GetScanStatus => "getScanStatus",
        }
    }

    /// Kind-specific parameters, excluding the authenticated base set.
    /// Repeated keys are deliberate; the protocol uses them for id lists.
    pub fn parameters(&self) -> Vec<(String, String)> {
        fn ids(key: &str, values: &[String]) -> Vec<(String, String)> {
            values
                .iter()
                .map(|value| (key.to_string(), value.clone()))
                .collect()
        }

        match self {
            RequestKind::Ping
            | RequestKind::GetLicense
            | RequestKind::GetArtists
            | RequestKind::GetDirectories
            | RequestKind::GetPlaylists
            | RequestKind::GetPodcasts
            | RequestKind::GetNowPlaying
            | RequestKind::ScanLibrary
            | RequestKind::GetScanStatus => Vec::new(),
            RequestKind::GetArtist { id }
            | RequestKind::GetAlbum { id }
            | RequestKind::GetTrack { id }
            | RequestKind::GetDirectory { id }
            | RequestKind::GetPlaylist { id }
            | RequestKind::DeletePlaylist { id }
            | RequestKind::GetCoverArt { id, .. } => vec![("id".to_string(), id.clone())],
            RequestKind::GetAlbumList { flavor } => {
                vec![("type".to_string(), flavor.wire_value().to_string())]
            }
            RequestKind::CreatePlaylist { name, track_ids } => {
                let mut parameters = vec![("name".to_string(), name.clone())];
                parameters.extend(ids("songId", track_ids));
                parameters
            }
            RequestKind::ReplacePlaylist { id, track_ids } => {
                let mut parameters = vec![("playlistId".to_string(), id.clone())];
                parameters.extend(ids("songId", track_ids));
                parameters
            }
            RequestKind::UpdatePlaylist {
                id,
                name,
                comment,
                public,
                appending,
                removing,
            } => {
                let mut parameters = vec![("playlistId".to_string(), id.clone())];
                if let Some(name) = name {
                    parameters.push(("name".to_string(), name.clone()));
                }
                if let Some(comment) = comment {
                    parameters.push(("comment".to_string(), comment.clone()));
                }
                if let Some(public) = public {
                    parameters.push(("public".to_string(), public.to_string()));
                }
                parameters.extend(ids("songIdToAdd", appending));
                parameters.extend(
                    removing
                        .iter()
                        .map(|index| ("songIndexToRemove".to_string(), index.to_string())),
                );
                parameters
            }
            RequestKind::Search { query } => vec![
                ("query".to_string(), query.clone()),
                // XXX: Configurable? Pagination?
                ("songCount".to_string(), "100".to_string()),
            ],
            RequestKind::SetRating { id, rating } => vec![
                ("rating".to_string(), rating.to_string()),
                ("id".to_string(), id.clone()),
            ],
            RequestKind::Scrobble { id, time_ms } => vec![
                ("id".to_string(), id.clone()),
                ("time".to_string(), time_ms.to_string()),
            ],
            RequestKind::Star {
                track_ids,
                album_ids,
                artist_ids,
            }
            | RequestKind::Unstar {
                track_ids,
                album_ids,
                artist_ids,
            } => {
                let mut parameters = ids("id", track_ids);
                parameters.extend(ids("albumId", album_ids));
                parameters.extend(ids("artistId", artist_ids));
                parameters
            }
        }
    }

    /// Feature this kind is gated on, if the server may legitimately lack it.
    pub fn feature(&self) -> Option<Feature> {
        match self {
            RequestKind::Ping | RequestKind::GetLicense => None,
            RequestKind::GetArtists
            | RequestKind::GetArtist { .. }
            | RequestKind::GetAlbum { .. }
            | RequestKind::GetTrack { .. }
            | RequestKind::GetDirectories
            | RequestKind::GetDirectory { .. } => Some(Feature::Library),
            RequestKind::GetCoverArt { .. } => Some(Feature::CoverArt),
            RequestKind::GetAlbumList { .. } => Some(Feature::AlbumList),
            RequestKind::GetPlaylists
            | RequestKind::GetPlaylist { .. }
            | RequestKind::CreatePlaylist { .. }
            | RequestKind::ReplacePlaylist { .. }
            | RequestKind::UpdatePlaylist { .. }
            | RequestKind::DeletePlaylist { .. } => Some(Feature::Playlists),
            RequestKind::GetPodcasts => Some(Feature::Podcasts),
            RequestKind::GetNowPlaying => Some(Feature::NowPlaying),
            RequestKind::Search { .. } => Some(Feature::Search),
            RequestKind::SetRating { .. } => Some(Feature::Rating),
            RequestKind::Scrobble { .. } => Some(Feature::Scrobble),
            RequestKind::Star { .. } | RequestKind::Unstar { .. } => Some(Feature::Star),
            RequestKind::ScanLibrary | RequestKind::GetScanStatus => Some(Feature::Scan),
        }
    }

    /// Short action label used in logs and failure notifications.
    pub fn action_name(&self) -> &'static str {
        self.endpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::{AlbumListFlavor, RequestKind};
    use crate::capabilities::Feature;

    #[test]
    fn test_endpoints_resolve() {
        assert_eq!(RequestKind::Ping.endpoint(), "ping");
        assert_eq!(
            RequestKind::GetTrack {
                id: "t-1".to_string()
            }
            .endpoint(),
            "getSong"
        );
        assert_eq!(RequestKind::GetDirectories.endpoint(), "getIndexes");
        // replace rides on createPlaylist, not updatePlaylist
        assert_eq!(
            RequestKind::ReplacePlaylist {
                id: "pl-1".to_string(),
                track_ids: vec![],
            }
            .endpoint(),
            "createPlaylist"
        );
    }

    #[test]
    fn test_album_list_parameters_carry_flavor() {
        let kind = RequestKind::GetAlbumList {
            flavor: AlbumListFlavor::Newest,
        };
        assert_eq!(
            kind.parameters(),
            vec![("type".to_string(), "newest".to_string())]
        );
    }

    #[test]
    fn test_star_parameters_repeat_id_keys() {
        let kind = RequestKind::Star {
            track_ids: vec!["t-1".to_string(), "t-2".to_string()],
            album_ids: vec!["al-9".to_string()],
            artist_ids: vec![],
        };
        let parameters = kind.parameters();
        let id_values: Vec<&str> = parameters
            .iter()
            .filter(|(key, _)| key == "id")
            .map(|(_, value)| value.as_str())
            .collect();
        assert_eq!(id_values, vec!["t-1", "t-2"]);
        assert!(parameters
            .iter()
            .any(|(key, value)| key == "albumId" && value == "al-9"));
    }

    #[test]
    fn test_update_playlist_parameters() {
        let kind = RequestKind::UpdatePlaylist {
            id: "pl-1".to_string(),
            name: Some("Evening".to_string()),
            comment: None,
            public: Some(false),
            appending: vec!["t-5".to_string()],
            removing: vec![0, 2],
        };
        let parameters = kind.parameters();
        assert!(parameters
            .iter()
            .any(|(key, value)| key == "playlistId" && value == "pl-1"));
        assert!(parameters
            .iter()
            .any(|(key, value)| key == "public" && value == "false"));
        let removals: Vec<&str> = parameters
            .iter()
            .filter(|(key, _)| key == "songIndexToRemove")
            .map(|(_, value)| value.as_str())
            .collect();
        assert_eq!(removals, vec!["0", "2"]);
    }

    #[test]
    fn test_feature_mapping() {
        assert_eq!(RequestKind::Ping.feature(), None);
        assert_eq!(RequestKind::GetPodcasts.feature(), Some(Feature::Podcasts));
        assert_eq!(
            RequestKind::GetNowPlaying.feature(),
            Some(Feature::NowPlaying)
        );
        assert_eq!(RequestKind::GetScanStatus.feature(), Some(Feature::Scan));
    }
}

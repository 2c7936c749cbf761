//! Per-server feature capability tracking.
//!
//! Servers in the wild disagree about optional endpoints: some answer
//! podcasts or now-playing with 404/501, others reject form POSTs entirely.
//! This map records what a given server refused for the lifetime of the
//! process so the engine stops asking. Nothing here is persisted; it is
//! cheap to rediscover after restart.

use std::collections::HashSet;
use std::sync::Mutex;

/// Optional server features subject to runtime negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    NowPlaying,
    Podcasts,
    Playlists,
    Search,
    AlbumList,
    Scan,
    Rating,
    Scrobble,
    Star,
    CoverArt,
    Library,
}

#[derive(Default)]
struct CapabilityState {
    unsupported: HashSet<(i64, Feature)>,
    form_post: HashSet<i64>,
}

/// Process-lifetime capability flags, shared between the request queue and
/// anything that wants to pre-filter submissions.
///
/// All access goes through this mutex; the serialized request queue is not
/// relied on for correctness here.
#[derive(Default)]
pub struct CapabilityMap {
    state: Mutex<CapabilityState>,
}

impl CapabilityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a feature as unsupported for a server. Returns `true` only on
    /// the first transition so callers can log the discovery once.
    pub fn mark_unsupported(&self, server_id: i64, feature: Feature) -> bool {
        let mut state = self.state.lock().expect("capability map lock poisoned");
        state.unsupported.insert((server_id, feature))
    }

    pub fn is_supported(&self, server_id: i64, feature: Feature) -> bool {
        let state = self.state.lock().expect("capability map lock poisoned");
        !state.unsupported.contains(&(server_id, feature))
    }

    /// Flips the negotiated form-POST transport mode for a server.
    pub fn set_form_post(&self, server_id: i64, supported: bool) {
        let mut state = self.state.lock().expect("capability map lock poisoned");
        if supported {
            state.form_post.insert(server_id);
        } else {
            state.form_post.remove(&server_id);
        }
    }

    pub fn uses_form_post(&self, server_id: i64) -> bool {
        let state = self.state.lock().expect("capability map lock poisoned");
        state.form_post.contains(&server_id)
    }
}

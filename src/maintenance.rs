//! Idempotent cleanup sweeps over the whole object graph.
//!
//! Interrupted operations can strand rows: a playlist created locally but
//! never attached to a server or section, or a cover whose owning album and
//! track were both deleted. The sweeps remove them. Cached cover files are
//! only deleted when no other cover row references the same file name, since
//! two servers can hand out colliding cover ids.

use std::fs;
use std::path::Path;

use log::{info, warn};

use crate::error::SyncError;
use crate::store::Workspace;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub playlists_removed: usize,
    pub covers_removed: usize,
}

pub fn run_sweeps(ws: &Workspace<'_>) -> Result<SweepReport, SyncError> {
    let report = SweepReport {
        playlists_removed: sweep_orphan_playlists(ws)?,
        covers_removed: sweep_orphan_covers(ws)?,
    };
    if report != SweepReport::default() {
        info!(
            "Maintenance removed {} orphan playlist(s) and {} orphan cover(s)",
            report.playlists_removed, report.covers_removed
        );
    }
    Ok(report)
}

/// Playlists with neither a server nor a local section are unreachable.
fn sweep_orphan_playlists(ws: &Workspace<'_>) -> Result<usize, SyncError> {
    let orphans = ws.orphan_playlists()?;
    for playlist in &orphans {
        ws.delete_playlist(playlist.id)?;
    }
    Ok(orphans.len())
}

/// Covers with neither an album nor a track owner. The row always goes; the
/// backing file goes only when this row was its last reference.
fn sweep_orphan_covers(ws: &Workspace<'_>) -> Result<usize, SyncError> {
    let orphans = ws.orphan_covers()?;
    for cover in &orphans {
        if let Some(path) = cover.image_path.as_deref() {
            if let Some(file_name) = Path::new(path).file_name().and_then(|name| name.to_str()) {
                if ws.covers_sharing_filename(file_name)? <= 1 {
                    if let Err(err) = fs::remove_file(path) {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            warn!("Could not remove cached cover {path}: {err}");
                        }
                    }
                }
            }
        }
        ws.delete_cover(cover.id)?;
    }
    Ok(orphans.len())
}

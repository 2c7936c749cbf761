//! On-disk cover image cache.
//!
//! Cover art bytes are written once per remote cover id under a per-server
//! directory; the store keeps the resulting path. A fetch is only worth
//! issuing when no cached file exists, which is what keeps repeated album
//! listings from re-downloading the same art.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::SyncError;

/// Directory holding cached covers for one server, under the cache root.
pub fn covers_dir(cache_root: &Path, server_name: &str) -> PathBuf {
    cache_root.join(sanitize_component(server_name)).join("covers")
}

/// Default cache root under the user cache directory.
pub fn default_cache_root() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("subtide"))
}

fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            other => other,
        })
        .collect()
}

/// Picks a file extension from the reported MIME type, falling back to
/// content sniffing for servers that answer `application/octet-stream`.
fn extension_for(mime: &str, bytes: &[u8]) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        _ => match image::guess_format(bytes) {
            Ok(image::ImageFormat::Png) => "png",
            Ok(image::ImageFormat::Gif) => "gif",
            Ok(image::ImageFormat::WebP) => "webp",
            Ok(image::ImageFormat::Bmp) => "bmp",
            Ok(image::ImageFormat::Jpeg) => "jpg",
            Ok(_) | Err(_) => {
                warn!("Unrecognized cover format ({mime}), defaulting to jpg");
                "jpg"
            }
        },
    }
}

/// Writes cover bytes into the cache and returns the file path.
pub fn import_cover(
    dir: &Path,
    remote_id: &str,
    mime: &str,
    bytes: &[u8],
) -> Result<PathBuf, SyncError> {
    fs::create_dir_all(dir)?;
    let file_name = format!(
        "{}.{}",
        sanitize_component(remote_id),
        extension_for(mime, bytes)
    );
    let path = dir.join(file_name);
    fs::write(&path, bytes)?;
    Ok(path)
}

/// Whether a cover still needs its image fetched: no recorded path, or the
/// recorded file vanished from disk.
pub fn needs_fetch(image_path: Option<&str>) -> bool {
    match image_path {
        Some(path) => !Path::new(path).exists(),
        None => true,
    }
}

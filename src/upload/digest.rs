//! Streaming content digest and file metadata for upload authorization.
//!
//! The authorization step identifies a file to the server by its MD5
//! digest, size, modification time and content type. The digest is
//! computed over fixed-size chunks so large attachments never sit in
//! memory twice.

use std::path::Path;
use std::time::UNIX_EPOCH;

use md5::{Digest, Md5};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::Error;

/// Chunk size for the streaming digest read.
const DIGEST_CHUNK_BYTES: usize = 8192;

/// Everything the authorization form needs to describe one file.
#[derive(Debug, Clone)]
pub struct FileMeta {
    /// Base name of the file, as the server should record it.
    pub filename: String,
    /// Size in bytes at inspection time.
    pub size: u64,
    /// Modification time in milliseconds since the epoch.
    pub mtime_ms: u64,
    /// Content type guessed from the file extension.
    pub content_type: &'static str,
    /// Lowercase hex MD5 of the file content.
    pub md5: String,
}

/// Inspects a file for upload authorization.
///
/// # Errors
///
/// Returns [`Error::Io`] when the file cannot be opened or read.
pub async fn inspect(path: &Path) -> Result<FileMeta, Error> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| Error::io(path, e))?;
    let mtime_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(FileMeta {
        filename,
        size: metadata.len(),
        mtime_ms,
        content_type: content_type_for(path),
        md5: md5_hex(path).await?,
    })
}

/// Computes the lowercase hex MD5 of a file in streaming chunks.
///
/// # Errors
///
/// Returns [`Error::Io`] when the file cannot be opened or read.
pub async fn md5_hex(path: &Path) -> Result<String, Error> {
    let mut file = File::open(path).await.map_err(|e| Error::io(path, e))?;
    let mut hasher = Md5::new();
    let mut chunk = [0u8; DIGEST_CHUNK_BYTES];
    loop {
        let n = file
            .read(&mut chunk)
            .await
            .map_err(|e| Error::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Guesses a content type from the file extension.
///
/// Only the document and image types the reference service commonly
/// stores are mapped; everything else is an octet stream.
#[must_use]
pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("pdf") => "application/pdf",
        Some("doc") => "application/msword",
        Some("rtf") => "application/rtf",
        Some("txt") => "text/plain",
        Some("htm" | "html") => "text/html",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("tif" | "tiff") => "image/tiff",
        Some("ps") => "application/postscript",
        Some("tex") => "application/x-tex",
        Some("epub") => "application/epub+zip",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

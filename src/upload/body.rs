//! Zero-copy assembly of the binary upload body.
//!
//! The storage endpoint expects `prefix ++ file-content ++ suffix`, where
//! the prefix and suffix carry the multipart boundary framing issued by
//! the upload authorization. [`UploadBody`] assembles that into a single
//! exactly-sized buffer, writing each segment directly into its final
//! offset range so the file content is copied once. Construction performs
//! no I/O; a body that is never read (the authorization reported the file
//! already exists) costs nothing.
//!
//! A body is owned by the upload call that created it and is never reused
//! across retries: a retry builds a fresh value, since the file may have
//! changed underneath and the old handle is gone.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::Error;

/// Lazily-built `prefix ++ file ++ suffix` byte buffer.
#[derive(Debug)]
pub struct UploadBody {
    prefix: Vec<u8>,
    path: PathBuf,
    suffix: Vec<u8>,
    buffer: Option<Bytes>,
}

impl UploadBody {
    /// Describes a body without touching the filesystem.
    #[must_use]
    pub fn new(prefix: Vec<u8>, path: impl Into<PathBuf>, suffix: Vec<u8>) -> Self {
        Self {
            prefix,
            path: path.into(),
            suffix,
            buffer: None,
        }
    }

    /// Whether the buffer has been realized yet.
    #[must_use]
    pub fn is_realized(&self) -> bool {
        self.buffer.is_some()
    }

    /// Returns the assembled buffer, building it on first call.
    ///
    /// Subsequent calls return the cached buffer; the returned [`Bytes`]
    /// is a refcounted handle, so repeated reads never copy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the file cannot be opened or read, and
    /// [`Error::SizeMismatch`] when the file's size at read time differs
    /// from the size measured at the start of the build.
    pub async fn read(&mut self) -> Result<Bytes, Error> {
        if let Some(buffer) = &self.buffer {
            return Ok(buffer.clone());
        }
        let measured = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| Error::io(&self.path, e))?
            .len();
        let buffer = self.assemble(measured).await?;
        self.buffer = Some(buffer.clone());
        Ok(buffer)
    }

    /// Builds the buffer for a file measured at `declared_size` bytes.
    ///
    /// Allocates the exact total once, copies the prefix into the head
    /// range, streams the file directly into the middle range, verifies
    /// the file was consumed exactly, then copies the suffix into the
    /// tail range. The file handle never outlives this call.
    async fn assemble(&self, declared_size: u64) -> Result<Bytes, Error> {
        let size = usize::try_from(declared_size).map_err(|_| {
            Error::io(
                &self.path,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "file too large for in-memory assembly",
                ),
            )
        })?;
        let total = self.prefix.len() + size + self.suffix.len();
        let mut buffer = vec![0u8; total];
        buffer[..self.prefix.len()].copy_from_slice(&self.prefix);

        {
            let mut file = File::open(&self.path)
                .await
                .map_err(|e| Error::io(&self.path, e))?;
            let middle = &mut buffer[self.prefix.len()..self.prefix.len() + size];
            let read = fill_from(&mut file, middle, &self.path).await?;
            if read < size {
                return Err(Error::size_mismatch(&self.path, declared_size, read as u64));
            }
            // the file must be exactly consumed; a readable byte past the
            // measured size means it grew and the framing would be wrong
            let mut probe = [0u8; 1];
            let extra = file
                .read(&mut probe)
                .await
                .map_err(|e| Error::io(&self.path, e))?;
            if extra != 0 {
                return Err(Error::size_mismatch(
                    &self.path,
                    declared_size,
                    declared_size + 1,
                ));
            }
            // handle released here, before the buffer is handed off
        }

        buffer[self.prefix.len() + size..].copy_from_slice(&self.suffix);
        debug!(
            path = %self.path.display(),
            total_bytes = total,
            "upload body assembled"
        );
        Ok(Bytes::from(buffer))
    }
}

/// Reads from `file` until `slice` is full or EOF, returning bytes read.
async fn fill_from(file: &mut File, slice: &mut [u8], path: &Path) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < slice.len() {
        let n = file
            .read(&mut slice[filled..])
            .await
            .map_err(|e| Error::io(path, e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

//! Crash-safe download publishing.
//!
//! A download is written to a sibling temporary file (`<destination>.tmp`) and moved into place
//! only once the transfer succeeded. On failure the temporary file is removed and the destination
//! is left absent.
//!
//! Layout:
//! - Destination: `<dir>/<name>`
//! - Temporary:   `<dir>/<name>.tmp`
//!
//! Notes:
//! - Temporary names are derived from the destination, so downloads to different destinations
//!   never collide. Two concurrent downloads to the *same* destination race on the file system;
//!   avoiding that is the caller's responsibility.
//! - [`AtomicFileWriter::finalize`] performs blocking file I/O and touches no shared state, so it
//!   may run on a blocking thread (see [`AtomicFileWriter::finalize_async`]).

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{trace, warn};

use crate::error::{RequestError, RequestResult, SetupError, WrapIoResult};
use crate::target::Target;

/// Suffix appended to the destination path to form the temporary path.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Governs one destination file path.
#[derive(Debug, Clone)]
pub struct AtomicFileWriter {
    destination: PathBuf,
    temp: PathBuf,
}

impl AtomicFileWriter {
    /// Validate `destination` and get ready to download into it.
    ///
    /// Fails if the path is empty, resolves to a remote or virtual location, or its parent
    /// directory does not exist. On success any file already at `destination` is deleted.
    pub fn prepare(destination: impl AsRef<Path>) -> RequestResult<Self> {
        let raw = destination.as_ref();
        if raw.as_os_str().is_empty() {
            return Err(SetupError::EmptyPath.into());
        }

        let destination = match Target::parse(&raw.to_string_lossy()) {
            Ok(Target::Local(path)) => path,
            Ok(_) => return Err(SetupError::NotLocal(raw.display().to_string()).into()),
            Err(e) => return Err(e),
        };

        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                return Err(RequestError::missing_directory(parent));
            }
        }

        match fs::remove_file(&destination) {
            Ok(()) => trace!(
                "atomic: removed existing destination path='{}'",
                destination.display()
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(RequestError::fs("error removing existing destination", e)),
        }

        let temp = temp_path_for(&destination);
        Ok(Self { destination, temp })
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Path the transfer should write into.
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Publish or discard the temporary file.
    ///
    /// - temp present, `incoming` is an error: delete temp, return `incoming` unchanged.
    /// - temp present, no error: replace the destination with the temp file.
    /// - temp absent: return `incoming` unchanged.
    ///
    /// The temporary file never survives this call.
    pub fn finalize(&self, incoming: Option<RequestError>) -> RequestResult<()> {
        if !self.temp.exists() {
            return incoming.map_or(Ok(()), Err);
        }

        if let Some(err) = incoming {
            self.remove_temp();
            return Err(err);
        }

        let published = self.publish();
        if published.is_err() {
            self.remove_temp();
        }
        published
    }

    /// Run [`finalize`](Self::finalize) on tokio's blocking pool.
    pub async fn finalize_async(self, incoming: Option<RequestError>) -> RequestResult<()> {
        tokio::task::spawn_blocking(move || self.finalize(incoming))
            .await
            .map_err(|e| RequestError::fs("finalize task failed", io::Error::other(e)))?
    }

    fn publish(&self) -> RequestResult<()> {
        match fs::remove_file(&self.destination) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(RequestError::fs("error removing existing destination", e)),
        }

        fs::rename(&self.temp, &self.destination).wrap_err("error publishing download")?;

        trace!(
            "atomic: publish OK temp='{}' destination='{}'",
            self.temp.display(),
            self.destination.display()
        );
        Ok(())
    }

    fn remove_temp(&self) {
        match fs::remove_file(&self.temp) {
            Ok(()) => trace!("atomic: removed temp path='{}'", self.temp.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "atomic: temp cleanup FAIL path='{}': {}",
                self.temp.display(),
                e
            ),
        }
    }
}

fn temp_path_for(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

//! Download payload handlers.
//!
//! A handler receives the response bytes of one request and turns them into a payload once the
//! transfer succeeded. Handlers that can serve partial results before the transfer finished
//! expose that through [`StreamCapable`]; everything else is treated as a plain buffer.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::atomic::AtomicFileWriter;
use crate::error::{RequestError, RequestResult, WrapIoResult};

/// Optional capability of payload handlers that can be consumed before the transfer completes.
pub trait StreamCapable {
    /// Partial results can be consumed.
    fn is_stream_ready(&self) -> bool;

    /// Everything delivered so far has been processed; the request may finalize.
    fn is_stream_complete(&self) -> bool;
}

/// Receives response bytes and produces the request payload.
pub trait DownloadHandler: Send + 'static {
    type Payload: Send + 'static;

    /// Called once when the transport learns the expected response length.
    fn on_content_length(&mut self, _len: u64) {}

    /// Consume newly arrived bytes.
    fn receive(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Called once when the transport reports the transfer finished.
    fn on_transport_done(&mut self) {}

    /// The streaming capability of this handler, if it has one.
    fn stream(&self) -> Option<&dyn StreamCapable> {
        None
    }

    /// Body received so far, used to annotate transport errors.
    fn error_body(&self) -> Option<&[u8]> {
        None
    }

    /// Produce the payload after a successful transfer.
    fn finish(&mut self) -> RequestResult<Self::Payload>;

    /// Release resources after a failed or cancelled transfer.
    fn discard(&mut self, _error: &RequestError) {}
}

/// Collects the response body in memory.
#[derive(Debug, Default)]
pub struct BufferHandler {
    buf: BytesMut,
}

impl BufferHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DownloadHandler for BufferHandler {
    type Payload = Bytes;

    fn on_content_length(&mut self, len: u64) {
        self.buf.reserve(usize::try_from(len).unwrap_or(0).min(16 * 1024 * 1024));
    }

    fn receive(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    fn error_body(&self) -> Option<&[u8]> {
        Some(self.buf.as_ref())
    }

    fn finish(&mut self) -> RequestResult<Bytes> {
        Ok(std::mem::take(&mut self.buf).freeze())
    }

    fn discard(&mut self, _error: &RequestError) {
        self.buf = BytesMut::new();
    }
}

/// Drops every byte. Used for HEAD requests and existence probes.
#[derive(Debug, Default)]
pub struct DiscardHandler {
    received: u64,
}

impl DownloadHandler for DiscardHandler {
    type Payload = u64;

    fn receive(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.received += chunk.len() as u64;
        Ok(())
    }

    /// Number of bytes that were discarded.
    fn finish(&mut self) -> RequestResult<u64> {
        Ok(self.received)
    }
}

// ----------------------------
// Temporary download file
// ----------------------------

/// The open temporary file of one download.
///
/// Dropped before it was settled (published, discarded, or handed off), it removes the
/// temporary file, so abandoned requests leave nothing behind.
#[derive(Debug)]
struct TempFile {
    writer: AtomicFileWriter,
    file: Option<BufWriter<File>>,
    settled: bool,
}

impl TempFile {
    fn new(writer: AtomicFileWriter) -> Self {
        Self {
            writer,
            file: None,
            settled: false,
        }
    }

    fn open(&mut self) -> io::Result<&mut BufWriter<File>> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(self.writer.temp_path())?;
                trace!(
                    "download: temp open path='{}'",
                    self.writer.temp_path().display()
                );
                BufWriter::new(file)
            }
        };
        Ok(self.file.insert(file))
    }

    fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }

    /// Flush and close the complete temp file. An empty body still yields an (empty) file.
    /// On failure the temp file is removed.
    fn seal(&mut self) -> RequestResult<()> {
        let opened = self.open().map(|_| ()).wrap_err("error creating temp file");
        let sealed = opened.and_then(|()| self.close().wrap_err("error flushing temp file"));
        if let Err(e) = &sealed {
            self.discard(e);
        }
        sealed
    }

    fn discard(&mut self, error: &RequestError) {
        self.settled = true;
        // Flush errors are irrelevant: the temp file is deleted right after.
        let _ = self.close();
        let _ = self.writer.finalize(Some(error.clone()));
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.settled {
            debug!(
                "download: abandoned, removing temp path='{}'",
                self.writer.temp_path().display()
            );
            self.discard(&RequestError::Cancelled);
        }
    }
}

/// Streams the response into the temporary file of an [`AtomicFileWriter`] and publishes it on
/// success.
///
/// Publishing happens inside the tick that finalizes the request, with blocking file I/O. Use
/// [`StagedFileHandler`] to publish off the calling thread instead.
#[derive(Debug)]
pub struct FileHandler {
    temp: TempFile,
}

impl FileHandler {
    pub fn new(writer: AtomicFileWriter) -> Self {
        Self {
            temp: TempFile::new(writer),
        }
    }

    pub fn writer(&self) -> &AtomicFileWriter {
        &self.temp.writer
    }
}

impl DownloadHandler for FileHandler {
    type Payload = PathBuf;

    fn receive(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.temp.open()?.write_all(chunk)
    }

    fn finish(&mut self) -> RequestResult<PathBuf> {
        self.temp.seal()?;
        self.temp.settled = true;
        self.temp.writer.finalize(None)?;
        Ok(self.temp.writer.destination().to_path_buf())
    }

    fn discard(&mut self, error: &RequestError) {
        self.temp.discard(error);
    }
}

/// Like [`FileHandler`], but stops short of publishing: the payload is the writer governing the
/// complete temporary file, to be published with [`AtomicFileWriter::finalize_async`].
#[derive(Debug)]
pub struct StagedFileHandler {
    temp: TempFile,
}

impl StagedFileHandler {
    pub fn new(writer: AtomicFileWriter) -> Self {
        Self {
            temp: TempFile::new(writer),
        }
    }
}

impl DownloadHandler for StagedFileHandler {
    type Payload = AtomicFileWriter;

    fn receive(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.temp.open()?.write_all(chunk)
    }

    fn finish(&mut self) -> RequestResult<AtomicFileWriter> {
        self.temp.seal()?;
        self.temp.settled = true;
        Ok(self.temp.writer.clone())
    }

    fn discard(&mut self, error: &RequestError) {
        self.temp.discard(error);
    }
}

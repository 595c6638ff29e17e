//! Tar encoding of archive entries.
//!
//! Produces the portable ustar stream the runtime's copy API expects: one header
//! per entry carrying path, mode, size, and the regular-file/directory type flag.
//!
//! Encoding runs on a blocking thread and hands the body to the runtime in
//! [`CHUNK_SIZE`] pieces through a channel holding at most [`CHUNK_QUEUE_DEPTH`]
//! of them. A tree of any size keeps only those chunks and one open host file
//! in memory.

use bytes::{Bytes, BytesMut};
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::archive::{ArchiveEntry, EntryKind};
use super::context::CopyContext;
use super::{InjectError, Result};

/// Size of the chunks handed to the runtime.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the encoder and the runtime.
pub const CHUNK_QUEUE_DEPTH: usize = 4;

/// A one-shot tar body, consumed by the runtime's archive upload.
pub type ArchiveStream = BoxStream<'static, io::Result<Bytes>>;

/// Compression applied to the encoded tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveCompression {
    /// Plain tar
    None,
    /// Gzip-compressed tar
    #[default]
    Gzip,
}

/// How the encoder stopped when it did not finish.
#[derive(Debug)]
enum Abort {
    /// The consumer dropped the stream.
    Closed,
    Failed(InjectError),
}

/// Background half of [`stream_archive`].
#[derive(Debug)]
pub struct ArchiveEncoder {
    task: JoinHandle<std::result::Result<u64, Abort>>,
}

impl ArchiveEncoder {
    /// Wait for the encoder and combine its outcome with the upload's.
    ///
    /// Returns the number of body bytes produced. Cancellation wins, then an
    /// encoding error (the upload only saw its symptom), then the upload error.
    pub async fn finish(self, upload: Result<()>) -> Result<u64> {
        let encoded = self
            .task
            .await
            .map_err(|e| InjectError::Archive(format!("archive task failed: {}", e)))?;

        match (upload, encoded) {
            (Err(InjectError::Canceled), _) => Err(InjectError::Canceled),
            (_, Err(Abort::Failed(e))) => Err(e),
            (Err(e), _) => Err(e),
            (Ok(()), Err(Abort::Closed)) => Err(InjectError::TransportFailure(
                "runtime stopped reading the archive before it ended".to_string(),
            )),
            (Ok(()), Ok(sent)) => Ok(sent),
        }
    }
}

/// Encode `entries` on a blocking thread, returning the body as a stream.
///
/// `ctx` is checked before each entry. Each file is opened, copied, and closed
/// before the next entry is pulled, so at most one host file handle is open at a
/// time. When encoding fails the stream ends with an error item, so the runtime
/// never extracts a truncated archive as if it were complete.
///
/// The stream must be consumed (or dropped) for the encoder to finish; pass the
/// upload's result to [`ArchiveEncoder::finish`] to learn what went wrong.
pub fn stream_archive<I>(
    entries: I,
    compression: ArchiveCompression,
    ctx: &CopyContext,
) -> (ArchiveStream, ArchiveEncoder)
where
    I: IntoIterator<Item = Result<ArchiveEntry>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
    let ctx = ctx.clone();

    let task = tokio::task::spawn_blocking(move || {
        let status = tx.clone();
        let encoded = encode_into(ChannelWriter::new(tx), entries, compression, &ctx)
            .and_then(|mut writer| {
                writer.flush().map_err(archive_error)?;
                Ok(writer.sent)
            });

        match encoded {
            Ok(sent) => {
                debug!("Encoded archive body of {} bytes", sent);
                Ok(sent)
            }
            Err(_) if status.is_closed() => Err(Abort::Closed),
            Err(e) => {
                let _ = status.blocking_send(Err(io::Error::other(e.to_string())));
                Err(Abort::Failed(e))
            }
        }
    });

    let body = stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed();
    (body, ArchiveEncoder { task })
}

fn encode_into<W, I>(
    writer: W,
    entries: I,
    compression: ArchiveCompression,
    ctx: &CopyContext,
) -> Result<W>
where
    W: Write,
    I: IntoIterator<Item = Result<ArchiveEntry>>,
{
    match compression {
        ArchiveCompression::None => {
            let builder = write_entries(tar::Builder::new(writer), entries, ctx)?;
            builder.into_inner().map_err(archive_error)
        }
        ArchiveCompression::Gzip => {
            let encoder = GzEncoder::new(writer, Compression::default());
            let builder = write_entries(tar::Builder::new(encoder), entries, ctx)?;
            builder
                .into_inner()
                .and_then(|encoder| encoder.finish())
                .map_err(archive_error)
        }
    }
}

/// `io::Write` end of the body channel; sends full chunks, blocking while the
/// queue is full.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: BytesMut,
    sent: u64,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            tx,
            buf: BytesMut::with_capacity(CHUNK_SIZE),
            sent: 0,
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, BytesMut::with_capacity(CHUNK_SIZE)).freeze();
        self.sent += chunk.len() as u64;
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive stream closed"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = data.len().min(CHUNK_SIZE - self.buf.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() == CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

fn write_entries<W, I>(
    mut builder: tar::Builder<W>,
    entries: I,
    ctx: &CopyContext,
) -> Result<tar::Builder<W>>
where
    W: Write,
    I: IntoIterator<Item = Result<ArchiveEntry>>,
{
    let mut count = 0usize;
    for entry in entries {
        ctx.check()?;
        let entry = entry?;
        append_entry(&mut builder, &entry)?;
        count += 1;
    }

    builder.finish().map_err(archive_error)?;
    debug!("Encoded {} archive entries", count);
    Ok(builder)
}

fn append_entry<W: Write>(builder: &mut tar::Builder<W>, entry: &ArchiveEntry) -> Result<()> {
    let path = entry.relative_path().as_str();

    let mut header = tar::Header::new_ustar();
    header.set_mode(entry.mode());
    header.set_mtime(entry.mtime());
    header.set_uid(0);
    header.set_gid(0);

    let written = match entry.kind() {
        EntryKind::Directory => {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, path, io::empty())
        }
        EntryKind::File => {
            let file = entry.open()?;
            // The file may have changed since the walk; trust the open handle.
            let size = file
                .metadata()
                .map(|meta| meta.len())
                .unwrap_or_else(|_| entry.size());
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(size);
            builder.append_data(&mut header, path, file.take(size))
        }
    };

    written.map_err(|e| InjectError::Archive(format!("failed to append {}: {}", path, e)))
}

fn archive_error(err: io::Error) -> InjectError {
    InjectError::Archive(err.to_string())
}

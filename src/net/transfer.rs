//! Transfer sessions over a single stream connection.
//!
//! A [`Session`] performs exactly one send or receive. It is generic over the
//! underlying reader/writer so the same code drives TCP streams and in-memory
//! pipes.
//!
//! # Sending
//!
//! Inputs are first expanded with [`expand_tree`] into a pre-order element
//! list: every directory is listed before anything inside it. Names are
//! relative to the parent of the input they came from and always use `/`.
//!
//! # Receiving
//!
//! Elements are materialized under a receive directory. The first time a
//! top-level root is seen it is given a free name on disk (`docs`,
//! `docs (2)`, ...), and every later element under that root is rewritten
//! to the chosen name. Files that collide get a suffix before their
//! extension (`a (2).txt`). Nothing is written outside the receive
//! directory, and partially received files are left in place on failure.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use super::wire::{ElementHeader, ElementKind, TransferHeader, WireError, TEXT_MARKER};

/// Default size of the chunks file data is streamed in.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Errors that can occur during a transfer session
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("file changed while being sent: {0}")]
    SourceChanged(PathBuf),

    #[error("no transfer header within {0:?}")]
    HeaderTimeout(Duration),

    #[error("stream ended after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },

    #[error("unsafe element name: {0:?}")]
    UnsafePath(String),

    #[error("received text is not valid UTF-8")]
    InvalidText,

    #[error("peer closed the connection without accepting the transfer")]
    Refused,

    #[error("peer sent unexpected data after the transfer")]
    UnexpectedReply,

    #[error(transparent)]
    Protocol(#[from] WireError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Progress information for a transfer
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub direction: TransferDirection,
    /// Remote address.
    pub peer: Arc<str>,
    /// Payload bytes announced in the header.
    pub total_bytes: u64,
    /// Payload bytes moved so far.
    pub transferred_bytes: u64,
    /// Index of the element currently being processed.
    pub element_index: u64,
    pub element_count: u64,
}

impl TransferProgress {
    pub fn new(direction: TransferDirection, peer: impl Into<Arc<str>>) -> Self {
        Self {
            direction,
            peer: peer.into(),
            total_bytes: 0,
            transferred_bytes: 0,
            element_index: 0,
            element_count: 0,
        }
    }

    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        let pct = (self.transferred_bytes as f64 / self.total_bytes as f64) * 100.0;
        pct.min(100.0) as u8
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.transferred_bytes >= self.total_bytes
    }
}

/// One element of an outbound transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendElement {
    /// Where the data is read from.
    pub source: PathBuf,
    /// Name sent on the wire.
    pub name: String,
    pub kind: ElementKind,
}

impl SendElement {
    fn header(&self) -> ElementHeader {
        ElementHeader {
            name: self.name.clone(),
            kind: self.kind,
        }
    }
}

/// Expands input paths into a pre-order element list.
///
/// Directory children are visited in name order. Entries that are neither
/// regular files nor directories (symlinks inside a tree, sockets, ...) are
/// skipped. This walks the filesystem synchronously; call it from a
/// blocking context.
pub fn expand_tree(inputs: &[PathBuf]) -> Result<Vec<SendElement>, TransferError> {
    let mut elements = Vec::new();

    for input in inputs {
        let metadata = fs::metadata(input).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TransferError::FileNotFound(input.clone()),
            _ => TransferError::Io(e),
        })?;
        let root = root_name(input)?;

        if metadata.is_file() {
            elements.push(SendElement {
                source: input.clone(),
                name: root,
                kind: ElementKind::File(metadata.len()),
            });
            continue;
        }
        if !metadata.is_dir() {
            warn!(path = %input.display(), "Skipping input that is neither file nor directory");
            continue;
        }

        // Explicit worklist; children are pushed in reverse so they pop in order.
        let mut stack = vec![(input.clone(), root, ElementKind::Directory)];
        while let Some((source, name, kind)) = stack.pop() {
            if kind == ElementKind::Directory {
                let mut children = fs::read_dir(&source)?.collect::<Result<Vec<_>, _>>()?;
                children.sort_by_key(|entry| entry.file_name());

                for entry in children.into_iter().rev() {
                    let child_name = format!("{name}/{}", entry.file_name().to_string_lossy());
                    let file_type = entry.file_type()?;
                    if file_type.is_dir() {
                        stack.push((entry.path(), child_name, ElementKind::Directory));
                    } else if file_type.is_file() {
                        let len = entry.metadata()?.len();
                        stack.push((entry.path(), child_name, ElementKind::File(len)));
                    } else {
                        debug!(path = %entry.path().display(), "Skipping special file");
                    }
                }
            }

            elements.push(SendElement { source, name, kind });
        }
    }

    Ok(elements)
}

/// Final component of an input path, resolving `.` and the like.
fn root_name(path: &Path) -> Result<String, TransferError> {
    if let Some(name) = path.file_name() {
        return Ok(name.to_string_lossy().into_owned());
    }
    fs::canonicalize(path)?
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::UnsafePath(path.display().to_string()))
}

/// What a completed receive produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Top-level entries created, relative to the receive directory.
    Files { created: Vec<PathBuf>, total_bytes: u64 },
    Text { text: String, total_bytes: u64 },
}

/// State of one active transfer.
pub struct Session<F> {
    progress: TransferProgress,
    chunk_size: usize,
    on_progress: F,
}

impl<F> std::fmt::Debug for Session<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("progress", &self.progress)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl<F> Session<F>
where
    F: FnMut(&TransferProgress),
{
    /// Creates a session. `on_progress` runs after every chunk with the
    /// updated progress.
    pub fn new(
        direction: TransferDirection,
        peer: impl Into<Arc<str>>,
        chunk_size: usize,
        on_progress: F,
    ) -> Self {
        Self {
            progress: TransferProgress::new(direction, peer),
            chunk_size: chunk_size.max(1),
            on_progress,
        }
    }

    #[inline]
    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }

    /// Streams `elements` to `writer`. Returns the payload size sent.
    #[instrument(skip_all, fields(peer = %self.progress.peer, elements = elements.len()))]
    pub async fn send_files<W>(
        &mut self,
        writer: &mut W,
        elements: &[SendElement],
    ) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let total: u64 = elements.iter().map(|e| e.kind.payload_len()).sum();
        self.start(elements.len() as u64, total);
        TransferHeader::new(elements.len() as u64, total)
            .write_to(writer)
            .await?;

        for (index, element) in elements.iter().enumerate() {
            self.progress.element_index = index as u64;
            element.header().write_to(writer).await?;

            if let ElementKind::File(len) = element.kind {
                let mut file = File::open(&element.source).await.map_err(|e| match e.kind() {
                    io::ErrorKind::NotFound => TransferError::FileNotFound(element.source.clone()),
                    _ => TransferError::Io(e),
                })?;
                let sent = self.pump(&mut file, writer, len).await?;
                if sent < len {
                    return Err(TransferError::SourceChanged(element.source.clone()));
                }
            }
            debug!(name = %element.name, percent = self.progress.percent(), "Element sent");
        }

        writer.flush().await?;
        Ok(total)
    }

    /// Sends `text` as a single text-marker element.
    #[instrument(skip_all, fields(peer = %self.progress.peer, len = text.len()))]
    pub async fn send_text<W>(&mut self, writer: &mut W, text: &str) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let total = text.len() as u64;
        self.start(1, total);
        TransferHeader::new(1, total).write_to(writer).await?;
        ElementHeader::file(TEXT_MARKER, total).write_to(writer).await?;

        let mut source = text.as_bytes();
        self.pump(&mut source, writer, total).await?;
        writer.flush().await?;
        Ok(total)
    }

    /// Reads one transfer from `reader` into `receive_dir`.
    ///
    /// `header_timeout` bounds only the wait for the 16-byte header.
    #[instrument(skip_all, fields(peer = %self.progress.peer, dir = %receive_dir.display()))]
    pub async fn receive<R>(
        &mut self,
        reader: &mut R,
        receive_dir: &Path,
        header_timeout: Duration,
    ) -> Result<ReceiveOutcome, TransferError>
    where
        R: AsyncBufRead + Unpin,
    {
        let header = tokio::time::timeout(header_timeout, TransferHeader::read_from(reader))
            .await
            .map_err(|_| TransferError::HeaderTimeout(header_timeout))??;
        debug!(
            elements = header.element_count,
            total = header.total_size,
            "Transfer header received"
        );
        self.start(header.element_count, header.total_size);

        tokio::fs::create_dir_all(receive_dir).await?;
        let mut names = ReceiveNames::new(receive_dir);
        let mut text = None;

        for index in 0..header.element_count {
            self.progress.element_index = index;
            let element = ElementHeader::read_from(reader).await?;

            match element.kind {
                ElementKind::Directory => {
                    let path = names.directory(&element.name).await?;
                    tokio::fs::create_dir_all(&path).await?;
                    debug!(name = %element.name, path = %path.display(), "Directory created");
                }
                ElementKind::File(len) if element.is_text() => {
                    let mut buf = Vec::with_capacity(len.min(1 << 20) as usize);
                    let received = self.pump(reader, &mut buf, len).await?;
                    if received < len {
                        return Err(TransferError::Truncated {
                            expected: len,
                            received,
                        });
                    }
                    text = Some(buf);
                }
                ElementKind::File(len) => {
                    let (path, mut file) = names.file(&element.name).await?;
                    let received = self.pump(reader, &mut file, len).await?;
                    file.flush().await?;
                    if received < len {
                        return Err(TransferError::Truncated {
                            expected: len,
                            received,
                        });
                    }
                    debug!(name = %element.name, path = %path.display(), len, "File received");
                }
            }
        }

        let total_bytes = header.total_size;
        match text {
            Some(bytes) => {
                let text = String::from_utf8(bytes).map_err(|_| TransferError::InvalidText)?;
                Ok(ReceiveOutcome::Text { text, total_bytes })
            }
            None => Ok(ReceiveOutcome::Files {
                created: names.into_created(),
                total_bytes,
            }),
        }
    }

    fn start(&mut self, element_count: u64, total_bytes: u64) {
        self.progress.element_count = element_count;
        self.progress.total_bytes = total_bytes;
        self.progress.transferred_bytes = 0;
    }

    /// Copies up to `len` bytes in chunks, reporting progress after each one.
    /// Each chunk is filled completely unless the source ends. Returns the
    /// number of bytes copied, which is less than `len` only on early EOF.
    async fn pump<R, W>(&mut self, reader: &mut R, writer: &mut W, len: u64) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if len == 0 {
            return Ok(0);
        }

        let mut buf = vec![0u8; len.min(self.chunk_size as u64) as usize];
        let mut copied = 0u64;

        while copied < len {
            let want = (len - copied).min(buf.len() as u64) as usize;
            let mut filled = 0;
            while filled < want {
                let n = reader.read(&mut buf[filled..want]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }

            writer.write_all(&buf[..filled]).await?;
            copied += filled as u64;
            self.progress.transferred_bytes += filled as u64;
            (self.on_progress)(&self.progress);

            if filled < want {
                break;
            }
        }

        Ok(copied)
    }
}

/// Waits for the receiver to close its end after a send.
///
/// A receiver that accepted and read everything closes cleanly. One that
/// was busy, rejected the request or failed midway resets the connection,
/// which surfaces here as [`TransferError::Refused`].
pub async fn await_peer_close<R>(reader: &mut R) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    match reader.read(&mut buf).await {
        Ok(0) => Ok(()),
        Ok(_) => Err(TransferError::UnexpectedReply),
        Err(e) => Err(refused_or_io(e)),
    }
}

/// Maps a reset or broken connection to [`TransferError::Refused`].
pub(crate) fn refused_or_io(e: io::Error) -> TransferError {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected => TransferError::Refused,
        _ => TransferError::Io(e),
    }
}

/// Collision-safe naming for one inbound transfer.
struct ReceiveNames {
    receive_dir: PathBuf,
    /// Original root name to the name actually used on disk.
    roots: HashMap<String, String>,
    /// Top-level entries created, relative to `receive_dir`.
    created: Vec<PathBuf>,
}

impl ReceiveNames {
    fn new(receive_dir: &Path) -> Self {
        Self {
            receive_dir: receive_dir.to_path_buf(),
            roots: HashMap::new(),
            created: Vec::new(),
        }
    }

    fn into_created(self) -> Vec<PathBuf> {
        self.created
    }

    /// Resolves a directory element, claiming a free root name the first time
    /// a root is seen.
    async fn directory(&mut self, name: &str) -> Result<PathBuf, TransferError> {
        let parts = safe_components(name)?;
        let root = parts[0];

        if !self.roots.contains_key(root) {
            let mut candidate = root.to_string();
            let mut n = 2u32;
            while tokio::fs::try_exists(self.receive_dir.join(&candidate)).await? {
                candidate = format!("{root} ({n})");
                n += 1;
            }
            if candidate != root {
                debug!(root, renamed = %candidate, "Renamed colliding root directory");
            }
            self.created.push(PathBuf::from(&candidate));
            self.roots.insert(root.to_string(), candidate);
        }

        Ok(self.resolve(&parts, true))
    }

    /// Resolves a file element and creates it under a free name.
    async fn file(&mut self, name: &str) -> Result<(PathBuf, File), TransferError> {
        let parts = safe_components(name)?;
        let wanted = self.resolve(&parts, false);
        let (path, file) = create_unique(&wanted).await?;

        if parts.len() == 1 {
            if let Some(file_name) = path.file_name() {
                self.created.push(PathBuf::from(file_name));
            }
        }
        Ok((path, file))
    }

    /// Joins `parts` under the receive directory. A renamed root is
    /// substituted for directories and for anything nested below it.
    fn resolve(&self, parts: &[&str], is_dir: bool) -> PathBuf {
        let mut path = self.receive_dir.clone();
        match self.roots.get(parts[0]) {
            Some(renamed) if is_dir || parts.len() > 1 => path.push(renamed),
            _ => path.push(parts[0]),
        }
        path.extend(&parts[1..]);
        path
    }
}

/// Splits a wire name into path components, rejecting anything that could
/// escape the receive directory.
fn safe_components(name: &str) -> Result<Vec<&str>, TransferError> {
    let unsafe_path = || TransferError::UnsafePath(name.to_string());

    if name.starts_with('/') || name.contains('\\') {
        return Err(unsafe_path());
    }

    let mut parts = Vec::new();
    for part in name.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => parts.push(part),
            _ => return Err(unsafe_path()),
        }
    }

    if parts.is_empty() {
        return Err(unsafe_path());
    }
    Ok(parts)
}

/// Creates `path`, or `stem (n).ext` in the same directory if it is taken.
async fn create_unique(path: &Path) -> io::Result<(PathBuf, File)> {
    let mut candidate = path.to_path_buf();
    let mut n = 2u32;

    loop {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                candidate = numbered(path, n);
                n += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn numbered(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{stem} ({n}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({n})"),
    };
    path.with_file_name(file_name)
}

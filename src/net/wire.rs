//! Binary wire formats for discovery datagrams and transfer streams.
//!
//! Two message families share this module, both little-endian:
//!
//! - **Discovery datagrams**: a single tag byte followed by a payload. HELLO
//!   messages carry the sender's signature (optionally preceded by a 2-byte
//!   port), GOODBYE carries a fixed `"Bye Bye"` payload that is ignored on
//!   receipt.
//! - **Transfer streams**: a 16-byte header (element count, total payload
//!   size) followed by one framed element per file or directory. Each element
//!   is a NUL-terminated UTF-8 name followed by a signed 8-byte size, where
//!   `-1` marks a directory and any other value is the length of the file
//!   bytes that follow.
//!
//! # Layout
//!
//! | Tag    | Payload                                  |
//! |--------|------------------------------------------|
//! | `0x01` | HELLO broadcast: signature               |
//! | `0x02` | HELLO unicast: signature                 |
//! | `0x03` | GOODBYE: `"Bye Bye"`                     |
//! | `0x04` | HELLO broadcast: `u16` port, signature   |
//! | `0x05` | HELLO unicast: `u16` port, signature     |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Well-known port used for both discovery and transfers.
pub const DEFAULT_PORT: u16 = 4644;

/// Reserved element name marking an inline text payload.
pub const TEXT_MARKER: &str = "___DUKTO___TEXT___";

/// Raw element size marking a directory.
pub const DIRECTORY_SIZE: i64 = -1;

/// Size of the transfer stream header in bytes.
pub const HEADER_LEN: usize = 16;

/// Longest element name accepted from the wire, excluding the terminator.
pub const MAX_NAME_LEN: usize = 4096;

/// Payload carried by GOODBYE datagrams.
const GOODBYE_PAYLOAD: &[u8] = b"Bye Bye";

/// Discovery datagram tags.
mod tag {
    pub const HELLO_BROADCAST: u8 = 0x01;
    pub const HELLO_UNICAST: u8 = 0x02;
    pub const GOODBYE: u8 = 0x03;
    pub const HELLO_BROADCAST_PORT: u8 = 0x04;
    pub const HELLO_UNICAST_PORT: u8 = 0x05;
}

/// Errors produced while decoding wire data
#[derive(Error, Debug)]
pub enum WireError {
    #[error("empty datagram")]
    Empty,

    #[error("unknown message tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("datagram with tag {tag:#04x} too short: {len} bytes")]
    Truncated { tag: u8, len: usize },

    #[error("element name exceeds {MAX_NAME_LEN} bytes")]
    NameTooLong,

    #[error("element name is not valid UTF-8")]
    InvalidName,

    #[error("invalid element size: {0}")]
    InvalidSize(i64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Whether a HELLO was broadcast to the whole segment or sent to one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloKind {
    Broadcast,
    Unicast,
}

/// A decoded discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMessage {
    /// Presence announcement. `port` is only present for the 0x04/0x05 variants.
    Hello {
        kind: HelloKind,
        port: Option<u16>,
        signature: String,
    },
    /// Presence retraction.
    Goodbye,
}

impl DiscoveryMessage {
    /// Creates a HELLO message.
    #[inline]
    pub fn hello(kind: HelloKind, port: Option<u16>, signature: impl Into<String>) -> Self {
        Self::Hello {
            kind,
            port,
            signature: signature.into(),
        }
    }

    /// Returns the tag byte this message is encoded with.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Hello { kind, port, .. } => match (kind, port.is_some()) {
                (HelloKind::Broadcast, false) => tag::HELLO_BROADCAST,
                (HelloKind::Unicast, false) => tag::HELLO_UNICAST,
                (HelloKind::Broadcast, true) => tag::HELLO_BROADCAST_PORT,
                (HelloKind::Unicast, true) => tag::HELLO_UNICAST_PORT,
            },
            Self::Goodbye => tag::GOODBYE,
        }
    }

    /// Encodes the message into a datagram.
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Hello {
                port, signature, ..
            } => {
                let mut buf = BytesMut::with_capacity(3 + signature.len());
                buf.put_u8(self.tag());
                if let Some(port) = port {
                    buf.put_u16_le(*port);
                }
                buf.put_slice(signature.as_bytes());
                buf.freeze()
            }
            Self::Goodbye => {
                let mut buf = BytesMut::with_capacity(1 + GOODBYE_PAYLOAD.len());
                buf.put_u8(tag::GOODBYE);
                buf.put_slice(GOODBYE_PAYLOAD);
                buf.freeze()
            }
        }
    }

    /// Decodes a datagram.
    ///
    /// Signatures are decoded lossily: invalid UTF-8 sequences are replaced
    /// rather than rejected.
    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let mut buf = datagram;
        if !buf.has_remaining() {
            return Err(WireError::Empty);
        }

        let tag = buf.get_u8();
        let (kind, with_port) = match tag {
            tag::HELLO_BROADCAST => (HelloKind::Broadcast, false),
            tag::HELLO_UNICAST => (HelloKind::Unicast, false),
            tag::HELLO_BROADCAST_PORT => (HelloKind::Broadcast, true),
            tag::HELLO_UNICAST_PORT => (HelloKind::Unicast, true),
            tag::GOODBYE => return Ok(Self::Goodbye),
            other => return Err(WireError::UnknownTag(other)),
        };

        let port = if with_port {
            if buf.remaining() < 2 {
                return Err(WireError::Truncated {
                    tag,
                    len: datagram.len(),
                });
            }
            Some(buf.get_u16_le())
        } else {
            None
        };

        Ok(Self::Hello {
            kind,
            port,
            signature: String::from_utf8_lossy(buf).into_owned(),
        })
    }
}

/// Header sent once at the start of every transfer stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    /// Number of elements that follow.
    pub element_count: u64,
    /// Sum of all file sizes (directories contribute nothing).
    pub total_size: u64,
}

impl TransferHeader {
    #[inline]
    pub fn new(element_count: u64, total_size: u64) -> Self {
        Self {
            element_count,
            total_size,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..8].copy_from_slice(&self.element_count.to_le_bytes());
        bytes[8..].copy_from_slice(&self.total_size.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Self {
        let mut buf = &bytes[..];
        Self {
            element_count: buf.get_u64_le(),
            total_size: buf.get_u64_le(),
        }
    }

    /// Reads a header, failing with `UnexpectedEof` if the stream ends early.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, WireError> {
        let mut bytes = [0u8; HEADER_LEN];
        reader.read_exact(&mut bytes).await?;
        Ok(Self::from_bytes(&bytes))
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), WireError> {
        writer.write_all(&self.to_bytes()).await?;
        Ok(())
    }
}

/// What an element describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Directory,
    /// A file whose bytes (of the given length) follow the element header.
    File(u64),
}

impl ElementKind {
    /// Interprets a raw signed size from the wire.
    pub fn from_raw(size: i64) -> Result<Self, WireError> {
        match size {
            DIRECTORY_SIZE => Ok(Self::Directory),
            len if len >= 0 => Ok(Self::File(len as u64)),
            other => Err(WireError::InvalidSize(other)),
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            Self::Directory => DIRECTORY_SIZE,
            Self::File(len) => len as i64,
        }
    }

    /// Number of payload bytes following the element header.
    #[inline]
    pub fn payload_len(self) -> u64 {
        match self {
            Self::Directory => 0,
            Self::File(len) => len,
        }
    }
}

/// Name and size prefix of one element in a transfer stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHeader {
    /// Relative path using `/` separators, or [`TEXT_MARKER`].
    pub name: String,
    pub kind: ElementKind,
}

impl ElementHeader {
    #[inline]
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ElementKind::Directory,
        }
    }

    #[inline]
    pub fn file(name: impl Into<String>, len: u64) -> Self {
        Self {
            name: name.into(),
            kind: ElementKind::File(len),
        }
    }

    /// Returns true if this element carries an inline text payload.
    #[inline]
    pub fn is_text(&self) -> bool {
        self.name == TEXT_MARKER
    }

    /// Reads a NUL-terminated name followed by the signed size.
    pub async fn read_from<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Self, WireError> {
        let mut name = Vec::new();
        (&mut *reader)
            .take(MAX_NAME_LEN as u64 + 1)
            .read_until(0, &mut name)
            .await?;

        match name.pop() {
            Some(0) => {}
            _ if name.len() >= MAX_NAME_LEN => return Err(WireError::NameTooLong),
            _ => {
                return Err(WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended inside element name",
                )))
            }
        }

        let name = String::from_utf8(name).map_err(|_| WireError::InvalidName)?;
        let kind = ElementKind::from_raw(reader.read_i64_le().await?)?;
        Ok(Self { name, kind })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), WireError> {
        writer.write_all(self.name.as_bytes()).await?;
        writer.write_u8(0).await?;
        writer.write_i64_le(self.kind.to_raw()).await?;
        Ok(())
    }
}

//! Sync message envelope and wire formats.
//!
//! Every exchange is a [`SyncMessage`]: a message type (request, response or
//! stream), an operation name and a JSON payload. Type and name are closed
//! enums, so a message with an unknown type or name cannot be built or
//! decoded.
//!
//! Messages travel as JSON. For byte streams they are wrapped in a small
//! length-prefixed frame:
//!
//! ```text
//! ┌─────────┬─────────┬─────────┬─────────┬─────────┐
//! │  MAGIC  │ LENGTH  │  TYPE   │ VERSION │  FLAGS  │
//! │ 4 bytes │ 4 bytes │ 1 byte  │ 1 byte  │ 2 bytes │
//! └─────────┴─────────┴─────────┴─────────┴─────────┘
//! ```

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::delta::DiffSegment;
use crate::error::{Result, SyncError};
use crate::hash::ContentHash;
use crate::tree::ChecksumTree;

/// Frame magic bytes: "VFSY"
pub const PROTOCOL_MAGIC: [u8; 4] = *b"VFSY";

/// Current frame version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum payload size (16 MB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

// =============================================================================
// ENVELOPE
// =============================================================================

/// Direction of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Asks the peer to do something.
    Request = 0x01,
    /// Answers a request.
    Response = 0x02,
    /// Unsolicited push from the server.
    Stream = 0x03,
}

/// Operation a message is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageName {
    /// Client's root and path list for a round.
    SourceList,
    /// Checksum tree for the round's paths.
    Checksum,
    /// Client's computed diffs.
    Diff,
    /// Result of applying diffs.
    Patch,
    /// Receipt for a step; does not advance the round.
    Ack,
    /// Abandon the current round.
    Reset,
    /// Unrecoverable failure; ends the round.
    Error,
}

impl MessageType {
    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Response => "RESPONSE",
            Self::Stream => "STREAM",
        }
    }

    /// Convert from the frame header byte.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMessage` if the value is not a known type.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Request),
            0x02 => Ok(Self::Response),
            0x03 => Ok(Self::Stream),
            _ => Err(SyncError::InvalidMessage {
                field: "type",
                value: format!("{value:#x}"),
            }),
        }
    }
}

impl MessageName {
    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SourceList => "SOURCE_LIST",
            Self::Checksum => "CHECKSUM",
            Self::Diff => "DIFF",
            Self::Patch => "PATCH",
            Self::Ack => "ACK",
            Self::Reset => "RESET",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for MessageType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "REQUEST" => Ok(Self::Request),
            "RESPONSE" => Ok(Self::Response),
            "STREAM" => Ok(Self::Stream),
            _ => Err(SyncError::InvalidMessage {
                field: "type",
                value: s.to_string(),
            }),
        }
    }
}

impl FromStr for MessageName {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SOURCE_LIST" => Ok(Self::SourceList),
            "CHECKSUM" => Ok(Self::Checksum),
            "DIFF" => Ok(Self::Diff),
            "PATCH" => Ok(Self::Patch),
            "ACK" => Ok(Self::Ack),
            "RESET" => Ok(Self::Reset),
            "ERROR" => Ok(Self::Error),
            _ => Err(SyncError::InvalidMessage {
                field: "name",
                value: s.to_string(),
            }),
        }
    }
}

macro_rules! wire_enum_impls {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

wire_enum_impls!(MessageType);
wire_enum_impls!(MessageName);

/// Immutable protocol message.
///
/// # Example
///
/// ```rust
/// use vfsync::{MessageName, MessageType, SyncMessage};
///
/// let msg = SyncMessage::parse("REQUEST", "CHECKSUM", serde_json::Value::Null).unwrap();
/// assert_eq!(msg.kind(), MessageType::Request);
/// assert_eq!(msg.name(), MessageName::Checksum);
///
/// assert!(SyncMessage::parse("REQUEST", "BOGUS", serde_json::Value::Null).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    #[serde(rename = "type")]
    kind: MessageType,
    name: MessageName,
    #[serde(default)]
    content: Value,
}

impl SyncMessage {
    /// Build a message from already-validated parts.
    #[must_use]
    pub const fn new(kind: MessageType, name: MessageName, content: Value) -> Self {
        Self {
            kind,
            name,
            content,
        }
    }

    /// Build a message from wire spellings of type and name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMessage` if either is not a known value.
    pub fn parse(kind: &str, name: &str, content: Value) -> Result<Self> {
        Ok(Self::new(kind.parse()?, name.parse()?, content))
    }

    /// Request carrying a serializable payload.
    ///
    /// # Errors
    ///
    /// Returns `Json` if the payload cannot be represented as JSON.
    pub fn request<T: Serialize>(name: MessageName, content: &T) -> Result<Self> {
        Ok(Self::new(MessageType::Request, name, serde_json::to_value(content)?))
    }

    /// Response carrying a serializable payload.
    ///
    /// # Errors
    ///
    /// Returns `Json` if the payload cannot be represented as JSON.
    pub fn response<T: Serialize>(name: MessageName, content: &T) -> Result<Self> {
        Ok(Self::new(MessageType::Response, name, serde_json::to_value(content)?))
    }

    /// Server push carrying a serializable payload.
    ///
    /// # Errors
    ///
    /// Returns `Json` if the payload cannot be represented as JSON.
    pub fn stream<T: Serialize>(name: MessageName, content: &T) -> Result<Self> {
        Ok(Self::new(MessageType::Stream, name, serde_json::to_value(content)?))
    }

    /// `ERROR` response describing `error`.
    #[must_use]
    pub fn error(error: &SyncError) -> Self {
        let payload = ErrorPayload {
            message: error.to_string(),
        };
        Self::new(
            MessageType::Response,
            MessageName::Error,
            serde_json::to_value(&payload).unwrap_or_default(),
        )
    }

    /// `ACK` response for the step `name`.
    #[must_use]
    pub fn ack(name: MessageName) -> Self {
        Self::new(
            MessageType::Response,
            MessageName::Ack,
            serde_json::to_value(AckPayload { name }).unwrap_or_default(),
        )
    }

    /// Message direction.
    #[must_use]
    pub const fn kind(&self) -> MessageType {
        self.kind
    }

    /// Operation name.
    #[must_use]
    pub const fn name(&self) -> MessageName {
        self.name
    }

    /// Raw payload.
    #[must_use]
    pub const fn content(&self) -> &Value {
        &self.content
    }

    /// True when this message has the given type and name.
    #[must_use]
    pub fn is(&self, kind: MessageType, name: MessageName) -> bool {
        self.kind == kind && self.name == name
    }

    /// Decode the payload as `T`.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if the payload does not have the shape of `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.content).map_err(|e| {
            SyncError::protocol(format!("bad {} {} payload: {e}", self.kind, self.name))
        })
    }

    /// Encode to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `Json` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `Json` if the bytes are not a well-formed message, including
    /// unknown type or name values.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl fmt::Display for SyncMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// `SOURCE_LIST` request: the round's root and every path under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceList {
    /// Minimal root being synced.
    pub path: String,
    /// Paths the client will send diffs for.
    #[serde(rename = "srcList")]
    pub src_list: Vec<String>,
}

/// `CHECKSUM` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumsPayload {
    /// Server's checksum tree for the source list.
    pub checksums: ChecksumTree,
}

/// What changed at one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Change {
    /// File content, as a diff against the server's blocks.
    File {
        /// Segments reconstructing the new content.
        diffs: Vec<DiffSegment>,
        /// Digest of the new content.
        digest: ContentHash,
    },
    /// Symbolic link target.
    Symlink {
        /// Link target.
        target: String,
    },
    /// Directory with its complete child listing.
    Directory {
        /// Child names.
        contents: Vec<String>,
    },
    /// Path no longer exists on the client.
    Removed,
}

/// One entry of a `DIFF` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathDiff {
    /// Path the change applies to.
    pub path: String,
    /// The change.
    pub change: Change,
}

/// `DIFF` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffsPayload {
    /// Changes in source-list order.
    pub diffs: Vec<PathDiff>,
}

/// `PATCH` response / stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PatchPayload {
    /// Root the patch was applied under.
    pub path: String,
    /// Paths now identical on both sides.
    pub synced: Vec<String>,
    /// Paths whose server copy was preserved as a conflicted copy; the client
    /// should send them again.
    pub conflicted: Vec<String>,
}

/// `ERROR` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human readable cause.
    pub message: String,
}

/// `ACK` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Step being acknowledged.
    pub name: MessageName,
}

/// `{__isUint8Array: true, __array: [..]}` encoding for byte buffers in JSON.
///
/// Use with `#[serde(with = "uint8_array")]` on `Vec<u8>` fields.
pub mod uint8_array {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize)]
    struct Wire<'a> {
        #[serde(rename = "__isUint8Array")]
        is_uint8_array: bool,
        #[serde(rename = "__array")]
        array: &'a [u8],
    }

    #[derive(Deserialize)]
    struct OwnedWire {
        #[serde(rename = "__isUint8Array")]
        is_uint8_array: bool,
        #[serde(rename = "__array")]
        array: Vec<u8>,
    }

    /// Serialize bytes in the tagged array form.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        Wire {
            is_uint8_array: true,
            array: bytes,
        }
        .serialize(serializer)
    }

    /// Deserialize bytes from the tagged array form, preserving element order.
    ///
    /// # Errors
    ///
    /// Fails if the marker is missing or false, or an element is not a byte.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let wire = OwnedWire::deserialize(deserializer)?;
        if !wire.is_uint8_array {
            return Err(serde::de::Error::custom("__isUint8Array must be true"));
        }
        Ok(wire.array)
    }
}

// =============================================================================
// FRAMING
// =============================================================================

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Magic bytes: "VFSY".
    pub magic: [u8; 4],
    /// Payload length (little-endian).
    pub length: u32,
    /// Type of the enclosed message.
    pub kind: MessageType,
    /// Frame version.
    pub version: u8,
    /// Reserved flags.
    pub flags: u16,
}

impl FrameHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 12;

    /// Create a new frame header.
    #[must_use]
    pub const fn new(kind: MessageType, payload_len: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            length: payload_len,
            kind,
            version: PROTOCOL_VERSION,
            flags: 0,
        }
    }

    /// Validate the header.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if magic, version or length are unusable.
    pub fn validate(&self) -> Result<()> {
        if self.magic != PROTOCOL_MAGIC {
            return Err(SyncError::protocol(format!(
                "invalid magic: expected {PROTOCOL_MAGIC:?}, got {:?}",
                self.magic
            )));
        }
        if self.version != PROTOCOL_VERSION {
            return Err(SyncError::protocol(format!(
                "unsupported version: expected {PROTOCOL_VERSION}, got {}",
                self.version
            )));
        }
        if self.length > MAX_PAYLOAD_SIZE {
            return Err(SyncError::protocol(format!(
                "payload too large: {} > {MAX_PAYLOAD_SIZE}",
                self.length
            )));
        }
        Ok(())
    }

    /// Encode header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8] = self.kind as u8;
        buf[9] = self.version;
        buf[10..12].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    /// Decode and validate a header.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMessage` or `ProtocolViolation` for a bad header.
    pub fn decode(buf: &[u8; Self::SIZE]) -> Result<Self> {
        let header = Self {
            magic: [buf[0], buf[1], buf[2], buf[3]],
            length: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            kind: MessageType::from_u8(buf[8])?,
            version: buf[9],
            flags: u16::from_le_bytes([buf[10], buf[11]]),
        };
        header.validate()?;
        Ok(header)
    }
}

/// Reads and writes framed messages.
#[derive(Debug, Default)]
pub struct Codec {
    /// Buffer for partial reads.
    read_buf: Vec<u8>,
}

impl Codec {
    /// Create a new codec.
    #[must_use]
    pub fn new() -> Self {
        Self {
            read_buf: Vec::with_capacity(4096),
        }
    }

    fn frame(message: &SyncMessage) -> Result<(FrameHeader, Vec<u8>)> {
        let payload = message.encode()?;
        let payload_len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_SIZE)
            .ok_or_else(|| {
                SyncError::protocol(format!(
                    "payload exceeds maximum size: {} > {MAX_PAYLOAD_SIZE}",
                    payload.len()
                ))
            })?;
        Ok((FrameHeader::new(message.kind(), payload_len), payload))
    }

    fn unframe(&self, header: FrameHeader) -> Result<SyncMessage> {
        let message = SyncMessage::decode(&self.read_buf)?;
        if message.kind() != header.kind {
            return Err(SyncError::protocol(format!(
                "frame says {} but message is {}",
                header.kind,
                message.kind()
            )));
        }
        Ok(message)
    }

    /// Write a message to a writer.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub fn write_message<W: Write>(&self, writer: &mut W, message: &SyncMessage) -> Result<()> {
        let (header, payload) = Self::frame(message)?;
        writer.write_all(&header.encode())?;
        writer.write_all(&payload)?;
        Ok(())
    }

    /// Read a message from a reader.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or decoding fails.
    pub fn read_message<R: Read>(&mut self, reader: &mut R) -> Result<SyncMessage> {
        let mut buf = [0u8; FrameHeader::SIZE];
        reader.read_exact(&mut buf)?;
        let header = FrameHeader::decode(&buf)?;

        self.read_buf.resize(header.length as usize, 0);
        reader.read_exact(&mut self.read_buf)?;
        self.unframe(header)
    }

    /// Write a message to an async writer.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub async fn write_message_async<W>(&self, writer: &mut W, message: &SyncMessage) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let (header, payload) = Self::frame(message)?;
        writer.write_all(&header.encode()).await?;
        writer.write_all(&payload).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a message from an async reader. Returns `None` on a clean end of
    /// stream before a new frame starts.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or decoding fails.
    pub async fn read_message_async<R>(&mut self, reader: &mut R) -> Result<Option<SyncMessage>>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; FrameHeader::SIZE];
        match reader.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let header = FrameHeader::decode(&buf)?;

        self.read_buf.resize(header.length as usize, 0);
        reader.read_exact(&mut self.read_buf).await?;
        self.unframe(header).map(Some)
    }
}

//! Wire protocol shared between the stallboard server and its clients.
//!
//! Every message is a length-prefixed frame: an 8-byte header holding the
//! message tag (u32, little-endian) and the payload length in bytes (u32,
//! little-endian), followed by exactly that many payload bytes. A frame is
//! always read in full before it is interpreted; a short read terminates
//! the connection rather than producing a protocol error.
//!
//! Payload layouts are byte-exact and little-endian throughout. Slot keys
//! are a fixed 8 bytes (duty kind u16, day u16, year u32); assignee names
//! are UTF-16 code units terminated by a zero code unit.

use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current protocol generation. Tags are allocated within a generation;
/// frames carrying tags from an unknown generation are dropped by the
/// receiver instead of desynchronizing the stream.
pub const PROTOCOL_VERSION: u32 = 1;

/// The single shared credential accepted by the login handler.
pub const SHARED_CREDENTIAL: &[u8] = b"washington";

pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on a declared payload length. Anything larger is treated
/// as a transport fault, since no valid message comes close.
pub const MAX_PAYLOAD_LEN: u32 = 1024 * 1024;

/// Message tags. Client-to-server and server-to-client tags are separate
/// spaces; direction disambiguates them.
pub mod tag {
    pub const LOGIN: u32 = 0;
    pub const GET_ASSIGNMENT: u32 = 1;
    pub const SET_ASSIGNMENT: u32 = 2;

    pub const LOGIN_RESPONSE: u32 = 0;
    pub const ASSIGNMENT_UPDATE: u32 = 1;
}

/// Which duty a schedule slot covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DutyKind {
    Pasture,
    StableIn,
    StableOut,
}

impl DutyKind {
    pub fn to_wire(self) -> u16 {
        match self {
            DutyKind::Pasture => 0,
            DutyKind::StableIn => 1,
            DutyKind::StableOut => 2,
        }
    }

    pub fn from_wire(raw: u16) -> Option<DutyKind> {
        match raw {
            0 => Some(DutyKind::Pasture),
            1 => Some(DutyKind::StableIn),
            2 => Some(DutyKind::StableOut),
            _ => None,
        }
    }
}

/// Identifies one slot of the duty schedule.
///
/// Equality and hashing are derived from the named fields, so two keys
/// compare equal exactly when their duty kind, day and year match,
/// independent of how they were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub kind: DutyKind,
    pub day: u16,
    pub year: u32,
}

impl SlotKey {
    /// Fixed on-wire width: kind (2) + day (2) + year (4).
    pub const WIRE_LEN: usize = 8;

    pub fn new(kind: DutyKind, day: u16, year: u32) -> Self {
        Self { kind, day, year }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.kind.to_wire().to_le_bytes());
        out.extend_from_slice(&self.day.to_le_bytes());
        out.extend_from_slice(&self.year.to_le_bytes());
    }

    /// Decodes a key from the first [`SlotKey::WIRE_LEN`] bytes of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<SlotKey, DecodeError> {
        if bytes.len() < Self::WIRE_LEN {
            return Err(DecodeError::TruncatedKey { actual: bytes.len() });
        }

        let raw_kind = u16::from_le_bytes([bytes[0], bytes[1]]);
        let kind =
            DutyKind::from_wire(raw_kind).ok_or(DecodeError::UnknownDutyKind(raw_kind))?;
        let day = u16::from_le_bytes([bytes[2], bytes[3]]);
        let year = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        Ok(SlotKey { kind, day, year })
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/day {}/{}", self.kind, self.day, self.year)
    }
}

/// The person assigned to a slot, stored as UTF-16 code units.
///
/// An empty name means the slot is unassigned. The lossy [`fmt::Display`]
/// rendering replaces any code unit of 128 or above with `?` so the name
/// is safe for plain log output; the stored value is never altered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssigneeName(Vec<u16>);

impl AssigneeName {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn from_code_units(units: Vec<u16>) -> Self {
        Self(units)
    }

    pub fn code_units(&self) -> &[u16] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends the name's code units plus the zero terminator.
    pub fn encode(&self, out: &mut Vec<u8>) {
        for unit in &self.0 {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out.extend_from_slice(&0u16.to_le_bytes());
    }

    /// Reads code units from `bytes` up to the zero terminator.
    pub fn decode(bytes: &[u8]) -> Result<AssigneeName, DecodeError> {
        let mut units = Vec::new();
        let mut chunks = bytes.chunks_exact(2);

        for chunk in &mut chunks {
            let unit = u16::from_le_bytes([chunk[0], chunk[1]]);
            if unit == 0 {
                return Ok(AssigneeName(units));
            }
            units.push(unit);
        }

        Err(DecodeError::UnterminatedName)
    }
}

impl From<&str> for AssigneeName {
    fn from(s: &str) -> Self {
        Self(s.encode_utf16().collect())
    }
}

impl fmt::Display for AssigneeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &unit in &self.0 {
            let c = if unit < 128 { unit as u8 as char } else { '?' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

/// Why a complete frame could not be interpreted as a message.
///
/// Decode failures never close the connection; the offending frame is
/// logged and dropped and the stream stays aligned on frame boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnknownTag(u32),
    WrongPayloadLength { tag: u32, expected: usize, actual: usize },
    PayloadTooShort { tag: u32, minimum: usize, actual: usize },
    UnknownDutyKind(u16),
    TruncatedKey { actual: usize },
    UnterminatedName,
    UnterminatedCredential,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnknownTag(tag) => write!(f, "unknown message tag {}", tag),
            DecodeError::WrongPayloadLength { tag, expected, actual } => write!(
                f,
                "tag {} expects a {} byte payload, got {}",
                tag, expected, actual
            ),
            DecodeError::PayloadTooShort { tag, minimum, actual } => write!(
                f,
                "tag {} expects at least {} payload bytes, got {}",
                tag, minimum, actual
            ),
            DecodeError::UnknownDutyKind(raw) => write!(f, "unknown duty kind {}", raw),
            DecodeError::TruncatedKey { actual } => {
                write!(f, "slot key truncated at {} bytes", actual)
            }
            DecodeError::UnterminatedName => write!(f, "assignee name missing zero terminator"),
            DecodeError::UnterminatedCredential => {
                write!(f, "credential missing NUL terminator")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// One complete protocol message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(tag: u32, payload: Vec<u8>) -> Self {
        Self { tag, payload }
    }

    /// Serializes header plus payload into a single buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&self.tag.to_le_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Reads one complete frame.
    ///
    /// Returns `Ok(None)` when the peer closed the connection at a frame
    /// boundary. A declared length above [`MAX_PAYLOAD_LEN`] and an EOF in
    /// the middle of a frame both surface as errors; either way the
    /// connection is done.
    pub async fn read_from<R>(reader: &mut R) -> io::Result<Option<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let tag = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if len > MAX_PAYLOAD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("declared payload length {} exceeds limit", len),
            ));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;

        Ok(Some(Frame { tag, payload }))
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.to_bytes()).await
    }
}

/// Requests a client may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Credential bytes, compared byte-exact against [`SHARED_CREDENTIAL`].
    Login { credential: Vec<u8> },
    GetAssignment { key: SlotKey },
    SetAssignment { key: SlotKey, name: AssigneeName },
}

impl ClientMessage {
    pub fn encode(&self) -> Frame {
        match self {
            ClientMessage::Login { credential } => {
                let mut payload = credential.clone();
                payload.push(0);
                Frame::new(tag::LOGIN, payload)
            }
            ClientMessage::GetAssignment { key } => {
                let mut payload = Vec::with_capacity(SlotKey::WIRE_LEN);
                key.encode(&mut payload);
                Frame::new(tag::GET_ASSIGNMENT, payload)
            }
            ClientMessage::SetAssignment { key, name } => {
                let mut payload = Vec::with_capacity(SlotKey::WIRE_LEN + 2);
                key.encode(&mut payload);
                name.encode(&mut payload);
                Frame::new(tag::SET_ASSIGNMENT, payload)
            }
        }
    }

    pub fn decode(frame: &Frame) -> Result<ClientMessage, DecodeError> {
        match frame.tag {
            tag::LOGIN => {
                let terminator = frame
                    .payload
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or(DecodeError::UnterminatedCredential)?;
                Ok(ClientMessage::Login {
                    credential: frame.payload[..terminator].to_vec(),
                })
            }
            tag::GET_ASSIGNMENT => {
                // Exact size only: a key and nothing else.
                if frame.payload.len() != SlotKey::WIRE_LEN {
                    return Err(DecodeError::WrongPayloadLength {
                        tag: frame.tag,
                        expected: SlotKey::WIRE_LEN,
                        actual: frame.payload.len(),
                    });
                }
                Ok(ClientMessage::GetAssignment {
                    key: SlotKey::decode(&frame.payload)?,
                })
            }
            tag::SET_ASSIGNMENT => {
                // Must carry at least the name terminator after the key.
                if frame.payload.len() <= SlotKey::WIRE_LEN {
                    return Err(DecodeError::PayloadTooShort {
                        tag: frame.tag,
                        minimum: SlotKey::WIRE_LEN + 2,
                        actual: frame.payload.len(),
                    });
                }
                let key = SlotKey::decode(&frame.payload)?;
                let name = AssigneeName::decode(&frame.payload[SlotKey::WIRE_LEN..])?;
                Ok(ClientMessage::SetAssignment { key, name })
            }
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}

/// Replies and notifications the server sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    LoginResponse { accepted: bool },
    /// Direct reply to a get request, and the broadcast payload after a
    /// successful set.
    AssignmentUpdate { key: SlotKey, name: AssigneeName },
}

impl ServerMessage {
    pub fn encode(&self) -> Frame {
        match self {
            ServerMessage::LoginResponse { accepted } => {
                Frame::new(tag::LOGIN_RESPONSE, vec![u8::from(*accepted)])
            }
            ServerMessage::AssignmentUpdate { key, name } => {
                let mut payload = Vec::with_capacity(SlotKey::WIRE_LEN + 2);
                key.encode(&mut payload);
                name.encode(&mut payload);
                Frame::new(tag::ASSIGNMENT_UPDATE, payload)
            }
        }
    }

    pub fn decode(frame: &Frame) -> Result<ServerMessage, DecodeError> {
        match frame.tag {
            tag::LOGIN_RESPONSE => {
                if frame.payload.len() != 1 {
                    return Err(DecodeError::WrongPayloadLength {
                        tag: frame.tag,
                        expected: 1,
                        actual: frame.payload.len(),
                    });
                }
                Ok(ServerMessage::LoginResponse {
                    accepted: frame.payload[0] != 0,
                })
            }
            tag::ASSIGNMENT_UPDATE => {
                if frame.payload.len() <= SlotKey::WIRE_LEN {
                    return Err(DecodeError::PayloadTooShort {
                        tag: frame.tag,
                        minimum: SlotKey::WIRE_LEN + 2,
                        actual: frame.payload.len(),
                    });
                }
                let key = SlotKey::decode(&frame.payload)?;
                let name = AssigneeName::decode(&frame.payload[SlotKey::WIRE_LEN..])?;
                Ok(ServerMessage::AssignmentUpdate { key, name })
            }
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}

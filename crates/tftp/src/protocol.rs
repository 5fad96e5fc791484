//! TFTP wire format
//!
//! Everything on the wire is one of the five packet kinds defined in
//! RFC 1350. Each packet begins with a two-byte big-endian opcode; the
//! rest of the layout depends on the kind:
//!
//! ```text
//! RRQ/WRQ | opcode | filename | 0 | mode | 0 |
//! DATA    | opcode | block# | up to 512 payload bytes |
//! ACK     | opcode | block# |
//! ERROR   | opcode | errcode | message | 0 |
//! ```
//!
//! Packets are value objects: built, serialized with [`Packet::to_bytes`]
//! right before a send, and reconstructed with [`Packet::from_bytes`] right
//! after a receive. Nothing here touches sockets or files.

use std::fmt;

use thiserror::Error;

/// Fixed data block size. A DATA payload shorter than this ends a transfer;
/// a payload of exactly this length never does.
pub const BLOCK_SIZE: usize = 512;

/// Largest possible packet: a full DATA block plus its 4-byte header.
/// Bounds every receive buffer in the crate.
pub const MAX_PACKET_SIZE: usize = 4 + BLOCK_SIZE;

/// TFTP opcodes, the first two bytes of every packet.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Read request: the client wants a file from us.
    Rrq = 1,
    /// Write request: the client wants to store a file with us.
    Wrq = 2,
    /// One block of file content.
    Data = 3,
    /// Acknowledgment of a DATA block (or of a WRQ, as ACK 0).
    Ack = 4,
    /// Terminal error report. Never acknowledged, never retransmitted.
    Error = 5,
}

impl Opcode {
    /// Convert a wire value to an opcode.
    ///
    /// # Examples
    /// ```
    /// use tftp::Opcode;
    ///
    /// assert_eq!(Opcode::from_u16(1), Some(Opcode::Rrq));
    /// assert_eq!(Opcode::from_u16(9), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Rrq),
            2 => Some(Self::Wrq),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    /// The wire value of this opcode.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Conventional short name, as it appears in logs.
    ///
    /// # Examples
    /// ```
    /// use tftp::Opcode;
    ///
    /// assert_eq!(Opcode::Rrq.name(), "RRQ");
    /// assert_eq!(Opcode::Data.name(), "DATA");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            Self::Rrq => "RRQ",
            Self::Wrq => "WRQ",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
        }
    }
}

impl From<Opcode> for u16 {
    fn from(opcode: Opcode) -> Self {
        opcode.as_u16()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP error codes, as carried in ERROR packets (RFC 1350 table).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Code 0: not defined, see the error message.
    NotDefined = 0,
    /// Code 1: the requested file does not exist.
    FileNotFound = 1,
    /// Code 2: the request reaches outside what the server will serve.
    AccessViolation = 2,
    /// Code 3: disk full or allocation exceeded.
    DiskFull = 3,
    /// Code 4: the operation is unsupported or arrived out of sequence.
    IllegalOperation = 4,
    /// Code 5: packet from an unexpected transfer ID (address/port pair).
    UnknownTransferId = 5,
    /// Code 6: refusing to overwrite an existing file.
    FileAlreadyExists = 6,
    /// Code 7: no such user (mail mode relic, unused here).
    NoSuchUser = 7,
}

impl ErrorCode {
    /// Convert a wire value to an error code.
    ///
    /// # Examples
    /// ```
    /// use tftp::ErrorCode;
    ///
    /// assert_eq!(ErrorCode::from_u16(1), Some(ErrorCode::FileNotFound));
    /// assert_eq!(ErrorCode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            _ => None,
        }
    }

    /// The wire value of this error code.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Default human-readable message for this code.
    ///
    /// # Examples
    /// ```
    /// use tftp::ErrorCode;
    ///
    /// assert_eq!(ErrorCode::FileNotFound.default_message(), "File not found");
    /// ```
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// Why a datagram could not be decoded into a [`Packet`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than the packet kind's fixed header requires.
    #[error("packet truncated")]
    Truncated,
    /// The first two bytes held a value outside the five RFC 1350 opcodes.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    /// Structurally invalid contents (missing terminator, bad text,
    /// oversized payload).
    #[error("malformed packet: {0}")]
    MalformedRequest(&'static str),
}

/// One TFTP packet, decoded. The variants map one-to-one onto the five
/// wire layouts in the module docs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Read request. The mode string is carried for logging but does not
    /// change behavior; transfers are always byte-for-byte.
    Rrq { filename: String, mode: String },
    /// Write request. Mode handled as for [`Packet::Rrq`].
    Wrq { filename: String, mode: String },
    /// One block of file content, numbered from 1.
    Data { block: u16, data: Vec<u8> },
    /// Acknowledgment of the DATA block with this number (0 acknowledges
    /// a write request itself).
    Ack(u16),
    /// Error report. The code is kept as its raw wire value; known values
    /// are named by [`ErrorCode`].
    Error { code: u16, message: String },
}

impl Packet {
    /// Serialize for the wire.
    ///
    /// # Examples
    /// ```
    /// use tftp::Packet;
    ///
    /// let bytes = Packet::Ack(7).to_bytes();
    /// assert_eq!(bytes, [0, 4, 0, 7]);
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::Rrq { filename, mode } => encode_request(Opcode::Rrq, filename, mode),
            Packet::Wrq { filename, mode } => encode_request(Opcode::Wrq, filename, mode),
            Packet::Data { block, data } => {
                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend_from_slice(&Opcode::Data.as_u16().to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
                buf
            }
            Packet::Ack(block) => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&Opcode::Ack.as_u16().to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf
            }
            Packet::Error { code, message } => {
                let mut buf = Vec::with_capacity(5 + message.len());
                buf.extend_from_slice(&Opcode::Error.as_u16().to_be_bytes());
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
                buf
            }
        }
    }

    /// Parse one received datagram.
    ///
    /// # Examples
    /// ```
    /// use tftp::{DecodeError, Packet};
    ///
    /// let packet = Packet::from_bytes(&[0, 4, 0, 7]).unwrap();
    /// assert_eq!(packet, Packet::Ack(7));
    ///
    /// assert_eq!(Packet::from_bytes(&[0, 9]), Err(DecodeError::UnknownOpcode(9)));
    /// ```
    pub fn from_bytes(buf: &[u8]) -> Result<Packet, DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::Truncated);
        }

        let raw = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode = Opcode::from_u16(raw).ok_or(DecodeError::UnknownOpcode(raw))?;

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let (filename, rest) = take_string(&buf[2..], "filename")?;
                let (mode, _) = take_string(rest, "mode")?;
                if opcode == Opcode::Rrq {
                    Ok(Packet::Rrq { filename, mode })
                } else {
                    Ok(Packet::Wrq { filename, mode })
                }
            }
            Opcode::Data => {
                if buf.len() < 4 {
                    return Err(DecodeError::Truncated);
                }
                let data = buf[4..].to_vec();
                if data.len() > BLOCK_SIZE {
                    return Err(DecodeError::MalformedRequest("oversized DATA payload"));
                }
                Ok(Packet::Data {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                    data,
                })
            }
            Opcode::Ack => {
                if buf.len() < 4 {
                    return Err(DecodeError::Truncated);
                }
                Ok(Packet::Ack(u16::from_be_bytes([buf[2], buf[3]])))
            }
            Opcode::Error => {
                if buf.len() < 4 {
                    return Err(DecodeError::Truncated);
                }
                let code = u16::from_be_bytes([buf[2], buf[3]]);
                // Lenient on the message: take up to the terminator if there
                // is one, the whole remainder if not.
                let tail = &buf[4..];
                let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
                let message = String::from_utf8_lossy(&tail[..end]).into_owned();
                Ok(Packet::Error { code, message })
            }
        }
    }

    /// The opcode this packet carries.
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq { .. } => Opcode::Rrq,
            Packet::Wrq { .. } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack(_) => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
        }
    }
}

fn encode_request(opcode: Opcode, filename: &str, mode: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + filename.len() + mode.len());
    buf.extend_from_slice(&opcode.as_u16().to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0);
    buf.extend_from_slice(mode.as_bytes());
    buf.push(0);
    buf
}

/// Split one NUL-terminated UTF-8 string off the front of `buf`.
fn take_string<'a>(
    buf: &'a [u8],
    field: &'static str,
) -> Result<(String, &'a [u8]), DecodeError> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::MalformedRequest(field))?;
    let text = std::str::from_utf8(&buf[..nul])
        .map_err(|_| DecodeError::MalformedRequest(field))?
        .to_string();
    Ok((text, &buf[nul + 1..]))
}

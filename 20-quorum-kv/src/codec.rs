//! Fixed-width binary records exchanged between coordinators and servers.
//!
//! Requests are 7 bytes, responses 5 bytes, every integer big-endian:
//!
//! ```text
//! request:  message_id:u16 | op:u8     | key:u16 | value:u16
//! response: message_id:u16 | status:u8 | data:u16
//! ```
//!
//! A single socket read may carry several records back to back. Splitting a
//! read into records is [`decode_batch`]'s job; it rejects any buffer whose
//! length is not an exact multiple of the record size so a torn read never
//! shifts the alignment of later reads.

use std::fmt;

use thiserror::Error;

/// Correlates a request with its responses. Unique per node, see
/// [`crate::client::pending::MessageIds`].
pub type MessageId = u16;

pub const REQUEST_LEN: usize = 7;
pub const RESPONSE_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("malformed record: {len} bytes is not a multiple of {record_len}")]
    MalformedRecord { len: usize, record_len: usize },
    #[error("unknown op code {0:#04x}")]
    UnknownOpCode(u8),
    #[error("unknown status code {0:#04x}")]
    UnknownStatus(u8),
}

/// Request operations. COMMIT and ABORT reuse the ACK and CANCEL tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Get = 0x00,
    Put = 0x01,
    End = 0x02,
    Commit = 0x06,
    Abort = 0x18,
}

impl TryFrom<u8> for OpCode {
    type Error = WireError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x00 => Ok(OpCode::Get),
            0x01 => Ok(OpCode::Put),
            0x02 => Ok(OpCode::End),
            0x06 => Ok(OpCode::Commit),
            0x18 => Ok(OpCode::Abort),
            other => Err(WireError::UnknownOpCode(other)),
        }
    }
}

/// Server verdicts. `Empty` doubles as "slot busy" for GETs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Empty = 0x00,
    Ack = 0x06,
    Cancel = 0x18,
}

impl TryFrom<u8> for Status {
    type Error = WireError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x00 => Ok(Status::Empty),
            0x06 => Ok(Status::Ack),
            0x18 => Ok(Status::Cancel),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

/// A record type with a fixed encoded length.
pub trait Record: Sized {
    const LEN: usize;

    /// Decodes exactly one record. `bytes` must be `Self::LEN` long.
    fn decode(bytes: &[u8]) -> Result<Self, WireError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub id: MessageId,
    pub op: OpCode,
    pub key: u16,
    pub value: u16,
}

impl Request {
    pub fn get(id: MessageId, key: u16) -> Self {
        Self { id, op: OpCode::Get, key, value: 0 }
    }

    pub fn put(id: MessageId, key: u16, value: u16) -> Self {
        Self { id, op: OpCode::Put, key, value }
    }

    pub fn commit(id: MessageId, key: u16, value: u16) -> Self {
        Self { id, op: OpCode::Commit, key, value }
    }

    pub fn abort(id: MessageId, key: u16, value: u16) -> Self {
        Self { id, op: OpCode::Abort, key, value }
    }

    /// END carries no payload; the server only counts it.
    pub fn end() -> Self {
        Self { id: 0, op: OpCode::End, key: 0, value: 0 }
    }

    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let [id_hi, id_lo] = self.id.to_be_bytes();
        let [key_hi, key_lo] = self.key.to_be_bytes();
        let [value_hi, value_lo] = self.value.to_be_bytes();
        [id_hi, id_lo, self.op as u8, key_hi, key_lo, value_hi, value_lo]
    }
}

impl Record for Request {
    const LEN: usize = REQUEST_LEN;

    fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let bytes: &[u8; REQUEST_LEN] = bytes.try_into().map_err(|_| WireError::MalformedRecord {
            len: bytes.len(),
            record_len: REQUEST_LEN,
        })?;
        Ok(Self {
            id: u16::from_be_bytes([bytes[0], bytes[1]]),
            op: OpCode::try_from(bytes[2])?,
            key: u16::from_be_bytes([bytes[3], bytes[4]]),
            value: u16::from_be_bytes([bytes[5], bytes[6]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub id: MessageId,
    pub status: Status,
    pub data: u16,
}

impl Response {
    pub fn ack(id: MessageId, data: u16) -> Self {
        Self { id, status: Status::Ack, data }
    }

    pub fn empty(id: MessageId) -> Self {
        Self { id, status: Status::Empty, data: 0 }
    }

    pub fn cancel(id: MessageId) -> Self {
        Self { id, status: Status::Cancel, data: 0 }
    }

    pub fn encode(&self) -> [u8; RESPONSE_LEN] {
        let [id_hi, id_lo] = self.id.to_be_bytes();
        let [data_hi, data_lo] = self.data.to_be_bytes();
        [id_hi, id_lo, self.status as u8, data_hi, data_lo]
    }
}

impl Record for Response {
    const LEN: usize = RESPONSE_LEN;

    fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let bytes: &[u8; RESPONSE_LEN] =
            bytes.try_into().map_err(|_| WireError::MalformedRecord {
                len: bytes.len(),
                record_len: RESPONSE_LEN,
            })?;
        Ok(Self {
            id: u16::from_be_bytes([bytes[0], bytes[1]]),
            status: Status::try_from(bytes[2])?,
            data: u16::from_be_bytes([bytes[3], bytes[4]]),
        })
    }
}

/// Splits one socket read into records.
///
/// The whole buffer is rejected with [`WireError::MalformedRecord`] unless its
/// length is an exact multiple of `T::LEN`. Individual records can still fail
/// with an unknown tag, which callers drop without touching their neighbours.
pub fn decode_batch<'a, T: Record + 'a>(
    buf: &'a [u8],
) -> Result<impl Iterator<Item = Result<T, WireError>> + 'a, WireError> {
    if buf.len() % T::LEN != 0 {
        return Err(WireError::MalformedRecord {
            len: buf.len(),
            record_len: T::LEN,
        });
    }
    Ok(buf.chunks_exact(T::LEN).map(T::decode))
}

/// Space separated hex rendering used by the per-record trace logs.
pub struct Hex<'a>(pub &'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

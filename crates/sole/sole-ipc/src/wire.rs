//! Frame and handshake encoding.
//!
//! All integers are big-endian.
//!
//! ```text
//! frame      = u64 length ‖ body[length]
//! init body  = u32 identity_len ‖ identity[identity_len]
//!            ‖ u8 connection_kind ‖ u32 instance_id
//!            ‖ u16 checksum            (over every preceding body byte)
//! ack        = one byte, sent after each consumed header and body
//! ```
//!
//! An `identity_len` of `0xFFFF_FFFF` denotes an absent identity and decodes
//! as empty.

use sole_core::checksum16;

/// Acknowledgement byte. Receivers must not depend on its value.
pub const ACK: u8 = b'\n';

/// Size of the length prefix in front of every frame body.
pub const HEADER_LEN: usize = 8;

/// Upper bound for an init body. Anything longer is not a handshake.
pub const MAX_INIT_BODY_LEN: u64 = 4096;

const NULL_BYTES_LEN: u32 = u32::MAX;
const CHECKSUM_LEN: usize = 2;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Invalid = 0,
    NewInstance = 1,
    SecondaryInstance = 2,
    Reconnect = 3,
}

impl ConnectionKind {
    /// Unknown values map to [`ConnectionKind::Invalid`].
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionKind::NewInstance,
            2 => ConnectionKind::SecondaryInstance,
            3 => ConnectionKind::Reconnect,
            _ => ConnectionKind::Invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("init message truncated")]
    Truncated,

    #[error("init message has {0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("init message checksum mismatch (stored {stored:#06x}, computed {computed:#06x})")]
    ChecksumMismatch { stored: u16, computed: u16 },
}

#[inline]
pub fn encode_header(len: u64) -> [u8; HEADER_LEN] {
    len.to_be_bytes()
}

#[inline]
pub fn decode_header(bytes: &[u8; HEADER_LEN]) -> u64 {
    u64::from_be_bytes(*bytes)
}

/// First message on every connection: who the peer thinks it is talking to,
/// and who the peer is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitMessage {
    pub server_identity: Vec<u8>,
    pub kind: ConnectionKind,
    pub instance_id: u32,
}

impl InitMessage {
    /// Encodes the body, checksum included. The frame header is not part of it.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.server_identity.len() + 1 + 4 + CHECKSUM_LEN);
        out.extend_from_slice(&(self.server_identity.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.server_identity);
        out.push(self.kind as u8);
        out.extend_from_slice(&self.instance_id.to_be_bytes());
        let sum = checksum16(&out);
        out.extend_from_slice(&sum.to_be_bytes());
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut cursor = Cursor { buf: body, pos: 0 };

        let identity_len = cursor.u32()?;
        let server_identity = if identity_len == NULL_BYTES_LEN {
            Vec::new()
        } else {
            cursor.take(identity_len as usize)?.to_vec()
        };
        let kind = ConnectionKind::from_u8(cursor.u8()?);
        let instance_id = cursor.u32()?;

        let covered = cursor.pos;
        let stored = cursor.u16()?;
        if cursor.remaining() != 0 {
            return Err(WireError::TrailingBytes(cursor.remaining()));
        }

        let computed = checksum16(&body[..covered]);
        if stored != computed {
            return Err(WireError::ChecksumMismatch { stored, computed });
        }

        Ok(Self {
            server_identity,
            kind,
            instance_id,
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::Truncated)?;
        let out = self.buf.get(self.pos..end).ok_or(WireError::Truncated)?;
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

//! Wire payloads and frame envelopes.
//!
//! All integers are little-endian. Decoding works on a cursor with an
//! explicit remaining-length budget and fails with `CoordError::Decode`
//! instead of reading past the end.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{CoordError, ErrorCode};
use super::types::HandleId;

fn ensure(buf: &impl Buf, need: usize, field: &'static str) -> Result<(), CoordError> {
    if buf.remaining() < need {
        return Err(CoordError::Decode(format!(
            "truncated {field}: need {need} bytes, {} remaining",
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut impl Buf, field: &'static str) -> Result<u8, CoordError> {
    ensure(buf, 1, field)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u32(buf: &mut impl Buf, field: &'static str) -> Result<u32, CoordError> {
    ensure(buf, 4, field)?;
    Ok(buf.get_u32_le())
}

pub(crate) fn get_u64(buf: &mut impl Buf, field: &'static str) -> Result<u64, CoordError> {
    ensure(buf, 8, field)?;
    Ok(buf.get_u64_le())
}

/// Lock acquisition payload: `handle u64 | mode u32 | try_lock u8`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockRequest {
    pub handle: HandleId,
    /// Raw mode bitmask; validated by the coordinator.
    pub mode: u32,
    pub try_lock: bool,
}

impl LockRequest {
    pub const ENCODED_LEN: usize = 8 + 4 + 1;

    pub fn decode(mut buf: &[u8]) -> Result<Self, CoordError> {
        let handle = get_u64(&mut buf, "lock handle")?;
        let mode = get_u32(&mut buf, "lock mode")?;
        let try_lock = get_u8(&mut buf, "lock try flag")? != 0;
        Ok(Self {
            handle,
            mode,
            try_lock,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(Self::ENCODED_LEN);
        out.put_u64_le(self.handle);
        out.put_u32_le(self.mode);
        out.put_u8(u8::from(self.try_lock));
        out.freeze()
    }
}

/// Body of a `GRANTED` lock response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockGrant {
    pub generation: u64,
}

impl LockGrant {
    pub fn decode(mut buf: &[u8]) -> Result<Self, CoordError> {
        Ok(Self {
            generation: get_u64(&mut buf, "lock generation")?,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(8);
        out.put_u64_le(self.generation);
        out.freeze()
    }
}

/// Request envelope: `request_id u32 | command u8 | body`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestFrame {
    pub request_id: u32,
    pub command: u8,
    pub body: Bytes,
}

impl RequestFrame {
    pub const HEADER_LEN: usize = 4 + 1;

    pub fn decode(mut frame: Bytes) -> Result<Self, CoordError> {
        let request_id = get_u32(&mut frame, "request id")?;
        let command = get_u8(&mut frame, "command")?;
        Ok(Self {
            request_id,
            command,
            body: frame,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(Self::HEADER_LEN + self.body.len());
        out.put_u32_le(self.request_id);
        out.put_u8(self.command);
        out.put_slice(&self.body);
        out.freeze()
    }
}

/// Response envelope: `request_id u32 | status u32 | body`.
///
/// Statuses above the lock status range are error codes and carry a UTF-8
/// message as body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseFrame {
    pub request_id: u32,
    pub status: u32,
    pub body: Bytes,
}

impl ResponseFrame {
    pub const HEADER_LEN: usize = 4 + 4;

    pub fn error(request_id: u32, code: u32, message: &str) -> Self {
        Self {
            request_id,
            status: code,
            body: Bytes::copy_from_slice(message.as_bytes()),
        }
    }

    pub fn decode(mut frame: Bytes) -> Result<Self, CoordError> {
        let request_id = get_u32(&mut frame, "request id")?;
        let status = get_u32(&mut frame, "status")?;
        Ok(Self {
            request_id,
            status,
            body: frame,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(Self::HEADER_LEN + self.body.len());
        out.put_u32_le(self.request_id);
        out.put_u32_le(self.status);
        out.put_slice(&self.body);
        out.freeze()
    }

    pub fn is_error(&self) -> bool {
        ErrorCode::is_error_status(self.status)
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        if self.is_error() {
            ErrorCode::from_code(self.status)
        } else {
            None
        }
    }

    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

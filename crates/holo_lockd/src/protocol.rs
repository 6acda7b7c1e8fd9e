//! Lock server command set.
//!
//! Commands travel inside `RequestFrame`s; the command byte selects the
//! variant and the frame body carries its arguments (little-endian integers,
//! strings as `u16` length + UTF-8). Lock payloads are passed through raw so
//! the coordinator can report decode failures on the request's own sink.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use holo_coord::coord::{CoordError, HandleId, SessionId};

/// Status of a successful non-lock reply. Lock replies use `LockStatus` codes.
pub const STATUS_OK: u32 = 0;

/// Longest handle name the string encoding can carry.
pub const MAX_NAME_LEN: usize = u16::MAX as usize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Start a new session bound to this connection.
    OpenSession,
    /// Rebind an existing, still-leased session to this connection.
    AttachSession { session: SessionId },
    KeepAlive,
    Open { name: String },
    Close { handle: HandleId },
    /// Raw `LockRequest` payload.
    Lock { payload: Bytes },
    Release { handle: HandleId },
    CancelLock { handle: HandleId },
    CloseSession,
    Stats,
}

impl Command {
    pub const OPEN_SESSION: u8 = 1;
    pub const ATTACH_SESSION: u8 = 2;
    pub const KEEP_ALIVE: u8 = 3;
    pub const OPEN: u8 = 4;
    pub const CLOSE: u8 = 5;
    pub const LOCK: u8 = 6;
    pub const RELEASE: u8 = 7;
    pub const CANCEL_LOCK: u8 = 8;
    pub const CLOSE_SESSION: u8 = 9;
    pub const STATS: u8 = 10;

    pub fn code(&self) -> u8 {
        match self {
            Command::OpenSession => Self::OPEN_SESSION,
            Command::AttachSession { .. } => Self::ATTACH_SESSION,
            Command::KeepAlive => Self::KEEP_ALIVE,
            Command::Open { .. } => Self::OPEN,
            Command::Close { .. } => Self::CLOSE,
            Command::Lock { .. } => Self::LOCK,
            Command::Release { .. } => Self::RELEASE,
            Command::CancelLock { .. } => Self::CANCEL_LOCK,
            Command::CloseSession => Self::CLOSE_SESSION,
            Command::Stats => Self::STATS,
        }
    }

    /// Whether the command needs a session bound to the connection.
    pub fn needs_session(&self) -> bool {
        !matches!(
            self,
            Command::OpenSession | Command::AttachSession { .. } | Command::Stats
        )
    }

    /// Parse a command body. `Ok(None)` means the code is not a known command.
    pub fn decode(code: u8, mut body: Bytes) -> Result<Option<Self>, CoordError> {
        let command = match code {
            Self::OPEN_SESSION => Command::OpenSession,
            Self::ATTACH_SESSION => Command::AttachSession {
                session: get_u64(&mut body, "session id")?,
            },
            Self::KEEP_ALIVE => Command::KeepAlive,
            Self::OPEN => Command::Open {
                name: get_string(&mut body, "handle name")?,
            },
            Self::CLOSE => Command::Close {
                handle: get_u64(&mut body, "handle")?,
            },
            Self::LOCK => Command::Lock { payload: body },
            Self::RELEASE => Command::Release {
                handle: get_u64(&mut body, "handle")?,
            },
            Self::CANCEL_LOCK => Command::CancelLock {
                handle: get_u64(&mut body, "handle")?,
            },
            Self::CLOSE_SESSION => Command::CloseSession,
            Self::STATS => Command::Stats,
            _ => return Ok(None),
        };
        Ok(Some(command))
    }

    pub fn encode_body(&self) -> Bytes {
        let mut out = BytesMut::new();
        match self {
            Command::AttachSession { session } => out.put_u64_le(*session),
            Command::Open { name } => put_string(&mut out, name),
            Command::Close { handle }
            | Command::Release { handle }
            | Command::CancelLock { handle } => out.put_u64_le(*handle),
            Command::Lock { payload } => out.put_slice(payload),
            Command::OpenSession
            | Command::KeepAlive
            | Command::CloseSession
            | Command::Stats => {}
        }
        out.freeze()
    }
}

/// Body of the `OpenSession` reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionGrant {
    pub session: SessionId,
    pub lease_ttl_ms: u64,
}

impl SessionGrant {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(16);
        out.put_u64_le(self.session);
        out.put_u64_le(self.lease_ttl_ms);
        out.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self, CoordError> {
        Ok(Self {
            session: get_u64(&mut body, "session id")?,
            lease_ttl_ms: get_u64(&mut body, "lease ttl")?,
        })
    }
}

pub fn encode_u64(value: u64) -> Bytes {
    let mut out = BytesMut::with_capacity(8);
    out.put_u64_le(value);
    out.freeze()
}

pub fn decode_u64(mut body: Bytes, field: &'static str) -> Result<u64, CoordError> {
    get_u64(&mut body, field)
}

fn truncated(field: &str, need: usize, have: usize) -> CoordError {
    CoordError::Decode(format!(
        "truncated {field}: need {need} bytes, {have} remaining"
    ))
}

fn get_u64(body: &mut Bytes, field: &'static str) -> Result<u64, CoordError> {
    if body.remaining() < 8 {
        return Err(truncated(field, 8, body.remaining()));
    }
    Ok(body.get_u64_le())
}

fn get_string(body: &mut Bytes, field: &'static str) -> Result<String, CoordError> {
    if body.remaining() < 2 {
        return Err(truncated(field, 2, body.remaining()));
    }
    let len = usize::from(body.get_u16_le());
    if body.remaining() < len {
        return Err(truncated(field, len, body.remaining()));
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|err| CoordError::Decode(format!("{field} is not utf-8: {err}")))
}

fn put_string(out: &mut BytesMut, value: &str) {
    // Callers check MAX_NAME_LEN; anything longer is cut at a char boundary.
    let mut end = value.len().min(MAX_NAME_LEN);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    out.put_u16_le(end as u16);
    out.put_slice(&value.as_bytes()[..end]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_survive_encode_and_decode() {
        let commands = [
            Command::OpenSession,
            Command::AttachSession { session: 42 },
            Command::Open {
                name: "/tables/users".to_string(),
            },
            Command::Release { handle: 7 },
            Command::Lock {
                payload: Bytes::from_static(&[1, 2, 3]),
            },
        ];
        for command in commands {
            let decoded = Command::decode(command.code(), command.encode_body())
                .unwrap()
                .unwrap();
            assert_eq!(decoded, command);
        }
    }

    #[test]
    fn unknown_code_and_short_body_are_distinguished() {
        assert_eq!(Command::decode(0xEE, Bytes::new()), Ok(None));
        assert!(matches!(
            Command::decode(Command::RELEASE, Bytes::from_static(&[1, 2])),
            Err(CoordError::Decode(_))
        ));
        assert!(matches!(
            Command::decode(Command::OPEN, Bytes::from_static(&[9, 0, b'a'])),
            Err(CoordError::Decode(_))
        ));
    }

    #[test]
    fn session_commands_do_not_need_a_bound_session() {
        assert!(!Command::OpenSession.needs_session());
        assert!(!Command::AttachSession { session: 1 }.needs_session());
        assert!(Command::KeepAlive.needs_session());
        assert!(Command::Lock {
            payload: Bytes::new()
        }
        .needs_session());
    }
}

use thiserror::Error;

use super::types::{HandleId, SessionId};

/// Error taxonomy for the coordination core.
///
/// `LockDenied` and `Timeout` are expected outcomes the caller decides on;
/// `InvariantViolation` is a programming error that fails the operation but
/// never the process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("deadline elapsed")]
    Timeout,
    #[error("lock denied")]
    LockDenied,
    #[error("session {0} expired")]
    SessionExpired(SessionId),
    #[error("unknown handle {0}")]
    UnknownHandle(HandleId),
    #[error("bad lock mode {0:#x}")]
    BadMode(u32),
    #[error("handle {0} already locked or pending for this session")]
    AlreadyLocked(HandleId),
    #[error("handle {0} not locked by this session")]
    NotLocked(HandleId),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("reactor shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, CoordError>;

/// Stable numeric codes used on the wire for error responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Protocol,
    InvariantViolation,
    Timeout,
    LockDenied,
    SessionExpired,
    UnknownHandle,
    BadMode,
    AlreadyLocked,
    NotLocked,
    ConnectionClosed,
    Shutdown,
    UnknownCommand,
    Internal,
}

impl ErrorCode {
    /// Error codes live above the lock status range so a response status is
    /// unambiguous.
    const BASE: u32 = 0x100;

    pub const fn code(self) -> u32 {
        Self::BASE
            + match self {
                Self::Protocol => 1,
                Self::InvariantViolation => 2,
                Self::Timeout => 3,
                Self::LockDenied => 4,
                Self::SessionExpired => 5,
                Self::UnknownHandle => 6,
                Self::BadMode => 7,
                Self::AlreadyLocked => 8,
                Self::NotLocked => 9,
                Self::ConnectionClosed => 10,
                Self::Shutdown => 11,
                Self::UnknownCommand => 12,
                Self::Internal => 13,
            }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let all = [
            Self::Protocol,
            Self::InvariantViolation,
            Self::Timeout,
            Self::LockDenied,
            Self::SessionExpired,
            Self::UnknownHandle,
            Self::BadMode,
            Self::AlreadyLocked,
            Self::NotLocked,
            Self::ConnectionClosed,
            Self::Shutdown,
            Self::UnknownCommand,
            Self::Internal,
        ];
        all.into_iter().find(|c| c.code() == code)
    }

    pub fn is_error_status(status: u32) -> bool {
        status > Self::BASE
    }
}

impl CoordError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Decode(_) => ErrorCode::Protocol,
            Self::InvariantViolation(_) => ErrorCode::InvariantViolation,
            Self::Timeout => ErrorCode::Timeout,
            Self::LockDenied => ErrorCode::LockDenied,
            Self::SessionExpired(_) => ErrorCode::SessionExpired,
            Self::UnknownHandle(_) => ErrorCode::UnknownHandle,
            Self::BadMode(_) => ErrorCode::BadMode,
            Self::AlreadyLocked(_) => ErrorCode::AlreadyLocked,
            Self::NotLocked(_) => ErrorCode::NotLocked,
            Self::ConnectionClosed => ErrorCode::ConnectionClosed,
            Self::Shutdown => ErrorCode::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip_and_stay_above_status_range() {
        for err in [
            CoordError::Decode("short".into()),
            CoordError::Timeout,
            CoordError::SessionExpired(7),
            CoordError::BadMode(9),
        ] {
            let code = err.code();
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
            assert!(ErrorCode::is_error_status(code.code()));
        }
        assert!(!ErrorCode::is_error_status(4));
    }
}

//! `masterproto`: the binary protocol between the master orchestrator and
//! its fleet of child servers (auth, chat, world instances).
//!
//! Every message rides inside a `frameio` length-prefixed frame and starts
//! with an 8-byte header: byte 1 tags the subsystem, byte 3 selects the
//! message kind, the rest is reserved. Payloads follow immediately in
//! little-endian form. Strings are either fixed-width NUL-padded fields or
//! `u32`-length-prefixed byte runs, per message.

pub mod master;

mod cursor;

/// Wire header length, in bytes.
pub const HEADER_LEN: usize = 8;

/// Byte 0 of every header: marks an application-level message on the link.
pub const APP_TAG: u8 = 0x53;

/// Byte 1 of every header: the master subsystem tag.
pub const SUBSYS_MASTER: u8 = 0x4d;

pub fn header(kind: u8) -> [u8; HEADER_LEN] {
    [APP_TAG, SUBSYS_MASTER, 0, kind, 0, 0, 0, 0]
}

/// Validate the header of a full frame and return `(kind, payload)`.
pub fn split_header(frame: &[u8]) -> Result<(u8, &[u8]), WireError> {
    if frame.len() < HEADER_LEN {
        return Err(WireError::Short {
            need: HEADER_LEN,
            got: frame.len(),
        });
    }
    if frame[1] != SUBSYS_MASTER {
        return Err(WireError::BadSubsystem(frame[1]));
    }
    Ok((frame[3], &frame[HEADER_LEN..]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    Short { need: usize, got: usize },
    BadSubsystem(u8),
    UnknownKind(u8),
    Malformed(&'static str),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Short { need, got } => {
                write!(f, "truncated message: need {need} bytes, got {got}")
            }
            WireError::BadSubsystem(s) => write!(f, "wrong subsystem tag: 0x{s:02x}"),
            WireError::UnknownKind(k) => write!(f, "unknown message kind: 0x{k:02x}"),
            WireError::Malformed(s) => write!(f, "malformed message: {s}"),
        }
    }
}

impl std::error::Error for WireError {}

//! Control-channel wire codec.
//!
//! Every coordination message between the two sides is a fixed 3-byte
//! frame sent over the control link:
//!
//! ```text
//! +----------+---------------+-------------+
//! | msg kind | endpoint addr | block index |
//! +----------+---------------+-------------+
//! ```
//!
//! Frames longer than 3 bytes are accepted and the tail ignored, so future
//! protocol versions can extend the format. Frames shorter than 3 bytes are
//! malformed. Unknown kind values decode to [`ControlError::UnknownKind`]
//! and are ignored by the dispatcher for the same forward-compatibility
//! reason.

/// Size of an encoded control message.
pub const CONTROL_MSG_SIZE: usize = 3;

/// Kinds of control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgKind {
    /// A data buffer is ready in the sender's TX channel.
    Data = 0,
    /// The receiver no longer needs the named buffer; the owner may free it.
    ReleaseData = 1,
    /// Handshake offer. The named block holds a NUL-terminated endpoint name.
    Bound = 2,
    /// Handshake acknowledgment. Releases the name buffer and tells the
    /// initiator the endpoint is ready on the remote side.
    ReleaseBound = 3,
}

impl MsgKind {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(MsgKind::Data),
            1 => Some(MsgKind::ReleaseData),
            2 => Some(MsgKind::Bound),
            3 => Some(MsgKind::ReleaseBound),
            _ => None,
        }
    }
}

/// Decode failures for control frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    /// The frame is shorter than the fixed message size.
    #[error("control frame truncated: {len} bytes")]
    Truncated { len: usize },
    /// The kind byte is not one this protocol version understands.
    #[error("unknown control message kind {kind}")]
    UnknownKind { kind: u8 },
}

/// A decoded control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMsg {
    pub kind: MsgKind,
    /// Endpoint address, or 0 for [`MsgKind::ReleaseData`].
    pub endpoint: u8,
    /// Block index the message refers to.
    pub block: u8,
}

impl ControlMsg {
    pub fn new(kind: MsgKind, endpoint: u8, block: u8) -> Self {
        Self { kind, endpoint, block }
    }

    pub fn encode(&self) -> [u8; CONTROL_MSG_SIZE] {
        [self.kind as u8, self.endpoint, self.block]
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ControlError> {
        if frame.len() < CONTROL_MSG_SIZE {
            return Err(ControlError::Truncated { len: frame.len() });
        }
        let kind = MsgKind::from_raw(frame[0])
            .ok_or(ControlError::UnknownKind { kind: frame[0] })?;
        Ok(Self { kind, endpoint: frame[1], block: frame[2] })
    }
}

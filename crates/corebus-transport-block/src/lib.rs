//! corebus-transport-block: dynamic-buffer message transport between two
//! cores sharing memory.
//!
//! Two independently scheduled cores exchange variable-length messages
//! through a pair of shared-memory channels, coordinating over a narrow
//! fixed-size control link (see [`corebus_core::ControlLink`]). Each side
//! owns one channel for transmit; the other side only reads it and asks
//! for blocks to be released.
//!
//! # Shared memory organization
//!
//! One channel (TX or RX) is a control-link area followed by an array of
//! equally sized, aligned blocks. Buffers are allocated as runs of
//! contiguous blocks; the first block starts with the payload size.
//!
//! ```text
//! +-----------------+-----------------------------------------+
//! | control link    |              block array                |
//! +-----------------+-----------------------------------------+
//!                   /                                          \
//!                  +---------+---------+---------+-   -+---------+
//!                  | block 0 | block 1 | block 2 | ... | blk N-1 |
//!                  +---------+---------+---------+-   -+---------+
//!                     ___/                         \____
//!                    /                                  \
//!                    +------+------------------+---------+
//!                    | size | data[size] ...   | padding |
//!                    +------+------------------+---------+
//! ```
//!
//! The sender tracks its reserved blocks in a local bitmap and is the only
//! side that allocates or frees them; the receiver merely reports, over the
//! control link, that it no longer needs a buffer.
//!
//! # Endpoint bounding
//!
//! Applications address each other through named endpoints multiplexed
//! over the one link. Once the control link is bound, the initiator (the
//! side whose TX block array sits at the lower address) sends a `Bound`
//! message per registered endpoint, carrying the endpoint name in an
//! allocated buffer. The follower matches the name against its own
//! registrations on a dedicated worker thread, adopts the address the
//! initiator assigned, and answers with `ReleaseBound`, which both frees
//! the name buffer and completes the handshake on the initiator.
//!
//! # Concurrency
//!
//! Any number of application threads may use the façade concurrently. The
//! link's receive callback runs on a link-owned context and never blocks;
//! endpoint bounding is deferred to one worker thread so all bounding
//! state mutations are serialized without a table-wide lock. Only
//! [`BlockTransport::get_tx_buffer`] (and the internal allocation behind
//! [`Endpoint::send`]) can wait, and only when given a non-zero timeout.

#![forbid(unsafe_op_in_unsafe_fn)]

mod alloc;
mod bitpool;
mod buffer;
mod endpoint;
mod layout;
mod transport;
mod worker;

pub use buffer::{RxBuffer, TxBuffer};
pub use endpoint::{BindState, EndpointConfig, EndpointHandler, RebindState, MAX_ENDPOINTS};
pub use layout::{ChannelConfig, LinkConfig, BLOCK_HEADER_SIZE};
pub use transport::{BlockTransport, Endpoint};

pub use corebus_core::{CacheOps, Coherent, ControlLink, Error, LinkEvents, Result};

use std::time::Duration;

/// How long an allocation may wait for blocks to be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Fail with [`Error::NoMem`] instead of waiting.
    NoWait,
    /// Wait until blocks become available.
    Forever,
    /// Wait at most this long, then fail with [`Error::TimedOut`].
    After(Duration),
}

//! The control link seam.
//!
//! The link is the narrow, fixed-size message transport the block backend
//! coordinates over: a mailbox-backed ring on real hardware, an in-process
//! loopback in tests. The backend only relies on the contract below.

use std::sync::Arc;

use crate::error::Result;

/// The underlying fixed-size control-message transport.
///
/// Contract: messages are delivered whole and in order, and a single
/// `send` is never corrupted. The implementation decides which context
/// [`LinkEvents`] callbacks run on (interrupt handler, dedicated thread);
/// callers of `open` must assume it is not their own and that callbacks
/// may fire concurrently with their API calls.
pub trait ControlLink: Send + Sync {
    /// Attach event callbacks and start establishing the link.
    ///
    /// [`LinkEvents::bound`] fires once the remote side is reachable;
    /// until then, `send` may fail with [`crate::Error::LinkDown`].
    fn open(&self, events: Arc<dyn LinkEvents>) -> Result<()>;

    /// Send one control frame. Returns the number of bytes accepted,
    /// which is the whole frame on success.
    fn send(&self, frame: &[u8]) -> Result<usize>;
}

/// Callbacks a [`ControlLink`] implementation invokes.
///
/// Both callbacks run on a link-owned context and must not block.
pub trait LinkEvents: Send + Sync {
    /// The link finished its own handshake and can carry frames both ways.
    fn bound(&self);

    /// A whole control frame arrived from the remote side.
    fn received(&self, frame: &[u8]);
}

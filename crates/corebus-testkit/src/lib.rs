//! corebus-testkit: in-process harness for exercising corebus transports.
//!
//! Provides the pieces an integration test needs to stand up two full
//! transport instances against each other:
//!
//! - [`SharedRegion`]: an aligned, zeroed heap allocation standing in for
//!   the shared memory both cores map
//! - [`LoopbackLink`]: a [`ControlLink`] pair connected back to back,
//!   with one delivery thread per direction so receive callbacks run on
//!   a link-owned context, exactly as they do in production
//! - [`transport_pair`]: the production wiring over one split region,
//!   with side A deterministically taking the initiator role
//! - [`CollectingHandler`] and [`wait_for`] for asserting on traffic that
//!   arrives asynchronously

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use corebus_core::{ControlLink, Error, LinkEvents, Result};
use corebus_transport_block::{
    BlockTransport, ChannelConfig, Coherent, EndpointHandler, LinkConfig, RxBuffer,
};
use parking_lot::Mutex;

/// An aligned, zeroed heap allocation standing in for shared memory.
pub struct SharedRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the region is plain memory; tests coordinate access through
// the transports under test.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocate `len` zeroed bytes at the given alignment.
    ///
    /// # Panics
    /// Panics on allocation failure; this is test infrastructure.
    pub fn new(len: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(len, align).expect("bad region layout");
        // SAFETY: layout has non-zero size for any sensible test geometry.
        let ptr = unsafe { alloc_zeroed(layout) };
        Self {
            ptr: NonNull::new(ptr).expect("region allocation failed"),
            layout,
        }
    }

    pub fn base(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: allocated with exactly this layout in `new`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[derive(Default)]
struct Wire {
    sides: Mutex<[Option<Arc<dyn LinkEvents>>; 2]>,
}

/// One half of an in-process control-link pair.
///
/// Frames sent here are delivered whole and in order to the peer's
/// [`LinkEvents::received`] on a dedicated delivery thread. The link
/// reports `bound` on both sides once both halves were opened.
pub struct LoopbackLink {
    wire: Arc<Wire>,
    side: usize,
    to_peer: Mutex<mpsc::Sender<Vec<u8>>>,
}

impl ControlLink for LoopbackLink {
    fn open(&self, events: Arc<dyn LinkEvents>) -> Result<()> {
        let notify: Vec<Arc<dyn LinkEvents>> = {
            let mut sides = self.wire.sides.lock();
            sides[self.side] = Some(events);
            if sides.iter().all(|s| s.is_some()) {
                sides.iter().flatten().cloned().collect()
            } else {
                Vec::new()
            }
        };
        for events in notify {
            events.bound();
        }
        Ok(())
    }

    fn send(&self, frame: &[u8]) -> Result<usize> {
        self.to_peer
            .lock()
            .send(frame.to_vec())
            .map_err(|_| Error::LinkDown)?;
        Ok(frame.len())
    }
}

/// Create a connected loopback link pair.
pub fn link_pair() -> (Arc<LoopbackLink>, Arc<LoopbackLink>) {
    let wire = Arc::new(Wire::default());
    let (a_tx, a_out) = mpsc::channel::<Vec<u8>>();
    let (b_tx, b_out) = mpsc::channel::<Vec<u8>>();
    spawn_delivery(Arc::clone(&wire), 1, a_out);
    spawn_delivery(Arc::clone(&wire), 0, b_out);
    let a = Arc::new(LoopbackLink { wire: Arc::clone(&wire), side: 0, to_peer: Mutex::new(a_tx) });
    let b = Arc::new(LoopbackLink { wire, side: 1, to_peer: Mutex::new(b_tx) });
    (a, b)
}

fn spawn_delivery(wire: Arc<Wire>, dest: usize, frames: mpsc::Receiver<Vec<u8>>) {
    std::thread::Builder::new()
        .name(format!("loopback-rx-{dest}"))
        .spawn(move || {
            while let Ok(frame) = frames.recv() {
                let events = loop {
                    if let Some(events) = wire.sides.lock()[dest].clone() {
                        break events;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                };
                events.received(&frame);
            }
        })
        .expect("spawn delivery thread");
}

/// Two connected transports over one split shared region.
///
/// Side A transmits in the lower half of the region, so A is always the
/// initiator and B the follower. The raw link halves are exposed so
/// tests can inject crafted control frames.
pub struct TransportPair {
    pub a: BlockTransport,
    pub b: BlockTransport,
    pub a_link: Arc<LoopbackLink>,
    pub b_link: Arc<LoopbackLink>,
    _region: SharedRegion,
}

/// Stand up a connected transport pair.
///
/// `block_size` must be a multiple of the pointer size; each direction
/// gets `block_count` blocks of that size.
pub fn transport_pair(block_count: usize, block_size: usize) -> Result<TransportPair> {
    let dir_len = block_count * block_size;
    let region = SharedRegion::new(2 * dir_len, 64);
    let lower = region.base();
    // SAFETY: the region spans both halves.
    let upper = unsafe { region.base().add(dir_len) };

    let channel = |base: *mut u8| ChannelConfig { base, len: dir_len, ctrl_size: 0, block_count };
    let (a_link, b_link) = link_pair();

    // SAFETY: the region outlives the pair (it is stored alongside the
    // transports) and each half is used by exactly one TX side.
    let a = unsafe {
        BlockTransport::open(
            LinkConfig { tx: channel(lower), rx: channel(upper), cache_align: 0 },
            Arc::clone(&a_link) as Arc<dyn ControlLink>,
            Arc::new(Coherent),
        )
    }?;
    let b = unsafe {
        BlockTransport::open(
            LinkConfig { tx: channel(upper), rx: channel(lower), cache_align: 0 },
            Arc::clone(&b_link) as Arc<dyn ControlLink>,
            Arc::new(Coherent),
        )
    }?;

    Ok(TransportPair { a, b, a_link, b_link, _region: region })
}

/// Endpoint handler that records everything it sees.
#[derive(Default)]
pub struct CollectingHandler {
    received: Mutex<Vec<Vec<u8>>>,
    bound: AtomicUsize,
}

impl CollectingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }

    pub fn message_count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn bound_count(&self) -> usize {
        self.bound.load(Ordering::SeqCst)
    }
}

impl EndpointHandler for CollectingHandler {
    fn received(&self, buf: RxBuffer) {
        self.received.lock().push(buf.to_vec());
    }

    fn bound(&self) {
        self.bound.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll a condition until it holds or a 5 second deadline passes.
///
/// # Panics
/// Panics with `what` in the message on timeout.
pub fn wait_for(mut pred: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

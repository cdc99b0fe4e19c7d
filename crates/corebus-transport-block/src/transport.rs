//! The transport façade and receive dispatch.
//!
//! [`BlockTransport`] composes the block store, the allocator, the
//! endpoint directory, and the binding worker behind the public API.
//! [`Inner`] also implements [`LinkEvents`]: the link delivers control
//! frames straight into the dispatch below, which validates everything
//! derived from the wire before acting on it. A malformed or corrupted
//! message is logged and dropped; it never takes the link down.

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use corebus_core::{
    CacheOps, ControlError, ControlLink, ControlMsg, Error, LinkEvents, MsgKind, Result,
    CONTROL_MSG_SIZE,
};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::alloc::BlockAllocator;
use crate::bitpool::BitPool;
use crate::buffer::{RxBuffer, TxBuffer};
use crate::endpoint::{
    BindState, Directory, EndpointConfig, RebindState, ADDR_INVALID, MAX_ENDPOINTS,
};
use crate::layout::{Channel, LinkConfig, BLOCK_HEADER_SIZE};
use crate::worker::BindWorker;
use crate::Timeout;

/// One instance of the block transport.
///
/// Cheap to clone; all clones refer to the same instance.
#[derive(Clone)]
pub struct BlockTransport {
    inner: Arc<Inner>,
}

/// Handle to a registered endpoint, returned by
/// [`BlockTransport::register`].
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
    slot: usize,
}

pub(crate) struct Inner {
    link: Arc<dyn ControlLink>,
    cache: Arc<dyn CacheOps>,
    tx: Channel,
    rx: Channel,
    tx_alloc: Arc<BlockAllocator>,
    /// One bit per RX block; set inside the receive callback to keep the
    /// buffer alive past its return.
    rx_hold: BitPool,
    dir: Directory,
    is_initiator: bool,
    /// Set once, irreversibly, when the control link first becomes usable.
    control_bounded: AtomicBool,
    /// Serializes control-frame sends with waiting-bound table access.
    /// Never held across anything that blocks.
    ctrl: Mutex<CtrlState>,
    worker: OnceLock<BindWorker>,
}

struct CtrlState {
    /// Bound messages parked per endpoint address until a matching local
    /// registration appears.
    waiting_bound: [Option<u8>; MAX_ENDPOINTS],
}

impl BlockTransport {
    /// Open a transport instance over the given geometry and control link.
    ///
    /// # Safety
    ///
    /// Both regions described by `config` must stay valid for reads and
    /// writes for the rest of the process lifetime (instances cannot be
    /// closed), must not alias memory Rust otherwise manages, and the
    /// remote side must run the same protocol over the same geometry.
    pub unsafe fn open(
        config: LinkConfig,
        link: Arc<dyn ControlLink>,
        cache: Arc<dyn CacheOps>,
    ) -> Result<Self> {
        let (tx, rx) = config.build()?;
        // The side whose TX block array sits at the lower address takes
        // the initiator role.
        let is_initiator = (tx.base() as usize) < (rx.base() as usize);

        let inner = Arc::new(Inner {
            tx_alloc: Arc::new(BlockAllocator::new(tx)),
            rx_hold: BitPool::new(rx.block_count()),
            link: Arc::clone(&link),
            cache,
            tx,
            rx,
            dir: Directory::new(),
            is_initiator,
            control_bounded: AtomicBool::new(false),
            ctrl: Mutex::new(CtrlState { waiting_bound: [None; MAX_ENDPOINTS] }),
            worker: OnceLock::new(),
        });
        let worker = BindWorker::spawn(Arc::downgrade(&inner))?;
        let _ = inner.worker.set(worker);

        link.open(Arc::clone(&inner) as Arc<dyn LinkEvents>)?;
        debug!(
            is_initiator,
            tx_blocks = tx.block_count(),
            tx_block_size = tx.block_size(),
            rx_blocks = rx.block_count(),
            rx_block_size = rx.block_size(),
            "opened block transport"
        );
        Ok(Self { inner })
    }

    /// Register a named endpoint.
    ///
    /// Bounding proceeds in the background once the control link is up;
    /// the configuration's `bound` callback fires when the endpoint can
    /// exchange data.
    pub fn register(&self, cfg: Arc<EndpointConfig>) -> Result<Endpoint> {
        let slot = self.inner.dir.register(cfg, self.inner.is_initiator)?;
        self.inner.schedule_bind();
        Ok(Endpoint { inner: Arc::clone(&self.inner), slot })
    }

    /// Deregister an endpoint.
    ///
    /// A bound endpoint keeps its address; re-registering the same
    /// configuration later rebinds it without a new handshake.
    pub fn deregister(&self, ept: &Endpoint) -> Result<()> {
        self.inner.dir.deregister(ept.slot)
    }

    /// Largest payload a single TX buffer can carry.
    pub fn tx_buffer_capacity(&self) -> usize {
        self.inner.tx_alloc.max_alloc()
    }

    /// Claim a TX buffer of at least `len` bytes for zero-copy sending.
    pub fn get_tx_buffer(&self, len: usize, timeout: Timeout) -> Result<TxBuffer> {
        if len == 0 {
            return Err(Error::InvalidArgument("zero-length TX buffer"));
        }
        let a = self.inner.tx_alloc.allocate(len, timeout)?;
        Ok(TxBuffer::new(a, len, Arc::clone(&self.inner.tx_alloc)))
    }

    /// Return an unsent TX buffer to the allocator.
    pub fn drop_tx_buffer(&self, buf: TxBuffer) -> Result<()> {
        let (data, _, _) = buf.defuse();
        self.inner.release_tx_by_ptr(data.as_ptr(), None).map(|_| ())
    }

    /// Keep a received buffer valid past the receive callback's return.
    ///
    /// Must be called from inside the callback delivering `buf`. The
    /// application takes over the release decision for this one buffer
    /// and hands it back through [`Self::release_rx_buffer`].
    pub fn hold_rx_buffer(&self, buf: &RxBuffer) -> Result<()> {
        let inner = &*self.inner;
        let (index, size) = inner.rx.sized_index_of(buf.as_ptr(), &*inner.cache)?;
        inner.rx_hold.set_range(index, inner.rx.blocks_for(size));
        Ok(())
    }

    /// Release a previously held RX buffer back to its owner.
    pub fn release_rx_buffer(&self, buf: RxBuffer) -> Result<()> {
        let inner = &*self.inner;
        let (index, size) = inner.rx.sized_index_of(buf.as_ptr(), &*inner.cache)?;
        if !inner.rx_hold.clear_range_if_set(index, inner.rx.blocks_for(size)) {
            error!(index, "releasing an RX buffer that is not held");
            return Err(Error::InvalidArgument("buffer not held"));
        }
        inner.send_control(MsgKind::ReleaseData, 0, index as u8)
    }

    /// Closing an instance is intentionally unimplemented.
    pub fn close(&self) -> Result<()> {
        Err(Error::NotSupported)
    }
}

impl Endpoint {
    fn addr(&self) -> Result<u8> {
        let addr = self.inner.dir.slot(self.slot).addr.load(Ordering::Acquire);
        if addr == ADDR_INVALID {
            return Err(Error::InvalidArgument("endpoint not bound"));
        }
        Ok(addr)
    }

    /// Copying send: allocate without waiting, copy the payload in, and
    /// announce it. Returns the number of bytes sent.
    pub fn send(&self, payload: &[u8]) -> Result<usize> {
        let addr = self.addr()?;
        let inner = &*self.inner;
        // An empty payload still occupies one block.
        let a = inner.tx_alloc.allocate(payload.len().max(1), Timeout::NoWait)?;
        // SAFETY: the claimed span covers at least the requested size.
        unsafe {
            core::ptr::copy_nonoverlapping(payload.as_ptr(), a.data.as_ptr(), payload.len());
        }
        inner.send_block(MsgKind::Data, addr, a.index, payload.len())?;
        Ok(payload.len())
    }

    /// Zero-copy send of a buffer claimed with
    /// [`BlockTransport::get_tx_buffer`].
    ///
    /// The buffer is first shrunk to the actually written `len`, freeing
    /// any excess trailing blocks, then announced. On failure the whole
    /// buffer is released.
    pub fn send_nocopy(&self, buf: TxBuffer, len: usize) -> Result<()> {
        let addr = self.addr()?;
        let inner = &*self.inner;
        let (data, _, _) = buf.defuse();
        match inner.release_tx_by_ptr(data.as_ptr(), Some(len)) {
            Ok(index) => inner.send_block(MsgKind::Data, addr, index, len),
            Err(e) => {
                let _ = inner.release_tx_by_ptr(data.as_ptr(), None);
                Err(e)
            }
        }
    }
}

impl Inner {
    pub(crate) fn schedule_bind(&self) {
        if let Some(worker) = self.worker.get() {
            worker.schedule();
        }
    }

    fn send_control(&self, kind: MsgKind, endpoint: u8, block: u8) -> Result<()> {
        let frame = ControlMsg::new(kind, endpoint, block).encode();
        let result = {
            let _guard = self.ctrl.lock();
            self.link.send(&frame)
        };
        match result {
            Ok(n) if n >= CONTROL_MSG_SIZE => Ok(()),
            Ok(n) => {
                error!(n, "control link accepted a short write");
                Err(Error::LinkDown)
            }
            Err(e) => {
                error!(error = %e, "control send failed");
                Err(e)
            }
        }
    }

    /// Write the final size, flush the buffer, and announce it. If the
    /// announcement fails the staged blocks are released, so a link
    /// outage cannot leak them.
    fn send_block(&self, kind: MsgKind, endpoint: u8, index: usize, size: usize) -> Result<()> {
        self.tx.write_header(index, size as u32);
        fence(Ordering::SeqCst);
        self.cache.flush(self.tx.block_ptr(index), BLOCK_HEADER_SIZE + size);
        match self.send_control(kind, endpoint, index as u8) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.tx_alloc.release(index, size, None);
                Err(e)
            }
        }
    }

    fn release_tx_by_ptr(&self, ptr: *const u8, shrink_to: Option<usize>) -> Result<usize> {
        let (index, size) = self.tx.sized_index_of(ptr, &*self.cache)?;
        self.tx_alloc.release(index, size, shrink_to)
    }

    /// Resolve and validate the endpoint a received message addresses.
    ///
    /// Completes a pending initiator-side handshake lazily: the first
    /// inbound activity for a `Bounding` endpoint is its confirmation.
    fn rx_endpoint(&self, addr: u8) -> Result<Arc<EndpointConfig>> {
        let Some(slot_index) = self.dir.resolve_addr(addr) else {
            error!(addr, "message for unknown endpoint address");
            return Err(Error::InvalidArgument("unknown endpoint address"));
        };
        let slot = self.dir.slot(slot_index);
        match slot.state.load() {
            BindState::Ready => {}
            BindState::Bounding => {
                if slot.state.transition(BindState::Bounding, BindState::Ready) {
                    debug!(addr, "endpoint bound");
                    if let Some(cfg) = slot.cfg() {
                        cfg.handler.bound();
                    }
                }
            }
            state => {
                error!(addr, ?state, "message for endpoint in invalid state");
                return Err(Error::InvalidArgument("endpoint not ready"));
            }
        }
        if slot.rebind.load() != RebindState::Normal {
            error!(addr, "message for deregistered endpoint");
            return Err(Error::InvalidArgument("endpoint deregistered"));
        }
        slot.cfg().ok_or(Error::InvalidArgument("endpoint not configured"))
    }

    fn recv_data(&self, index: usize, addr: u8) -> Result<()> {
        let (data, size) = self.rx.sized_buffer(index, true, &*self.cache)?;
        let cfg = self.rx_endpoint(addr)?;
        let blocks = self.rx.blocks_for(size);
        // Clear speculatively; the callback may set it via hold_rx_buffer.
        self.rx_hold.clear_range(index, blocks);
        cfg.handler.received(RxBuffer::new(data, size));
        if !self.rx_hold.get(index) {
            self.send_control(MsgKind::ReleaseData, 0, index as u8)?;
        }
        Ok(())
    }

    /// The remote side finished with one of our TX buffers.
    fn recv_release(&self, index: usize) -> Result<()> {
        let (_, size) = self.tx.sized_buffer(index, false, &*self.cache)?;
        self.tx_alloc.release(index, size, None)?;
        Ok(())
    }

    fn recv_bound(&self, index: usize, addr: u8) -> Result<()> {
        // Validate the name buffer before parking it for the worker.
        self.rx.sized_buffer(index, true, &*self.cache)?;
        {
            let mut ctrl = self.ctrl.lock();
            // Overwriting a parked entry would be a protocol-ordering
            // violation by the initiator; last writer wins if it happens.
            ctrl.waiting_bound[addr as usize] = Some(index as u8);
        }
        self.schedule_bind();
        Ok(())
    }

    /// One bounding pass, always on the worker thread.
    pub(crate) fn process_bindings(&self) {
        if !self.control_bounded.load(Ordering::Acquire) {
            return;
        }

        // Resolve pending rebinds first, on both roles: same
        // configuration, no new handshake, just re-fire the callback.
        for (_, slot) in self.dir.slots() {
            if slot.rebind.transition(RebindState::Rebounding, RebindState::Normal) {
                if let Some(cfg) = slot.cfg() {
                    debug!(name = %cfg.name, "endpoint rebound");
                    cfg.handler.bound();
                }
            }
        }

        if self.is_initiator {
            for (i, slot) in self.dir.slots() {
                if slot.state.transition(BindState::Configured, BindState::Bounding) {
                    if let Err(e) = self.send_bound(i) {
                        slot.state.store(BindState::Unconfigured);
                        error!(slot = i, error = %e, "failed to send bound message");
                    }
                }
            }
        } else {
            for addr in 0..MAX_ENDPOINTS {
                let pending = { self.ctrl.lock().waiting_bound[addr] };
                let Some(index) = pending else { continue };
                match self.match_bound(index as usize, addr as u8) {
                    Ok(true) => self.ctrl.lock().waiting_bound[addr] = None,
                    // No matching local registration yet; the entry stays
                    // parked and is retried after the next registration.
                    Ok(false) => {}
                    Err(e) => {
                        error!(addr, error = %e, "failed to process bound message");
                        self.ctrl.lock().waiting_bound[addr] = None;
                    }
                }
            }
        }
    }

    /// Initiator side: announce one endpoint. The name travels in a
    /// buffer claimed greedily and trimmed down to the name length.
    fn send_bound(&self, slot_index: usize) -> Result<()> {
        let slot = self.dir.slot(slot_index);
        let cfg = slot.cfg().ok_or(Error::InvalidArgument("endpoint not configured"))?;
        let addr = slot.addr.load(Ordering::Acquire);
        let name = cfg.name.as_bytes();
        let len = name.len() + 1;

        let a = self.tx_alloc.allocate(0, Timeout::Forever)?;
        let a = if a.capacity < len {
            self.tx_alloc.release(a.index, a.capacity, None)?;
            self.tx_alloc.allocate(len, Timeout::Forever)?
        } else {
            self.tx_alloc.release(a.index, a.capacity, Some(len))?;
            a
        };
        // SAFETY: the span covers `len` bytes after the shrink check.
        unsafe {
            core::ptr::copy_nonoverlapping(name.as_ptr(), a.data.as_ptr(), name.len());
            a.data.as_ptr().add(name.len()).write(0);
        }
        self.send_block(MsgKind::Bound, addr, a.index, len)
    }

    /// Follower side: match one parked bound message against the local
    /// registrations.
    fn match_bound(&self, index: usize, addr: u8) -> Result<bool> {
        let (data, size) = self.rx.sized_buffer(index, true, &*self.cache)?;
        // SAFETY: the range was validated against the channel bounds.
        let bytes = unsafe { core::slice::from_raw_parts(data.as_ptr(), size) };
        // The name is NUL-terminated; an unterminated one is bounded by
        // the validated size and compared as-is, never past it.
        let name = match bytes.iter().position(|&b| b == 0) {
            Some(nul) => &bytes[..nul],
            None => bytes,
        };

        let Some(slot_index) = self.dir.find_by_name(name) else {
            debug!(
                name = %String::from_utf8_lossy(name),
                "no local endpoint for bound message yet"
            );
            return Ok(false);
        };
        let slot = self.dir.slot(slot_index);
        self.dir.map_addr(addr, slot_index);
        if !slot.state.transition(BindState::Configured, BindState::Ready) {
            error!(addr, "unexpected bounding from remote");
            return Err(Error::InvalidArgument("endpoint state"));
        }
        debug!(addr, name = %String::from_utf8_lossy(name), "endpoint bound");
        if let Some(cfg) = slot.cfg() {
            cfg.handler.bound();
        }
        // Release the name buffer and confirm the handshake in one message.
        self.send_control(MsgKind::ReleaseBound, addr, index as u8)?;
        Ok(true)
    }
}

impl LinkEvents for Inner {
    fn bound(&self) {
        debug!("control link bound");
        self.control_bounded.store(true, Ordering::Release);
        self.schedule_bind();
    }

    fn received(&self, frame: &[u8]) {
        let msg = match ControlMsg::decode(frame) {
            Ok(msg) => msg,
            Err(ControlError::UnknownKind { kind }) => {
                // Reserved for future protocol versions.
                debug!(kind, "ignoring unknown control message kind");
                return;
            }
            Err(e @ ControlError::Truncated { .. }) => {
                error!(error = %e, "dropping malformed control frame");
                return;
            }
        };
        if (msg.endpoint as usize) >= MAX_ENDPOINTS {
            error!(endpoint = msg.endpoint, "control message for invalid endpoint address");
            return;
        }

        let index = msg.block as usize;
        let result = match msg.kind {
            MsgKind::Data => self.recv_data(index, msg.endpoint),
            MsgKind::ReleaseData => self.recv_release(index),
            MsgKind::Bound => self.recv_bound(index, msg.endpoint),
            MsgKind::ReleaseBound => self
                .recv_release(index)
                .and_then(|()| self.rx_endpoint(msg.endpoint).map(|_| ())),
        };
        if let Err(e) = result {
            // The single offending message is dropped; the link and all
            // other endpoints keep running.
            error!(kind = ?msg.kind, error = %e, "dropping control message");
        }
    }
}

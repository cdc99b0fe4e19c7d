//! Endpoint directory and bounding state.
//!
//! Endpoints are named, callback-carrying registrations multiplexed over
//! one link. Each lives in a fixed-size table slot and moves through two
//! independent state machines: the bounding state (name handshake) and
//! the rebind state (deregistration without a fresh handshake).
//!
//! All registration-shaped mutations are serialized by the directory
//! lock; the handshake and receive paths touch only the per-slot atomics,
//! so no lock spans the state machine itself.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use corebus_core::{Error, Result};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::buffer::RxBuffer;

/// Compile-time bound on simultaneously registered endpoints.
pub const MAX_ENDPOINTS: usize = 8;

/// Endpoint address marking an empty map entry.
pub(crate) const ADDR_INVALID: u8 = 0xFF;

/// Progress of the name handshake for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BindState {
    /// Slot is free.
    Unconfigured = 0,
    /// Registered locally, waiting for the worker to start the handshake.
    Configured = 1,
    /// Initiator only: Bound sent, waiting for any inbound activity.
    Bounding = 2,
    /// Handshake complete; the bound callback has fired.
    Ready = 3,
}

/// Deregistration lifecycle, orthogonal to [`BindState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RebindState {
    Normal = 0,
    /// Deregistered after bounding; address mapping preserved.
    Deregistered = 1,
    /// Re-registered with the same configuration; the worker will
    /// re-fire the bound callback without a new handshake.
    Rebounding = 2,
}

macro_rules! atomic_state {
    ($atomic:ident, $state:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        pub(crate) struct $atomic(AtomicU8);

        impl $atomic {
            fn new(state: $state) -> Self {
                Self(AtomicU8::new(state as u8))
            }

            pub(crate) fn load(&self) -> $state {
                match self.0.load(Ordering::Acquire) {
                    $($value => $state::$variant,)+
                    _ => unreachable!("corrupted endpoint state"),
                }
            }

            pub(crate) fn store(&self, state: $state) {
                self.0.store(state as u8, Ordering::Release);
            }

            /// Transition `from -> to` if the current state matches.
            pub(crate) fn transition(&self, from: $state, to: $state) -> bool {
                self.0
                    .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            }
        }
    };
}

atomic_state!(AtomicBindState, BindState {
    Unconfigured = 0,
    Configured = 1,
    Bounding = 2,
    Ready = 3,
});

atomic_state!(AtomicRebindState, RebindState {
    Normal = 0,
    Deregistered = 1,
    Rebounding = 2,
});

/// Application-side callbacks for one endpoint.
///
/// Both callbacks run on transport-owned contexts (`received` on the
/// link's delivery context, `bound` on either the delivery context or the
/// binding worker) and must not block.
pub trait EndpointHandler: Send + Sync {
    /// A message arrived for this endpoint.
    ///
    /// The buffer is released automatically when the callback returns
    /// unless it was passed to `hold_rx_buffer` first.
    fn received(&self, buf: RxBuffer);

    /// The endpoint finished bounding and can exchange data.
    fn bound(&self) {}
}

/// User configuration of one endpoint.
pub struct EndpointConfig {
    pub name: String,
    pub handler: Arc<dyn EndpointHandler>,
}

pub(crate) struct EndpointSlot {
    pub(crate) state: AtomicBindState,
    pub(crate) rebind: AtomicRebindState,
    pub(crate) addr: AtomicU8,
    cfg: Mutex<Option<Arc<EndpointConfig>>>,
}

impl EndpointSlot {
    fn new() -> Self {
        Self {
            state: AtomicBindState::new(BindState::Unconfigured),
            rebind: AtomicRebindState::new(RebindState::Normal),
            addr: AtomicU8::new(ADDR_INVALID),
            cfg: Mutex::new(None),
        }
    }

    pub(crate) fn cfg(&self) -> Option<Arc<EndpointConfig>> {
        self.cfg.lock().clone()
    }
}

pub(crate) struct Directory {
    slots: [EndpointSlot; MAX_ENDPOINTS],
    /// Endpoint address -> slot index.
    addr_map: [AtomicU8; MAX_ENDPOINTS],
    /// Serializes register/deregister; never held on hot paths.
    reg: Mutex<()>,
}

impl Directory {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| EndpointSlot::new()),
            addr_map: std::array::from_fn(|_| AtomicU8::new(ADDR_INVALID)),
            reg: Mutex::new(()),
        }
    }

    pub(crate) fn slot(&self, index: usize) -> &EndpointSlot {
        &self.slots[index]
    }

    pub(crate) fn slots(&self) -> impl Iterator<Item = (usize, &EndpointSlot)> {
        self.slots.iter().enumerate()
    }

    /// Register an endpoint; returns its slot index.
    ///
    /// Re-registering the exact configuration of a deregistered endpoint
    /// switches it to [`RebindState::Rebounding`] instead of running the
    /// name handshake again.
    pub(crate) fn register(
        &self,
        cfg: Arc<EndpointConfig>,
        is_initiator: bool,
    ) -> Result<usize> {
        if cfg.name.is_empty() {
            return Err(Error::InvalidArgument("empty endpoint name"));
        }
        let _guard = self.reg.lock();

        for (i, slot) in self.slots.iter().enumerate() {
            let existing = slot.cfg();
            let Some(existing) = existing else { continue };
            if Arc::ptr_eq(&existing, &cfg)
                && slot.rebind.transition(RebindState::Deregistered, RebindState::Rebounding)
            {
                debug!(name = %cfg.name, slot = i, "rebinding endpoint");
                return Ok(i);
            }
            if slot.state.load() != BindState::Unconfigured && existing.name == cfg.name {
                error!(name = %cfg.name, "endpoint name already registered");
                return Err(Error::AlreadyExists);
            }
        }

        for (i, slot) in self.slots.iter().enumerate() {
            if slot.state.load() != BindState::Unconfigured {
                continue;
            }
            debug!(name = %cfg.name, slot = i, "registering endpoint");
            *slot.cfg.lock() = Some(Arc::clone(&cfg));
            slot.rebind.store(RebindState::Normal);
            if is_initiator {
                // The initiator assigns addresses; slot index doubles as
                // the endpoint address.
                slot.addr.store(i as u8, Ordering::Release);
                self.addr_map[i].store(i as u8, Ordering::Release);
            } else {
                slot.addr.store(ADDR_INVALID, Ordering::Release);
            }
            slot.state.store(BindState::Configured);
            return Ok(i);
        }

        error!("endpoint table is full");
        Err(Error::NoEndpointSlots)
    }

    pub(crate) fn deregister(&self, index: usize) -> Result<()> {
        let _guard = self.reg.lock();
        let slot = &self.slots[index];
        match slot.state.load() {
            BindState::Ready | BindState::Bounding => {
                // Keep the slot and address mapping for a later rebind.
                slot.rebind.store(RebindState::Deregistered);
                debug!(slot = index, "endpoint deregistered");
                Ok(())
            }
            BindState::Configured => {
                // Never bound; recycle the slot entirely.
                let addr = slot.addr.swap(ADDR_INVALID, Ordering::AcqRel);
                if (addr as usize) < MAX_ENDPOINTS {
                    self.addr_map[addr as usize].store(ADDR_INVALID, Ordering::Release);
                }
                *slot.cfg.lock() = None;
                slot.rebind.store(RebindState::Normal);
                slot.state.store(BindState::Unconfigured);
                debug!(slot = index, "endpoint slot recycled");
                Ok(())
            }
            BindState::Unconfigured => {
                error!(slot = index, "deregistering an unregistered endpoint");
                Err(Error::InvalidArgument("endpoint not registered"))
            }
        }
    }

    /// Find a configured endpoint whose name matches the given bytes.
    ///
    /// Only endpoints still waiting for their handshake participate; the
    /// name came from the shared region and has already been bounded by
    /// the validated buffer size.
    pub(crate) fn find_by_name(&self, name: &[u8]) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.state.load() == BindState::Configured
                && slot.cfg().is_some_and(|cfg| cfg.name.as_bytes() == name)
        })
    }

    /// Resolve an endpoint address to its slot index.
    pub(crate) fn resolve_addr(&self, addr: u8) -> Option<usize> {
        if (addr as usize) >= MAX_ENDPOINTS {
            return None;
        }
        let index = self.addr_map[addr as usize].load(Ordering::Acquire);
        ((index as usize) < MAX_ENDPOINTS).then_some(index as usize)
    }

    /// Record the address assignment for a follower-side endpoint.
    pub(crate) fn map_addr(&self, addr: u8, slot_index: usize) {
        self.slots[slot_index].addr.store(addr, Ordering::Release);
        self.addr_map[addr as usize].store(slot_index as u8, Ordering::Release);
    }
}

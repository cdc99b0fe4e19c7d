//! corebus-core: Core types shared by corebus transports.
//!
//! This crate holds the pieces that sit at the boundary between a corebus
//! backend and its environment:
//!
//! - the 3-byte control message codec ([`ControlMsg`], [`MsgKind`])
//! - the [`ControlLink`] trait, modeling the underlying fixed-size
//!   control-message transport, and the [`LinkEvents`] callbacks it drives
//! - the [`CacheOps`] trait for cache maintenance on the shared region,
//!   with a no-op [`Coherent`] implementation for coherent targets
//! - the shared [`Error`] taxonomy
//!
//! Backends (see `corebus-transport-block`) compose these; link
//! implementations (a mailbox driver, the in-process loopback in
//! `corebus-testkit`) implement [`ControlLink`] against them.

#![forbid(unsafe_op_in_unsafe_fn)]

mod cache;
mod control;
mod error;
mod link;

pub use cache::{CacheOps, Coherent};
pub use control::{ControlError, ControlMsg, MsgKind, CONTROL_MSG_SIZE};
pub use error::{Error, Result};
pub use link::{ControlLink, LinkEvents};

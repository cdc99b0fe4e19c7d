//! Fuzzing harnesses for the corebus block transport.
//!
//! These fuzzers operate on in-memory replicas of the allocator and the
//! bounding handshake, without touching real shared memory, to test the
//! invariants of the algorithms themselves.

pub mod alloc_model;
pub mod bind_model;

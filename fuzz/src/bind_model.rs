//! In-memory model of the two-sided bounding handshake.
//!
//! Replicates the protocol roles — initiator announces names, follower
//! matches them against its own registrations and acknowledges — over
//! plain message queues, so interleavings of registration, delivery, and
//! worker passes can be fuzzed without a transport underneath.

use std::collections::VecDeque;

/// Endpoint table size, matching the transport's compile-time bound.
pub const MAX_ENDPOINTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Configured,
    Bounding,
    Ready,
}

#[derive(Debug, Clone)]
struct ModelEndpoint {
    name: String,
    state: BindState,
    addr: Option<u8>,
    bound_count: usize,
}

#[derive(Debug, Default)]
struct Side {
    endpoints: Vec<ModelEndpoint>,
}

impl Side {
    fn register(&mut self, name: &str) -> bool {
        if self.endpoints.len() >= MAX_ENDPOINTS
            || self.endpoints.iter().any(|e| e.name == name)
        {
            return false;
        }
        self.endpoints.push(ModelEndpoint {
            name: name.to_string(),
            state: BindState::Configured,
            addr: None,
            bound_count: 0,
        });
        true
    }

    fn by_name(&self, name: &str) -> Option<usize> {
        self.endpoints.iter().position(|e| e.name == name)
    }
}

/// A parked bound message on the follower: address plus the name payload.
#[derive(Debug, Clone)]
struct BoundMsg {
    addr: u8,
    name: String,
}

/// Model of one link instance pair driving the handshake.
#[derive(Debug, Default)]
pub struct HandshakeModel {
    initiator: Side,
    follower: Side,
    /// Bound messages in flight toward the follower.
    to_follower: VecDeque<BoundMsg>,
    /// ReleaseBound acknowledgments in flight toward the initiator.
    to_initiator: VecDeque<u8>,
    /// Parked bound messages per address on the follower.
    waiting: [Option<BoundMsg>; MAX_ENDPOINTS],
}

/// Operations the fuzzer interleaves.
#[derive(Clone, Debug)]
pub enum BindOp {
    /// Register name `ept-{n % 8}` on the initiator.
    RegisterInitiator(u8),
    /// Register name `ept-{n % 8}` on the follower.
    RegisterFollower(u8),
    /// Run one initiator worker pass (send bound messages).
    ProcessInitiator,
    /// Run one follower worker pass (match parked messages).
    ProcessFollower,
    /// Deliver one in-flight message toward the follower.
    DeliverToFollower,
    /// Deliver one in-flight message toward the initiator.
    DeliverToInitiator,
}

fn name_for(n: u8) -> String {
    format!("ept-{}", n % 8)
}

impl HandshakeModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, op: &BindOp) {
        match op {
            BindOp::RegisterInitiator(n) => {
                self.initiator.register(&name_for(*n));
            }
            BindOp::RegisterFollower(n) => {
                self.follower.register(&name_for(*n));
            }
            BindOp::ProcessInitiator => self.process_initiator(),
            BindOp::ProcessFollower => self.process_follower(),
            BindOp::DeliverToFollower => {
                if let Some(msg) = self.to_follower.pop_front() {
                    // Parking overwrites nothing in practice; the model
                    // mirrors last-writer-wins.
                    self.waiting[msg.addr as usize] = Some(msg);
                }
            }
            BindOp::DeliverToInitiator => {
                if let Some(addr) = self.to_initiator.pop_front() {
                    let ept = &mut self.initiator.endpoints[addr as usize];
                    if ept.state == BindState::Bounding {
                        ept.state = BindState::Ready;
                        ept.bound_count += 1;
                    }
                }
            }
        }
    }

    fn process_initiator(&mut self) {
        for (i, ept) in self.initiator.endpoints.iter_mut().enumerate() {
            if ept.state == BindState::Configured {
                ept.state = BindState::Bounding;
                ept.addr = Some(i as u8);
                self.to_follower.push_back(BoundMsg { addr: i as u8, name: ept.name.clone() });
            }
        }
    }

    fn process_follower(&mut self) {
        for slot in &mut self.waiting {
            let Some(msg) = slot else { continue };
            let Some(idx) = self.follower.by_name(&msg.name) else { continue };
            let ept = &mut self.follower.endpoints[idx];
            if ept.state != BindState::Configured {
                continue;
            }
            ept.state = BindState::Ready;
            ept.addr = Some(msg.addr);
            ept.bound_count += 1;
            self.to_initiator.push_back(msg.addr);
            *slot = None;
        }
    }

    /// Drive every queue and worker until nothing changes.
    pub fn settle(&mut self) {
        loop {
            let before = self.snapshot();
            self.process_initiator();
            while let Some(msg) = self.to_follower.pop_front() {
                self.waiting[msg.addr as usize] = Some(msg);
            }
            self.process_follower();
            while let Some(addr) = self.to_initiator.pop_front() {
                let ept = &mut self.initiator.endpoints[addr as usize];
                if ept.state == BindState::Bounding {
                    ept.state = BindState::Ready;
                    ept.bound_count += 1;
                }
            }
            if self.snapshot() == before {
                return;
            }
        }
    }

    fn snapshot(&self) -> Vec<(String, BindState, Option<u8>, usize)> {
        self.initiator
            .endpoints
            .iter()
            .chain(self.follower.endpoints.iter())
            .map(|e| (e.name.clone(), e.state, e.addr, e.bound_count))
            .collect()
    }

    /// Invariants that must hold after any interleaving.
    pub fn verify(&self) -> Result<(), String> {
        for ept in self.initiator.endpoints.iter().chain(self.follower.endpoints.iter()) {
            if ept.bound_count > 1 {
                return Err(format!("endpoint {} bound {} times", ept.name, ept.bound_count));
            }
            if (ept.state == BindState::Ready) != (ept.bound_count == 1) {
                return Err(format!("endpoint {} state/bound mismatch", ept.name));
            }
        }
        // A follower endpoint can only be Ready if the initiator
        // registered the same name, and their addresses must agree.
        for ept in &self.follower.endpoints {
            if ept.state != BindState::Ready {
                continue;
            }
            let Some(peer_idx) = self.initiator.by_name(&ept.name) else {
                return Err(format!("follower {} ready without a peer", ept.name));
            };
            let peer = &self.initiator.endpoints[peer_idx];
            if peer.addr != ept.addr {
                return Err(format!(
                    "address mismatch for {}: {:?} vs {:?}",
                    ept.name, peer.addr, ept.addr
                ));
            }
        }
        Ok(())
    }

    /// Invariants that must additionally hold once everything settled:
    /// every name registered on both sides is Ready on both sides.
    pub fn verify_settled(&self) -> Result<(), String> {
        self.verify()?;
        for ept in &self.initiator.endpoints {
            if self.follower.by_name(&ept.name).is_some() && ept.state != BindState::Ready {
                return Err(format!("initiator {} never became ready", ept.name));
            }
        }
        for ept in &self.follower.endpoints {
            if self.initiator.by_name(&ept.name).is_some() && ept.state != BindState::Ready {
                return Err(format!("follower {} never became ready", ept.name));
            }
        }
        Ok(())
    }
}

/// Execute a sequence of operations, verifying invariants after each,
/// then settle and check the end-to-end handshake properties.
pub fn execute_and_verify(ops: &[BindOp]) -> Result<(), String> {
    let mut model = HandshakeModel::new();
    for (i, op) in ops.iter().enumerate() {
        model.apply(op);
        model.verify().map_err(|e| format!("op {i}: {e}"))?;
    }
    model.settle();
    model.verify_settled()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_registration_binds_both_sides_once() {
        let mut model = HandshakeModel::new();
        model.apply(&BindOp::RegisterInitiator(0));
        model.apply(&BindOp::RegisterFollower(0));
        model.settle();
        model.verify_settled().unwrap();
    }

    #[test]
    fn follower_can_register_after_the_bound_message_arrived() {
        let mut model = HandshakeModel::new();
        model.apply(&BindOp::RegisterInitiator(3));
        model.apply(&BindOp::ProcessInitiator);
        model.apply(&BindOp::DeliverToFollower);
        model.apply(&BindOp::ProcessFollower); // no match yet
        model.verify().unwrap();

        model.apply(&BindOp::RegisterFollower(3));
        model.settle();
        model.verify_settled().unwrap();
    }

    #[test]
    fn interleaved_handshake_settles_cleanly() {
        let ops = vec![
            BindOp::RegisterInitiator(0),
            BindOp::ProcessInitiator,
            BindOp::DeliverToFollower,
            BindOp::ProcessFollower,
            BindOp::RegisterFollower(0),
            BindOp::RegisterInitiator(1),
            BindOp::ProcessFollower,
            BindOp::DeliverToInitiator,
        ];
        execute_and_verify(&ops).unwrap();
    }

    #[test]
    fn unmatched_names_stay_pending() {
        let mut model = HandshakeModel::new();
        model.apply(&BindOp::RegisterInitiator(1));
        model.apply(&BindOp::RegisterFollower(2));
        model.settle();
        model.verify().unwrap();
        assert!(model.verify_settled().is_ok());
    }
}

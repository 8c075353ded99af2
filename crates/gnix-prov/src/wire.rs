//! Connection wire: the reliable exchange under the VC handshake
//!
//! A `Wire` carries connection-setup datagrams and hardware-style
//! completion records between NIC addresses. It is the only thing the VC
//! state machine needs from the interconnect:
//!
//! - `ConnRequest` / `ConnResponse` - the two halves of the handshake,
//!   each advertising the sender's inbound mailbox
//! - `ConnFailed` - the request could not be delivered, or the peer
//!   refused the handshake
//! - `SmsgArrived` - a short message landed in the named VC's mailbox
//! - `SendComplete` - a locally issued send finished
//! - `Shutdown` - the peer VC began teardown
//!
//! Completion records name the VC by its dense id, so the receiving NIC
//! resolves them without a search. Records from a peer also carry the
//! peer's address and VC id; the receiver drops any record whose sender
//! does not match the VC the id currently names, since ids are recycled
//! and addresses can be reattached.
//!
//! `LoopbackWire` is the in-process implementation: one lock-free inbox per
//! attached address.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crossbeam_queue::{ArrayQueue, SegQueue};

use gnix_core::error::{FabricError, FabricResult};
use gnix_core::fastlock::FastLock;
use gnix_core::id::{Address, VcId};
use gnix_core::kprint::Subsys;
use gnix_core::{gnix_debug, gnix_trace};

/// Inbound short-message mailbox of one VC
///
/// Bounded; a full mailbox pushes the sender onto its progress work queue.
pub struct Mailbox {
    slots: ArrayQueue<Vec<u8>>,
}

impl Mailbox {
    pub fn new(depth: usize) -> Self {
        Mailbox { slots: ArrayQueue::new(depth.max(1)) }
    }

    /// Deliver a message; hands it back if the mailbox is full.
    pub fn deliver(&self, msg: Vec<u8>) -> Result<(), Vec<u8>> {
        self.slots.push(msg)
    }

    pub fn take(&self) -> Option<Vec<u8>> {
        self.slots.pop()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mailbox({}/{})", self.len(), self.capacity())
    }
}

/// First half of the handshake
#[derive(Debug, Clone)]
pub struct ConnRequest {
    pub src: Address,
    pub src_vc: VcId,
    pub mbox: Arc<Mailbox>,
}

/// Answer to a `ConnRequest`
#[derive(Debug, Clone)]
pub struct ConnResponse {
    pub src: Address,
    pub src_vc: VcId,
    /// The requesting VC
    pub dst_vc: VcId,
    pub mbox: Arc<Mailbox>,
}

/// Record carried by the wire
#[derive(Debug, Clone)]
pub enum WireEvent {
    ConnRequest(ConnRequest),
    ConnResponse(ConnResponse),
    /// `src` is the peer the failed handshake was addressed to
    ConnFailed { vc_id: VcId, src: Address, errno: i32 },
    SmsgArrived { vc_id: VcId, src: Address, src_vc: VcId },
    SendComplete { vc_id: VcId },
    Shutdown { vc_id: VcId, src: Address, src_vc: VcId },
}

/// Reliable, non-blocking delivery of `WireEvent`s between addresses
pub trait Wire: Send + Sync {
    /// Start receiving at `addr`. Fails if the address is taken.
    fn attach(&self, addr: Address) -> FabricResult<()>;

    /// Stop receiving at `addr`; undelivered records are dropped.
    fn detach(&self, addr: Address);

    /// Queue `event` for `dest`. Never blocks.
    ///
    /// An undeliverable `ConnRequest` is answered with `ConnFailed` at
    /// `from`; other undeliverable records fail with `ConnRefused`.
    fn post(&self, from: Address, dest: Address, event: WireEvent) -> FabricResult<()>;

    /// Next record for `addr`, if any.
    fn poll(&self, addr: Address) -> Option<WireEvent>;
}

/// In-process `Wire`
pub struct LoopbackWire {
    inboxes: FastLock<HashMap<Address, Arc<SegQueue<WireEvent>>>>,
}

impl LoopbackWire {
    pub fn new() -> Self {
        LoopbackWire { inboxes: FastLock::new(HashMap::new()) }
    }

    fn inbox(&self, addr: Address) -> Option<Arc<SegQueue<WireEvent>>> {
        self.inboxes.acquire().get(&addr).cloned()
    }

    /// Records waiting at `addr`
    pub fn pending(&self, addr: Address) -> usize {
        self.inbox(addr).map_or(0, |q| q.len())
    }
}

impl Default for LoopbackWire {
    fn default() -> Self {
        Self::new()
    }
}

impl Wire for LoopbackWire {
    fn attach(&self, addr: Address) -> FabricResult<()> {
        let mut inboxes = self.inboxes.acquire();
        if inboxes.contains_key(&addr) {
            return Err(FabricError::InvalidArgument);
        }
        inboxes.try_reserve(1)?;
        inboxes.insert(addr, Arc::new(SegQueue::new()));
        gnix_debug!(Subsys::Nic, "wire attach {}", addr);
        Ok(())
    }

    fn detach(&self, addr: Address) {
        if self.inboxes.acquire().remove(&addr).is_some() {
            gnix_debug!(Subsys::Nic, "wire detach {}", addr);
        }
    }

    fn post(&self, from: Address, dest: Address, event: WireEvent) -> FabricResult<()> {
        if let Some(q) = self.inbox(dest) {
            gnix_trace!(Subsys::Nic, "wire {} -> {}: {:?}", from, dest, event);
            q.push(event);
            return Ok(());
        }
        match event {
            WireEvent::ConnRequest(req) => {
                let q = self.inbox(from).ok_or(FabricError::ConnRefused)?;
                q.push(WireEvent::ConnFailed {
                    vc_id: req.src_vc,
                    src: dest,
                    errno: libc::ECONNREFUSED,
                });
                Ok(())
            }
            _ => Err(FabricError::ConnRefused),
        }
    }

    fn poll(&self, addr: Address) -> Option<WireEvent> {
        self.inbox(addr)?.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Address = Address::new(1, 0);
    const B: Address = Address::new(2, 0);

    #[test]
    fn test_mailbox_bounds() {
        let mbox = Mailbox::new(2);
        assert!(mbox.deliver(vec![1]).is_ok());
        assert!(mbox.deliver(vec![2]).is_ok());
        assert_eq!(mbox.deliver(vec![3]), Err(vec![3]));
        assert_eq!(mbox.take(), Some(vec![1]));
        assert_eq!(mbox.len(), 1);
    }

    #[test]
    fn test_attach_twice_fails() {
        let wire = LoopbackWire::new();
        wire.attach(A).unwrap();
        assert_eq!(wire.attach(A), Err(FabricError::InvalidArgument));
        wire.detach(A);
        assert!(wire.attach(A).is_ok());
    }

    #[test]
    fn test_post_is_fifo() {
        let wire = LoopbackWire::new();
        wire.attach(A).unwrap();
        wire.attach(B).unwrap();
        for i in 0..3 {
            let event = WireEvent::SmsgArrived { vc_id: VcId::new(i), src: A, src_vc: VcId::new(9) };
            wire.post(A, B, event).unwrap();
        }
        assert_eq!(wire.pending(B), 3);
        for i in 0..3 {
            match wire.poll(B) {
                Some(WireEvent::SmsgArrived { vc_id, src, .. }) => {
                    assert_eq!(vc_id, VcId::new(i));
                    assert_eq!(src, A);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(wire.poll(B).is_none());
    }

    #[test]
    fn test_request_to_unknown_bounces() {
        let wire = LoopbackWire::new();
        wire.attach(A).unwrap();
        let req = ConnRequest { src: A, src_vc: VcId::new(4), mbox: Arc::new(Mailbox::new(1)) };
        wire.post(A, B, WireEvent::ConnRequest(req)).unwrap();
        match wire.poll(A) {
            Some(WireEvent::ConnFailed { vc_id, src, errno }) => {
                assert_eq!(vc_id, VcId::new(4));
                assert_eq!(src, B);
                assert_eq!(errno, libc::ECONNREFUSED);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            wire.post(A, B, WireEvent::Shutdown { vc_id: VcId::new(0), src: A, src_vc: VcId::new(4) }).unwrap_err(),
            FabricError::ConnRefused
        );
    }
}

//! Virtual channel record and the NIC's dense VC table
//!
//! A `Vc` is the per-peer connection object. Records live in a `Freelist`
//! owned by the NIC; `VcTable` maps the dense `VcId` carried in wire
//! completions to the record's slot in O(1) and recycles ids LIFO.
//!
//! Everything here runs under the NIC lock. `outstanding_fab_reqs` is
//! atomic so it can be read without it.
//!
//! # State graph
//!
//! ```text
//! None ──connect/accept──► Connecting ──handshake──► Connected
//!                              │                        │
//!                          ConnFailed          disconnect / peer Shutdown
//!                              ▼                        ▼
//!                            Error              Terminating ──drained──► Terminated
//! ```
//!
//! A refusal from the peer also moves a `Connected` VC to `Error`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use gnix_core::error::{FabricError, FabricResult};
use gnix_core::freelist::{Freelist, FreelistConfig, Slot};
use gnix_core::id::{Address, Fid, VcId};
use gnix_core::kprint::Subsys;
use gnix_core::state::{VcModes, VcState};
use gnix_core::{gnix_debug, gnix_trace, gnix_warn};

use crate::cm::CmEntry;
use crate::ep::EpShared;
use crate::eq::EventType;
use crate::wire::{Mailbox, Wire, WireEvent};

/// Connection-setup resource held while a handshake is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DgramKind {
    /// Active side: request posted to the peer
    Connect,
    /// Passive side: waiting for any peer's request
    Listen,
}

/// Hardware endpoint handle bound to a connected VC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwEp(pub u64);

/// The peer's side of an established channel
pub(crate) struct Remote {
    pub(crate) vc_id: VcId,
    pub(crate) mbox: Arc<Mailbox>,
}

pub(crate) struct Vc {
    pub(crate) peer_addr: Option<Address>,
    pub(crate) ep: Arc<EpShared>,
    /// Inbound mailbox, advertised to the peer during the handshake
    pub(crate) smsg_mbox: Option<Arc<Mailbox>>,
    pub(crate) remote: Option<Remote>,
    pub(crate) dgram: Option<DgramKind>,
    pub(crate) hw_ep: Option<HwEp>,
    outstanding_fab_reqs: AtomicU32,
    conn_state: VcState,
    pub(crate) vc_id: VcId,
    pub(crate) modes: VcModes,
    pub(crate) send_queue: VecDeque<Vec<u8>>,
}

impl Vc {
    fn new(vc_id: VcId, ep: Arc<EpShared>, peer_addr: Option<Address>) -> Self {
        Vc {
            peer_addr,
            ep,
            smsg_mbox: None,
            remote: None,
            dgram: None,
            hw_ep: None,
            outstanding_fab_reqs: AtomicU32::new(0),
            conn_state: VcState::None,
            vc_id,
            modes: VcModes::empty(),
            send_queue: VecDeque::new(),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> VcState {
        self.conn_state
    }

    pub(crate) fn owner(&self) -> Fid {
        self.ep.fid
    }

    /// Move along the state graph. An edge outside the graph is a bug.
    pub(crate) fn transition(&mut self, next: VcState) {
        assert!(
            self.conn_state.can_transition_to(next),
            "vc {}: illegal transition {} -> {}",
            self.vc_id,
            self.conn_state,
            next
        );
        gnix_debug!(Subsys::Vc, "vc {}: {} -> {}", self.vc_id, self.conn_state, next);
        self.conn_state = next;
    }

    pub(crate) fn outstanding(&self) -> u32 {
        self.outstanding_fab_reqs.load(Ordering::Acquire)
    }

    pub(crate) fn fab_req_begin(&self) {
        self.outstanding_fab_reqs.fetch_add(1, Ordering::AcqRel);
    }

    /// Retire one in-flight request. Panics on underflow.
    pub(crate) fn fab_req_complete(&self) {
        let prev = self
            .outstanding_fab_reqs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        assert!(prev.is_ok(), "vc {}: outstanding request count underflow", self.vc_id);
    }

    /// Drop the handshake resource once its datagram is answered.
    pub(crate) fn dgram_done(&mut self) {
        if self.modes.dgram_posted() {
            gnix_trace!(Subsys::Vc, "vc {}: {:?} datagram answered", self.vc_id, self.dgram);
            self.modes.remove(VcModes::DGRAM_POSTED);
            self.dgram = None;
            self.fab_req_complete();
        }
    }

    /// Finish the handshake: `Connecting -> Connected`.
    pub(crate) fn establish(&mut self, remote: Remote, hw_ep: HwEp) {
        self.transition(VcState::Connected);
        gnix_debug!(
            Subsys::Vc,
            "vc {} established: remote vc {} hw_ep {}",
            self.vc_id,
            remote.vc_id,
            hw_ep.0
        );
        self.remote = Some(remote);
        self.hw_ep = Some(hw_ep);
        if !self.modes.dgram_posted() {
            self.dgram = None;
        }
        self.post_event(EventType::CONNECTED);
    }

    /// Move to `Error`, release handshake and mailbox state and report
    /// `err` on the endpoint's EQ.
    pub(crate) fn fail(&mut self, err: FabricError) {
        self.transition(VcState::Error);
        self.smsg_mbox = None;
        self.remote = None;
        self.hw_ep = None;
        self.post_error(err);
    }

    /// `Terminating -> Terminated` once drained.
    pub(crate) fn finish_teardown(&mut self) {
        debug_assert_eq!(self.outstanding(), 0);
        self.hw_ep = None;
        self.smsg_mbox = None;
        self.remote = None;
        if !self.send_queue.is_empty() {
            gnix_debug!(Subsys::Vc, "vc {}: {} sends discarded at teardown", self.vc_id, self.send_queue.len());
        }
        self.transition(VcState::Terminated);
        self.post_event(EventType::SHUTDOWN);
    }

    /// True if `src`/`src_vc` is the peer this VC is connected to.
    pub(crate) fn is_remote(&self, src: Address, src_vc: VcId) -> bool {
        self.peer_addr == Some(src) && self.remote.as_ref().map_or(false, |r| r.vc_id == src_vc)
    }

    /// Teardown notice for the connected peer, sent from `local`.
    pub(crate) fn shutdown_notice(&self, local: Address) -> Option<(Address, WireEvent)> {
        let peer = self.peer_addr?;
        let remote = self.remote.as_ref()?;
        Some((peer, WireEvent::Shutdown { vc_id: remote.vc_id, src: local, src_vc: self.vc_id }))
    }

    pub(crate) fn cm_entry(&self) -> CmEntry {
        CmEntry {
            fid: self.ep.fid,
            vc_id: self.vc_id,
            peer: self.peer_addr.unwrap_or_default(),
        }
    }

    fn post_event(&self, kind: EventType) {
        let Some(eq) = self.ep.eq.as_ref() else { return };
        if let Err(e) = eq.write(kind, &self.cm_entry().encode(), 0) {
            gnix_warn!(Subsys::Vc, "vc {}: dropping {:?} event: {}", self.vc_id, kind, e);
        }
    }

    fn post_error(&self, err: FabricError) {
        let Some(eq) = self.ep.eq.as_ref() else {
            gnix_warn!(Subsys::Vc, "vc {}: {} with no eq bound", self.vc_id, err);
            return;
        };
        let res = eq.write_error(
            self.ep.fid,
            self.ep.context,
            u64::from(self.vc_id.as_u32()),
            err.errno(),
            err.errno(),
            None,
        );
        if let Err(e) = res {
            gnix_warn!(Subsys::Vc, "vc {}: dropping error record: {}", self.vc_id, e);
        }
    }

    /// Deliver queued sends to the peer's mailbox in submission order.
    ///
    /// Only runs while `Connected`. A full mailbox leaves the remaining
    /// messages queued and sets `PENDING_MSGS`; the caller retries through
    /// the work queue. Returns the number of messages delivered.
    pub(crate) fn flush_sends(&mut self, wire: &dyn Wire, local: Address) -> FabricResult<usize> {
        if self.conn_state != VcState::Connected {
            return Ok(0);
        }
        let (Some(remote), Some(peer)) = (self.remote.as_ref(), self.peer_addr) else {
            return Err(FabricError::InvalidArgument);
        };

        let mut sent = 0;
        while let Some(msg) = self.send_queue.pop_front() {
            if let Err(msg) = remote.mbox.deliver(msg) {
                self.send_queue.push_front(msg);
                self.modes.insert(VcModes::PENDING_MSGS);
                gnix_trace!(Subsys::Vc, "vc {}: mailbox full, {} pending", self.vc_id, self.send_queue.len());
                return Ok(sent);
            }
            self.fab_req_begin();
            let posted = wire
                .post(local, peer, WireEvent::SmsgArrived { vc_id: remote.vc_id, src: local, src_vc: self.vc_id })
                .and_then(|()| wire.post(local, local, WireEvent::SendComplete { vc_id: self.vc_id }));
            if let Err(e) = posted {
                self.fab_req_complete();
                return Err(e);
            }
            sent += 1;
        }
        self.modes.remove(VcModes::PENDING_MSGS);
        Ok(sent)
    }
}

/// Live VCs of one NIC, indexed by `VcId`
pub(crate) struct VcTable {
    vcs: Freelist<Vc>,
    /// `VcId` -> slot; `None` for free or retired ids
    slots: Vec<Option<Slot>>,
    /// Recyclable ids, most recently freed on top
    free_ids: Vec<u32>,
    live: usize,
    max: usize,
}

impl VcTable {
    pub(crate) fn new(config: FreelistConfig, max: usize) -> FabricResult<Self> {
        Ok(VcTable {
            vcs: Freelist::new(config)?,
            slots: Vec::new(),
            free_ids: Vec::new(),
            live: 0,
            max,
        })
    }

    /// Allocate a VC in state `None` with a fresh id.
    pub(crate) fn insert(&mut self, ep: &Arc<EpShared>, peer: Option<Address>) -> FabricResult<VcId> {
        if self.live >= self.max {
            gnix_warn!(Subsys::Vc, "vc table full ({} live)", self.live);
            return Err(FabricError::NoMemory);
        }
        if self.free_ids.is_empty() {
            self.slots.try_reserve(1)?;
        }
        let slot = self.vcs.alloc()?;
        let id = match self.free_ids.pop() {
            Some(id) => id,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            }
        };
        let vc_id = VcId::new(id);
        self.vcs.write(slot, Vc::new(vc_id, Arc::clone(ep), peer));
        self.slots[id as usize] = Some(slot);
        self.live += 1;
        gnix_trace!(Subsys::Vc, "alloc vc {} peer {:?}", vc_id, peer);
        Ok(vc_id)
    }

    /// Take a VC out of the table and return its record to the freelist.
    ///
    /// The id is recycled unless requests are still in flight, in which
    /// case it is retired so late completions cannot reach a new VC.
    pub(crate) fn remove(&mut self, id: VcId) -> Option<Vc> {
        let slot = self.slots.get_mut(id.as_usize())?.take()?;
        // SAFETY: table slots hold initialized records; the entry was just
        // cleared so nothing else reaches this slot.
        let vc = unsafe { self.vcs.take(slot) };
        self.vcs.free(slot);
        self.live -= 1;
        if vc.outstanding() == 0 {
            self.free_ids.push(id.as_u32());
        } else {
            gnix_warn!(Subsys::Vc, "vc {} released with {} requests in flight", id, vc.outstanding());
        }
        Some(vc)
    }

    /// True if `id` was ever handed out by this table.
    pub(crate) fn issued(&self, id: VcId) -> bool {
        id.as_usize() < self.slots.len()
    }

    pub(crate) fn get(&self, id: VcId) -> Option<&Vc> {
        let slot = (*self.slots.get(id.as_usize())?)?;
        // SAFETY: table slots hold initialized records.
        Some(unsafe { self.vcs.get(slot) })
    }

    pub(crate) fn get_mut(&mut self, id: VcId) -> Option<&mut Vc> {
        let slot = (*self.slots.get(id.as_usize())?)?;
        // SAFETY: table slots hold initialized records.
        Some(unsafe { self.vcs.get_mut(slot) })
    }

    /// VC `id` if it belongs to endpoint `fid`.
    pub(crate) fn owned_mut(&mut self, id: VcId, fid: Fid) -> FabricResult<&mut Vc> {
        match self.get_mut(id) {
            Some(vc) if vc.owner() == fid => Ok(vc),
            _ => Err(FabricError::InvalidArgument),
        }
    }

    pub(crate) fn ids_owned_by(&self, fid: Fid) -> Vec<VcId> {
        (0..self.slots.len() as u32)
            .map(VcId::new)
            .filter(|&id| self.get(id).map_or(false, |vc| vc.owner() == fid))
            .collect()
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn id_space(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for VcTable {
    fn drop(&mut self) {
        for id in 0..self.slots.len() as u32 {
            drop(self.remove(VcId::new(id)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::LoopbackWire;

    fn table(max: usize) -> VcTable {
        VcTable::new(FreelistConfig::new(2, 2, 2, 4), max).unwrap()
    }

    fn ep() -> Arc<EpShared> {
        Arc::new(EpShared::new(Fid::next(), 0, None))
    }

    #[test]
    fn test_alloc_starts_in_none() {
        let mut t = table(8);
        let ep = ep();
        let id = t.insert(&ep, Some(Address::new(5, 0))).unwrap();
        let vc = t.get(id).unwrap();
        assert_eq!(vc.state(), VcState::None);
        assert_eq!(vc.outstanding(), 0);
        assert_eq!(vc.modes, VcModes::empty());
        assert!(vc.send_queue.is_empty());
        assert_eq!(vc.vc_id, id);
    }

    #[test]
    fn test_ids_unique_and_recycled_lifo() {
        let mut t = table(16);
        let ep = ep();
        let ids: Vec<VcId> = (0..10).map(|_| t.insert(&ep, None).unwrap()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 10);

        t.remove(ids[3]).unwrap();
        t.remove(ids[7]).unwrap();
        assert_eq!(t.insert(&ep, None).unwrap(), ids[7]);
        assert_eq!(t.insert(&ep, None).unwrap(), ids[3]);
        assert_eq!(t.live(), 10);
        assert_eq!(t.id_space(), 10);
    }

    #[test]
    fn test_table_limit() {
        let mut t = table(2);
        let ep = ep();
        t.insert(&ep, None).unwrap();
        t.insert(&ep, None).unwrap();
        assert_eq!(t.insert(&ep, None), Err(FabricError::NoMemory));
    }

    #[test]
    fn test_busy_id_is_retired() {
        let mut t = table(4);
        let ep = ep();
        let id = t.insert(&ep, None).unwrap();
        t.get(id).unwrap().fab_req_begin();
        drop(t.remove(id));
        assert!(t.issued(id));
        assert!(t.get(id).is_none());
        assert_ne!(t.insert(&ep, None).unwrap(), id);
    }

    #[test]
    fn test_owner_check() {
        let mut t = table(4);
        let (a, b) = (ep(), ep());
        let id = t.insert(&a, None).unwrap();
        assert!(t.owned_mut(id, a.fid).is_ok());
        assert_eq!(t.owned_mut(id, b.fid).err(), Some(FabricError::InvalidArgument));
        assert_eq!(t.ids_owned_by(a.fid), vec![id]);
        assert!(t.ids_owned_by(b.fid).is_empty());
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn test_outstanding_underflow_panics() {
        let mut t = table(4);
        let ep = ep();
        let id = t.insert(&ep, None).unwrap();
        t.get(id).unwrap().fab_req_complete();
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn test_illegal_transition_panics() {
        let mut t = table(4);
        let ep = ep();
        let id = t.insert(&ep, None).unwrap();
        t.get_mut(id).unwrap().transition(VcState::Connected);
    }

    #[test]
    fn test_flush_respects_mailbox_and_order() {
        let wire = LoopbackWire::new();
        let (local, peer) = (Address::new(1, 0), Address::new(2, 0));
        wire.attach(local).unwrap();
        wire.attach(peer).unwrap();

        let mut t = table(4);
        let ep = ep();
        let id = t.insert(&ep, Some(peer)).unwrap();
        let vc = t.get_mut(id).unwrap();
        for i in 0..3u8 {
            vc.send_queue.push_back(vec![i]);
        }
        assert_eq!(vc.flush_sends(&wire, local), Ok(0));

        let mbox = Arc::new(Mailbox::new(2));
        vc.transition(VcState::Connecting);
        vc.establish(Remote { vc_id: VcId::new(9), mbox: Arc::clone(&mbox) }, HwEp(1));

        assert_eq!(vc.flush_sends(&wire, local), Ok(2));
        assert!(vc.modes.pending_msgs());
        assert_eq!(vc.outstanding(), 2);
        assert_eq!(mbox.take(), Some(vec![0]));
        assert_eq!(mbox.take(), Some(vec![1]));

        assert_eq!(vc.flush_sends(&wire, local), Ok(1));
        assert!(!vc.modes.pending_msgs());
        assert_eq!(mbox.take(), Some(vec![2]));
        assert_eq!(wire.pending(peer), 3);
        assert_eq!(wire.pending(local), 3);
    }
}

//! NIC: owner of the VC table, the progress work queue and the wire address
//!
//! One lock guards every VC of the NIC together with its bookkeeping
//! lists. Application calls (`connect`, `disconnect`, `destroy`, `send`)
//! and wire completions handled by `progress` serialize on it, so state
//! and mode updates never race. EQ writes happen under this lock; the
//! order is always NIC lock, then EQ lock.
//!
//! # Handshake
//!
//! ```text
//!  active (connect)                         passive (accept / connect)
//!  ────────────────                         ──────────────────────────
//!  None -> Connecting
//!  post ConnRequest{src_vc, mbox} ───────►  match peer VC, listener, or park
//!                                           Connecting -> Connected
//!                                 ◄───────  post ConnResponse{dst_vc, mbox}
//!  Connecting -> Connected
//! ```
//!
//! A request that finds no VC for its source and no listener is parked
//! until a matching `connect` or the next `accept`. Crossed requests
//! (both sides connect) complete on whichever message arrives first; the
//! later one only retires the outstanding datagram.
//!
//! A response that names no live VC, or a VC connecting to someone else,
//! is answered with `ConnFailed` so the responder does not stay bound to
//! a dead channel. `disconnect` and endpoint release send `Shutdown` to
//! the peer, which tears its side down and reports `SHUTDOWN` on its EQ.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use gnix_core::error::{FabricError, FabricResult};
use gnix_core::fastlock::FastLock;
use gnix_core::id::{Address, Fid, VcId};
use gnix_core::kprint::Subsys;
use gnix_core::state::{VcModes, VcState};
use gnix_core::{gnix_debug, gnix_trace, gnix_warn};

use crate::config::ProviderConfig;
use crate::ep::{EpShared, RxMessage};
use crate::fabric::{Fabric, FabricRef};
use crate::vc::{DgramKind, HwEp, Remote, Vc, VcTable};
use crate::wire::{ConnRequest, ConnResponse, Mailbox, Wire, WireEvent};

struct NicInner {
    vcs: VcTable,
    /// Peer address -> VC, for matching incoming requests
    peers: HashMap<Address, VcId>,
    /// Accepting VCs waiting for any peer, oldest first
    listeners: VecDeque<VcId>,
    /// Requests that arrived before a VC wanted them
    parked: VecDeque<ConnRequest>,
    /// VCs with deferred progress work
    wq: VecDeque<VcId>,
    next_hw_ep: u64,
}

impl NicInner {
    fn alloc_hw_ep(&mut self) -> HwEp {
        self.next_hw_ep += 1;
        HwEp(self.next_hw_ep)
    }

    /// Record `id` as the VC for `peer` unless another VC already is.
    fn register(&mut self, id: VcId, peer: Address) {
        if self.peers.contains_key(&peer) {
            return;
        }
        self.peers.insert(peer, id);
        if let Some(vc) = self.vcs.get_mut(id) {
            vc.modes.insert(VcModes::IN_TABLE);
        }
    }

    /// Drop every list entry naming `id`.
    fn unlink(&mut self, id: VcId) {
        if let Some(vc) = self.vcs.get(id) {
            if vc.modes.in_table() {
                if let Some(peer) = vc.peer_addr {
                    self.peers.remove(&peer);
                }
            }
        }
        self.listeners.retain(|&l| l != id);
        self.wq.retain(|&w| w != id);
    }

    fn add_to_wq(&mut self, id: VcId) -> FabricResult<()> {
        let vc = self.vcs.get_mut(id).ok_or(FabricError::InvalidArgument)?;
        if !vc.modes.test_and_set(VcModes::IN_WQ) {
            return Ok(());
        }
        if let Err(e) = self.wq.try_reserve(1) {
            vc.modes.remove(VcModes::IN_WQ);
            return Err(e.into());
        }
        self.wq.push_back(id);
        gnix_trace!(Subsys::Nic, "vc {} queued for progress", id);
        Ok(())
    }

    /// VC named by a wire completion, if it is still live.
    ///
    /// Records for released ids, or for ids issued by an earlier NIC at
    /// the same address, are logged and dropped.
    fn completion_vc(&mut self, id: VcId, what: &str) -> Option<&mut Vc> {
        let issued = self.vcs.issued(id);
        let vc = self.vcs.get_mut(id);
        if vc.is_none() {
            let why = if issued { "released" } else { "unknown" };
            gnix_warn!(Subsys::Nic, "{} for {} vc {}, dropped", what, why, id);
        }
        vc
    }
}

/// Network interface bound to one wire address
pub struct Nic {
    fid: Fid,
    addr: Address,
    inner: FastLock<NicInner>,
    fabric: FabricRef,
}

impl Nic {
    /// Attach a NIC at `addr` on `fabric`'s wire.
    pub fn open(fabric: &Fabric, addr: Address) -> FabricResult<Arc<Nic>> {
        let fabric = fabric.reference();
        let cfg = fabric.config();
        let inner = NicInner {
            vcs: VcTable::new(cfg.vc_freelist, cfg.max_vcs)?,
            peers: HashMap::new(),
            listeners: VecDeque::new(),
            parked: VecDeque::new(),
            wq: VecDeque::new(),
            next_hw_ep: 0,
        };
        fabric.wire().attach(addr)?;
        let nic = Nic { fid: Fid::next(), addr, inner: FastLock::new(inner), fabric };
        gnix_debug!(Subsys::Nic, "open nic {} at {}", nic.fid.0, addr);
        Ok(Arc::new(nic))
    }

    pub fn fid(&self) -> Fid {
        self.fid
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    fn config(&self) -> &ProviderConfig {
        self.fabric.config()
    }

    fn wire(&self) -> &dyn Wire {
        self.fabric.wire().as_ref()
    }

    pub fn live_vcs(&self) -> usize {
        self.inner.acquire().vcs.live()
    }

    /// VCs currently waiting on the work queue
    pub fn wq_len(&self) -> usize {
        self.inner.acquire().wq.len()
    }

    /// Connection requests waiting for a local VC
    pub fn parked_requests(&self) -> usize {
        self.inner.acquire().parked.len()
    }

    // ------------------------------------------------------------------
    // VC entry points (called through `Endpoint`)
    // ------------------------------------------------------------------

    pub(crate) fn vc_alloc(&self, ep: &Arc<EpShared>, peer: Option<Address>) -> FabricResult<VcId> {
        let mut inner = self.inner.acquire();
        let inner = &mut *inner;
        if peer.is_some() {
            inner.peers.try_reserve(1)?;
        }
        let id = inner.vcs.insert(ep, peer)?;
        if let Some(peer) = peer {
            inner.register(id, peer);
        }
        Ok(id)
    }

    pub(crate) fn vc_connect(&self, ep: &EpShared, id: VcId) -> FabricResult<()> {
        let mut inner = self.inner.acquire();
        let inner = &mut *inner;

        let vc = inner.vcs.owned_mut(id, ep.fid)?;
        if vc.state() != VcState::None {
            return Err(FabricError::InvalidArgument);
        }
        let peer = vc.peer_addr.ok_or(FabricError::InvalidArgument)?;
        let mbox = Arc::new(Mailbox::new(self.config().mbox_msgs));

        // The peer got there first.
        if let Some(pos) = inner.parked.iter().position(|r| r.src == peer) {
            if let Some(req) = inner.parked.remove(pos) {
                if let Some(vc) = inner.vcs.get_mut(id) {
                    vc.smsg_mbox = Some(mbox);
                    vc.transition(VcState::Connecting);
                }
                inner.register(id, peer);
                self.complete_request(inner, id, &req);
                return Ok(());
            }
        }

        let req = ConnRequest { src: self.addr, src_vc: id, mbox: Arc::clone(&mbox) };
        self.wire().post(self.addr, peer, WireEvent::ConnRequest(req))?;

        let vc = inner.vcs.owned_mut(id, ep.fid)?;
        vc.smsg_mbox = Some(mbox);
        vc.dgram = Some(DgramKind::Connect);
        vc.fab_req_begin();
        vc.modes.insert(VcModes::DGRAM_POSTED);
        vc.transition(VcState::Connecting);
        inner.register(id, peer);
        gnix_debug!(Subsys::Nic, "vc {} connect -> {}", id, peer);
        Ok(())
    }

    pub(crate) fn vc_accept(&self, ep: &EpShared, id: VcId) -> FabricResult<()> {
        let mut inner = self.inner.acquire();
        let inner = &mut *inner;

        let vc = inner.vcs.owned_mut(id, ep.fid)?;
        if vc.peer_addr.is_some() || vc.state() != VcState::None {
            return Err(FabricError::InvalidArgument);
        }
        let parked = inner.parked.iter().position(|r| !inner.peers.contains_key(&r.src));
        if parked.is_none() {
            inner.listeners.try_reserve(1)?;
        }

        let vc = inner.vcs.owned_mut(id, ep.fid)?;
        vc.smsg_mbox = Some(Arc::new(Mailbox::new(self.config().mbox_msgs)));
        vc.dgram = Some(DgramKind::Listen);
        vc.fab_req_begin();
        vc.transition(VcState::Connecting);

        match parked.and_then(|pos| inner.parked.remove(pos)) {
            Some(req) => self.bind_listener(inner, id, &req),
            None => {
                inner.listeners.push_back(id);
                gnix_debug!(Subsys::Nic, "vc {} listening", id);
            }
        }
        Ok(())
    }

    pub(crate) fn vc_disconnect(&self, ep: &EpShared, id: VcId) -> FabricResult<()> {
        let mut inner = self.inner.acquire();
        let inner = &mut *inner;
        let vc = inner.vcs.owned_mut(id, ep.fid)?;
        if vc.state() != VcState::Connected {
            return Err(FabricError::InvalidArgument);
        }
        // The teardown entry must exist before the state moves.
        inner.wq.try_reserve(1)?;
        vc.transition(VcState::Terminating);
        if let Some((peer, notice)) = vc.shutdown_notice(self.addr) {
            if let Err(e) = self.wire().post(self.addr, peer, notice) {
                gnix_debug!(Subsys::Nic, "vc {}: shutdown to {} undeliverable: {}", id, peer, e);
            }
        }
        inner.add_to_wq(id)
    }

    pub(crate) fn vc_destroy(&self, ep: &EpShared, id: VcId) -> FabricResult<()> {
        let mut inner = self.inner.acquire();
        let vc = inner.vcs.owned_mut(id, ep.fid)?;
        if vc.outstanding() != 0 || !vc.state().is_destroyable() {
            gnix_debug!(
                Subsys::Nic,
                "vc {} destroy refused: state {} outstanding {}",
                id,
                vc.state(),
                vc.outstanding()
            );
            return Err(FabricError::InvalidArgument);
        }
        inner.unlink(id);
        let vc = inner.vcs.remove(id);
        drop(inner);
        drop(vc);
        Ok(())
    }

    pub(crate) fn vc_add_to_wq(&self, ep: &EpShared, id: VcId) -> FabricResult<()> {
        let mut inner = self.inner.acquire();
        inner.vcs.owned_mut(id, ep.fid)?;
        inner.add_to_wq(id)
    }

    pub(crate) fn vc_send(&self, ep: &EpShared, id: VcId, msg: &[u8]) -> FabricResult<()> {
        let mut inner = self.inner.acquire();
        let inner = &mut *inner;
        let vc = inner.vcs.owned_mut(id, ep.fid)?;
        match vc.state() {
            VcState::None | VcState::Connecting | VcState::Connected => {}
            _ => return Err(FabricError::InvalidArgument),
        }
        let mut copy = Vec::new();
        copy.try_reserve_exact(msg.len())?;
        copy.extend_from_slice(msg);
        vc.send_queue.try_reserve(1)?;
        vc.send_queue.push_back(copy);

        if vc.state() == VcState::Connected && !vc.modes.pending_msgs() {
            self.flush(inner, id);
        }
        Ok(())
    }

    /// Run `f` on VC `id` of endpoint `ep`.
    pub(crate) fn with_vc<R>(&self, ep: &EpShared, id: VcId, f: impl FnOnce(&Vc) -> R) -> FabricResult<R> {
        let mut inner = self.inner.acquire();
        let vc = inner.vcs.owned_mut(id, ep.fid)?;
        Ok(f(vc))
    }

    pub(crate) fn vc_fab_req_begin(&self, ep: &EpShared, id: VcId) -> FabricResult<()> {
        self.with_vc(ep, id, |vc| vc.fab_req_begin())
    }

    pub(crate) fn vc_fab_req_complete(&self, ep: &EpShared, id: VcId) -> FabricResult<()> {
        let mut inner = self.inner.acquire();
        let vc = inner.vcs.owned_mut(id, ep.fid)?;
        if vc.outstanding() == 0 {
            return Err(FabricError::InvalidArgument);
        }
        vc.fab_req_complete();
        if vc.state() == VcState::Terminating && vc.outstanding() == 0 {
            inner.add_to_wq(id)?;
        }
        Ok(())
    }

    /// Release every VC of a closing endpoint, whatever its state.
    pub(crate) fn release_endpoint(&self, fid: Fid) {
        let mut inner = self.inner.acquire();
        let mut released = Vec::new();
        for id in inner.vcs.ids_owned_by(fid) {
            inner.unlink(id);
            if let Some(vc) = inner.vcs.remove(id) {
                if !vc.state().is_destroyable() {
                    gnix_warn!(Subsys::Nic, "vc {} released in state {}", id, vc.state());
                }
                if vc.state() == VcState::Connected {
                    if let Some((peer, notice)) = vc.shutdown_notice(self.addr) {
                        let _ = self.wire().post(self.addr, peer, notice);
                    }
                }
                released.push(vc);
            }
        }
        drop(inner);
        if !released.is_empty() {
            gnix_debug!(Subsys::Nic, "endpoint {} released {} vcs", fid.0, released.len());
        }
    }

    // ------------------------------------------------------------------
    // Handshake helpers (NIC lock held)
    // ------------------------------------------------------------------

    /// Connect `id` (already `Connecting`) to the requester and answer it.
    fn complete_request(&self, inner: &mut NicInner, id: VcId, req: &ConnRequest) {
        let hw_ep = inner.alloc_hw_ep();
        let Some(vc) = inner.vcs.get_mut(id) else { return };
        vc.establish(Remote { vc_id: req.src_vc, mbox: Arc::clone(&req.mbox) }, hw_ep);

        let Some(mbox) = vc.smsg_mbox.clone() else { return };
        let resp = ConnResponse { src: self.addr, src_vc: id, dst_vc: req.src_vc, mbox };
        if let Err(e) = self.wire().post(self.addr, req.src, WireEvent::ConnResponse(resp)) {
            gnix_warn!(Subsys::Nic, "vc {}: response to {} failed: {}", id, req.src, e);
            vc.fail(e);
            return;
        }
        self.flush(inner, id);
    }

    /// Bind an accepting VC to `req`'s sender.
    fn bind_listener(&self, inner: &mut NicInner, id: VcId, req: &ConnRequest) {
        let Some(vc) = inner.vcs.get_mut(id) else { return };
        vc.peer_addr = Some(req.src);
        vc.dgram = None;
        vc.fab_req_complete();
        inner.register(id, req.src);
        gnix_debug!(Subsys::Nic, "vc {} accepted {}", id, req.src);
        self.complete_request(inner, id, req);
    }

    fn flush(&self, inner: &mut NicInner, id: VcId) {
        let Some(vc) = inner.vcs.get_mut(id) else { return };
        match vc.flush_sends(self.wire(), self.addr) {
            Ok(_) if vc.modes.pending_msgs() => {
                if let Err(e) = inner.add_to_wq(id) {
                    gnix_warn!(Subsys::Nic, "vc {}: cannot queue retry: {}", id, e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                gnix_warn!(Subsys::Nic, "vc {}: send failed: {}", id, e);
                vc.fail(e);
            }
        }
    }

    /// Tell VC `vc_id` at `dest` that its handshake with this NIC failed.
    fn refuse(&self, dest: Address, vc_id: VcId) {
        let failed = WireEvent::ConnFailed { vc_id, src: self.addr, errno: libc::ECONNREFUSED };
        if let Err(e) = self.wire().post(self.addr, dest, failed) {
            gnix_debug!(Subsys::Nic, "refusal to {} undeliverable: {}", dest, e);
        }
    }

    fn park(&self, inner: &mut NicInner, req: ConnRequest) {
        if inner.parked.try_reserve(1).is_err() {
            self.refuse(req.src, req.src_vc);
            return;
        }
        gnix_debug!(Subsys::Nic, "parked request from {} vc {}", req.src, req.src_vc);
        inner.parked.push_back(req);
    }

    // ------------------------------------------------------------------
    // Progress
    // ------------------------------------------------------------------

    /// Handle up to `progress_batch` wire events, then run the work queue.
    /// Returns the number of wire events handled.
    pub fn progress(&self) -> usize {
        let batch = self.config().progress_batch;
        let mut inner = self.inner.acquire();
        let inner = &mut *inner;

        let mut handled = 0;
        while handled < batch {
            let Some(event) = self.wire().poll(self.addr) else { break };
            self.handle_event(inner, event);
            handled += 1;
        }
        self.process_wq(inner);
        handled
    }

    fn handle_event(&self, inner: &mut NicInner, event: WireEvent) {
        match event {
            WireEvent::ConnRequest(req) => self.on_conn_request(inner, req),
            WireEvent::ConnResponse(resp) => self.on_conn_response(inner, resp),
            WireEvent::ConnFailed { vc_id, src, errno } => {
                let Some(vc) = inner.completion_vc(vc_id, "ConnFailed") else { return };
                if vc.peer_addr != Some(src) {
                    gnix_warn!(Subsys::Nic, "vc {}: ConnFailed from {} but peer is {:?}, dropped", vc_id, src, vc.peer_addr);
                    return;
                }
                vc.dgram_done();
                match vc.state() {
                    VcState::Connecting | VcState::Connected => {
                        gnix_debug!(Subsys::Nic, "vc {} refused by {}: errno {}", vc_id, src, errno);
                        vc.fail(FabricError::from_errno(errno));
                    }
                    state => gnix_trace!(Subsys::Nic, "vc {}: ConnFailed ignored in {}", vc_id, state),
                }
            }
            WireEvent::SmsgArrived { vc_id, src, src_vc } => {
                let Some(vc) = inner.vcs.get(vc_id) else {
                    gnix_warn!(Subsys::Nic, "message for unknown vc {}, dropped", vc_id);
                    return;
                };
                if !vc.is_remote(src, src_vc) {
                    gnix_warn!(Subsys::Nic, "vc {}: message from stale sender {} vc {}, dropped", vc_id, src, src_vc);
                    return;
                }
                let Some(payload) = vc.smsg_mbox.as_ref().and_then(|m| m.take()) else {
                    gnix_warn!(Subsys::Nic, "vc {}: arrival with empty mailbox", vc_id);
                    return;
                };
                vc.ep.rx.push(RxMessage { vc: vc_id, payload });
            }
            WireEvent::SendComplete { vc_id } => {
                let Some(vc) = inner.completion_vc(vc_id, "SendComplete") else { return };
                vc.fab_req_complete();
            }
            WireEvent::Shutdown { vc_id, src, src_vc } => self.on_shutdown(inner, vc_id, src, src_vc),
        }
    }

    /// The peer began teardown: follow it unless already on the way down.
    fn on_shutdown(&self, inner: &mut NicInner, id: VcId, src: Address, src_vc: VcId) {
        let Some(vc) = inner.vcs.get_mut(id) else {
            gnix_debug!(Subsys::Nic, "shutdown for unknown vc {}, dropped", id);
            return;
        };
        if !vc.is_remote(src, src_vc) {
            gnix_debug!(Subsys::Nic, "vc {}: shutdown from stale sender {} vc {}, dropped", id, src, src_vc);
            return;
        }
        if vc.state() != VcState::Connected {
            return;
        }
        gnix_debug!(Subsys::Nic, "vc {}: peer {} disconnected", id, src);
        vc.transition(VcState::Terminating);
        if let Err(e) = inner.add_to_wq(id) {
            gnix_warn!(Subsys::Nic, "vc {}: cannot queue teardown: {}", id, e);
        }
    }

    fn on_conn_request(&self, inner: &mut NicInner, req: ConnRequest) {
        gnix_trace!(Subsys::Nic, "request from {} vc {}", req.src, req.src_vc);
        let matched = inner.peers.get(&req.src).copied();
        let Some(id) = matched else {
            match inner.listeners.pop_front() {
                Some(id) => self.bind_listener(inner, id, &req),
                None => self.park(inner, req),
            }
            return;
        };
        match inner.vcs.get(id).map(|vc| vc.state()) {
            Some(VcState::Connecting) => self.complete_request(inner, id, &req),
            Some(VcState::None) => self.park(inner, req),
            state => {
                gnix_debug!(Subsys::Nic, "refusing {}: vc {} is {:?}", req.src, id, state);
                self.refuse(req.src, req.src_vc);
            }
        }
    }

    fn on_conn_response(&self, inner: &mut NicInner, resp: ConnResponse) {
        let Some(vc) = inner.completion_vc(resp.dst_vc, "ConnResponse") else {
            self.refuse(resp.src, resp.src_vc);
            return;
        };
        if vc.peer_addr != Some(resp.src) {
            gnix_warn!(Subsys::Nic, "vc {}: response from {} but peer is {:?}", resp.dst_vc, resp.src, vc.peer_addr);
            self.refuse(resp.src, resp.src_vc);
            return;
        }
        vc.dgram_done();
        match vc.state() {
            VcState::Connecting => {}
            // Crossed handshake already completed from the peer's request.
            VcState::Connected | VcState::Terminating if vc.is_remote(resp.src, resp.src_vc) => {
                gnix_trace!(Subsys::Nic, "vc {}: late response from {}", resp.dst_vc, resp.src);
                return;
            }
            state => {
                gnix_debug!(Subsys::Nic, "vc {}: refusing response in {}", resp.dst_vc, state);
                self.refuse(resp.src, resp.src_vc);
                return;
            }
        }

        let hw_ep = inner.alloc_hw_ep();
        let Some(vc) = inner.vcs.get_mut(resp.dst_vc) else { return };
        vc.establish(Remote { vc_id: resp.src_vc, mbox: resp.mbox }, hw_ep);
        self.flush(inner, resp.dst_vc);
    }

    fn process_wq(&self, inner: &mut NicInner) {
        for _ in 0..inner.wq.len() {
            let Some(id) = inner.wq.pop_front() else { break };
            let Some(vc) = inner.vcs.get_mut(id) else { continue };
            vc.modes.remove(VcModes::IN_WQ);
            match vc.state() {
                VcState::Connected => self.flush(inner, id),
                VcState::Terminating if vc.outstanding() == 0 => vc.finish_teardown(),
                VcState::Terminating => {
                    if let Err(e) = inner.add_to_wq(id) {
                        gnix_warn!(Subsys::Nic, "vc {}: cannot requeue teardown: {}", id, e);
                    }
                }
                _ => {}
            }
        }
    }
}

impl Drop for Nic {
    fn drop(&mut self) {
        self.wire().detach(self.addr);
        gnix_debug!(Subsys::Nic, "close nic {} at {}", self.fid.0, self.addr);
    }
}

//! Endpoint: the application-facing owner of VCs
//!
//! An endpoint is opened on a NIC and optionally bound to an EQ, which
//! receives `CONNECTED` / `SHUTDOWN` events and handshake failures for
//! every VC the endpoint owns. Dropping the endpoint releases its VCs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use gnix_core::error::{FabricError, FabricResult};
use gnix_core::id::{Address, Fid, VcId};
use gnix_core::kprint::Subsys;
use gnix_core::state::{VcModes, VcState};
use gnix_core::gnix_debug;

use crate::eq::{EqBinding, EventQueue};
use crate::nic::Nic;
use crate::vc::HwEp;

/// Message delivered to an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxMessage {
    pub vc: VcId,
    pub payload: Vec<u8>,
}

/// State shared between an endpoint and its VCs
pub(crate) struct EpShared {
    pub(crate) fid: Fid,
    pub(crate) context: u64,
    pub(crate) eq: Option<EqBinding>,
    pub(crate) rx: SegQueue<RxMessage>,
    closing: AtomicBool,
}

impl EpShared {
    pub(crate) fn new(fid: Fid, context: u64, eq: Option<EqBinding>) -> Self {
        EpShared { fid, context, eq, rx: SegQueue::new(), closing: AtomicBool::new(false) }
    }
}

pub struct Endpoint {
    nic: Arc<Nic>,
    shared: Arc<EpShared>,
}

impl Endpoint {
    pub fn open(nic: &Arc<Nic>, eq: Option<&EventQueue>, context: u64) -> FabricResult<Endpoint> {
        let shared = EpShared::new(Fid::next(), context, eq.map(EventQueue::bind));
        gnix_debug!(
            Subsys::Ep,
            "open ep {} on nic {} eq {:?}",
            shared.fid.0,
            nic.fid().0,
            eq.map(|q| q.fid().0)
        );
        Ok(Endpoint { nic: Arc::clone(nic), shared: Arc::new(shared) })
    }

    pub fn fid(&self) -> Fid {
        self.shared.fid
    }

    pub fn addr(&self) -> Address {
        self.nic.addr()
    }

    pub fn nic(&self) -> &Arc<Nic> {
        &self.nic
    }

    /// Stop allocating VCs; existing ones keep working until dropped.
    pub fn shutdown(&self) {
        self.shared.closing.store(true, Ordering::Release);
    }

    /// Allocate a VC in state `None`. `peer == None` makes a VC for `vc_accept`.
    pub fn vc_alloc(&self, peer: Option<Address>) -> FabricResult<VcId> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(FabricError::InvalidArgument);
        }
        self.nic.vc_alloc(&self.shared, peer)
    }

    /// Start the handshake with the VC's peer. Legal only from `None`.
    pub fn vc_connect(&self, vc: VcId) -> FabricResult<()> {
        self.nic.vc_connect(&self.shared, vc)
    }

    /// Wait for the first peer whose request arrives. The VC must have
    /// no peer and be in `None`.
    pub fn vc_accept(&self, vc: VcId) -> FabricResult<()> {
        self.nic.vc_accept(&self.shared, vc)
    }

    /// Begin teardown. Legal only from `Connected`.
    pub fn vc_disconnect(&self, vc: VcId) -> FabricResult<()> {
        self.nic.vc_disconnect(&self.shared, vc)
    }

    /// Return the VC to the NIC's freelist. Requires a drained VC in
    /// `None`, `Terminated` or `Error`.
    pub fn vc_destroy(&self, vc: VcId) -> FabricResult<()> {
        self.nic.vc_destroy(&self.shared, vc)
    }

    pub fn vc_add_to_wq(&self, vc: VcId) -> FabricResult<()> {
        self.nic.vc_add_to_wq(&self.shared, vc)
    }

    pub fn vc_state(&self, vc: VcId) -> FabricResult<VcState> {
        self.nic.with_vc(&self.shared, vc, |v| v.state())
    }

    pub fn vc_modes(&self, vc: VcId) -> FabricResult<VcModes> {
        self.nic.with_vc(&self.shared, vc, |v| v.modes)
    }

    pub fn vc_peer(&self, vc: VcId) -> FabricResult<Option<Address>> {
        self.nic.with_vc(&self.shared, vc, |v| v.peer_addr)
    }

    pub fn vc_outstanding(&self, vc: VcId) -> FabricResult<u32> {
        self.nic.with_vc(&self.shared, vc, |v| v.outstanding())
    }

    pub fn vc_hw_ep(&self, vc: VcId) -> FabricResult<Option<HwEp>> {
        self.nic.with_vc(&self.shared, vc, |v| v.hw_ep)
    }

    pub fn vc_pending_sends(&self, vc: VcId) -> FabricResult<usize> {
        self.nic.with_vc(&self.shared, vc, |v| v.send_queue.len())
    }

    /// Record a hardware request issued on `vc` outside the provider.
    pub fn vc_fab_req_begin(&self, vc: VcId) -> FabricResult<()> {
        self.nic.vc_fab_req_begin(&self.shared, vc)
    }

    /// Retire a request recorded with `vc_fab_req_begin`.
    pub fn vc_fab_req_complete(&self, vc: VcId) -> FabricResult<()> {
        self.nic.vc_fab_req_complete(&self.shared, vc)
    }

    /// Queue `msg` on the VC. Sends made before `Connected` are held and
    /// delivered in order once the handshake completes.
    pub fn send(&self, vc: VcId, msg: &[u8]) -> FabricResult<()> {
        self.nic.vc_send(&self.shared, vc, msg)
    }

    pub fn recv(&self) -> Option<RxMessage> {
        self.shared.rx.pop()
    }

    pub fn progress(&self) -> usize {
        self.nic.progress()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.nic.release_endpoint(self.shared.fid);
        gnix_debug!(Subsys::Ep, "close ep {}", self.shared.fid.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm::CmEntry;
    use crate::config::ProviderConfig;
    use crate::eq::{eq_flags, EventType};
    use crate::fabric::Fabric;

    struct Side {
        nic: Arc<Nic>,
        eq: EventQueue,
        ep: Endpoint,
    }

    fn side(f: &Fabric, device: u32) -> Side {
        let nic = Nic::open(f, Address::new(device, 0)).unwrap();
        let eq = EventQueue::open(f, None, u64::from(device)).unwrap();
        let ep = Endpoint::open(&nic, Some(&eq), 0).unwrap();
        Side { nic, eq, ep }
    }

    fn pump(sides: &[&Side], rounds: usize) {
        for _ in 0..rounds {
            for s in sides {
                s.ep.progress();
            }
        }
    }

    fn next_event(eq: &EventQueue) -> (EventType, CmEntry) {
        let mut buf = [0u8; 64];
        let ev = eq.read(&mut buf, 0).unwrap();
        (ev.kind, CmEntry::decode(&buf[..ev.len]).unwrap())
    }

    fn fabric() -> Fabric {
        Fabric::open("ep-test", ProviderConfig::default()).unwrap()
    }

    #[test]
    fn test_connect_accept_end_to_end() {
        let f = fabric();
        let (a, b) = (side(&f, 1), side(&f, 2));

        let va = a.ep.vc_alloc(Some(b.nic.addr())).unwrap();
        let vb = b.ep.vc_alloc(None).unwrap();
        assert_eq!(a.ep.vc_state(va), Ok(VcState::None));

        b.ep.vc_accept(vb).unwrap();
        a.ep.vc_connect(va).unwrap();
        assert_eq!(a.ep.vc_state(va), Ok(VcState::Connecting));
        assert_eq!(b.ep.vc_state(vb), Ok(VcState::Connecting));

        a.ep.send(va, b"first").unwrap();
        a.ep.send(va, b"second").unwrap();
        assert_eq!(a.ep.vc_pending_sends(va), Ok(2));

        pump(&[&a, &b], 4);
        assert_eq!(a.ep.vc_state(va), Ok(VcState::Connected));
        assert_eq!(b.ep.vc_state(vb), Ok(VcState::Connected));
        assert_eq!(b.ep.vc_peer(vb), Ok(Some(a.nic.addr())));
        assert!(a.ep.vc_hw_ep(va).unwrap().is_some());

        let (kind, cm) = next_event(&a.eq);
        assert_eq!(kind, EventType::CONNECTED);
        assert_eq!(cm, CmEntry { fid: a.ep.fid(), vc_id: va, peer: b.nic.addr() });
        let (kind, cm) = next_event(&b.eq);
        assert_eq!(kind, EventType::CONNECTED);
        assert_eq!(cm.vc_id, vb);
        assert_eq!(cm.peer, a.nic.addr());

        let m1 = b.ep.recv().unwrap();
        let m2 = b.ep.recv().unwrap();
        assert_eq!(m1, RxMessage { vc: vb, payload: b"first".to_vec() });
        assert_eq!(m2.payload, b"second");
        assert!(b.ep.recv().is_none());
        assert_eq!(a.ep.vc_outstanding(va), Ok(0));

        b.ep.send(vb, b"reply").unwrap();
        pump(&[&a, &b], 2);
        assert_eq!(a.ep.recv().map(|m| m.payload), Some(b"reply".to_vec()));
    }

    #[test]
    fn test_disconnect_and_destroy() {
        let f = fabric();
        let (a, b) = (side(&f, 1), side(&f, 2));
        let va = a.ep.vc_alloc(Some(b.nic.addr())).unwrap();
        let vb = b.ep.vc_alloc(None).unwrap();
        b.ep.vc_accept(vb).unwrap();
        a.ep.vc_connect(va).unwrap();

        assert_eq!(a.ep.vc_disconnect(va), Err(FabricError::InvalidArgument));
        assert_eq!(a.ep.vc_destroy(va), Err(FabricError::InvalidArgument));

        pump(&[&a, &b], 3);
        let _ = next_event(&a.eq);

        a.ep.send(va, b"x").unwrap();
        assert_eq!(a.ep.vc_outstanding(va), Ok(1));
        a.ep.vc_disconnect(va).unwrap();
        assert_eq!(a.ep.vc_state(va), Ok(VcState::Terminating));
        assert_eq!(a.ep.send(va, b"late"), Err(FabricError::InvalidArgument));
        assert_eq!(a.ep.vc_destroy(va), Err(FabricError::InvalidArgument));

        pump(&[&a], 2);
        assert_eq!(a.ep.vc_state(va), Ok(VcState::Terminated));
        assert_eq!(a.ep.vc_hw_ep(va), Ok(None));
        let (kind, cm) = next_event(&a.eq);
        assert_eq!(kind, EventType::SHUTDOWN);
        assert_eq!(cm.vc_id, va);

        assert_eq!(a.ep.vc_disconnect(va), Err(FabricError::InvalidArgument));
        assert_eq!(a.nic.live_vcs(), 1);
        a.ep.vc_destroy(va).unwrap();
        assert_eq!(a.nic.live_vcs(), 0);
        assert_eq!(a.ep.vc_state(va), Err(FabricError::InvalidArgument));
    }

    #[test]
    fn test_disconnect_tears_down_peer() {
        let f = fabric();
        let (a, b) = (side(&f, 1), side(&f, 2));
        let va = a.ep.vc_alloc(Some(b.nic.addr())).unwrap();
        let vb = b.ep.vc_alloc(None).unwrap();
        b.ep.vc_accept(vb).unwrap();
        a.ep.vc_connect(va).unwrap();
        pump(&[&a, &b], 3);
        let _ = next_event(&a.eq);
        let _ = next_event(&b.eq);

        a.ep.vc_disconnect(va).unwrap();
        // Sent before the peer hears about the teardown.
        b.ep.send(vb, b"late").unwrap();
        pump(&[&a, &b], 3);

        assert_eq!(a.ep.recv().map(|m| m.payload), Some(b"late".to_vec()));
        assert_eq!(a.ep.vc_state(va), Ok(VcState::Terminated));
        assert_eq!(b.ep.vc_state(vb), Ok(VcState::Terminated));
        assert_eq!(b.ep.vc_outstanding(vb), Ok(0));
        let (kind, cm) = next_event(&b.eq);
        assert_eq!(kind, EventType::SHUTDOWN);
        assert_eq!(cm.vc_id, vb);
        assert_eq!(next_event(&a.eq).0, EventType::SHUTDOWN);

        assert_eq!(b.ep.send(vb, b"lost"), Err(FabricError::InvalidArgument));
        a.ep.vc_destroy(va).unwrap();
        b.ep.vc_destroy(vb).unwrap();
    }

    #[test]
    fn test_dropped_endpoint_shuts_down_peer() {
        let f = fabric();
        let (a, b) = (side(&f, 1), side(&f, 2));
        let va = a.ep.vc_alloc(Some(b.nic.addr())).unwrap();
        let vb = b.ep.vc_alloc(None).unwrap();
        b.ep.vc_accept(vb).unwrap();
        a.ep.vc_connect(va).unwrap();
        pump(&[&a, &b], 3);

        let Side { nic, eq, ep } = a;
        drop(ep);
        assert_eq!(nic.live_vcs(), 0);
        pump(&[&b], 1);
        assert_eq!(b.ep.vc_state(vb), Ok(VcState::Terminated));
        assert!(eq.close().is_ok());
    }

    #[test]
    fn test_destroy_rejected_while_outstanding() {
        let f = fabric();
        let a = side(&f, 1);
        let v = a.ep.vc_alloc(None).unwrap();
        a.ep.vc_fab_req_begin(v).unwrap();
        assert_eq!(a.ep.vc_destroy(v), Err(FabricError::InvalidArgument));
        a.ep.vc_fab_req_complete(v).unwrap();
        assert_eq!(a.ep.vc_fab_req_complete(v), Err(FabricError::InvalidArgument));
        a.ep.vc_destroy(v).unwrap();
    }

    #[test]
    fn test_connect_preconditions() {
        let f = fabric();
        let a = side(&f, 1);
        let anon = a.ep.vc_alloc(None).unwrap();
        assert_eq!(a.ep.vc_connect(anon), Err(FabricError::InvalidArgument));

        let named = a.ep.vc_alloc(Some(Address::new(2, 0))).unwrap();
        assert_eq!(a.ep.vc_accept(named), Err(FabricError::InvalidArgument));

        a.ep.vc_connect(named).unwrap();
        assert_eq!(a.ep.vc_connect(named), Err(FabricError::InvalidArgument));
    }

    #[test]
    fn test_unknown_peer_reports_error() {
        let f = fabric();
        let a = side(&f, 1);
        let v = a.ep.vc_alloc(Some(Address::new(99, 0))).unwrap();
        a.ep.send(v, b"never").unwrap();
        a.ep.vc_connect(v).unwrap();
        assert!(a.ep.vc_modes(v).unwrap().dgram_posted());

        a.ep.progress();
        assert_eq!(a.ep.vc_state(v), Ok(VcState::Error));
        assert_eq!(a.ep.vc_outstanding(v), Ok(0));

        let mut buf = [0u8; 32];
        assert_eq!(a.eq.read(&mut buf, 0).err(), Some(FabricError::ErrorAvailable));
        let peeked = a.eq.readerr(eq_flags::PEEK).unwrap();
        let err = a.eq.readerr(0).unwrap();
        assert_eq!(peeked, err);
        assert_eq!(err.fid, a.ep.fid());
        assert_eq!(err.data, u64::from(v.as_u32()));
        assert_eq!(err.err, libc::ECONNREFUSED);
        assert_eq!(a.eq.read(&mut buf, 0).err(), Some(FabricError::Again));

        a.ep.vc_destroy(v).unwrap();
    }

    #[test]
    fn test_vc_ids_unique_per_nic() {
        let f = fabric();
        let a = side(&f, 1);
        let other = Endpoint::open(&a.nic, None, 0).unwrap();
        let mut ids: Vec<VcId> = (0..50).map(|_| a.ep.vc_alloc(None).unwrap()).collect();
        ids.extend((0..50).map(|_| other.vc_alloc(None).unwrap()));
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 100);

        assert_eq!(other.vc_state(ids[0]), Err(FabricError::InvalidArgument));
        drop(other);
        assert_eq!(a.nic.live_vcs(), 50);
    }

    #[test]
    fn test_shutdown_blocks_alloc() {
        let f = fabric();
        let a = side(&f, 1);
        a.ep.shutdown();
        assert_eq!(a.ep.vc_alloc(None), Err(FabricError::InvalidArgument));
    }

    #[test]
    fn test_eq_close_waits_for_endpoint() {
        let f = fabric();
        let Side { nic, eq, ep } = side(&f, 1);
        let eq = match eq.close() {
            Err(e) => {
                assert_eq!(e.error, FabricError::Busy);
                e.handle
            }
            Ok(()) => panic!("eq closed while bound"),
        };
        drop(ep);
        assert!(eq.close().is_ok());
        drop(nic);
        assert!(f.close().is_ok());
    }
}

//! Event Queue
//!
//! Ordered buffer of completion and error records between asynchronous
//! producers (progress, handshake completion) and polling readers.
//!
//! # Ordering
//!
//! Two FIFO lists share one lock. While the error list is non-empty,
//! `read` fails with `ErrorAvailable`; the caller drains errors through
//! `readerr` and then resumes normal reads. Writes never wait for a reader
//! and the queue is unbounded.
//!
//! Record storage comes from a per-queue `Freelist` held under the same
//! lock, so steady-state traffic does not touch the global allocator for
//! record headers.
//!
//! # Lifetime
//!
//! ```text
//! EventQueue::open ─► bind() ─► EqBinding (ref_cnt++) ─► drop (ref_cnt--)
//!        │
//!        └─► close(): Busy while ref_cnt > 0, else drain + release fabric
//! ```
//!
//! There is no blocking wait: `sread` is not supported and consumers poll.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use gnix_core::error::{CloseError, FabricError, FabricResult};
use gnix_core::fastlock::FastLock;
use gnix_core::freelist::{Freelist, Slot};
use gnix_core::id::Fid;
use gnix_core::kprint::Subsys;
use gnix_core::{gnix_debug, gnix_trace, gnix_warn};

use crate::fabric::{Fabric, FabricRef};

/// Flags accepted by `read` / `readerr`
pub mod eq_flags {
    /// Return the head record without removing it
    pub const PEEK: u64 = 1 << 19;
}

/// Wait mechanism requested at open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitObj {
    #[default]
    None,
    Unspec,
    Set,
    Fd,
    MutexCond,
}

/// Queue attributes
#[derive(Debug, Clone, Copy, Default)]
pub struct EqAttr {
    /// Expected queue depth; sizes the initial record pool (0 = provider default)
    pub size: usize,
    pub flags: u64,
    pub wait_obj: WaitObj,
}

/// Event type code
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventType(pub u32);

impl EventType {
    pub const NOTIFY: EventType = EventType(0);
    pub const CONNREQ: EventType = EventType(1);
    pub const CONNECTED: EventType = EventType(2);
    pub const SHUTDOWN: EventType = EventType(3);
    pub const MR_COMPLETE: EventType = EventType(4);
    pub const AV_COMPLETE: EventType = EventType(5);

    fn name(&self) -> Option<&'static str> {
        Some(match *self {
            EventType::NOTIFY => "NOTIFY",
            EventType::CONNREQ => "CONNREQ",
            EventType::CONNECTED => "CONNECTED",
            EventType::SHUTDOWN => "SHUTDOWN",
            EventType::MR_COMPLETE => "MR_COMPLETE",
            EventType::AV_COMPLETE => "AV_COMPLETE",
            _ => return None,
        })
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(n) => write!(f, "EventType({})", n),
            None => write!(f, "EventType({})", self.0),
        }
    }
}

/// Header of an event returned by `read`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EqEvent {
    pub kind: EventType,
    pub flags: u64,
    /// Payload bytes copied into the caller's buffer
    pub len: usize,
}

/// Error record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EqErrEntry {
    /// Object the error belongs to
    pub fid: Fid,
    pub context: u64,
    /// Operation-specific datum (the VC id for handshake failures)
    pub data: u64,
    /// Positive libfabric error code
    pub err: i32,
    pub prov_errno: i32,
    pub err_data: Option<Vec<u8>>,
}

impl EqErrEntry {
    pub fn err_data_size(&self) -> usize {
        self.err_data.as_ref().map_or(0, |d| d.len())
    }
}

struct EventRecord {
    kind: EventType,
    flags: u64,
    buf: Vec<u8>,
}

enum EqRecord {
    Event(EventRecord),
    Error(EqErrEntry),
}

/// Lists and record pool guarded by the queue lock
///
/// Every slot on `events` or `errors` holds an initialized record.
struct EqLists {
    pool: Freelist<EqRecord>,
    events: VecDeque<Slot>,
    errors: VecDeque<Slot>,
}

impl EqLists {
    fn push(&mut self, record: EqRecord) -> FabricResult<()> {
        let list = match record {
            EqRecord::Event(_) => &mut self.events,
            EqRecord::Error(_) => &mut self.errors,
        };
        list.try_reserve(1)?;
        let slot = self.pool.alloc()?;
        self.pool.write(slot, record);
        list.push_back(slot);
        Ok(())
    }

    fn head_event(&self) -> Option<&EventRecord> {
        let slot = *self.events.front()?;
        // SAFETY: list slots hold initialized records.
        match unsafe { self.pool.get(slot) } {
            EqRecord::Event(ev) => Some(ev),
            EqRecord::Error(_) => unreachable!("error record on event list"),
        }
    }

    fn head_error(&self) -> Option<&EqErrEntry> {
        let slot = *self.errors.front()?;
        // SAFETY: list slots hold initialized records.
        match unsafe { self.pool.get(slot) } {
            EqRecord::Error(e) => Some(e),
            EqRecord::Event(_) => unreachable!("event record on error list"),
        }
    }

    fn pop_event(&mut self) -> Option<EqRecord> {
        let slot = self.events.pop_front()?;
        Some(self.release(slot))
    }

    fn pop_error(&mut self) -> Option<EqRecord> {
        let slot = self.errors.pop_front()?;
        Some(self.release(slot))
    }

    fn release(&mut self, slot: Slot) -> EqRecord {
        // SAFETY: the slot was just unlinked from a list, so it holds an
        // initialized record that nothing else references.
        let record = unsafe { self.pool.take(slot) };
        self.pool.free(slot);
        record
    }

    /// Free every queued record; returns how many there were.
    fn drain(&mut self) -> usize {
        let mut n = 0;
        while self.pop_event().is_some() {
            n += 1;
        }
        while self.pop_error().is_some() {
            n += 1;
        }
        n
    }
}

impl Drop for EqLists {
    fn drop(&mut self) {
        self.drain();
    }
}

/// Shared queue state, reached through `EventQueue` and `EqBinding`
pub struct EqCore {
    fid: Fid,
    context: u64,
    lists: FastLock<EqLists>,
    ref_cnt: AtomicUsize,
    closed: AtomicBool,
}

impl EqCore {
    pub fn fid(&self) -> Fid {
        self.fid
    }

    pub fn context(&self) -> u64 {
        self.context
    }

    /// Append an event with a private copy of `buf`. Returns `buf.len()`.
    pub fn write(&self, kind: EventType, buf: &[u8], flags: u64) -> FabricResult<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FabricError::InvalidArgument);
        }
        let mut copy = Vec::new();
        copy.try_reserve_exact(buf.len())?;
        copy.extend_from_slice(buf);

        let len = buf.len();
        self.lists.acquire().push(EqRecord::Event(EventRecord { kind, flags, buf: copy }))?;
        gnix_trace!(Subsys::Eq, "eq {} write {:?} len={}", self.fid.0, kind, len);
        Ok(len)
    }

    /// Append an error record; independent of the event list.
    pub fn write_error(
        &self,
        fid: Fid,
        context: u64,
        data: u64,
        err: i32,
        prov_errno: i32,
        err_data: Option<&[u8]>,
    ) -> FabricResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FabricError::InvalidArgument);
        }
        let err_data = match err_data {
            Some(d) => {
                let mut v = Vec::new();
                v.try_reserve_exact(d.len())?;
                v.extend_from_slice(d);
                Some(v)
            }
            None => None,
        };
        let entry = EqErrEntry { fid, context, data, err, prov_errno, err_data };
        self.lists.acquire().push(EqRecord::Error(entry))?;
        gnix_debug!(Subsys::Eq, "eq {} error fid={} err={} prov_errno={}", self.fid.0, fid.0, err, prov_errno);
        Ok(())
    }

    /// Read the head event into `buf`.
    ///
    /// Fails `ErrorAvailable` while errors are queued, `Again` when empty,
    /// and `TooSmall` (record kept) when `buf` is shorter than the payload.
    /// With `eq_flags::PEEK` the record stays queued.
    pub fn read(&self, buf: &mut [u8], flags: u64) -> FabricResult<EqEvent> {
        let mut lists = self.lists.acquire();
        if !lists.errors.is_empty() {
            return Err(FabricError::ErrorAvailable);
        }
        let head = lists.head_event().ok_or(FabricError::Again)?;
        let len = head.buf.len();
        if buf.len() < len {
            gnix_trace!(Subsys::Eq, "eq {} read: need {} have {}", self.fid.0, len, buf.len());
            return Err(FabricError::TooSmall);
        }
        buf[..len].copy_from_slice(&head.buf);
        let event = EqEvent { kind: head.kind, flags: head.flags, len };

        if flags & eq_flags::PEEK == 0 {
            // Drop the payload after the lock is released.
            let record = lists.pop_event();
            drop(lists);
            drop(record);
        }
        Ok(event)
    }

    /// Return the head error record, removing it unless `eq_flags::PEEK`.
    pub fn readerr(&self, flags: u64) -> FabricResult<EqErrEntry> {
        let mut lists = self.lists.acquire();
        if flags & eq_flags::PEEK != 0 {
            return lists.head_error().cloned().ok_or(FabricError::Again);
        }
        match lists.pop_error() {
            Some(EqRecord::Error(e)) => Ok(e),
            Some(EqRecord::Event(_)) => unreachable!("event record on error list"),
            None => Err(FabricError::Again),
        }
    }

    /// Blocking read is not provided.
    pub fn sread(&self, _buf: &mut [u8], _timeout_ms: i32, _flags: u64) -> FabricResult<EqEvent> {
        Err(FabricError::NotSupported)
    }

    /// Describe a provider error code.
    pub fn strerror(&self, prov_errno: i32, err_data: Option<&[u8]>) -> String {
        let msg = FabricError::from_errno(prov_errno).to_string();
        match err_data {
            Some(d) if !d.is_empty() => format!("{} ({} bytes of error data)", msg, d.len()),
            _ => msg,
        }
    }

    pub fn event_count(&self) -> usize {
        self.lists.acquire().events.len()
    }

    pub fn error_count(&self) -> usize {
        self.lists.acquire().errors.len()
    }

    /// Mark closed and free queued records.
    fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let mut lists = self.lists.acquire();
        lists.drain()
    }
}

/// Open event queue
pub struct EventQueue {
    core: Arc<EqCore>,
    _fabric: FabricRef,
}

impl EventQueue {
    /// Open a queue on `fabric`.
    ///
    /// Only `WaitObj::None` and `WaitObj::Unspec` are accepted.
    pub fn open(fabric: &Fabric, attr: Option<&EqAttr>, context: u64) -> FabricResult<EventQueue> {
        let attr = attr.copied().unwrap_or_default();
        match attr.wait_obj {
            WaitObj::None | WaitObj::Unspec => {}
            other => {
                gnix_warn!(Subsys::Eq, "wait object {:?} not supported", other);
                return Err(FabricError::NotSupported);
            }
        }

        let mut pool_cfg = fabric.config().eq_freelist;
        if attr.size != 0 {
            pool_cfg.init_size = attr.size;
        }
        let lists = EqLists {
            pool: Freelist::new(pool_cfg)?,
            events: VecDeque::new(),
            errors: VecDeque::new(),
        };
        let core = EqCore {
            fid: Fid::next(),
            context,
            lists: FastLock::new(lists),
            ref_cnt: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        };
        gnix_debug!(Subsys::Eq, "open eq {} on fabric {}", core.fid.0, fabric.fid().0);
        Ok(EventQueue { core: Arc::new(core), _fabric: fabric.reference() })
    }

    /// Take a counted reference for an endpoint.
    pub fn bind(&self) -> EqBinding {
        EqBinding::new(&self.core)
    }

    pub fn ref_count(&self) -> usize {
        self.core.ref_cnt.load(Ordering::Acquire)
    }

    /// Close the queue. Fails `Busy`, handing the queue back, while
    /// bindings remain; otherwise frees every queued record and releases
    /// the fabric.
    pub fn close(self) -> Result<(), CloseError<EventQueue>> {
        let refs = self.ref_count();
        if refs != 0 {
            gnix_warn!(Subsys::Eq, "close eq {}: {} bindings remain", self.core.fid.0, refs);
            return Err(CloseError::new(self, FabricError::Busy));
        }
        let freed = self.core.shutdown();
        gnix_debug!(Subsys::Eq, "close eq {}: freed {} records", self.core.fid.0, freed);
        Ok(())
    }
}

impl Deref for EventQueue {
    type Target = EqCore;

    fn deref(&self) -> &EqCore {
        &self.core
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        if !self.core.closed.load(Ordering::Acquire) {
            gnix_warn!(Subsys::Eq, "eq {} dropped without close", self.core.fid.0);
            self.core.shutdown();
        }
    }
}

/// Counted reference from an endpoint to its EQ
pub struct EqBinding {
    core: Arc<EqCore>,
}

impl EqBinding {
    fn new(core: &Arc<EqCore>) -> Self {
        core.ref_cnt.fetch_add(1, Ordering::AcqRel);
        EqBinding { core: Arc::clone(core) }
    }
}

impl Clone for EqBinding {
    fn clone(&self) -> Self {
        EqBinding::new(&self.core)
    }
}

impl Deref for EqBinding {
    type Target = EqCore;

    fn deref(&self) -> &EqCore {
        &self.core
    }
}

impl Drop for EqBinding {
    fn drop(&mut self) {
        let prev = self.core.ref_cnt.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "eq reference count underflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use gnix_core::freelist::FreelistConfig;

    fn fabric() -> Fabric {
        Fabric::open("eq-test", ProviderConfig::default()).unwrap()
    }

    fn open(f: &Fabric) -> EventQueue {
        EventQueue::open(f, None, 0).unwrap()
    }

    #[test]
    fn test_fifo_order() {
        let f = fabric();
        let eq = open(&f);
        assert_eq!(eq.write(EventType::NOTIFY, b"A", 0), Ok(1));
        assert_eq!(eq.write(EventType::CONNECTED, b"BB", 7), Ok(2));

        let mut buf = [0u8; 16];
        let ev = eq.read(&mut buf, 0).unwrap();
        assert_eq!(ev, EqEvent { kind: EventType::NOTIFY, flags: 0, len: 1 });
        assert_eq!(&buf[..1], b"A");
        let ev = eq.read(&mut buf, 0).unwrap();
        assert_eq!(ev.kind, EventType::CONNECTED);
        assert_eq!(ev.flags, 7);
        assert_eq!(&buf[..ev.len], b"BB");
        assert_eq!(eq.read(&mut buf, 0), Err(FabricError::Again));
    }

    #[test]
    fn test_empty_read_is_again() {
        let f = fabric();
        let eq = open(&f);
        let mut buf = [0u8; 4];
        assert_eq!(eq.read(&mut buf, 0), Err(FabricError::Again));
        assert_eq!(eq.readerr(0), Err(FabricError::Again));
    }

    #[test]
    fn test_errors_block_reads_until_drained() {
        let f = fabric();
        let eq = open(&f);
        eq.write(EventType::NOTIFY, b"pending", 0).unwrap();
        eq.write_error(Fid(9), 1, 2, libc::ECONNREFUSED, 5, Some(b"diag")).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(eq.read(&mut buf, 0), Err(FabricError::ErrorAvailable));

        let err = eq.readerr(0).unwrap();
        assert_eq!(err.fid, Fid(9));
        assert_eq!(err.data, 2);
        assert_eq!(err.err, libc::ECONNREFUSED);
        assert_eq!(err.prov_errno, 5);
        assert_eq!(err.err_data_size(), 4);

        let ev = eq.read(&mut buf, 0).unwrap();
        assert_eq!(&buf[..ev.len], b"pending");
    }

    #[test]
    fn test_too_small_keeps_record() {
        let f = fabric();
        let eq = open(&f);
        eq.write(EventType::NOTIFY, b"0123456789", 0).unwrap();

        let mut small = [0u8; 4];
        assert_eq!(eq.read(&mut small, 0), Err(FabricError::TooSmall));
        assert_eq!(eq.event_count(), 1);

        let mut big = [0u8; 10];
        assert_eq!(eq.read(&mut big, 0).unwrap().len, 10);
        assert_eq!(&big, b"0123456789");
    }

    #[test]
    fn test_peek_is_repeatable() {
        let f = fabric();
        let eq = open(&f);
        eq.write(EventType::SHUTDOWN, b"xyz", 0).unwrap();
        eq.write_error(Fid(1), 0, 0, libc::EIO, 0, None).unwrap();

        let e1 = eq.readerr(eq_flags::PEEK).unwrap();
        let e2 = eq.readerr(eq_flags::PEEK).unwrap();
        assert_eq!(e1, e2);
        assert_eq!(eq.error_count(), 1);
        eq.readerr(0).unwrap();

        let mut buf = [0u8; 8];
        for _ in 0..3 {
            let ev = eq.read(&mut buf, eq_flags::PEEK).unwrap();
            assert_eq!(ev.kind, EventType::SHUTDOWN);
            assert_eq!(&buf[..ev.len], b"xyz");
        }
        assert_eq!(eq.event_count(), 1);
    }

    #[test]
    fn test_unsupported_wait_objects() {
        let f = fabric();
        for wait_obj in [WaitObj::Set, WaitObj::Fd, WaitObj::MutexCond] {
            let attr = EqAttr { wait_obj, ..Default::default() };
            assert_eq!(EventQueue::open(&f, Some(&attr), 0).err(), Some(FabricError::NotSupported));
        }
        let attr = EqAttr { wait_obj: WaitObj::Unspec, size: 8, flags: 0 };
        assert!(EventQueue::open(&f, Some(&attr), 0).is_ok());
    }

    #[test]
    fn test_sread_not_supported() {
        let f = fabric();
        let eq = open(&f);
        let mut buf = [0u8; 4];
        assert_eq!(eq.sread(&mut buf, -1, 0), Err(FabricError::NotSupported));
    }

    #[test]
    fn test_close_busy_while_bound() {
        let f = fabric();
        let eq = open(&f);
        assert_eq!(f.ref_count(), 1);

        let b1 = eq.bind();
        let b2 = b1.clone();
        assert_eq!(eq.ref_count(), 2);
        b2.write(EventType::NOTIFY, b"via binding", 0).unwrap();

        let eq = match eq.close() {
            Err(e) => {
                assert_eq!(e.error, FabricError::Busy);
                e.handle
            }
            Ok(()) => panic!("close succeeded with live bindings"),
        };
        drop(b1);
        drop(b2);

        eq.write(EventType::NOTIFY, b"queued", 0).unwrap();
        assert!(eq.close().is_ok());
        assert_eq!(f.ref_count(), 0);
        assert!(f.close().is_ok());
    }

    #[test]
    fn test_records_come_from_pool() {
        let cfg = ProviderConfig::default().eq_freelist(FreelistConfig::new(2, 2, 2, 8));
        let f = Fabric::open("eq-pool", cfg).unwrap();
        let eq = open(&f);
        for i in 0..5u8 {
            eq.write(EventType::NOTIFY, &[i], 0).unwrap();
        }
        let mut buf = [0u8; 1];
        for i in 0..5u8 {
            eq.read(&mut buf, 0).unwrap();
            assert_eq!(buf[0], i);
        }
        let pool = eq.lists.acquire();
        assert_eq!(pool.pool.in_use(), 0);
        assert!(pool.pool.refill_count() >= 1);
    }

    #[test]
    fn test_concurrent_writers() {
        let f = fabric();
        let eq = open(&f);
        let binding = eq.bind();
        std::thread::scope(|s| {
            for t in 0..4u8 {
                let b = binding.clone();
                s.spawn(move || {
                    for i in 0..100u8 {
                        b.write(EventType::NOTIFY, &[t, i], 0).unwrap();
                    }
                });
            }
        });
        assert_eq!(eq.event_count(), 400);

        let mut last = [None::<u8>; 4];
        let mut buf = [0u8; 2];
        while let Ok(ev) = eq.read(&mut buf, 0) {
            assert_eq!(ev.len, 2);
            let (t, i) = (buf[0] as usize, buf[1]);
            assert!(last[t].map_or(true, |p| p < i));
            last[t] = Some(i);
        }
        drop(binding);
    }

    #[test]
    fn test_strerror() {
        let f = fabric();
        let eq = open(&f);
        assert_eq!(eq.strerror(libc::ECONNREFUSED, None), "connection refused");
        assert!(eq.strerror(libc::EIO, Some(b"ab")).contains("2 bytes"));
    }
}

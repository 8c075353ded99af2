//! GNIX End-to-End Smoke Test
//!
//! Exercises the provider core over the loopback wire:
//!   Part A (Freelist): initial fill, refill growth, LIFO reuse
//!   Part B (Event Queue): ordering, error priority, too-small, peek, close
//!   Part C (Virtual channels): connect/accept, ordered sends, teardown
//!   Part D (Failure paths): unreachable peer, destroy preconditions
//!
//! Run: ./target/release/vc-smoke
//! (GNIX_LOG_LEVEL=debug for provider tracing)

use gnix_core::freelist::{Freelist, FreelistConfig};
use gnix_core::{Address, FabricError, VcState};

use gnix_prov::{eq_flags, CmEntry, Endpoint, EventQueue, EventType, Fabric, Nic, ProviderConfig};

use std::sync::Arc;

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

/// One side of a connection: NIC, EQ and endpoint.
struct Peer {
    nic: Arc<Nic>,
    eq: EventQueue,
    ep: Endpoint,
}

fn open_peer(fabric: &Fabric, device: u32) -> Result<Peer, FabricError> {
    let nic = Nic::open(fabric, Address::new(device, 0))?;
    let eq = EventQueue::open(fabric, None, u64::from(device))?;
    let ep = Endpoint::open(&nic, Some(&eq), 0)?;
    Ok(Peer { nic, eq, ep })
}

/// Endpoint first so the EQ is unbound when closed.
fn close_peer(p: Peer) {
    let Peer { nic, eq, ep } = p;
    drop(ep);
    let _ = eq.close();
    drop(nic);
}

fn pump(peers: &[&Peer], rounds: usize) {
    for _ in 0..rounds {
        for p in peers {
            p.ep.progress();
        }
    }
}

fn read_cm(eq: &EventQueue) -> Option<(EventType, CmEntry)> {
    let mut buf = [0u8; 64];
    let ev = eq.read(&mut buf, 0).ok()?;
    Some((ev.kind, CmEntry::decode(&buf[..ev.len]).ok()?))
}

// ════════════════════════════════════════════════════════════
// Part A: Freelist
// ════════════════════════════════════════════════════════════

fn test_freelist(t: &mut TestRunner) {
    t.section("Part A: Freelist");

    let mut fl: Freelist<[u64; 4]> = match Freelist::new(FreelistConfig::new(8, 4, 2, 16)) {
        Ok(fl) => { t.pass("init 8 / refill 4 / growth 2 / max 16"); fl }
        Err(e) => { t.fail("init", &e.to_string()); return; }
    };

    let slots: Vec<_> = (0..8).filter_map(|_| fl.alloc().ok()).collect();
    t.check(
        "8 allocs without refill",
        slots.len() == 8 && fl.refill_count() == 0,
        &format!("allocs={} refills={}", slots.len(), fl.refill_count()),
    );

    let ninth = fl.alloc();
    t.check(
        "9th alloc refills once, refill size doubles",
        ninth.is_ok() && fl.refill_count() == 1 && fl.refill_size() == 8,
        &format!("refills={} next={}", fl.refill_count(), fl.refill_size()),
    );

    fl.free(slots[3]);
    let again = fl.alloc();
    t.check("freed slot handed out first", again == Ok(slots[3]), &format!("{:?}", again));

    for _ in 0..64 {
        let _ = fl.alloc();
    }
    t.check(
        "refill size clamped at max",
        fl.refill_size() == 16,
        &format!("next={}", fl.refill_size()),
    );

    let chunks = fl.chunk_count();
    t.check("destroy releases every chunk", fl.destroy() == chunks, "chunk count mismatch");
}

// ════════════════════════════════════════════════════════════
// Part B: Event Queue
// ════════════════════════════════════════════════════════════

fn test_eq(t: &mut TestRunner, fabric: &Fabric) {
    t.section("Part B: Event Queue");

    let eq = match EventQueue::open(fabric, None, 0) {
        Ok(eq) => { t.pass("open"); eq }
        Err(e) => { t.fail("open", &e.to_string()); return; }
    };
    let mut buf = [0u8; 16];

    t.check("empty read -> EAGAIN", eq.read(&mut buf, 0) == Err(FabricError::Again), "");

    let _ = eq.write(EventType::NOTIFY, b"A", 0);
    let _ = eq.write(EventType::NOTIFY, b"B", 0);
    let first = eq.read(&mut buf, 0).map(|ev| buf[..ev.len].to_vec());
    t.check("FIFO: A before B", first == Ok(b"A".to_vec()), &format!("{:?}", first));

    let _ = eq.write_error(eq.fid(), 0, 7, libc::EIO, 0, None);
    t.check(
        "pending error blocks read",
        eq.read(&mut buf, 0) == Err(FabricError::ErrorAvailable),
        "",
    );
    let err = eq.readerr(0);
    t.check("readerr returns the error", err.as_ref().map(|e| e.data) == Ok(7), &format!("{:?}", err));
    let second = eq.read(&mut buf, 0).map(|ev| buf[..ev.len].to_vec());
    t.check("event survives error drain", second == Ok(b"B".to_vec()), &format!("{:?}", second));

    let _ = eq.write(EventType::NOTIFY, b"0123456789abcdef!", 0);
    t.check(
        "short buffer -> too small",
        eq.read(&mut buf, 0) == Err(FabricError::TooSmall) && eq.event_count() == 1,
        "",
    );
    let mut big = [0u8; 32];
    let p1 = eq.read(&mut big, eq_flags::PEEK).map(|e| e.len);
    let p2 = eq.read(&mut big, eq_flags::PEEK).map(|e| e.len);
    t.check("peek is repeatable", p1 == Ok(17) && p2 == Ok(17) && eq.event_count() == 1, "");
    let _ = eq.read(&mut big, 0);

    let binding = eq.bind();
    let eq = match eq.close() {
        Err(e) => { t.check("close while bound -> EBUSY", e.error == FabricError::Busy, ""); e.handle }
        Ok(()) => { t.fail("close while bound -> EBUSY", "closed"); return; }
    };
    drop(binding);
    t.check("close after unbind", eq.close().is_ok(), "");
}

// ════════════════════════════════════════════════════════════
// Part C: Virtual channels
// ════════════════════════════════════════════════════════════

fn test_vc(t: &mut TestRunner, fabric: &Fabric) {
    t.section("Part C: Virtual Channels");

    let (a, b) = match (open_peer(fabric, 1), open_peer(fabric, 2)) {
        (Ok(a), Ok(b)) => { t.pass("open two peers"); (a, b) }
        _ => { t.fail("open two peers", "open failed"); return; }
    };

    let va = a.ep.vc_alloc(Some(b.nic.addr()));
    let vb = b.ep.vc_alloc(None);
    let (Ok(va), Ok(vb)) = (va, vb) else {
        t.fail("vc alloc", "alloc failed");
        return;
    };
    t.check("alloc -> NONE", a.ep.vc_state(va) == Ok(VcState::None), "");

    let acc = b.ep.vc_accept(vb);
    let con = a.ep.vc_connect(va);
    t.check(
        "connect/accept -> CONNECTING",
        acc.is_ok() && con.is_ok() && a.ep.vc_state(va) == Ok(VcState::Connecting),
        &format!("{:?} {:?}", acc, con),
    );

    for i in 0..4u8 {
        let _ = a.ep.send(va, &[i]);
    }
    pump(&[&a, &b], 4);
    t.check(
        "both sides CONNECTED",
        a.ep.vc_state(va) == Ok(VcState::Connected) && b.ep.vc_state(vb) == Ok(VcState::Connected),
        &format!("{:?} {:?}", a.ep.vc_state(va), b.ep.vc_state(vb)),
    );

    let ea = read_cm(&a.eq);
    let eb = read_cm(&b.eq);
    t.check(
        "CONNECTED event on both EQs",
        matches!(ea, Some((EventType::CONNECTED, cm)) if cm.vc_id == va)
            && matches!(eb, Some((EventType::CONNECTED, cm)) if cm.vc_id == vb),
        &format!("{:?} {:?}", ea, eb),
    );

    let mut got = Vec::new();
    while let Some(m) = b.ep.recv() {
        got.extend(m.payload);
    }
    t.check("pre-connect sends in order", got == [0, 1, 2, 3], &format!("{:?}", got));

    let _ = a.ep.vc_disconnect(va);
    pump(&[&a, &b], 2);
    t.check(
        "disconnect -> CONN_TERMINATED",
        a.ep.vc_state(va) == Ok(VcState::Terminated),
        &format!("{:?}", a.ep.vc_state(va)),
    );
    t.check(
        "peer follows to CONN_TERMINATED",
        b.ep.vc_state(vb) == Ok(VcState::Terminated)
            && b.ep.send(vb, b"late") == Err(FabricError::InvalidArgument),
        &format!("{:?}", b.ep.vc_state(vb)),
    );
    t.check(
        "SHUTDOWN event",
        matches!(read_cm(&a.eq), Some((EventType::SHUTDOWN, _))),
        "",
    );
    t.check("destroy terminated vc", a.ep.vc_destroy(va).is_ok(), "");

    close_peer(a);
    close_peer(b);
}

// ════════════════════════════════════════════════════════════
// Part D: Failure paths
// ════════════════════════════════════════════════════════════

fn test_failures(t: &mut TestRunner, fabric: &Fabric) {
    t.section("Part D: Failure Paths");

    let a = match open_peer(fabric, 10) {
        Ok(a) => a,
        Err(e) => { t.fail("open peer", &e.to_string()); return; }
    };

    let Ok(v) = a.ep.vc_alloc(Some(Address::new(0xdead, 0))) else {
        t.fail("vc alloc", "alloc failed");
        return;
    };
    t.check("disconnect from NONE rejected", a.ep.vc_disconnect(v) == Err(FabricError::InvalidArgument), "");

    let _ = a.ep.vc_connect(v);
    t.check("destroy while CONNECTING rejected", a.ep.vc_destroy(v) == Err(FabricError::InvalidArgument), "");

    a.ep.progress();
    t.check("unreachable peer -> ERROR", a.ep.vc_state(v) == Ok(VcState::Error), "");

    let err = a.eq.readerr(0);
    t.check(
        "ECONNREFUSED on error queue",
        matches!(&err, Ok(e) if e.err == libc::ECONNREFUSED && e.data == u64::from(v.as_u32())),
        &format!("{:?}", err),
    );
    t.check("destroy errored vc", a.ep.vc_destroy(v).is_ok(), "");

    close_peer(a);
}

fn main() {
    gnix_core::kprint::init();

    println!("GNIX provider smoke test");

    let mut t = TestRunner::new();
    test_freelist(&mut t);

    match Fabric::open("vc-smoke", ProviderConfig::from_env()) {
        Ok(fabric) => {
            test_eq(&mut t, &fabric);
            test_vc(&mut t, &fabric);
            test_failures(&mut t, &fabric);
            t.check("fabric close", fabric.close().is_ok(), "references remain");
        }
        Err(e) => t.fail("fabric open", &e.to_string()),
    }

    t.summary();
    if t.failed > 0 {
        std::process::exit(1);
    }
}

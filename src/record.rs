//! The Connection Record: per-connection state shared between the owning
//! Worker's event loop and the Pool's attach/detach paths.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::id::ConnId;
use crate::protocol::ProtocolState;

/// A connection's socket handles. Modeled as `Option<RawFd>` rather than
/// the original's `-1` sentinels; `None` means "never opened" or "already
/// closed".
#[derive(Debug, Default, Clone, Copy)]
pub struct Descriptors {
    pub fd: Option<RawFd>,
    pub dst_fd: Option<RawFd>,
    pub srvdst_fd: Option<RawFd>,
    pub child_fd: Option<RawFd>,
    pub child_src_fd: Option<RawFd>,
    pub child_dst_fd: Option<RawFd>,
}

/// Resolved endpoint information kept only for logging.
#[derive(Debug, Default, Clone)]
pub struct Endpoints {
    pub src_addr: Option<SocketAddr>,
    pub dst_addr: Option<SocketAddr>,
    pub user: Option<String>,
}

/// The central per-connection entity.
///
/// `atime`/`ctime`, `protoctx`, `children` and the validity/table-membership
/// flags are all behind a [`Mutex`] or atomics because the Pool's attach/
/// detach paths and the owning Worker's event loop both touch them, always
/// under the Worker mutex (invariant 5) — the record itself only adds the
/// fine-grained locking needed to keep those fields internally consistent.
#[derive(Debug)]
pub struct ConnectionRecord {
    id: ConnId,
    descriptors: Mutex<Descriptors>,
    endpoints: Mutex<Endpoints>,
    ctime: Instant,
    atime: Mutex<Instant>,
    /// Worker index this record is bound to. `None` before attach or
    /// after detach; never migrated while `Some`.
    thr: Mutex<Option<usize>>,
    added_to_thr_conns: AtomicBool,
    protoctx: Mutex<ProtocolState>,
    children: Mutex<Vec<std::sync::Arc<ConnectionRecord>>>,
    child_count: AtomicUsize,
    is_valid: AtomicBool,
}

impl ConnectionRecord {
    /// Creates a new, unattached record with the given initial protocol
    /// state.
    pub fn new(protoctx: ProtocolState) -> Self {
        let now = Instant::now();
        Self {
            id: ConnId::next(),
            descriptors: Mutex::new(Descriptors::default()),
            endpoints: Mutex::new(Endpoints::default()),
            ctime: now,
            atime: Mutex::new(now),
            thr: Mutex::new(None),
            added_to_thr_conns: AtomicBool::new(false),
            protoctx: Mutex::new(protoctx),
            children: Mutex::new(Vec::new()),
            child_count: AtomicUsize::new(0),
            is_valid: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn ctime(&self) -> Instant {
        self.ctime
    }

    pub fn atime(&self) -> Instant {
        *self.atime.lock().unwrap()
    }

    /// Records activity now. Called on every read/write.
    pub fn touch(&self) {
        *self.atime.lock().unwrap() = Instant::now();
    }

    /// Whether this record has been idle longer than `timeout`, as of `now`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.atime()) > timeout
    }

    pub fn thr(&self) -> Option<usize> {
        *self.thr.lock().unwrap()
    }

    /// Binds this record to Worker `index`. Called by the Pool's attach
    /// path; a record is never rebound to a different Worker while
    /// attached.
    pub fn bind_thr(&self, index: usize) {
        *self.thr.lock().unwrap() = Some(index);
    }

    /// Clears the Worker binding. Called by detach.
    pub fn clear_thr(&self) {
        *self.thr.lock().unwrap() = None;
    }

    pub fn added_to_thr_conns(&self) -> bool {
        self.added_to_thr_conns.load(Ordering::Acquire)
    }

    /// Marks this record present in its Worker's table. Idempotent: a
    /// second call is a no-op, matching `add_conn`'s contract.
    pub fn mark_added_to_thr_conns(&self) -> bool {
        !self.added_to_thr_conns.swap(true, Ordering::AcqRel)
    }

    pub fn clear_added_to_thr_conns(&self) {
        self.added_to_thr_conns.store(false, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid.load(Ordering::Acquire)
    }

    pub fn mark_valid(&self) {
        self.is_valid.store(true, Ordering::Release);
    }

    pub fn descriptors(&self) -> Descriptors {
        *self.descriptors.lock().unwrap()
    }

    pub fn set_descriptors(&self, d: Descriptors) {
        *self.descriptors.lock().unwrap() = d;
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints.lock().unwrap().clone()
    }

    pub fn set_endpoints(&self, e: Endpoints) {
        *self.endpoints.lock().unwrap() = e;
    }

    /// Runs `f` against the current protocol state under its lock.
    pub fn with_protocol<R>(&self, f: impl FnOnce(&mut ProtocolState) -> R) -> R {
        let mut guard = self.protoctx.lock().unwrap();
        f(&mut guard)
    }

    /// Number of children ever created (monotonic, never decremented on
    /// child detach).
    pub fn child_count(&self) -> usize {
        self.child_count.load(Ordering::Acquire)
    }

    /// Number of children currently attached.
    pub fn live_child_count(&self) -> usize {
        self.children.lock().unwrap().len()
    }

    /// Creates and attaches a child record, set up from this record's
    /// current post-detection protocol state (children
    /// never inherit the auto-SSL detector itself).
    pub fn spawn_child(self: &std::sync::Arc<Self>) -> std::sync::Arc<ConnectionRecord> {
        let child_protocol = self.with_protocol(|p| p.setup_child());
        let child = std::sync::Arc::new(ConnectionRecord::new(child_protocol));
        self.child_count.fetch_add(1, Ordering::AcqRel);
        self.children.lock().unwrap().push(child.clone());
        child
    }

    /// Detaches a previously spawned child by id. No-op if absent.
    pub fn detach_child(&self, id: ConnId) {
        self.children.lock().unwrap().retain(|c| c.id() != id);
    }

    /// Whether this record has no live children, a precondition for
    /// `Pool::detach`.
    pub fn has_no_live_children(&self) -> bool {
        self.live_child_count() == 0
    }
}

//! The Worker: drives one event loop, enforces idle-expiry and periodic
//! stats reporting for the connections assigned to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};

use crate::config::ProxyOptions;
use crate::id::ConnId;
use crate::logsink::{self, ConnLogSink, ExpiredFields, IdleFields, StatsFields};
use crate::record::ConnectionRecord;
use crate::userlookup::UserLookupHandle;

const WAKE_TOKEN: Token = Token(usize::MAX);

/// Everything the Worker mutex guards: the
/// connection table, load counters, and the rolling stats accumulator.
#[derive(Debug, Default)]
struct WorkerState {
    conns: HashMap<ConnId, Arc<ConnectionRecord>>,
    load: usize,
    max_load: usize,
    max_fd: i32,
    timedout_conns: usize,
    errors: usize,
    timeout_count: u32,
    stats_idx: u32,
    set_watermarks: usize,
    unset_watermarks: usize,
    intif_in_bytes: u64,
    intif_out_bytes: u64,
    extif_in_bytes: u64,
    extif_out_bytes: u64,
}

impl WorkerState {
    fn current_max_atime_secs(&self, now: Instant) -> i64 {
        self.conns
            .values()
            .map(|c| now.duration_since(c.atime()).as_secs() as i64)
            .max()
            .unwrap_or(0)
    }

    fn current_max_ctime_secs(&self, now: Instant) -> i64 {
        self.conns
            .values()
            .map(|c| now.duration_since(c.ctime()).as_secs() as i64)
            .max()
            .unwrap_or(0)
    }
}

/// Drives one event loop and owns the connections attached to it.
pub struct Worker {
    index: usize,
    opts: Arc<ProxyOptions>,
    log_sink: Arc<dyn ConnLogSink>,
    waker: Arc<Waker>,
    state: Mutex<WorkerState>,
    shutdown: AtomicBool,
    /// This Worker's own prepared lookup handle, so queries never contend
    /// with other Workers at the statement level. `None` until `run`
    /// prepares it (or permanently, if `user_auth` is off).
    user_lookup: Mutex<Option<Box<dyn UserLookupHandle>>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("opts", &self.opts)
            .field("load", &self.load())
            .finish()
    }
}

impl Worker {
    /// Spawns the Worker's event-loop thread. Blocks the calling thread
    /// until the new thread has finished setting up its `mio::Poll` and
    /// signalled readiness on `ready`, matching the Pool's one-shot
    /// startup contract rather than a yield-spin.
    pub fn spawn(
        index: usize,
        opts: Arc<ProxyOptions>,
        log_sink: Arc<dyn ConnLogSink>,
        ready: SyncSender<std::io::Result<()>>,
    ) -> std::io::Result<(Arc<Worker>, std::thread::JoinHandle<()>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        let worker = Arc::new(Worker {
            index,
            opts,
            log_sink,
            waker,
            state: Mutex::new(WorkerState::default()),
            shutdown: AtomicBool::new(false),
            user_lookup: Mutex::new(None),
        });

        let thread_worker = worker.clone();
        let handle = std::thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || {
                ready.send(Ok(())).ok();
                thread_worker.run(poll);
            })?;

        Ok((worker, handle))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Current load: live connections plus children attributed to this
    /// Worker. Read under the Worker mutex.
    pub fn load(&self) -> usize {
        self.state.lock().unwrap().load
    }

    pub fn max_load(&self) -> usize {
        self.state.lock().unwrap().max_load
    }

    /// Increments load and `max_load` as a single atomic step under the
    /// Worker mutex, used by both `attach` and `attach_child`.
    pub fn bump_load(&self) {
        let mut state = self.state.lock().unwrap();
        state.load += 1;
        state.max_load = state.max_load.max(state.load);
    }

    /// Decrements load. Debug-asserts against underflow, which would
    /// indicate a detach without a matching attach.
    pub fn drop_load(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.load > 0, "load underflow on detach");
        state.load = state.load.saturating_sub(1);
    }

    /// Inserts `conn` into this Worker's table. Idempotent: a connection
    /// already marked present is left alone.
    pub fn add_conn(&self, conn: Arc<ConnectionRecord>) {
        if !conn.mark_added_to_thr_conns() {
            return;
        }
        conn.bind_thr(self.index);
        conn.mark_valid();
        self.state.lock().unwrap().conns.insert(conn.id(), conn);
    }

    /// Removes `conn` from the table if present and decrements load.
    /// Precondition: `conn` has no live children.
    pub fn detach_locked(&self, conn: &Arc<ConnectionRecord>) {
        debug_assert!(conn.has_no_live_children());
        let mut state = self.state.lock().unwrap();
        state.load = state.load.saturating_sub(1);
        if state.conns.remove(&conn.id()).is_some() {
            conn.clear_added_to_thr_conns();
        }
        conn.clear_thr();
    }

    /// Same effect as [`Worker::detach_locked`], but takes the state
    /// directly instead of acquiring the mutex itself — for callers that
    /// already hold it (the timer tick), which must never try to
    /// re-acquire it.
    fn detach_within_lock(state: &mut WorkerState, conn: &Arc<ConnectionRecord>) {
        debug_assert!(conn.has_no_live_children());
        state.load = state.load.saturating_sub(1);
        if state.conns.remove(&conn.id()).is_some() {
            conn.clear_added_to_thr_conns();
        }
        conn.clear_thr();
    }

    pub fn detach_child_locked(&self, _conn: &Arc<ConnectionRecord>) {
        self.drop_load();
    }

    /// Requests the event loop break. Idempotent; safe to call from any
    /// thread.
    pub fn request_shutdown(&self) -> std::io::Result<()> {
        self.shutdown.store(true, Ordering::Release);
        self.waker.wake()
    }

    /// This Worker's resolved user for `ip`, via its own prepared lookup
    /// handle. `None` if user authentication is disabled or nothing
    /// matches.
    pub fn lookup_user(&self, ip: std::net::IpAddr) -> Option<crate::userlookup::UserRecord> {
        self.user_lookup.lock().unwrap().as_ref()?.lookup(ip)
    }

    /// Prepares this Worker's own lookup handle, if user authentication
    /// is enabled. Called once, before the event loop starts.
    fn prepare_user_lookup(&self) {
        if self.opts.user_auth {
            if let Some(db) = &self.opts.userdb {
                *self.user_lookup.lock().unwrap() = Some(db.prepare());
            }
        }
    }

    fn run(&self, mut poll: Poll) {
        self.prepare_user_lookup();

        let period = self.opts.expired_conn_check_period;
        let mut events = Events::with_capacity(1024);
        let mut next_tick = Instant::now() + period;

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }

            let timeout = next_tick.saturating_duration_since(Instant::now());
            match poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return,
            }

            if self.shutdown.load(Ordering::Acquire) {
                return;
            }

            if Instant::now() >= next_tick {
                self.timer_tick();
                next_tick = Instant::now() + period;
            }
        }
    }

    /// One idle-expiry and stats sweep. Runs entirely
    /// under the Worker mutex; never calls back into any path that
    /// would try to re-acquire it.
    fn timer_tick(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        let expired: Vec<Arc<ConnectionRecord>> = state
            .conns
            .values()
            .filter(|c| c.is_idle(now, self.opts.conn_idle_timeout))
            .cloned()
            .collect();

        for conn in &expired {
            if self.opts.statslog {
                let endpoints = conn.endpoints();
                let fields = ExpiredFields {
                    thr: self.index,
                    idle_secs: now.duration_since(conn.atime()).as_secs() as i64,
                    src_addr: endpoints.src_addr.map(|a| a.to_string()),
                    dst_addr: endpoints.dst_addr.map(|a| a.to_string()),
                    user: endpoints.user.clone(),
                    valid: conn.is_valid(),
                };
                logsink::emit_expired(self.log_sink.as_ref(), &fields);
            }
            Worker::detach_within_lock(&mut state, conn);
            state.timedout_conns += 1;
        }

        if self.opts.statslog {
            state.timeout_count += 1;
            if state.timeout_count >= self.opts.stats_period {
                let check_period_secs = self.opts.expired_conn_check_period.as_secs() as i64;
                for conn in state.conns.values() {
                    let atime_secs = now.duration_since(conn.atime()).as_secs() as i64;
                    if atime_secs < check_period_secs {
                        continue;
                    }
                    let endpoints = conn.endpoints();
                    let fields = IdleFields {
                        thr: self.index,
                        id: conn.id().as_u64(),
                        has_children: conn.live_child_count() > 0,
                        child_count: conn.child_count() as u32,
                        atime_secs,
                        ctime_secs: now.duration_since(conn.ctime()).as_secs() as i64,
                        src_addr: endpoints.src_addr.map(|a| a.to_string()),
                        dst_addr: endpoints.dst_addr.map(|a| a.to_string()),
                        user: endpoints.user.clone(),
                        valid: conn.is_valid(),
                    };
                    logsink::emit_idle(self.log_sink.as_ref(), &fields);
                }

                let fields = StatsFields {
                    thr: self.index,
                    max_load: state.max_load,
                    max_fd: state.max_fd,
                    max_atime_secs: state.current_max_atime_secs(now),
                    max_ctime_secs: state.current_max_ctime_secs(now),
                    intif_in_bytes: state.intif_in_bytes,
                    intif_out_bytes: state.intif_out_bytes,
                    extif_in_bytes: state.extif_in_bytes,
                    extif_out_bytes: state.extif_out_bytes,
                    set_watermarks: state.set_watermarks,
                    unset_watermarks: state.unset_watermarks,
                    timedout_conns: state.timedout_conns,
                    errors: state.errors,
                    stats_idx: state.stats_idx,
                };
                logsink::emit_stats(self.log_sink.as_ref(), &fields);

                state.stats_idx += 1;
                state.timeout_count = 0;
                state.timedout_conns = 0;
                state.errors = 0;
                state.set_watermarks = 0;
                state.unset_watermarks = 0;
                state.intif_in_bytes = 0;
                state.intif_out_bytes = 0;
                state.extif_in_bytes = 0;
                state.extif_out_bytes = 0;
                // max_fd and max_load reflect current live state, not zero,
                // so active connections remain represented.
                state.max_load = state.load;
            }
        }
    }
}

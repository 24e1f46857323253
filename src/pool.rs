//! The Pool: owns the fixed-size array of Workers, routes new
//! connections to the least-loaded one, and coordinates pool-wide
//! startup and shutdown.

use std::sync::mpsc::sync_channel;
use std::sync::Arc;

use crate::config::ProxyOptions;
use crate::error::ProxyError;
use crate::logsink::{ConnLogSink, TracingLogSink};
use crate::record::ConnectionRecord;
use crate::worker::Worker;

/// Pool skeleton: knows how many Workers it will run but hasn't started
/// any threads yet.
pub struct Pool {
    num_thr: usize,
    opts: Arc<ProxyOptions>,
    log_sink: Arc<dyn ConnLogSink>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("num_thr", &self.num_thr)
            .field("opts", &self.opts)
            .finish()
    }
}

impl Pool {
    /// Allocates the pool skeleton. Does not start any threads.
    pub fn new(opts: ProxyOptions) -> Self {
        let num_thr = opts.worker_count();
        Self {
            num_thr,
            opts: Arc::new(opts),
            log_sink: Arc::new(TracingLogSink::default()),
        }
    }

    /// Overrides the default `tracing`-backed log sink.
    pub fn with_log_sink(mut self, sink: Arc<dyn ConnLogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn num_thr(&self) -> usize {
        self.num_thr
    }

    /// Starts one thread per Worker and blocks until every one of them
    /// has signalled it is running, via a one-shot completion channel
    /// rather than a yield-spin. On any
    /// failure, already-started Workers are shut down and joined before
    /// the error is returned.
    pub fn run(self) -> Result<RunningPool, ProxyError> {
        if self.opts.needs_dns() {
            tracing::debug!("configuration declares a DNS-resolving backend; workers will be started accordingly");
        }

        let mut workers = Vec::with_capacity(self.num_thr);
        let mut handles = Vec::with_capacity(self.num_thr);

        for index in 0..self.num_thr {
            let (ready_tx, ready_rx) = sync_channel(0);
            match Worker::spawn(index, self.opts.clone(), self.log_sink.clone(), ready_tx) {
                Ok((worker, handle)) => {
                    let startup_result = ready_rx.recv().unwrap_or_else(|_| {
                        Err(std::io::Error::other(
                            "worker thread exited before signalling readiness",
                        ))
                    });
                    if let Err(source) = startup_result {
                        let _ = worker.request_shutdown();
                        let _ = handle.join();
                        return Err(ProxyError::Startup { index, source });
                    }
                    workers.push(worker);
                    handles.push(handle);
                }
                Err(source) => {
                    for w in &workers {
                        let _ = w.request_shutdown();
                    }
                    for h in handles {
                        let _ = h.join();
                    }
                    return Err(ProxyError::Startup { index, source });
                }
            }
        }

        Ok(RunningPool {
            workers,
            handles: std::sync::Mutex::new(handles),
        })
    }
}

/// A pool with all Worker threads running.
pub struct RunningPool {
    workers: Vec<Arc<Worker>>,
    handles: std::sync::Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for RunningPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningPool")
            .field("workers", &self.workers)
            .finish()
    }
}

impl RunningPool {
    /// Selects the least-loaded Worker: snapshot Worker 0's load, then
    /// for each subsequent Worker compare and keep the running minimum,
    /// each read under that Worker's own mutex, never holding two
    /// Worker mutexes at once. Ties favor the lower index (strict `>`
    /// comparison).
    fn least_loaded_index(&self) -> usize {
        let mut best = 0;
        let mut best_load = self.workers[0].load();
        for (index, worker) in self.workers.iter().enumerate().skip(1) {
            let load = worker.load();
            if load < best_load {
                best = index;
                best_load = load;
            }
        }
        best
    }

    /// Routes a new connection to the least-loaded Worker and bumps its
    /// load. The connection is not yet added to the Worker's table;
    /// call [`RunningPool::add_conn`] once protocol setup succeeds.
    /// Infallible by contract.
    pub fn attach(&self, conn: &Arc<ConnectionRecord>) {
        let index = self.least_loaded_index();
        self.workers[index].bump_load();
        conn.bind_thr(index);
    }

    /// Attaches a child connection: increments the owning Worker's load
    /// only, no table mutation.
    pub fn attach_child(&self, conn: &Arc<ConnectionRecord>) {
        if let Some(index) = conn.thr() {
            self.workers[index].bump_load();
        }
    }

    /// Inserts a connection into its bound Worker's table once protocol
    /// setup has completed. Idempotent.
    pub fn add_conn(&self, conn: Arc<ConnectionRecord>) {
        if let Some(index) = conn.thr() {
            self.workers[index].add_conn(conn);
        }
    }

    /// Detaches a connection assuming its Worker mutex is already held
    /// by the caller. Precondition: the connection has no live
    /// children.
    pub fn detach(&self, conn: &Arc<ConnectionRecord>) {
        if let Some(index) = conn.thr() {
            self.workers[index].detach_locked(conn);
        }
    }

    /// Same as [`RunningPool::detach`]; kept as a distinct name matching
    /// the "acquires its own lock" contract, since `Worker::detach_locked`
    /// already performs its own locking internally in this design.
    pub fn detach_locked(&self, conn: &Arc<ConnectionRecord>) {
        self.detach(conn);
    }

    pub fn detach_child(&self, conn: &Arc<ConnectionRecord>) {
        if let Some(index) = conn.thr() {
            self.workers[index].detach_child_locked(conn);
        }
    }

    pub fn detach_child_locked(&self, conn: &Arc<ConnectionRecord>) {
        self.detach_child(conn);
    }

    /// Looks up the Worker index a connection is (or was) bound to.
    pub fn worker_index_of(&self, conn: &Arc<ConnectionRecord>) -> Option<usize> {
        conn.thr()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_load(&self, index: usize) -> usize {
        self.workers[index].load()
    }

    /// Requests every Worker's event loop break, then joins all threads.
    /// Breaks are issued to every Worker before any join, so Workers can
    /// exit in parallel rather than serially.
    pub fn shutdown(self) {
        for worker in &self.workers {
            let _ = worker.request_shutdown();
        }
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::passthrough::PassthroughHandler;
    use crate::protocol::ProtocolState;
    use std::time::Duration;

    fn fresh_conn() -> Arc<ConnectionRecord> {
        Arc::new(ConnectionRecord::new(ProtocolState::Passthrough(
            PassthroughHandler::new(),
        )))
    }

    #[test]
    fn pool_new_computes_worker_count_without_starting_threads() {
        let opts = ProxyOptions::builder().worker_count_override(3).build();
        let pool = Pool::new(opts);
        assert_eq!(pool.num_thr(), 3);
    }

    #[test]
    fn run_starts_exactly_num_thr_workers_and_shutdown_joins_cleanly() {
        let opts = ProxyOptions::builder().worker_count_override(2).build();
        let pool = Pool::new(opts).run().expect("pool should start");
        assert_eq!(pool.worker_count(), 2);
        pool.shutdown();
    }

    #[test]
    fn attach_picks_the_least_loaded_worker_with_low_index_tie_break() {
        let opts = ProxyOptions::builder().worker_count_override(3).build();
        let pool = Pool::new(opts).run().unwrap();

        let a = fresh_conn();
        pool.attach(&a);
        assert_eq!(pool.worker_index_of(&a), Some(0));

        let b = fresh_conn();
        pool.attach(&b);
        // worker 0 now has load 1, so the tie-break picks worker 1 next.
        assert_eq!(pool.worker_index_of(&b), Some(1));

        pool.shutdown();
    }

    #[test]
    fn add_conn_then_detach_round_trips_load_and_table_membership() {
        let opts = ProxyOptions::builder().worker_count_override(1).build();
        let pool = Pool::new(opts).run().unwrap();

        let conn = fresh_conn();
        pool.attach(&conn);
        assert_eq!(pool.worker_load(0), 1);
        pool.add_conn(conn.clone());
        assert!(conn.added_to_thr_conns());

        pool.detach(&conn);
        assert_eq!(pool.worker_load(0), 0);
        assert!(!conn.added_to_thr_conns());

        pool.shutdown();
    }

    #[test]
    fn attach_picks_the_first_minimum_among_unequal_loads() {
        let opts = ProxyOptions::builder().worker_count_override(4).build();
        let pool = Pool::new(opts).run().unwrap();

        // Seed loads [3, 1, 2, 1] directly; `workers` is this module's own
        // private field, visible to this nested test module.
        for _ in 0..3 {
            pool.workers[0].bump_load();
        }
        pool.workers[1].bump_load();
        for _ in 0..2 {
            pool.workers[2].bump_load();
        }
        pool.workers[3].bump_load();

        let conn = fresh_conn();
        pool.attach(&conn);
        assert_eq!(pool.worker_index_of(&conn), Some(1));
        assert_eq!(
            [
                pool.worker_load(0),
                pool.worker_load(1),
                pool.worker_load(2),
                pool.worker_load(3),
            ],
            [3, 2, 2, 1]
        );

        pool.shutdown();
    }

    #[test]
    fn shutdown_drains_ten_connections_spread_across_workers_without_deadlock() {
        let opts = ProxyOptions::builder().worker_count_override(4).build();
        let pool = Pool::new(opts).run().unwrap();

        let conns: Vec<_> = (0..10).map(|_| fresh_conn()).collect();
        for conn in &conns {
            pool.attach(conn);
            pool.add_conn(conn.clone());
        }
        assert_eq!(
            (0..4).map(|i| pool.worker_load(i)).sum::<usize>(),
            10
        );

        let start = std::time::Instant::now();
        pool.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
        // `conns` still holds the only remaining references; dropping them
        // here must not double-free or panic.
        drop(conns);
    }

    #[test]
    fn shutdown_is_prompt_even_with_a_long_check_period() {
        let opts = ProxyOptions::builder()
            .worker_count_override(1)
            .expired_conn_check_period(Duration::from_secs(3600))
            .build();
        let pool = Pool::new(opts).run().unwrap();
        let start = std::time::Instant::now();
        pool.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}

//! Starts a pool sized to the local core count, attaches a handful of
//! in-process connections to it, and shuts it down cleanly. Exercises the
//! same startup/attach/shutdown path a real accept loop would drive, minus
//! the accept loop itself (out of scope for this crate).

use std::sync::Arc;
use std::time::Duration;

use autossl_proxy::passthrough::PassthroughHandler;
use autossl_proxy::protocol::ProtocolState;
use autossl_proxy::{ConnectionRecord, Pool, ProxyOptions};

fn main() {
    tracing_subscriber::fmt::init();

    let opts = ProxyOptions::builder()
        .statslog(true)
        .expired_conn_check_period(Duration::from_secs(1))
        .build();
    let pool = Pool::new(opts).run().expect("pool should start");

    for _ in 0..8 {
        let conn = Arc::new(ConnectionRecord::new(ProtocolState::Passthrough(
            PassthroughHandler::new(),
        )));
        pool.attach(&conn);
        pool.add_conn(conn);
    }

    std::thread::sleep(Duration::from_millis(100));
    pool.shutdown();
}

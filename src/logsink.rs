//! Stable, line-oriented log record formats and the sink
//! trait that consumes them.
//!
//! The formats themselves are a stability contract independent of
//! whatever is actually wired up to receive them, so this module builds
//! the strings and hands them to a [`ConnLogSink`] rather than printing
//! directly.

use std::fmt::Display;

/// Renders `Some(v)` as `v` and `None` as `-`, matching the "unknown
/// strings render as dash" rule.
fn dash<T: Display>(value: Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}

/// Fields for one `EXPIRED` record: a connection that the idle-expiry
/// sweep freed this tick.
#[derive(Debug, Clone)]
pub struct ExpiredFields {
    pub thr: usize,
    pub idle_secs: i64,
    pub src_addr: Option<String>,
    pub dst_addr: Option<String>,
    pub user: Option<String>,
    pub valid: bool,
}

impl ExpiredFields {
    fn render(&self) -> String {
        format!(
            "EXPIRED: thr={}, time={}, src_addr={}, dst_addr={}, user={}, valid={}",
            self.thr,
            self.idle_secs,
            dash(self.src_addr.as_ref()),
            dash(self.dst_addr.as_ref()),
            dash(self.user.as_ref()),
            self.valid as u8,
        )
    }
}

/// Fields for one `IDLE` record: a still-live connection reported as idle
/// during stats printing.
#[derive(Debug, Clone)]
pub struct IdleFields {
    pub thr: usize,
    pub id: u64,
    pub has_children: bool,
    pub child_count: u32,
    pub atime_secs: i64,
    pub ctime_secs: i64,
    pub src_addr: Option<String>,
    pub dst_addr: Option<String>,
    pub user: Option<String>,
    pub valid: bool,
}

impl IdleFields {
    fn render(&self) -> String {
        format!(
            "IDLE: thr={}, id={}, ce={}, cc={}, at={}, ct={}, src_addr={}, dst_addr={}, user={}, valid={}",
            self.thr,
            self.id,
            self.has_children as u8,
            self.child_count,
            self.atime_secs,
            self.ctime_secs,
            dash(self.src_addr.as_ref()),
            dash(self.dst_addr.as_ref()),
            dash(self.user.as_ref()),
            self.valid as u8,
        )
    }
}

/// Fields for one aggregate `STATS` record, emitted every `stats_period`
/// timer ticks.
#[derive(Debug, Clone, Default)]
pub struct StatsFields {
    pub thr: usize,
    pub max_load: usize,
    pub max_fd: i32,
    pub max_atime_secs: i64,
    pub max_ctime_secs: i64,
    pub intif_in_bytes: u64,
    pub intif_out_bytes: u64,
    pub extif_in_bytes: u64,
    pub extif_out_bytes: u64,
    pub set_watermarks: usize,
    pub unset_watermarks: usize,
    pub timedout_conns: usize,
    pub errors: usize,
    pub stats_idx: u32,
}

impl StatsFields {
    fn render(&self) -> String {
        format!(
            "STATS: thr={}, mld={}, mfd={}, mat={}, mct={}, iib={}, iob={}, eib={}, eob={}, swm={}, uwm={}, to={}, err={}, si={}",
            self.thr,
            self.max_load,
            self.max_fd,
            self.max_atime_secs,
            self.max_ctime_secs,
            self.intif_in_bytes,
            self.intif_out_bytes,
            self.extif_in_bytes,
            self.extif_out_bytes,
            self.set_watermarks,
            self.unset_watermarks,
            self.timedout_conns,
            self.errors,
            self.stats_idx,
        )
    }
}

/// Sink for connection and stats log lines. A failure here is a warning,
/// never fatal to the connection it describes.
pub trait ConnLogSink: Send + Sync {
    /// Emits a line to the connection log (EXPIRED/IDLE records).
    fn log_conn(&self, line: &str) -> std::io::Result<()>;
    /// Emits a line to the stats log (STATS records).
    fn log_stats(&self, line: &str) -> std::io::Result<()>;
}

/// Default sink: routes both lines through `tracing`, so they show up
/// wherever the embedding application already sends its structured logs.
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl ConnLogSink for TracingLogSink {
    fn log_conn(&self, line: &str) -> std::io::Result<()> {
        tracing::info!(target: "autossl_proxy::conn", "{line}");
        Ok(())
    }

    fn log_stats(&self, line: &str) -> std::io::Result<()> {
        tracing::info!(target: "autossl_proxy::stats", "{line}");
        Ok(())
    }
}

/// Emits an `EXPIRED` line, warning via `tracing` on sink failure.
pub fn emit_expired(sink: &dyn ConnLogSink, fields: &ExpiredFields) {
    if let Err(e) = sink.log_conn(&fields.render()) {
        tracing::warn!("expired conn logging failed: {e}");
    }
}

/// Emits an `IDLE` line, warning via `tracing` on sink failure.
pub fn emit_idle(sink: &dyn ConnLogSink, fields: &IdleFields) {
    if let Err(e) = sink.log_conn(&fields.render()) {
        tracing::warn!("idle conn logging failed: {e}");
    }
}

/// Emits a `STATS` line, warning via `tracing` on sink failure.
pub fn emit_stats(sink: &dyn ConnLogSink, fields: &StatsFields) {
    if let Err(e) = sink.log_stats(&fields.render()) {
        tracing::warn!("stats logging failed: {e}");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expired_renders_dash_for_missing_fields() {
        let fields = ExpiredFields {
            thr: 2,
            idle_secs: 42,
            src_addr: None,
            dst_addr: Some("10.0.0.1:443".into()),
            user: None,
            valid: true,
        };
        assert_eq!(
            fields.render(),
            "EXPIRED: thr=2, time=42, src_addr=-, dst_addr=10.0.0.1:443, user=-, valid=1"
        );
    }

    #[test]
    fn idle_renders_all_fields() {
        let fields = IdleFields {
            thr: 0,
            id: 7,
            has_children: true,
            child_count: 3,
            atime_secs: 11,
            ctime_secs: 120,
            src_addr: Some("1.2.3.4:1111".into()),
            dst_addr: Some("5.6.7.8:443".into()),
            user: Some("bob".into()),
            valid: true,
        };
        assert_eq!(
            fields.render(),
            "IDLE: thr=0, id=7, ce=1, cc=3, at=11, ct=120, src_addr=1.2.3.4:1111, dst_addr=5.6.7.8:443, user=bob, valid=1"
        );
    }

    #[test]
    fn stats_renders_zeroed_default() {
        let fields = StatsFields::default();
        assert_eq!(
            fields.render(),
            "STATS: thr=0, mld=0, mfd=0, mat=0, mct=0, iib=0, iob=0, eib=0, eob=0, swm=0, uwm=0, to=0, err=0, si=0"
        );
    }

    struct FailingSink;
    impl ConnLogSink for FailingSink {
        fn log_conn(&self, _line: &str) -> std::io::Result<()> {
            Err(std::io::Error::other("sink down"))
        }
        fn log_stats(&self, _line: &str) -> std::io::Result<()> {
            Err(std::io::Error::other("sink down"))
        }
    }

    #[test]
    fn emit_functions_do_not_panic_on_sink_failure() {
        let sink = FailingSink;
        emit_expired(
            &sink,
            &ExpiredFields {
                thr: 0,
                idle_secs: 0,
                src_addr: None,
                dst_addr: None,
                user: None,
                valid: false,
            },
        );
        emit_stats(&sink, &StatsFields::default());
    }
}

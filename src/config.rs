//! Recognised configuration options.
//!
//! Loading these from a file or flags is out of scope here; this module
//! only defines the struct and a builder so callers (or tests) can
//! construct one in-process.

use std::sync::Arc;
use std::time::Duration;

use crate::userlookup::UserLookup;

/// Options consulted by the pool and its workers.
#[derive(Clone)]
pub struct ProxyOptions {
    /// Seconds after which an idle connection is evicted.
    pub conn_idle_timeout: Duration,
    /// Seconds between worker timer ticks.
    pub expired_conn_check_period: Duration,
    /// Number of timer ticks between STATS emissions.
    pub stats_period: u32,
    /// Enables per-connection EXPIRED/IDLE logs and STATS records.
    pub statslog: bool,
    /// Enables the per-worker prepared user-lookup statement.
    pub user_auth: bool,
    /// Handle to the user database, required iff `user_auth` is set.
    pub userdb: Option<Arc<dyn UserLookup>>,
    /// Whether any configured backend needs DNS resolution, gating
    /// whether each worker is given a resolver handle.
    pub dns_needed: bool,
    /// Escape hatch for tests: overrides `2 * available_parallelism()`.
    pub worker_count_override: Option<usize>,
}

impl std::fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("conn_idle_timeout", &self.conn_idle_timeout)
            .field("expired_conn_check_period", &self.expired_conn_check_period)
            .field("stats_period", &self.stats_period)
            .field("statslog", &self.statslog)
            .field("user_auth", &self.user_auth)
            .field("userdb", &self.userdb.is_some())
            .field("dns_needed", &self.dns_needed)
            .field("worker_count_override", &self.worker_count_override)
            .finish()
    }
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            conn_idle_timeout: Duration::from_secs(120),
            expired_conn_check_period: Duration::from_secs(10),
            stats_period: 6,
            statslog: false,
            user_auth: false,
            userdb: None,
            dns_needed: false,
            worker_count_override: None,
        }
    }
}

impl ProxyOptions {
    /// Starts a builder seeded with the defaults above.
    pub fn builder() -> ProxyOptionsBuilder {
        ProxyOptionsBuilder(Self::default())
    }

    /// Number of workers the pool should spawn.
    pub fn worker_count(&self) -> usize {
        self.worker_count_override
            .unwrap_or_else(|| 2 * num_cpus::get())
    }

    /// Whether any configured backend needs DNS resolution.
    pub fn needs_dns(&self) -> bool {
        self.dns_needed
    }
}

/// Builder for [`ProxyOptions`].
#[derive(Debug)]
pub struct ProxyOptionsBuilder(ProxyOptions);

impl ProxyOptionsBuilder {
    /// Sets `conn_idle_timeout`.
    pub fn conn_idle_timeout(mut self, d: Duration) -> Self {
        self.0.conn_idle_timeout = d;
        self
    }

    /// Sets `expired_conn_check_period`.
    pub fn expired_conn_check_period(mut self, d: Duration) -> Self {
        self.0.expired_conn_check_period = d;
        self
    }

    /// Sets `stats_period`.
    pub fn stats_period(mut self, ticks: u32) -> Self {
        self.0.stats_period = ticks;
        self
    }

    /// Enables or disables EXPIRED/IDLE/STATS logging.
    pub fn statslog(mut self, enabled: bool) -> Self {
        self.0.statslog = enabled;
        self
    }

    /// Enables user authentication and supplies the lookup backend.
    pub fn user_auth(mut self, userdb: Arc<dyn UserLookup>) -> Self {
        self.0.user_auth = true;
        self.0.userdb = Some(userdb);
        self
    }

    /// Declares that at least one configured backend needs DNS.
    pub fn dns_needed(mut self, needed: bool) -> Self {
        self.0.dns_needed = needed;
        self
    }

    /// Overrides the computed worker count (tests only, typically).
    pub fn worker_count_override(mut self, count: usize) -> Self {
        self.0.worker_count_override = Some(count);
        self
    }

    /// Finishes the builder.
    pub fn build(self) -> ProxyOptions {
        self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_worker_count_is_double_the_cpu_count() {
        let opts = ProxyOptions::default();
        assert_eq!(opts.worker_count(), 2 * num_cpus::get());
    }

    #[test]
    fn worker_count_override_wins() {
        let opts = ProxyOptions::builder().worker_count_override(4).build();
        assert_eq!(opts.worker_count(), 4);
    }
}

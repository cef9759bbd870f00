//! Server Statistics
//!
//! Lightweight counters shared between the accept loop and the
//! handlers. Purely observational: the summary lands in the log at
//! teardown and nothing else reads it.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// Thread-safe handle to server statistics.
pub type StatsHandle = Arc<Mutex<ServerStats>>;

pub fn create_stats() -> StatsHandle {
    Arc::new(Mutex::new(ServerStats::new()))
}

pub struct ServerStats {
    start_time: Instant,
    connections_total: u64,
    queries_total: u64,
    errors_total: u64,
}

impl ServerStats {
    pub fn new() -> ServerStats {
        ServerStats {
            start_time: Instant::now(),
            connections_total: 0,
            queries_total: 0,
            errors_total: 0,
        }
    }

    pub fn record_connection(&mut self) {
        self.connections_total += 1;
    }

    pub fn record_query(&mut self) {
        self.queries_total += 1;
    }

    /// A query answered with an `error:` line. Still a reply, still
    /// counted as a query.
    pub fn record_error(&mut self) {
        self.errors_total += 1;
    }

    pub fn connections_total(&self) -> u64 {
        self.connections_total
    }

    pub fn queries_total(&self) -> u64 {
        self.queries_total
    }

    pub fn errors_total(&self) -> u64 {
        self.errors_total
    }

    pub fn error_rate(&self) -> f64 {
        if self.queries_total == 0 {
            return 0.0;
        }
        self.errors_total as f64 / self.queries_total as f64
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        ServerStats::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = create_stats();
        {
            let mut s = stats.lock();
            s.record_connection();
            s.record_query();
            s.record_query();
            s.record_error();
        }
        let s = stats.lock();
        assert_eq!(s.connections_total(), 1);
        assert_eq!(s.queries_total(), 2);
        assert_eq!(s.errors_total(), 1);
        assert!((s.error_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn error_rate_with_no_queries_is_zero() {
        let stats = ServerStats::new();
        assert_eq!(stats.error_rate(), 0.0);
    }
}

use std::{cell::RefCell, collections::HashMap, time::Duration};

use colored::Colorize;

/// Calls made to one GitHub endpoint
#[derive(Debug, Default, Clone)]
pub struct EndpointStats {
    pub calls: u64,
    /// Calls that ended in a transport error or a non-success status.
    pub failures: u64,
    pub total_duration: Duration,
    pub max_duration: Duration,
}

impl EndpointStats {
    fn record(&mut self, duration: Duration, ok: bool) {
        self.calls += 1;
        if !ok {
            self.failures += 1;
        }
        self.total_duration += duration;
        self.max_duration = self.max_duration.max(duration);
    }

    pub fn avg_duration(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.calls as u32
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ApiStats {
    /// Keyed by endpoint label (e.g. "branches", "create-ref")
    pub by_endpoint: HashMap<String, EndpointStats>,
    pub total: EndpointStats,
    /// Branch listing requests sent with cache busting.
    pub cache_busted_listings: u64,
}

thread_local! {
    static API_STATS: RefCell<ApiStats> = RefCell::new(ApiStats::default());
}

/// Record one GitHub API request
pub fn record_api_call(endpoint: &str, duration: Duration, ok: bool) {
    API_STATS.with(|stats| {
        let mut stats = stats.borrow_mut();
        stats.total.record(duration, ok);
        stats
            .by_endpoint
            .entry(endpoint.to_string())
            .or_default()
            .record(duration, ok);
    });
}

/// Count a branch listing that bypassed intermediary caches
pub fn record_cache_bust() {
    API_STATS.with(|stats| stats.borrow_mut().cache_busted_listings += 1);
}

pub fn get_stats() -> ApiStats {
    API_STATS.with(|stats| stats.borrow().clone())
}

/// Print a request summary to stderr
pub fn print_summary() {
    let stats = get_stats();

    if stats.total.calls == 0 {
        return;
    }

    eprintln!();
    eprintln!("{}", "=== GitHub API Summary ===".yellow().bold());
    eprintln!();

    let mut endpoints: Vec<_> = stats.by_endpoint.iter().collect();
    endpoints.sort_by(|a, b| b.1.calls.cmp(&a.1.calls).then_with(|| a.0.cmp(b.0)));

    eprintln!(
        "{:<16} {:>6} {:>6} {:>12} {:>12}",
        "Endpoint", "Calls", "Failed", "Avg", "Max"
    );
    eprintln!("{}", "-".repeat(56));

    for (endpoint, endpoint_stats) in endpoints {
        let failed = endpoint_stats.failures.to_string();
        eprintln!(
            "{:<16} {:>6} {:>6} {:>12.2?} {:>12.2?}",
            endpoint,
            endpoint_stats.calls,
            if endpoint_stats.failures > 0 {
                failed.red()
            } else {
                failed.normal()
            },
            endpoint_stats.avg_duration(),
            endpoint_stats.max_duration
        );
    }

    eprintln!("{}", "-".repeat(56));
    eprintln!(
        "{:<16} {:>6} {:>6} {:>12.2?} {:>12.2?}",
        "TOTAL".bold(),
        stats.total.calls,
        stats.total.failures,
        stats.total.avg_duration(),
        stats.total.max_duration
    );
    if stats.cache_busted_listings > 0 {
        eprintln!(
            "{} cache-busted branch listing(s) while waiting for GitHub",
            stats.cache_busted_listings
        );
    }
    eprintln!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_by_endpoint_with_failures() {
        record_api_call("branches", Duration::from_millis(30), true);
        record_api_call("branches", Duration::from_millis(10), false);
        record_api_call("create-ref", Duration::from_millis(50), true);
        record_cache_bust();
        record_cache_bust();

        let stats = get_stats();
        let branches = &stats.by_endpoint["branches"];
        assert_eq!(branches.calls, 2);
        assert_eq!(branches.failures, 1);
        assert_eq!(branches.avg_duration(), Duration::from_millis(20));
        assert_eq!(branches.max_duration, Duration::from_millis(30));
        assert_eq!(stats.by_endpoint["create-ref"].failures, 0);
        assert_eq!(stats.total.calls, 3);
        assert_eq!(stats.total.failures, 1);
        assert_eq!(stats.cache_busted_listings, 2);
    }

    #[test]
    fn empty_stats_average_is_zero() {
        assert_eq!(EndpointStats::default().avg_duration(), Duration::ZERO);
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Shared, immutable-after-construction balancer configuration and the
/// mutable per-backend traffic counters selection and forwarding both touch.
pub struct BalancerState {
    pub backends: Vec<String>,
    counters: Vec<AtomicU64>,
    pub http: reqwest::Client,
    pub scheme: &'static str,
    pub trace: bool,
}

impl BalancerState {
    pub fn new(backends: Vec<String>, timeout: Duration, https: bool, trace: bool) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client configuration is always valid");
        let counters = backends.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            backends,
            counters,
            http,
            scheme: if https { "https" } else { "http" },
            trace,
        }
    }

    pub fn counter(&self, index: usize) -> u64 {
        self.counters[index].load(Ordering::Relaxed)
    }

    pub fn add_bytes(&self, index: usize, bytes: u64) {
        self.counters[index].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn backend_url(&self, backend: &str, path_and_query: &str) -> String {
        format!("{}://{backend}{path_and_query}", self.scheme)
    }
}

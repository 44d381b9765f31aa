use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::ConfigSnapshot;
use crate::sessions::SessionManager;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub config_version: u64,
    pub servers_loaded: u32,
    pub servers_dropped: u32,
    pub active_sessions: u32,
    pub wakes_sent: u64,
    pub wake_failures: u64,
    pub login_failures: u64,
    pub memory_usage_mb: f32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    wakes_sent: Arc<AtomicU64>,
    wake_failures: Arc<AtomicU64>,
    login_failures: Arc<AtomicU64>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            wakes_sent: Arc::new(AtomicU64::new(0)),
            wake_failures: Arc::new(AtomicU64::new(0)),
            login_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_wake(&self, ok: bool) {
        let counter = if ok { &self.wakes_sent } else { &self.wake_failures };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_login_failure(&self) {
        self.login_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_health(&self, snapshot: &ConfigSnapshot, sessions: &SessionManager) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            config_version: snapshot.version,
            servers_loaded: snapshot.servers.len() as u32,
            servers_dropped: snapshot.dropped.len() as u32,
            active_sessions: sessions.active_sessions() as u32,
            wakes_sent: self.wakes_sent.load(Ordering::Relaxed),
            wake_failures: self.wake_failures.load(Ordering::Relaxed),
            login_failures: self.login_failures.load(Ordering::Relaxed),
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::registry::Registry;

#[derive(Clone, Debug, Default)]
pub struct RegistryMetrics {
    pub services_total: u64,
    pub services_up: u64,
    pub services_locked: u64,
    pub types_total: u64,
    pub score_sum: u64,
    pub persistence_writes: u64,
    pub persistence_write_errors: u64,
    pub persistence_restored: u64,
    pub last_write_unix: u64,
    pub last_write_services: u64,
}

#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<RwLock<RegistryMetrics>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryMetrics::default())),
        }
    }

    pub fn snapshot(&self) -> RegistryMetrics {
        self.inner.read().clone()
    }

    pub fn record_write(&self, services: usize) {
        let mut w = self.inner.write();
        w.persistence_writes += 1;
        w.last_write_services = services as u64;
        w.last_write_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
    }

    pub fn record_write_error(&self) {
        self.inner.write().persistence_write_errors += 1;
    }

    pub fn record_restore(&self, services: usize) {
        self.inner.write().persistence_restored += services as u64;
    }

    pub fn render_prometheus(&self) -> String {
        let m = self.snapshot();
        format!(
            concat!(
                "# HELP conscience_services_total Registered service instances\n",
                "# TYPE conscience_services_total gauge\n",
                "conscience_services_total {}\n",
                "# HELP conscience_services_up Service instances currently up\n",
                "# TYPE conscience_services_up gauge\n",
                "conscience_services_up {}\n",
                "# HELP conscience_services_locked Service instances with a locked score\n",
                "# TYPE conscience_services_locked gauge\n",
                "conscience_services_locked {}\n",
                "# HELP conscience_service_types_total Known service types\n",
                "# TYPE conscience_service_types_total gauge\n",
                "conscience_service_types_total {}\n",
                "# HELP conscience_score_sum Sum of all service scores\n",
                "# TYPE conscience_score_sum gauge\n",
                "conscience_score_sum {}\n",
                "# HELP conscience_persistence_writes_total Status snapshots written\n",
                "# TYPE conscience_persistence_writes_total counter\n",
                "conscience_persistence_writes_total {}\n",
                "# HELP conscience_persistence_write_errors_total Failed status snapshots\n",
                "# TYPE conscience_persistence_write_errors_total counter\n",
                "conscience_persistence_write_errors_total {}\n",
                "# HELP conscience_persistence_restored_total Services restored from file\n",
                "# TYPE conscience_persistence_restored_total counter\n",
                "conscience_persistence_restored_total {}\n",
                "# HELP conscience_persistence_last_write_seconds Unix time of the last snapshot\n",
                "# TYPE conscience_persistence_last_write_seconds gauge\n",
                "conscience_persistence_last_write_seconds {}\n"
            ),
            m.services_total,
            m.services_up,
            m.services_locked,
            m.types_total,
            m.score_sum,
            m.persistence_writes,
            m.persistence_write_errors,
            m.persistence_restored,
            m.last_write_unix
        )
    }

    /// Spawn a background task to periodically sample the registry.
    pub fn start_collection(self: &Arc<Self>, registry: Arc<Registry>, interval: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (total, up, locked, score_sum) = registry.counts().await;
                let types = registry.types().await.len();
                {
                    let mut w = this.inner.write();
                    w.services_total = total as u64;
                    w.services_up = up as u64;
                    w.services_locked = locked as u64;
                    w.types_total = types as u64;
                    w.score_sum = score_sum;
                }
                tokio::time::sleep(interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_rendering_carries_counters() {
        let c = MetricsCollector::new();
        c.record_write(3);
        c.record_write(4);
        c.record_write_error();
        c.record_restore(7);
        let text = c.render_prometheus();
        assert!(text.contains("conscience_persistence_writes_total 2"));
        assert!(text.contains("conscience_persistence_write_errors_total 1"));
        assert!(text.contains("conscience_persistence_restored_total 7"));
        assert_eq!(c.snapshot().last_write_services, 4);
    }
}

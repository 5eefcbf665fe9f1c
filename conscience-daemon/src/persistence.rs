#![forbid(unsafe_code)]

//! Registry persistence: status snapshots and restart recovery.
//!
//! The status file is a versioned JSON envelope so a malformed or
//! foreign-format file is rejected as a whole; a restore never partially
//! populates the registry. Writes go through a temp file and an atomic
//! rename, so a crash mid-write leaves the previous snapshot intact.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use conscience_core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config_manager::ConfigManager;
use crate::event_system::Event;
use crate::metrics::MetricsCollector;
use crate::registry::{PersistedService, Registry};

pub const STATUS_FORMAT: &str = "conscience-status";
pub const STATUS_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StatusFile {
    format: String,
    version: u32,
    namespace: String,
    written_at: u64,
    services: Vec<PersistedService>,
}

/// Persist the current registry content to `path`. Returns the number of
/// services written.
pub async fn write_status(registry: &Registry, namespace: &str, path: &Path) -> Result<usize> {
    let services = registry.snapshot_entries().await;
    let n = services.len();
    let status = StatusFile {
        format: STATUS_FORMAT.into(),
        version: STATUS_VERSION,
        namespace: namespace.to_string(),
        written_at: unix_now(),
        services,
    };
    let body = serde_json::to_vec_pretty(&status)?;

    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, &body).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        // Leave no stray temp file behind on a failed rename.
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    debug!("status written: {} service(s) to {}", n, path.display());
    Ok(n)
}

/// Reload the registry from a status file written by `write_status`.
///
/// Fails on a missing path, unreadable content, or an envelope that does not
/// match this daemon's format, version, and namespace; the registry is left
/// untouched on any failure. On success the previous content is replaced and
/// every restored service comes back down with its score intact.
pub async fn restart_srv_from_file(
    registry: &Registry,
    namespace: &str,
    path: &Path,
) -> Result<usize> {
    let body = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::persistence(format!("cannot read {}: {e}", path.display()))
    })?;
    let status: StatusFile = serde_json::from_str(&body)
        .map_err(|e| Error::persistence(format!("bad content in {}: {e}", path.display())))?;
    if status.format != STATUS_FORMAT {
        return Err(Error::persistence(format!("unknown format: {:?}", status.format)));
    }
    if status.version != STATUS_VERSION {
        return Err(Error::persistence(format!("unsupported version: {}", status.version)));
    }
    if status.namespace != namespace {
        return Err(Error::persistence(format!(
            "namespace mismatch: file has {:?}, daemon runs {:?}",
            status.namespace, namespace
        )));
    }
    let n = registry.restore(status.services).await;
    info!("registry restored: {} service(s) from {}", n, path.display());
    Ok(n)
}

/// Periodic snapshot task; writes best-effort. The effective period is
/// re-read from the config manager before every tick, so a dynamic
/// `persistence_period_secs` update takes effect on the next cycle.
pub fn start_persistence_loop(
    registry: Arc<Registry>,
    namespace: String,
    path: PathBuf,
    cfg: ConfigManager,
    events: broadcast::Sender<Event>,
    metrics: Arc<MetricsCollector>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let period = Duration::from_secs(cfg.persistence_period_secs().await);
            tokio::time::sleep(period).await;
            match write_status(&registry, &namespace, &path).await {
                Ok(n) => {
                    metrics.record_write(n);
                    let _ = events.send(Event::persistence(format!("written {n}")));
                }
                Err(e) => {
                    metrics.record_write_error();
                    warn!("periodic status write failed: {e}");
                    let _ = events.send(Event::persistence(format!("write_failed: {e}")));
                }
            }
        }
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registration;
    use conscience_core::ConscienceConfig;
    use std::collections::BTreeMap;

    fn registry() -> Registry {
        let (tx, _rx) = broadcast::channel(64);
        Registry::new(ConscienceConfig::default().compile_policies().unwrap(), tx)
    }

    fn reg(ty: &str, addr: &str) -> Registration {
        Registration {
            srv_type: ty.parse().unwrap(),
            addr: addr.parse().unwrap(),
            stats: BTreeMap::new(),
            tags: [("tag.loc".to_string(), "rack1".to_string())].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn restart_from_missing_file_fails() {
        let r = registry();
        let res = restart_srv_from_file(&r, "SDS", Path::new("/nonexistent/conscience")).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn restart_from_bad_content_fails_and_leaves_registry_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conscience_persistence");
        tokio::fs::write(&path, "bad content").await.unwrap();

        let r = registry();
        r.register(reg("rawx", "127.0.0.1:6201")).await.unwrap();
        assert!(restart_srv_from_file(&r, "SDS", &path).await.is_err());
        assert_eq!(r.list_all(true).await.len(), 1, "failed restore must not clear state");
    }

    #[tokio::test]
    async fn restart_rejects_foreign_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        // Valid JSON, wrong format marker.
        tokio::fs::write(&path, r#"{"format":"other","version":1,"namespace":"SDS","written_at":0,"services":[]}"#)
            .await
            .unwrap();
        let r = registry();
        assert!(restart_srv_from_file(&r, "SDS", &path).await.is_err());
    }

    #[tokio::test]
    async fn restart_rejects_namespace_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let r = registry();
        r.register(reg("rawx", "127.0.0.1:6201")).await.unwrap();
        write_status(&r, "SDS", &path).await.unwrap();
        assert!(restart_srv_from_file(&r, "OTHER", &path).await.is_err());
    }

    #[tokio::test]
    async fn write_then_restart_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");

        let r = registry();
        r.register(reg("rawx", "127.0.0.1:6201")).await.unwrap();
        r.register(reg("meta2", "127.0.0.1:6101")).await.unwrap();
        assert_eq!(write_status(&r, "SDS", &path).await.unwrap(), 2);
        assert!(!tmp_path(&path).exists(), "temp file must be renamed away");

        let r2 = registry();
        assert_eq!(restart_srv_from_file(&r2, "SDS", &path).await.unwrap(), 2);
        let restored = r2.list_all(true).await;
        assert_eq!(restored.len(), 2);
        for v in &restored {
            assert!(!v.up);
            assert!(v.score.get() > 0);
            if v.srv_type.as_str() == "rawx" {
                assert_eq!(v.tags.get("tag.loc").map(String::as_str), Some("rack1"));
            }
        }
    }

    #[tokio::test]
    async fn persistence_loop_honors_dynamic_period() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");

        let r = Arc::new(registry());
        r.register(reg("rawx", "127.0.0.1:6201")).await.unwrap();

        // Static period is 30s; shrink it to 1s through the dynamic override.
        let mgr = ConfigManager::new(ConscienceConfig::default(), None);
        let mut updates = serde_json::Map::new();
        updates.insert("persistence_period_secs".into(), serde_json::json!(1));
        assert!(mgr.update_config(updates).await.unwrap().success);

        let (tx, _rx) = broadcast::channel(8);
        let metrics = Arc::new(MetricsCollector::new());
        let handle = start_persistence_loop(
            Arc::clone(&r),
            "SDS".into(),
            path.clone(),
            mgr,
            tx,
            Arc::clone(&metrics),
        );
        tokio::time::sleep(Duration::from_millis(1800)).await;
        handle.abort();

        assert!(path.exists(), "loop must pick up the 1s dynamic period");
        assert!(metrics.snapshot().persistence_writes >= 1);
    }

    #[tokio::test]
    async fn snapshot_overwrites_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let r = registry();
        r.register(reg("rawx", "127.0.0.1:6201")).await.unwrap();
        write_status(&r, "SDS", &path).await.unwrap();
        r.register(reg("rawx", "127.0.0.1:6202")).await.unwrap();
        write_status(&r, "SDS", &path).await.unwrap();

        let r2 = registry();
        assert_eq!(restart_srv_from_file(&r2, "SDS", &path).await.unwrap(), 2);
    }
}

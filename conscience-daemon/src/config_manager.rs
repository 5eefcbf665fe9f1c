#![forbid(unsafe_code)]

use std::{path::PathBuf, sync::Arc, time::SystemTime};

use anyhow::{Context, Result};
use conscience_core::ConscienceConfig;
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::RwLock};
use tracing::{debug, info, warn};

/// Dynamic settings that can be changed at runtime via RPC.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DynamicConfig {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub persistence_period_secs: Option<u64>,
}

/// Single snapshot of configuration for rudimentary versioning and rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigVersion {
    pub version: u64,
    pub config: ConscienceConfig,
    pub dynamic: DynamicConfig,
    pub timestamp: SystemTime,
    pub description: String,
}

/// Public summary view of stored versions (no full config payloads).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSummary {
    pub version: u64,
    pub timestamp: SystemTime,
    pub description: String,
}

/// Response type returned by update/reload operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub validation_errors: Vec<String>,
}

impl ConfigResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into(), validation_errors: vec![] }
    }
    fn failed(message: impl Into<String>, errors: Vec<String>) -> Self {
        Self { success: false, message: message.into(), validation_errors: errors }
    }
}

/// Manager that owns configuration state and provides validation and file reload.
#[derive(Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<ConscienceConfig>>,
    dynamic: Arc<RwLock<DynamicConfig>>,
    config_path: Option<PathBuf>,
    versions: Arc<RwLock<Vec<ConfigVersion>>>,
    current_version: Arc<RwLock<u64>>, // monotonically increasing
    max_versions: usize,
}

impl ConfigManager {
    pub fn new(initial: ConscienceConfig, config_path: Option<PathBuf>) -> Self {
        Self {
            config: Arc::new(RwLock::new(initial)),
            dynamic: Arc::new(RwLock::new(DynamicConfig::default())),
            config_path,
            versions: Arc::new(RwLock::new(Vec::with_capacity(16))),
            current_version: Arc::new(RwLock::new(0)),
            max_versions: 16,
        }
    }

    pub async fn get_config(&self) -> ConscienceConfig {
        self.config.read().await.clone()
    }
    pub async fn get_dynamic(&self) -> DynamicConfig {
        self.dynamic.read().await.clone()
    }

    /// Effective snapshot period: dynamic override, else static config.
    pub async fn persistence_period_secs(&self) -> u64 {
        if let Some(secs) = self.dynamic.read().await.persistence_period_secs {
            return secs;
        }
        self.config.read().await.persistence_period_secs
    }

    /// Update dynamic settings atomically; returns detailed validation errors when any.
    pub async fn update_config(
        &self,
        updates: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ConfigResponse> {
        let mut dyncfg = self.dynamic.write().await;
        let mut errors = Vec::new();
        let mut changed = Vec::new();

        for (k, v) in updates.into_iter() {
            match k.as_str() {
                "log_level" => {
                    if let Some(level) = v.as_str() {
                        if matches!(level, "trace" | "debug" | "info" | "warn" | "error") {
                            dyncfg.log_level = Some(level.to_string());
                            changed.push(k);
                        } else {
                            errors.push(format!("invalid log_level: {level}"));
                        }
                    } else {
                        errors.push("log_level must be string".to_string());
                    }
                }
                "persistence_period_secs" => match v.as_u64() {
                    Some(secs) if (1..=86400).contains(&secs) => {
                        dyncfg.persistence_period_secs = Some(secs);
                        changed.push(k);
                    }
                    _ => errors.push("persistence_period_secs must be 1..=86400".into()),
                },
                other => {
                    errors.push(format!("unknown setting: {other}"));
                }
            }
        }

        if errors.is_empty() {
            info!("dynamic config updated: {:?}", changed);
            Ok(ConfigResponse::ok(format!("updated {} field(s)", changed.len())))
        } else {
            warn!("dynamic config update failed: {:?}", errors);
            Ok(ConfigResponse::failed("validation failed", errors))
        }
    }

    /// Reload from file when `config_path` is set. Rejected wholesale when any
    /// validation error (including a score expression that fails to parse)
    /// is present.
    pub async fn reload_from_file(&self) -> Result<ConfigResponse> {
        let path = match &self.config_path {
            Some(p) => p.clone(),
            None => return Ok(ConfigResponse::failed("no config path set", vec![])),
        };
        let content = fs::read_to_string(&path)
            .await
            .context("reading config file")?;
        let parsed: ConscienceConfig = toml::from_str(&content).context("parsing TOML")?;

        let errs = parsed.validation_errors();
        if !errs.is_empty() {
            return Ok(ConfigResponse::failed("validation failed", errs));
        }

        // version snapshot before apply
        self.snapshot("reload_from_file").await?;
        *self.config.write().await = parsed;
        info!("config reloaded from {:?}", path);
        Ok(ConfigResponse::ok("reloaded"))
    }

    /// Store a copy into the in-memory versions vector.
    pub async fn snapshot(&self, description: &str) -> Result<u64> {
        let cfg = self.config.read().await.clone();
        let dyncfg = self.dynamic.read().await.clone();
        let mut ver = self.current_version.write().await;
        *ver += 1;
        let version = *ver;

        let snap = ConfigVersion {
            version,
            config: cfg,
            dynamic: dyncfg,
            timestamp: SystemTime::now(),
            description: description.to_string(),
        };
        let mut list = self.versions.write().await;
        list.push(snap);
        if list.len() > self.max_versions {
            list.remove(0);
        }
        debug!("created config snapshot v{}", version);
        Ok(version)
    }

    pub async fn list_versions(&self) -> Vec<VersionSummary> {
        self.versions
            .read()
            .await
            .iter()
            .map(|v| VersionSummary {
                version: v.version,
                timestamp: v.timestamp,
                description: v.description.clone(),
            })
            .collect()
    }

    /// Restore a stored version; snapshots the current state first.
    pub async fn rollback(&self, version: u64) -> Result<ConfigResponse> {
        let target = {
            let list = self.versions.read().await;
            list.iter().find(|v| v.version == version).cloned()
        };
        let Some(target) = target else {
            return Ok(ConfigResponse::failed(format!("unknown version: {version}"), vec![]));
        };
        self.snapshot(&format!("before_rollback_to_{version}")).await?;
        *self.config.write().await = target.config;
        *self.dynamic.write().await = target.dynamic;
        info!("config rolled back to v{}", version);
        Ok(ConfigResponse::ok(format!("rolled back to v{version}")))
    }
}

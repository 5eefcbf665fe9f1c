#![forbid(unsafe_code)]

//! JSON models that mirror the daemon's wire types.

use conscience_core::{Score, ServiceAddr, ServiceType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Registration payload pushed by (or on behalf of) a service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub srv_type: ServiceType,
    pub addr: ServiceAddr,
    #[serde(default)]
    pub stats: BTreeMap<String, f64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Mirror of the daemon's registry record view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceView {
    pub srv_type: ServiceType,
    pub addr: ServiceAddr,
    pub score: Score,
    pub locked: bool,
    pub up: bool,
    #[serde(default)]
    pub stats: BTreeMap<String, f64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub last_seen_secs: u64,
}

/// Mirror of the daemon's ConfigResponse for caller convenience.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigResponse {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub validation_errors: Vec<String>,
}

use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::types::{
	DEFAULT_PERSISTENCE_PERIOD_SECS, DEFAULT_SCORE_TIMEOUT_SECS, DEFAULT_SCORE_VARIATION_BOUND,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path, path::PathBuf, time::Duration};

/// Per-type score policy as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScorePolicyConfig {
	/// Expression evaluated against the stats reported at registration.
	#[serde(default = "default_score_expr")]
	pub score_expr: String,
	/// Seconds without a refresh before the score is zeroed.
	#[serde(default = "default_score_timeout")]
	pub score_timeout_secs: u64,
	/// Maximum upward score motion per registration.
	#[serde(default = "default_variation_bound")]
	pub score_variation_bound: u32,
}

impl Default for ScorePolicyConfig {
	fn default() -> Self {
		Self {
			score_expr: default_score_expr(),
			score_timeout_secs: default_score_timeout(),
			score_variation_bound: default_variation_bound(),
		}
	}
}

fn default_score_expr() -> String { "100".into() }
fn default_score_timeout() -> u64 { DEFAULT_SCORE_TIMEOUT_SECS }
fn default_variation_bound() -> u32 { DEFAULT_SCORE_VARIATION_BOUND }
fn default_persistence_period() -> u64 { DEFAULT_PERSISTENCE_PERIOD_SECS }
fn default_listen_addr() -> String { "127.0.0.1:6000".into() }
fn default_namespace() -> String { "ns".into() }

/// Compiled score policy, ready for evaluation.
#[derive(Debug, Clone)]
pub struct ScorePolicy {
	pub expr: Expr,
	pub timeout: Duration,
	pub variation_bound: u32,
}

impl ScorePolicyConfig {
	pub fn compile(&self) -> Result<ScorePolicy> {
		if self.score_timeout_secs == 0 {
			return Err(Error::config("score_timeout_secs must be > 0"));
		}
		let expr = Expr::parse(&self.score_expr)
			.map_err(|e| Error::config(format!("score_expr {:?}: {e}", self.score_expr)))?;
		Ok(ScorePolicy {
			expr,
			timeout: Duration::from_secs(self.score_timeout_secs),
			variation_bound: self.score_variation_bound,
		})
	}
}

/// Static daemon configuration loaded from TOML. Unknown fields are ignored
/// so older daemons keep reading newer files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConscienceConfig {
	#[serde(default = "default_namespace")]
	pub namespace: String,
	/// TCP listen address for the registry RPC endpoint.
	#[serde(default = "default_listen_addr")]
	pub listen_addr: String,
	/// Tracing level (e.g. "info", "debug").
	#[serde(default)]
	pub log_level: Option<String>,
	/// Status snapshot destination; persistence is off when absent.
	#[serde(default)]
	pub persistence_path: Option<PathBuf>,
	/// Seconds between automatic snapshots.
	#[serde(default = "default_persistence_period")]
	pub persistence_period_secs: u64,
	/// Per-type score policies; the `default` entry is the fallback.
	#[serde(default)]
	pub service: BTreeMap<String, ScorePolicyConfig>,
}

impl Default for ConscienceConfig {
	fn default() -> Self {
		Self {
			namespace: default_namespace(),
			listen_addr: default_listen_addr(),
			log_level: None,
			persistence_path: None,
			persistence_period_secs: default_persistence_period(),
			service: BTreeMap::new(),
		}
	}
}

impl ConscienceConfig {
	pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
		let data = fs::read_to_string(path)?;
		let cfg: Self =
			toml::from_str(&data).map_err(|e| Error::config(format!("toml parse error: {e}")))?;
		cfg.validate()?;
		Ok(cfg)
	}

	pub fn from_env() -> Result<Self> {
		let mut cfg = Self::default();
		if let Ok(v) = std::env::var("CONSCIENCE_NAMESPACE") {
			cfg.namespace = v;
		}
		if let Ok(v) = std::env::var("CONSCIENCE_LISTEN") {
			cfg.listen_addr = v;
		}
		if let Ok(v) = std::env::var("CONSCIENCE_LOG_LEVEL") {
			cfg.log_level = Some(v);
		}
		if let Ok(v) = std::env::var("CONSCIENCE_PERSISTENCE_PATH") {
			if !v.trim().is_empty() {
				cfg.persistence_path = Some(PathBuf::from(v));
			}
		}
		cfg.validate()?;
		Ok(cfg)
	}

	pub fn validate(&self) -> Result<()> {
		match self.validation_errors().into_iter().next() {
			Some(e) => Err(Error::config(e)),
			None => Ok(()),
		}
	}

	/// All validation problems at once, for operator-facing reload responses.
	pub fn validation_errors(&self) -> Vec<String> {
		let mut errs = Vec::new();
		if self.namespace.is_empty() {
			errs.push("namespace must not be empty".into());
		}
		if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
			errs.push(format!("listen_addr is not a socket address: {:?}", self.listen_addr));
		}
		if let Some(level) = &self.log_level {
			let allowed = ["trace", "debug", "info", "warn", "error"];
			if !allowed.contains(&level.as_str()) {
				errs.push(format!("invalid log_level: {level}"));
			}
		}
		if self.persistence_period_secs == 0 {
			errs.push("persistence_period_secs must be > 0".into());
		}
		for (ty, policy) in &self.service {
			if let Err(e) = policy.compile() {
				errs.push(format!("service.{ty}: {e}"));
			}
		}
		errs
	}

	/// Policy for a type: exact entry, then `default`, then built-in defaults.
	pub fn policy_config_for(&self, srv_type: &str) -> ScorePolicyConfig {
		self.service
			.get(srv_type)
			.or_else(|| self.service.get("default"))
			.cloned()
			.unwrap_or_default()
	}

	/// Compile every configured policy. The `default` fallback is always present.
	pub fn compile_policies(&self) -> Result<BTreeMap<String, ScorePolicy>> {
		let mut out = BTreeMap::new();
		for (ty, policy) in &self.service {
			out.insert(ty.clone(), policy.compile()?);
		}
		out.entry("default".into())
			.or_insert(ScorePolicyConfig::default().compile()?);
		Ok(out)
	}
}

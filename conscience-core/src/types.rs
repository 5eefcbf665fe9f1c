use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, net::SocketAddr, str::FromStr};

/// Highest score a service can reach.
pub const SCORE_MAX: u32 = 100;

/// Seconds without a refresh before an unlocked service is zeroed.
pub const DEFAULT_SCORE_TIMEOUT_SECS: u64 = 30;

/// Maximum upward score motion per registration.
pub const DEFAULT_SCORE_VARIATION_BOUND: u32 = 5;

/// Seconds between automatic status snapshots.
pub const DEFAULT_PERSISTENCE_PERIOD_SECS: u64 = 30;

/// Service kind identifier (`rawx`, `meta0`, `meta1`, `meta2`, `sqlx`, ...).
///
/// Lowercase ASCII, `[a-z0-9_-]`, non-empty, at most 32 bytes. The pair
/// (type, addr) is the registry key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceType(String);

impl ServiceType {
	pub fn new(s: impl Into<String>) -> Result<Self> {
		let s = s.into();
		if s.is_empty() || s.len() > 32 {
			return Err(Error::config(format!("invalid service type length: {:?}", s)));
		}
		if !s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-') {
			return Err(Error::config(format!("invalid service type: {s:?}")));
		}
		Ok(Self(s))
	}

	pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ServiceType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl FromStr for ServiceType {
	type Err = Error;
	fn from_str(s: &str) -> Result<Self> { Self::new(s) }
}

impl TryFrom<String> for ServiceType {
	type Error = Error;
	fn try_from(s: String) -> Result<Self> { Self::new(s) }
}

impl From<ServiceType> for String {
	fn from(t: ServiceType) -> String { t.0 }
}

/// Network identity of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceAddr(pub SocketAddr);

impl ServiceAddr {
	pub fn socket_addr(&self) -> SocketAddr { self.0 }
}

impl fmt::Display for ServiceAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

impl FromStr for ServiceAddr {
	type Err = Error;
	fn from_str(s: &str) -> Result<Self> {
		s.parse::<SocketAddr>()
			.map(ServiceAddr)
			.map_err(|e| Error::config(format!("invalid service addr {s:?}: {e}")))
	}
}

impl From<SocketAddr> for ServiceAddr {
	fn from(a: SocketAddr) -> Self { Self(a) }
}

/// Service quality score, always within `0..=SCORE_MAX`. Zero means unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Score(u32);

impl Score {
	pub const ZERO: Score = Score(0);
	pub const MAX: Score = Score(SCORE_MAX);

	/// Clamp an arbitrary value into the valid range.
	pub fn clamped(v: i64) -> Self { Self(v.clamp(0, SCORE_MAX as i64) as u32) }

	pub fn get(self) -> u32 { self.0 }
	pub fn is_zero(self) -> bool { self.0 == 0 }
}

impl TryFrom<u32> for Score {
	type Error = Error;
	fn try_from(v: u32) -> Result<Self> {
		if v > SCORE_MAX {
			return Err(Error::config(format!("score out of range: {v}")));
		}
		Ok(Self(v))
	}
}

impl From<Score> for u32 {
	fn from(s: Score) -> u32 { s.0 }
}

impl fmt::Display for Score {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

#![forbid(unsafe_code)]

//! In-memory service registry.
//!
//! Tracks every registered service instance keyed by (type, addr), scores it
//! through the configured expression policy, and expires instances that stop
//! refreshing. Scores rise slowly (bounded per registration) and fall
//! immediately, so a flapping service cannot oscillate back to full score.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use conscience_core::{Score, ScorePolicy, ServiceAddr, ServiceType};
use conscience_core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::event_system::Event;

/// What a service pushes when it announces itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub srv_type: ServiceType,
    pub addr: ServiceAddr,
    /// Numeric stats the score expression evaluates against (`stat.cpu`, ...).
    #[serde(default)]
    pub stats: BTreeMap<String, f64>,
    /// Free-form string tags (`tag.loc`, `tag.vol`, ...).
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Public, serializable view of a registry record.
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
    /// Seconds since the last registration refresh.
    pub last_seen_secs: u64,
}

#[derive(Debug, Clone)]
struct ServiceRecord {
    srv_type: ServiceType,
    addr: ServiceAddr,
    score: Score,
    locked: bool,
    up: bool,
    stats: BTreeMap<String, f64>,
    tags: BTreeMap<String, String>,
    last_seen: Instant,
    /// Set when the score reached zero; drives removal after a second timeout.
    zero_since: Option<Instant>,
}

impl ServiceRecord {
    fn view(&self, now: Instant) -> ServiceView {
        ServiceView {
            srv_type: self.srv_type.clone(),
            addr: self.addr,
            score: self.score,
            locked: self.locked,
            up: self.up,
            stats: self.stats.clone(),
            tags: self.tags.clone(),
            last_seen_secs: now.saturating_duration_since(self.last_seen).as_secs(),
        }
    }
}

type Key = (ServiceType, ServiceAddr);

pub struct Registry {
    services: RwLock<HashMap<Key, ServiceRecord>>,
    policies: RwLock<BTreeMap<String, ScorePolicy>>,
    events: broadcast::Sender<Event>,
}

impl Registry {
    pub fn new(policies: BTreeMap<String, ScorePolicy>, events: broadcast::Sender<Event>) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            policies: RwLock::new(policies),
            events,
        }
    }

    /// Swap in freshly compiled policies (config reload).
    pub async fn set_policies(&self, policies: BTreeMap<String, ScorePolicy>) {
        *self.policies.write().await = policies;
        debug!("score policies replaced");
    }

    async fn policy_for(&self, srv_type: &ServiceType) -> ScorePolicy {
        let policies = self.policies.read().await;
        policies
            .get(srv_type.as_str())
            .or_else(|| policies.get("default"))
            .cloned()
            // `default` is always present (compile_policies guarantees it);
            // a constant-100 policy keeps us safe if it ever is not.
            .unwrap_or_else(|| {
                warn!("no default score policy; using constant");
                conscience_core::ScorePolicyConfig::default()
                    .compile()
                    .unwrap_or(ScorePolicy {
                        expr: conscience_core::Expr::Num(100.0),
                        timeout: Duration::from_secs(30),
                        variation_bound: 5,
                    })
            })
    }

    /// Upsert a registration and return the effective record.
    ///
    /// The score is recomputed from the type's policy over the submitted
    /// stats. An upward move is capped at `score_variation_bound` per call;
    /// a downward move applies immediately. Locked records keep their score.
    pub async fn register(&self, reg: Registration) -> Result<ServiceView> {
        let policy = self.policy_for(&reg.srv_type).await;
        let raw = policy.expr.eval(&reg.stats)?;
        let target = Score::clamped(raw.trunc() as i64);

        let now = Instant::now();
        let key = (reg.srv_type.clone(), reg.addr);
        let mut services = self.services.write().await;

        let view = match services.get_mut(&key) {
            Some(rec) => {
                let new_score = if rec.locked {
                    rec.score
                } else {
                    bounded_rise(rec.score, target, policy.variation_bound)
                };
                let was_up = rec.up;
                rec.score = new_score;
                rec.up = true;
                rec.stats = reg.stats;
                rec.tags = reg.tags;
                rec.last_seen = now;
                rec.zero_since = if new_score.is_zero() {
                    rec.zero_since.or(Some(now))
                } else {
                    None
                };
                if !was_up {
                    info!("service up again: {} {}", rec.srv_type, rec.addr);
                    let _ = self
                        .events
                        .send(Event::service(format!("up {} {}", rec.srv_type, rec.addr)));
                }
                rec.view(now)
            }
            None => {
                // First sight of a service starts at the bounded score so a
                // newcomer cannot immediately outrank established instances.
                let score = bounded_rise(Score::ZERO, target, policy.variation_bound);
                let rec = ServiceRecord {
                    srv_type: reg.srv_type.clone(),
                    addr: reg.addr,
                    score,
                    locked: false,
                    up: true,
                    stats: reg.stats,
                    tags: reg.tags,
                    last_seen: now,
                    zero_since: if score.is_zero() { Some(now) } else { None },
                };
                info!("service registered: {} {} score={}", rec.srv_type, rec.addr, rec.score);
                let _ = self
                    .events
                    .send(Event::service(format!("registered {} {}", reg.srv_type, reg.addr)));
                let view = rec.view(now);
                services.insert(key, rec);
                view
            }
        };
        Ok(view)
    }

    pub async fn list(&self, srv_type: &ServiceType, include_down: bool) -> Vec<ServiceView> {
        let now = Instant::now();
        let services = self.services.read().await;
        let mut out: Vec<ServiceView> = services
            .values()
            .filter(|r| &r.srv_type == srv_type && (include_down || r.up))
            .map(|r| r.view(now))
            .collect();
        out.sort_by(|a, b| a.addr.cmp(&b.addr));
        out
    }

    pub async fn list_all(&self, include_down: bool) -> Vec<ServiceView> {
        let now = Instant::now();
        let services = self.services.read().await;
        let mut out: Vec<ServiceView> = services
            .values()
            .filter(|r| include_down || r.up)
            .map(|r| r.view(now))
            .collect();
        out.sort_by(|a, b| (&a.srv_type, a.addr).cmp(&(&b.srv_type, b.addr)));
        out
    }

    /// Known types with their instance counts.
    pub async fn types(&self) -> BTreeMap<String, usize> {
        let services = self.services.read().await;
        let mut out: BTreeMap<String, usize> = BTreeMap::new();
        for rec in services.values() {
            *out.entry(rec.srv_type.as_str().to_string()).or_default() += 1;
        }
        out
    }

    /// Pin a service's score until `unlock`. Unknown services are an error.
    pub async fn lock(&self, srv_type: &ServiceType, addr: ServiceAddr, score: Score) -> Result<ServiceView> {
        let now = Instant::now();
        let mut services = self.services.write().await;
        let rec = services
            .get_mut(&(srv_type.clone(), addr))
            .ok_or_else(|| Error::protocol(format!("unknown service: {srv_type} {addr}")))?;
        rec.locked = true;
        rec.score = score;
        rec.zero_since = None;
        info!("score locked: {} {} at {}", srv_type, addr, score);
        let _ = self
            .events
            .send(Event::service(format!("locked {srv_type} {addr} {score}")));
        Ok(rec.view(now))
    }

    pub async fn unlock(&self, srv_type: &ServiceType, addr: ServiceAddr) -> Result<ServiceView> {
        let now = Instant::now();
        let mut services = self.services.write().await;
        let rec = services
            .get_mut(&(srv_type.clone(), addr))
            .ok_or_else(|| Error::protocol(format!("unknown service: {srv_type} {addr}")))?;
        rec.locked = false;
        // The expiry clock restarts; the next registration rescores.
        rec.last_seen = now;
        info!("score unlocked: {} {}", srv_type, addr);
        let _ = self.events.send(Event::service(format!("unlocked {srv_type} {addr}")));
        Ok(rec.view(now))
    }

    /// Drop every record of a type. Locked records survive only when
    /// `keep_locked` is set.
    pub async fn flush(&self, srv_type: &ServiceType, keep_locked: bool) -> usize {
        let mut services = self.services.write().await;
        let before = services.len();
        services.retain(|_, r| &r.srv_type != srv_type || (keep_locked && r.locked));
        let removed = before - services.len();
        if removed > 0 {
            info!("flushed {} {} service(s)", removed, srv_type);
            let _ = self
                .events
                .send(Event::service(format!("flushed {srv_type} ({removed})")));
        }
        removed
    }

    /// One expiry sweep: zero unlocked records past their timeout, remove
    /// records that stayed at zero for a further full timeout.
    pub async fn expire_once(&self) -> usize {
        let now = Instant::now();
        let policies = self.policies.read().await.clone();
        let mut services = self.services.write().await;
        let mut expired = 0usize;
        let mut removals: Vec<Key> = Vec::new();

        for (key, rec) in services.iter_mut() {
            if rec.locked {
                continue;
            }
            let timeout = policies
                .get(rec.srv_type.as_str())
                .or_else(|| policies.get("default"))
                .map(|p| p.timeout)
                .unwrap_or(Duration::from_secs(30));
            let idle = now.saturating_duration_since(rec.last_seen);
            if idle < timeout {
                continue;
            }
            if !rec.score.is_zero() || rec.up {
                warn!("service expired: {} {} (idle {}s)", rec.srv_type, rec.addr, idle.as_secs());
                rec.score = Score::ZERO;
                rec.up = false;
                rec.zero_since.get_or_insert(now);
                expired += 1;
                let _ = self
                    .events
                    .send(Event::service(format!("expired {} {}", rec.srv_type, rec.addr)));
            } else if let Some(since) = rec.zero_since {
                if now.saturating_duration_since(since) >= timeout {
                    removals.push(key.clone());
                }
            }
        }

        for key in removals {
            if let Some(rec) = services.remove(&key) {
                info!("service removed after expiry: {} {}", rec.srv_type, rec.addr);
                let _ = self
                    .events
                    .send(Event::service(format!("removed {} {}", rec.srv_type, rec.addr)));
            }
        }
        expired
    }

    /// Background expiry sweep driven by a fixed interval.
    pub fn start_expiry_loop(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let n = this.expire_once().await;
                if n > 0 {
                    debug!("expiry sweep zeroed {n} service(s)");
                }
            }
        })
    }

    /// Everything currently known, for persistence snapshots.
    pub async fn snapshot_entries(&self) -> Vec<PersistedService> {
        let services = self.services.read().await;
        let mut out: Vec<PersistedService> = services
            .values()
            .map(|r| PersistedService {
                srv_type: r.srv_type.clone(),
                addr: r.addr,
                score: r.score,
                locked: r.locked,
                stats: r.stats.clone(),
                tags: r.tags.clone(),
            })
            .collect();
        out.sort_by(|a, b| (&a.srv_type, a.addr).cmp(&(&b.srv_type, b.addr)));
        out
    }

    /// Replace the registry content with restored entries.
    ///
    /// Restored services keep their persisted score and locked flag but come
    /// back down, with a fresh expiry clock; they stay down until their
    /// service re-registers.
    pub async fn restore(&self, entries: Vec<PersistedService>) -> usize {
        let now = Instant::now();
        let mut services = self.services.write().await;
        services.clear();
        let n = entries.len();
        for e in entries {
            let rec = ServiceRecord {
                srv_type: e.srv_type.clone(),
                addr: e.addr,
                score: e.score,
                locked: e.locked,
                up: false,
                stats: e.stats,
                tags: e.tags,
                last_seen: now,
                zero_since: if e.score.is_zero() { Some(now) } else { None },
            };
            services.insert((e.srv_type, e.addr), rec);
        }
        n
    }

    /// (total, up, locked, score sum) in one pass, for metrics sampling.
    pub async fn counts(&self) -> (usize, usize, usize, u64) {
        let services = self.services.read().await;
        let mut up = 0usize;
        let mut locked = 0usize;
        let mut score_sum = 0u64;
        for r in services.values() {
            if r.up {
                up += 1;
            }
            if r.locked {
                locked += 1;
            }
            score_sum += r.score.get() as u64;
        }
        (services.len(), up, locked, score_sum)
    }
}

/// One persisted registry entry; the status file is a list of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedService {
    pub srv_type: ServiceType,
    pub addr: ServiceAddr,
    pub score: Score,
    pub locked: bool,
    #[serde(default)]
    pub stats: BTreeMap<String, f64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn bounded_rise(old: Score, target: Score, bound: u32) -> Score {
    if target > old {
        Score::clamped(old.get().saturating_add(bound).min(target.get()) as i64)
    } else {
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conscience_core::{ConscienceConfig, ScorePolicyConfig};

    fn test_registry(policies: &[(&str, &str, u64, u32)]) -> Registry {
        let mut cfg = ConscienceConfig::default();
        for (ty, expr, timeout, bound) in policies {
            cfg.service.insert(
                ty.to_string(),
                ScorePolicyConfig {
                    score_expr: expr.to_string(),
                    score_timeout_secs: *timeout,
                    score_variation_bound: *bound,
                },
            );
        }
        let (tx, _rx) = broadcast::channel(64);
        Registry::new(cfg.compile_policies().unwrap(), tx)
    }

    fn reg(ty: &str, addr: &str, cpu: f64) -> Registration {
        Registration {
            srv_type: ty.parse().unwrap(),
            addr: addr.parse().unwrap(),
            stats: [("stat.cpu".to_string(), cpu)].into_iter().collect(),
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn score_rises_bounded_and_falls_immediately() {
        let r = test_registry(&[("rawx", "(num stat.cpu)", 120, 5)]);
        let v = r.register(reg("rawx", "127.0.0.1:6201", 80.0)).await.unwrap();
        assert_eq!(v.score.get(), 5, "first registration capped by variation bound");

        let v = r.register(reg("rawx", "127.0.0.1:6201", 80.0)).await.unwrap();
        assert_eq!(v.score.get(), 10);

        // Downward motion is not bounded.
        let v = r.register(reg("rawx", "127.0.0.1:6201", 3.0)).await.unwrap();
        assert_eq!(v.score.get(), 3);
    }

    #[tokio::test]
    async fn default_policy_applies_to_unknown_types() {
        let r = test_registry(&[]);
        let v = r.register(reg("echo", "127.0.0.1:7000", 0.0)).await.unwrap();
        // Default expr is the constant 100, rise-bounded to 5 on first sight.
        assert_eq!(v.score.get(), 5);
    }

    #[tokio::test]
    async fn missing_stat_is_an_error() {
        let r = test_registry(&[("rawx", "(num stat.cpu)", 120, 5)]);
        let mut bad = reg("rawx", "127.0.0.1:6201", 0.0);
        bad.stats.clear();
        assert!(r.register(bad).await.is_err());
    }

    #[tokio::test]
    async fn locked_score_survives_registration_and_flush() {
        let r = test_registry(&[("rawx", "(num stat.cpu)", 120, 100)]);
        let ty: ServiceType = "rawx".parse().unwrap();
        let addr: ServiceAddr = "127.0.0.1:6201".parse().unwrap();

        r.register(reg("rawx", "127.0.0.1:6201", 90.0)).await.unwrap();
        let v = r.lock(&ty, addr, Score::try_from(42).unwrap()).await.unwrap();
        assert_eq!(v.score.get(), 42);

        let v = r.register(reg("rawx", "127.0.0.1:6201", 90.0)).await.unwrap();
        assert_eq!(v.score.get(), 42, "registration must not move a locked score");

        assert_eq!(r.flush(&ty, true).await, 0, "locked record kept with keep_locked");
        let v = r.unlock(&ty, addr).await.unwrap();
        assert!(!v.locked);
        assert_eq!(r.flush(&ty, false).await, 1);
        assert!(r.list(&ty, true).await.is_empty());
    }

    #[tokio::test]
    async fn expiry_zeroes_then_removes() {
        // 1-second timeout so the test can actually cross it.
        let r = test_registry(&[("rawx", "100", 1, 100)]);
        let ty: ServiceType = "rawx".parse().unwrap();
        r.register(reg("rawx", "127.0.0.1:6201", 0.0)).await.unwrap();

        assert_eq!(r.expire_once().await, 0, "fresh record must not expire");
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(r.expire_once().await, 1);

        let v = &r.list(&ty, true).await[0];
        assert!(!v.up);
        assert!(v.score.is_zero());
        assert!(r.list(&ty, false).await.is_empty(), "down services hidden by default");

        // A second full timeout at zero removes the record.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        r.expire_once().await;
        assert!(r.list(&ty, true).await.is_empty());
    }

    #[tokio::test]
    async fn locked_records_never_expire() {
        let r = test_registry(&[("rawx", "100", 1, 100)]);
        let ty: ServiceType = "rawx".parse().unwrap();
        let addr: ServiceAddr = "127.0.0.1:6201".parse().unwrap();
        r.register(reg("rawx", "127.0.0.1:6201", 0.0)).await.unwrap();
        r.lock(&ty, addr, Score::try_from(50).unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(r.expire_once().await, 0);
        assert_eq!(r.list(&ty, true).await[0].score.get(), 50);
    }

    #[tokio::test]
    async fn huge_variation_bound_does_not_overflow() {
        let r = test_registry(&[("rawx", "(num stat.cpu)", 120, u32::MAX)]);
        let v = r.register(reg("rawx", "127.0.0.1:6201", 50.0)).await.unwrap();
        assert_eq!(v.score.get(), 50, "unbounded rise goes straight to the target");
        // A further rise adds the bound to a non-zero score.
        let v = r.register(reg("rawx", "127.0.0.1:6201", 80.0)).await.unwrap();
        assert_eq!(v.score.get(), 80);
    }

    #[tokio::test]
    async fn restore_marks_services_down_with_score_intact() {
        let r = test_registry(&[("rawx", "(num stat.cpu)", 120, 100)]);
        r.register(reg("rawx", "127.0.0.1:6201", 80.0)).await.unwrap();
        r.register(reg("meta2", "127.0.0.1:6101", 60.0)).await.unwrap();
        let entries = r.snapshot_entries().await;

        let r2 = test_registry(&[("rawx", "(num stat.cpu)", 120, 100)]);
        assert_eq!(r2.restore(entries).await, 2);
        for v in r2.list_all(true).await {
            assert!(!v.up, "restored services must be down until re-registered");
            assert!(v.score.get() > 0, "restored score must be preserved");
        }
        assert!(r2.list_all(false).await.is_empty());
    }

    #[tokio::test]
    async fn types_reports_instance_counts() {
        let r = test_registry(&[]);
        r.register(reg("rawx", "127.0.0.1:6201", 0.0)).await.unwrap();
        r.register(reg("rawx", "127.0.0.1:6202", 0.0)).await.unwrap();
        r.register(reg("meta2", "127.0.0.1:6101", 0.0)).await.unwrap();
        let types = r.types().await;
        assert_eq!(types.get("rawx"), Some(&2));
        assert_eq!(types.get("meta2"), Some(&1));
    }
}

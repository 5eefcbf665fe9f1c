// End-to-end registry flows over the TCP RPC endpoint.

use std::collections::BTreeMap;

use conscience_core::{ConscienceConfig, ScorePolicyConfig};
use conscience_integration_tests::TestDaemon;
use conscience_sdk::Registration;

fn cpu_scored_config() -> ConscienceConfig {
    let mut cfg = ConscienceConfig::default();
    cfg.namespace = "TESTNS".into();
    cfg.service.insert(
        "rawx".into(),
        ScorePolicyConfig { score_expr: "(num stat.cpu)".into(), ..Default::default() },
    );
    cfg
}

fn rawx(addr: &str, cpu: f64) -> Registration {
    Registration {
        srv_type: "rawx".parse().unwrap(),
        addr: addr.parse().unwrap(),
        stats: [("stat.cpu".to_string(), cpu)].into_iter().collect(),
        tags: BTreeMap::new(),
    }
}

#[tokio::test]
async fn register_rises_bounded_and_falls_immediately() {
    let d = TestDaemon::spawn(cpu_scored_config()).await.unwrap();
    let c = d.client();

    // Default variation bound is 5: first sight starts at 5, then 10.
    let v = c.register_service(&rawx("127.0.0.1:6201", 80.0)).await.unwrap();
    assert_eq!(v.score.get(), 5);
    let v = c.register_service(&rawx("127.0.0.1:6201", 80.0)).await.unwrap();
    assert_eq!(v.score.get(), 10);

    // A drop in the computed score applies at once.
    let v = c.register_service(&rawx("127.0.0.1:6201", 3.0)).await.unwrap();
    assert_eq!(v.score.get(), 3);

    d.shutdown();
}

#[tokio::test]
async fn list_and_types_reflect_registrations() {
    let d = TestDaemon::spawn(cpu_scored_config()).await.unwrap();
    let c = d.client();

    c.register_service(&rawx("127.0.0.1:6201", 50.0)).await.unwrap();
    c.register_service(&rawx("127.0.0.1:6202", 50.0)).await.unwrap();

    let listed = c.list_services(Some("rawx"), false).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|v| v.up));

    let types = c.list_types().await.unwrap();
    assert_eq!(types.get("rawx"), Some(&2));

    let empty = c.list_services(Some("meta2"), true).await.unwrap();
    assert!(empty.is_empty());

    d.shutdown();
}

#[tokio::test]
async fn lock_pins_score_until_unlock() {
    let d = TestDaemon::spawn(cpu_scored_config()).await.unwrap();
    let c = d.client();

    c.register_service(&rawx("127.0.0.1:6201", 80.0)).await.unwrap();
    let v = c.lock_score("rawx", "127.0.0.1:6201", 42).await.unwrap();
    assert!(v.locked);
    assert_eq!(v.score.get(), 42);

    // A refresh does not move a locked score.
    let v = c.register_service(&rawx("127.0.0.1:6201", 80.0)).await.unwrap();
    assert_eq!(v.score.get(), 42);

    let v = c.unlock_score("rawx", "127.0.0.1:6201").await.unwrap();
    assert!(!v.locked);

    // Rise resumes from the pinned value, still bounded.
    let v = c.register_service(&rawx("127.0.0.1:6201", 80.0)).await.unwrap();
    assert_eq!(v.score.get(), 47);

    d.shutdown();
}

#[tokio::test]
async fn lock_unknown_service_is_an_error() {
    let d = TestDaemon::spawn(cpu_scored_config()).await.unwrap();
    let c = d.client();
    assert!(c.lock_score("rawx", "127.0.0.1:9999", 10).await.is_err());
    d.shutdown();
}

#[tokio::test]
async fn flush_removes_a_whole_type() {
    let d = TestDaemon::spawn(cpu_scored_config()).await.unwrap();
    let c = d.client();

    c.register_service(&rawx("127.0.0.1:6201", 50.0)).await.unwrap();
    c.register_service(&rawx("127.0.0.1:6202", 50.0)).await.unwrap();

    let v = c.flush_services("rawx", false).await.unwrap();
    assert_eq!(v["removed"], 2);
    assert!(c.list_services(Some("rawx"), true).await.unwrap().is_empty());

    d.shutdown();
}

#[tokio::test]
async fn info_and_health_report_daemon_state() {
    let d = TestDaemon::spawn(cpu_scored_config()).await.unwrap();
    let c = d.client();

    c.register_service(&rawx("127.0.0.1:6201", 50.0)).await.unwrap();

    let info = c.get_info().await.unwrap();
    assert_eq!(info["namespace"], "TESTNS");
    assert_eq!(info["services"], 1);
    assert_eq!(info["types"], 1);

    let health = c.health().await.unwrap();
    assert_eq!(health["healthy"], true);
    assert_eq!(health["components"]["persistence"], "disabled");

    d.shutdown();
}

#[tokio::test]
async fn subscribed_client_sees_service_events() {
    let d = TestDaemon::spawn(cpu_scored_config()).await.unwrap();

    let mut rx = d
        .client()
        .subscribe_events(Some(vec!["service".into()]))
        .await
        .unwrap();

    d.client().register_service(&rawx("127.0.0.1:6201", 50.0)).await.unwrap();

    let ev = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
        .await
        .expect("event within deadline")
        .expect("channel open");
    assert_eq!(ev.ty, "service");
    assert!(ev.detail.contains("127.0.0.1:6201"));

    d.shutdown();
}

#[tokio::test]
async fn update_config_round_trips_through_rpc() {
    let d = TestDaemon::spawn(cpu_scored_config()).await.unwrap();
    let c = d.client();

    let mut map = serde_json::Map::new();
    map.insert("persistence_period_secs".into(), serde_json::json!(15));
    let resp = c.update_config(map).await.unwrap();
    assert!(resp.success, "{}", resp.message);

    let mut bad = serde_json::Map::new();
    bad.insert("no_such_key".into(), serde_json::json!(1));
    let resp = c.update_config(bad).await.unwrap();
    assert!(!resp.success);

    d.shutdown();
}

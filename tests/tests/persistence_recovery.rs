// Status persistence and restart recovery, exercised through the RPC
// surface the way an operator-triggered snapshot and a daemon restart would.

use std::collections::BTreeMap;

use conscience_daemon::persistence::restart_srv_from_file;
use conscience_integration_tests::TestDaemon;
use conscience_sdk::Registration;

fn reg(ty: &str, addr: &str) -> Registration {
    Registration {
        srv_type: ty.parse().unwrap(),
        addr: addr.parse().unwrap(),
        stats: BTreeMap::new(),
        tags: [("tag.loc".to_string(), "rack1".to_string())].into_iter().collect(),
    }
}

#[tokio::test]
async fn status_survives_a_daemon_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conscience-status.json");

    // First daemon: register services and persist on demand.
    let d1 = TestDaemon::spawn_with_persistence(path.clone()).await.unwrap();
    let c1 = d1.client();
    c1.register_service(&reg("rawx", "127.0.0.1:6201")).await.unwrap();
    c1.register_service(&reg("meta2", "127.0.0.1:6101")).await.unwrap();
    let out = c1.write_status().await.unwrap();
    assert_eq!(out["services"], 2);
    d1.shutdown();

    // Second daemon: fresh state, recover from the file.
    let d2 = TestDaemon::spawn_with_persistence(path.clone()).await.unwrap();
    let n = restart_srv_from_file(&d2.state.registry, &d2.state.namespace, &path)
        .await
        .unwrap();
    assert_eq!(n, 2);

    let c2 = d2.client();
    // Restored services are down until they register again, score intact.
    assert!(c2.list_services(None, false).await.unwrap().is_empty());
    let all = c2.list_services(None, true).await.unwrap();
    assert_eq!(all.len(), 2);
    for v in &all {
        assert!(!v.up);
        assert!(v.score.get() > 0);
    }

    // A registration brings the instance back up.
    let v = c2.register_service(&reg("rawx", "127.0.0.1:6201")).await.unwrap();
    assert!(v.up);

    d2.shutdown();
}

#[tokio::test]
async fn write_status_requires_a_persistence_path() {
    let d = TestDaemon::spawn(Default::default()).await.unwrap();
    let c = d.client();
    let err = c.write_status().await.unwrap_err();
    assert!(err.to_string().contains("persistence disabled"), "{err}");
    d.shutdown();
}

#[tokio::test]
async fn recovery_fails_cleanly_on_missing_or_corrupt_file() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("does-not-exist.json");

    let d = TestDaemon::spawn_with_persistence(missing.clone()).await.unwrap();
    assert!(restart_srv_from_file(&d.state.registry, &d.state.namespace, &missing)
        .await
        .is_err());

    // Corrupt file: recovery fails and the live registry keeps its content.
    let corrupt = dir.path().join("corrupt.json");
    tokio::fs::write(&corrupt, "bad content").await.unwrap();
    let c = d.client();
    c.register_service(&reg("rawx", "127.0.0.1:6201")).await.unwrap();
    assert!(restart_srv_from_file(&d.state.registry, &d.state.namespace, &corrupt)
        .await
        .is_err());
    assert_eq!(c.list_services(None, true).await.unwrap().len(), 1);

    d.shutdown();
}

use std::path::PathBuf;
use std::sync::Arc;

use conscience_core::ConscienceConfig;
use conscience_daemon::server::{build_state, serve, DaemonState};
use conscience_sdk::{ConscienceClient, SdkConfig};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A daemon instance bound to an ephemeral port, driven through the SDK.
pub struct TestDaemon {
    pub endpoint: String,
    pub state: Arc<DaemonState>,
    server: JoinHandle<std::io::Result<()>>,
}

/// Install a process-wide tracing subscriber honoring RUST_LOG.
pub fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl TestDaemon {
    /// Spawn a daemon with the given configuration. Auth is disabled so
    /// tests can exercise privileged operations directly.
    pub async fn spawn(cfg: ConscienceConfig) -> anyhow::Result<Self> {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let endpoint = listener.local_addr()?.to_string();
        let state = build_state(cfg, None, None)?;
        let server = tokio::spawn(serve(listener, state.clone()));
        Ok(Self { endpoint, state, server })
    }

    /// Spawn with defaults plus a persistence path under a temp directory.
    pub async fn spawn_with_persistence(path: PathBuf) -> anyhow::Result<Self> {
        let cfg = ConscienceConfig {
            namespace: "TESTNS".into(),
            persistence_path: Some(path),
            ..Default::default()
        };
        Self::spawn(cfg).await
    }

    pub fn client(&self) -> ConscienceClient {
        ConscienceClient::new(SdkConfig {
            daemon_endpoint: self.endpoint.clone(),
            request_timeout_ms: 5_000,
        })
    }

    pub fn shutdown(self) {
        self.server.abort();
    }
}

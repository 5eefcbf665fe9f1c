#![forbid(unsafe_code)]

//! JSON-line RPC endpoint for the registry.
//!
//! One request per line, one line per response. A `subscribe_events` request
//! keeps the connection open and streams matching events as further JSON
//! lines. Services on other hosts register over plain TCP; privileged
//! operations require the auth token (env or cookie file).

use std::{path::PathBuf, sync::Arc, time::Instant};

use conscience_core::{ConscienceConfig, Score, ServiceAddr, ServiceType};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::config_manager::{ConfigManager, ConfigResponse, VersionSummary};
use crate::event_system::{Event, EventSystem};
use crate::metrics::MetricsCollector;
use crate::persistence;
use crate::registry::{Registration, Registry};

const INITIAL_READ_TIMEOUT_MS: u64 = 2000;
const MAX_LINE_BYTES: usize = 64 * 1024;

pub struct DaemonState {
    pub start_time: Instant,
    pub namespace: String,
    pub cfg: ConfigManager,
    pub registry: Arc<Registry>,
    pub events: EventSystem,
    pub metrics: Arc<MetricsCollector>,
    pub token: Option<String>, // Optional static token for privileged ops
}

/// Wire up a complete daemon state from an initial configuration.
pub fn build_state(
    initial: ConscienceConfig,
    config_path: Option<PathBuf>,
    token: Option<String>,
) -> conscience_core::Result<Arc<DaemonState>> {
    let policies = initial.compile_policies()?;
    let events = EventSystem::new(1024);
    let registry = Arc::new(Registry::new(policies, events.sender()));
    let namespace = initial.namespace.clone();
    let cfg = ConfigManager::new(initial, config_path);
    Ok(Arc::new(DaemonState {
        start_time: Instant::now(),
        namespace,
        cfg,
        registry,
        events,
        metrics: Arc::new(MetricsCollector::new()),
        token,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    GetInfo,
    Health,
    RegisterService(Registration),
    ListServices {
        #[serde(default)]
        srv_type: Option<ServiceType>,
        #[serde(default)]
        include_down: bool,
    },
    ListTypes,
    LockScore { srv_type: ServiceType, addr: ServiceAddr, score: u32 },
    UnlockScore { srv_type: ServiceType, addr: ServiceAddr },
    FlushServices {
        srv_type: ServiceType,
        #[serde(default)]
        keep_locked: bool,
    },
    WriteStatus,
    ReloadConfig,
    UpdateConfig { settings: serde_json::Map<String, serde_json::Value> },
    ListConfigVersions,
    RollbackConfig { version: u64 },
    CreateConfigSnapshot { description: Option<String> },
    SubscribeEvents { types: Option<Vec<String>> },
}

/// RPC request envelope carrying optional request id and auth token.
#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    auth: Option<String>,
    #[serde(flatten)]
    req: Request,
}

#[derive(Debug, Serialize)]
struct Info {
    namespace: String,
    version: String,
    uptime_sec: u32,
    services: usize,
    types: usize,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    healthy: bool,
    timestamp: chrono::DateTime<chrono::Utc>,
    components: std::collections::HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(bound(serialize = "T: Serialize"))]
pub struct Response<T> {
    pub ok: bool,
    pub code: u16, // 0 = OK, non-zero = error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> Response<T> {
    fn ok_with_id(id: Option<String>, data: T) -> Self {
        Self { ok: true, code: 0, id, data: Some(data), error: None }
    }
    fn err_with_id(id: Option<String>, code: u16, msg: impl Into<String>) -> Self {
        Self { ok: false, code, id, data: None, error: Some(msg.into()) }
    }
}

fn to_json_response(
    id: Option<String>,
    value: Result<impl Serialize, conscience_core::Error>,
) -> Response<serde_json::Value> {
    match value {
        Ok(v) => match serde_json::to_value(v) {
            Ok(v) => Response::ok_with_id(id, v),
            Err(e) => Response::err_with_id(id, 500, e.to_string()),
        },
        Err(e) => Response::err_with_id(id, 400, e.to_string()),
    }
}

/// Accept loop; one task per client connection.
pub async fn serve(listener: TcpListener, state: Arc<DaemonState>) -> std::io::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let st = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, st).await {
                        warn!("client {peer} error: {e}");
                    }
                });
            }
            Err(e) => warn!("accept error: {e}"),
        }
    }
}

pub async fn handle_client(mut stream: TcpStream, state: Arc<DaemonState>) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(1024);
    if read_one_line_with_timeout(&mut stream, &mut buf, INITIAL_READ_TIMEOUT_MS)
        .await
        .is_err()
    {
        return Ok(()); // drop slow/idle client silently
    }
    let req = std::str::from_utf8(&buf).unwrap_or("");
    let (resp, stream_back, filter) = process_request(req, &state).await;
    let resp_id = resp.id.clone();
    let json = serde_json::to_vec(&resp).unwrap_or_else(|e| {
        serde_json::to_vec(&Response::<serde_json::Value>::err_with_id(
            resp_id,
            500,
            e.to_string(),
        ))
        .unwrap_or_default()
    });
    stream.write_all(&json).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;
    // If the client subscribed, stream events until it disconnects
    if let Some(mut rx) = stream_back {
        while let Ok(ev) = rx.recv().await {
            if !state.events.matches(&ev, &filter) {
                continue;
            }
            let line = match serde_json::to_vec(&ev) {
                Ok(v) => v,
                Err(e) => {
                    warn!("failed to serialize event: {e}");
                    continue;
                }
            };
            if stream.write_all(&line).await.is_err() {
                break;
            }
            if stream.write_all(b"\n").await.is_err() {
                break;
            }
            if stream.flush().await.is_err() {
                break;
            }
        }
    }
    Ok(())
}

pub async fn process_request(
    req_line: &str,
    state: &DaemonState,
) -> (
    Response<serde_json::Value>,
    Option<tokio::sync::broadcast::Receiver<Event>>,
    Option<Vec<String>>,
) {
    let parsed = serde_json::from_str::<RpcRequest>(req_line);
    let RpcRequest { id, auth, req } = match parsed {
        Ok(r) => r,
        Err(e) => {
            return (
                Response::err_with_id(None, 400, format!("invalid request: {e}")),
                None,
                None,
            )
        }
    };

    match req {
        Request::GetInfo => {
            let types = state.registry.types().await;
            let services = types.values().sum();
            let info = Info {
                namespace: state.namespace.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_sec: state.start_time.elapsed().as_secs() as u32,
                services,
                types: types.len(),
            };
            (to_json_response(id, Ok(info)), None, None)
        }
        Request::Health => {
            let mut components = std::collections::HashMap::new();
            components.insert("registry".to_string(), "ok".to_string());
            components.insert("config".to_string(), "ok".to_string());
            let persistence_state = if state.cfg.get_config().await.persistence_path.is_some() {
                "ok"
            } else {
                "disabled"
            };
            components.insert("persistence".to_string(), persistence_state.to_string());
            let status = HealthStatus {
                healthy: true,
                timestamp: chrono::Utc::now(),
                components,
            };
            (to_json_response(id, Ok(status)), None, None)
        }
        Request::RegisterService(reg) => {
            let res = state.registry.register(reg).await;
            (to_json_response(id, res), None, None)
        }
        Request::ListServices { srv_type, include_down } => {
            let list = match srv_type {
                Some(ty) => state.registry.list(&ty, include_down).await,
                None => state.registry.list_all(include_down).await,
            };
            (to_json_response(id, Ok(list)), None, None)
        }
        Request::ListTypes => {
            let types = state.registry.types().await;
            (to_json_response(id, Ok(types)), None, None)
        }
        Request::LockScore { srv_type, addr, score } => {
            if !is_authorized(state, auth.as_deref()) {
                return (Response::err_with_id(id, 401, "unauthorized"), None, None);
            }
            // Out-of-range lock values are clamped, not rejected.
            let res = state.registry.lock(&srv_type, addr, Score::clamped(score as i64)).await;
            (to_json_response(id, res), None, None)
        }
        Request::UnlockScore { srv_type, addr } => {
            if !is_authorized(state, auth.as_deref()) {
                return (Response::err_with_id(id, 401, "unauthorized"), None, None);
            }
            let res = state.registry.unlock(&srv_type, addr).await;
            (to_json_response(id, res), None, None)
        }
        Request::FlushServices { srv_type, keep_locked } => {
            if !is_authorized(state, auth.as_deref()) {
                return (Response::err_with_id(id, 401, "unauthorized"), None, None);
            }
            let removed = state.registry.flush(&srv_type, keep_locked).await;
            (
                Response::ok_with_id(id, serde_json::json!({ "removed": removed })),
                None,
                None,
            )
        }
        Request::WriteStatus => {
            if !is_authorized(state, auth.as_deref()) {
                return (Response::err_with_id(id, 401, "unauthorized"), None, None);
            }
            let Some(path) = state.cfg.get_config().await.persistence_path else {
                return (
                    Response::err_with_id(id, 400, "persistence disabled: no persistence_path"),
                    None,
                    None,
                );
            };
            match persistence::write_status(&state.registry, &state.namespace, &path).await {
                Ok(n) => {
                    state.metrics.record_write(n);
                    let _ = state.events.sender().send(Event::persistence(format!("written {n}")));
                    (
                        Response::ok_with_id(
                            id,
                            serde_json::json!({ "services": n, "path": path }),
                        ),
                        None,
                        None,
                    )
                }
                Err(e) => {
                    state.metrics.record_write_error();
                    (Response::err_with_id(id, 500, e.to_string()), None, None)
                }
            }
        }
        Request::ReloadConfig => {
            if !is_authorized(state, auth.as_deref()) {
                return (Response::err_with_id(id, 401, "unauthorized"), None, None);
            }
            let res = state.cfg.reload_from_file().await.unwrap_or_else(|e| ConfigResponse {
                success: false,
                message: e.to_string(),
                validation_errors: vec![],
            });
            if res.success {
                // Reload re-arms the score policies too.
                match state.cfg.get_config().await.compile_policies() {
                    Ok(policies) => state.registry.set_policies(policies).await,
                    Err(e) => warn!("policies not replaced after reload: {e}"),
                }
                let _ = state.events.sender().send(Event::system("config_reloaded"));
            }
            (to_json_response(id, Ok(res)), None, None)
        }
        Request::UpdateConfig { settings } => {
            if !is_authorized(state, auth.as_deref()) {
                return (Response::err_with_id(id, 401, "unauthorized"), None, None);
            }
            let res = state.cfg.update_config(settings).await.unwrap_or_else(|e| ConfigResponse {
                success: false,
                message: e.to_string(),
                validation_errors: vec![],
            });
            if res.success {
                let _ = state.events.sender().send(Event::system("config_updated"));
            }
            (to_json_response(id, Ok(res)), None, None)
        }
        Request::ListConfigVersions => {
            if !is_authorized(state, auth.as_deref()) {
                return (Response::err_with_id(id, 401, "unauthorized"), None, None);
            }
            let list: Vec<VersionSummary> = state.cfg.list_versions().await;
            (to_json_response(id, Ok(list)), None, None)
        }
        Request::RollbackConfig { version } => {
            if !is_authorized(state, auth.as_deref()) {
                return (Response::err_with_id(id, 401, "unauthorized"), None, None);
            }
            let res = state.cfg.rollback(version).await.unwrap_or_else(|e| ConfigResponse {
                success: false,
                message: e.to_string(),
                validation_errors: vec![],
            });
            if res.success {
                let _ = state
                    .events
                    .sender()
                    .send(Event::system(format!("config_rolled_back:{version}")));
            }
            (to_json_response(id, Ok(res)), None, None)
        }
        Request::CreateConfigSnapshot { description } => {
            if !is_authorized(state, auth.as_deref()) {
                return (Response::err_with_id(id, 401, "unauthorized"), None, None);
            }
            match state.cfg.snapshot(description.as_deref().unwrap_or("manual_snapshot")).await {
                Ok(ver) => (
                    Response::ok_with_id(id, serde_json::json!({ "version": ver })),
                    None,
                    None,
                ),
                Err(e) => (Response::err_with_id(id, 500, e.to_string()), None, None),
            }
        }
        Request::SubscribeEvents { types } => {
            if !is_authorized(state, auth.as_deref()) {
                return (Response::err_with_id(id, 401, "unauthorized"), None, None);
            }
            let rx = state.events.subscribe();
            (
                Response::ok_with_id(id, serde_json::json!({ "subscribed": true })),
                Some(rx),
                types,
            )
        }
    }
}

pub fn is_authorized(state: &DaemonState, auth: Option<&str>) -> bool {
    // Strict auth mode: if CONSCIENCE_STRICT_AUTH=1, require token to be set and provided
    let strict = std::env::var("CONSCIENCE_STRICT_AUTH")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    // Treat empty or whitespace-only token as not set (disabled auth)
    let effective = state.token.as_deref().map(|s| s.trim()).filter(|s| !s.is_empty());

    let Some(expected) = effective else {
        if strict {
            warn!("authorization failed in strict mode: token not configured");
            return false;
        }
        // if no token is set, allow all (development default)
        // Emit a one-time startup warning to make the posture explicit
        static ONCE: std::sync::Once = std::sync::Once::new();
        ONCE.call_once(|| {
            warn!("daemon started without auth token; CONSCIENCE_STRICT_AUTH=1 will enforce token")
        });
        return true;
    };

    match auth {
        Some(provided) => {
            let ok = provided == expected;
            if !ok {
                warn!("authorization failed: wrong token");
            }
            ok
        }
        None => {
            warn!("authorization failed: missing token");
            false
        }
    }
}

pub fn ensure_token_from_env_or_cookie() -> Option<String> {
    // 1) Environment variable takes precedence (non-empty)
    if let Ok(t) = std::env::var("CONSCIENCE_TOKEN") {
        let tt = t.trim().to_string();
        if !tt.is_empty() {
            return Some(tt);
        }
    }

    // 2) Determine cookie path: explicit env or default per-user path
    let cookie_path = if let Ok(p) = std::env::var("CONSCIENCE_COOKIE") {
        if !p.trim().is_empty() { PathBuf::from(p) } else { default_cookie_path() }
    } else {
        default_cookie_path()
    };

    // 3) If cookie exists and non-empty, read it
    if let Ok(s) = std::fs::read_to_string(&cookie_path) {
        let tok = s.trim().to_string();
        if !tok.is_empty() {
            return Some(tok);
        }
    }

    // 4) Otherwise, auto-generate a cookie
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let tok = hex::encode(bytes);
    if let Some(parent) = cookie_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("failed to create cookie dir: {e}");
            return None;
        }
    }
    if let Err(e) = std::fs::write(&cookie_path, &tok) {
        warn!("failed to write cookie file {}: {e}", cookie_path.display());
        return None;
    }
    // Best-effort permission tightening (Unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(&cookie_path) {
            let mut perm = meta.permissions();
            perm.set_mode(0o600);
            let _ = std::fs::set_permissions(&cookie_path, perm);
        }
    }
    info!("generated control auth cookie at {}", cookie_path.display());
    Some(tok)
}

pub fn default_cookie_path() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".conscience").join("control.authcookie");
    }
    PathBuf::from("control.authcookie")
}

// Minimal 1-line reader with timeout and CRLF handling (mirrors SDK behavior)
pub async fn read_one_line_with_timeout<R: AsyncRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    timeout_ms: u64,
) -> std::io::Result<()> {
    use tokio::time::{timeout, Duration, Instant};
    let deadline = Duration::from_millis(timeout_ms);
    let start = Instant::now();
    out.clear();
    let mut tmp = [0u8; 256];
    loop {
        let remain = deadline.saturating_sub(start.elapsed());
        if remain.is_zero() {
            break;
        }
        let n = match timeout(remain, reader.read(&mut tmp)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => break,
        };
        if n == 0 {
            break;
        }
        out.extend_from_slice(&tmp[..n]);
        if out.contains(&b'\n') {
            break;
        }
        if out.len() > MAX_LINE_BYTES {
            break;
        }
    }
    if let Some(pos) = memchr::memchr(b'\n', out) {
        out.truncate(pos);
    }
    if out.last().copied() == Some(b'\r') {
        out.pop();
    }
    Ok(())
}

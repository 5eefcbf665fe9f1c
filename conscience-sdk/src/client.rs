#![forbid(unsafe_code)]

use crate::{
    config::SdkConfig,
    error::{Error, Result},
    events::Event,
    models::{ConfigResponse, Registration, ServiceView},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration, Instant};

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    GetInfo,
    Health,
    RegisterService(&'a Registration),
    ListServices {
        #[serde(skip_serializing_if = "Option::is_none")]
        srv_type: Option<&'a str>,
        include_down: bool,
    },
    ListTypes,
    LockScore { srv_type: &'a str, addr: &'a str, score: u32 },
    UnlockScore { srv_type: &'a str, addr: &'a str },
    FlushServices { srv_type: &'a str, keep_locked: bool },
    WriteStatus,
    ReloadConfig,
    UpdateConfig { settings: &'a serde_json::Map<String, serde_json::Value> },
    ListConfigVersions,
    RollbackConfig { version: u64 },
    CreateConfigSnapshot { description: Option<String> },
    SubscribeEvents { types: Option<Vec<String>> },
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<&'a str>,
    #[serde(flatten)]
    req: Request<'a>,
}

#[derive(Debug, Deserialize)]
struct RpcResponseValue {
    ok: bool,
    code: u16,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

pub struct ConscienceClient {
    cfg: SdkConfig,
    auth_token: Option<String>,
}

impl ConscienceClient {
    pub fn new(cfg: SdkConfig) -> Self {
        Self { cfg, auth_token: None }
    }

    /// Set an auth token; whitespace-only tokens are treated as absent.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let t = token.into();
        let t = t.trim();
        self.auth_token = if t.is_empty() { None } else { Some(t.to_string()) };
        self
    }

    /// Try to auto-discover an auth token from env/cookie and set it.
    pub async fn with_auto_token(mut self) -> Self {
        self.auth_token = auto_discover_token().await;
        self
    }

    pub async fn get_info(&self) -> Result<serde_json::Value> {
        self.rpc_json(&self.envelope(Request::GetInfo)).await
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        self.rpc_json(&self.envelope(Request::Health)).await
    }

    pub async fn register_service(&self, reg: &Registration) -> Result<ServiceView> {
        self.rpc_json(&self.envelope(Request::RegisterService(reg))).await
    }

    pub async fn list_services(
        &self,
        srv_type: Option<&str>,
        include_down: bool,
    ) -> Result<Vec<ServiceView>> {
        self.rpc_json(&self.envelope(Request::ListServices { srv_type, include_down }))
            .await
    }

    pub async fn list_types(&self) -> Result<BTreeMap<String, usize>> {
        self.rpc_json(&self.envelope(Request::ListTypes)).await
    }

    pub async fn lock_score(&self, srv_type: &str, addr: &str, score: u32) -> Result<ServiceView> {
        self.rpc_json(&self.envelope(Request::LockScore { srv_type, addr, score }))
            .await
    }

    pub async fn unlock_score(&self, srv_type: &str, addr: &str) -> Result<ServiceView> {
        self.rpc_json(&self.envelope(Request::UnlockScore { srv_type, addr })).await
    }

    pub async fn flush_services(&self, srv_type: &str, keep_locked: bool) -> Result<serde_json::Value> {
        self.rpc_json(&self.envelope(Request::FlushServices { srv_type, keep_locked }))
            .await
    }

    /// Force an immediate status snapshot on the daemon side.
    pub async fn write_status(&self) -> Result<serde_json::Value> {
        self.rpc_json(&self.envelope(Request::WriteStatus)).await
    }

    pub async fn reload_config(&self) -> Result<ConfigResponse> {
        self.rpc_json(&self.envelope(Request::ReloadConfig)).await
    }

    pub async fn update_config(
        &self,
        settings: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ConfigResponse> {
        self.rpc_json(&self.envelope(Request::UpdateConfig { settings: &settings }))
            .await
    }

    pub async fn list_versions(&self) -> Result<serde_json::Value> {
        self.rpc_json(&self.envelope(Request::ListConfigVersions)).await
    }

    pub async fn rollback_config(&self, version: u64) -> Result<ConfigResponse> {
        self.rpc_json(&self.envelope(Request::RollbackConfig { version })).await
    }

    pub async fn create_config_snapshot(&self, description: Option<String>) -> Result<serde_json::Value> {
        self.rpc_json(&self.envelope(Request::CreateConfigSnapshot { description }))
            .await
    }

    pub async fn subscribe_events(
        &self,
        types: Option<Vec<String>>,
    ) -> Result<broadcast::Receiver<Event>> {
        let mut stream = connect(&self.cfg).await?;
        let req = self.envelope(Request::SubscribeEvents { types });
        let line = serde_json::to_string(&req)? + "\n";
        let t = Duration::from_millis(self.cfg.request_timeout_ms);
        timeout(t, stream.write_all(line.as_bytes())).await.map_err(|_| Error::Timeout)??;
        timeout(t, stream.flush()).await.map_err(|_| Error::Timeout)??;
        // Drop the first response line (the subscription ack)
        let mut buf = Vec::with_capacity(1024);
        read_one_line_with_timeout(&mut stream, &mut buf, self.cfg.request_timeout_ms).await?;
        // Events follow, line-delimited JSON
        let (tx, rx) = broadcast::channel(128);
        tokio::spawn(async move {
            let mut s = stream;
            let mut tmp = Vec::with_capacity(1024);
            loop {
                tmp.clear();
                if let Err(e) = read_one_line(&mut s, &mut tmp).await {
                    tracing::debug!("event stream closed: {e}");
                    let _ = tx.send(Event {
                        ty: "system".into(),
                        detail: format!("events_stream_closed:{e}"),
                    });
                    break;
                }
                if tmp.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<Event>(&tmp) {
                    Ok(ev) => {
                        if tx.send(ev).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let ev = Event {
                            ty: "system".into(),
                            detail: format!("events_decode_error:{e}"),
                        };
                        if tx.send(ev).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    fn envelope<'a>(&'a self, req: Request<'a>) -> RpcRequest<'a> {
        RpcRequest { id: None, auth: self.auth_token.as_deref(), req }
    }

    async fn rpc_json<T: for<'de> Deserialize<'de>>(&self, req: &RpcRequest<'_>) -> Result<T> {
        let mut stream = connect(&self.cfg).await?;
        let line = serde_json::to_string(req)? + "\n";
        let t = Duration::from_millis(self.cfg.request_timeout_ms);
        timeout(t, stream.write_all(line.as_bytes())).await.map_err(|_| Error::Timeout)??;
        timeout(t, stream.flush()).await.map_err(|_| Error::Timeout)??;
        let mut buf = Vec::with_capacity(1024);
        read_one_line_with_timeout(&mut stream, &mut buf, self.cfg.request_timeout_ms).await?;
        let resp: RpcResponseValue = serde_json::from_slice(&buf)?;
        if resp.ok {
            let v = resp.data.ok_or_else(|| Error::protocol("missing data"))?;
            Ok(serde_json::from_value(v)?)
        } else {
            let code = resp.code;
            let id_suffix = resp.id.as_deref().map(|s| format!(" id={s}")).unwrap_or_default();
            let msg = resp.error.unwrap_or_else(|| "unknown error".into());
            Err(Error::protocol(format!("{msg} (code={code}){id_suffix}")))
        }
    }
}

// ---------- token auto-discovery (env -> cookie) ----------

async fn auto_discover_token() -> Option<String> {
    if let Ok(tok) = std::env::var("CONSCIENCE_TOKEN") {
        let t = tok.trim();
        if !t.is_empty() {
            return Some(t.to_string());
        }
    }
    read_cookie_token().await
}

fn default_cookie_path() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".conscience").join("control.authcookie");
    }
    PathBuf::from("control.authcookie")
}

async fn read_cookie_token() -> Option<String> {
    if let Ok(p) = std::env::var("CONSCIENCE_COOKIE") {
        if !p.trim().is_empty() {
            if let Ok(s) = tokio::fs::read_to_string(&p).await {
                let v = s.trim().to_string();
                if !v.is_empty() {
                    return Some(v);
                }
            }
        }
    }
    let p = default_cookie_path();
    if let Ok(s) = tokio::fs::read_to_string(&p).await {
        let v = s.trim().to_string();
        if !v.is_empty() {
            return Some(v);
        }
    }
    None
}

async fn read_one_line<R: AsyncRead + Unpin>(reader: &mut R, out: &mut Vec<u8>) -> Result<()> {
    let mut tmp = [0u8; 256];
    out.clear();
    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            if out.is_empty() {
                return Err(Error::Disconnected);
            }
            break;
        }
        out.extend_from_slice(&tmp[..n]);
        if out.contains(&b'\n') {
            break;
        }
        if out.len() > 64 * 1024 {
            return Err(Error::protocol("response too large"));
        }
    }
    if let Some(pos) = memchr::memchr(b'\n', out) {
        out.truncate(pos);
    }
    // Trim a trailing CR if present (handle CRLF)
    if out.last().copied() == Some(b'\r') {
        out.pop();
    }
    Ok(())
}

async fn read_one_line_with_timeout<R: AsyncRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    timeout_ms: u64,
) -> Result<()> {
    let deadline = Duration::from_millis(timeout_ms);
    let start = Instant::now();
    out.clear();
    let mut buf = [0u8; 256];
    loop {
        let remain = deadline.saturating_sub(start.elapsed());
        if remain.is_zero() {
            return Err(Error::Timeout);
        }
        let n = timeout(remain, reader.read(&mut buf)).await.map_err(|_| Error::Timeout)??;
        if n == 0 {
            if out.is_empty() {
                return Err(Error::Disconnected);
            }
            break;
        }
        out.extend_from_slice(&buf[..n]);
        if out.contains(&b'\n') {
            break;
        }
        if out.len() > 64 * 1024 {
            return Err(Error::protocol("response too large"));
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

async fn connect(cfg: &SdkConfig) -> Result<TcpStream> {
    let stream = TcpStream::connect(&cfg.daemon_endpoint).await?;
    Ok(stream)
}

#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};
use conscience_sdk::{ConscienceClient, Registration, SdkConfig};
use rand::RngCore;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "conscience-cli", version, about = "Conscience registry command line interface")]
struct Cli {
    /// Daemon endpoint (host:port). Default: 127.0.0.1:6000
    #[arg(long)]
    endpoint: Option<String>,
    /// Request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Auth token
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show daemon info
    Info,
    /// Show daemon health counters
    Health,
    /// List registered services, optionally filtered by type
    List {
        /// Service type filter (rawx, meta2, ...)
        #[arg(long)]
        r#type: Option<String>,
        /// Include services whose score has dropped to zero
        #[arg(long)]
        include_down: bool,
    },
    /// List known service types with instance counts
    Types,
    /// Register (or refresh) a service instance
    Register {
        /// Service type (rawx, meta2, ...)
        r#type: String,
        /// Service address (host:port)
        addr: String,
        /// Stat values fed to the score expression. Example: --stat stat.cpu=80
        #[arg(long, value_parser = parse_stat, num_args = 0..)]
        stat: Vec<(String, f64)>,
        /// Free-form tags. Example: --tag tag.vol=/srv/vol1
        #[arg(long, value_parser = parse_tag, num_args = 0..)]
        tag: Vec<(String, String)>,
    },
    /// Lock a service score to a fixed value
    Lock {
        r#type: String,
        addr: String,
        /// Score to pin (0..=100)
        score: u32,
    },
    /// Release a score lock
    Unlock { r#type: String, addr: String },
    /// Remove all services of a type from the registry
    Flush {
        r#type: String,
        /// Keep services whose score is locked
        #[arg(long)]
        keep_locked: bool,
    },
    /// Ask the daemon to persist its status file now
    WriteStatus,
    /// Reload the daemon configuration file
    ReloadConfig,
    /// Update runtime configuration from inline key=value pairs
    UpdateConfig {
        /// Inline key=value pairs (JSON values). Example: log_level="debug"
        #[arg(long, value_parser = parse_kv, num_args = 0..)]
        set: Vec<(String, serde_json::Value)>,
        /// Path to a JSON file with a flat object of settings
        #[arg(long)]
        file: Option<String>,
    },
    /// List retained configuration versions
    Versions,
    /// Rollback configuration to a specific version
    Rollback { version: u64 },
    /// Create a configuration snapshot with an optional description
    Snapshot {
        #[arg(long)]
        description: Option<String>,
    },
    /// Subscribe to daemon events; press Ctrl-C to stop
    Events {
        #[arg(long)]
        types: Vec<String>,
    },
    /// Generate a cookie token file compatible with daemon auth
    GenCookie {
        /// Output path (default: ~/.conscience/control.authcookie)
        #[arg(long)]
        path: Option<String>,
        /// Overwrite if file exists
        #[arg(long)]
        force: bool,
        /// Random token length (bytes), hex-encoded
        #[arg(long, default_value_t = 32)]
        length: usize,
    },
}

fn parse_kv(s: &str) -> Result<(String, serde_json::Value), String> {
    let (k, v) = s.split_once('=').ok_or_else(|| "expected key=value".to_string())?;
    let val = serde_json::from_str::<serde_json::Value>(v)
        .unwrap_or_else(|_| serde_json::Value::String(v.to_string()));
    Ok((k.to_string(), val))
}

fn parse_stat(s: &str) -> Result<(String, f64), String> {
    let (k, v) = s.split_once('=').ok_or_else(|| "expected key=value".to_string())?;
    let val = v.parse::<f64>().map_err(|e| format!("invalid stat value {v:?}: {e}"))?;
    Ok((k.to_string(), val))
}

fn parse_tag(s: &str) -> Result<(String, String), String> {
    let (k, v) = s.split_once('=').ok_or_else(|| "expected key=value".to_string())?;
    Ok((k.to_string(), v.to_string()))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Defaults, then env/config auto-discovery, then explicit CLI overrides.
    let (mut cfg, mut token) = auto_discover().await;
    if let Some(ep) = cli.endpoint {
        cfg.daemon_endpoint = ep;
    }
    if let Some(t) = cli.timeout_ms {
        cfg.request_timeout_ms = t;
    }
    if let Some(tok) = cli.token {
        token = Some(tok);
    }
    let mut client = ConscienceClient::new(cfg);
    if let Some(tok) = token {
        client = client.with_token(tok);
    }

    match cli.command {
        Commands::Info => {
            let v = client.get_info().await;
            print_result(v);
            Ok(())
        }
        Commands::Health => {
            let v = client.health().await;
            print_result(v);
            Ok(())
        }
        Commands::List { r#type, include_down } => {
            let v = client.list_services(r#type.as_deref(), include_down).await;
            print_result(v.and_then(|list| Ok(serde_json::to_value(list)?)));
            Ok(())
        }
        Commands::Types => {
            let v = client.list_types().await;
            print_result(v.and_then(|m| Ok(serde_json::to_value(m)?)));
            Ok(())
        }
        Commands::Register { r#type, addr, stat, tag } => {
            let reg = Registration {
                srv_type: r#type.parse().map_err(|e| anyhow::anyhow!("{e}"))?,
                addr: addr.parse().map_err(|e| anyhow::anyhow!("{e}"))?,
                stats: stat.into_iter().collect::<BTreeMap<_, _>>(),
                tags: tag.into_iter().collect::<BTreeMap<_, _>>(),
            };
            let v = client.register_service(&reg).await;
            print_result(v.and_then(|sv| Ok(serde_json::to_value(sv)?)));
            Ok(())
        }
        Commands::Lock { r#type, addr, score } => {
            let v = client.lock_score(&r#type, &addr, score).await;
            print_result(v.and_then(|sv| Ok(serde_json::to_value(sv)?)));
            Ok(())
        }
        Commands::Unlock { r#type, addr } => {
            let v = client.unlock_score(&r#type, &addr).await;
            print_result(v.and_then(|sv| Ok(serde_json::to_value(sv)?)));
            Ok(())
        }
        Commands::Flush { r#type, keep_locked } => {
            let v = client.flush_services(&r#type, keep_locked).await;
            print_result(v);
            Ok(())
        }
        Commands::WriteStatus => {
            let v = client.write_status().await;
            print_result(v);
            Ok(())
        }
        Commands::ReloadConfig => {
            let v = client.reload_config().await;
            print_result(v.and_then(|r| Ok(serde_json::to_value(r)?)));
            Ok(())
        }
        Commands::UpdateConfig { set, file } => {
            let mut map = serde_json::Map::new();
            for (k, v) in set {
                map.insert(k, v);
            }
            if let Some(path) = file {
                match tokio::fs::read_to_string(path).await {
                    Ok(s) => match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&s) {
                        Ok(obj) => {
                            for (k, v) in obj {
                                map.insert(k, v);
                            }
                        }
                        Err(e) => {
                            eprintln!("invalid JSON file: {e}");
                            std::process::exit(2);
                        }
                    },
                    Err(e) => {
                        eprintln!("failed to read file: {e}");
                        std::process::exit(2);
                    }
                }
            }
            let v = client.update_config(map).await;
            print_result(v.and_then(|r| Ok(serde_json::to_value(r)?)));
            Ok(())
        }
        Commands::Versions => {
            let v = client.list_versions().await;
            print_result(v);
            Ok(())
        }
        Commands::Rollback { version } => {
            let v = client.rollback_config(version).await;
            print_result(v.and_then(|r| Ok(serde_json::to_value(r)?)));
            Ok(())
        }
        Commands::Snapshot { description } => {
            let v = client.create_config_snapshot(description).await;
            print_result(v);
            Ok(())
        }
        Commands::Events { types } => {
            match client
                .subscribe_events(if types.is_empty() { None } else { Some(types) })
                .await
            {
                Ok(mut rx) => {
                    let (tx_stop, mut rx_stop) = tokio::sync::mpsc::channel::<()>(1);
                    // Best-effort Ctrl-C handler; ignore errors if one is already set.
                    let _ = ctrlc::set_handler(move || {
                        let _ = tx_stop.try_send(());
                    });
                    loop {
                        tokio::select! {
                            _ = rx_stop.recv() => { break; }
                            ev = rx.recv() => {
                                match ev {
                                    Ok(ev) => match serde_json::to_string(&ev) {
                                        Ok(line) => println!("{line}"),
                                        Err(_) => break,
                                    },
                                    Err(_) => break,
                                }
                            }
                        }
                    }
                    Ok(())
                }
                Err(e) => Err(anyhow::anyhow!("subscribe error: {e}")),
            }
        }
        Commands::GenCookie { path, force, length } => {
            let pathbuf = if let Some(p) = path { PathBuf::from(p) } else { default_cookie_path() };
            if pathbuf.exists() && !force {
                eprintln!("refusing to overwrite existing file: {} (use --force)", pathbuf.display());
                std::process::exit(2);
            }
            if length == 0 || length > 1024 {
                anyhow::bail!("invalid length: {length}");
            }
            let mut bytes = vec![0u8; length];
            rand::thread_rng().fill_bytes(&mut bytes);
            let token = hex::encode(bytes);
            if let Some(parent) = pathbuf.parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            tokio::fs::write(&pathbuf, &token).await?;
            #[cfg(unix)]
            {
                use std::fs::{metadata, set_permissions};
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = metadata(&pathbuf) {
                    let mut perm = meta.permissions();
                    perm.set_mode(0o600);
                    let _ = set_permissions(&pathbuf, perm);
                }
            }
            eprintln!("wrote {}", pathbuf.display());
            Ok(())
        }
    }
}

fn print_result(res: Result<serde_json::Value, conscience_sdk::Error>) {
    match res {
        Ok(v) => match serde_json::to_string_pretty(&v) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

// ---------------- helper: auto-discovery -----------------

#[derive(Debug, Default, serde::Deserialize)]
struct CliFileConfig {
    endpoint: Option<String>,
    token: Option<String>,
    timeout_ms: Option<u64>,
}

async fn auto_discover() -> (SdkConfig, Option<String>) {
    let mut cfg = SdkConfig::default();
    let mut token: Option<String> = None;

    // 1) Env vars
    if let Ok(ep) = std::env::var("CONSCIENCE_ENDPOINT") {
        let e = ep.trim();
        if !e.is_empty() {
            cfg.daemon_endpoint = e.to_string();
        }
    }
    if let Ok(t) = std::env::var("CONSCIENCE_REQUEST_TIMEOUT_MS") {
        if let Ok(v) = t.parse::<u64>() {
            cfg.request_timeout_ms = v;
        }
    }
    if let Ok(tok) = std::env::var("CONSCIENCE_TOKEN") {
        if !tok.trim().is_empty() {
            token = Some(tok.trim().to_string());
        }
    }

    // 2) Cookie file, unless env already provided a token
    if token.is_none() {
        token = read_cookie_token().await;
    }

    // 3) Config file (only fills missing)
    if let Some(file_cfg) = load_cli_file_config().await {
        if cfg.daemon_endpoint == SdkConfig::default_endpoint() {
            if let Some(ep) = file_cfg.endpoint {
                cfg.daemon_endpoint = ep;
            }
        }
        if let Some(ms) = file_cfg.timeout_ms {
            cfg.request_timeout_ms = ms;
        }
        if token.is_none() {
            token = file_cfg.token.filter(|s| !s.trim().is_empty());
        }
    }

    (cfg, token)
}

async fn load_cli_file_config() -> Option<CliFileConfig> {
    // Search order: $CONSCIENCE_CLI_CONFIG -> ./conscience.toml -> ~/.config/conscience/conscience.toml
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(p) = std::env::var("CONSCIENCE_CLI_CONFIG") {
        candidates.push(PathBuf::from(p));
    }
    candidates.push(PathBuf::from("conscience.toml"));
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        candidates.push(PathBuf::from(xdg).join("conscience").join("conscience.toml"));
    }
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join(".config").join("conscience").join("conscience.toml"));
    }
    for p in candidates {
        if let Ok(s) = tokio::fs::read_to_string(&p).await {
            #[derive(serde::Deserialize)]
            struct FileRoot {
                cli: Option<CliFileConfig>,
            }
            match toml::from_str::<FileRoot>(&s) {
                Ok(root) => return root.cli,
                Err(e) => {
                    tracing::debug!("ignoring malformed cli config {}: {e}", p.display());
                }
            }
        }
    }
    None
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kv_accepts_json_and_bare_strings() {
        let (k, v) = parse_kv("log_level=\"debug\"").unwrap();
        assert_eq!(k, "log_level");
        assert_eq!(v, serde_json::Value::String("debug".into()));

        let (k, v) = parse_kv("persistence_period_secs=15").unwrap();
        assert_eq!(k, "persistence_period_secs");
        assert_eq!(v, serde_json::json!(15));

        let (_, v) = parse_kv("name=bare").unwrap();
        assert_eq!(v, serde_json::Value::String("bare".into()));

        assert!(parse_kv("no-equals").is_err());
    }

    #[test]
    fn parse_stat_requires_number() {
        let (k, v) = parse_stat("stat.cpu=82.5").unwrap();
        assert_eq!(k, "stat.cpu");
        assert!((v - 82.5).abs() < f64::EPSILON);
        assert!(parse_stat("stat.cpu=high").is_err());
    }

    #[test]
    fn parse_tag_splits_on_first_equals() {
        let (k, v) = parse_tag("tag.vol=/srv/vol=1").unwrap();
        assert_eq!(k, "tag.vol");
        assert_eq!(v, "/srv/vol=1");
    }
}

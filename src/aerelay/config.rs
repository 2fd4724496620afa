use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::aerelay::client::{ClientOptions, CLIENT_MAX_PIPES};
use crate::aerelay::host::{HostOptions, HOST_MAX_PIPES};
use crate::aerelay::protocol::{MAX_NICKNAME_BYTES, MAX_PORTS};
use crate::aerelay::server::ServerOptions;
use crate::aerelay::session::SessionOptions;

const CONFIG_ENV: &str = "AERELAY_CONFIG";
const CONFIG_CANDIDATES: [&str; 3] = ["aerelay.toml", "aerelay.yaml", "aerelay.yml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

/// Picks the config file: flag, then `AERELAY_CONFIG`, then `aerelay.*` in
/// the working directory, then the per-OS default location.
pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join(CONFIG_CANDIDATES[0])));
        }
        return Ok(p.to_path_buf());
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/aerelay/aerelay.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("org", "aerelay", "aerelay")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("aerelay.toml"))
    }
}

/// Writes the commented template when nothing exists at `path`. Returns
/// whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match extension_of(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match extension_of(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported config extension {}", other),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub server: Option<ServerOptions>,
    pub host: Option<HostOptions>,
    pub client: Option<ClientOptions>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    logging: Option<FileLogging>,
    server: Option<FileServer>,
    host: Option<FileHost>,
    client: Option<FileClient>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    listen_addr: Option<String>,
    max_conn: Option<i64>,
    max_conn_per_ip: Option<i64>,
    handshake_timeout_ms: Option<i64>,
    heartbeat_timeout_ms: Option<i64>,
    relay_timeout_ms: Option<i64>,
    can_create_room: Option<bool>,
    can_join_room: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileHost {
    server_addr: String,
    room: String,
    #[serde(default)]
    token: String,
    heartbeat_interval_ms: Option<i64>,
    connect_timeout_ms: Option<i64>,
    #[serde(default)]
    motd: String,
    ports: Vec<u16>,
    local_host: Option<String>,
    #[serde(default)]
    nickname: String,
    max_pipes: Option<i64>,
    #[serde(default)]
    encrypt_pipes: bool,
    dial_timeout_ms: Option<i64>,
    pipe_idle_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_addr: String,
    room: String,
    #[serde(default)]
    token: String,
    heartbeat_interval_ms: Option<i64>,
    connect_timeout_ms: Option<i64>,
    bind_addr: Option<String>,
    #[serde(default)]
    local_ports: Vec<u16>,
    max_pipes: Option<i64>,
    pipe_idle_timeout_ms: Option<i64>,
    #[serde(default)]
    nickname: String,
    #[serde(default)]
    chat: bool,
}

fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) => Duration::from_millis(ms.max(0) as u64),
        None => Duration::from_millis(default_ms),
    }
}

/// Non-positive counts fall back to the default.
fn count(v: Option<i64>, default: usize) -> usize {
    match v {
        Some(n) if n > 0 => n as usize,
        _ => default,
    }
}

fn non_empty(v: Option<String>, default: &str) -> String {
    match v.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => default.to_string(),
    }
}

fn session_options(
    role: &str,
    server_addr: &str,
    room: &str,
    token: String,
    heartbeat_interval_ms: Option<i64>,
    connect_timeout_ms: Option<i64>,
) -> anyhow::Result<SessionOptions> {
    let d = SessionOptions::default();
    let server_addr = server_addr.trim().to_string();
    if server_addr.is_empty() {
        anyhow::bail!("config: {role}.server_addr is required");
    }
    let room = room.trim().to_string();
    if room.is_empty() {
        anyhow::bail!("config: {role}.room is required");
    }
    if room.len() > u8::MAX as usize || token.len() > u8::MAX as usize {
        anyhow::bail!("config: {role}.room and {role}.token must fit in 255 bytes");
    }
    Ok(SessionOptions {
        server_addr,
        room,
        token,
        heartbeat_interval: millis(heartbeat_interval_ms, d.heartbeat_interval.as_millis() as u64),
        connect_timeout: millis(connect_timeout_ms, d.connect_timeout.as_millis() as u64),
    })
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let logging = match fc.logging {
            Some(l) => {
                let d = LoggingConfig::default();
                LoggingConfig {
                    level: non_empty(l.level, &d.level),
                    format: non_empty(l.format, &d.format),
                    output: non_empty(l.output, &d.output),
                    add_source: l.add_source,
                }
            }
            None => LoggingConfig::default(),
        };

        let server = fc.server.map(|s| {
            let d = ServerOptions::default();
            ServerOptions {
                listen_addr: non_empty(s.listen_addr, &d.listen_addr),
                max_conn: count(s.max_conn, d.max_conn),
                max_conn_per_ip: count(s.max_conn_per_ip, d.max_conn_per_ip),
                handshake_timeout: millis(s.handshake_timeout_ms, 3000),
                heartbeat_timeout: millis(s.heartbeat_timeout_ms, 60_000),
                relay_timeout: millis(s.relay_timeout_ms, 3000),
                can_create_room: s.can_create_room.unwrap_or(d.can_create_room),
                can_join_room: s.can_join_room.unwrap_or(d.can_join_room),
            }
        });

        let host = match fc.host {
            Some(h) => {
                if h.ports.is_empty() || h.ports.len() > MAX_PORTS {
                    anyhow::bail!("config: host.ports needs between 1 and {MAX_PORTS} entries");
                }
                if h.motd.len() > u8::MAX as usize {
                    anyhow::bail!("config: host.motd must fit in 255 bytes");
                }
                if h.nickname.len() > MAX_NICKNAME_BYTES {
                    anyhow::bail!("config: host.nickname must fit in {MAX_NICKNAME_BYTES} bytes");
                }
                let d = HostOptions::default();
                Some(HostOptions {
                    session: session_options(
                        "host",
                        &h.server_addr,
                        &h.room,
                        h.token,
                        h.heartbeat_interval_ms,
                        h.connect_timeout_ms,
                    )?,
                    motd: h.motd,
                    ports: h.ports,
                    local_host: non_empty(h.local_host, &d.local_host),
                    nickname: h.nickname,
                    max_pipes: count(h.max_pipes, HOST_MAX_PIPES),
                    encrypt_pipes: h.encrypt_pipes,
                    dial_timeout: millis(h.dial_timeout_ms, 5000),
                    pipe_idle_timeout: millis(h.pipe_idle_timeout_ms, 600_000),
                })
            }
            None => None,
        };

        let client = match fc.client {
            Some(c) => {
                if c.local_ports.len() > MAX_PORTS {
                    anyhow::bail!("config: client.local_ports allows at most {MAX_PORTS} entries");
                }
                if c.nickname.len() > MAX_NICKNAME_BYTES {
                    anyhow::bail!("config: client.nickname must fit in {MAX_NICKNAME_BYTES} bytes");
                }
                let d = ClientOptions::default();
                Some(ClientOptions {
                    session: session_options(
                        "client",
                        &c.server_addr,
                        &c.room,
                        c.token,
                        c.heartbeat_interval_ms,
                        c.connect_timeout_ms,
                    )?,
                    bind_addr: non_empty(c.bind_addr, &d.bind_addr),
                    local_ports: c.local_ports,
                    max_pipes: count(c.max_pipes, CLIENT_MAX_PIPES),
                    pipe_idle_timeout: millis(c.pipe_idle_timeout_ms, 600_000),
                    nickname: c.nickname,
                    chat: c.chat,
                })
            }
            None => None,
        };

        if server.is_none() && host.is_none() && client.is_none() {
            anyhow::bail!("config: nothing to run; add a [server], [host] or [client] section");
        }

        Ok(Config {
            logging,
            server,
            host,
            client,
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# aerelay configuration (auto-generated)
#
# This file was created because no configuration file was found at the
# resolved config path. As written it runs a relay server on port 7000.
#
# Each section starts one role; a process may run several.
# Uncomment [host] on the machine that owns the services and [client] on the
# machines that want to reach them.

[logging]
level = "info"    # debug | info | warn | error (RUST_LOG overrides)
format = "text"   # text | json
output = "stderr" # stderr | stdout | discard | <file path>
add_source = false

[server]
listen_addr = ":7000"
max_conn = 1024
max_conn_per_ip = 128
handshake_timeout_ms = 3000
heartbeat_timeout_ms = 60000
relay_timeout_ms = 3000
can_create_room = true
can_join_room = true

# [host]
# server_addr = "relay.example.org:7000"
# room = "my-room"
# token = ""
# motd = "welcome"
# ports = [25565]
# local_host = "127.0.0.1"
# nickname = ""
# max_pipes = 100
# encrypt_pipes = false
# dial_timeout_ms = 5000
# pipe_idle_timeout_ms = 600000

# [client]
# server_addr = "relay.example.org:7000"
# room = "my-room"
# token = ""
# bind_addr = "127.0.0.1"
# local_ports = []   # empty: same port numbers as the host
# max_pipes = 6
# pipe_idle_timeout_ms = 600000
# nickname = ""
# chat = false        # hear other clients, not just the host
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# aerelay configuration (auto-generated)
#
# This file was created because no configuration file was found at the
# resolved config path. As written it runs a relay server on port 7000.
#
# Each section starts one role; a process may run several.

logging:
  level: "info"
  format: "text"
  output: "stderr"
  add_source: false

server:
  listen_addr: ":7000"
  max_conn: 1024
  max_conn_per_ip: 128
  handshake_timeout_ms: 3000
  heartbeat_timeout_ms: 60000
  relay_timeout_ms: 3000
  can_create_room: true
  can_join_room: true

# host:
#   server_addr: "relay.example.org:7000"
#   room: "my-room"
#   token: ""
#   ports: [25565]
#   encrypt_pipes: false

# client:
#   server_addr: "relay.example.org:7000"
#   room: "my-room"
#   token: ""
#   local_ports: []
"#;

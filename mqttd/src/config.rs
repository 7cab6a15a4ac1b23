//! Server configuration.
//!
//! [`ServerConfig`] is the one validated description of a server: which
//! listeners run where, where TLS material and credentials come from, and a
//! few broker tunables. [`ConfigFile`] is the persisted key/value form read
//! by the command line, converted with [`ConfigFile::to_server_config`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::auth::Ledger;
use crate::broker::DEFAULT_BUFFER_SIZE;
use crate::error::{Error, Result};

/// Environment variable overriding `buffer_size` (KiB).
pub const BUFFER_SIZE_ENV: &str = "MQTT_CLIENT_BUFFER_SIZE";

/// Default grace period for closing listeners.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Default interval for publishing `$SYS` info.
pub const DEFAULT_SYS_INTERVAL: Duration = Duration::from_secs(30);

/// Whether the websocket listener runs over TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsUsage {
    /// Plain websocket.
    Never,
    /// TLS when a TLS configuration is available, plain otherwise.
    #[default]
    IfAvailable,
    /// TLS only; the listener is skipped without a TLS configuration.
    Required,
}

/// Websocket listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketConfig {
    pub addr: String,
    pub tls: TlsUsage,
}

/// Certificate, key and optional client CA files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// When set and valid, clients must present a certificate signed by it.
    pub ca: Option<PathBuf>,
}

/// Where the TLS configuration comes from.
#[derive(Debug, Clone, Default)]
pub enum TlsSource {
    /// No TLS; TLS listeners are skipped.
    #[default]
    None,
    /// Built from PEM files at start.
    Files(TlsFiles),
    /// A ready configuration; no files are read.
    Config(Arc<rustls::ServerConfig>),
}

/// Where credentials and topic ACLs come from.
///
/// Every variant but `Disabled` gets the administrative rules appended.
#[derive(Debug, Clone)]
pub enum AuthSource {
    /// Every connection and topic is allowed.
    Disabled,
    /// Load the auth file; `None` means an empty ledger.
    File(Option<PathBuf>),
    /// A ready ledger; no file is read.
    Ledger(Ledger),
}

impl Default for AuthSource {
    fn default() -> Self {
        AuthSource::File(None)
    }
}

/// Complete server configuration.
///
/// A listener is enabled by giving it an address. Addresses accept the
/// `:port` shorthand for all interfaces.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Plain MQTT listener.
    pub mqtt: Option<String>,
    /// MQTT over TLS listener.
    pub mqtt_tls: Option<String>,
    pub websocket: Option<WebSocketConfig>,
    /// HTTP status listener.
    pub http: Option<String>,
    pub tls: TlsSource,
    pub auth: AuthSource,
    /// Per-connection read buffer in bytes.
    pub buffer_size: usize,
    /// Allow in-process publish and subscribe.
    pub inline_client: bool,
    /// Time open connections get when a listener closes.
    pub shutdown_grace: Duration,
    /// `$SYS` publish interval; `None` disables it.
    pub sys_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mqtt: Some(":1883".to_string()),
            mqtt_tls: None,
            websocket: None,
            http: None,
            tls: TlsSource::None,
            auth: AuthSource::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            inline_client: false,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            sys_interval: Some(DEFAULT_SYS_INTERVAL),
        }
    }
}

impl ServerConfig {
    /// Check every field that can be wrong before anything binds.
    pub fn validate(&self) -> Result<()> {
        for addr in [&self.mqtt, &self.mqtt_tls, &self.http].into_iter().flatten() {
            parse_addr(addr)?;
        }
        if let Some(ws) = &self.websocket {
            parse_addr(&ws.addr)?;
        }
        if self.buffer_size == 0 {
            return Err(Error::InvalidConfig("buffer_size must be positive".to_string()));
        }
        Ok(())
    }
}

/// Parse a listen address, accepting `:port` for all interfaces.
pub fn parse_addr(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|e| Error::InvalidConfig(format!("invalid listen address '{addr}': {e}")))
}

struct Key {
    name: &'static str,
    default: &'static str,
    comment: &'static str,
}

const KEYS: &[Key] = &[
    Key { name: "port_mqtt", default: "1883", comment: "mqtt port" },
    Key { name: "port_tls", default: "1881", comment: "mqtt+tls port" },
    Key { name: "port_web", default: "1880", comment: "http status port" },
    Key { name: "port_ws", default: "", comment: "websocket port, default: 1882" },
    Key { name: "tls_cert_file", default: "cert.ec.pem", comment: "tls cert file path" },
    Key { name: "tls_key_file", default: "cert-key.ec.pem", comment: "tls key file path" },
    Key { name: "tls_ca_file", default: "", comment: "tls client ca file path, enables client certificate verification" },
    Key { name: "buffer_size", default: "4", comment: "client read buffer size in KiB" },
];

/// Older name of `port_tls`.
const LEGACY_TLS_PORT: &str = "mqtt_tls_port";

/// Persisted key/value configuration.
///
/// Stored as YAML with a comment line above each known key. Keys this
/// version does not know are kept as they are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl ConfigFile {
    /// A config file holding only defaults, not yet written.
    pub fn with_defaults(path: impl Into<PathBuf>) -> Self {
        let mut file = Self {
            path: path.into(),
            values: BTreeMap::new(),
        };
        file.fill_defaults();
        file
    }

    /// Load `path`, add missing keys with their defaults, and write the file
    /// back when anything was added.
    pub fn load_or_create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => parse_values(&path, &text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found, creating");
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        let mut file = Self { path, values };
        if file.fill_defaults() {
            file.save()?;
        }
        Ok(file)
    }

    /// Returns true if any key was added.
    fn fill_defaults(&mut self) -> bool {
        let mut added = false;
        for key in KEYS {
            if self.values.contains_key(key.name) {
                continue;
            }
            let value = match key.name {
                "port_tls" => self.values.get(LEGACY_TLS_PORT).cloned(),
                _ => None,
            };
            self.values
                .insert(key.name.to_string(), value.unwrap_or_else(|| key.default.to_string()));
            added = true;
        }
        added
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Write the file.
    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, self.render()?)?;
        debug!(path = %self.path.display(), "config file saved");
        Ok(())
    }

    fn render(&self) -> Result<String> {
        let mut out = String::new();
        for key in KEYS {
            let value = self.get(key.name).unwrap_or(key.default);
            out.push_str(&format!("# {}\n", key.comment));
            out.push_str(&format!("{}: {}\n", key.name, render_value(value)?));
        }
        for (name, value) in &self.values {
            if KEYS.iter().any(|k| k.name == name) {
                continue;
            }
            out.push_str(&format!("{}: {}\n", name, render_value(value)?));
        }
        Ok(out)
    }

    /// Convert to a [`ServerConfig`].
    ///
    /// Ports that are empty, `0` or invalid disable their listener. TLS
    /// files are taken as given and only read when the server starts.
    pub fn to_server_config(&self) -> ServerConfig {
        let mut config = ServerConfig {
            mqtt: self.port("port_mqtt"),
            mqtt_tls: self.port("port_tls"),
            websocket: self.port("port_ws").map(|addr| WebSocketConfig {
                addr,
                tls: TlsUsage::IfAvailable,
            }),
            http: self.port("port_web"),
            ..ServerConfig::default()
        };

        let cert = self.get("tls_cert_file").unwrap_or_default().trim();
        let key = self.get("tls_key_file").unwrap_or_default().trim();
        let ca = self.get("tls_ca_file").unwrap_or_default().trim();
        if !cert.is_empty() && !key.is_empty() {
            config.tls = TlsSource::Files(TlsFiles {
                cert: cert.into(),
                key: key.into(),
                ca: (!ca.is_empty()).then(|| ca.into()),
            });
        }

        let env = std::env::var(BUFFER_SIZE_ENV).ok();
        let kib = env.as_deref().or(self.get("buffer_size"));
        config.buffer_size = buffer_size_bytes(kib);
        config
    }

    fn port(&self, key: &str) -> Option<String> {
        let value = self.get(key)?.trim();
        if value.is_empty() || value == "0" {
            return None;
        }
        match value.parse::<u16>() {
            Ok(port) => Some(format!(":{port}")),
            Err(e) => {
                warn!(key, value, error = %e, "invalid port, listener disabled");
                None
            }
        }
    }
}

fn buffer_size_bytes(kib: Option<&str>) -> usize {
    match kib.map(str::trim).filter(|v| !v.is_empty()) {
        None => DEFAULT_BUFFER_SIZE,
        Some(v) => match v.parse::<usize>() {
            Ok(n) if n > 0 => n.saturating_mul(1024),
            _ => {
                warn!(value = v, "invalid buffer_size, using default");
                DEFAULT_BUFFER_SIZE
            }
        },
    }
}

fn parse_values(path: &Path, text: &str) -> Result<BTreeMap<String, String>> {
    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let raw: Option<BTreeMap<String, serde_yaml::Value>> =
        serde_yaml::from_str(text).map_err(|e| Error::ConfigFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    let mut values = BTreeMap::new();
    for (key, value) in raw.unwrap_or_default() {
        let value = match value {
            serde_yaml::Value::Null => String::new(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::String(s) => s,
            other => {
                return Err(Error::ConfigFile {
                    path: path.display().to_string(),
                    message: format!("key '{key}' is not a scalar: {other:?}"),
                });
            }
        };
        values.insert(key, value);
    }
    Ok(values)
}

/// Ports and sizes stay bare; everything else goes through YAML quoting.
fn render_value(value: &str) -> Result<String> {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(value.to_string());
    }
    Ok(serde_yaml::to_string(value)?.trim_end().to_string())
}

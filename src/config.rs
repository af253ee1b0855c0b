//! Configuration management for the host-rewrite-proxy application.
//!
//! Settings are layered: built-in defaults, an optional YAML file, then the
//! process environment (`PROXY_HOSTNAME`, `PATHNAME_REGEX`, ...). The result
//! is validated and compiled once into an immutable [`ProxySettings`]
//! snapshot. Requests take an `Arc` of the current snapshot; a hot reload of
//! the file swaps it for subsequent requests only.

use crate::access::AccessRules;
use crate::error::{ProxyError, Result};
use crate::resolver::HostResolver;
use crate::rewrite::{strip_anchors, HostPatterns};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port to listen on.
    pub listen: String,

    /// Number of worker threads (0 = framework default).
    pub workers: usize,

    /// Upstream connect timeout in seconds.
    pub connect_timeout: u64,

    /// Upstream read timeout in seconds.
    pub read_timeout: u64,

    /// Upstream write timeout in seconds.
    pub write_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            workers: 0,
            connect_timeout: 10,
            read_timeout: 30,
            write_timeout: 30,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,

    /// Output destination: stdout, stderr, or file path.
    pub output: String,

    /// Log format.
    pub format: LogFormat,

    /// Include timestamps in logs.
    pub timestamps: bool,

    /// Include target (module path) in logs.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
            format: LogFormat::Pretty,
            timestamps: true,
            include_target: true,
        }
    }
}

/// Upstream proxying and request gating section.
///
/// Every pattern is optional; an unset pattern imposes no constraint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Upstream base hostname. Without it every request is rejected.
    pub hostname: Option<String>,

    /// Scheme used for upstream requests: `http` or `https`.
    pub protocol: String,

    /// Path filter; also scopes body rewriting.
    pub pathname_regex: Option<String>,

    pub ua_whitelist_regex: Option<String>,
    pub ua_blacklist_regex: Option<String>,
    pub ip_whitelist_regex: Option<String>,
    pub ip_blacklist_regex: Option<String>,
    pub region_whitelist_regex: Option<String>,
    pub region_blacklist_regex: Option<String>,

    /// Rejected requests are redirected here instead of seeing the fallback page.
    pub redirect_url: Option<String>,

    /// Strips `content-security-policy` from responses.
    pub debug: bool,

    /// Header carrying the client IP. Falls back to the peer address.
    pub client_ip_header: String,

    /// Header carrying the client region code.
    pub region_header: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            protocol: "https".to_string(),
            pathname_regex: None,
            ua_whitelist_regex: None,
            ua_blacklist_regex: None,
            ip_whitelist_regex: None,
            ip_blacklist_regex: None,
            region_whitelist_regex: None,
            region_blacklist_regex: None,
            redirect_url: None,
            debug: false,
            client_ip_header: "cf-connecting-ip".to_string(),
            region_header: "cf-ipcountry".to_string(),
        }
    }
}

impl ProxyConfig {
    /// Overlays values from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Overlays values from `lookup`. Empty values count as unset.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let patterns = [
            ("PROXY_HOSTNAME", &mut self.hostname),
            ("PATHNAME_REGEX", &mut self.pathname_regex),
            ("UA_WHITELIST_REGEX", &mut self.ua_whitelist_regex),
            ("UA_BLACKLIST_REGEX", &mut self.ua_blacklist_regex),
            ("IP_WHITELIST_REGEX", &mut self.ip_whitelist_regex),
            ("IP_BLACKLIST_REGEX", &mut self.ip_blacklist_regex),
            ("REGION_WHITELIST_REGEX", &mut self.region_whitelist_regex),
            ("REGION_BLACKLIST_REGEX", &mut self.region_blacklist_regex),
            ("URL302", &mut self.redirect_url),
        ];
        for (key, slot) in patterns {
            if let Some(value) = get(key) {
                debug!(key = key, "Configuration overridden from environment");
                *slot = Some(value);
            }
        }

        if let Some(protocol) = get("PROXY_PROTOCOL") {
            self.protocol = protocol;
        }
        if let Some(flag) = get("DEBUG") {
            self.debug = parse_bool(&flag);
        }
    }

    /// Validates fields that do not need compilation.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.protocol.to_lowercase().as_str(), "http" | "https") {
            return Err(ProxyError::config_validation(format!(
                "Invalid proxy protocol: {}. Must be http or https",
                self.protocol
            )));
        }
        if self.hostname.as_deref().is_some_and(|h| h.trim().is_empty()) {
            return Err(ProxyError::config_validation("Proxy hostname cannot be blank"));
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

/// One entry of the host split table.
///
/// Requests for `host` whose path starts with one of `path_prefixes` go to
/// `alias` instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostSplit {
    /// Configured base hostname the split applies to.
    pub host: String,

    /// Alias host receiving the matching paths.
    pub alias: String,

    /// Literal path prefixes routed to the alias.
    pub path_prefixes: Vec<String>,

    /// User-agent sent to the alias when the client sent none.
    #[serde(default = "default_split_user_agent")]
    pub user_agent: String,

    /// Accept value sent to the alias when the client sent none.
    #[serde(default = "default_split_accept")]
    pub accept: String,
}

fn default_split_user_agent() -> String {
    concat!("host-rewrite-proxy/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_split_accept() -> String {
    "application/vnd.github.v3+json".to_string()
}

impl HostSplit {
    /// Returns the first prefix `path` starts with.
    pub fn matching_prefix(&self, path: &str) -> Option<&str> {
        self.path_prefixes
            .iter()
            .map(String::as_str)
            .find(|prefix| path.starts_with(prefix))
    }

    /// Validates the split entry.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() || self.alias.is_empty() {
            return Err(ProxyError::config_validation(
                "Host split host and alias cannot be empty",
            ));
        }
        if self.host == self.alias {
            return Err(ProxyError::config_validation(format!(
                "Host split alias must differ from host: {}",
                self.host
            )));
        }
        if self.path_prefixes.iter().any(|p| !p.starts_with('/')) {
            return Err(ProxyError::config_validation(format!(
                "Host split prefixes for {} must start with '/'",
                self.host
            )));
        }
        Ok(())
    }
}

fn default_host_splits() -> Vec<HostSplit> {
    let prefixes = [
        "/repos/",
        "/users/",
        "/user/",
        "/orgs/",
        "/search/",
        "/gists/",
        "/rate_limit",
        "/graphql",
        "/emojis",
        "/licenses",
        "/octocat",
        "/zen",
    ];
    vec![HostSplit {
        host: "github.com".to_string(),
        alias: "api.github.com".to_string(),
        path_prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
        user_agent: default_split_user_agent(),
        accept: default_split_accept(),
    }]
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration.
    pub server: ServerConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Upstream and gating configuration.
    pub proxy: ProxyConfig,

    /// Host split table.
    pub host_splits: Vec<HostSplit>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            proxy: ProxyConfig::default(),
            host_splits: default_host_splits(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ProxyError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = fs::read_to_string(path)?;
        let config: AppConfig =
            serde_yaml::from_str(&contents).map_err(|e| ProxyError::config_parse(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server.listen.is_empty() {
            return Err(ProxyError::config_validation(
                "Server listen address cannot be empty",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ProxyError::config_validation(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        self.proxy.validate()?;

        for split in &self.host_splits {
            split.validate()?;
        }

        Ok(())
    }
}

/// Upstream connection timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl From<&ServerConfig> for Timeouts {
    fn from(server: &ServerConfig) -> Self {
        Self {
            connect: Duration::from_secs(server.connect_timeout),
            read: Duration::from_secs(server.read_timeout),
            write: Duration::from_secs(server.write_timeout),
        }
    }
}

/// Immutable, compiled view of the configuration used by request handling.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Upstream base hostname.
    pub hostname: Option<String>,
    /// Whether upstream connections use TLS.
    pub tls: bool,
    /// `PATHNAME_REGEX` with anchors removed, for scoped body rewriting.
    pub pathname_scope: Option<String>,
    /// Rewrite patterns for the upstream host and its split alias.
    pub patterns: HostPatterns,
    pub redirect_url: Option<String>,
    pub debug: bool,
    pub client_ip_header: String,
    pub region_header: String,
    pub rules: AccessRules,
    pub resolver: HostResolver,
    pub timeouts: Timeouts,
}

impl ProxySettings {
    /// Validates `config` and compiles every pattern it carries.
    pub fn compile(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let proxy = &config.proxy;

        let rules = AccessRules::compile(proxy)?;

        let pathname_scope = proxy
            .pathname_regex
            .as_deref()
            .map(|p| strip_anchors(p).to_string());
        let resolver = HostResolver::new(config.host_splits.clone());

        let mut upstream_hosts = Vec::new();
        if let Some(hostname) = proxy.hostname.as_deref() {
            upstream_hosts.push(hostname);
            if let Some(split) = resolver.split_for(hostname) {
                upstream_hosts.push(split.alias.as_str());
            }
        }
        let patterns = HostPatterns::compile(upstream_hosts, pathname_scope.as_deref())?;

        Ok(Self {
            hostname: proxy.hostname.clone(),
            tls: proxy.protocol.eq_ignore_ascii_case("https"),
            pathname_scope,
            patterns,
            redirect_url: proxy.redirect_url.clone(),
            debug: proxy.debug,
            client_ip_header: proxy.client_ip_header.to_lowercase(),
            region_header: proxy.region_header.to_lowercase(),
            rules,
            resolver,
            timeouts: Timeouts::from(&config.server),
        })
    }

    /// Default upstream port for the configured protocol.
    pub fn default_port(&self) -> u16 {
        if self.tls {
            443
        } else {
            80
        }
    }
}

/// Shared handle to the current settings snapshot.
pub type SharedSettings = Arc<RwLock<Arc<ProxySettings>>>;

/// Takes the current snapshot out of a shared handle.
pub fn snapshot(shared: &SharedSettings) -> Arc<ProxySettings> {
    shared
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Loads file + environment configuration.
fn load_layers(path: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    config.proxy.apply_env();
    Ok(config)
}

/// Thread-safe configuration holder with hot-reload support.
#[derive(Clone)]
pub struct ConfigManager {
    /// Configuration as loaded, before compilation.
    config: Arc<RwLock<AppConfig>>,

    /// Compiled snapshot shared with the proxy service.
    settings: SharedSettings,

    /// Path to the configuration file, if any.
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Creates a new ConfigManager and loads the initial configuration.
    pub fn new(path: Option<&Path>) -> Result<Self> {
        let config = load_layers(path)?;
        Self::from_config(config, path.map(Path::to_path_buf))
    }

    /// Creates a manager from an already assembled configuration.
    pub fn from_config(config: AppConfig, config_path: Option<PathBuf>) -> Result<Self> {
        let settings = ProxySettings::compile(&config)?;
        if settings.hostname.is_none() {
            warn!("PROXY_HOSTNAME is not set; every request will be rejected");
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            settings: Arc::new(RwLock::new(Arc::new(settings))),
            config_path,
        })
    }

    /// Gets a clone of the current configuration.
    pub fn get(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Gets the shared settings handle.
    pub fn settings(&self) -> SharedSettings {
        self.settings.clone()
    }

    /// Gets the current compiled snapshot.
    pub fn snapshot(&self) -> Arc<ProxySettings> {
        snapshot(&self.settings)
    }

    /// Reloads the configuration from disk and environment.
    ///
    /// On failure the previous snapshot stays active.
    pub fn reload(&self) -> Result<()> {
        info!("Reloading configuration from {:?}", self.config_path);

        let compiled = load_layers(self.config_path.as_deref())
            .and_then(|config| ProxySettings::compile(&config).map(|s| (config, s)));

        match compiled {
            Ok((new_config, new_settings)) => {
                *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
                *self.settings.write().unwrap_or_else(PoisonError::into_inner) =
                    Arc::new(new_settings);
                info!("Configuration reloaded successfully");
                Ok(())
            }
            Err(e) => {
                error!("Failed to reload configuration: {}", e);
                Err(e)
            }
        }
    }

    /// Starts watching the configuration file for changes.
    ///
    /// Does nothing when the manager was built without a file.
    pub fn start_watcher(&self) -> Result<()> {
        let Some(config_path) = self.config_path.clone() else {
            debug!("No configuration file to watch");
            return Ok(());
        };
        let manager = self.clone();

        std::thread::Builder::new()
            .name("config-watcher".to_string())
            .spawn(move || {
                let (notify_tx, notify_rx) = std::sync::mpsc::channel();

                let mut watcher = match RecommendedWatcher::new(
                    move |res: std::result::Result<Event, notify::Error>| {
                        if let Ok(event) = res {
                            if event.kind.is_modify() || event.kind.is_create() {
                                let _ = notify_tx.send(());
                            }
                        }
                    },
                    NotifyConfig::default(),
                ) {
                    Ok(w) => w,
                    Err(e) => {
                        error!("Failed to create file watcher: {}", e);
                        return;
                    }
                };

                // Watch the parent directory to catch file replacements
                let watch_path = config_path.parent().unwrap_or(&config_path);
                if let Err(e) = watcher.watch(watch_path, RecursiveMode::NonRecursive) {
                    error!("Failed to watch config directory: {}", e);
                    return;
                }

                info!("Started watching configuration file for changes");

                let mut last_reload = std::time::Instant::now();
                let debounce_duration = Duration::from_millis(500);

                while notify_rx.recv().is_ok() {
                    let now = std::time::Instant::now();
                    if now.duration_since(last_reload) >= debounce_duration {
                        if manager.reload().is_ok() {
                            last_reload = now;
                        }
                    } else {
                        debug!("Debouncing config reload");
                    }
                }
                warn!("Config watcher channel closed");
            })?;

        Ok(())
    }
}

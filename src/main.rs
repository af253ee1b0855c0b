//! # Host Rewrite Proxy
//!
//! A reverse proxy that serves a single upstream site under its own hostname,
//! rewriting every mention of the upstream hostname in headers and textual
//! bodies back to the hostname the client used.
//!
//! ## Usage
//!
//! ```bash
//! # Upstream from the environment only
//! PROXY_HOSTNAME=github.com host-rewrite-proxy
//!
//! # Run with custom config
//! host-rewrite-proxy -c /path/to/config.yaml
//!
//! # Increase verbosity
//! host-rewrite-proxy -vvvv  # trace level, including dependencies
//! ```
//!
//! ## Configuration
//!
//! Defaults, then the YAML file, then environment variables, then CLI flags.
//! See `config.yaml` for all available options.

use clap::Parser;
use host_rewrite_proxy::config::{AppConfig, ConfigManager};
use host_rewrite_proxy::error::ProxyError;
use host_rewrite_proxy::logging;
use host_rewrite_proxy::proxy::HostRewriteProxy;
use pingora_core::server::configuration::ServerConf;
use pingora_core::server::Server;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Searched in order when `--config` is not given.
const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "./config.yaml",
    "./config.yml",
    "/etc/host-rewrite-proxy/config.yaml",
];

/// Reverse proxy that rewrites upstream hostnames to the client-facing one.
#[derive(Parser, Debug)]
#[command(name = "host-rewrite-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace, -vvvv trace+deps)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    /// Converts verbosity count to log level string
    fn log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }
        match self.verbose {
            0 => None,
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        }
    }

    /// Whether to include verbose dependency logging
    fn trace_deps(&self) -> bool {
        self.verbose >= 4
    }

    /// The explicit config path, or the first default path that exists.
    fn config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(|| {
            DEFAULT_CONFIG_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
        })
    }
}

fn main() {
    let args = Args::parse();
    let config_path = args.config_path();

    let manager = match load_config(config_path.as_deref()) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    let mut config = manager.get();

    let _log_guard =
        match logging::init_logging(&config.logging, args.log_level(), args.trace_deps()) {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Failed to initialize logging: {e}");
                std::process::exit(1);
            }
        };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = ?config_path,
        upstream = ?config.proxy.hostname,
        "Starting host-rewrite-proxy"
    );

    if let Some(ref listen) = args.listen {
        info!(listen = %listen, "Listen address overridden via CLI");
        config.server.listen = listen.clone();
    }

    if let Err(e) = manager.start_watcher() {
        error!("Failed to start config watcher: {}", e);
    }

    run(&config, HostRewriteProxy::new(manager.settings()));
}

/// Loads configuration from `path`, falling back to defaults and the
/// environment when the file is missing.
fn load_config(path: Option<&Path>) -> Result<ConfigManager, ProxyError> {
    match ConfigManager::new(path) {
        Err(ProxyError::ConfigNotFound { path }) => {
            eprintln!("Warning: Config file not found: {path}");
            eprintln!("Using default configuration");
            ConfigManager::new(None)
        }
        other => other,
    }
}

/// Builds the Pingora server and serves until shutdown.
fn run(config: &AppConfig, proxy: HostRewriteProxy) -> ! {
    let mut conf = ServerConf::default();
    if config.server.workers > 0 {
        conf.threads = config.server.workers;
    }

    let mut server = Server::new_with_opt_and_conf(None, conf);
    server.bootstrap();

    let mut service = pingora_proxy::http_proxy_service(&server.configuration, proxy);
    service.add_tcp(&config.server.listen);
    server.add_service(service);

    info!(
        listen = %config.server.listen,
        workers = config.server.workers,
        "Proxy listening"
    );
    server.run_forever()
}

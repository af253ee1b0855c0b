//! # Host Rewrite Proxy Library
//!
//! This crate provides a reverse proxy that serves one upstream site under
//! the hostname the client connected to. Mentions of the upstream hostname
//! in response headers and textual bodies are rewritten back to that
//! hostname, and request headers are rewritten the other way. It's built on
//! the Pingora framework.
//!
//! ## Modules
//!
//! - [`access`]: Request gating by path, user-agent, IP and region
//! - [`config`]: Configuration loading, validation, and hot-reload support
//! - [`context`]: Hostnames involved in rewriting one request
//! - [`error`]: Error types and handling
//! - [`logging`]: Logging setup and configuration
//! - [`proxy`]: The main Pingora-based proxy implementation
//! - [`request`]: Outbound request construction
//! - [`resolver`]: Upstream host resolution and host splits
//! - [`response`]: Client response construction and local responses
//! - [`rewrite`]: Whole-word hostname substitution
//!
//! ## Example
//!
//! ```ignore
//! use host_rewrite_proxy::config::ConfigManager;
//! use host_rewrite_proxy::proxy::HostRewriteProxy;
//!
//! let manager = ConfigManager::new(Some(Path::new("config.yaml")))?;
//! manager.start_watcher()?;
//!
//! let service = HostRewriteProxy::new(manager.settings());
//! ```
//!
//! ## Request Lifecycle
//!
//! 1. **Filtering**: the request is checked against every configured filter;
//!    rejected requests get the fallback page or a redirect
//! 2. **Resolving**: the upstream host is chosen, honouring host splits
//! 3. **Building**: request headers are rewritten to the upstream host
//! 4. **Responding**: response headers and textual bodies are rewritten back

pub mod access;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod request;
pub mod resolver;
pub mod response;
pub mod rewrite;

pub use access::{AccessRules, Decision, Rejection, RequestInfo};
pub use config::{AppConfig, ConfigManager, HostSplit, ProxySettings};
pub use context::RewriteContext;
pub use error::{ProxyError, Result};
pub use proxy::HostRewriteProxy;
pub use resolver::{HostResolver, Resolution};
pub use rewrite::{HostPattern, HostPatterns, HostRewriter};

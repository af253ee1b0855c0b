//! Pingora-based proxy implementation.
//!
//! Drives each request through gating, host resolution, outbound request
//! rewriting and response rewriting:
//!
//! ```text
//! Start → Filtering → Rejected
//!                   → Resolving → Building → Fetching → Responding → Done
//! any stage → Failed (500)
//! ```
//!
//! Each request works against one settings snapshot taken when its context
//! is created; nothing is shared between requests.

use crate::access::{Decision, RequestInfo};
use crate::config::{self, ProxySettings, SharedSettings};
use crate::context::RewriteContext;
use crate::request::build_upstream_request;
use crate::resolver::{dns_resolve, hostname_only, parse_host_port};
use crate::response::{
    build_client_response, fallback_response, internal_error_response, redirect_response,
    BodyRewriter,
};
use async_trait::async_trait;
use bytes::Bytes;
use http::header;
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_core::ErrorSource;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{FailToProxy, ProxyHttp, Session};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Where a request currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    Start,
    Filtering,
    Rejected,
    Resolving,
    Building,
    Fetching,
    Responding,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Filtering => "filtering",
            Self::Rejected => "rejected",
            Self::Resolving => "resolving",
            Self::Building => "building",
            Self::Fetching => "fetching",
            Self::Responding => "responding",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context maintained across the request lifecycle.
pub struct ProxyContext {
    /// Settings snapshot for this request.
    pub settings: Arc<ProxySettings>,

    /// Current lifecycle stage.
    pub stage: Stage,

    /// Filter inputs, also used for log records.
    pub request: RequestInfo,

    /// Hostnames for rewriting, set once the request is accepted.
    pub rewrite: Option<RewriteContext>,

    /// Set when the response body is buffered and rewritten.
    pub body_rewriter: Option<BodyRewriter>,

    /// Buffered response body.
    pub body_buffer: Vec<u8>,
}

impl ProxyContext {
    pub fn new(settings: Arc<ProxySettings>) -> Self {
        Self {
            settings,
            stage: Stage::Start,
            request: RequestInfo::default(),
            rewrite: None,
            body_rewriter: None,
            body_buffer: Vec::new(),
        }
    }

    fn rewrite_context(&self) -> Result<&RewriteContext> {
        self.rewrite
            .as_ref()
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "missing rewrite context"))
    }
}

/// Extracts the hostname the client connected to, lower-cased.
pub fn origin_hostname(req: &RequestHeader) -> Option<String> {
    let from_header = req
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(hostname_only)
        .filter(|h| !h.is_empty());

    from_header
        .or_else(|| req.uri.host())
        .map(str::to_ascii_lowercase)
}

/// Collects the filter inputs of a request. Missing values become `""`.
pub fn extract_request_info(
    req: &RequestHeader,
    peer_ip: Option<IpAddr>,
    settings: &ProxySettings,
    origin: &str,
) -> RequestInfo {
    let header_value = |name: &str| {
        req.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let client_ip = header_value(&settings.client_ip_header)
        .or_else(|| peer_ip.map(|ip| ip.to_string()))
        .unwrap_or_default();
    let path_and_query = req
        .uri
        .path_and_query()
        .map_or_else(|| req.uri.path(), |pq| pq.as_str());

    RequestInfo {
        path: req.uri.path().to_string(),
        user_agent: header_value(header::USER_AGENT.as_str()).unwrap_or_default(),
        client_ip,
        region: header_value(&settings.region_header).unwrap_or_default(),
        url: format!("{origin}{path_and_query}"),
    }
}

/// The main proxy service.
pub struct HostRewriteProxy {
    settings: SharedSettings,
}

impl HostRewriteProxy {
    /// Creates a new proxy service over a shared settings handle.
    pub fn new(settings: SharedSettings) -> Self {
        Self { settings }
    }

    /// Answers a rejected request with the redirect or the fallback page.
    async fn reject(session: &mut Session, settings: &ProxySettings) -> Result<()> {
        match &settings.redirect_url {
            Some(location) => {
                let resp = redirect_response(location)?;
                session.write_response_header(Box::new(resp), true).await?;
            }
            None => {
                let (resp, body) = fallback_response()?;
                session.write_response_header(Box::new(resp), false).await?;
                session.write_response_body(Some(body), true).await?;
            }
        }
        Ok(())
    }

    /// Writes the generic 500 unless something already reached the client.
    async fn respond_internal_error(session: &mut Session) {
        if session.response_written().is_some() {
            warn!("Response already started; cannot send error response");
            return;
        }
        let (resp, body) = match internal_error_response() {
            Ok(parts) => parts,
            Err(e) => {
                error!(error = %e, "Failed to build error response");
                return;
            }
        };
        if let Err(e) = session.write_response_header(Box::new(resp), false).await {
            error!(error = %e, "Failed to write error response header");
        } else if let Err(e) = session.write_response_body(Some(body), true).await {
            error!(error = %e, "Failed to write error response body");
        }
    }
}

#[async_trait]
impl ProxyHttp for HostRewriteProxy {
    type CTX = ProxyContext;

    fn new_ctx(&self) -> Self::CTX {
        ProxyContext::new(config::snapshot(&self.settings))
    }

    /// Gating, then host resolution for accepted requests.
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        ctx.stage = Stage::Filtering;
        let settings = ctx.settings.clone();

        let peer_ip = session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .map(|inet| inet.ip());
        let req = session.req_header();
        let origin = origin_hostname(req);
        ctx.request =
            extract_request_info(req, peer_ip, &settings, origin.as_deref().unwrap_or_default());

        if let Decision::Reject(_) = settings.rules.check(&ctx.request) {
            ctx.stage = Stage::Rejected;
            Self::reject(session, &settings).await?;
            return Ok(true);
        }

        ctx.stage = Stage::Resolving;
        let origin = origin.ok_or_else(|| {
            Error::explain(ErrorType::InvalidHTTPHeader, "request carries no host")
        })?;
        let base = settings.hostname.as_deref().ok_or_else(|| {
            Error::explain(ErrorType::InternalError, "no upstream hostname configured")
        })?;

        let resolution = settings.resolver.resolve(base, &ctx.request.path);
        debug!(
            origin = %origin,
            base = %base,
            target = %resolution.target,
            alias = resolution.is_alias(),
            "Request accepted"
        );
        ctx.rewrite = Some(RewriteContext::new(origin, base, resolution));

        Ok(false)
    }

    /// Connects to the resolved upstream host.
    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        ctx.stage = Stage::Building;
        let settings = &ctx.settings;
        let target = ctx.rewrite_context()?.resolved_hostname();

        let (host, port) = parse_host_port(target, settings.default_port());
        let addr = dns_resolve(&host, port).ok_or_else(|| {
            Error::explain(
                ErrorType::ConnectNoRoute,
                format!("cannot resolve upstream host {host}"),
            )
        })?;

        let sni = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let mut peer = HttpPeer::new(addr, settings.tls, sni);
        peer.options.connection_timeout = Some(settings.timeouts.connect);
        peer.options.read_timeout = Some(settings.timeouts.read);
        peer.options.write_timeout = Some(settings.timeouts.write);

        debug!(host = %host, addr = %addr, tls = settings.tls, "Connecting to upstream");
        Ok(Box::new(peer))
    }

    /// Rewrites the outbound request for the resolved host.
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        build_upstream_request(upstream_request, ctx.rewrite_context()?)?;
        ctx.stage = Stage::Fetching;
        Ok(())
    }

    /// Rewrites response headers and decides whether the body is rewritten.
    async fn response_filter(
        &self,
        session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        ctx.stage = Stage::Responding;
        let method = session.req_header().method.clone();
        let settings = ctx.settings.clone();

        ctx.body_rewriter = build_client_response(
            upstream_response,
            &method,
            ctx.rewrite_context()?,
            &settings.patterns,
            settings.debug,
        )?;

        trace!(
            status = %upstream_response.status,
            rewrite_body = ctx.body_rewriter.is_some(),
            "Received upstream response"
        );

        Ok(())
    }

    /// Buffers rewritable bodies and emits them rewritten at end of stream.
    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>>
    where
        Self::CTX: Send + Sync,
    {
        let Some(rewriter) = ctx.body_rewriter.as_ref() else {
            return Ok(None);
        };

        if let Some(chunk) = body {
            ctx.body_buffer.extend_from_slice(chunk);
            chunk.clear();
        }

        if end_of_stream {
            let buffered = std::mem::take(&mut ctx.body_buffer);
            trace!(bytes = buffered.len(), "Rewriting buffered body");
            *body = Some(rewriter.rewrite(&buffered));
        }

        Ok(None)
    }

    /// Turns any failure into a generic 500.
    async fn fail_to_proxy(
        &self,
        session: &mut Session,
        e: &Error,
        ctx: &mut Self::CTX,
    ) -> FailToProxy
    where
        Self::CTX: Send + Sync,
    {
        let stage = ctx.stage;
        ctx.stage = Stage::Failed;

        error!(
            error = %e,
            stage = %stage,
            client_ip = %ctx.request.client_ip,
            user_agent = %ctx.request.user_agent,
            url = %ctx.request.url,
            "Request failed"
        );

        // The client is gone; there is nobody to answer.
        let error_code = match e.esource() {
            ErrorSource::Downstream => 0,
            _ => 500,
        };
        if error_code > 0 {
            Self::respond_internal_error(session).await;
        }

        FailToProxy {
            error_code,
            can_reuse_downstream: false,
        }
    }

    /// Logging after request completion.
    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        if e.is_none() && !matches!(ctx.stage, Stage::Rejected | Stage::Failed) {
            ctx.stage = Stage::Done;
        }

        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);

        debug!(
            status = status,
            stage = %ctx.stage,
            url = %ctx.request.url,
            "Request completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::response::{FALLBACK_PAGE, INTERNAL_ERROR_BODY};
    use pingora_core::protocols::l4::stream::Stream as L4Stream;
    use std::net::Ipv4Addr;
    use std::sync::RwLock;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn settings() -> Arc<ProxySettings> {
        settings_with(|_| {})
    }

    fn settings_with(configure: impl FnOnce(&mut AppConfig)) -> Arc<ProxySettings> {
        let mut config = AppConfig::default();
        config.proxy.hostname = Some("github.com".to_string());
        configure(&mut config);
        Arc::new(ProxySettings::compile(&config).unwrap())
    }

    fn proxy(settings: Arc<ProxySettings>) -> HostRewriteProxy {
        HostRewriteProxy::new(Arc::new(RwLock::new(settings)))
    }

    /// Downstream session over a loopback socket with `raw` already read.
    async fn session_for(raw: &[u8]) -> (Session, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        client.write_all(raw).await.unwrap();

        let mut session = Session::new_h1(Box::new(L4Stream::from(server)));
        assert!(session.read_request().await.unwrap());
        (session, client)
    }

    /// Everything the session sent to the client.
    async fn client_received(mut session: Session, mut client: TcpStream) -> String {
        if session.response_written().is_some() {
            session.as_downstream_mut().finish_body().await.unwrap();
        }
        drop(session);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    fn request(path: &[u8]) -> RequestHeader {
        let mut req = RequestHeader::build("GET", path, None).unwrap();
        req.insert_header("Host", "mirror.test:8443").unwrap();
        req
    }

    #[test]
    fn test_new_ctx_takes_snapshot() {
        let proxy = HostRewriteProxy::new(Arc::new(RwLock::new(settings())));
        let ctx = proxy.new_ctx();
        assert_eq!(ctx.stage, Stage::Start);
        assert_eq!(ctx.settings.hostname.as_deref(), Some("github.com"));
        assert!(ctx.rewrite.is_none());
        assert!(ctx.rewrite_context().is_err());
    }

    #[test]
    fn test_origin_hostname_strips_port() {
        let req = request(b"/owner/repo");
        assert_eq!(origin_hostname(&req).as_deref(), Some("mirror.test"));
    }

    #[test]
    fn test_origin_hostname_is_lowercased() {
        let mut req = RequestHeader::build("GET", b"/", None).unwrap();
        req.insert_header("Host", "Mirror.Test:8443").unwrap();
        assert_eq!(origin_hostname(&req).as_deref(), Some("mirror.test"));

        let req = RequestHeader::build("GET", b"http://MIRROR.test/x", None).unwrap();
        assert_eq!(origin_hostname(&req).as_deref(), Some("mirror.test"));
    }

    #[test]
    fn test_origin_hostname_from_absolute_uri() {
        let req = RequestHeader::build("GET", b"http://mirror.test/x", None).unwrap();
        assert_eq!(origin_hostname(&req).as_deref(), Some("mirror.test"));

        let req = RequestHeader::build("GET", b"/x", None).unwrap();
        assert_eq!(origin_hostname(&req), None);
    }

    #[test]
    fn test_extract_request_info_from_headers() {
        let mut req = request(b"/owner/repo?tab=code");
        req.insert_header("User-Agent", "Mozilla/5.0").unwrap();
        req.insert_header("CF-Connecting-IP", "203.0.113.9").unwrap();
        req.insert_header("CF-IPCountry", "NL").unwrap();

        let peer = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let info = extract_request_info(&req, peer, &settings(), "mirror.test");

        assert_eq!(info.path, "/owner/repo");
        assert_eq!(info.user_agent, "Mozilla/5.0");
        assert_eq!(info.client_ip, "203.0.113.9");
        assert_eq!(info.region, "NL");
        assert_eq!(info.url, "mirror.test/owner/repo?tab=code");
    }

    #[test]
    fn test_extract_request_info_missing_headers() {
        let req = request(b"/");
        let peer = Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        let info = extract_request_info(&req, peer, &settings(), "mirror.test");

        assert_eq!(info.user_agent, "");
        assert_eq!(info.region, "");
        assert_eq!(info.client_ip, "192.0.2.1");

        let info = extract_request_info(&req, None, &settings(), "mirror.test");
        assert_eq!(info.client_ip, "");
    }

    #[tokio::test]
    async fn test_missing_hostname_serves_fallback_page() {
        let proxy = proxy(settings_with(|c| c.proxy.hostname = None));
        let mut ctx = proxy.new_ctx();
        let (mut session, client) =
            session_for(b"GET /owner HTTP/1.1\r\nHost: mirror.test\r\n\r\n").await;

        let handled = proxy.request_filter(&mut session, &mut ctx).await.unwrap();
        assert!(handled);
        assert_eq!(ctx.stage, Stage::Rejected);
        assert!(ctx.rewrite.is_none());

        let out = client_received(session, client).await;
        assert!(out.starts_with("HTTP/1.1 200"));
        assert!(out.ends_with(FALLBACK_PAGE));
    }

    #[tokio::test]
    async fn test_rejected_request_redirects_when_configured() {
        let proxy = proxy(settings_with(|c| {
            c.proxy.ua_blacklist_regex = Some("curl".to_string());
            c.proxy.redirect_url = Some("https://example.com/".to_string());
        }));
        let mut ctx = proxy.new_ctx();
        let (mut session, client) = session_for(
            b"GET / HTTP/1.1\r\nHost: mirror.test\r\nUser-Agent: Curl/8.0\r\n\r\n",
        )
        .await;

        assert!(proxy.request_filter(&mut session, &mut ctx).await.unwrap());
        assert_eq!(ctx.stage, Stage::Rejected);

        let out = client_received(session, client).await.to_ascii_lowercase();
        assert!(out.starts_with("http/1.1 302"));
        assert!(out.contains("location: https://example.com/"));
    }

    #[tokio::test]
    async fn test_accepted_request_resolves_lowercased_origin() {
        let proxy = proxy(settings());
        let mut ctx = proxy.new_ctx();
        let (mut session, _client) = session_for(
            b"GET /repos/o/r HTTP/1.1\r\nHost: Mirror.Test:8443\r\n\r\n",
        )
        .await;

        assert!(!proxy.request_filter(&mut session, &mut ctx).await.unwrap());
        assert_eq!(ctx.stage, Stage::Resolving);

        let rewrite = ctx.rewrite.as_ref().unwrap();
        assert_eq!(rewrite.origin_hostname(), "mirror.test");
        assert_eq!(rewrite.resolved_hostname(), "api.github.com");
        assert_eq!(ctx.request.url, "mirror.test/repos/o/r");
    }

    #[tokio::test]
    async fn test_request_without_host_fails_with_500() {
        let proxy = proxy(settings());
        let mut ctx = proxy.new_ctx();
        let (mut session, client) = session_for(b"GET / HTTP/1.0\r\n\r\n").await;

        let err = proxy.request_filter(&mut session, &mut ctx).await.unwrap_err();
        assert_eq!(ctx.stage, Stage::Resolving);

        let failure = proxy.fail_to_proxy(&mut session, &err, &mut ctx).await;
        assert_eq!(failure.error_code, 500);
        assert_eq!(ctx.stage, Stage::Failed);

        let out = client_received(session, client).await;
        assert!(out.starts_with("HTTP/1.1 500"));
        assert!(out.ends_with(INTERNAL_ERROR_BODY));
    }

    #[tokio::test]
    async fn test_upstream_failure_answers_500() {
        let proxy = proxy(settings());
        let mut ctx = proxy.new_ctx();
        let (mut session, client) =
            session_for(b"GET / HTTP/1.1\r\nHost: mirror.test\r\n\r\n").await;

        let err = Error::explain(ErrorType::ConnectNoRoute, "cannot resolve upstream host");
        let failure = proxy.fail_to_proxy(&mut session, &err, &mut ctx).await;
        assert_eq!(failure.error_code, 500);
        assert!(!failure.can_reuse_downstream);

        let out = client_received(session, client).await;
        assert!(out.starts_with("HTTP/1.1 500"));
        assert!(out.ends_with(INTERNAL_ERROR_BODY));
    }

    #[tokio::test]
    async fn test_downstream_failure_writes_nothing() {
        let proxy = proxy(settings());
        let mut ctx = proxy.new_ctx();
        let (mut session, client) =
            session_for(b"GET / HTTP/1.1\r\nHost: mirror.test\r\n\r\n").await;

        let err = Error::new_down(ErrorType::ConnectionClosed);
        let failure = proxy.fail_to_proxy(&mut session, &err, &mut ctx).await;
        assert_eq!(failure.error_code, 0);
        assert!(session.response_written().is_none());

        let out = client_received(session, client).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_failure_after_response_started_writes_once() {
        let proxy = proxy(settings_with(|c| c.proxy.hostname = None));
        let mut ctx = proxy.new_ctx();
        let (mut session, client) =
            session_for(b"GET / HTTP/1.1\r\nHost: mirror.test\r\n\r\n").await;

        assert!(proxy.request_filter(&mut session, &mut ctx).await.unwrap());
        let err = Error::explain(ErrorType::InternalError, "late failure");
        proxy.fail_to_proxy(&mut session, &err, &mut ctx).await;

        let out = client_received(session, client).await;
        assert_eq!(out.matches("HTTP/1.1 ").count(), 1);
        assert!(out.starts_with("HTTP/1.1 200"));
        assert!(!out.contains(INTERNAL_ERROR_BODY));
    }

    #[tokio::test]
    async fn test_body_rewritten_across_chunks() {
        let proxy = proxy(settings());
        let mut ctx = proxy.new_ctx();
        let (mut session, _client) =
            session_for(b"GET /owner HTTP/1.1\r\nHost: mirror.test\r\n\r\n").await;
        assert!(!proxy.request_filter(&mut session, &mut ctx).await.unwrap());

        let mut upstream = ResponseHeader::build(200, None).unwrap();
        upstream.insert_header("Content-Type", "text/html").unwrap();
        upstream.insert_header("Content-Length", "24").unwrap();
        proxy
            .response_filter(&mut session, &mut upstream, &mut ctx)
            .await
            .unwrap();
        assert_eq!(ctx.stage, Stage::Responding);
        assert!(ctx.body_rewriter.is_some());
        assert!(upstream.headers.get("content-length").is_none());

        let mut body = Some(Bytes::from_static(b"see https://git"));
        proxy
            .response_body_filter(&mut session, &mut body, false, &mut ctx)
            .unwrap();
        assert_eq!(body.as_deref(), Some(&b""[..]));

        let mut body = Some(Bytes::from_static(b"hub.com/x"));
        proxy
            .response_body_filter(&mut session, &mut body, true, &mut ctx)
            .unwrap();
        assert_eq!(body.as_deref(), Some(&b"see https://mirror.test/x"[..]));
        assert!(ctx.body_buffer.is_empty());
    }

    #[tokio::test]
    async fn test_binary_body_streams_through() {
        let proxy = proxy(settings());
        let mut ctx = proxy.new_ctx();
        let (mut session, _client) =
            session_for(b"GET /logo.png HTTP/1.1\r\nHost: mirror.test\r\n\r\n").await;
        assert!(!proxy.request_filter(&mut session, &mut ctx).await.unwrap());

        let mut upstream = ResponseHeader::build(200, None).unwrap();
        upstream.insert_header("Content-Type", "image/png").unwrap();
        proxy
            .response_filter(&mut session, &mut upstream, &mut ctx)
            .await
            .unwrap();
        assert!(ctx.body_rewriter.is_none());

        let mut body = Some(Bytes::from_static(b"github.com"));
        proxy
            .response_body_filter(&mut session, &mut body, false, &mut ctx)
            .unwrap();
        assert_eq!(body.as_deref(), Some(&b"github.com"[..]));
    }

    #[test]
    fn test_stage_labels() {
        assert_eq!(Stage::default(), Stage::Start);
        assert_eq!(Stage::Responding.to_string(), "responding");
        assert_eq!(Stage::Failed.as_str(), "failed");
    }
}

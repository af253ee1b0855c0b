//! Response construction.
//!
//! Rewrites upstream response headers back to the origin hostname and, for
//! textual payloads, prepares a [`BodyRewriter`] for the buffered body. Also
//! builds the locally generated fallback, redirect and error responses.

use crate::context::RewriteContext;
use crate::error::{ProxyError, Result as ProxyResult};
use crate::rewrite::{HostPattern, HostPatterns};
use bytes::Bytes;
use http::{header, Method, StatusCode};
use pingora_core::Result;
use pingora_http::ResponseHeader;
use tracing::{debug, trace};

/// Static page served to rejected requests.
pub const FALLBACK_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Welcome</title>
<style>
body { font-family: system-ui, sans-serif; max-width: 40rem; margin: 4rem auto; padding: 0 1rem; color: #333; }
h1 { font-weight: 500; }
</style>
</head>
<body>
<h1>It works!</h1>
<p>This server is up and running.</p>
</body>
</html>
"#;

/// Body returned when request handling fails.
pub const INTERNAL_ERROR_BODY: &str = "Internal Server Error";

/// Whether a `content-type` value names a payload whose body is rewritten.
pub fn is_rewritable_content_type(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    media_type.starts_with("text/")
        || media_type.ends_with("+json")
        || media_type.ends_with("+xml")
        || matches!(
            media_type.as_str(),
            "application/json"
                | "application/javascript"
                | "application/x-javascript"
                | "application/xml"
        )
}

/// Rewrites a buffered response body back to the origin hostname.
#[derive(Debug, Clone)]
pub struct BodyRewriter {
    patterns: Vec<HostPattern>,
    origin: String,
}

impl BodyRewriter {
    /// Picks the precompiled body patterns for one request.
    ///
    /// With a pathname scope only hostname occurrences followed by a path
    /// matching it are rewritten. When a host split is active, the sibling
    /// host is collapsed onto the origin hostname too.
    pub fn new(ctx: &RewriteContext, patterns: &HostPatterns) -> ProxyResult<Self> {
        let lookup = |host: &str| {
            patterns
                .body_pattern(host)
                .cloned()
                .ok_or_else(|| missing_pattern(host))
        };

        let mut selected = vec![lookup(ctx.resolved_hostname())?];
        if let Some(sibling) = ctx.sibling_hostname() {
            selected.push(lookup(sibling)?);
        }
        Ok(Self {
            patterns: selected,
            origin: ctx.origin_hostname().to_string(),
        })
    }

    /// Applies every pattern in order.
    pub fn rewrite(&self, body: &[u8]) -> Bytes {
        let mut current = body.to_vec();
        for pattern in &self.patterns {
            if let std::borrow::Cow::Owned(next) = pattern.replace_bytes(&current, &self.origin) {
                current = next;
            }
        }
        Bytes::from(current)
    }
}

fn missing_pattern(host: &str) -> ProxyError {
    ProxyError::UnknownHost {
        host: host.to_string(),
    }
}

/// Whether a response to `method` with `status` carries a body at all.
fn has_body(method: &Method, status: StatusCode) -> bool {
    *method != Method::HEAD
        && !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}

/// Rewrites upstream response headers in place and decides how the body is
/// handled.
///
/// Returns a [`BodyRewriter`] when the body must be buffered and rewritten,
/// `None` when it streams through untouched. The status code is never
/// changed.
pub fn build_client_response(
    upstream_response: &mut ResponseHeader,
    method: &Method,
    ctx: &RewriteContext,
    patterns: &HostPatterns,
    debug: bool,
) -> Result<Option<BodyRewriter>> {
    let resolved = ctx.resolved_hostname();
    let header_pattern = patterns
        .header_pattern(resolved)
        .ok_or_else(|| missing_pattern(resolved))?;
    let changed = header_pattern.replace_headers(&mut upstream_response.headers, ctx.origin_hostname());
    trace!(rewritten_headers = changed, "Rewrote response headers");

    if debug {
        upstream_response.remove_header(&header::CONTENT_SECURITY_POLICY);
    }

    let content_type = upstream_response
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let encoded = upstream_response
        .headers
        .get(header::CONTENT_ENCODING)
        .is_some_and(|v| !v.as_bytes().eq_ignore_ascii_case(b"identity"));

    if !is_rewritable_content_type(content_type)
        || encoded
        || !has_body(method, upstream_response.status)
    {
        return Ok(None);
    }

    debug!(content_type = %content_type, "Buffering body for rewrite");
    let body = BodyRewriter::new(ctx, patterns)?;

    upstream_response.remove_header(&header::CONTENT_LENGTH);
    upstream_response.remove_header(&header::CONTENT_ENCODING);
    upstream_response.insert_header(header::TRANSFER_ENCODING, "chunked")?;

    Ok(Some(body))
}

/// Fallback page response for rejected requests.
pub fn fallback_response() -> Result<(ResponseHeader, Bytes)> {
    let body = Bytes::from_static(FALLBACK_PAGE.as_bytes());
    let mut resp = ResponseHeader::build(StatusCode::OK, Some(3))?;
    resp.insert_header(header::CONTENT_TYPE, "text/html; charset=utf-8")?;
    resp.insert_header(header::CONTENT_LENGTH, body.len().to_string())?;
    resp.insert_header(header::CACHE_CONTROL, "no-store")?;
    Ok((resp, body))
}

/// `302` response pointing rejected requests at `location`.
pub fn redirect_response(location: &str) -> Result<ResponseHeader> {
    let mut resp = ResponseHeader::build(StatusCode::FOUND, Some(2))?;
    resp.insert_header(header::LOCATION, location)?;
    resp.insert_header(header::CONTENT_LENGTH, "0")?;
    Ok(resp)
}

/// Generic `500` response with a fixed plain-text body.
pub fn internal_error_response() -> Result<(ResponseHeader, Bytes)> {
    let body = Bytes::from_static(INTERNAL_ERROR_BODY.as_bytes());
    let mut resp = ResponseHeader::build(StatusCode::INTERNAL_SERVER_ERROR, Some(3))?;
    resp.insert_header(header::CONTENT_TYPE, "text/plain; charset=utf-8")?;
    resp.insert_header(header::CONTENT_LENGTH, body.len().to_string())?;
    resp.insert_header(header::CACHE_CONTROL, "no-store")?;
    Ok((resp, body))
}

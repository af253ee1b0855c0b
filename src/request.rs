//! Outbound request construction.
//!
//! Rewrites the client's request headers from the origin hostname to the
//! resolved upstream hostname and adds what the upstream expects.

use crate::context::RewriteContext;
use crate::rewrite::HostRewriter;
use http::header;
use pingora_core::Result;
use pingora_http::RequestHeader;
use tracing::trace;

/// Prepares `upstream_request` for the resolved upstream host.
///
/// Method, path, query and body are carried through untouched.
pub fn build_upstream_request(
    upstream_request: &mut RequestHeader,
    ctx: &RewriteContext,
) -> Result<()> {
    let rewriter = HostRewriter::new(ctx.origin_hostname(), ctx.resolved_hostname())?;
    let changed = rewriter.rewrite_headers(&mut upstream_request.headers);

    upstream_request.insert_header(header::HOST, ctx.resolved_hostname())?;

    // Bodies may need rewriting, which requires identity encoding.
    upstream_request.remove_header(&header::ACCEPT_ENCODING);

    if let Some(split) = ctx.alias_split() {
        let has_user_agent = upstream_request
            .headers
            .get(header::USER_AGENT)
            .is_some_and(|v| !v.is_empty());
        if !has_user_agent {
            upstream_request.insert_header(header::USER_AGENT, split.user_agent.as_str())?;
        }
        if !upstream_request.headers.contains_key(header::ACCEPT) {
            upstream_request.insert_header(header::ACCEPT, split.accept.as_str())?;
        }
    }

    trace!(
        method = %upstream_request.method,
        uri = %upstream_request.uri,
        host = %ctx.resolved_hostname(),
        rewritten_headers = changed,
        "Built upstream request"
    );

    Ok(())
}

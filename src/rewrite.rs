//! Hostname substitution engine.
//!
//! Replaces whole-word occurrences of one hostname with another in text,
//! header values and response bodies. An occurrence only counts when it is
//! not part of a longer host label: `github.com` matches in
//! `https://github.com/x` but not in `notgithub.com`, `my-github.com`,
//! `github.com-mirror`, or the dot-prefixed form `.github.com` (as in
//! `api.github.com` or a cookie `Domain=.github.com`).
//!
//! Matching works on bytes with ASCII word boundaries so bodies that are not
//! valid UTF-8 and opaque header values pass through without lossy decoding.
//!
//! A [`HostPattern`] is the compiled matcher for one hostname and carries no
//! replacement, so patterns for configured hosts are compiled once and reused
//! with whatever origin hostname a request arrives on.

use crate::error::{ProxyError, Result};
use http::{HeaderMap, HeaderValue};
use regex::bytes::{Captures, Regex};
use std::borrow::Cow;
use std::collections::HashMap;

/// Whether `byte` joins the match to a longer host label.
fn extends_label(byte: u8) -> bool {
    matches!(byte, b'.' | b'-')
}

/// Compiled matcher for one hostname.
#[derive(Debug, Clone)]
pub struct HostPattern {
    regex: Regex,
    scoped: bool,
}

impl HostPattern {
    /// Matches every whole-word occurrence of `host`.
    pub fn new(host: &str) -> Result<Self> {
        let source = format!(r"(?-u:\b){}(?-u:\b)", regex::escape(host));
        let regex =
            Regex::new(&source).map_err(|e| ProxyError::invalid_pattern("hostname", e))?;
        Ok(Self {
            regex,
            scoped: false,
        })
    }

    /// Matches `host` only when it is immediately followed by a path matching
    /// `path_pattern`.
    ///
    /// `path_pattern` must already have its anchors removed, see
    /// [`strip_anchors`]. The path is part of the match, so a greedy pattern
    /// such as `/owner/.*` consumes the rest of the line and a second
    /// occurrence on that line is left as it is.
    pub fn scoped(host: &str, path_pattern: &str) -> Result<Self> {
        let source = format!(r"(?-u:\b){}({})", regex::escape(host), path_pattern);
        let regex =
            Regex::new(&source).map_err(|e| ProxyError::invalid_pattern("PATHNAME_REGEX", e))?;
        Ok(Self {
            regex,
            scoped: true,
        })
    }

    /// Replaces every eligible occurrence in `input` with `to`.
    pub fn replace_bytes<'a>(&self, input: &'a [u8], to: &str) -> Cow<'a, [u8]> {
        self.regex.replace_all(input, |caps: &Captures<'_>| {
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            let path = caps.get(1).filter(|_| self.scoped);
            let host_end = path.map_or(whole.end, |m| m.start());

            let joined_before = whole.start > 0 && extends_label(input[whole.start - 1]);
            let joined_after = input.get(host_end) == Some(&b'-');
            if joined_before || joined_after {
                return input[whole].to_vec();
            }

            let mut out = to.as_bytes().to_vec();
            if let Some(path) = path {
                out.extend_from_slice(path.as_bytes());
            }
            out
        })
    }

    /// Rewrites header values in place.
    ///
    /// Names, order and multiplicity are untouched. A rewritten value that
    /// would no longer be a valid header value is left as it was. Returns the
    /// number of values changed.
    pub fn replace_headers(&self, headers: &mut HeaderMap, to: &str) -> usize {
        let mut changed = 0;
        for (_, value) in headers.iter_mut() {
            let Cow::Owned(rewritten) = self.replace_bytes(value.as_bytes(), to) else {
                continue;
            };
            if rewritten == value.as_bytes() {
                continue;
            }
            if let Ok(new_value) = HeaderValue::from_bytes(&rewritten) {
                let sensitive = value.is_sensitive();
                *value = new_value;
                value.set_sensitive(sensitive);
                changed += 1;
            }
        }
        changed
    }
}

/// Patterns for the configured upstream hosts, compiled at load time.
#[derive(Debug, Clone, Default)]
pub struct HostPatterns {
    plain: HashMap<String, HostPattern>,
    scoped: HashMap<String, HostPattern>,
}

impl HostPatterns {
    /// Compiles the plain pattern of every host and, with a path scope, the
    /// scoped one.
    pub fn compile<'a>(
        hosts: impl IntoIterator<Item = &'a str>,
        path_scope: Option<&str>,
    ) -> Result<Self> {
        let mut patterns = Self::default();
        for host in hosts {
            patterns
                .plain
                .insert(host.to_string(), HostPattern::new(host)?);
            if let Some(scope) = path_scope {
                patterns
                    .scoped
                    .insert(host.to_string(), HostPattern::scoped(host, scope)?);
            }
        }
        Ok(patterns)
    }

    /// Pattern used on header values.
    pub fn header_pattern(&self, host: &str) -> Option<&HostPattern> {
        self.plain.get(host)
    }

    /// Pattern used on bodies: the scoped one when a path scope is set.
    pub fn body_pattern(&self, host: &str) -> Option<&HostPattern> {
        self.scoped.get(host).or_else(|| self.plain.get(host))
    }
}

/// Compiled rewrite rule mapping one hostname to another.
#[derive(Debug, Clone)]
pub struct HostRewriter {
    pattern: HostPattern,
    to: String,
}

impl HostRewriter {
    /// Builds an unconstrained rewriter for `from → to`.
    pub fn new(from: &str, to: &str) -> Result<Self> {
        Ok(Self {
            pattern: HostPattern::new(from)?,
            to: to.to_string(),
        })
    }

    /// Builds a rewriter that only fires when the hostname is immediately
    /// followed by a path matching `path_pattern`. See [`HostPattern::scoped`].
    pub fn scoped(from: &str, to: &str, path_pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: HostPattern::scoped(from, path_pattern)?,
            to: to.to_string(),
        })
    }

    /// Rewrites every eligible occurrence in `input`.
    pub fn rewrite_bytes<'a>(&self, input: &'a [u8]) -> Cow<'a, [u8]> {
        self.pattern.replace_bytes(input, &self.to)
    }

    /// Rewrites every eligible occurrence in `text`.
    pub fn rewrite_str<'a>(&self, text: &'a str) -> Cow<'a, str> {
        match self.rewrite_bytes(text.as_bytes()) {
            Cow::Borrowed(_) => Cow::Borrowed(text),
            Cow::Owned(bytes) => match String::from_utf8(bytes) {
                Ok(s) => Cow::Owned(s),
                Err(e) => Cow::Owned(String::from_utf8_lossy(e.as_bytes()).into_owned()),
            },
        }
    }

    /// Rewrites header values in place. See [`HostPattern::replace_headers`].
    pub fn rewrite_headers(&self, headers: &mut HeaderMap) -> usize {
        self.pattern.replace_headers(headers, &self.to)
    }
}

/// Replaces every eligible occurrence of `from` with `to`.
pub fn rewrite_text(text: &str, from: &str, to: &str) -> Result<String> {
    let rewriter = HostRewriter::new(from, to)?;
    Ok(rewriter.rewrite_str(text).into_owned())
}

/// Applies [`rewrite_text`] to every header value mentioning `from`.
pub fn rewrite_headers(headers: &mut HeaderMap, from: &str, to: &str) -> Result<usize> {
    let rewriter = HostRewriter::new(from, to)?;
    Ok(rewriter.rewrite_headers(headers))
}

/// Removes a leading `^` and an unescaped trailing `$` so a path pattern can
/// be matched mid-string.
pub fn strip_anchors(pattern: &str) -> &str {
    let pattern = pattern.strip_prefix('^').unwrap_or(pattern);
    match pattern.strip_suffix('$') {
        Some(rest) if !rest.ends_with('\\') => rest,
        _ => pattern,
    }
}

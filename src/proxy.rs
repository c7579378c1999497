//! Reverse proxy to the development server.
//!
//! Every request that is not an internal `/__liveproxy/*` route is forwarded
//! to the target. Responses are rewritten so the browser stays on the proxy
//! origin: `Location` redirects, cookie domains and absolute links in HTML
//! that point at the target are all mapped back to the proxy host.

use crate::server::AppState;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, HeaderValue, Method, Response, StatusCode},
    response::IntoResponse,
};
use reqwest::Url;
use std::net::SocketAddr;
use std::sync::Arc;

/// Largest request body forwarded to the target.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers that only describe one connection and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

pub struct Proxy {
    target: Url,
    client: reqwest::Client,
    /// Scheme the browser uses to reach us ("http" or "https").
    scheme: &'static str,
}

impl Proxy {
    pub fn new(target: Url, https: bool) -> Result<Proxy> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true) // dev targets often use self-signed certs
            .build()
            .context("Failed to build proxy HTTP client")?;

        Ok(Proxy {
            target,
            client,
            scheme: if https { "https" } else { "http" },
        })
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// `host[:port]` of the target, port omitted when it is the scheme default.
    fn target_authority(&self) -> String {
        let host = self.target.host_str().unwrap_or_default();
        match self.target.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Absolute URL on the target for an incoming path and query.
    pub fn target_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.target.as_str().trim_end_matches('/'), path_and_query)
    }

    /// Length of the target's base path at the start of `rest`, or 0.
    ///
    /// `target_url` prepends the base path on the way in, so it is removed
    /// again on the way out.
    fn base_path_len(&self, rest: &str) -> usize {
        let base = self.target.path().trim_end_matches('/');
        if base.is_empty() {
            return 0;
        }
        match rest.strip_prefix(base) {
            Some(after) if is_url_boundary(after.chars().next()) => base.len(),
            _ => 0,
        }
    }

    /// Map an absolute `Location` on the target back onto the proxy origin.
    pub fn rewrite_location(&self, location: &str, proxy_origin: &str) -> String {
        let authority = self.target_authority();
        let absolute = format!("{}://{}", self.target.scheme(), authority);
        let scheme_relative = format!("//{}", authority);

        for prefix in [absolute.as_str(), scheme_relative.as_str()] {
            if let Some(rest) = location.strip_prefix(prefix) {
                if is_url_boundary(rest.chars().next()) {
                    return format!("{}{}", proxy_origin, &rest[self.base_path_len(rest)..]);
                }
            }
        }
        location.to_string()
    }

    /// Point absolute links to the target at the proxy instead.
    pub fn rewrite_links(&self, html: &str, proxy_origin: &str) -> String {
        let scheme_prefix = format!("{}:", self.target.scheme());
        let scheme_relative = format!("//{}", self.target_authority());
        let proxy_authority = proxy_origin
            .split_once("://")
            .map(|(_, a)| a)
            .unwrap_or(proxy_origin);
        let proxy_relative = format!("//{}", proxy_authority);

        let mut out = String::with_capacity(html.len());
        let mut rest = html;
        while let Some(pos) = rest.find(&scheme_relative) {
            let end = pos + scheme_relative.len();
            let after = &rest[end..];

            // `localhost:80001` or `example.test.cdn.com` are other origins
            if !is_url_boundary(after.chars().next()) {
                out.push_str(&rest[..end]);
                rest = after;
                continue;
            }

            if rest[..pos].ends_with(&scheme_prefix) {
                out.push_str(&rest[..pos - scheme_prefix.len()]);
                out.push_str(proxy_origin);
            } else {
                out.push_str(&rest[..pos]);
                out.push_str(&proxy_relative);
            }
            rest = &after[self.base_path_len(after)..];
        }
        out.push_str(rest);
        out
    }
}

/// Whether `next` may follow a URL authority or path segment.
fn is_url_boundary(next: Option<char>) -> bool {
    match next {
        None => true,
        Some(c) => matches!(c, '/' | '?' | '#' | '"' | '\'' | ')') || c.is_whitespace(),
    }
}

/// Drop the `Domain` attribute so the cookie binds to the proxy host.
pub fn strip_cookie_domain(cookie: &str) -> String {
    cookie
        .split(';')
        .map(str::trim)
        .filter(|attr| !attr.to_ascii_lowercase().starts_with("domain="))
        .collect::<Vec<_>>()
        .join("; ")
}

const BAD_GATEWAY_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>liveproxy: target unreachable</title></head>
<body style="font-family:system-ui,sans-serif;padding:2rem">
<h1>502 Bad Gateway</h1>
<p>liveproxy could not reach <code>{target}</code>.</p>
<pre>{error}</pre>
<p>Is the development server running? This page reloads on the next watched change.</p>
</body>
</html>
"#;

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn bad_gateway(target: &str, error: &str) -> Response<Body> {
    let body = BAD_GATEWAY_HTML
        .replace("{target}", &escape_html(target))
        .replace("{error}", &escape_html(error));
    (
        StatusCode::BAD_GATEWAY,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        body,
    )
        .into_response()
}

// ───────────────────── Proxy handler ─────────────────────

/// Forward a request to the target and relay the response.
/// Preserves method, headers, query string, and body.
pub async fn proxy_handler(State(state): State<Arc<AppState>>, req: Request) -> Response<Body> {
    let proxy = &state.proxy;
    let (parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target_url = proxy.target_url(path_and_query);

    // Host the browser used to reach us; needed to rewrite links back
    let browser_host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()));
    let proxy_origin = browser_host
        .as_ref()
        .map(|h| format!("{}://{}", proxy.scheme, h));

    let mut builder = proxy.client.request(parts.method.clone(), &target_url);

    // Host comes from the target URL; Accept-Encoding is dropped so HTML
    // arrives uncompressed and can be injected.
    // X-Forwarded-* are set below, once.
    for (name, value) in parts.headers.iter() {
        if name == header::HOST
            || name == header::ACCEPT_ENCODING
            || is_hop_by_hop(name)
            || name.as_str().starts_with("x-forwarded-")
        {
            continue;
        }
        builder = builder.header(name.clone(), value.clone());
    }
    if let Some(ref host) = browser_host {
        builder = builder.header("x-forwarded-host", host.as_str());
    }
    builder = builder.header("x-forwarded-proto", proxy.scheme);

    let prior_forwarded_for = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let client_ip = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let forwarded_for = match (prior_forwarded_for, client_ip) {
        (Some(prior), Some(ip)) => Some(format!("{}, {}", prior, ip)),
        (Some(prior), None) => Some(prior.to_string()),
        (None, ip) => ip,
    };
    if let Some(value) = forwarded_for {
        builder = builder.header("x-forwarded-for", value);
    }

    if parts.method != Method::GET && parts.method != Method::HEAD {
        let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(b) => b,
            Err(_) => {
                return (StatusCode::BAD_REQUEST, "Failed to read request body").into_response()
            }
        };
        builder = builder.body(body_bytes);
    }

    let upstream = match builder.send().await {
        Ok(resp) => resp,
        Err(e) => {
            log::warn!("Proxy error: {} {}: {}", parts.method, target_url, e);
            return bad_gateway(proxy.target().as_str(), &e.to_string());
        }
    };

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let bytes = match upstream.bytes().await {
        Ok(b) => b,
        Err(e) => {
            log::warn!("Failed to read proxy response from {}: {}", target_url, e);
            return bad_gateway(proxy.target().as_str(), &e.to_string());
        }
    };

    let is_html = upstream_headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false);
    let is_encoded = upstream_headers.contains_key(header::CONTENT_ENCODING);

    let body = match (&proxy_origin, std::str::from_utf8(&bytes)) {
        (Some(origin), Ok(text)) if is_html && !is_encoded => {
            Body::from(proxy.rewrite_links(text, origin))
        }
        _ => Body::from(bytes),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in upstream_headers.iter() {
        // Body may be re-framed or rewritten
        if is_hop_by_hop(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        let value = match (name, &proxy_origin, value.to_str()) {
            (n, Some(origin), Ok(loc)) if n == header::LOCATION => {
                HeaderValue::from_str(&proxy.rewrite_location(loc, origin))
                    .unwrap_or_else(|_| value.clone())
            }
            (n, _, Ok(cookie)) if n == header::SET_COOKIE => {
                HeaderValue::from_str(&strip_cookie_domain(cookie)).unwrap_or_else(|_| value.clone())
            }
            _ => value.clone(),
        };
        headers.append(name.clone(), value);
    }

    response
}

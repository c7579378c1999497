//! HTML injection middleware — inserts the reload client `<script>` before </body>.

use axum::{
    body::Body,
    http::{header, Method, Request, Response, StatusCode},
    middleware::Next,
};
use http_body_util::BodyExt;

use crate::client::CLIENT_PATH;

/// Tag inserted into every proxied HTML page.
pub fn snippet() -> String {
    format!("<script async src=\"{}\"></script>", CLIENT_PATH)
}

fn rfind_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

/// Insert `snippet` before the last `</body>`, else before `</html>`, else at the end.
///
/// Works on raw bytes: the page keeps whatever charset it was served in.
pub fn inject_snippet(html: &[u8], snippet: &[u8]) -> Vec<u8> {
    let pos = rfind_ignore_ascii_case(html, b"</body>")
        .or_else(|| rfind_ignore_ascii_case(html, b"</html>"));

    let mut out = Vec::with_capacity(html.len() + snippet.len() + 1);
    match pos {
        Some(pos) => {
            out.extend_from_slice(&html[..pos]);
            out.extend_from_slice(snippet);
            out.push(b'\n');
            out.extend_from_slice(&html[pos..]);
        }
        None => {
            out.extend_from_slice(html);
            out.push(b'\n');
            out.extend_from_slice(snippet);
        }
    }
    out
}

fn is_injectable(resp: &Response<Body>) -> bool {
    let status = resp.status();
    if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return false;
    }
    // Compressed bodies pass through untouched
    if resp.headers().contains_key(header::CONTENT_ENCODING) {
        return false;
    }
    resp.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}

/// Axum middleware: if the response is HTML, inject the reload script.
pub async fn inject_livereload(req: Request<Body>, next: Next) -> Response<Body> {
    let is_head = req.method() == Method::HEAD;
    let resp = next.run(req).await;

    if is_head || !is_injectable(&resp) {
        return resp;
    }

    // Buffer the body
    let (mut parts, body) = resp.into_parts();
    let collected = match body.collect().await {
        Ok(c) => c.to_bytes(),
        Err(e) => {
            log::warn!("Failed to buffer HTML response: {}", e);
            return Response::from_parts(parts, Body::empty());
        }
    };

    let injected = inject_snippet(&collected, snippet().as_bytes());

    // Body size changed
    parts.headers.remove(header::CONTENT_LENGTH);

    Response::from_parts(parts, Body::from(injected))
}

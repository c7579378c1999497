use anyhow::Result;
use axum::{
    extract::Request,
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse},
    routing::{any, get},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use liveproxy::server::{build_router, AppState};
use liveproxy::{Cli, Config};

pub fn setup_temp_dir() -> Result<TempDir> {
    tempfile::tempdir().map_err(anyhow::Error::from)
}

/// Opaque bytes standing in for a compressed HTML page.
#[allow(dead_code)]
pub const GZIPPED_BODY: &[u8] = b"\x1f\x8b\x08\x00</body>not really gzip";

/// Stand-in for the development server behind the proxy.
pub async fn start_upstream() -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let home = format!(
        "<!DOCTYPE html><html><head><link rel=\"stylesheet\" href=\"/static/site.css\"></head>\
         <body><a href=\"http://{addr}/blog/\">blog</a></body></html>"
    );
    let redirect_to = format!("http://{addr}/accounts/login/?next=/admin/");
    let app_redirect_to = format!("http://{addr}/app/accounts/login/");

    let app = Router::new()
        .route("/", get(move || async move { Html(home) }))
        .route(
            "/static/site.css",
            get(|| async { ([(header::CONTENT_TYPE, "text/css")], "body { color: red; }") }),
        )
        .route(
            "/admin/",
            get(move || async move {
                (
                    StatusCode::FOUND,
                    [
                        (header::LOCATION, redirect_to),
                        (
                            header::SET_COOKIE,
                            "sessionid=abc; Domain=127.0.0.1; Path=/; HttpOnly".to_string(),
                        ),
                    ],
                )
            }),
        )
        .route("/echo", any(echo))
        // Mounted under a base path, as when the target is `http://host/app`
        .route(
            "/app/admin/",
            get(move || async move { (StatusCode::FOUND, [(header::LOCATION, app_redirect_to)]) }),
        )
        .route("/app/accounts/login/", any(echo))
        .route(
            "/latin1",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "text/html; charset=iso-8859-1")],
                    b"<b>\xE9</body>".to_vec(),
                )
            }),
        )
        .route(
            "/no-content",
            get(|| async { (StatusCode::NO_CONTENT, [(header::CONTENT_TYPE, "text/html")]) }),
        )
        .route(
            "/not-modified",
            get(|| async { (StatusCode::NOT_MODIFIED, [(header::CONTENT_TYPE, "text/html")]) }),
        )
        .route(
            "/gzipped",
            get(|| async {
                (
                    [
                        (header::CONTENT_TYPE, "text/html"),
                        (header::CONTENT_ENCODING, "gzip"),
                    ],
                    GZIPPED_BODY.to_vec(),
                )
            }),
        );

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Ok((addr, handle))
}

async fn echo(headers: HeaderMap, req: Request) -> impl IntoResponse {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let body = axum::body::to_bytes(req.into_body(), 1024 * 1024)
        .await
        .unwrap_or_default();
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    axum::Json(serde_json::json!({
        "method": method,
        "path": path,
        "query": query,
        "body": String::from_utf8_lossy(&body),
        "host": header_str("host"),
        "x_forwarded_host": header_str("x-forwarded-host"),
        "x_forwarded_proto": header_str("x-forwarded-proto"),
        "x_forwarded_for": header_str("x-forwarded-for"),
        "accept_encoding": header_str("accept-encoding"),
        "x_custom": header_str("x-custom"),
    }))
}

pub fn load_config(cwd: &TempDir, proxy: &str, notify: bool) -> Result<Config> {
    let cli = Cli {
        cwd: Some(cwd.path().display().to_string()),
        proxy: Some(proxy.to_string()),
        notify: Some(notify),
        ..Default::default()
    };
    Config::load(&cli)
}

/// Serve liveproxy on an ephemeral port in front of `config.proxy`.
pub async fn start_liveproxy(config: &Config) -> Result<(SocketAddr, Arc<AppState>, JoinHandle<()>)> {
    let state = AppState::new(config)?;
    let app = build_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    Ok((addr, state, handle))
}

/// An address nothing listens on.
#[allow(dead_code)]
pub fn unused_addr() -> Result<SocketAddr> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?)
}

pub fn no_redirect_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?)
}

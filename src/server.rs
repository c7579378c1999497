//! HTTP/HTTPS server: reverse proxy + reload client + WebSocket live reload.

use crate::browser;
use crate::client::{self, CLIENT_PATH, WS_PATH};
use crate::config::Config;
use crate::inject::inject_livereload;
use crate::proxy::{proxy_handler, Proxy};
use crate::watcher::{self, ReloadEvent, WatchSet};

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Request, State,
    },
    http::{header, HeaderValue},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::set_header::SetResponseHeaderLayer;

/// Maximum number of port increments to try when the port is already in use.
const MAX_PORT_RETRIES: u16 = 20;

// ───────────────────── Shared state ─────────────────────

pub struct AppState {
    pub reload_tx: broadcast::Sender<ReloadEvent>,
    pub proxy: Proxy,
    /// Rendered reload client script.
    pub client_js: String,
    pub client_counter: AtomicU64,
}

impl AppState {
    pub fn new(config: &Config) -> Result<Arc<AppState>> {
        let (reload_tx, _) = broadcast::channel::<ReloadEvent>(16);
        Ok(Arc::new(AppState {
            reload_tx,
            proxy: Proxy::new(config.proxy.clone(), config.is_https())?,
            client_js: client::render(config.notify),
            client_counter: AtomicU64::new(0),
        }))
    }
}

// ───────────────────── WebSocket handler ─────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Frames for one broadcast receive, `None` once the channel is closed.
fn frames_for(result: Result<ReloadEvent, RecvError>) -> Option<Vec<String>> {
    match result {
        Ok(event) => Some(client::frames(&event)),
        // Missed events; a full reload covers all of them
        Err(RecvError::Lagged(_)) => Some(vec!["reload".to_string()]),
        Err(RecvError::Closed) => None,
    }
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.reload_tx.subscribe();
    let client_id = format!("c{}", state.client_counter.fetch_add(1, Ordering::Relaxed));
    log::debug!("Browser {} connected", client_id);

    loop {
        tokio::select! {
            // Server → Browser: reload commands
            result = rx.recv() => {
                if let Err(RecvError::Lagged(skipped)) = &result {
                    log::debug!("Browser {} lagged by {} events", client_id, skipped);
                }
                let Some(frames) = frames_for(result) else {
                    break;
                };

                let mut sent = true;
                for frame in frames {
                    if socket.send(Message::Text(frame)).await.is_err() {
                        sent = false;
                        break;
                    }
                }
                if !sent {
                    break;
                }
            }
            // Browser → Server: only close matters
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    log::debug!("Browser {} disconnected", client_id);
}

async fn client_js_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "application/javascript; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        state.client_js.clone(),
    )
}

async fn log_request(req: Request, next: Next) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let resp = next.run(req).await;
    if !path.starts_with("/__liveproxy") {
        log::debug!(
            "{} {} → {} ({} ms)",
            method,
            path,
            resp.status().as_u16(),
            start.elapsed().as_millis()
        );
    }
    resp
}

// ───────────────────── Build router ─────────────────────

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(WS_PATH, get(ws_handler))
        .route(CLIENT_PATH, get(client_js_handler))
        .fallback(proxy_handler)
        // Middleware stack (applied bottom-up)
        .layer(middleware::from_fn(inject_livereload))
        .layer(middleware::from_fn(log_request))
        // Browser must revalidate so a reload never shows stale assets
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
        .with_state(state)
}

// ───────────────────── Startup banner ─────────────────────

fn print_banner(config: &Config, port: u16) {
    let scheme = if config.is_https() { "https" } else { "http" };

    println!();
    println!("  🔥 liveproxy v{}", env!("CARGO_PKG_VERSION"));
    println!("  ─────────────────────────────────────");
    println!("  🔀 Proxy:   {}", config.proxy);
    println!("  🔗 Local:   {}://localhost:{}", scheme, port);
    if config.host == "0.0.0.0" {
        if let Ok(addrs) = local_ip_addresses() {
            for addr in addrs {
                println!("  🌐 Network: {}://{}:{}", scheme, addr, port);
            }
        }
    }
    if config.is_https() {
        println!("  🔒 HTTPS:   enabled");
    }
    println!("  📂 Cwd:     {}", config.cwd.display());
    for glob in &config.files {
        println!("  👀 Watch:   {}", glob);
    }
    for glob in &config.ignore {
        println!("  🙈 Ignore:  {}", glob);
    }
    let reload_mode = if config.inject_changes {
        "CSS hot swap"
    } else {
        "full page"
    };
    println!("  🔄 Reload:  {}", reload_mode);
    println!("  ─────────────────────────────────────");
    println!();
}

fn local_ip_addresses() -> Result<Vec<String>> {
    let mut addrs = Vec::new();
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    // Connect to a public address to determine local IP
    socket.connect("8.8.8.8:80")?;
    if let Ok(local) = socket.local_addr() {
        addrs.push(local.ip().to_string());
    }
    Ok(addrs)
}

// ───────────────────── Run server ─────────────────────

/// Bind `host:port`, moving up to [`MAX_PORT_RETRIES`] ports on `AddrInUse`.
pub fn bind_with_fallback(host: &str, port: u16) -> Result<std::net::TcpListener> {
    for attempt in 0..=MAX_PORT_RETRIES {
        let Some(try_port) = port.checked_add(attempt) else {
            break;
        };

        match std::net::TcpListener::bind((host, try_port)) {
            Ok(listener) => {
                if try_port != port {
                    log::info!("ℹ Port {} was in use, switched to port {}.", port, try_port);
                }
                listener.set_nonblocking(true)?;
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if attempt == 0 {
                    log::warn!("Port {} is in use, searching for an available port...", try_port);
                }
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to bind {}:{}", host, try_port))
            }
        }
    }

    anyhow::bail!(
        "Ports {}-{} are all in use. Please free a port or choose a different one.",
        port,
        port.saturating_add(MAX_PORT_RETRIES)
    )
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutting down");
}

/// Start the watcher and serve the proxy until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
    let state = AppState::new(&config)?;

    let watch_set = WatchSet::new(&config.cwd, &config.files, &config.ignore)?;
    watcher::spawn(
        watch_set,
        config.reload_debounce,
        config.inject_changes,
        state.reload_tx.clone(),
    )?;

    let app = build_router(state)
        .into_make_service_with_connect_info::<SocketAddr>();

    let listener = bind_with_fallback(&config.host, config.port)?;
    let port = listener.local_addr()?.port();

    print_banner(&config, port);

    let scheme = if config.is_https() { "https" } else { "http" };
    if config.open {
        browser::open_url(&format!("{}://localhost:{}", scheme, port));
    }
    log::info!("🚀 Listening on {}://{}:{} ...", scheme, config.host, port);

    match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                .await
                .context("Failed to load TLS certificate/key")?;

            let handle = axum_server::Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown.graceful_shutdown(Some(Duration::from_secs(2)));
            });

            axum_server::from_tcp_rustls(listener, tls_config)
                .handle(handle)
                .serve(app)
                .await?;
        }
        _ => {
            let listener = tokio::net::TcpListener::from_std(listener)?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_port_falls_back_to_next_one() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = held.local_addr().unwrap().port();

        let listener = bind_with_fallback("127.0.0.1", busy).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_ne!(port, busy);
        assert!(port > busy && port <= busy.saturating_add(MAX_PORT_RETRIES));
    }

    #[tokio::test]
    async fn lagged_browser_gets_full_reload() {
        let (tx, mut rx) = broadcast::channel(2);
        for i in 0..5 {
            tx.send(ReloadEvent::Css(vec![format!("static/{}.css", i)])).unwrap();
        }

        let first = rx.recv().await;
        assert!(matches!(first, Err(RecvError::Lagged(3))));
        assert_eq!(frames_for(first), Some(vec!["reload".to_string()]));

        // Retained events still arrive afterwards
        assert_eq!(
            frames_for(rx.recv().await),
            Some(vec!["css:static/3.css".to_string()])
        );
    }

    #[tokio::test]
    async fn closed_channel_ends_the_socket_loop() {
        let (tx, mut rx) = broadcast::channel::<ReloadEvent>(2);
        drop(tx);
        assert_eq!(frames_for(rx.recv().await), None);
    }
}

//! Browser-side reload client and the frames sent to it.
//!
//! The script lives in `src/client.js` and is embedded at compile time; the
//! `notify` flag and WebSocket path are filled in once at startup.

use crate::watcher::ReloadEvent;

/// Path the reload client is served from.
pub const CLIENT_PATH: &str = "/__liveproxy/client.js";
/// WebSocket endpoint the client connects to.
pub const WS_PATH: &str = "/__liveproxy/ws";

const CLIENT_JS: &str = include_str!("client.js");

/// Render the client script for this run.
pub fn render(notify: bool) -> String {
    CLIENT_JS
        .replace("__LIVEPROXY_NOTIFY__", if notify { "true" } else { "false" })
        .replace("__LIVEPROXY_WS_PATH__", WS_PATH)
}

/// WebSocket text frames for one reload event.
///
/// `reload` reloads the page; `css:<path>` asks the client to swap one
/// stylesheet in place.
pub fn frames(event: &ReloadEvent) -> Vec<String> {
    match event {
        ReloadEvent::Full(_) => vec!["reload".to_string()],
        ReloadEvent::Css(paths) => paths.iter().map(|p| format!("css:{}", p)).collect(),
    }
}

//! ⚡ liveproxy — live-reload reverse proxy for local development servers.
//!
//! liveproxy fronts a dev server (Django's `runserver` on :8000 by default),
//! injects a small reload client into every HTML page it proxies, and
//! refreshes connected browsers when watched files change. Stylesheet-only
//! changes are swapped in place without a reload.

pub mod browser;
pub mod client;
pub mod config;
pub mod inject;
pub mod logger;
pub mod proxy;
pub mod server;
pub mod watcher;

pub use config::{Cli, Config};
pub use watcher::ReloadEvent;

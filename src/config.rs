//! Configuration — CLI flags merged with `liveproxy.json` and built-in defaults.
//!
//! Priority: CLI > config file > defaults. The defaults reproduce the usual
//! Django/Wagtail setup this tool was written for:
//!
//! ```jsonc
//! {
//!   "files": ["app/static/**/*", "**/templates/**/*"],
//!   "proxy": "http://localhost:8000",
//!   "open": false,
//!   "notify": false
//! }
//! ```

use crate::watcher;

use anyhow::{Context, Result};
use clap::Parser;
use globset::Glob;
use reqwest::Url;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Watched when neither the CLI nor the config file names any globs.
pub const DEFAULT_FILES: &[&str] = &["app/static/**/*", "**/templates/**/*"];
pub const DEFAULT_PROXY: &str = "http://localhost:8000";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DEBOUNCE_MS: u64 = 150;

/// Config file looked up in the working directory when `--config` is absent.
pub const CONFIG_FILE_NAME: &str = "liveproxy.json";

// ───────────────────── CLI ─────────────────────

#[derive(Parser, Debug, Default)]
#[command(
    name = "liveproxy",
    version,
    about = "⚡ Live-reload proxy for local development servers"
)]
pub struct Cli {
    /// Glob pattern of files to watch (can be repeated)
    #[arg(short, long = "files", value_name = "GLOB")]
    pub files: Vec<String>,

    /// Proxy target (e.g. "http://localhost:8000" or "localhost:8000")
    #[arg(long, value_name = "URL")]
    pub proxy: Option<String>,

    /// Open the browser once the proxy is listening
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub open: Option<bool>,

    /// Show an overlay in the browser on connect and reload
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub notify: Option<bool>,

    /// Bind host
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Glob pattern of files to ignore (can be repeated)
    #[arg(long, value_name = "GLOB")]
    pub ignore: Vec<String>,

    /// Always reload the full page, even when only CSS changed
    #[arg(long, default_value_t = false)]
    pub no_inject_changes: bool,

    /// Quiet period in milliseconds before a batch of changes triggers a reload
    #[arg(long, value_name = "MS")]
    pub reload_debounce: Option<u64>,

    /// TLS certificate path (PEM)
    #[arg(long)]
    pub cert: Option<String>,

    /// TLS private key path (PEM)
    #[arg(long)]
    pub key: Option<String>,

    /// Config file (defaults to ./liveproxy.json when present)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Working directory that globs and relative paths resolve against
    #[arg(long)]
    pub cwd: Option<String>,

    /// Enable debug logging for liveproxy
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, default_value_t = false, conflicts_with = "verbose")]
    pub quiet: bool,
}

// ───────────────────── Config ─────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    pub files: Vec<String>,
    pub proxy: Url,
    pub open: bool,
    pub notify: bool,
    pub host: String,
    pub port: u16,
    pub ignore: Vec<String>,
    pub inject_changes: bool,
    pub reload_debounce: Duration,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub cwd: PathBuf,
}

// ───────────────────── liveproxy.json ─────────────────────

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileHttps {
    cert: Option<String>,
    key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FileConfig {
    files: Option<Vec<String>>,
    proxy: Option<String>,
    open: Option<bool>,
    notify: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    ignore: Option<Vec<String>>,
    inject_changes: Option<bool>,
    reload_debounce: Option<u64>,
    https: Option<FileHttps>,
}

/// Strip `//` and `/* */` comments and trailing commas from JSONC.
pub fn strip_jsonc(input: &str) -> String {
    strip_trailing_commas(&strip_comments(input))
}

fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        let next = chars.peek().copied();
        match (c, next) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                for nc in chars.by_ref() {
                    if nc == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for nc in chars.by_ref() {
                    if prev == '*' && nc == '/' {
                        break;
                    }
                    // keep line numbers stable for serde_json error messages
                    if nc == '\n' {
                        out.push('\n');
                    }
                    prev = nc;
                }
            }
            _ => out.push(c),
        }
    }

    out
}

fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escape = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }
        if c == '"' {
            in_string = true;
        }
        if c == ',' {
            let next = chars[i + 1..].iter().copied().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }

    out
}

fn load_config_file(cwd: &Path, explicit: Option<&str>) -> Result<FileConfig> {
    let path = match explicit {
        Some(p) => {
            let path = resolve_path(cwd, p);
            anyhow::ensure!(path.exists(), "Config file not found: {}", path.display());
            path
        }
        None => {
            let path = cwd.join(CONFIG_FILE_NAME);
            if !path.exists() {
                return Ok(FileConfig::default());
            }
            path
        }
    };

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let parsed = serde_json::from_str(&strip_jsonc(&content))
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    log::debug!("Loaded config file {}", path.display());
    Ok(parsed)
}

/// Resolve a possibly-relative path against the working directory.
fn resolve_path(cwd: &Path, p: &str) -> PathBuf {
    let path = PathBuf::from(p);
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}

/// Parse a proxy target, assuming `http://` when the scheme is omitted.
pub fn normalize_proxy_target(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    anyhow::ensure!(!trimmed.is_empty(), "Proxy target is empty");

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };
    let url = Url::parse(&with_scheme)
        .with_context(|| format!("Invalid proxy target: {}", raw))?;

    anyhow::ensure!(
        matches!(url.scheme(), "http" | "https"),
        "Unsupported proxy scheme '{}' in {} (expected http or https)",
        url.scheme(),
        raw
    );
    anyhow::ensure!(url.host_str().is_some(), "Proxy target has no host: {}", raw);
    Ok(url)
}

fn validate_globs(kind: &str, patterns: &[String]) -> Result<()> {
    for pattern in patterns {
        Glob::new(pattern).with_context(|| format!("Invalid {} pattern '{}'", kind, pattern))?;
        watcher::check_parent_components(pattern)?;
    }
    Ok(())
}

impl Config {
    /// Merge CLI flags, the config file and defaults into a validated config.
    pub fn load(cli: &Cli) -> Result<Config> {
        let cwd = match cli.cwd {
            Some(ref c) => PathBuf::from(c),
            None => std::env::current_dir().context("Failed to read current directory")?,
        };
        anyhow::ensure!(cwd.is_dir(), "Working directory not found: {}", cwd.display());

        let file = load_config_file(&cwd, cli.config.as_deref())?;

        let files = if !cli.files.is_empty() {
            cli.files.clone()
        } else {
            file.files
                .unwrap_or_else(|| DEFAULT_FILES.iter().map(|s| s.to_string()).collect())
        };
        anyhow::ensure!(!files.is_empty(), "No file globs to watch");
        validate_globs("watch", &files)?;

        let ignore = if !cli.ignore.is_empty() {
            cli.ignore.clone()
        } else {
            file.ignore.unwrap_or_default()
        };
        validate_globs("ignore", &ignore)?;

        let proxy_raw = cli
            .proxy
            .clone()
            .or(file.proxy)
            .unwrap_or_else(|| DEFAULT_PROXY.to_string());
        let proxy = normalize_proxy_target(&proxy_raw)?;

        let inject_changes = if cli.no_inject_changes {
            false
        } else {
            file.inject_changes.unwrap_or(true)
        };

        let debounce_ms = cli
            .reload_debounce
            .or(file.reload_debounce)
            .unwrap_or(DEFAULT_DEBOUNCE_MS);

        // HTTPS: CLI --cert/--key > file https
        let file_https = file.https.unwrap_or_default();
        let cert = cli.cert.clone().or(file_https.cert);
        let key = cli.key.clone().or(file_https.key);
        let (cert, key) = match (cert, key) {
            (Some(c), Some(k)) => (Some(resolve_path(&cwd, &c)), Some(resolve_path(&cwd, &k))),
            (None, None) => (None, None),
            _ => anyhow::bail!("HTTPS needs both a certificate and a private key"),
        };
        if let Some(ref c) = cert {
            anyhow::ensure!(c.exists(), "Certificate not found: {}", c.display());
        }
        if let Some(ref k) = key {
            anyhow::ensure!(k.exists(), "Private key not found: {}", k.display());
        }

        Ok(Config {
            files,
            proxy,
            open: cli.open.or(file.open).unwrap_or(false),
            notify: cli.notify.or(file.notify).unwrap_or(false),
            host: cli
                .host
                .clone()
                .or(file.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
            ignore,
            inject_changes,
            reload_debounce: Duration::from_millis(debounce_ms),
            cert,
            key,
            cwd,
        })
    }

    pub fn is_https(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_in(dir: &Path) -> Cli {
        Cli {
            cwd: Some(dir.display().to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_dev_setup() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&cli_in(dir.path())).unwrap();

        assert_eq!(config.files, vec!["app/static/**/*", "**/templates/**/*"]);
        assert_eq!(config.proxy.as_str(), "http://localhost:8000/");
        assert!(!config.open);
        assert!(!config.notify);
        assert_eq!(config.port, 3000);
        assert!(config.inject_changes);
        assert_eq!(config.reload_debounce, Duration::from_millis(150));
        assert!(!config.is_https());
    }

    #[test]
    fn config_file_is_read_from_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{
                // watch only the styles
                "files": ["static/**/*.css",],
                "proxy": "127.0.0.1:9000", /* no scheme */
                "notify": true,
                "injectChanges": false,
            }"#,
        )
        .unwrap();

        let config = Config::load(&cli_in(dir.path())).unwrap();
        assert_eq!(config.files, vec!["static/**/*.css"]);
        assert_eq!(config.proxy.as_str(), "http://127.0.0.1:9000/");
        assert!(config.notify);
        assert!(!config.open);
        assert!(!config.inject_changes);
    }

    #[test]
    fn cli_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{ "open": true, "port": 4000, "proxy": "http://localhost:8000" }"#,
        )
        .unwrap();

        let cli = Cli {
            open: Some(false),
            port: Some(5000),
            proxy: Some("https://example.test:8443/app".into()),
            files: vec!["**/*.html".into()],
            ..cli_in(dir.path())
        };
        let config = Config::load(&cli).unwrap();
        assert!(!config.open);
        assert_eq!(config.port, 5000);
        assert_eq!(config.proxy.as_str(), "https://example.test:8443/app");
        assert_eq!(config.files, vec!["**/*.html"]);
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), r#"{ "prxy": "x" }"#).unwrap();
        assert!(Config::load(&cli_in(dir.path())).is_err());
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            config: Some("nope.json".into()),
            ..cli_in(dir.path())
        };
        let err = Config::load(&cli).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            files: vec!["static/[".into()],
            ..cli_in(dir.path())
        };
        assert!(Config::load(&cli).is_err());
    }

    #[test]
    fn globs_above_cwd_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            files: vec!["../shared/**/*".into()],
            ..cli_in(dir.path())
        };
        let err = Config::load(&cli).unwrap_err();
        assert!(format!("{:#}", err).contains("'..'"));

        let cli = Cli {
            ignore: vec!["app/../node_modules/**".into()],
            ..cli_in(dir.path())
        };
        assert!(Config::load(&cli).is_err());
    }

    #[test]
    fn cert_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("server.crt"), "").unwrap();
        let cli = Cli {
            cert: Some("server.crt".into()),
            ..cli_in(dir.path())
        };
        assert!(Config::load(&cli).is_err());
    }

    #[test]
    fn proxy_targets() {
        assert_eq!(
            normalize_proxy_target("localhost:8000").unwrap().as_str(),
            "http://localhost:8000/"
        );
        assert_eq!(
            normalize_proxy_target(" http://localhost:8000/sub ").unwrap().as_str(),
            "http://localhost:8000/sub"
        );
        assert!(normalize_proxy_target("").is_err());
        assert!(normalize_proxy_target("ftp://localhost").is_err());
    }

    #[test]
    fn jsonc_keeps_string_contents() {
        let input = r#"{ "a": "http://x//y", "b": "/* not a comment */", "c": "1,}", }"#;
        let value: serde_json::Value = serde_json::from_str(&strip_jsonc(input)).unwrap();
        assert_eq!(value["a"], "http://x//y");
        assert_eq!(value["b"], "/* not a comment */");
        assert_eq!(value["c"], "1,}");
    }
}

// Logging setup for the CLI
use std::io::Write;

/// Initialize the `log` backend.
///
/// Default is info-level messages without a prefix. `--verbose` adds debug
/// output for this crate only, `--quiet` keeps errors only, and a set
/// `RUST_LOG` takes over completely.
pub fn init_logger(verbose: bool, quiet: bool) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
        return;
    }

    let default_level = if quiet {
        log::LevelFilter::Error
    } else {
        log::LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(default_level).format(|buf, record| {
        match record.level() {
            log::Level::Info => writeln!(buf, "  {}", record.args()),
            log::Level::Warn => writeln!(buf, "  ⚠ {}", record.args()),
            level => writeln!(buf, "  [{}] {}", level, record.args()),
        }
    });

    if verbose {
        builder.filter_module("liveproxy", log::LevelFilter::Debug);
    }
    for noisy in ["hyper", "hyper_util", "reqwest", "notify", "rustls"] {
        builder.filter_module(noisy, default_level.min(log::LevelFilter::Warn));
    }

    builder.init();
}

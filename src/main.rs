use stanza_edge::config::{parse_args, CliOptions};
use stanza_edge::listener::XmppListener;
use stanza_edge::negotiator::NegotiatorFactory;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

fn print_usage() {
    eprintln!("stanza-edge v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: stanza-edge [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("      --listen=ADDR           Listen address or IP (default: [::]:5222, dual-stack)");
    eprintln!("      --port=PORT             Override the listen port");
    eprintln!("      --backlog=N             Accept backlog (default: 100)");
    eprintln!("      --no-delay=on|off       TCP_NODELAY on accepted sockets (default: on)");
    eprintln!("      --mechanisms=A;B        Advertised SASL mechanisms (default: PLAIN)");
    eprintln!("      --max-stanza-bytes=N    Cap on buffered unparsed bytes per connection");
    eprintln!("      --read-timeout-secs=N   Socket read timeout, 0 for none");
    eprintln!("      --write-timeout-secs=N  Socket write timeout, 0 for none");
    eprintln!("  -v, --verbose               Enable verbose logging to stderr (no XML traffic)");
    eprintln!("      --verbose=xml           Enable verbose logging including stanza content");
    eprintln!("      --log-file=PATH         Override log file directory (default: platform data dir)");
    eprintln!("  -h, --help                  Show this help message");
    eprintln!();
    eprintln!("Logs are always written to a daily-rotating file in:");
    eprintln!("  Linux:   ~/.local/share/stanza-edge/logs/");
    eprintln!("  macOS:   ~/Library/Application Support/stanza-edge/logs/");
    eprintln!("  Windows: %LOCALAPPDATA%\\stanza-edge\\logs\\");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG                    Override log filter (e.g. RUST_LOG=debug)");
}

fn print_startup_diagnostics(options: &CliOptions) {
    eprintln!("stanza-edge v{} (build {})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
    eprintln!("Platform: {} / {}", std::env::consts::OS, std::env::consts::ARCH);
    eprintln!("Listen: {} (backlog {})", options.server.listen, options.server.backlog);
    eprintln!("Mechanisms: {}", options.server.mechanisms.join(", "));
    eprintln!("---");
}

/// `--log-file=<path>` puts logs next to `path`, otherwise the platform data directory.
fn log_dir(log_file: Option<&str>) -> PathBuf {
    match log_file {
        Some(path) => PathBuf::from(path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".")),
        None => dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stanza-edge")
            .join("logs"),
    }
}

fn init_tracing(options: &CliOptions) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_dir = log_dir(options.log_file.as_deref());
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }

    let rust_log = std::env::var("RUST_LOG").is_ok();
    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("stanza_edge=info,info")
    };

    let file_appender = tracing_appender::rolling::daily(&log_dir, "stanza-edge.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if options.verbose.is_some() || options.log_file.is_some() || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if options.verbose.as_deref() == Some("xml") {
            EnvFilter::new("stanza_edge=info,stanza_edge::session=debug,info")
        } else {
            EnvFilter::new("stanza_edge=info,info")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    // The writer thread must outlive every log call.
    std::mem::forget(_guard);

    eprintln!("Log file: {}", log_dir.display());
}

#[tokio::main]
async fn main() {
    let options = match parse_args(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("Try --help for the list of options.");
            std::process::exit(2);
        }
    };
    if options.help {
        print_usage();
        std::process::exit(0);
    }

    init_tracing(&options);
    if options.verbose.is_some() || options.log_file.is_some() {
        print_startup_diagnostics(&options);
    }

    let factory = Arc::new(NegotiatorFactory::new(options.server.mechanisms.clone(), false));
    let mut listener = XmppListener::new();
    if let Err(e) = listener.start(options.server.clone(), factory).await {
        error!(listen = %options.server.listen, error = %e, "Failed to start listener");
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to wait for Ctrl-C");
    }
    info!("Stopping listener");
    listener.stop().await;
}

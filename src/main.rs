//! GNSS bridge daemon.
//!
//! Usage:
//!   gnss-bridge -c /etc/gnss-bridge/gnss_bridge.conf
//!   gnss-bridge -c /etc/gnss-bridge/gnss_bridge.conf --stderr   # log to stderr

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use gnss_bridge::config;
use gnss_bridge::session::{Session, SessionEvent, SessionState};

/// Identity the daemon logs under.
const DAEMON_NAME: &str = env!("CARGO_PKG_NAME");
/// How often the running session's statistics are logged.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "gnss-bridge", about = "NMEA 0183 bridge — GNSS receiver to serial/UDP/file")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/gnss-bridge/gnss_bridge.conf")]
    config: PathBuf,

    /// Log to stderr instead of syslog (useful for debugging).
    #[arg(long)]
    stderr: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("gnss-bridge: config error: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = cfg.session.validate() {
        eprintln!("gnss-bridge: config validation: {e}");
        process::exit(1);
    }

    let use_syslog = cfg.log_syslog && !cli.stderr;
    init_logging(use_syslog).expect("failed to set up logging");

    info!("{DAEMON_NAME} starting (input={:?})", cfg.session.input);

    let (mut session, mut events) = Session::new();
    if let Err(e) = session.start(cfg.session.clone()).await {
        error!("cannot start session: {e}");
        process::exit(1);
    }

    let mut stats_timer = tokio::time::interval(STATS_INTERVAL);
    stats_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    stats_timer.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            ev = events.recv() => match ev {
                Some(SessionEvent::StateChanged { old, new, message }) => {
                    match message {
                        Some(msg) => info!("session {old} -> {new}: {msg}"),
                        None      => info!("session {old} -> {new}"),
                    }
                    if new == SessionState::Error {
                        warn!("session errored, stopping");
                        break;
                    }
                }
                Some(SessionEvent::Endpoint(ev)) => {
                    info!("{}: {} -> {}", ev.endpoint, ev.old, ev.new);
                }
                Some(SessionEvent::Health { old, new }) => {
                    info!("source health: {old:?} -> {new:?}");
                }
                Some(SessionEvent::Sentence(_)) => {}
                None => break,
            },
            _ = stats_timer.tick() => {
                let s = session.statistics();
                info!(
                    "rx {} sentences / {} bytes, tx {} sentences, {:.1} Hz, \
                     {} checksum / {} parse / {} write errors",
                    s.sentences_received, s.bytes_received, s.sentences_sent,
                    s.current_rate_hz, s.checksum_errors, s.parse_errors,
                    s.write_errors,
                );
            }
        }
    }

    session.stop().await;
    let s = session.statistics();
    info!(
        "session ended: {} sentences in, {} out, {} write errors",
        s.sentences_received, s.sentences_sent, s.write_errors
    );
}

// ── Logging ───────────────────────────────────────────────────────────────────

/// Route the `log` macros either to the local syslog daemon (service
/// mode) or to stderr via env_logger (interactive runs, `--stderr`).
fn init_logging(to_syslog: bool) -> anyhow::Result<()> {
    if !to_syslog {
        // RUST_LOG still wins; debug is the default for interactive use.
        env_logger::Builder::new()
            .filter_level(log::LevelFilter::Debug)
            .parse_default_env()
            .init();
        return Ok(());
    }

    let logger = syslog::unix(syslog::Formatter3164 {
        facility: syslog::Facility::LOG_DAEMON,
        hostname: None,
        process:  DAEMON_NAME.into(),
        pid:      process::id(),
    })
    .map_err(|e| anyhow::anyhow!("syslog connect failed: {e}"))?;
    log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))?;
    log::set_max_level(log::LevelFilter::Info);
    Ok(())
}

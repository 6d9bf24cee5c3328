//! Connectivity daemon for telematics gateways.
//!
//! Keeps the default route on the healthiest of Ethernet, Wi-Fi and cellular,
//! and drives the cellular modem (carrier scan, blacklist, PPP, hardware
//! reset) over its AT port.
//!
//! Usage:
//!   gateway-netd -c /etc/gateway-netd.conf
//!   gateway-netd --uci --stderr                 # UCI config, log to stderr
//!   gateway-netd ctl cellular                   # query a running daemon

mod at;
mod blacklist;
mod cellular;
mod config;
mod diag;
mod error;
mod gpio;
mod health;
mod network;
mod ppp;
mod serial;
mod supervisor;
mod util;

#[cfg(test)]
mod mock;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::blacklist::CarrierBlacklist;
use crate::cellular::{CellularFlags, CellularSettings, CellularStateMachine};
use crate::config::NetdConfig;
use crate::gpio::{GpioPin, HardwareResetController, ResetLine, SysNodes};
use crate::health::{new_shared, InterfaceKind, PingHealthChecker, PingProber};
use crate::network::{IpRoute, NetworkInterfaceManager, NetworkSettings, SysLinks};
use crate::ppp::{PppCoordinator, SysPppStatus};
use crate::serial::{SerialPortManager, TtyOpener};
use crate::supervisor::LocalSupervisor;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "gateway-netd", about = "Gateway connectivity daemon: interface selection and cellular modem control")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/gateway-netd.conf")]
    config: PathBuf,

    /// Read the configuration from UCI (`netd.core.*`) instead of a file.
    #[arg(long)]
    uci: bool,

    /// Log to stderr instead of syslog (useful for debugging).
    #[arg(long)]
    stderr: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send a diagnostic command to the running daemon and print the reply.
    Ctl {
        /// interfaces | cellular | blacklist | rescan | reset |
        /// blacklist-clear | blacklist-add <mccmnc>
        #[arg(required = true)]
        words: Vec<String>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loaded = if cli.uci { config::load_config_uci() } else { config::load_config(&cli.config) };

    if let Some(Command::Ctl { words }) = cli.command {
        // The client only needs the socket path; fall back to the default.
        let socket = loaded.map(|c| c.ctl_socket).unwrap_or_else(|_| NetdConfig::default().ctl_socket);
        match diag::request(&socket, &words.join(" ")).await {
            Ok(reply) => println!("{reply}"),
            Err(e) => {
                eprintln!("gateway-netd: {e:#}");
                process::exit(1);
            }
        }
        return;
    }

    let cfg = match loaded {
        Ok(c) => c,
        Err(e) => {
            eprintln!("gateway-netd: config error: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = config::validate_config(&cfg) {
        eprintln!("gateway-netd: config validation: {e}");
        process::exit(1);
    }

    let use_syslog = cfg.log_syslog && !cli.stderr;
    if let Err(e) = setup_logging(use_syslog) {
        eprintln!("gateway-netd: logging setup: {e:#}");
        process::exit(1);
    }

    if let Err(e) = util::write_pid_file(&cfg.pid_file) {
        error!("cannot write PID file {}: {e}", cfg.pid_file.display());
    }

    info!(
        "gateway-netd starting (AT {}, data {}, ppp {})",
        cfg.at_device.display(),
        cfg.data_device.display(),
        cfg.ppp_iface
    );
    if let Some(iface) = util::default_route_iface() {
        info!("default route currently on {iface}");
    }

    if let Err(e) = run(&cfg).await {
        error!("fatal: {e:#}");
        util::remove_pid_file(&cfg.pid_file);
        process::exit(1);
    }

    util::remove_pid_file(&cfg.pid_file);
    info!("gateway-netd stopped");
}

// ── Daemon ────────────────────────────────────────────────────────────────────

async fn run(cfg: &NetdConfig) -> anyhow::Result<()> {
    let flags = Arc::new(CellularFlags::default());
    let eth = new_shared(InterfaceKind::Ethernet);
    let wifi = new_shared(InterfaceKind::Wifi);
    let cell = new_shared(InterfaceKind::Cellular);

    let mut supervisor = LocalSupervisor::new(Duration::from_millis(cfg.respawn_delay_ms));
    supervisor
        .register(&cfg.ppp_child, &cfg.ppp_command)
        .context("register PPP child")?;
    let mut ppp = PppCoordinator::new(
        &cfg.ppp_child,
        &cfg.ppp_iface,
        Box::new(supervisor),
        Box::new(SysPppStatus),
        Arc::clone(&cell),
    );

    // Dropping the controller unexports the pin.
    let line: Option<Box<dyn ResetLine>> = match cfg.gpio_reset_pin {
        Some(pin) => Some(Box::new(
            GpioPin::export(&cfg.gpio_base, pin).with_context(|| format!("export reset GPIO {pin}"))?,
        )),
        None => {
            warn!("no gpio_reset_pin configured; modem resets will only reopen the AT port");
            None
        }
    };
    let reset = HardwareResetController::new(
        line,
        Box::new(SysNodes { at_device: cfg.at_device.clone(), data_device: cfg.data_device.clone() }),
        Duration::from_millis(cfg.reset_low_ms),
        Duration::from_millis(cfg.reset_high_ms),
    );

    let mut cellular = CellularStateMachine::new(
        SerialPortManager::new(Box::new(TtyOpener::new(cfg.at_device.clone(), cfg.at_baud))),
        CarrierBlacklist::new(cfg.blacklist_capacity, cfg.blacklist_threshold, cfg.blacklist_ttl()),
        reset,
        Arc::clone(&flags),
        CellularSettings::from_config(cfg),
    );

    let checker = PingHealthChecker::new(
        Arc::new(PingProber),
        &cfg.ping_target,
        cfg.ping_count,
        Duration::from_secs(cfg.probe_deadline),
    );
    let mut network = NetworkInterfaceManager::new(
        vec![
            (InterfaceKind::Ethernet, cfg.eth_iface.clone(), eth),
            (InterfaceKind::Wifi, cfg.wifi_iface.clone(), wifi),
            (InterfaceKind::Cellular, cfg.ppp_iface.clone(), cell),
        ],
        flags,
        checker,
        Box::new(SysLinks),
        Box::new(IpRoute),
        NetworkSettings::from_config(cfg),
    );

    let (diag_tx, mut diag_rx) = mpsc::channel::<diag::DiagRequest>(8);
    let listener = diag::bind(&cfg.ctl_socket)
        .with_context(|| format!("bind control socket {}", cfg.ctl_socket.display()))?;
    let server = tokio::spawn(diag::serve(listener, diag_tx));

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut interval = tokio::time::interval(cfg.tick());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Instant::now();
                ppp.tick(now);
                cellular.tick(&mut ppp, now);
                network.tick(&mut ppp, now);
            }
            Some(req) = diag_rx.recv() => {
                let reply = diag::dispatch(&req.command, &network, &mut cellular, &ppp, Instant::now());
                let _ = req.reply.send(reply);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
        }
    }

    server.abort();
    cellular.shutdown(&mut ppp);
    let deadline = Instant::now() + cfg.shutdown_grace();
    loop {
        ppp.tick(Instant::now());
        if ppp.is_stopped() || Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(cfg.tick()).await;
    }
    if !ppp.is_stopped() {
        warn!("PPP still running at exit");
    }
    if let Err(e) = std::fs::remove_file(&cfg.ctl_socket) {
        warn!("cannot remove {}: {e}", cfg.ctl_socket.display());
    }
    Ok(())
}

// ── Logging setup ─────────────────────────────────────────────────────────────

fn setup_logging(use_syslog: bool) -> anyhow::Result<()> {
    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process:  "gateway-netd".into(),
            pid:      process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow::anyhow!("syslog connect failed: {e}"))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|()| log::set_max_level(log::LevelFilter::Info))
            .map_err(|e| anyhow::anyhow!("set_logger: {e}"))?;
    } else {
        env_logger::Builder::new()
            .filter_level(log::LevelFilter::Debug)
            .parse_default_env()
            .init();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctl_words_are_collected() {
        let cli = Cli::parse_from(["gateway-netd", "--stderr", "ctl", "blacklist-add", "310260"]);
        assert!(cli.stderr);
        match cli.command {
            Some(Command::Ctl { words }) => assert_eq!(words, vec!["blacklist-add", "310260"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn daemon_defaults() {
        let cli = Cli::parse_from(["gateway-netd"]);
        assert_eq!(cli.config, PathBuf::from("/etc/gateway-netd.conf"));
        assert!(!cli.uci);
        assert!(cli.command.is_none());
    }
}

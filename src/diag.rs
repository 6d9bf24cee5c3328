//! Diagnostic control socket.
//!
//! One request line per connection, one JSON reply line back.  Connections
//! are served on their own tasks; the command itself is handed to the
//! scheduler loop over an mpsc channel so the state machines are only ever
//! touched between ticks.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

use crate::blacklist::FailureReason;
use crate::cellular::CellularStateMachine;
use crate::error::{NetdError, Result};
use crate::network::NetworkInterfaceManager;
use crate::ppp::PppCoordinator;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_LINE: u64 = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagCommand {
    Interfaces,
    Cellular,
    Blacklist,
    Rescan,
    Reset,
    BlacklistClear,
    BlacklistAdd(String),
}

impl FromStr for DiagCommand {
    type Err = NetdError;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let cmd = match (words.next(), words.next()) {
            (Some("interfaces"), None)      => DiagCommand::Interfaces,
            (Some("cellular"), None)        => DiagCommand::Cellular,
            (Some("blacklist"), None)       => DiagCommand::Blacklist,
            (Some("rescan"), None)          => DiagCommand::Rescan,
            (Some("reset"), None)           => DiagCommand::Reset,
            (Some("blacklist-clear"), None) => DiagCommand::BlacklistClear,
            (Some("blacklist-add"), Some(m)) if is_mccmnc(m) => DiagCommand::BlacklistAdd(m.to_string()),
            (Some("blacklist-add"), _) => {
                return Err(NetdError::Parse("usage: blacklist-add <5 or 6 digit mccmnc>".into()))
            }
            _ => return Err(NetdError::Parse(format!("unknown command {:?}", line.trim()))),
        };
        if words.next().is_some() {
            return Err(NetdError::Parse(format!("trailing arguments in {:?}", line.trim())));
        }
        Ok(cmd)
    }
}

impl fmt::Display for DiagCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagCommand::Interfaces      => f.write_str("interfaces"),
            DiagCommand::Cellular        => f.write_str("cellular"),
            DiagCommand::Blacklist       => f.write_str("blacklist"),
            DiagCommand::Rescan          => f.write_str("rescan"),
            DiagCommand::Reset           => f.write_str("reset"),
            DiagCommand::BlacklistClear  => f.write_str("blacklist-clear"),
            DiagCommand::BlacklistAdd(m) => write!(f, "blacklist-add {m}"),
        }
    }
}

fn is_mccmnc(s: &str) -> bool {
    (5..=6).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit())
}

/// A parsed command waiting for the scheduler loop.
pub struct DiagRequest {
    pub command: DiagCommand,
    pub reply:   oneshot::Sender<Value>,
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Execute `cmd` against the live components and build the reply.
pub fn dispatch(
    cmd:      &DiagCommand,
    network:  &NetworkInterfaceManager,
    cellular: &mut CellularStateMachine,
    ppp:      &PppCoordinator,
    now:      Instant,
) -> Value {
    info!("diag: {cmd}");
    match cmd {
        DiagCommand::Interfaces => json!({ "ok": true, "network": network.snapshot(now) }),
        DiagCommand::Cellular => json!({
            "ok":       true,
            "cellular": cellular.snapshot(now),
            "ppp":      ppp.status(),
        }),
        DiagCommand::Blacklist => json!({
            "ok":        true,
            "threshold": cellular.blacklist().threshold(),
            "entries":   cellular.blacklist().snapshot(now),
        }),
        DiagCommand::Rescan => {
            let queued = cellular.flags().request_rescan();
            json!({ "ok": true, "queued": queued })
        }
        DiagCommand::Reset => {
            cellular.request_reset();
            json!({ "ok": true })
        }
        DiagCommand::BlacklistClear => {
            cellular.blacklist_mut().clear_all();
            json!({ "ok": true })
        }
        DiagCommand::BlacklistAdd(mccmnc) => {
            cellular.blacklist_mut().insert_permanent(mccmnc, FailureReason::Manual, now);
            json!({ "ok": true, "mccmnc": mccmnc })
        }
    }
}

fn error_reply(e: impl fmt::Display) -> Value {
    json!({ "ok": false, "error": e.to_string() })
}

// ── Server ────────────────────────────────────────────────────────────────────

/// Bind the control socket, replacing a stale one left by a previous run.
pub fn bind(path: &Path) -> Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("diag: removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let listener = UnixListener::bind(path)?;
    info!("diag: listening on {}", path.display());
    Ok(listener)
}

/// Accept connections until the channel closes.
pub async fn serve(listener: UnixListener, tx: mpsc::Sender<DiagRequest>) {
    loop {
        let stream = match listener.accept().await {
            Ok((s, _)) => s,
            Err(e) => {
                warn!("diag: accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }
        };
        if tx.is_closed() {
            break;
        }
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(stream, tx).await {
                debug!("diag: connection ended: {e}");
            }
        });
    }
}

async fn handle(stream: UnixStream, tx: mpsc::Sender<DiagRequest>) -> Result<()> {
    let (rd, mut wr) = stream.into_split();
    let mut line = String::new();
    let mut reader = BufReader::new(rd).take(MAX_LINE);
    let n = tokio::time::timeout(REQUEST_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| NetdError::Timeout { command: "diag request".into() })??;
    if n == 0 {
        return Ok(());
    }

    let reply = match line.parse::<DiagCommand>() {
        Ok(command) => {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(DiagRequest { command, reply: reply_tx }).await.is_err() {
                error_reply("daemon shutting down")
            } else {
                reply_rx.await.unwrap_or_else(|_| error_reply("request dropped"))
            }
        }
        Err(e) => error_reply(e),
    };

    let mut out = reply.to_string();
    out.push('\n');
    wr.write_all(out.as_bytes()).await?;
    wr.shutdown().await?;
    Ok(())
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Send one command line to a running daemon and return its reply.
pub async fn request(path: &Path, line: &str) -> anyhow::Result<String> {
    let mut stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("connect to {}", path.display()))?;
    stream.write_all(format!("{line}\n").as_bytes()).await.context("send request")?;

    let mut reply = String::new();
    tokio::time::timeout(REQUEST_TIMEOUT, BufReader::new(stream).read_line(&mut reply))
        .await
        .context("no reply from daemon")?
        .context("read reply")?;
    Ok(reply.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::blacklist::CarrierBlacklist;
    use crate::cellular::{CellularFlags, CellularSettings};
    use crate::config::NetdConfig;
    use crate::gpio::HardwareResetController;
    use crate::health::{new_shared, InterfaceKind, PingHealthChecker};
    use crate::mock::{MockLinks, MockModem, MockNodes, MockPppStatus, MockProber, MockRoutes, MockSupervisor};
    use crate::network::NetworkSettings;
    use crate::serial::SerialPortManager;

    struct Rig {
        net:  NetworkInterfaceManager,
        cell: CellularStateMachine,
        ppp:  PppCoordinator,
    }

    fn rig() -> Rig {
        let cfg = NetdConfig::default();
        let flags = Arc::new(CellularFlags::default());
        let cell_state = new_shared(InterfaceKind::Cellular);
        let checker = PingHealthChecker::new(Arc::new(MockProber::new()), "8.8.8.8", 3, Duration::from_secs(5));
        let net = NetworkInterfaceManager::new(
            vec![
                (InterfaceKind::Ethernet, "eth0".into(), new_shared(InterfaceKind::Ethernet)),
                (InterfaceKind::Cellular, "ppp0".into(), cell_state.clone()),
            ],
            Arc::clone(&flags),
            checker,
            Box::new(MockLinks::default()),
            Box::new(MockRoutes::default()),
            NetworkSettings::from_config(&cfg),
        );
        let cell = CellularStateMachine::new(
            SerialPortManager::new(Box::new(MockModem::new().opener())),
            CarrierBlacklist::new(16, 3, None),
            HardwareResetController::new(
                None,
                Box::new(MockNodes::present()),
                Duration::from_millis(100),
                Duration::from_millis(1000),
            ),
            flags,
            CellularSettings::from_config(&cfg),
        );
        let ppp = PppCoordinator::new(
            "ppp",
            "ppp0",
            Box::new(MockSupervisor::new("ppp")),
            Box::new(MockPppStatus::default()),
            cell_state,
        );
        Rig { net, cell, ppp }
    }

    impl Rig {
        fn run(&mut self, line: &str) -> Value {
            let cmd: DiagCommand = line.parse().unwrap();
            dispatch(&cmd, &self.net, &mut self.cell, &self.ppp, Instant::now())
        }
    }

    #[test]
    fn parses_commands() {
        assert_eq!("interfaces".parse::<DiagCommand>().unwrap(), DiagCommand::Interfaces);
        assert_eq!(" rescan \n".parse::<DiagCommand>().unwrap(), DiagCommand::Rescan);
        assert_eq!(
            "blacklist-add 310260".parse::<DiagCommand>().unwrap(),
            DiagCommand::BlacklistAdd("310260".into())
        );
        assert!("blacklist-add".parse::<DiagCommand>().is_err());
        assert!("blacklist-add 31x26".parse::<DiagCommand>().is_err());
        assert!("reset now".parse::<DiagCommand>().is_err());
        assert!("reboot".parse::<DiagCommand>().is_err());
        assert!("".parse::<DiagCommand>().is_err());
    }

    #[test]
    fn interfaces_reply_lists_every_transport() {
        let mut r = rig();
        let v = r.run("interfaces");
        assert_eq!(v["ok"], true);
        let ifaces = v["network"]["interfaces"].as_array().unwrap();
        assert_eq!(ifaces.len(), 2);
        assert_eq!(ifaces[0]["kind"], "ethernet");
        assert_eq!(ifaces[1]["iface"], "ppp0");
        assert!(v["network"]["active"].is_null());
    }

    #[test]
    fn cellular_reply_includes_ppp_status() {
        let mut r = rig();
        let v = r.run("cellular");
        assert_eq!(v["cellular"]["state"], "Init");
        assert_eq!(v["cellular"]["at_port_open"], false);
        assert_eq!(v["ppp"]["running"], false);
    }

    #[test]
    fn blacklist_commands_edit_the_list() {
        let mut r = rig();
        assert_eq!(r.run("blacklist-add 310260")["ok"], true);
        assert!(r.cell.blacklist().is_blacklisted("310260", Instant::now()));
        let v = r.run("blacklist");
        assert_eq!(v["entries"].as_array().unwrap().len(), 1);
        assert_eq!(v["threshold"], 3);

        r.run("blacklist-clear");
        assert_eq!(r.cell.blacklist().len(), 0);
    }

    #[test]
    fn rescan_is_queued_once() {
        let mut r = rig();
        assert_eq!(r.run("rescan")["queued"], true);
        assert_eq!(r.run("rescan")["queued"], false);
        assert!(r.cell.flags().rescan_requested());
    }

    #[tokio::test]
    async fn socket_round_trip_through_the_scheduler_channel() {
        let dir = std::env::temp_dir().join(format!("gateway-netd-diag-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ctl.sock");

        let listener = bind(&path).unwrap();
        let (tx, mut rx) = mpsc::channel::<DiagRequest>(4);
        tokio::spawn(serve(listener, tx));
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let _ = req.reply.send(json!({ "ok": true, "echo": req.command.to_string() }));
            }
        });

        let reply = request(&path, "blacklist-add 311480").await.unwrap();
        let v: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["echo"], "blacklist-add 311480");

        let reply = request(&path, "bogus").await.unwrap();
        let v: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["ok"], false);

        let _ = std::fs::remove_dir_all(&dir);
    }
}

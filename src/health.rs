//! Per-interface health probing.
//!
//! Each transport has one [`InterfaceState`] behind its own mutex.  A probe
//! task owns the interface for its whole run: it sets `probe_in_progress`
//! under the lock before starting and clears it (together with the new score)
//! when done, even if the task is aborted.  Anything that would tear the link
//! down checks the flag first.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt};
use log::{debug, warn};
use serde::Serialize;

use crate::error::{NetdError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Ethernet,
    Wifi,
    Cellular,
}

impl InterfaceKind {
    /// Static preference: wired over wireless LAN over cellular.
    pub fn preference(self) -> u8 {
        match self {
            InterfaceKind::Ethernet => 2,
            InterfaceKind::Wifi     => 1,
            InterfaceKind::Cellular => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InterfaceKind::Ethernet => "ethernet",
            InterfaceKind::Wifi     => "wifi",
            InterfaceKind::Cellular => "cellular",
        }
    }
}

/// Score given to an interface that has not completed a probe yet.
pub const INITIAL_SCORE: u8 = 5;
pub const MAX_SCORE: u8 = 10;

#[derive(Debug, Clone)]
pub struct InterfaceState {
    pub kind:              InterfaceKind,
    pub active:            bool,
    pub health_score:      u8,
    pub probe_in_progress: bool,
    pub last_probe_time:   Option<Instant>,
    /// Outcome of the most recent completed probe.
    pub last_ok:           Option<bool>,
    /// Completed probe count; lets the manager spot new results.
    pub completed:         u64,
}

pub type SharedInterface = Arc<Mutex<InterfaceState>>;

pub fn new_shared(kind: InterfaceKind) -> SharedInterface {
    Arc::new(Mutex::new(InterfaceState {
        kind,
        active: false,
        health_score: INITIAL_SCORE,
        probe_in_progress: false,
        last_probe_time: None,
        last_ok: None,
        completed: 0,
    }))
}

/// Lock an interface state, recovering from a panicked holder.
pub fn lock_state(state: &SharedInterface) -> MutexGuard<'_, InterfaceState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Ping statistics ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingStats {
    pub transmitted: u32,
    pub received:    u32,
    pub avg_rtt_ms:  Option<f64>,
}

impl PingStats {
    pub fn is_failure(&self) -> bool {
        self.received == 0
    }
}

/// 0–10 score: delivery ratio scaled to 10, minus a latency penalty.
pub fn score(stats: &PingStats) -> u8 {
    if stats.transmitted == 0 || stats.received == 0 {
        return 0;
    }
    let ratio = f64::from(stats.received.min(stats.transmitted)) / f64::from(stats.transmitted);
    let penalty = match stats.avg_rtt_ms {
        Some(rtt) if rtt > 1000.0 => 3.0,
        Some(rtt) if rtt > 500.0  => 2.0,
        Some(rtt) if rtt > 200.0  => 1.0,
        _ => 0.0,
    };
    (ratio * f64::from(MAX_SCORE) - penalty).round().clamp(0.0, f64::from(MAX_SCORE)) as u8
}

/// Parse the summary of iputils or busybox `ping`.
pub fn parse_ping_output(text: &str) -> Option<PingStats> {
    let mut counts = None;
    let mut avg = None;
    for line in text.lines() {
        if line.contains("packets transmitted") {
            let mut parts = line.split(',');
            let tx = leading_number(parts.next()?)?;
            let rx = leading_number(parts.next()?)?;
            counts = Some((tx, rx));
        } else if line.starts_with("rtt") || line.starts_with("round-trip") {
            avg = line
                .split('=')
                .nth(1)
                .and_then(|v| v.trim().split('/').nth(1))
                .and_then(|v| v.trim().parse::<f64>().ok());
        }
    }
    let (transmitted, received) = counts?;
    Some(PingStats { transmitted, received, avg_rtt_ms: avg })
}

fn leading_number(s: &str) -> Option<u32> {
    s.split_whitespace().next()?.parse().ok()
}

// ── Probers ───────────────────────────────────────────────────────────────────

/// Runs one reachability probe through a given interface.
pub trait Prober: Send + Sync {
    fn probe(&self, iface: String, target: String, count: u32, deadline: Duration)
        -> BoxFuture<'static, Result<PingStats>>;
}

/// Probes with the system `ping` bound to the interface.
pub struct PingProber;

impl Prober for PingProber {
    fn probe(&self, iface: String, target: String, count: u32, deadline: Duration)
        -> BoxFuture<'static, Result<PingStats>>
    {
        async move {
            let wait = deadline.as_secs().max(1).to_string();
            let count = count.to_string();
            let out = tokio::process::Command::new("ping")
                .args(["-n", "-q", "-I", &iface, "-c", &count, "-w", &wait, &target])
                .kill_on_drop(true)
                .output()
                .await?;
            let text = String::from_utf8_lossy(&out.stdout);
            parse_ping_output(&text)
                .ok_or_else(|| NetdError::Parse(format!("ping via {iface}: no summary")))
        }
        .boxed()
    }
}

// ── Checker ───────────────────────────────────────────────────────────────────

/// Clears `probe_in_progress` however the probe task ends.
struct ProbeGuard {
    state: SharedInterface,
}

impl ProbeGuard {
    fn finish(&self, score: u8, ok: bool) {
        let mut s = lock_state(&self.state);
        s.health_score = score;
        s.last_ok = Some(ok);
        s.completed += 1;
        s.probe_in_progress = false;
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        lock_state(&self.state).probe_in_progress = false;
    }
}

pub struct PingHealthChecker {
    prober:   Arc<dyn Prober>,
    target:   String,
    count:    u32,
    deadline: Duration,
}

impl PingHealthChecker {
    pub fn new(prober: Arc<dyn Prober>, target: &str, count: u32, deadline: Duration) -> Self {
        Self { prober, target: target.to_string(), count, deadline }
    }

    /// Start a probe of `iface` unless one is already running.  Returns
    /// whether a probe was started.  Must be called inside a tokio runtime.
    pub fn spawn_probe(&self, iface: &str, state: &SharedInterface, now: Instant) -> bool {
        {
            let mut s = lock_state(state);
            if s.probe_in_progress {
                return false;
            }
            s.probe_in_progress = true;
            s.last_probe_time = Some(now);
        }

        let guard = ProbeGuard { state: Arc::clone(state) };
        let fut = self.prober.probe(iface.to_string(), self.target.clone(), self.count, self.deadline);
        let deadline = self.deadline;
        let iface = iface.to_string();

        tokio::spawn(async move {
            match tokio::time::timeout(deadline, fut).await {
                Ok(Ok(stats)) => {
                    let sc = score(&stats);
                    debug!(
                        "probe {iface}: {}/{} replies, avg {:?} ms, score {sc}",
                        stats.received, stats.transmitted, stats.avg_rtt_ms
                    );
                    guard.finish(sc, !stats.is_failure());
                }
                Ok(Err(e)) => {
                    warn!("probe {iface} failed: {e}");
                    guard.finish(0, false);
                }
                Err(_) => {
                    warn!("probe {iface} exceeded {deadline:?}");
                    guard.finish(0, false);
                }
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProber;

    const IPUTILS: &str = "\
PING 8.8.8.8 (8.8.8.8) from 10.0.0.2 eth0: 56(84) bytes of data.

--- 8.8.8.8 ping statistics ---
3 packets transmitted, 2 received, 33.3333% packet loss, time 2003ms
rtt min/avg/max/mdev = 11.201/12.345/13.532/0.951 ms
";

    const BUSYBOX: &str = "\
--- 8.8.8.8 ping statistics ---
3 packets transmitted, 0 packets received, 100% packet loss
";

    #[test]
    fn parses_iputils_and_busybox() {
        let s = parse_ping_output(IPUTILS).unwrap();
        assert_eq!((s.transmitted, s.received), (3, 2));
        assert_eq!(s.avg_rtt_ms, Some(12.345));
        let b = parse_ping_output(BUSYBOX).unwrap();
        assert!(b.is_failure());
        assert_eq!(b.avg_rtt_ms, None);
    }

    #[test]
    fn scoring() {
        let full = PingStats { transmitted: 3, received: 3, avg_rtt_ms: Some(20.0) };
        let slow = PingStats { avg_rtt_ms: Some(1500.0), ..full };
        let lossy = PingStats { received: 2, ..full };
        let dead = PingStats { received: 0, ..full };
        assert_eq!(score(&full), 10);
        assert_eq!(score(&slow), 7);
        assert_eq!(score(&lossy), 7);
        assert_eq!(score(&dead), 0);
    }

    #[tokio::test]
    async fn one_probe_at_a_time_and_flag_cleared_after() {
        let prober = MockProber::new();
        prober.hold(true);
        let checker = PingHealthChecker::new(Arc::new(prober.clone()), "8.8.8.8", 3, Duration::from_secs(5));
        let state = new_shared(InterfaceKind::Ethernet);
        let now = Instant::now();

        assert!(checker.spawn_probe("eth0", &state, now));
        assert!(lock_state(&state).probe_in_progress);
        assert!(!checker.spawn_probe("eth0", &state, now));

        prober.release(PingStats { transmitted: 3, received: 3, avg_rtt_ms: Some(10.0) });
        for _ in 0..100 {
            if !lock_state(&state).probe_in_progress { break; }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let s = lock_state(&state);
        assert!(!s.probe_in_progress);
        assert_eq!(s.health_score, 10);
        assert_eq!(s.last_ok, Some(true));
        assert_eq!(s.completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_scores_zero() {
        let prober = MockProber::new();
        prober.hold(true);
        let checker = PingHealthChecker::new(Arc::new(prober), "8.8.8.8", 3, Duration::from_secs(2));
        let state = new_shared(InterfaceKind::Wifi);
        assert!(checker.spawn_probe("wlan0", &state, Instant::now()));
        tokio::time::sleep(Duration::from_secs(3)).await;
        let s = lock_state(&state);
        assert!(!s.probe_in_progress);
        assert_eq!(s.health_score, 0);
        assert_eq!(s.last_ok, Some(false));
    }
}

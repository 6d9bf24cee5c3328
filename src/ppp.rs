//! PPP session lifecycle.
//!
//! The coordinator is the only component that issues stop or kill signals to
//! the PPP child.  Callers *request* a stop; the request is executed on the
//! next tick in which no health probe is running on the cellular interface,
//! so a probe never has its link pulled out from under it.

use std::net::Ipv4Addr;
use std::time::Instant;

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::Result;
use crate::health::{lock_state, SharedInterface};
use crate::supervisor::ProcessSupervisor;
use crate::util;

/// Where the coordinator learns about the PPP network interface.
pub trait PppStatusSource: Send {
    fn interface_present(&self, iface: &str) -> bool;
    fn ip_address(&self, iface: &str) -> Option<Ipv4Addr>;
}

/// Reads sysfs and the interface address list.
pub struct SysPppStatus;

impl PppStatusSource for SysPppStatus {
    fn interface_present(&self, iface: &str) -> bool {
        util::interface_exists(iface)
    }

    fn ip_address(&self, iface: &str) -> Option<Ipv4Addr> {
        util::interface_ipv4(iface)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopKind {
    Term,
    Kill,
}

/// Serializable PPP status.
#[derive(Debug, Clone, Serialize)]
pub struct PppStatus {
    pub running:              bool,
    pub autorestart:          bool,
    pub interface_present:    bool,
    pub ip:                   Option<String>,
    pub last_exit_code:       Option<i32>,
    pub consecutive_failures: u32,
    pub stop_pending:         bool,
}

pub struct PppCoordinator {
    child:       String,
    iface:       String,
    supervisor:  Box<dyn ProcessSupervisor>,
    status:      Box<dyn PppStatusSource>,
    cellular:    SharedInterface,
    pending:     Option<StopKind>,
    /// An IP was seen since the child last (re)started.
    established: bool,
    last_exit_code:       Option<i32>,
    consecutive_failures: u32,
    unreported_failures:  u32,
    /// A session came up since the last `take_established`.
    new_session:          bool,
}

impl PppCoordinator {
    pub fn new(
        child:      &str,
        iface:      &str,
        supervisor: Box<dyn ProcessSupervisor>,
        status:     Box<dyn PppStatusSource>,
        cellular:   SharedInterface,
    ) -> Self {
        Self {
            child: child.to_string(),
            iface: iface.to_string(),
            supervisor,
            status,
            cellular,
            pending: None,
            established: false,
            last_exit_code: None,
            consecutive_failures: 0,
            unreported_failures: 0,
            new_session: false,
        }
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    /// Start the session if it is not already running.  Cancels a stop that
    /// has not been executed yet.
    pub fn start(&mut self) -> Result<()> {
        if self.pending.take().is_some() {
            info!("ppp: pending stop cancelled by start");
        }
        if self.supervisor.is_running(&self.child) {
            return Ok(());
        }
        info!("ppp: starting {}", self.child);
        self.established = false;
        self.supervisor.start(&self.child)
    }

    /// Ask for a polite stop, executed cooperatively by [`PppCoordinator::tick`].
    pub fn request_stop(&mut self) {
        if self.pending.is_none() {
            info!("ppp: stop requested");
            self.pending = Some(StopKind::Term);
        }
    }

    /// Ask for an unconditional kill, executed cooperatively.
    pub fn request_kill(&mut self) {
        if self.pending != Some(StopKind::Kill) {
            warn!("ppp: force kill requested");
            self.pending = Some(StopKind::Kill);
        }
    }

    pub fn disable_autorestart(&mut self) -> Result<()> {
        self.supervisor.set_autorestart(&self.child, false)
    }

    pub fn enable_autorestart(&mut self) -> Result<()> {
        self.supervisor.set_autorestart(&self.child, true)
    }

    pub fn autorestart(&self) -> bool {
        self.supervisor.autorestart(&self.child)
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running(&self.child)
    }

    /// Child gone and no stop still waiting to be executed.
    pub fn is_stopped(&self) -> bool {
        !self.is_running() && self.pending.is_none()
    }

    pub fn stop_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn interface_present(&self) -> bool {
        self.status.interface_present(&self.iface)
    }

    pub fn ip_address(&self) -> Option<Ipv4Addr> {
        self.status.ip_address(&self.iface)
    }

    /// Running with an address on the PPP interface.
    pub fn is_up(&self) -> bool {
        self.is_running() && self.ip_address().is_some()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// True once per session that reached an IP address.
    pub fn take_established(&mut self) -> bool {
        std::mem::take(&mut self.new_session)
    }

    /// Establishment failures seen since the last call.
    pub fn take_new_failures(&mut self) -> u32 {
        std::mem::take(&mut self.unreported_failures)
    }

    /// Forget failure history (new carrier or after a modem reset).
    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
        self.unreported_failures = 0;
        self.new_session = false;
    }

    /// Reap exits, account failures, and execute a pending stop when no
    /// probe is using the link.
    pub fn tick(&mut self, now: Instant) {
        for exit in self.supervisor.poll(now) {
            if exit.child != self.child {
                continue;
            }
            self.last_exit_code = exit.code;
            if !exit.requested && !self.established {
                self.consecutive_failures += 1;
                self.unreported_failures += 1;
                warn!(
                    "ppp: session establishment failed (exit {:?}, {} in a row)",
                    exit.code, self.consecutive_failures
                );
            }
            self.established = false;
        }

        if let Some(kind) = self.pending {
            if lock_state(&self.cellular).probe_in_progress {
                debug!("ppp: stop deferred, probe in progress on {}", self.iface);
            } else {
                self.pending = None;
                let result = match kind {
                    StopKind::Term => self.supervisor.stop(&self.child),
                    StopKind::Kill => self.supervisor.kill(&self.child),
                };
                match result {
                    Ok(()) => info!("ppp: {:?} issued", kind),
                    Err(e) => warn!("ppp: stop failed: {e}"),
                }
            }
        }

        if !self.established && self.is_running() && self.ip_address().is_some() {
            info!("ppp: session up on {}", self.iface);
            self.established = true;
            self.consecutive_failures = 0;
            self.new_session = true;
        }
    }

    pub fn status(&self) -> PppStatus {
        PppStatus {
            running:              self.is_running(),
            autorestart:          self.autorestart(),
            interface_present:    self.status.interface_present(&self.iface),
            ip:                   self.ip_address().map(|ip| ip.to_string()),
            last_exit_code:       self.last_exit_code,
            consecutive_failures: self.consecutive_failures,
            stop_pending:         self.pending.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{new_shared, InterfaceKind};
    use crate::mock::{MockPppStatus, MockSupervisor};

    struct Rig {
        sup:      MockSupervisor,
        net:      MockPppStatus,
        cellular: SharedInterface,
        ppp:      PppCoordinator,
    }

    fn rig() -> Rig {
        let sup = MockSupervisor::new("ppp");
        let net = MockPppStatus::default();
        let cellular = new_shared(InterfaceKind::Cellular);
        let ppp = PppCoordinator::new(
            "ppp",
            "ppp0",
            Box::new(sup.clone()),
            Box::new(net.clone()),
            cellular.clone(),
        );
        Rig { sup, net, cellular, ppp }
    }

    #[test]
    fn stop_is_deferred_while_probe_runs() {
        let mut r = rig();
        let now = Instant::now();
        r.ppp.start().unwrap();
        lock_state(&r.cellular).probe_in_progress = true;
        r.ppp.request_stop();
        r.ppp.tick(now);
        assert!(r.sup.signals().is_empty());
        assert!(!r.ppp.is_stopped());

        lock_state(&r.cellular).probe_in_progress = false;
        r.ppp.tick(now);
        assert_eq!(r.sup.signals(), vec!["stop"]);
    }

    #[test]
    fn start_cancels_unexecuted_stop() {
        let mut r = rig();
        r.ppp.start().unwrap();
        r.ppp.request_stop();
        r.ppp.start().unwrap();
        r.ppp.tick(Instant::now());
        assert!(r.sup.signals().is_empty());
        assert_eq!(r.sup.starts(), 1);
    }

    #[test]
    fn unrequested_exit_before_ip_counts_as_failure() {
        let mut r = rig();
        let now = Instant::now();
        r.ppp.start().unwrap();
        r.sup.exit(Some(8));
        r.ppp.tick(now);
        assert_eq!(r.ppp.consecutive_failures(), 1);
        assert_eq!(r.ppp.take_new_failures(), 1);
        assert_eq!(r.ppp.take_new_failures(), 0);
        assert_eq!(r.ppp.status().last_exit_code, Some(8));
    }

    #[test]
    fn ip_assignment_clears_failures_and_requested_exit_is_not_counted() {
        let mut r = rig();
        let now = Instant::now();
        r.ppp.start().unwrap();
        r.sup.exit(Some(8));
        r.ppp.tick(now);
        r.ppp.start().unwrap();
        r.net.set_ip(Some(Ipv4Addr::new(10, 64, 1, 2)));
        r.ppp.tick(now);
        assert_eq!(r.ppp.consecutive_failures(), 0);
        assert!(r.ppp.is_up());

        r.ppp.disable_autorestart().unwrap();
        r.ppp.request_stop();
        r.ppp.tick(now);
        r.net.set_ip(None);
        r.ppp.tick(now);
        assert_eq!(r.ppp.consecutive_failures(), 0);
        assert!(r.ppp.is_stopped());
    }

    #[test]
    fn every_respawned_session_is_reported_once() {
        let mut r = rig();
        let now = Instant::now();
        r.ppp.start().unwrap();
        r.net.set_ip(Some(Ipv4Addr::new(10, 64, 1, 2)));
        r.ppp.tick(now);
        assert!(r.ppp.take_established());
        r.ppp.tick(now);
        assert!(!r.ppp.take_established());

        r.net.set_ip(None);
        r.sup.exit(Some(16));
        r.ppp.tick(now);
        r.net.set_ip(Some(Ipv4Addr::new(10, 64, 1, 3)));
        r.ppp.tick(now);
        assert!(r.ppp.take_established());
    }
}

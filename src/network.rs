//! Default-route selection across Ethernet, Wi-Fi and cellular.
//!
//! Every tick the manager refreshes link availability, starts due health
//! probes, folds finished probe results into per-interface failure counters
//! and keeps exactly one interface as the default route.  Cellular is only a
//! candidate while the state machine reports it ready and not scanning; while
//! a scan runs, failed cellular probes still update the score but are not
//! counted, and nothing here touches PPP.

use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::cellular::CellularFlags;
use crate::config::NetdConfig;
use crate::error::{NetdError, Result};
use crate::health::{lock_state, InterfaceKind, PingHealthChecker, SharedInterface};
use crate::ppp::PppCoordinator;
use crate::util;

/// Physical link state of LAN interfaces.
pub trait LinkMonitor: Send {
    fn link_up(&self, iface: &str) -> bool;
    fn gateway(&self, iface: &str) -> Option<Ipv4Addr>;
}

/// Installs and removes the default route.
pub trait RouteControl: Send {
    /// Point the default route at `iface`, via `gateway` when it has one.
    fn set_default(&mut self, iface: &str, gateway: Option<Ipv4Addr>) -> Result<()>;
    fn clear_default(&mut self) -> Result<()>;
}

/// sysfs carrier plus `/proc/net/route`.
pub struct SysLinks;

impl LinkMonitor for SysLinks {
    fn link_up(&self, iface: &str) -> bool {
        util::interface_exists(iface)
            && util::has_carrier(iface)
            && util::read_operstate(iface).map_or(true, |s| s != "down")
    }

    fn gateway(&self, iface: &str) -> Option<Ipv4Addr> {
        util::interface_gateway(iface)
    }
}

/// `ip route replace default ...` / `ip route del default`.
pub struct IpRoute;

impl IpRoute {
    fn run(args: &[String]) -> Result<()> {
        let out = Command::new("ip").args(args).output()?;
        if out.status.success() {
            Ok(())
        } else {
            Err(NetdError::Config(format!(
                "ip {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            )))
        }
    }
}

impl RouteControl for IpRoute {
    fn set_default(&mut self, iface: &str, gateway: Option<Ipv4Addr>) -> Result<()> {
        let mut args = vec!["route".to_string(), "replace".into(), "default".into()];
        if let Some(gw) = gateway {
            args.push("via".into());
            args.push(gw.to_string());
        }
        args.push("dev".into());
        args.push(iface.to_string());
        Self::run(&args)
    }

    fn clear_default(&mut self) -> Result<()> {
        Self::run(&["route".into(), "del".into(), "default".into()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SelectionPhase {
    Init,
    SelectInterface,
    Online,
    HealthDegraded,
}

struct Slot {
    kind:       InterfaceKind,
    iface:      String,
    state:      SharedInterface,
    available:  bool,
    failures:   u32,
    seen:       u64,
    next_probe: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceSnapshot {
    pub kind:              InterfaceKind,
    pub iface:             String,
    pub available:         bool,
    pub active:            bool,
    pub health_score:      u8,
    pub probe_in_progress: bool,
    pub consecutive_failures: u32,
    pub last_probe_secs_ago: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkSnapshot {
    pub phase:      SelectionPhase,
    pub active:     Option<InterfaceKind>,
    pub interfaces: Vec<InterfaceSnapshot>,
}

pub struct NetworkSettings {
    pub probe_interval:   Duration,
    pub fail_threshold:   u32,
    pub min_usable_score: u8,
    pub ip_timeout:       Duration,
}

impl NetworkSettings {
    pub fn from_config(cfg: &NetdConfig) -> Self {
        Self {
            probe_interval:   Duration::from_secs(cfg.probe_interval),
            fail_threshold:   cfg.health_fail_threshold.max(1),
            min_usable_score: cfg.min_usable_score,
            ip_timeout:       Duration::from_secs(cfg.ip_timeout),
        }
    }
}

pub struct NetworkInterfaceManager {
    slots:    Vec<Slot>,
    phase:    SelectionPhase,
    active:   Option<InterfaceKind>,
    flags:    Arc<CellularFlags>,
    checker:  PingHealthChecker,
    links:    Box<dyn LinkMonitor>,
    routes:   Box<dyn RouteControl>,
    settings: NetworkSettings,
    /// Since when cellular has been ready with PPP running but no address.
    ip_wait_since: Option<Instant>,
}

impl NetworkInterfaceManager {
    /// `interfaces` lists each transport with its interface name and state;
    /// the cellular entry's state must be the one the PPP coordinator checks.
    pub fn new(
        interfaces: Vec<(InterfaceKind, String, SharedInterface)>,
        flags:      Arc<CellularFlags>,
        checker:    PingHealthChecker,
        links:      Box<dyn LinkMonitor>,
        routes:     Box<dyn RouteControl>,
        settings:   NetworkSettings,
    ) -> Self {
        let slots = interfaces
            .into_iter()
            .map(|(kind, iface, state)| Slot {
                kind,
                iface,
                state,
                available: false,
                failures: 0,
                seen: 0,
                next_probe: None,
            })
            .collect();
        Self {
            slots,
            phase: SelectionPhase::Init,
            active: None,
            flags,
            checker,
            links,
            routes,
            settings,
            ip_wait_since: None,
        }
    }

    pub fn phase(&self) -> SelectionPhase {
        self.phase
    }

    pub fn active(&self) -> Option<InterfaceKind> {
        self.active
    }

    pub fn tick(&mut self, ppp: &mut PppCoordinator, now: Instant) {
        self.refresh_availability(ppp);
        self.drive_ppp(ppp, now);
        self.start_probes(now);
        self.collect_results();

        let next = match self.phase {
            SelectionPhase::Init => {
                info!("network: interface selection starting");
                SelectionPhase::SelectInterface
            }
            SelectionPhase::SelectInterface | SelectionPhase::HealthDegraded => self.select(),
            SelectionPhase::Online => {
                if self.best() != self.active {
                    SelectionPhase::SelectInterface
                } else {
                    SelectionPhase::Online
                }
            }
        };
        if next != self.phase {
            debug!("network: {:?} -> {:?}", self.phase, next);
            self.phase = next;
        }
    }

    fn refresh_availability(&mut self, ppp: &PppCoordinator) {
        let cellular_usable = self.flags.is_ready() && !self.flags.scanning() && ppp.is_up();
        for slot in &mut self.slots {
            let available = match slot.kind {
                InterfaceKind::Cellular => cellular_usable,
                _ => self.links.link_up(&slot.iface),
            };
            if available != slot.available {
                info!("network: {} {}", slot.iface, if available { "available" } else { "unavailable" });
                slot.available = available;
                slot.failures = 0;
                // Probe a newly available link right away.
                slot.next_probe = None;
            }
        }
    }

    /// PPP start and the missing-address watchdog.  Nothing happens while the
    /// cellular machine is scanning or not ready.
    fn drive_ppp(&mut self, ppp: &mut PppCoordinator, now: Instant) {
        if self.flags.scanning() || !self.flags.is_ready() {
            self.ip_wait_since = None;
            return;
        }
        if !ppp.is_running() && !ppp.stop_pending() {
            info!("network: cellular ready, starting PPP");
            if let Err(e) = ppp.start() {
                warn!("network: PPP start failed: {e}");
            }
        }
        if ppp.is_running() && ppp.ip_address().is_none() {
            let since = *self.ip_wait_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= self.settings.ip_timeout {
                if self.flags.request_link_reset() {
                    warn!("network: no address on {} after {:?}, link reset requested", ppp.iface(), self.settings.ip_timeout);
                }
                self.ip_wait_since = None;
            }
        } else {
            self.ip_wait_since = None;
        }
    }

    fn start_probes(&mut self, now: Instant) {
        for slot in &mut self.slots {
            if !slot.available || slot.next_probe.is_some_and(|t| now < t) {
                continue;
            }
            if self.checker.spawn_probe(&slot.iface, &slot.state, now) {
                debug!("network: probing {}", slot.iface);
            }
            slot.next_probe = Some(now + self.settings.probe_interval);
        }
    }

    fn collect_results(&mut self) {
        let scanning = self.flags.scanning();
        for slot in &mut self.slots {
            let (completed, last_ok, score) = {
                let s = lock_state(&slot.state);
                (s.completed, s.last_ok, s.health_score)
            };
            if completed == slot.seen {
                continue;
            }
            slot.seen = completed;

            match last_ok {
                Some(false) if slot.kind == InterfaceKind::Cellular && scanning => {
                    debug!("network: cellular probe failure masked during scan (score {score})");
                }
                Some(false) => {
                    slot.failures += 1;
                    warn!("network: {} probe failed ({} in a row, score {score})", slot.iface, slot.failures);
                }
                _ => slot.failures = 0,
            }

            if slot.failures < self.settings.fail_threshold || self.active != Some(slot.kind) {
                continue;
            }
            slot.failures = 0;
            warn!("network: active interface {} degraded", slot.iface);
            self.phase = SelectionPhase::HealthDegraded;
            if slot.kind == InterfaceKind::Cellular
                && !scanning
                && !self.flags.rescan_requested()
                && self.flags.request_rescan()
            {
                info!("network: cellular rescan requested");
            }
        }
    }

    /// Ranking key: usable interfaces first, then static preference plus the
    /// live score.  Earlier slots win ties.
    fn rank(&self, slot: &Slot) -> (bool, u32) {
        let score = lock_state(&slot.state).health_score;
        (
            score >= self.settings.min_usable_score,
            u32::from(slot.kind.preference()) * 10 + u32::from(score),
        )
    }

    fn best(&self) -> Option<InterfaceKind> {
        let mut best: Option<(&Slot, (bool, u32))> = None;
        for slot in self.slots.iter().filter(|s| s.available) {
            let key = self.rank(slot);
            if best.as_ref().map_or(true, |(_, b)| key > *b) {
                best = Some((slot, key));
            }
        }
        best.map(|(s, _)| s.kind)
    }

    fn select(&mut self) -> SelectionPhase {
        let Some(kind) = self.best() else {
            if self.active.take().is_some() {
                warn!("network: no interface available");
                self.mark_active(None);
                if let Err(e) = self.routes.clear_default() {
                    warn!("network: cannot remove default route: {e}");
                }
            }
            return SelectionPhase::SelectInterface;
        };
        if self.active == Some(kind) {
            return SelectionPhase::Online;
        }

        let Some(slot) = self.slots.iter().find(|s| s.kind == kind) else {
            return SelectionPhase::SelectInterface;
        };
        let gateway = match kind {
            InterfaceKind::Cellular => None,
            _ => self.links.gateway(&slot.iface),
        };
        let iface = slot.iface.clone();
        match self.routes.set_default(&iface, gateway) {
            Ok(()) => {
                info!("network: default route via {iface} ({})", kind.as_str());
                self.active = Some(kind);
                self.mark_active(Some(kind));
                SelectionPhase::Online
            }
            Err(e) => {
                warn!("network: cannot route via {iface}: {e}");
                SelectionPhase::SelectInterface
            }
        }
    }

    fn mark_active(&self, kind: Option<InterfaceKind>) {
        for slot in &self.slots {
            lock_state(&slot.state).active = Some(slot.kind) == kind;
        }
    }

    pub fn snapshot(&self, now: Instant) -> NetworkSnapshot {
        NetworkSnapshot {
            phase:  self.phase,
            active: self.active,
            interfaces: self
                .slots
                .iter()
                .map(|slot| {
                    let s = lock_state(&slot.state);
                    InterfaceSnapshot {
                        kind:                 slot.kind,
                        iface:                slot.iface.clone(),
                        available:            slot.available,
                        active:               s.active,
                        health_score:         s.health_score,
                        probe_in_progress:    s.probe_in_progress,
                        consecutive_failures: slot.failures,
                        last_probe_secs_ago:  s.last_probe_time.map(|t| now.saturating_duration_since(t).as_secs()),
                    }
                })
                .collect(),
        }
    }
}

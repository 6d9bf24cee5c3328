//! Cellular connection state machine.
//!
//! Owns the AT port, the carrier blacklist and the modem reset line.  Each
//! [`CellularStateMachine::tick`] performs at most one non-blocking step; AT
//! exchanges span as many ticks as the modem needs.  The network interface
//! manager talks to this machine only through [`CellularFlags`] and the PPP
//! coordinator.

pub mod flags;
pub mod scan;
pub mod state;

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::at::{self, CurrentOperator};
use crate::blacklist::{CarrierBlacklist, EntrySnapshot, FailureReason};
use crate::config::NetdConfig;
use crate::error::NetdError;
use crate::gpio::{HardwareResetController, PulsePoll};
use crate::ppp::PppCoordinator;
use crate::serial::{AtPoll, SerialPortManager};

pub use flags::{CellularFlags, FlagSnapshot};
use scan::{is_candidate, select_best, CarrierRecord};
pub use state::CellularState;
use state::{ConnectStep, OnlineQuery, ScanConnectPhase};

const HANDSHAKE: [&str; 4] = [at::ATTENTION, at::ECHO_OFF, at::VERBOSE_ERRORS, at::NUMERIC_FORMAT];
const REGISTRATION_POLL: Duration = Duration::from_secs(2);
const RETRY_DELAY: Duration = Duration::from_secs(10);
const LINK_RESET_DELAY: Duration = Duration::from_secs(2);
/// Unanswered AT commands in a row before the modem is considered hung.
const AT_TIMEOUT_LIMIT: u32 = 3;

/// Timing and threshold knobs, taken from [`NetdConfig`].
#[derive(Debug, Clone)]
pub struct CellularSettings {
    pub at_timeout:              Duration,
    pub scan_timeout:            Duration,
    pub select_timeout:          Duration,
    pub register_timeout:        Duration,
    pub signal_settle:           Duration,
    pub online_check:            Duration,
    pub ip_timeout:              Duration,
    pub supervisor_settle:       Duration,
    pub verify_timeout:          Duration,
    pub verify_attempts:         u32,
    pub scan_backoff:            Duration,
    pub boot_wait:               Duration,
    pub reset_attempts:          u32,
    pub reset_cooldown:          Duration,
    pub at_write_fail_threshold: u32,
    pub ppp_fail_threshold:      u32,
}

impl CellularSettings {
    pub fn from_config(cfg: &NetdConfig) -> Self {
        Self {
            at_timeout:              Duration::from_secs(cfg.at_timeout),
            scan_timeout:            Duration::from_secs(cfg.scan_timeout),
            select_timeout:          Duration::from_secs(cfg.select_timeout),
            register_timeout:        Duration::from_secs(cfg.register_timeout),
            signal_settle:           Duration::from_millis(cfg.signal_settle_ms),
            online_check:            Duration::from_secs(cfg.online_check_interval),
            ip_timeout:              Duration::from_secs(cfg.ip_timeout),
            supervisor_settle:       Duration::from_millis(cfg.supervisor_settle_ms),
            verify_timeout:          Duration::from_secs(cfg.verify_timeout),
            verify_attempts:         cfg.verify_attempts.max(1),
            scan_backoff:            Duration::from_secs(cfg.scan_backoff),
            boot_wait:               Duration::from_secs(cfg.boot_wait),
            reset_attempts:          cfg.reset_attempts.max(1),
            reset_cooldown:          Duration::from_secs(cfg.reset_cooldown),
            at_write_fail_threshold: cfg.at_write_fail_threshold.max(1),
            ppp_fail_threshold:      cfg.ppp_fail_threshold.max(1),
        }
    }
}

/// Diagnostic view of the machine.
#[derive(Debug, Clone, Serialize)]
pub struct CellularSnapshot {
    pub state:           String,
    pub carrier:         Option<String>,
    pub signal_csq:      Option<u8>,
    pub rssi_dbm:        Option<i32>,
    pub flags:           FlagSnapshot,
    pub at_port_open:    bool,
    pub reset_line:      bool,
    pub at_write_failures: u32,
    pub hardware_resets: u32,
    pub fatal:           Option<String>,
    pub last_scan:       Vec<CarrierRecord>,
    pub blacklist:       Vec<EntrySnapshot>,
}

pub struct CellularStateMachine {
    state:     CellularState,
    serial:    SerialPortManager,
    blacklist: CarrierBlacklist,
    reset:     HardwareResetController,
    flags:     Arc<CellularFlags>,
    settings:  CellularSettings,
    /// MCCMNC the modem is registered on.
    current_carrier: Option<String>,
    /// Carrier chosen by the last successful scan, re-selected on reconnect.
    preferred:       Option<(String, Option<u8>)>,
    signal_csq:      Option<u8>,
    at_timeouts:     u32,
    last_scan_end:   Option<Instant>,
    last_scan:       Vec<CarrierRecord>,
    reset_requested: bool,
    resets:          u32,
    fatal:           Option<String>,
}

impl CellularStateMachine {
    pub fn new(
        serial:    SerialPortManager,
        blacklist: CarrierBlacklist,
        reset:     HardwareResetController,
        flags:     Arc<CellularFlags>,
        settings:  CellularSettings,
    ) -> Self {
        Self {
            state: CellularState::Init,
            serial,
            blacklist,
            reset,
            flags,
            settings,
            current_carrier: None,
            preferred: None,
            signal_csq: None,
            at_timeouts: 0,
            last_scan_end: None,
            last_scan: Vec::new(),
            reset_requested: false,
            resets: 0,
            fatal: None,
        }
    }

    pub fn state(&self) -> &CellularState {
        &self.state
    }

    pub fn flags(&self) -> &Arc<CellularFlags> {
        &self.flags
    }

    pub fn blacklist(&self) -> &CarrierBlacklist {
        &self.blacklist
    }

    pub fn blacklist_mut(&mut self) -> &mut CarrierBlacklist {
        &mut self.blacklist
    }

    pub fn current_carrier(&self) -> Option<&str> {
        self.current_carrier.as_deref()
    }

    /// Hardware resets started since startup.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// Force a hardware reset on the next tick.
    pub fn request_reset(&mut self) {
        info!("cellular: hardware reset requested");
        self.reset_requested = true;
    }

    /// Close the AT port and release PPP before the process exits.
    pub fn shutdown(&mut self, ppp: &mut PppCoordinator) {
        if self.state.is_scan() {
            info!("cellular: abandoning operator scan");
            self.flags.set_scanning(false);
        }
        self.flags.set_ready(false);
        if let Err(e) = ppp.disable_autorestart() {
            warn!("cellular: {e}");
        }
        ppp.request_kill();
        self.serial.close();
    }

    pub fn snapshot(&self, now: Instant) -> CellularSnapshot {
        CellularSnapshot {
            state:             self.state.to_string(),
            carrier:           self.current_carrier.clone(),
            signal_csq:        self.signal_csq,
            rssi_dbm:          self.signal_csq.and_then(at::csq_to_dbm),
            flags:             self.flags.snapshot(),
            at_port_open:      self.serial.is_open(),
            reset_line:        self.reset.has_line(),
            at_write_failures: self.serial.write_failures(),
            hardware_resets:   self.resets,
            fatal:             self.fatal.clone(),
            last_scan:         self.last_scan.clone(),
            blacklist:         self.blacklist.snapshot(now),
        }
    }

    /// Advance by one step.  `ppp` must already have been ticked for `now`.
    pub fn tick(&mut self, ppp: &mut PppCoordinator, now: Instant) {
        let current = std::mem::replace(&mut self.state, CellularState::Init);
        let from = current.to_string();

        let next = match self.resource_fault(&current) {
            Some(reason) => self.begin_reset(ppp, &reason, now),
            None         => self.step(current, ppp, now),
        };

        let to = next.to_string();
        if from != to {
            info!("cellular: {from} -> {to}");
            self.serial.cancel();
        }
        self.state = next;
    }

    /// Conditions that preempt any non-recovery state.
    fn resource_fault(&mut self, state: &CellularState) -> Option<String> {
        if state.is_recovery() {
            if std::mem::take(&mut self.reset_requested) {
                info!("cellular: reset already in progress");
            }
            return None;
        }
        if std::mem::take(&mut self.reset_requested) {
            return Some("requested".into());
        }
        if !self.serial.is_open() {
            return None;
        }
        let failures = self.serial.write_failures();
        if failures >= self.settings.at_write_fail_threshold {
            return Some(format!("{failures} consecutive AT write failures"));
        }
        if !self.reset.data_port_present() {
            return Some("PPP data port disappeared".into());
        }
        None
    }

    fn step(&mut self, state: CellularState, ppp: &mut PppCoordinator, now: Instant) -> CellularState {
        match state {
            CellularState::Init => self.init(ppp, now),

            CellularState::Connecting { step, deadline } => self.connecting(ppp, step, deadline, now),

            CellularState::SetupOperator => self.setup_operator(ppp, now),

            CellularState::Online { next_check, query } => self.online(ppp, next_check, query, now),

            CellularState::Disconnected { retry_at, detach } => self.disconnected(ppp, retry_at, detach, now),

            CellularState::ScanStopPpp { issue_at } => {
                if now < issue_at {
                    return CellularState::ScanStopPpp { issue_at };
                }
                ppp.request_stop();
                CellularState::ScanWaitSupervisorDown
            }

            CellularState::ScanWaitSupervisorDown => {
                // The coordinator holds the stop while a probe runs on the link.
                if ppp.stop_pending() {
                    CellularState::ScanWaitSupervisorDown
                } else {
                    CellularState::ScanVerifyStopped { deadline: now + self.settings.verify_timeout, attempt: 1 }
                }
            }

            CellularState::ScanVerifyStopped { deadline, attempt } => self.verify_stopped(ppp, deadline, attempt, now),

            CellularState::ScanGetOperators => self.get_operators(ppp, now),

            CellularState::ScanTestCarrier { carriers, index } => self.test_carrier(ppp, carriers, index, now),

            CellularState::ScanWaitSignal { carriers, index, until } => {
                self.wait_signal(ppp, carriers, index, until, now)
            }

            CellularState::ScanSelectBest { carriers } => {
                let best = select_best(&carriers, &self.blacklist, now);
                self.last_scan = carriers;
                match best {
                    Some(i) => {
                        let carrier = self.last_scan[i].clone();
                        info!("cellular: best carrier {} csq {:?}", carrier.label(), carrier.signal_csq);
                        CellularState::ScanConnect {
                            carrier,
                            phase:    ScanConnectPhase::Select,
                            deadline: now + self.settings.select_timeout,
                        }
                    }
                    None => CellularState::ScanFailed { reason: "no usable carrier".into() },
                }
            }

            CellularState::ScanConnect { carrier, phase, deadline } => self.scan_connect(ppp, carrier, phase, deadline, now),

            CellularState::ScanComplete { carrier } => {
                self.blacklist.record_success(&carrier.mccmnc, now);
                self.current_carrier = Some(carrier.mccmnc.clone());
                self.preferred = Some((carrier.mccmnc.clone(), carrier.act));
                self.signal_csq = carrier.signal_csq;
                ppp.take_established();
                self.enable_autorestart(ppp);
                self.finish_scan(now);
                self.flags.set_ready(true);
                info!("cellular: online on {}", carrier.label());
                CellularState::Online { next_check: now + self.settings.online_check, query: None }
            }

            CellularState::ScanFailed { reason } => match self.serial.transact(at::AUTO_SELECT, self.settings.at_timeout, now) {
                AtPoll::Pending => CellularState::ScanFailed { reason },
                AtPoll::Done(Err(e)) if e.is_resource() => self.begin_reset(ppp, &e.to_string(), now),
                AtPoll::Done(result) => {
                    if let Err(e) = result {
                        warn!("cellular: could not restore automatic selection: {e}");
                    }
                    warn!("cellular: scan failed: {reason}");
                    self.preferred = None;
                    self.enable_autorestart(ppp);
                    self.finish_scan(now);
                    CellularState::Disconnected { retry_at: now + RETRY_DELAY, detach: false }
                }
            },

            CellularState::HardwareReset { attempt } => match self.reset.poll_pulse(now) {
                PulsePoll::Pending => CellularState::HardwareReset { attempt },
                PulsePoll::Done => CellularState::WaitModemBoot {
                    deadline:    now + self.settings.boot_wait,
                    attempt,
                    seen_absent: false,
                },
                PulsePoll::Failed(e) => {
                    error!("cellular: reset pulse {attempt} failed: {e}");
                    self.next_pulse(attempt, now)
                }
            },

            CellularState::WaitModemBoot { deadline, attempt, seen_absent } => {
                let present = self.reset.nodes_present();
                let seen_absent = seen_absent || !present;
                if present && (seen_absent || now >= deadline) {
                    info!("cellular: modem device nodes present after reset");
                    self.fatal = None;
                    CellularState::Init
                } else if now >= deadline {
                    warn!("cellular: modem did not re-enumerate within {:?}", self.settings.boot_wait);
                    self.next_pulse(attempt, now)
                } else {
                    CellularState::WaitModemBoot { deadline, attempt, seen_absent }
                }
            }
        }
    }

    // ── Bring-up ──────────────────────────────────────────────────────────────

    fn init(&mut self, ppp: &mut PppCoordinator, now: Instant) -> CellularState {
        self.flags.set_ready(false);
        if !self.reset.nodes_present() {
            let missing = NetdError::DeviceMissing(self.serial.device().to_path_buf());
            return self.begin_reset(ppp, &missing.to_string(), now);
        }
        match self.serial.open() {
            Ok(()) => {
                self.at_timeouts = 0;
                CellularState::Connecting { step: ConnectStep::Handshake(0), deadline: now + self.settings.register_timeout }
            }
            Err(e) => self.begin_reset(ppp, &format!("cannot open AT port: {e}"), now),
        }
    }

    fn connecting(&mut self, ppp: &mut PppCoordinator, step: ConnectStep, deadline: Instant, now: Instant) -> CellularState {
        let register_deadline = now + self.settings.register_timeout;
        match step {
            ConnectStep::Handshake(i) => {
                let cmd = HANDSHAKE[i];
                match self.serial.transact(cmd, self.settings.at_timeout, now) {
                    AtPoll::Pending => CellularState::Connecting { step, deadline },
                    AtPoll::Done(Ok(_)) => {
                        self.at_timeouts = 0;
                        let step = if i + 1 < HANDSHAKE.len() {
                            ConnectStep::Handshake(i + 1)
                        } else if self.preferred.is_some() {
                            ConnectStep::Select
                        } else {
                            ConnectStep::Register { next_poll: now }
                        };
                        CellularState::Connecting { step, deadline: register_deadline }
                    }
                    AtPoll::Done(Err(e)) => {
                        self.command_failed(ppp, cmd, e, CellularState::Connecting { step, deadline }, now)
                    }
                }
            }

            ConnectStep::Select => {
                let Some((mccmnc, act)) = self.preferred.clone() else {
                    return CellularState::Connecting { step: ConnectStep::Register { next_poll: now }, deadline };
                };
                let cmd = at::select_operator(&mccmnc, act);
                match self.serial.transact(&cmd, self.settings.select_timeout, now) {
                    AtPoll::Pending => CellularState::Connecting { step: ConnectStep::Select, deadline },
                    AtPoll::Done(Ok(_)) => {
                        CellularState::Connecting { step: ConnectStep::Register { next_poll: now }, deadline: register_deadline }
                    }
                    AtPoll::Done(Err(e)) if e.is_protocol() => {
                        warn!("cellular: modem refused {mccmnc}: {e}");
                        self.blacklist.insert_or_update(&mccmnc, FailureReason::ProtocolError, now);
                        self.preferred = None;
                        self.flags.request_rescan();
                        CellularState::Disconnected { retry_at: now + RETRY_DELAY, detach: false }
                    }
                    AtPoll::Done(Err(e)) => {
                        self.command_failed(ppp, &cmd, e, CellularState::Connecting { step: ConnectStep::Select, deadline }, now)
                    }
                }
            }

            ConnectStep::Register { next_poll } => {
                if now < next_poll {
                    return CellularState::Connecting { step, deadline };
                }
                match self.serial.transact(at::REGISTRATION, self.settings.at_timeout, now) {
                    AtPoll::Pending => CellularState::Connecting { step, deadline },
                    AtPoll::Done(Ok(resp)) => {
                        self.at_timeouts = 0;
                        let reg = resp.info("+CREG:").and_then(at::parse_creg);
                        match reg {
                            Some(r) if r.is_registered() => {
                                info!("cellular: registered ({r:?})");
                                CellularState::SetupOperator
                            }
                            _ if now >= deadline => {
                                warn!("cellular: not registered within {:?} ({reg:?})", self.settings.register_timeout);
                                self.flags.request_rescan();
                                CellularState::Disconnected { retry_at: now + RETRY_DELAY, detach: false }
                            }
                            _ => {
                                debug!("cellular: registration {reg:?}");
                                CellularState::Connecting {
                                    step: ConnectStep::Register { next_poll: now + REGISTRATION_POLL },
                                    deadline,
                                }
                            }
                        }
                    }
                    AtPoll::Done(Err(e)) => {
                        self.command_failed(ppp, at::REGISTRATION, e, CellularState::Connecting { step, deadline }, now)
                    }
                }
            }
        }
    }

    fn setup_operator(&mut self, ppp: &mut PppCoordinator, now: Instant) -> CellularState {
        let resp = match self.serial.transact(at::CURRENT_OPERATOR, self.settings.at_timeout, now) {
            AtPoll::Pending => return CellularState::SetupOperator,
            AtPoll::Done(Ok(resp)) => resp,
            AtPoll::Done(Err(e)) => {
                return self.command_failed(ppp, at::CURRENT_OPERATOR, e, CellularState::SetupOperator, now)
            }
        };
        self.at_timeouts = 0;

        let current = resp.info("+COPS:").and_then(at::parse_cops_current);
        let Some(CurrentOperator { operator: Some(op), .. }) = current else {
            warn!("cellular: registered but no operator reported");
            return CellularState::Disconnected { retry_at: now + RETRY_DELAY, detach: false };
        };

        if self.blacklist.is_blacklisted(&op, now) {
            warn!("cellular: registered on blacklisted carrier {op}");
            self.flags.request_rescan();
            if self.scan_allowed(now) {
                self.flags.take_rescan_request();
                return self.begin_scan(ppp, now);
            }
            return CellularState::Disconnected { retry_at: now + RETRY_DELAY, detach: true };
        }

        info!("cellular: ready on carrier {op}");
        self.current_carrier = Some(op);
        ppp.reset_failures();
        self.enable_autorestart(ppp);
        self.flags.set_ready(true);
        CellularState::Online { next_check: now + self.settings.online_check, query: None }
    }

    // ── Steady state ──────────────────────────────────────────────────────────

    fn online(
        &mut self,
        ppp:        &mut PppCoordinator,
        next_check: Instant,
        query:      Option<OnlineQuery>,
        now:        Instant,
    ) -> CellularState {
        let carrier = self.current_carrier.clone().unwrap_or_default();

        if self.flags.take_link_reset() {
            warn!("cellular: link reset on {carrier}: no address on {}", ppp.iface());
            self.flags.set_ready(false);
            self.disable_autorestart(ppp);
            ppp.request_stop();
            return CellularState::Disconnected { retry_at: now + LINK_RESET_DELAY, detach: true };
        }

        if self.flags.rescan_requested() && self.scan_allowed(now) {
            self.flags.take_rescan_request();
            info!("cellular: rescan requested while online on {carrier}");
            return self.begin_scan(ppp, now);
        }

        let failures = ppp.take_new_failures();
        if failures > 0 && !carrier.is_empty() {
            for _ in 0..failures {
                self.blacklist.insert_or_update(&carrier, FailureReason::SessionTimeout, now);
            }
            if (self.blacklist.is_blacklisted(&carrier, now)
                || ppp.consecutive_failures() >= self.settings.ppp_fail_threshold)
                && self.flags.request_rescan()
            {
                warn!("cellular: sessions keep failing on {carrier}, rescan requested");
            }
        }

        if ppp.take_established() && !carrier.is_empty() {
            self.blacklist.record_success(&carrier, now);
        }

        let query = match query {
            None if now >= next_check => Some(OnlineQuery::Operator),
            q => q,
        };
        let Some(q) = query else {
            return CellularState::Online { next_check, query: None };
        };

        let cmd = match q {
            OnlineQuery::Operator => at::CURRENT_OPERATOR,
            OnlineQuery::Signal   => at::SIGNAL_QUALITY,
        };
        let resp = match self.serial.transact(cmd, self.settings.at_timeout, now) {
            AtPoll::Pending => return CellularState::Online { next_check, query },
            AtPoll::Done(Ok(resp)) => resp,
            AtPoll::Done(Err(e)) if e.is_resource() => return self.begin_reset(ppp, &e.to_string(), now),
            AtPoll::Done(Err(e)) => {
                warn!("cellular: online check {cmd} failed: {e}");
                return CellularState::Online { next_check: now + self.settings.at_timeout, query: None };
            }
        };

        match q {
            OnlineQuery::Operator => {
                self.blacklist.prune_expired(now);
                match resp.info("+COPS:").and_then(at::parse_cops_current) {
                    Some(CurrentOperator { operator: Some(op), .. }) => {
                        if op != carrier {
                            info!("cellular: carrier changed {carrier} -> {op}");
                            self.current_carrier = Some(op.clone());
                        }
                        if self.blacklist.is_blacklisted(&op, now) && self.flags.request_rescan() {
                            warn!("cellular: now on blacklisted carrier {op}, rescan requested");
                        }
                    }
                    Some(_) => {
                        warn!("cellular: registration on {carrier} lost");
                        self.flags.set_ready(false);
                        return CellularState::Disconnected { retry_at: now + RETRY_DELAY, detach: false };
                    }
                    None => debug!("cellular: unparsable operator reply"),
                }
                CellularState::Online { next_check, query: Some(OnlineQuery::Signal) }
            }
            OnlineQuery::Signal => {
                self.signal_csq = resp.info("+CSQ:").and_then(at::parse_csq);
                debug!("cellular: {carrier} csq {:?}", self.signal_csq);
                CellularState::Online { next_check: now + self.settings.online_check, query: None }
            }
        }
    }

    fn disconnected(&mut self, ppp: &mut PppCoordinator, retry_at: Instant, detach: bool, now: Instant) -> CellularState {
        if detach && self.serial.is_open() {
            match self.serial.transact(at::DEREGISTER, self.settings.at_timeout, now) {
                AtPoll::Pending => return CellularState::Disconnected { retry_at, detach },
                AtPoll::Done(Err(e)) if e.is_resource() => return self.begin_reset(ppp, &e.to_string(), now),
                AtPoll::Done(Err(e)) => warn!("cellular: deregistration failed: {e}"),
                AtPoll::Done(Ok(_)) => debug!("cellular: deregistered"),
            }
        }

        if self.serial.is_open() && self.flags.rescan_requested() {
            if self.scan_allowed(now) {
                self.flags.take_rescan_request();
                return self.begin_scan(ppp, now);
            }
            // Reconnecting now would only land on the carrier being replaced.
            return CellularState::Disconnected { retry_at, detach: false };
        }

        if now < retry_at {
            return CellularState::Disconnected { retry_at, detach: false };
        }
        if self.serial.is_open() {
            CellularState::Connecting { step: ConnectStep::Handshake(0), deadline: now + self.settings.register_timeout }
        } else {
            CellularState::Init
        }
    }

    // ── Scan ──────────────────────────────────────────────────────────────────

    fn scan_allowed(&self, now: Instant) -> bool {
        self.last_scan_end.map_or(true, |t| now >= t + self.settings.scan_backoff)
    }

    fn begin_scan(&mut self, ppp: &mut PppCoordinator, now: Instant) -> CellularState {
        self.flags.set_ready(false);
        self.flags.set_scanning(true);
        info!(
            "cellular: operator scan starting (current carrier {})",
            self.current_carrier.as_deref().unwrap_or("none")
        );
        self.disable_autorestart(ppp);
        CellularState::ScanStopPpp { issue_at: now + self.settings.supervisor_settle }
    }

    fn finish_scan(&mut self, now: Instant) {
        self.flags.set_scanning(false);
        self.last_scan_end = Some(now);
    }

    fn verify_stopped(&mut self, ppp: &mut PppCoordinator, deadline: Instant, attempt: u32, now: Instant) -> CellularState {
        if !ppp.is_running() && !ppp.interface_present() {
            return CellularState::ScanGetOperators;
        }
        if now < deadline || ppp.stop_pending() {
            return CellularState::ScanVerifyStopped { deadline, attempt };
        }
        if attempt >= self.settings.verify_attempts {
            return CellularState::ScanFailed { reason: format!("PPP still present after {attempt} stop attempts") };
        }
        warn!("cellular: PPP still present after stop (attempt {attempt}), forcing");
        self.disable_autorestart(ppp);
        ppp.request_kill();
        CellularState::ScanVerifyStopped { deadline: now + self.settings.verify_timeout, attempt: attempt + 1 }
    }

    fn get_operators(&mut self, ppp: &mut PppCoordinator, now: Instant) -> CellularState {
        match self.serial.transact(at::LIST_OPERATORS, self.settings.scan_timeout, now) {
            AtPoll::Pending => CellularState::ScanGetOperators,
            AtPoll::Done(Ok(resp)) => {
                let carriers: Vec<CarrierRecord> = resp
                    .info("+COPS:")
                    .map(at::parse_cops_list)
                    .unwrap_or_default()
                    .into_iter()
                    .map(CarrierRecord::from)
                    .collect();
                info!("cellular: {} carriers discovered", carriers.len());
                for c in &carriers {
                    info!("cellular:   {} {:?}", c.label(), c.status);
                }
                if carriers.is_empty() {
                    CellularState::ScanFailed { reason: "no carriers discovered".into() }
                } else {
                    CellularState::ScanTestCarrier { carriers, index: 0 }
                }
            }
            AtPoll::Done(Err(e)) if e.is_resource() => self.begin_reset(ppp, &e.to_string(), now),
            AtPoll::Done(Err(e)) => CellularState::ScanFailed { reason: format!("operator list: {e}") },
        }
    }

    fn test_carrier(
        &mut self,
        ppp:          &mut PppCoordinator,
        mut carriers: Vec<CarrierRecord>,
        index:        usize,
        now:          Instant,
    ) -> CellularState {
        let next = (index..carriers.len()).find(|&i| is_candidate(&carriers[i], &self.blacklist, now));
        for skipped in &carriers[index..next.unwrap_or(carriers.len())] {
            info!("cellular: skipping {} (forbidden or blacklisted)", skipped.label());
        }
        let Some(i) = next else {
            return CellularState::ScanSelectBest { carriers };
        };
        if i != index {
            return CellularState::ScanTestCarrier { carriers, index: i };
        }

        let cmd = at::select_operator(&carriers[i].mccmnc, carriers[i].act);
        match self.serial.transact(&cmd, self.settings.select_timeout, now) {
            AtPoll::Pending => CellularState::ScanTestCarrier { carriers, index: i },
            AtPoll::Done(Ok(_)) => CellularState::ScanWaitSignal {
                carriers,
                index: i,
                until: now + self.settings.signal_settle,
            },
            AtPoll::Done(Err(e)) if e.is_resource() => self.begin_reset(ppp, &e.to_string(), now),
            AtPoll::Done(Err(e)) => {
                warn!("cellular: cannot select {} for testing: {e}", carriers[i].label());
                if e.is_protocol() {
                    self.blacklist.insert_or_update(&carriers[i].mccmnc, FailureReason::ProtocolError, now);
                }
                carriers[i].record_signal(None);
                CellularState::ScanTestCarrier { carriers, index: i + 1 }
            }
        }
    }

    fn wait_signal(
        &mut self,
        ppp:          &mut PppCoordinator,
        mut carriers: Vec<CarrierRecord>,
        index:        usize,
        until:        Instant,
        now:          Instant,
    ) -> CellularState {
        if now < until {
            return CellularState::ScanWaitSignal { carriers, index, until };
        }
        match self.serial.transact(at::SIGNAL_QUALITY, self.settings.at_timeout, now) {
            AtPoll::Pending => CellularState::ScanWaitSignal { carriers, index, until },
            AtPoll::Done(Err(e)) if e.is_resource() => self.begin_reset(ppp, &e.to_string(), now),
            AtPoll::Done(result) => {
                let csq = match result {
                    Ok(resp) => resp.info("+CSQ:").and_then(at::parse_csq),
                    Err(e) => {
                        warn!("cellular: signal query for {} failed: {e}", carriers[index].label());
                        None
                    }
                };
                let c = &mut carriers[index];
                c.record_signal(csq);
                info!("cellular: {} csq {:?} rssi {:?} dBm", c.label(), c.signal_csq, c.rssi_dbm);
                CellularState::ScanTestCarrier { carriers, index: index + 1 }
            }
        }
    }

    fn scan_connect(
        &mut self,
        ppp:      &mut PppCoordinator,
        carrier:  CarrierRecord,
        phase:    ScanConnectPhase,
        deadline: Instant,
        now:      Instant,
    ) -> CellularState {
        match phase {
            ScanConnectPhase::Select => {
                let cmd = at::select_operator(&carrier.mccmnc, carrier.act);
                match self.serial.transact(&cmd, self.settings.select_timeout, now) {
                    AtPoll::Pending => CellularState::ScanConnect { carrier, phase, deadline },
                    AtPoll::Done(Ok(_)) => {
                        ppp.reset_failures();
                        if let Err(e) = ppp.start() {
                            return self.connect_failed(ppp, &carrier, FailureReason::SessionTimeout, &e.to_string(), now);
                        }
                        CellularState::ScanConnect {
                            carrier,
                            phase:    ScanConnectPhase::WaitIp,
                            deadline: now + self.settings.ip_timeout,
                        }
                    }
                    AtPoll::Done(Err(e)) if e.is_resource() => self.begin_reset(ppp, &e.to_string(), now),
                    AtPoll::Done(Err(e)) => {
                        let reason = if e.is_protocol() { FailureReason::ProtocolError } else { FailureReason::SessionTimeout };
                        self.connect_failed(ppp, &carrier, reason, &e.to_string(), now)
                    }
                }
            }
            ScanConnectPhase::WaitIp => {
                if ppp.is_up() {
                    return CellularState::ScanComplete { carrier };
                }
                if ppp.take_new_failures() > 0 {
                    return self.connect_failed(ppp, &carrier, FailureReason::SessionTimeout, "PPP exited before IP", now);
                }
                if now >= deadline {
                    let detail = format!("no address on {} within {:?}", ppp.iface(), self.settings.ip_timeout);
                    return self.connect_failed(ppp, &carrier, FailureReason::SessionTimeout, &detail, now);
                }
                CellularState::ScanConnect { carrier, phase, deadline }
            }
        }
    }

    fn connect_failed(
        &mut self,
        ppp:     &mut PppCoordinator,
        carrier: &CarrierRecord,
        reason:  FailureReason,
        detail:  &str,
        now:     Instant,
    ) -> CellularState {
        warn!("cellular: connect to {} failed: {detail}", carrier.label());
        self.blacklist.insert_or_update(&carrier.mccmnc, reason, now);
        ppp.request_stop();
        self.flags.request_rescan();
        CellularState::ScanFailed { reason: format!("connect to {} failed ({reason})", carrier.mccmnc) }
    }

    // ── Recovery ──────────────────────────────────────────────────────────────

    fn command_failed(
        &mut self,
        ppp:   &mut PppCoordinator,
        cmd:   &str,
        e:     NetdError,
        retry: CellularState,
        now:   Instant,
    ) -> CellularState {
        if e.is_resource() {
            return self.begin_reset(ppp, &e.to_string(), now);
        }
        match e {
            NetdError::Timeout { .. } => {
                self.at_timeouts += 1;
                if self.at_timeouts >= AT_TIMEOUT_LIMIT {
                    return self.begin_reset(ppp, &format!("modem unresponsive ({} timeouts)", self.at_timeouts), now);
                }
                warn!("cellular: {cmd} timed out, retrying");
                retry
            }
            // Write failures are counted by the port and escalate on their own.
            NetdError::Io(_) => retry,
            e => {
                warn!("cellular: {cmd} failed: {e}");
                CellularState::Disconnected { retry_at: now + RETRY_DELAY, detach: false }
            }
        }
    }

    fn begin_reset(&mut self, ppp: &mut PppCoordinator, reason: &str, now: Instant) -> CellularState {
        error!("cellular: hardware reset ({reason})");
        self.resets += 1;
        self.flags.set_ready(false);
        if self.flags.scanning() {
            self.finish_scan(now);
        }
        self.serial.close();
        self.disable_autorestart(ppp);
        ppp.request_stop();
        ppp.reset_failures();
        self.at_timeouts = 0;
        self.pulse(1, now)
    }

    fn pulse(&mut self, attempt: u32, now: Instant) -> CellularState {
        match self.reset.begin_pulse(now) {
            Ok(()) => CellularState::HardwareReset { attempt },
            Err(e) => {
                error!("cellular: reset pulse {attempt} could not start: {e}");
                self.next_pulse(attempt, now)
            }
        }
    }

    fn next_pulse(&mut self, attempt: u32, now: Instant) -> CellularState {
        if attempt < self.settings.reset_attempts {
            return self.pulse(attempt + 1, now);
        }
        let msg = format!("modem did not return after {attempt} reset pulses");
        error!("cellular: {msg}; cooling down for {:?}", self.settings.reset_cooldown);
        self.fatal = Some(msg);
        CellularState::Disconnected { retry_at: now + self.settings.reset_cooldown, detach: false }
    }

    fn enable_autorestart(&self, ppp: &mut PppCoordinator) {
        if let Err(e) = ppp.enable_autorestart() {
            warn!("cellular: {e}");
        }
    }

    fn disable_autorestart(&self, ppp: &mut PppCoordinator) {
        if let Err(e) = ppp.disable_autorestart() {
            warn!("cellular: {e}");
        }
    }
}

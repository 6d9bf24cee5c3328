//! In-memory stand-ins for the hardware seams, shared with the code under test
//! through cheap clones.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::oneshot;

use crate::error::{NetdError, Result};
use crate::gpio::{DeviceNodes, ResetLine};
use crate::health::{PingStats, Prober};
use crate::network::{LinkMonitor, RouteControl};
use crate::ppp::PppStatusSource;
use crate::serial::{AtLink, PortOpener};
use crate::supervisor::{ChildExit, ProcessSupervisor};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Modem ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ModemInner {
    /// Per-command reply queue; the last reply repeats.
    replies:     HashMap<String, VecDeque<String>>,
    /// CSQ reported while a given carrier is manually selected.
    signals:     HashMap<String, u8>,
    selected:    Option<String>,
    rx:          VecDeque<u8>,
    written:     Vec<String>,
    fail_writes: bool,
    opens:       usize,
    valid:       bool,
}

/// Scripted modem.  Unknown commands answer `OK`.
#[derive(Clone, Default)]
pub struct MockModem {
    inner: Arc<Mutex<ModemInner>>,
}

impl MockModem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opener(&self) -> MockOpener {
        MockOpener { modem: self.clone(), device: PathBuf::from("/dev/mock-at") }
    }

    /// Answer every `command` with `raw`.
    pub fn reply(&self, command: &str, raw: &str) {
        self.reply_seq(command, &[raw]);
    }

    /// Answer successive `command`s with `raws` in order, then keep repeating
    /// the last one.
    pub fn reply_seq(&self, command: &str, raws: &[&str]) {
        let queue = raws.iter().map(|r| r.to_string()).collect();
        lock(&self.inner).replies.insert(command.to_string(), queue);
    }

    /// Never answer `command`.
    pub fn silent(&self, command: &str) {
        self.reply(command, "");
    }

    /// Report `csq` from `AT+CSQ` while `mccmnc` is manually selected.
    pub fn signal(&self, mccmnc: &str, csq: u8) {
        lock(&self.inner).signals.insert(mccmnc.to_string(), csq);
    }

    pub fn fail_writes(&self, fail: bool) {
        lock(&self.inner).fail_writes = fail;
    }

    /// Commands written so far, without the terminator.
    pub fn written(&self) -> Vec<String> {
        lock(&self.inner).written.clone()
    }

    pub fn count(&self, command: &str) -> usize {
        lock(&self.inner).written.iter().filter(|c| *c == command).count()
    }

    pub fn opens(&self) -> usize {
        lock(&self.inner).opens
    }
}

impl ModemInner {
    fn answer(&mut self, command: &str) -> String {
        if let Some(rest) = command.strip_prefix("AT+COPS=1,2,\"") {
            self.selected = rest.split('"').next().map(String::from);
        }
        if let Some(queue) = self.replies.get_mut(command) {
            return if queue.len() > 1 {
                queue.pop_front().unwrap_or_default()
            } else {
                queue.front().cloned().unwrap_or_default()
            };
        }
        if command == "AT+CSQ" {
            if let Some(csq) = self.selected.as_ref().and_then(|s| self.signals.get(s)) {
                return format!("+CSQ: {csq},99\r\nOK\r\n");
            }
        }
        "OK\r\n".to_string()
    }
}

pub struct MockOpener {
    modem:  MockModem,
    device: PathBuf,
}

impl PortOpener for MockOpener {
    fn open(&mut self) -> io::Result<Box<dyn AtLink>> {
        let mut m = lock(&self.modem.inner);
        m.opens += 1;
        m.valid = true;
        m.rx.clear();
        Ok(Box::new(MockLink { modem: self.modem.clone() }))
    }

    fn device(&self) -> &Path {
        &self.device
    }
}

struct MockLink {
    modem: MockModem,
}

impl AtLink for MockLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut m = lock(&self.modem.inner);
        if m.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "modem gone"));
        }
        let command = String::from_utf8_lossy(data).trim_end_matches('\r').to_string();
        let reply = m.answer(&command);
        m.written.push(command);
        m.rx.extend(reply.into_bytes());
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut m = lock(&self.modem.inner);
        let n = buf.len().min(m.rx.len());
        for (slot, byte) in buf.iter_mut().zip(m.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn is_valid(&self) -> bool {
        lock(&self.modem.inner).valid
    }
}

// ── Supervisor ────────────────────────────────────────────────────────────────

struct SupInner {
    name:        String,
    running:     bool,
    autorestart: bool,
    queued_exit: Option<(Option<i32>, bool)>,
    ignore_term: bool,
    signals:     Vec<&'static str>,
    starts:      usize,
}

/// Supervisor of a single child.  Exits are reported on the next poll and
/// respawn immediately when auto-restart is on.
#[derive(Clone)]
pub struct MockSupervisor {
    inner: Arc<Mutex<SupInner>>,
}

impl MockSupervisor {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SupInner {
                name:        name.to_string(),
                running:     false,
                autorestart: true,
                queued_exit: None,
                ignore_term: false,
                signals:     Vec::new(),
                starts:      0,
            })),
        }
    }

    /// Signals received, as `"stop"` or `"kill"`.
    pub fn signals(&self) -> Vec<&'static str> {
        lock(&self.inner).signals.clone()
    }

    pub fn starts(&self) -> usize {
        lock(&self.inner).starts
    }

    pub fn running(&self) -> bool {
        lock(&self.inner).running
    }

    /// The child exits on its own with `code`.
    pub fn exit(&self, code: Option<i32>) {
        let mut s = lock(&self.inner);
        if s.running {
            s.queued_exit = Some((code, false));
        }
    }

    /// SIGTERM is ignored; only SIGKILL ends the child.
    pub fn ignore_term(&self, ignore: bool) {
        lock(&self.inner).ignore_term = ignore;
    }
}

impl ProcessSupervisor for MockSupervisor {
    fn set_autorestart(&mut self, _child: &str, enabled: bool) -> Result<()> {
        lock(&self.inner).autorestart = enabled;
        Ok(())
    }

    fn autorestart(&self, _child: &str) -> bool {
        lock(&self.inner).autorestart
    }

    fn start(&mut self, _child: &str) -> Result<()> {
        let mut s = lock(&self.inner);
        if !s.running {
            s.running = true;
            s.starts += 1;
        }
        Ok(())
    }

    fn stop(&mut self, _child: &str) -> Result<()> {
        let mut s = lock(&self.inner);
        s.signals.push("stop");
        if s.running && !s.ignore_term {
            s.queued_exit = Some((None, true));
        }
        Ok(())
    }

    fn kill(&mut self, _child: &str) -> Result<()> {
        let mut s = lock(&self.inner);
        s.signals.push("kill");
        if s.running {
            s.queued_exit = Some((None, true));
        }
        Ok(())
    }

    fn is_running(&self, _child: &str) -> bool {
        lock(&self.inner).running
    }

    fn poll(&mut self, _now: Instant) -> Vec<ChildExit> {
        let mut s = lock(&self.inner);
        let Some((code, requested)) = s.queued_exit.take() else {
            return Vec::new();
        };
        s.running = false;
        if s.autorestart {
            s.running = true;
            s.starts += 1;
        }
        vec![ChildExit { child: s.name.clone(), code, requested }]
    }
}

// ── PPP interface ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct PppInner {
    present: bool,
    ip:      Option<Ipv4Addr>,
}

#[derive(Clone, Default)]
pub struct MockPppStatus {
    inner: Arc<Mutex<PppInner>>,
}

impl MockPppStatus {
    /// Assign or remove the address; the interface exists while it has one.
    pub fn set_ip(&self, ip: Option<Ipv4Addr>) {
        let mut p = lock(&self.inner);
        p.present = ip.is_some();
        p.ip = ip;
    }

    pub fn set_present(&self, present: bool) {
        lock(&self.inner).present = present;
    }
}

impl PppStatusSource for MockPppStatus {
    fn interface_present(&self, _iface: &str) -> bool {
        lock(&self.inner).present
    }

    fn ip_address(&self, _iface: &str) -> Option<Ipv4Addr> {
        lock(&self.inner).ip
    }
}

// ── GPIO ──────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct LineInner {
    levels: Vec<bool>,
    fail:   bool,
}

#[derive(Clone, Default)]
pub struct MockLine {
    inner: Arc<Mutex<LineInner>>,
}

impl MockLine {
    pub fn levels(&self) -> Vec<bool> {
        lock(&self.inner).levels.clone()
    }

    pub fn fail(&self, fail: bool) {
        lock(&self.inner).fail = fail;
    }
}

impl ResetLine for MockLine {
    fn set_level(&mut self, high: bool) -> Result<()> {
        let mut l = lock(&self.inner);
        if l.fail {
            return Err(NetdError::Gpio("mock line failure".into()));
        }
        l.levels.push(high);
        Ok(())
    }
}

#[derive(Clone)]
pub struct MockNodes {
    inner: Arc<Mutex<(bool, bool)>>,
}

impl MockNodes {
    pub fn present() -> Self {
        Self { inner: Arc::new(Mutex::new((true, true))) }
    }

    pub fn set_present(&self, present: bool) {
        *lock(&self.inner) = (present, present);
    }

    pub fn set_data_port(&self, present: bool) {
        lock(&self.inner).1 = present;
    }
}

impl DeviceNodes for MockNodes {
    fn at_port_present(&self) -> bool {
        lock(&self.inner).0
    }

    fn data_port_present(&self) -> bool {
        lock(&self.inner).1
    }
}

// ── Links and routes ──────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MockLinks {
    inner: Arc<Mutex<HashMap<String, (bool, Option<Ipv4Addr>)>>>,
}

impl MockLinks {
    pub fn set_up(&self, iface: &str, up: bool) {
        lock(&self.inner).entry(iface.to_string()).or_default().0 = up;
    }

    pub fn set_gateway(&self, iface: &str, gw: Ipv4Addr) {
        lock(&self.inner).entry(iface.to_string()).or_default().1 = Some(gw);
    }
}

impl LinkMonitor for MockLinks {
    fn link_up(&self, iface: &str) -> bool {
        lock(&self.inner).get(iface).is_some_and(|l| l.0)
    }

    fn gateway(&self, iface: &str) -> Option<Ipv4Addr> {
        lock(&self.inner).get(iface).and_then(|l| l.1)
    }
}

#[derive(Clone, Default)]
pub struct MockRoutes {
    inner: Arc<Mutex<RoutesInner>>,
}

#[derive(Default)]
struct RoutesInner {
    history: Vec<String>,
    current: Option<(String, Option<Ipv4Addr>)>,
}

impl MockRoutes {
    /// Interfaces given the default route, in order.
    pub fn installed(&self) -> Vec<String> {
        lock(&self.inner).history.clone()
    }

    pub fn current(&self) -> Option<(String, Option<Ipv4Addr>)> {
        lock(&self.inner).current.clone()
    }
}

impl RouteControl for MockRoutes {
    fn set_default(&mut self, iface: &str, gateway: Option<Ipv4Addr>) -> Result<()> {
        let mut s = lock(&self.inner);
        s.history.push(iface.to_string());
        s.current = Some((iface.to_string(), gateway));
        Ok(())
    }

    fn clear_default(&mut self) -> Result<()> {
        lock(&self.inner).current = None;
        Ok(())
    }
}

// ── Prober ────────────────────────────────────────────────────────────────────

pub const GOOD: PingStats = PingStats { transmitted: 3, received: 3, avg_rtt_ms: Some(20.0) };
pub const DEAD: PingStats = PingStats { transmitted: 3, received: 0, avg_rtt_ms: None };

struct ProberInner {
    hold:      bool,
    waiters:   Vec<oneshot::Sender<PingStats>>,
    results:   HashMap<String, PingStats>,
}

/// Answers probes immediately with per-interface results ([`GOOD`] unless
/// set), or holds them until [`MockProber::release`].
#[derive(Clone)]
pub struct MockProber {
    inner: Arc<Mutex<ProberInner>>,
}

impl MockProber {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProberInner {
                hold:    false,
                waiters: Vec::new(),
                results: HashMap::new(),
            })),
        }
    }

    pub fn hold(&self, hold: bool) {
        lock(&self.inner).hold = hold;
    }

    /// Complete every held probe with `stats`.
    pub fn release(&self, stats: PingStats) {
        for tx in lock(&self.inner).waiters.drain(..) {
            let _ = tx.send(stats);
        }
    }

    pub fn set_result(&self, iface: &str, stats: PingStats) {
        lock(&self.inner).results.insert(iface.to_string(), stats);
    }
}

impl Prober for MockProber {
    fn probe(&self, iface: String, _target: String, _count: u32, _deadline: Duration)
        -> BoxFuture<'static, Result<PingStats>>
    {
        let mut p = lock(&self.inner);
        if p.hold {
            let (tx, rx) = oneshot::channel();
            p.waiters.push(tx);
            return async move {
                rx.await.map_err(|_| NetdError::Parse("probe abandoned".into()))
            }
            .boxed();
        }
        let stats = p.results.get(&iface).copied().unwrap_or(GOOD);
        async move { Ok(stats) }.boxed()
    }
}

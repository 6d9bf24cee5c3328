//! Daemon configuration file parser.
//!
//! Parses a flat `key = value` file, or the equivalent options from the UCI
//! package `netd` on OpenWrt-based gateways.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{NetdError, Result};

// Default constants
const AT_BAUD:            u32 = 115200;
const AT_TIMEOUT:         u64 = 5;
const SCAN_TIMEOUT:       u64 = 180;
const SELECT_TIMEOUT:     u64 = 120;
const REGISTER_TIMEOUT:   u64 = 60;
const SIGNAL_SETTLE_MS:   u64 = 3000;
const AT_FAIL_THRESHOLD:  u32 = 3;
const ONLINE_CHECK:       u64 = 60;
const IP_TIMEOUT:         u64 = 60;
const PPP_FAIL_THRESHOLD: u32 = 3;
const RESPAWN_DELAY_MS:   u64 = 1500;
const SETTLE_MS:          u64 = 500;
const VERIFY_TIMEOUT:     u64 = 5;
const VERIFY_ATTEMPTS:    u32 = 3;
const BLACKLIST_TIMEOUT:  u64 = 3600;
const BLACKLIST_THRESH:   u32 = 3;
const BLACKLIST_CAPACITY: usize = 16;
const SCAN_BACKOFF:       u64 = 30;
const RESET_LOW_MS:       u64 = 100;
const RESET_HIGH_MS:      u64 = 1000;
const BOOT_WAIT:          u64 = 10;
const RESET_ATTEMPTS:     u32 = 3;
const RESET_COOLDOWN:     u64 = 300;
const PING_COUNT:         u32 = 3;
const PROBE_INTERVAL:     u64 = 30;
const PROBE_DEADLINE:     u64 = 10;
const HEALTH_THRESHOLD:   u32 = 3;
const MIN_USABLE_SCORE:   u8  = 3;
const TICK_MS:            u64 = 50;

/// Full daemon configuration.
#[derive(Debug, Clone)]
pub struct NetdConfig {
    // ── Modem / AT port ───────────────────────────────────────────────────────
    /// Serial device carrying AT commands.
    pub at_device: PathBuf,
    pub at_baud:   u32,
    /// Serial device carrying the PPP data session.  Must differ from
    /// `at_device`.
    pub data_device: PathBuf,
    /// Default budget for short AT commands (seconds).
    pub at_timeout: u64,
    /// Budget for `AT+COPS=?` (seconds).
    pub scan_timeout: u64,
    /// Budget for a manual operator selection (seconds).
    pub select_timeout: u64,
    /// How long `Connecting` waits for network registration (seconds).
    pub register_timeout: u64,
    /// Pause between selecting a carrier and sampling its signal.
    pub signal_settle_ms: u64,
    /// Consecutive AT write failures before a hardware reset.
    pub at_write_fail_threshold: u32,
    /// Operator/signal re-query period while online (seconds).
    pub online_check_interval: u64,
    // ── PPP ───────────────────────────────────────────────────────────────────
    pub ppp_iface:   String,
    /// Supervisor child name of the PPP session.
    pub ppp_child:   String,
    /// Command line of the PPP session (split on whitespace).
    pub ppp_command: String,
    /// How long to wait for an IP on the PPP interface (seconds).
    pub ip_timeout: u64,
    /// Consecutive session-establishment failures that blacklist a carrier.
    pub ppp_fail_threshold: u32,
    pub respawn_delay_ms:     u64,
    pub supervisor_settle_ms: u64,
    pub verify_timeout:       u64,
    pub verify_attempts:      u32,
    // ── Blacklist ─────────────────────────────────────────────────────────────
    /// Entry lifetime in seconds; 0 makes entries permanent.
    pub blacklist_timeout:   u64,
    pub blacklist_threshold: u32,
    pub blacklist_capacity:  usize,
    /// Minimum spacing between two operator scans (seconds).
    pub scan_backoff: u64,
    // ── Hardware reset ────────────────────────────────────────────────────────
    pub gpio_base:      PathBuf,
    /// Modem power/reset line.  `None` disables the pulse.
    pub gpio_reset_pin: Option<u32>,
    pub reset_low_ms:   u64,
    pub reset_high_ms:  u64,
    /// How long to wait for device nodes after a pulse (seconds).
    pub boot_wait:      u64,
    pub reset_attempts: u32,
    pub reset_cooldown: u64,
    // ── Interface selection ───────────────────────────────────────────────────
    pub eth_iface:  String,
    pub wifi_iface: String,
    pub ping_target: String,
    pub ping_count:  u32,
    pub probe_interval: u64,
    pub probe_deadline: u64,
    pub health_fail_threshold: u32,
    pub min_usable_score: u8,
    // ── Process ───────────────────────────────────────────────────────────────
    pub tick_ms:    u64,
    pub ctl_socket: PathBuf,
    pub pid_file:   PathBuf,
    pub log_syslog: bool,
}

impl Default for NetdConfig {
    fn default() -> Self {
        Self {
            at_device:               PathBuf::from("/dev/ttyUSB2"),
            at_baud:                 AT_BAUD,
            data_device:             PathBuf::from("/dev/ttyUSB3"),
            at_timeout:              AT_TIMEOUT,
            scan_timeout:            SCAN_TIMEOUT,
            select_timeout:          SELECT_TIMEOUT,
            register_timeout:        REGISTER_TIMEOUT,
            signal_settle_ms:        SIGNAL_SETTLE_MS,
            at_write_fail_threshold: AT_FAIL_THRESHOLD,
            online_check_interval:   ONLINE_CHECK,
            ppp_iface:               "ppp0".to_string(),
            ppp_child:               "ppp".to_string(),
            ppp_command:             "pppd call cellular nodetach".to_string(),
            ip_timeout:              IP_TIMEOUT,
            ppp_fail_threshold:      PPP_FAIL_THRESHOLD,
            respawn_delay_ms:        RESPAWN_DELAY_MS,
            supervisor_settle_ms:    SETTLE_MS,
            verify_timeout:          VERIFY_TIMEOUT,
            verify_attempts:         VERIFY_ATTEMPTS,
            blacklist_timeout:       BLACKLIST_TIMEOUT,
            blacklist_threshold:     BLACKLIST_THRESH,
            blacklist_capacity:      BLACKLIST_CAPACITY,
            scan_backoff:            SCAN_BACKOFF,
            gpio_base:               PathBuf::from("/sys/class/gpio"),
            gpio_reset_pin:          None,
            reset_low_ms:            RESET_LOW_MS,
            reset_high_ms:           RESET_HIGH_MS,
            boot_wait:               BOOT_WAIT,
            reset_attempts:          RESET_ATTEMPTS,
            reset_cooldown:          RESET_COOLDOWN,
            eth_iface:               "eth0".to_string(),
            wifi_iface:              "wlan0".to_string(),
            ping_target:             "8.8.8.8".to_string(),
            ping_count:              PING_COUNT,
            probe_interval:          PROBE_INTERVAL,
            probe_deadline:          PROBE_DEADLINE,
            health_fail_threshold:   HEALTH_THRESHOLD,
            min_usable_score:        MIN_USABLE_SCORE,
            tick_ms:                 TICK_MS,
            ctl_socket:              PathBuf::from("/var/run/gateway-netd.sock"),
            pid_file:                PathBuf::from("/var/run/gateway-netd.pid"),
            log_syslog:              true,
        }
    }
}

impl NetdConfig {
    pub fn tick(&self) -> Duration { Duration::from_millis(self.tick_ms) }

    /// How long shutdown waits for PPP to stop.  A stop is held back while a
    /// probe runs, so this outlasts one probe plus a tick.
    pub fn shutdown_grace(&self) -> Duration {
        (Duration::from_secs(self.probe_deadline) + self.tick()).max(Duration::from_secs(3))
    }

    /// Blacklist entry lifetime, `None` when entries are permanent.
    pub fn blacklist_ttl(&self) -> Option<Duration> {
        if self.blacklist_timeout == 0 {
            None
        } else {
            Some(Duration::from_secs(self.blacklist_timeout))
        }
    }

    /// Apply a single `key = value` pair.  Unknown keys are ignored.
    fn apply(&mut self, key: &str, val: String) {
        match key {
            "at_device"               => self.at_device               = PathBuf::from(&val),
            "at_baud"                 => self.at_baud                 = val.parse().unwrap_or(AT_BAUD),
            "data_device"             => self.data_device             = PathBuf::from(&val),
            "at_timeout"              => self.at_timeout              = val.parse().unwrap_or(AT_TIMEOUT),
            "scan_timeout"            => self.scan_timeout            = val.parse().unwrap_or(SCAN_TIMEOUT),
            "select_timeout"          => self.select_timeout          = val.parse().unwrap_or(SELECT_TIMEOUT),
            "register_timeout"        => self.register_timeout        = val.parse().unwrap_or(REGISTER_TIMEOUT),
            "signal_settle_ms"        => self.signal_settle_ms        = val.parse().unwrap_or(SIGNAL_SETTLE_MS),
            "at_write_fail_threshold" => self.at_write_fail_threshold = val.parse().unwrap_or(AT_FAIL_THRESHOLD),
            "online_check_interval"   => self.online_check_interval   = val.parse().unwrap_or(ONLINE_CHECK),
            "ppp_iface"               => self.ppp_iface               = val,
            "ppp_child"               => self.ppp_child               = val,
            "ppp_command"             => self.ppp_command             = val,
            "ip_timeout"              => self.ip_timeout              = val.parse().unwrap_or(IP_TIMEOUT),
            "ppp_fail_threshold"      => self.ppp_fail_threshold      = val.parse().unwrap_or(PPP_FAIL_THRESHOLD),
            "respawn_delay_ms"        => self.respawn_delay_ms        = val.parse().unwrap_or(RESPAWN_DELAY_MS),
            "supervisor_settle_ms"    => self.supervisor_settle_ms    = val.parse().unwrap_or(SETTLE_MS),
            "verify_timeout"          => self.verify_timeout          = val.parse().unwrap_or(VERIFY_TIMEOUT),
            "verify_attempts"         => self.verify_attempts         = val.parse().unwrap_or(VERIFY_ATTEMPTS),
            "blacklist_timeout"       => self.blacklist_timeout       = val.parse().unwrap_or(BLACKLIST_TIMEOUT),
            "blacklist_threshold"     => self.blacklist_threshold     = val.parse().unwrap_or(BLACKLIST_THRESH),
            "blacklist_capacity"      => self.blacklist_capacity      = val.parse().unwrap_or(BLACKLIST_CAPACITY),
            "scan_backoff"            => self.scan_backoff            = val.parse().unwrap_or(SCAN_BACKOFF),
            "gpio_base"               => self.gpio_base               = PathBuf::from(&val),
            "gpio_reset_pin"          => self.gpio_reset_pin          = val.parse().ok(),
            "reset_low_ms"            => self.reset_low_ms            = val.parse().unwrap_or(RESET_LOW_MS),
            "reset_high_ms"           => self.reset_high_ms           = val.parse().unwrap_or(RESET_HIGH_MS),
            "boot_wait"               => self.boot_wait               = val.parse().unwrap_or(BOOT_WAIT),
            "reset_attempts"          => self.reset_attempts          = val.parse().unwrap_or(RESET_ATTEMPTS),
            "reset_cooldown"          => self.reset_cooldown          = val.parse().unwrap_or(RESET_COOLDOWN),
            "eth_iface"               => self.eth_iface               = val,
            "wifi_iface"              => self.wifi_iface              = val,
            "ping_target"             => self.ping_target             = val,
            "ping_count"              => self.ping_count              = val.parse().unwrap_or(PING_COUNT),
            "probe_interval"          => self.probe_interval          = val.parse().unwrap_or(PROBE_INTERVAL),
            "probe_deadline"          => self.probe_deadline          = val.parse().unwrap_or(PROBE_DEADLINE),
            "health_fail_threshold"   => self.health_fail_threshold   = val.parse().unwrap_or(HEALTH_THRESHOLD),
            "min_usable_score"        => self.min_usable_score        = val.parse().unwrap_or(MIN_USABLE_SCORE),
            "tick_ms"                 => self.tick_ms                 = val.parse().unwrap_or(TICK_MS),
            "ctl_socket"              => self.ctl_socket              = PathBuf::from(&val),
            "pid_file"                => self.pid_file                = PathBuf::from(&val),
            "log_syslog"              => self.log_syslog              = parse_bool(&val),
            _ => {} // ignore unknown keys
        }
    }
}

fn parse_bool(val: &str) -> bool {
    val == "true" || val == "1" || val == "yes"
}

/// All keys understood by [`NetdConfig::apply`], in UCI query order.
const KEYS: &[&str] = &[
    "at_device", "at_baud", "data_device", "at_timeout", "scan_timeout",
    "select_timeout", "register_timeout", "signal_settle_ms",
    "at_write_fail_threshold", "online_check_interval",
    "ppp_iface", "ppp_child", "ppp_command", "ip_timeout", "ppp_fail_threshold",
    "respawn_delay_ms", "supervisor_settle_ms", "verify_timeout", "verify_attempts",
    "blacklist_timeout", "blacklist_threshold", "blacklist_capacity", "scan_backoff",
    "gpio_base", "gpio_reset_pin", "reset_low_ms", "reset_high_ms", "boot_wait",
    "reset_attempts", "reset_cooldown",
    "eth_iface", "wifi_iface", "ping_target", "ping_count", "probe_interval",
    "probe_deadline", "health_fail_threshold", "min_usable_score",
    "tick_ms", "ctl_socket", "pid_file", "log_syslog",
];

/// Parse `content` in the `key = value` format.
pub fn parse_config(content: &str) -> NetdConfig {
    let mut cfg = NetdConfig::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, val)) = line.split_once('=') else { continue };
        let key = key.trim().to_ascii_lowercase();
        let val = val.trim().trim_matches('"').to_string();
        if val.is_empty() {
            continue;
        }
        cfg.apply(&key, val);
    }

    cfg
}

/// Read and parse the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<NetdConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| NetdError::Config(format!("cannot read {}: {e}", path.display())))?;
    Ok(parse_config(&content))
}

// ── UCI loader ────────────────────────────────────────────────────────────────

/// Query a single UCI option: `uci get netd.core.<key>`.
///
/// Returns `None` when the option is absent or the `uci` call fails.
fn uci_get_str(key: &str) -> Option<String> {
    let path = format!("netd.core.{key}");
    let out = std::process::Command::new("uci")
        .args(["get", &path])
        .output()
        .ok()?;
    if out.status.success() {
        let v = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if v.is_empty() { None } else { Some(v) }
    } else {
        None
    }
}

/// Load configuration from the UCI package `/etc/config/netd`.
///
/// All options live in the named section `netd.core`:
/// ```sh
/// uci set netd.core.at_device='/dev/ttyUSB2'
/// uci set netd.core.gpio_reset_pin='23'
/// uci commit netd
/// ```
pub fn load_config_uci() -> Result<NetdConfig> {
    let mut cfg = NetdConfig::default();
    for key in KEYS {
        if let Some(v) = uci_get_str(key) {
            cfg.apply(key, v);
        }
    }
    Ok(cfg)
}

/// Validate that required fields are populated and mutually consistent.
pub fn validate_config(cfg: &NetdConfig) -> Result<()> {
    if cfg.at_device.as_os_str().is_empty() {
        return Err(NetdError::Config("at_device is required".into()));
    }
    if cfg.data_device.as_os_str().is_empty() {
        return Err(NetdError::Config("data_device is required".into()));
    }
    if cfg.at_device == cfg.data_device {
        return Err(NetdError::Config(
            "at_device and data_device must be different ports".into()
        ));
    }
    if cfg.ppp_command.split_whitespace().next().is_none() {
        return Err(NetdError::Config("ppp_command is required".into()));
    }
    if cfg.tick_ms == 0 || cfg.tick_ms > 1000 {
        return Err(NetdError::Config("tick_ms must be within 1..=1000".into()));
    }
    if cfg.ping_count == 0 {
        return Err(NetdError::Config("ping_count must be at least 1".into()));
    }
    if cfg.health_fail_threshold == 0 {
        return Err(NetdError::Config("health_fail_threshold must be at least 1".into()));
    }
    if cfg.reset_attempts == 0 {
        return Err(NetdError::Config("reset_attempts must be at least 1".into()));
    }
    if cfg.min_usable_score > 10 {
        return Err(NetdError::Config("min_usable_score must be within 0..=10".into()));
    }
    Ok(())
}

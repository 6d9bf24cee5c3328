//! Miscellaneous utilities: interface state from sysfs, IPv4 lookup, routes,
//! PID file.

use std::fs;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

use log::warn;

// ── Interfaces ────────────────────────────────────────────────────────────────

/// Whether `/sys/class/net/<iface>` exists.
pub fn interface_exists(iface: &str) -> bool {
    Path::new(&format!("/sys/class/net/{iface}")).exists()
}

/// Read `/sys/class/net/<iface>/operstate` ("up", "down", "unknown", ...).
pub fn read_operstate(iface: &str) -> Option<String> {
    fs::read_to_string(format!("/sys/class/net/{iface}/operstate"))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Whether the interface reports carrier.  Reading `carrier` fails while the
/// interface is administratively down, which counts as no carrier.
pub fn has_carrier(iface: &str) -> bool {
    fs::read_to_string(format!("/sys/class/net/{iface}/carrier"))
        .map(|v| v.trim() == "1")
        .unwrap_or(false)
}

/// First IPv4 address assigned to `iface`.
pub fn interface_ipv4(iface: &str) -> Option<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifa in addrs {
        if ifa.interface_name != iface {
            continue;
        }
        if let Some(sin) = ifa.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            return Some(*SocketAddrV4::from(*sin).ip());
        }
    }
    None
}

// ── Routes ────────────────────────────────────────────────────────────────────

/// Parse `/proc/net/route` text and return the gateway of the first route on
/// `iface` that has one.
pub fn parse_route_gateway(content: &str, iface: &str) -> Option<Ipv4Addr> {
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // fields: Iface Destination Gateway Flags ...
        if fields.len() >= 3 && fields[0] == iface {
            if let Ok(hex) = u32::from_str_radix(fields[2], 16) {
                if hex != 0 {
                    let b = hex.to_le_bytes();
                    return Some(Ipv4Addr::new(b[0], b[1], b[2], b[3]));
                }
            }
        }
    }
    None
}

/// Gateway currently routed through `iface`, from `/proc/net/route`.
pub fn interface_gateway(iface: &str) -> Option<Ipv4Addr> {
    let content = fs::read_to_string("/proc/net/route").ok()?;
    parse_route_gateway(&content, iface)
}

/// Interface carrying the default route, from `/proc/net/route`.
pub fn default_route_iface() -> Option<String> {
    let content = fs::read_to_string("/proc/net/route").ok()?;
    content
        .lines()
        .skip(1)
        .map(|l| l.split_whitespace().collect::<Vec<_>>())
        .find(|f| f.len() >= 2 && f[1] == "00000000")
        .map(|f| f[0].to_string())
}

// ── PID file ──────────────────────────────────────────────────────────────────

/// Write the current process PID to `path`.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = fs::File::create(path)?;
    writeln!(f, "{}", std::process::id())?;
    Ok(())
}

/// Remove the PID file (best-effort, logs a warning on failure).
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("failed to remove PID file {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0101A8C0\t0003\t0\t0\t0\t00000000\t0\t0\t0
eth0\t0001A8C0\t00000000\t0001\t0\t0\t0\t00FFFFFF\t0\t0\t0
wlan0\t0000000A\t00000000\t0001\t0\t0\t0\t0000FFFF\t0\t0\t0
";

    #[test]
    fn gateway_for_interface() {
        assert_eq!(parse_route_gateway(ROUTES, "eth0"), Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(parse_route_gateway(ROUTES, "wlan0"), None);
        assert_eq!(parse_route_gateway(ROUTES, "ppp0"), None);
    }

    #[test]
    fn pid_file_round_trip() {
        let path = std::env::temp_dir().join(format!("gateway-netd-test-{}.pid", std::process::id()));
        write_pid_file(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
        remove_pid_file(&path);
        assert!(!path.exists());
    }
}

//! AT command protocol (3GPP TS 27.007 subset).
//!
//! Commands are CR-terminated text.  Responses are line oriented: zero or more
//! information lines followed by exactly one final result line (`OK`,
//! `ERROR`, `+CME ERROR: <n>`, ...).  This module only builds commands and
//! parses text; moving bytes is the job of [`crate::serial`].

use std::fmt;

// ── Commands ──────────────────────────────────────────────────────────────────

pub const ATTENTION:     &str = "AT";
pub const ECHO_OFF:      &str = "ATE0";
pub const VERBOSE_ERRORS: &str = "AT+CMEE=1";
/// Report operators in numeric (MCCMNC) format.
pub const NUMERIC_FORMAT: &str = "AT+COPS=3,2";
pub const REGISTRATION:  &str = "AT+CREG?";
pub const CURRENT_OPERATOR: &str = "AT+COPS?";
pub const LIST_OPERATORS: &str = "AT+COPS=?";
pub const SIGNAL_QUALITY: &str = "AT+CSQ";
pub const DEREGISTER:    &str = "AT+COPS=2";
pub const AUTO_SELECT:   &str = "AT+COPS=0";

/// Manual operator selection in numeric format, optionally pinned to an
/// access technology.
pub fn select_operator(mccmnc: &str, act: Option<u8>) -> String {
    match act {
        Some(act) => format!("AT+COPS=1,2,\"{mccmnc}\",{act}"),
        None      => format!("AT+COPS=1,2,\"{mccmnc}\""),
    }
}

// ── Final result ──────────────────────────────────────────────────────────────

/// The line that terminates a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalResult {
    Ok,
    Error,
    CmeError(String),
    CmsError(String),
    NoCarrier,
}

impl FinalResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, FinalResult::Ok)
    }
}

impl fmt::Display for FinalResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalResult::Ok          => f.write_str("OK"),
            FinalResult::Error       => f.write_str("ERROR"),
            FinalResult::CmeError(c) => write!(f, "+CME ERROR: {c}"),
            FinalResult::CmsError(c) => write!(f, "+CMS ERROR: {c}"),
            FinalResult::NoCarrier   => f.write_str("NO CARRIER"),
        }
    }
}

/// Recognise a final result line.
pub fn parse_final(line: &str) -> Option<FinalResult> {
    match line {
        "OK"         => Some(FinalResult::Ok),
        "ERROR"      => Some(FinalResult::Error),
        "NO CARRIER" => Some(FinalResult::NoCarrier),
        _ => {
            if let Some(code) = line.strip_prefix("+CME ERROR:") {
                Some(FinalResult::CmeError(code.trim().to_string()))
            } else {
                line.strip_prefix("+CMS ERROR:")
                    .map(|code| FinalResult::CmsError(code.trim().to_string()))
            }
        }
    }
}

// ── Response framing ──────────────────────────────────────────────────────────

/// A completed response: information lines plus the final result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtResponse {
    pub lines:  Vec<String>,
    pub result: FinalResult,
}

impl AtResponse {
    /// Payload of the first information line starting with `prefix`
    /// (e.g. `"+CSQ:"`), trimmed.
    pub fn info(&self, prefix: &str) -> Option<&str> {
        self.lines
            .iter()
            .find_map(|l| l.strip_prefix(prefix))
            .map(str::trim)
    }
}

/// Accumulates raw bytes and splits them into a response.
///
/// The echoed command (if echo is still on) and unsolicited blank lines are
/// dropped.
#[derive(Debug, Default)]
pub struct ResponseFramer {
    partial: Vec<u8>,
    lines:   Vec<String>,
    echo:    String,
}

impl ResponseFramer {
    pub fn new(command: &str) -> Self {
        Self { partial: Vec::new(), lines: Vec::new(), echo: command.to_string() }
    }

    /// Feed bytes; returns the response once the final line has arrived.
    pub fn push(&mut self, bytes: &[u8]) -> Option<AtResponse> {
        for &b in bytes {
            if b != b'\r' && b != b'\n' {
                self.partial.push(b);
                continue;
            }
            if self.partial.is_empty() {
                continue;
            }
            let line = String::from_utf8_lossy(&self.partial).trim().to_string();
            self.partial.clear();
            if line.is_empty() || line == self.echo {
                continue;
            }
            if let Some(result) = parse_final(&line) {
                return Some(AtResponse {
                    lines: std::mem::take(&mut self.lines),
                    result,
                });
            }
            self.lines.push(line);
        }
        None
    }
}

// ── +COPS ─────────────────────────────────────────────────────────────────────

/// One tuple of an `AT+COPS=?` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopsEntry {
    pub status:     u8,
    pub long_name:  String,
    pub short_name: String,
    pub numeric:    String,
    pub act:        Option<u8>,
}

/// Parse the payload of `+COPS: (...),(...),,(0-4),(0-2)`.
///
/// Tuples that are empty, carry no operator code, or whose status is not a
/// number are skipped; the trailing mode/format range lists fall out the same
/// way.
pub fn parse_cops_list(payload: &str) -> Vec<CopsEntry> {
    split_groups(payload)
        .into_iter()
        .filter_map(|group| {
            let fields = split_fields(&group);
            if fields.len() < 4 {
                return None;
            }
            let status: u8 = fields[0].parse().ok()?;
            if !fields[3].starts_with('"') {
                return None;
            }
            let numeric = unquote(&fields[3]);
            if !(5..=6).contains(&numeric.len()) || !numeric.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            Some(CopsEntry {
                status,
                long_name:  unquote(&fields[1]),
                short_name: unquote(&fields[2]),
                numeric,
                act: fields.get(4).and_then(|a| a.parse().ok()),
            })
        })
        .collect()
}

/// Current registration from `AT+COPS?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentOperator {
    pub mode:     u8,
    /// `None` while unregistered (`+COPS: 0`).
    pub operator: Option<String>,
    pub act:      Option<u8>,
}

pub fn parse_cops_current(payload: &str) -> Option<CurrentOperator> {
    let fields = split_fields(payload);
    let mode = fields.first()?.parse().ok()?;
    let operator = fields.get(2).map(|f| unquote(f)).filter(|s| !s.is_empty());
    let act = fields.get(3).and_then(|a| a.parse().ok());
    Some(CurrentOperator { mode, operator, act })
}

// ── +CSQ / +CREG ──────────────────────────────────────────────────────────────

/// Parse `+CSQ: <rssi>,<ber>` and return the RSSI index (0..=31, 99 unknown).
pub fn parse_csq(payload: &str) -> Option<u8> {
    let rssi: u8 = payload.split(',').next()?.trim().parse().ok()?;
    if rssi <= 31 || rssi == 99 { Some(rssi) } else { None }
}

/// Convert a CSQ index to dBm.  `99` (unknown) has no power level.
pub fn csq_to_dbm(csq: u8) -> Option<i32> {
    match csq {
        0..=31 => Some(-113 + 2 * i32::from(csq)),
        _      => None,
    }
}

/// `+CREG` registration status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    NotRegistered,
    Home,
    Searching,
    Denied,
    Unknown,
    Roaming,
}

impl Registration {
    pub fn is_registered(self) -> bool {
        matches!(self, Registration::Home | Registration::Roaming)
    }
}

/// Parse `+CREG: <n>,<stat>[,...]`.
pub fn parse_creg(payload: &str) -> Option<Registration> {
    let stat: u8 = payload.split(',').nth(1)?.trim().parse().ok()?;
    Some(match stat {
        0 => Registration::NotRegistered,
        1 => Registration::Home,
        2 => Registration::Searching,
        3 => Registration::Denied,
        5 => Registration::Roaming,
        _ => Registration::Unknown,
    })
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Split `(a,b),(c,d)` into the contents of each top-level parenthesised
/// group, honouring quoted strings.
fn split_groups(payload: &str) -> Vec<String> {
    let mut groups = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quoted = false;

    for c in payload.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                if depth > 0 { current.push(c); }
            }
            '(' if !quoted => {
                if depth > 0 { current.push(c); }
                depth += 1;
            }
            ')' if !quoted && depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    groups.push(std::mem::take(&mut current));
                } else {
                    current.push(c);
                }
            }
            _ if depth > 0 => current.push(c),
            _ => {}
        }
    }
    groups
}

/// Split on commas outside quotes; fields are trimmed but keep their quotes.
fn split_fields(s: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in s.chars() {
        match c {
            '"' => { quoted = !quoted; current.push(c); }
            ',' if !quoted => fields.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

fn unquote(s: &str) -> String {
    s.trim().trim_matches('"').to_string()
}

//! Carrier records gathered during one operator scan, and the selection rule.

use std::fmt;
use std::time::Instant;

use serde::Serialize;

use crate::at::{csq_to_dbm, CopsEntry};
use crate::blacklist::CarrierBlacklist;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Technology {
    Gsm,
    Umts,
    Lte,
    Nr5g,
    Unknown,
}

impl Technology {
    /// Map a 3GPP 27.007 access technology code.
    pub fn from_act(act: Option<u8>) -> Self {
        match act {
            Some(0 | 1 | 3)        => Technology::Gsm,
            Some(2 | 4 | 5 | 6)    => Technology::Umts,
            Some(7 | 8 | 9)        => Technology::Lte,
            Some(10 | 11 | 12 | 13) => Technology::Nr5g,
            _                      => Technology::Unknown,
        }
    }
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Technology::Gsm     => "GSM",
            Technology::Umts    => "UMTS",
            Technology::Lte     => "LTE",
            Technology::Nr5g    => "5G",
            Technology::Unknown => "?",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CarrierStatus {
    Unknown,
    Available,
    Current,
    Forbidden,
}

impl CarrierStatus {
    pub fn from_cops(stat: u8) -> Self {
        match stat {
            1 => CarrierStatus::Available,
            2 => CarrierStatus::Current,
            3 => CarrierStatus::Forbidden,
            _ => CarrierStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CarrierRecord {
    pub display_name: String,
    pub short_name:   String,
    pub mccmnc:       String,
    pub technology:   Technology,
    pub status:       CarrierStatus,
    /// Raw access technology code, passed back when selecting.
    pub act:          Option<u8>,
    pub signal_csq:   Option<u8>,
    pub rssi_dbm:     Option<i32>,
    pub tested:       bool,
}

impl From<CopsEntry> for CarrierRecord {
    fn from(e: CopsEntry) -> Self {
        Self {
            display_name: e.long_name,
            short_name:   e.short_name,
            mccmnc:       e.numeric,
            technology:   Technology::from_act(e.act),
            status:       CarrierStatus::from_cops(e.status),
            act:          e.act,
            signal_csq:   None,
            rssi_dbm:     None,
            tested:       false,
        }
    }
}

impl CarrierRecord {
    pub fn record_signal(&mut self, csq: Option<u8>) {
        self.signal_csq = csq;
        self.rssi_dbm = csq.and_then(csq_to_dbm);
        self.tested = true;
    }

    /// Label used in logs: `Name (mccmnc, tech)`.
    pub fn label(&self) -> String {
        let name = if self.display_name.is_empty() { &self.short_name } else { &self.display_name };
        format!("{name} ({}, {})", self.mccmnc, self.technology)
    }
}

/// Whether a carrier should get a signal test in this scan.
pub fn is_candidate(c: &CarrierRecord, blacklist: &CarrierBlacklist, now: Instant) -> bool {
    c.status != CarrierStatus::Forbidden && !blacklist.is_blacklisted(&c.mccmnc, now)
}

/// Index of the strongest tested candidate.  Equal signals keep the one
/// discovered first; unknown signal (CSQ 99) never wins.
pub fn select_best(carriers: &[CarrierRecord], blacklist: &CarrierBlacklist, now: Instant) -> Option<usize> {
    let mut best: Option<(usize, u8)> = None;
    for (i, c) in carriers.iter().enumerate() {
        if !c.tested || !is_candidate(c, blacklist, now) {
            continue;
        }
        let Some(csq) = c.signal_csq.filter(|&v| v <= 31) else { continue };
        if best.map_or(true, |(_, b)| csq > b) {
            best = Some((i, csq));
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::FailureReason;

    fn carrier(name: &str, mccmnc: &str, csq: Option<u8>) -> CarrierRecord {
        let mut c = CarrierRecord::from(CopsEntry {
            status:     1,
            long_name:  name.into(),
            short_name: name.into(),
            numeric:    mccmnc.into(),
            act:        Some(7),
        });
        c.record_signal(csq);
        c
    }

    #[test]
    fn first_of_equal_strength_wins() {
        let bl = CarrierBlacklist::new(8, 3, None);
        let list = vec![
            carrier("T-Mobile", "310260", Some(14)),
            carrier("Verizon",  "311480", Some(16)),
            carrier("AT&T",     "310410", Some(16)),
        ];
        assert_eq!(select_best(&list, &bl, Instant::now()), Some(1));
    }

    #[test]
    fn blacklisted_forbidden_and_unknown_signal_are_skipped() {
        let now = Instant::now();
        let mut bl = CarrierBlacklist::new(8, 1, None);
        bl.insert_or_update("311480", FailureReason::ProtocolError, now);
        let mut forbidden = carrier("Blocked", "310999", Some(30));
        forbidden.status = CarrierStatus::Forbidden;
        let list = vec![
            carrier("Verizon", "311480", Some(25)),
            forbidden,
            carrier("Mystery", "310150", Some(99)),
            carrier("AT&T", "310410", Some(5)),
        ];
        assert_eq!(select_best(&list, &bl, now), Some(3));
        assert!(!is_candidate(&list[0], &bl, now));
        assert!(!is_candidate(&list[1], &bl, now));
    }

    #[test]
    fn nothing_usable_selects_none() {
        let bl = CarrierBlacklist::new(8, 3, None);
        let mut untested = carrier("X", "310260", None);
        untested.tested = false;
        assert_eq!(select_best(&[untested], &bl, Instant::now()), None);
    }

    #[test]
    fn technology_and_dbm_mapping() {
        assert_eq!(Technology::from_act(Some(7)), Technology::Lte);
        assert_eq!(Technology::from_act(Some(2)), Technology::Umts);
        assert_eq!(Technology::from_act(None), Technology::Unknown);
        let c = carrier("X", "310260", Some(16));
        assert_eq!(c.rssi_dbm, Some(-81));
        assert_eq!(c.label(), "X (310260, LTE)");
    }
}

//! Carrier blacklist.
//!
//! Every qualifying failure against a carrier (identified by MCCMNC) is
//! recorded here.  A carrier is excluded from selection once its consecutive
//! failure count reaches the configured threshold.  Entries with a finite
//! lifetime stop counting as soon as they expire;
//! [`CarrierBlacklist::prune_expired`] only reclaims the slot.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use log::{info, warn};
use serde::Serialize;

/// Why a carrier failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The modem answered a connect/select with an explicit error.
    ProtocolError,
    /// The PPP session could not be established in time.
    SessionTimeout,
    /// Added by an operator through the diagnostic socket.
    Manual,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureReason::ProtocolError  => "protocol error",
            FailureReason::SessionTimeout => "session timeout",
            FailureReason::Manual         => "manual",
        })
    }
}

#[derive(Debug, Clone)]
pub struct BlacklistEntry {
    pub mccmnc:               String,
    pub reason:               FailureReason,
    pub created_at:           Instant,
    /// Wall-clock creation time, for diagnostics only.
    pub created_wall:         DateTime<Local>,
    /// `None` means permanent.
    pub timeout:              Option<Duration>,
    pub consecutive_failures: u32,
}

impl BlacklistEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.timeout {
            Some(t) => now.saturating_duration_since(self.created_at) >= t,
            None    => false,
        }
    }
}

/// Serializable view of one entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub mccmnc:               String,
    pub reason:               FailureReason,
    pub created:              String,
    pub permanent:            bool,
    pub remaining_secs:       Option<u64>,
    pub consecutive_failures: u32,
    pub blacklisted:          bool,
}

pub struct CarrierBlacklist {
    entries:   Vec<BlacklistEntry>,
    capacity:  usize,
    threshold: u32,
    ttl:       Option<Duration>,
}

impl CarrierBlacklist {
    /// `threshold` failures blacklist a carrier; `ttl` of `None` makes every
    /// entry permanent.
    pub fn new(capacity: usize, threshold: u32, ttl: Option<Duration>) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            threshold: threshold.max(1),
            ttl,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record a failure.  Increments the counter of a live entry, otherwise
    /// (re)creates it with a count of one.  Returns the new count.
    pub fn insert_or_update(&mut self, mccmnc: &str, reason: FailureReason, now: Instant) -> u32 {
        if let Some(e) = self.entries.iter_mut().find(|e| e.mccmnc == mccmnc) {
            if e.is_expired(now) {
                *e = Self::fresh(mccmnc, reason, self.ttl, now);
            } else {
                e.consecutive_failures = e.consecutive_failures.saturating_add(1);
                e.reason = reason;
            }
            let count = e.consecutive_failures;
            self.log_update(mccmnc, reason, count);
            return count;
        }

        if self.entries.len() >= self.capacity {
            self.evict(now);
        }
        self.entries.push(Self::fresh(mccmnc, reason, self.ttl, now));
        self.log_update(mccmnc, reason, 1);
        1
    }

    /// Blacklist a carrier immediately and permanently.
    pub fn insert_permanent(&mut self, mccmnc: &str, reason: FailureReason, now: Instant) {
        self.entries.retain(|e| e.mccmnc != mccmnc);
        if self.entries.len() >= self.capacity {
            self.evict(now);
        }
        let mut entry = Self::fresh(mccmnc, reason, None, now);
        entry.consecutive_failures = self.threshold;
        self.entries.push(entry);
        info!("blacklist: {mccmnc} added permanently ({reason})");
    }

    /// True only when an unexpired (or permanent) entry has reached the
    /// failure threshold.  Manual entries start at the threshold.
    pub fn is_blacklisted(&self, mccmnc: &str, now: Instant) -> bool {
        self.entries.iter().any(|e| {
            e.mccmnc == mccmnc && !e.is_expired(now) && e.consecutive_failures >= self.threshold
        })
    }

    /// Live failure count for `mccmnc` (0 if absent or expired).
    pub fn failures(&self, mccmnc: &str, now: Instant) -> u32 {
        self.entries
            .iter()
            .find(|e| e.mccmnc == mccmnc && !e.is_expired(now))
            .map_or(0, |e| e.consecutive_failures)
    }

    /// A session succeeded on `mccmnc`: forget failures that have not yet
    /// blacklisted it.  Effective entries are left alone.
    pub fn record_success(&mut self, mccmnc: &str, now: Instant) {
        let threshold = self.threshold;
        self.entries.retain(|e| {
            e.mccmnc != mccmnc || (!e.is_expired(now) && e.consecutive_failures >= threshold)
        });
    }

    /// Drop expired entries.  Returns how many were removed.
    pub fn prune_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !e.is_expired(now));
        let removed = before - self.entries.len();
        if removed > 0 {
            info!("blacklist: pruned {removed} expired entries");
        }
        removed
    }

    pub fn clear_all(&mut self) {
        if !self.entries.is_empty() {
            info!("blacklist: cleared {} entries", self.entries.len());
        }
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn snapshot(&self, now: Instant) -> Vec<EntrySnapshot> {
        self.entries
            .iter()
            .map(|e| EntrySnapshot {
                mccmnc:               e.mccmnc.clone(),
                reason:               e.reason,
                created:              e.created_wall.to_rfc3339(),
                permanent:            e.timeout.is_none(),
                remaining_secs:       e.timeout.map(|t| {
                    t.saturating_sub(now.saturating_duration_since(e.created_at)).as_secs()
                }),
                consecutive_failures: e.consecutive_failures,
                blacklisted:          self.is_blacklisted(&e.mccmnc, now),
            })
            .collect()
    }

    fn fresh(mccmnc: &str, reason: FailureReason, ttl: Option<Duration>, now: Instant) -> BlacklistEntry {
        BlacklistEntry {
            mccmnc:               mccmnc.to_string(),
            reason,
            created_at:           now,
            created_wall:         Local::now(),
            timeout:              ttl,
            consecutive_failures: 1,
        }
    }

    /// Make room: expired entries first, then the oldest non-permanent one.
    fn evict(&mut self, now: Instant) {
        if self.prune_expired(now) > 0 {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.timeout.is_some())
            .min_by_key(|(_, e)| e.created_at)
            .map(|(i, _)| i);
        match oldest {
            Some(i) => {
                let gone = self.entries.remove(i);
                warn!("blacklist full: evicted {}", gone.mccmnc);
            }
            None => {
                let gone = self.entries.remove(0);
                warn!("blacklist full of permanent entries: evicted {}", gone.mccmnc);
            }
        }
    }

    fn log_update(&self, mccmnc: &str, reason: FailureReason, count: u32) {
        if count >= self.threshold {
            warn!("blacklist: {mccmnc} blacklisted ({reason}, {count} consecutive failures)");
        } else {
            info!("blacklist: {mccmnc} failure {count}/{} ({reason})", self.threshold);
        }
    }
}

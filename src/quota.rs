//! Guest Quota Guard
//!
//! Unauthenticated callers (keyed by IP) get `limit` successful predictions
//! per window. Admission reserves a slot under the identity's map entry lock;
//! the slot only turns into a counted detection when the prediction succeeds
//! and the permit is committed. Dropping an uncommitted permit hands the slot
//! back, so failures never consume quota and concurrent requests can never
//! over-admit.
//!
//! Authenticated callers bypass the guard and never get a record.

use crate::config::QuotaConfig;
use crate::input::CallerIdentity;
use crate::metrics;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Time source, swappable for tests
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Virtual clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = add_window(*now, to_delta(by));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRecord {
    pub identity_key: String,
    pub count: u32,
    pub window_started_at: DateTime<Utc>,
    pub blocked: bool,
    pub blocked_at: Option<DateTime<Utc>>,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl QuotaRecord {
    fn fresh(identity_key: &str, now: DateTime<Utc>) -> Self {
        Self {
            identity_key: identity_key.to_string(),
            count: 0,
            window_started_at: now,
            blocked: false,
            blocked_at: None,
            last_request_at: None,
        }
    }

    fn reset(&mut self, now: DateTime<Utc>) {
        self.count = 0;
        self.window_started_at = now;
        self.blocked = false;
        self.blocked_at = None;
    }
}

#[derive(Debug)]
struct Slot {
    record: QuotaRecord,
    in_flight: u32,
}

/// Returned instead of a diagnosis when a guest is out of detections
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaExceeded {
    pub identity_key: String,
    pub reset_at: DateTime<Utc>,
}

pub enum Admission {
    /// Authenticated caller, no quota applies
    Bypass,
    Admitted(QuotaPermit),
    Blocked(QuotaExceeded),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Blocked(_))
    }
}

/// A reserved detection slot. Commit it after a successful prediction;
/// dropping it without committing releases the slot.
pub struct QuotaPermit {
    records: Arc<DashMap<String, Slot>>,
    identity_key: String,
    limit: u32,
    clock: Arc<dyn Clock>,
    settled: bool,
}

impl QuotaPermit {
    /// Count the detection. Returns the detections left in the window.
    pub fn commit(mut self) -> u32 {
        self.settled = true;
        let now = self.clock.now();
        match self.records.get_mut(&self.identity_key) {
            Some(mut slot) => {
                slot.in_flight = slot.in_flight.saturating_sub(1);
                slot.record.count += 1;
                slot.record.last_request_at = Some(now);
                let remaining = self.limit.saturating_sub(slot.record.count);
                debug!(
                    identity = %self.identity_key,
                    count = slot.record.count,
                    remaining,
                    "Guest detection counted"
                );
                remaining
            }
            None => {
                warn!(identity = %self.identity_key, "Quota record vanished before commit");
                self.limit.saturating_sub(1)
            }
        }
    }

    pub fn identity_key(&self) -> &str {
        &self.identity_key
    }
}

impl Drop for QuotaPermit {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(mut slot) = self.records.get_mut(&self.identity_key) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
            debug!(identity = %self.identity_key, "Guest detection slot released");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStats {
    pub tracked_identities: usize,
    pub blocked_identities: usize,
    pub rejections: u64,
}

pub struct QuotaGuard {
    limit: u32,
    window: TimeDelta,
    clock: Arc<dyn Clock>,
    records: Arc<DashMap<String, Slot>>,
    rejections: AtomicU64,
}

impl QuotaGuard {
    pub fn new(config: &QuotaConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit: config.limit,
            window: to_delta(config.reset_window),
            clock,
            records: Arc::new(DashMap::new()),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn admit(&self, caller: &CallerIdentity) -> Admission {
        if caller.is_authenticated {
            return Admission::Bypass;
        }

        let now = self.clock.now();
        let mut slot = self.records.entry(caller.ip.clone()).or_insert_with(|| {
            metrics::QUOTA_TRACKED_IDENTITIES.inc();
            Slot {
                record: QuotaRecord::fresh(&caller.ip, now),
                in_flight: 0,
            }
        });

        if now - slot.record.window_started_at >= self.window {
            debug!(identity = %caller.ip, "Guest quota window expired, resetting");
            slot.record.reset(now);
        }

        if slot.record.count + slot.in_flight >= self.limit {
            // Reservations alone reject without marking the record; they may
            // still be released
            if slot.record.count >= self.limit {
                slot.record.blocked = true;
                slot.record.blocked_at.get_or_insert(now);
            }
            let reset_at = add_window(slot.record.window_started_at, self.window);

            self.rejections.fetch_add(1, Ordering::Relaxed);
            metrics::QUOTA_REJECTIONS.inc();
            info!(
                identity = %caller.ip,
                count = slot.record.count,
                reset_at = %reset_at,
                "Guest detection limit reached"
            );

            return Admission::Blocked(QuotaExceeded {
                identity_key: caller.ip.clone(),
                reset_at,
            });
        }

        slot.in_flight += 1;
        Admission::Admitted(QuotaPermit {
            records: self.records.clone(),
            identity_key: caller.ip.clone(),
            limit: self.limit,
            clock: self.clock.clone(),
            settled: false,
        })
    }

    pub fn record(&self, identity_key: &str) -> Option<QuotaRecord> {
        self.records.get(identity_key).map(|slot| slot.record.clone())
    }

    /// Drop records whose window has lapsed and that have nothing in flight
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records
            .retain(|_, slot| slot.in_flight > 0 || now - slot.record.window_started_at < self.window);
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            metrics::QUOTA_TRACKED_IDENTITIES.sub(removed as i64);
            debug!(removed, "Pruned expired guest quota records");
        }
        removed
    }

    pub fn stats(&self) -> QuotaStats {
        QuotaStats {
            tracked_identities: self.records.len(),
            blocked_identities: self.records.iter().filter(|s| s.record.blocked).count(),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

fn add_window(start: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    start
        .checked_add_signed(window)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

//! Device registry
//!
//! Holds the monitored devices, their health and their next poll time.
//! The scheduler is the only writer of poll state; all mutation goes
//! through the locked methods below.

use crate::error::ErrorKind;
use crate::models::{Device, DeviceId, DeviceKind, HealthState, PollOutcome, PollStatus, MIN_POLL_INTERVAL};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Backoff policy applied on failed polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Upper bound for any backed-off interval
    pub max_interval: Duration,
    /// Consecutive failures after which a device is marked unreachable
    pub failure_threshold: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_interval: Duration::from_secs(300),
            failure_threshold: 3,
        }
    }
}

impl BackoffPolicy {
    /// `min(max_interval, base * 2^failures)`, saturating on overflow
    pub fn interval_after(&self, base: Duration, failures: u32) -> Duration {
        let max = self.max_interval.max(MIN_POLL_INTERVAL);
        2u32.checked_pow(failures)
            .and_then(|factor| base.checked_mul(factor))
            .map_or(max, |interval| interval.min(max))
    }
}

/// Whether a poll is currently in flight for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollState {
    Idle,
    Polling,
}

#[derive(Debug, Clone)]
struct DeviceEntry {
    device: Device,
    active: bool,
    health: HealthState,
    poll_state: PollState,
    consecutive_failures: u32,
    current_interval: Duration,
    next_poll_time: DateTime<Utc>,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<ErrorKind>,
}

impl DeviceEntry {
    fn new(device: Device, now: DateTime<Utc>) -> Self {
        let current_interval = device.poll_interval;
        Self {
            device,
            active: true,
            health: HealthState::Unknown,
            poll_state: PollState::Idle,
            consecutive_failures: 0,
            current_interval,
            next_poll_time: now,
            last_success: None,
            last_error: None,
        }
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus {
            id: self.device.id.clone(),
            address: self.device.address,
            kind: self.device.kind,
            active: self.active,
            health: self.health,
            poll_state: self.poll_state,
            consecutive_failures: self.consecutive_failures,
            interval_secs: self.current_interval.as_secs(),
            next_poll_time: self.next_poll_time,
            last_success: self.last_success,
            last_error: self.last_error,
        }
    }
}

/// Point-in-time view of one device, for health/status collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub id: DeviceId,
    pub address: IpAddr,
    pub kind: DeviceKind,
    pub active: bool,
    pub health: HealthState,
    pub poll_state: PollState,
    pub consecutive_failures: u32,
    pub interval_secs: u64,
    pub next_poll_time: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorKind>,
}

/// Health change produced by [`DeviceRegistry::record_outcome`]
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeApplied {
    pub previous: HealthState,
    pub current: HealthState,
    pub next_interval: Duration,
    pub consecutive_failures: u32,
}

impl OutcomeApplied {
    pub fn health_changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Registry of monitored devices
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<DeviceId, DeviceEntry>>>,
    policy: BackoffPolicy,
}

impl DeviceRegistry {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            policy,
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Add a device, due immediately. Re-adding an existing id updates its
    /// parameters and reactivates it without resetting health.
    /// Returns true if the device was not known before.
    pub async fn add(&self, device: Device, now: DateTime<Utc>) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get_mut(&device.id) {
            Some(entry) => {
                if !entry.active {
                    debug!(device_id = %device.id, "Reactivating device");
                    entry.active = true;
                    entry.next_poll_time = now;
                }
                if entry.device.poll_interval != device.poll_interval
                    && entry.consecutive_failures == 0
                {
                    entry.current_interval = device.poll_interval;
                }
                entry.device = device;
                false
            }
            None => {
                debug!(device_id = %device.id, address = %device.address, "Registering device");
                devices.insert(device.id.clone(), DeviceEntry::new(device, now));
                true
            }
        }
    }

    /// Soft-remove a device. It stops being scheduled but its entry is kept
    /// so an in-flight poll can still report. Returns true if it was active.
    pub async fn deactivate(&self, id: &DeviceId) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get_mut(id) {
            Some(entry) if entry.active => {
                debug!(device_id = %id, "Deactivating device");
                entry.active = false;
                true
            }
            _ => false,
        }
    }

    /// Reconcile with a full device list: add or update listed devices,
    /// deactivate the ones no longer present.
    pub async fn sync(&self, devices: Vec<Device>, now: DateTime<Utc>) {
        let listed: HashSet<DeviceId> = devices.iter().map(|d| d.id.clone()).collect();
        let mut added = 0usize;
        for device in devices {
            if self.add(device, now).await {
                added += 1;
            }
        }

        let stale: Vec<DeviceId> = {
            let devices = self.devices.read().await;
            devices
                .iter()
                .filter(|(id, entry)| entry.active && !listed.contains(*id))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &stale {
            self.deactivate(id).await;
        }

        info!(added, deactivated = stale.len(), "Device registry synced");
    }

    /// Active devices whose next poll time is at or before `now`, ordered by
    /// next poll time then id.
    pub async fn list_due(&self, now: DateTime<Utc>) -> Vec<Device> {
        let mut due: Vec<(DateTime<Utc>, Device)> = {
            let devices = self.devices.read().await;
            devices
                .values()
                .filter(|entry| entry.active && entry.next_poll_time <= now)
                .map(|entry| (entry.next_poll_time, entry.device.clone()))
                .collect()
        };

        due.sort_by(|(a_time, a), (b_time, b)| a_time.cmp(b_time).then_with(|| a.id.cmp(&b.id)));
        due.into_iter().map(|(_, device)| device).collect()
    }

    /// Move a device from `Idle` to `Polling`. Returns `None` if it is
    /// unknown, inactive, or already has a poll in flight.
    pub async fn begin_poll(&self, id: &DeviceId) -> Option<Device> {
        let mut devices = self.devices.write().await;
        let entry = devices.get_mut(id)?;
        if !entry.active || entry.poll_state == PollState::Polling {
            return None;
        }
        entry.poll_state = PollState::Polling;
        Some(entry.device.clone())
    }

    /// Apply a poll outcome: update health, backoff and the next poll time,
    /// and return the device to `Idle`.
    pub async fn record_outcome(
        &self,
        outcome: &PollOutcome,
        now: DateTime<Utc>,
    ) -> Option<OutcomeApplied> {
        let mut devices = self.devices.write().await;
        let entry = devices.get_mut(&outcome.device_id)?;
        let previous = entry.health;
        let base = entry.device.poll_interval;

        match outcome.status {
            PollStatus::Success { .. } => {
                entry.consecutive_failures = 0;
                entry.current_interval = base;
                entry.health = HealthState::Healthy;
                entry.last_success = Some(now);
                entry.last_error = None;
            }
            PollStatus::Failed(ErrorKind::AuthError) => {
                // Credentials will not fix themselves; park at the max interval.
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                entry.current_interval = self.policy.max_interval.max(base);
                entry.health = HealthState::Unreachable;
                entry.last_error = Some(ErrorKind::AuthError);
            }
            PollStatus::Failed(kind) => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                entry.current_interval = self
                    .policy
                    .interval_after(base, entry.consecutive_failures);
                entry.health = if entry.consecutive_failures >= self.policy.failure_threshold {
                    HealthState::Unreachable
                } else {
                    HealthState::Degraded
                };
                entry.last_error = Some(kind);
            }
        }

        entry.poll_state = PollState::Idle;
        entry.next_poll_time = now
            + chrono::Duration::from_std(entry.current_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));

        Some(OutcomeApplied {
            previous,
            current: entry.health,
            next_interval: entry.current_interval,
            consecutive_failures: entry.consecutive_failures,
        })
    }

    /// Status of a single device
    pub async fn status(&self, id: &DeviceId) -> Option<DeviceStatus> {
        self.devices.read().await.get(id).map(DeviceEntry::status)
    }

    /// Status of every known device, ordered by id
    pub async fn snapshot(&self) -> Vec<DeviceStatus> {
        let mut statuses: Vec<DeviceStatus> = self
            .devices
            .read()
            .await
            .values()
            .map(DeviceEntry::status)
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Number of active devices per health state
    pub async fn health_counts(&self) -> HashMap<HealthState, usize> {
        let devices = self.devices.read().await;
        let mut counts: HashMap<HealthState, usize> =
            HealthState::ALL.iter().map(|state| (*state, 0)).collect();
        for entry in devices.values().filter(|entry| entry.active) {
            *counts.entry(entry.health).or_default() += 1;
        }
        counts
    }

    /// Number of polls currently in flight
    pub async fn in_flight(&self) -> usize {
        self.devices
            .read()
            .await
            .values()
            .filter(|entry| entry.poll_state == PollState::Polling)
            .count()
    }

    /// Earliest next poll time among active devices
    pub async fn next_due(&self) -> Option<DateTime<Utc>> {
        self.devices
            .read()
            .await
            .values()
            .filter(|entry| entry.active)
            .map(|entry| entry.next_poll_time)
            .min()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::net::Ipv4Addr;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn device(id: &str, secs: u64) -> Device {
        Device::new(id, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), DeviceKind::Router)
            .with_interval(Duration::from_secs(secs))
    }

    fn failed(id: &str, kind: ErrorKind) -> PollOutcome {
        PollOutcome::failed(DeviceId::from(id), Duration::from_millis(5), kind)
    }

    #[test]
    fn test_backoff_interval_formula() {
        let policy = BackoffPolicy {
            max_interval: Duration::from_secs(300),
            failure_threshold: 3,
        };
        let base = Duration::from_secs(5);
        assert_eq!(policy.interval_after(base, 0), Duration::from_secs(5));
        assert_eq!(policy.interval_after(base, 1), Duration::from_secs(10));
        assert_eq!(policy.interval_after(base, 3), Duration::from_secs(40));
        assert_eq!(policy.interval_after(base, 7), Duration::from_secs(300));
        assert_eq!(policy.interval_after(base, 200), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_list_due_orders_by_time_then_id() {
        let registry = DeviceRegistry::default();
        registry.add(device("b", 5), t0()).await;
        registry.add(device("a", 5), t0()).await;
        registry
            .add(device("c", 5), t0() - chrono::Duration::seconds(1))
            .await;
        registry
            .add(device("later", 5), t0() + chrono::Duration::seconds(10))
            .await;

        let due: Vec<String> = registry
            .list_due(t0())
            .await
            .into_iter()
            .map(|d| d.id.to_string())
            .collect();
        assert_eq!(due, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_add_and_deactivate_are_idempotent() {
        let registry = DeviceRegistry::default();
        assert!(registry.add(device("r1", 5), t0()).await);
        assert!(!registry.add(device("r1", 5), t0()).await);
        assert_eq!(registry.len().await, 1);

        assert!(registry.deactivate(&"r1".into()).await);
        assert!(!registry.deactivate(&"r1".into()).await);
        assert!(registry.list_due(t0()).await.is_empty());
        // Soft removal keeps the entry.
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_begin_poll_rejects_overlap() {
        let registry = DeviceRegistry::default();
        registry.add(device("r1", 5), t0()).await;

        assert!(registry.begin_poll(&"r1".into()).await.is_some());
        assert!(registry.begin_poll(&"r1".into()).await.is_none());
        assert_eq!(registry.in_flight().await, 1);

        registry
            .record_outcome(
                &PollOutcome::success("r1".into(), Duration::from_millis(3), 4),
                t0(),
            )
            .await;
        assert_eq!(registry.in_flight().await, 0);
        assert!(registry.begin_poll(&"r1".into()).await.is_some());
    }

    #[tokio::test]
    async fn test_three_timeouts_escalate_to_unreachable() {
        let registry = DeviceRegistry::default();
        registry.add(device("R1", 5), t0()).await;

        let mut healths = Vec::new();
        let mut intervals = Vec::new();
        for _ in 0..3 {
            registry.begin_poll(&"R1".into()).await;
            let applied = registry
                .record_outcome(&failed("R1", ErrorKind::Timeout), t0())
                .await
                .unwrap();
            healths.push(applied.current);
            intervals.push(applied.next_interval.as_secs());
        }

        assert_eq!(
            healths,
            vec![
                HealthState::Degraded,
                HealthState::Degraded,
                HealthState::Unreachable
            ]
        );
        assert_eq!(intervals, vec![10, 20, 40]);

        let status = registry.status(&"R1".into()).await.unwrap();
        assert_eq!(status.next_poll_time, t0() + chrono::Duration::seconds(40));
        assert_eq!(status.last_error, Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_success_resets_backoff() {
        let registry = DeviceRegistry::default();
        registry.add(device("r1", 5), t0()).await;
        for _ in 0..4 {
            registry
                .record_outcome(&failed("r1", ErrorKind::Unreachable), t0())
                .await;
        }

        let applied = registry
            .record_outcome(
                &PollOutcome::success("r1".into(), Duration::from_millis(3), 2),
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(applied.previous, HealthState::Unreachable);
        assert_eq!(applied.current, HealthState::Healthy);
        assert_eq!(applied.next_interval, Duration::from_secs(5));
        assert_eq!(applied.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_unreachable_device_stays_scheduled_at_max() {
        let registry = DeviceRegistry::default();
        registry.add(device("r1", 5), t0()).await;
        let mut last = None;
        for _ in 0..20 {
            last = registry
                .record_outcome(&failed("r1", ErrorKind::Timeout), t0())
                .await;
        }
        let last = last.unwrap();
        assert_eq!(last.current, HealthState::Unreachable);
        assert_eq!(last.next_interval, Duration::from_secs(300));
        assert_eq!(
            registry.list_due(t0() + chrono::Duration::seconds(300)).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_auth_error_escalates_immediately() {
        let registry = DeviceRegistry::default();
        registry.add(device("r1", 5), t0()).await;

        let applied = registry
            .record_outcome(&failed("r1", ErrorKind::AuthError), t0())
            .await
            .unwrap();
        assert_eq!(applied.current, HealthState::Unreachable);
        assert_eq!(applied.next_interval, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_sync_deactivates_missing_devices() {
        let registry = DeviceRegistry::default();
        registry.add(device("r1", 5), t0()).await;
        registry.add(device("r2", 5), t0()).await;

        registry.sync(vec![device("r2", 5), device("r3", 5)], t0()).await;

        let snapshot = registry.snapshot().await;
        let active: Vec<(&str, bool)> = snapshot
            .iter()
            .map(|s| (s.id.as_str(), s.active))
            .collect();
        assert_eq!(active, vec![("r1", false), ("r2", true), ("r3", true)]);
    }

    #[tokio::test]
    async fn test_health_counts() {
        let registry = DeviceRegistry::default();
        registry.add(device("r1", 5), t0()).await;
        registry.add(device("r2", 5), t0()).await;
        registry
            .record_outcome(&failed("r2", ErrorKind::AuthError), t0())
            .await;

        let counts = registry.health_counts().await;
        assert_eq!(counts[&HealthState::Unknown], 1);
        assert_eq!(counts[&HealthState::Unreachable], 1);
        assert_eq!(counts[&HealthState::Healthy], 0);
    }
}

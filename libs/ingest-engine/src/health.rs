use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum Health {
    Healthy,
    /// The process can no longer make progress and should be restarted.
    Fatal(String),
}

/// Liveness tracking.
///
/// The store is considered gone for good once every commit has failed for
/// longer than `give_up_after`. Any successful commit resets the clock.
#[derive(Debug)]
pub struct HealthMonitor {
    tx: watch::Sender<Health>,
    unavailable_since: Mutex<Option<Instant>>,
    give_up_after: Duration,
}

impl HealthMonitor {
    pub fn new(give_up_after: Duration) -> Self {
        let (tx, _) = watch::channel(Health::Healthy);
        Self {
            tx,
            unavailable_since: Mutex::new(None),
            give_up_after,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Health> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Health {
        self.tx.borrow().clone()
    }

    pub fn record_store_success(&self) {
        *self.unavailable_since.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn record_store_failure(&self, now: Instant) {
        let since = {
            let mut guard = self.unavailable_since.lock().unwrap_or_else(|p| p.into_inner());
            *guard.get_or_insert(now)
        };
        let down_for = now.saturating_duration_since(since);
        if down_for >= self.give_up_after {
            self.set_fatal(format!(
                "analytical store unavailable for {}s (limit {}s)",
                down_for.as_secs(),
                self.give_up_after.as_secs()
            ));
        }
    }

    pub fn set_fatal(&self, reason: String) {
        self.tx.send_if_modified(|health| {
            if matches!(health, Health::Fatal(_)) {
                return false;
            }
            tracing::error!(%reason, "pipeline is no longer live");
            *health = Health::Fatal(reason);
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_after_continuous_failure() {
        let monitor = HealthMonitor::new(Duration::from_secs(60));
        let rx = monitor.subscribe();
        let t0 = Instant::now();

        monitor.record_store_failure(t0);
        monitor.record_store_failure(t0 + Duration::from_secs(59));
        assert_eq!(monitor.current(), Health::Healthy);

        monitor.record_store_failure(t0 + Duration::from_secs(60));
        assert!(matches!(&*rx.borrow(), Health::Fatal(r) if r.contains("60s")));
    }

    #[test]
    fn success_resets_the_clock() {
        let monitor = HealthMonitor::new(Duration::from_secs(60));
        let t0 = Instant::now();
        monitor.record_store_failure(t0);
        monitor.record_store_success();
        monitor.record_store_failure(t0 + Duration::from_secs(90));
        assert_eq!(monitor.current(), Health::Healthy);
    }

    #[test]
    fn serializes_for_health_endpoint() {
        let json = serde_json::to_value(Health::Fatal("store down".into())).unwrap();
        assert_eq!(json, serde_json::json!({"status": "fatal", "reason": "store down"}));
        let json = serde_json::to_value(Health::Healthy).unwrap();
        assert_eq!(json, serde_json::json!({"status": "healthy"}));
    }
}

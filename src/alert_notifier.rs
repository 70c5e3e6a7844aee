use crate::email_client::EmailClient;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const ALERT_THROTTLE: Duration = Duration::from_secs(15 * 60);

static ALERT_NOTIFIER: Lazy<AlertNotifier> = Lazy::new(AlertNotifier::new);

/// Mails a critical alert from a background thread. Repeats of the same key within the
/// throttle window are only logged.
pub fn notify_critical(key: &str, detail: &str) {
    ALERT_NOTIFIER.notify(key, detail);
}

struct AlertNotifier {
    pair_name: String,
    throttle: Throttle,
}

impl AlertNotifier {
    fn new() -> Self {
        let pair_name = match (std::env::var("INSTRUMENT_A"), std::env::var("INSTRUMENT_B")) {
            (Ok(a), Ok(b)) => format!("{}/{}", a, b),
            _ => String::new(),
        };
        Self {
            pair_name,
            throttle: Throttle::new(ALERT_THROTTLE),
        }
    }

    fn notify(&self, key: &str, detail: &str) {
        if !self.throttle.allow(key, Instant::now()) {
            log::debug!("[ALERT] '{}' throttled: {}", key, detail);
            return;
        }
        let subject = if self.pair_name.is_empty() {
            format!("[GridTrade] CRITICAL - {}", key)
        } else {
            format!("[{}] CRITICAL - {}", self.pair_name, key)
        };
        let body = format!("Critical grid incident '{}'.\nDetail: {}", key, detail);

        let spawned = std::thread::Builder::new()
            .name("alert-mail".to_string())
            .spawn(move || EmailClient::new().send(&subject, &body));
        match spawned {
            Ok(_) => log::warn!("📧 [ALERT] notification queued for '{}' ({})", key, detail),
            Err(e) => log::error!("[ALERT] failed to spawn mail thread for '{}': {}", key, e),
        }
    }
}

struct Throttle {
    window: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl Throttle {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    fn allow(&self, key: &str, now: Instant) -> bool {
        let mut last_sent = self
            .last_sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match last_sent.get(key) {
            Some(prev) if now.saturating_duration_since(*prev) < self.window => false,
            _ => {
                last_sent.insert(key.to_string(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttles_per_key() {
        let throttle = Throttle::new(Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(throttle.allow("drift", t0));
        assert!(!throttle.allow("drift", t0 + Duration::from_secs(30)));
        assert!(throttle.allow("imbalance", t0 + Duration::from_secs(30)));
        assert!(throttle.allow("drift", t0 + Duration::from_secs(60)));
    }
}
